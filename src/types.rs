//! gonk-netd - Core data structures
//!
//! Request parameters, result payloads, network types and the runtime configuration
//! shared by the orchestrator, the worker and the CLI.

use crate::command::NetworkCommand;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// netd's fixed id for the local (tethering) network
pub const LOCAL_NET_ID: i32 = 99;

/// Firewall mark applied to wake-up packets on Wi-Fi interfaces
pub const WAKEUP_PACKET_MARK: u32 = 0x8000_0000;
pub const WAKEUP_PACKET_MASK: u32 = 0x8000_0000;

/// Requester name used for the global IP forwarding reference
pub const TETHERING_REQUESTER: &str = "tethering";

/// Link-local route added next to the tethered IPv6 prefix
pub const IPV6_LINK_LOCAL_ROUTE: &str = "fe80::/64";

/// Consumer category of a network, as reported by the connectivity layer.
///
/// Each category owns one bit in a [`NetIdInfo`](crate::NetIdInfo) type mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkType(pub i32);

impl NetworkType {
    pub const UNKNOWN: NetworkType = NetworkType(-1);
    pub const WIFI: NetworkType = NetworkType(0);
    pub const MOBILE: NetworkType = NetworkType(1);
    pub const MOBILE_MMS: NetworkType = NetworkType(2);
    pub const MOBILE_SUPL: NetworkType = NetworkType(3);
    pub const WIFI_P2P: NetworkType = NetworkType(4);
    pub const MOBILE_IMS: NetworkType = NetworkType(5);
    pub const MOBILE_DUN: NetworkType = NetworkType(6);
    pub const MOBILE_FOTA: NetworkType = NetworkType(7);
    pub const ETHERNET: NetworkType = NetworkType(8);

    /// Bit held in the type mask, `None` for types outside 0..32
    pub fn bit(self) -> Option<u32> {
        if (0..32).contains(&self.0) {
            Some(1u32 << self.0)
        } else {
            None
        }
    }
}

impl Default for NetworkType {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters of one network command.
///
/// Decoded from the caller's option dictionary, then mutated in place while the
/// owning chain runs (`net_id`, `ipv6_prefix`, `loop_index`, ...).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkParams {
    #[serde(default)]
    pub id: i64,
    pub cmd: NetworkCommand,

    #[serde(default, deserialize_with = "nullable_string")]
    pub ifname: String,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default, deserialize_with = "nullable_string")]
    pub ip: String,
    #[serde(default)]
    pub prefix_length: u32,
    #[serde(default, deserialize_with = "nullable_string")]
    pub prefix: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub link: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub gateway: String,
    #[serde(default, deserialize_with = "nullable_list")]
    pub gateways: Vec<String>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub domain: String,
    #[serde(default, deserialize_with = "nullable_list")]
    pub dnses: Vec<String>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub dns1: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub dns2: String,
    #[serde(default)]
    pub mtu: i32,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub enabled: bool,

    // Tethering
    #[serde(default, deserialize_with = "nullable_string")]
    pub internal_ifname: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub external_ifname: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub pre_internal_ifname: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub pre_external_ifname: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub cur_internal_ifname: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub cur_external_ifname: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub wifi_start_ip: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub wifi_end_ip: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub usb_start_ip: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub usb_end_ip: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub wifictrlinterfacename: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub ssid: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub security: String,
    #[serde(default, rename = "type", deserialize_with = "nullable_string")]
    pub kind: String,

    // Alarms, buffers, IPv6
    #[serde(default = "unset_i64")]
    pub threshold: i64,
    #[serde(default, deserialize_with = "nullable_string")]
    pub tcp_buffer_sizes: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub ipv6_ip: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub nat64_prefix: String,
    #[serde(default = "unset_i32")]
    pub net_id: i32,

    /// `/64` prefix derived from `ipv6_ip`
    #[serde(skip)]
    pub ipv6_prefix: String,
    /// Local-network routes installed for IPv6 tethering
    #[serde(skip)]
    pub ipv6_routes: Vec<String>,
    /// Cursor of multi-gateway/multi-route steps, reset before each loop
    #[serde(skip)]
    pub loop_index: usize,
}

fn unset_i32() -> i32 {
    -1
}

fn unset_i64() -> i64 {
    -1
}

/// Strings sent as JSON `null` or the literal `"null"` decode as empty.
fn nullable_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(s) if s != "null" => s,
        _ => String::new(),
    })
}

fn nullable_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

impl NetworkParams {
    /// Decode an option dictionary
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Fresh parameters for `cmd` with every optional field unset
    pub fn new(cmd: NetworkCommand) -> Self {
        Self {
            id: 0,
            cmd,
            ifname: String::new(),
            network_type: NetworkType::UNKNOWN,
            ip: String::new(),
            prefix_length: 0,
            prefix: String::new(),
            link: String::new(),
            gateway: String::new(),
            gateways: Vec::new(),
            domain: String::new(),
            dnses: Vec::new(),
            dns1: String::new(),
            dns2: String::new(),
            mtu: 0,
            enable: false,
            enabled: false,
            internal_ifname: String::new(),
            external_ifname: String::new(),
            pre_internal_ifname: String::new(),
            pre_external_ifname: String::new(),
            cur_internal_ifname: String::new(),
            cur_external_ifname: String::new(),
            wifi_start_ip: String::new(),
            wifi_end_ip: String::new(),
            usb_start_ip: String::new(),
            usb_end_ip: String::new(),
            wifictrlinterfacename: String::new(),
            ssid: String::new(),
            security: String::new(),
            kind: String::new(),
            threshold: -1,
            tcp_buffer_sizes: String::new(),
            ipv6_ip: String::new(),
            nat64_prefix: String::new(),
            net_id: -1,
            ipv6_prefix: String::new(),
            ipv6_routes: Vec::new(),
            loop_index: 0,
        }
    }
}

/// Per-interface tethering traffic counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TetherStats {
    pub ifname: String,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
}

/// DHCP lease payload of a `dhcpRequest` result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhcpLeaseResult {
    pub ipaddr_str: String,
    pub gateway_str: String,
    pub dns1_str: String,
    pub dns2_str: String,
    pub server_str: String,
    pub vendor_str: String,
    pub mask_str: String,
    pub lease: u32,
    pub prefix_length: u32,
    /// IPv4 values in network byte order, as the caller expects them
    pub mask: u32,
    pub ipaddr: u32,
    pub gateway: u32,
    pub dns1: u32,
    pub dns2: u32,
    pub server: u32,
}

/// Outcome of one command, or one unsolicited broadcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResultOptions {
    pub id: i64,
    pub ret: bool,
    pub result: bool,
    pub error: bool,
    pub broadcast: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur_external_ifname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur_internal_ifname: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clatd_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tether_stats: Option<Vec<TetherStats>>,
    #[serde(flatten)]
    pub dhcp: Option<DhcpLeaseResult>,
}

impl NetworkResultOptions {
    /// Unsolicited broadcast with a topic and reason string
    pub fn broadcast(topic: &str, reason: String) -> Self {
        Self {
            broadcast: true,
            topic: Some(topic.to_string()),
            reason,
            ..Default::default()
        }
    }

    /// Plain `result` flag outcome of an immediate command
    pub fn with_result(result: bool) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }
}

/// DNS resolver tuning applied by `setDNS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverDefaults {
    pub sample_validity_secs: u32,
    pub success_threshold_percent: u32,
    pub min_samples: u32,
    pub max_samples: u32,
    pub base_timeout_ms: u32,
    pub retry_count: u32,
}

impl Default for ResolverDefaults {
    fn default() -> Self {
        Self {
            sample_validity_secs: 1800,
            success_threshold_percent: 25,
            min_samples: 8,
            max_samples: 64,
            base_timeout_ms: 0,
            retry_count: 3,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Dump request parameters at info level
    pub debug: bool,

    /// Address generation mode handed to netd when enabling IPv6
    pub ipv6_addr_gen_mode: i32,

    pub radvd_conf_path: PathBuf,

    /// uid/gid the radvd config is chowned to
    pub radvd_conf_owner: Option<u32>,

    /// Placeholder upstream that never gets interface forwarding or tether stats
    pub dummy_upstream_ifname: String,

    /// Upstream for which IPv6 tethering is never enabled
    pub ipv6_tethering_excluded_upstream: String,

    pub min_net_id: i32,
    pub max_net_id: i32,

    pub netd_connect_retry_ms: u64,

    /// 0 retries forever
    pub netd_connect_max_attempts: u32,

    pub resolver: ResolverDefaults,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            debug: false,
            ipv6_addr_gen_mode: 0,
            radvd_conf_path: PathBuf::from("/data/misc/radvd/radvd.conf"),
            radvd_conf_owner: None,
            dummy_upstream_ifname: "rmnet0".to_string(),
            ipv6_tethering_excluded_upstream: "wlan0".to_string(),
            min_net_id: 100,
            max_net_id: 65535,
            netd_connect_retry_ms: 1000,
            netd_connect_max_attempts: 0,
            resolver: ResolverDefaults::default(),
        }
    }
}

impl NetworkConfig {
    /// Parse a TOML document, missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}
