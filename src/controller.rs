//! Privileged controller interfaces
//!
//! The orchestrator never configures the kernel itself. Every operation goes through
//! one of these traits: the netd service, the DNS resolver, the DHCP client or the
//! system property store. Production backends speak binder;
//! [`SimulatedNetd`](crate::SimulatedNetd) implements all four in memory.

use crate::error::NetdError;
use async_trait::async_trait;
use std::sync::Arc;

pub type NetdResult<T> = Result<T, NetdError>;

/// Interface flag strings understood by netd
pub const IF_STATE_UP: &str = "up";
pub const IF_STATE_DOWN: &str = "down";

/// Permission for networks created by the orchestrator
pub const PERMISSION_NONE: i32 = 0;

/// Interface configuration as read from and written to netd
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfiguration {
    pub ifname: String,
    pub hw_addr: String,
    pub ipv4_addr: String,
    pub prefix_length: u32,
    pub flags: Vec<String>,
}

impl InterfaceConfiguration {
    pub fn is_up(&self) -> bool {
        self.flags.iter().any(|f| f == IF_STATE_UP)
    }
}

/// Per-upstream tethering counters as reported by netd
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TetherStatsParcel {
    pub iface: String,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
}

/// Resolver configuration for one network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverParams {
    pub net_id: i32,
    pub sample_validity_secs: u32,
    pub success_threshold: u32,
    pub min_samples: u32,
    pub max_samples: u32,
    pub base_timeout_ms: u32,
    pub retry_count: u32,
    pub servers: Vec<String>,
    pub domains: Vec<String>,
    pub tls_name: String,
    pub tls_servers: Vec<String>,
}

/// Lease obtained by the DHCP client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpLease {
    pub ipaddr: String,
    pub gateway: String,
    pub prefix_length: u32,
    pub dns1: String,
    pub dns2: String,
    pub server: String,
    pub lease_secs: u32,
    pub vendor_info: String,
}

/// The netd network configuration service
#[async_trait]
pub trait Netd: Send + Sync {
    async fn is_alive(&self) -> NetdResult<bool>;

    // Interface configuration
    async fn interface_get_list(&self) -> NetdResult<Vec<String>>;
    async fn interface_get_cfg(&self, ifname: &str) -> NetdResult<InterfaceConfiguration>;
    async fn interface_set_cfg(&self, cfg: &InterfaceConfiguration) -> NetdResult<()>;
    async fn interface_clear_addrs(&self, ifname: &str) -> NetdResult<()>;
    async fn interface_set_mtu(&self, ifname: &str, mtu: i32) -> NetdResult<()>;
    async fn interface_set_enable_ipv6(&self, ifname: &str, enable: bool) -> NetdResult<()>;
    async fn interface_set_ipv6_privacy_extensions(&self, ifname: &str, enable: bool) -> NetdResult<()>;
    async fn set_ipv6_addr_gen_mode(&self, ifname: &str, mode: i32) -> NetdResult<()>;

    // Network lifecycle
    async fn network_create_physical(&self, net_id: i32, permission: i32) -> NetdResult<()>;
    async fn network_destroy(&self, net_id: i32) -> NetdResult<()>;
    async fn network_add_interface(&self, net_id: i32, ifname: &str) -> NetdResult<()>;
    async fn network_remove_interface(&self, net_id: i32, ifname: &str) -> NetdResult<()>;
    async fn network_set_default(&self, net_id: i32) -> NetdResult<()>;

    // Routing
    async fn network_add_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str) -> NetdResult<()>;
    async fn network_remove_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str) -> NetdResult<()>;
    async fn network_add_legacy_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str, uid: u32) -> NetdResult<()>;
    async fn network_remove_legacy_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str, uid: u32) -> NetdResult<()>;

    // Wake-up packet marking
    async fn wakeup_add_interface(&self, ifname: &str, prefix: &str, mark: u32, mask: u32) -> NetdResult<()>;
    async fn wakeup_del_interface(&self, ifname: &str, prefix: &str, mark: u32, mask: u32) -> NetdResult<()>;

    // NAT and forwarding
    async fn tether_add_forward(&self, internal: &str, external: &str) -> NetdResult<()>;
    async fn tether_remove_forward(&self, internal: &str, external: &str) -> NetdResult<()>;
    async fn ipfwd_enable_forwarding(&self, requester: &str) -> NetdResult<()>;
    async fn ipfwd_disable_forwarding(&self, requester: &str) -> NetdResult<()>;
    async fn ipfwd_add_interface_forward(&self, from: &str, to: &str) -> NetdResult<()>;
    async fn ipfwd_remove_interface_forward(&self, from: &str, to: &str) -> NetdResult<()>;

    // Tethering
    async fn tether_interface_add(&self, ifname: &str) -> NetdResult<()>;
    async fn tether_interface_remove(&self, ifname: &str) -> NetdResult<()>;
    async fn tether_interface_list(&self) -> NetdResult<Vec<String>>;
    async fn tether_start(&self, dhcp_ranges: &[String]) -> NetdResult<()>;
    async fn tether_stop(&self) -> NetdResult<()>;
    async fn tether_is_enabled(&self) -> NetdResult<bool>;
    async fn tether_dns_set(&self, net_id: i32, dns_addrs: &[String]) -> NetdResult<()>;
    async fn tether_get_stats(&self) -> NetdResult<Vec<TetherStatsParcel>>;

    // CLAT464
    async fn clatd_start(&self, ifname: &str, nat64_prefix: &str) -> NetdResult<String>;
    async fn clatd_stop(&self, ifname: &str) -> NetdResult<()>;

    // TCP buffers and bandwidth control
    async fn set_tcp_rw_memory_size(&self, rmem: &str, wmem: &str) -> NetdResult<()>;
    async fn bandwidth_set_interface_alert(&self, ifname: &str, bytes: i64) -> NetdResult<()>;
    async fn bandwidth_remove_interface_alert(&self, ifname: &str) -> NetdResult<()>;
    async fn bandwidth_set_interface_quota(&self, ifname: &str, bytes: i64) -> NetdResult<()>;
    async fn bandwidth_remove_interface_quota(&self, ifname: &str) -> NetdResult<()>;
    async fn bandwidth_set_global_alert(&self, bytes: i64) -> NetdResult<()>;
}

/// The DNS resolver service
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn create_network_cache(&self, net_id: i32) -> NetdResult<()>;
    async fn destroy_network_cache(&self, net_id: i32) -> NetdResult<()>;
    async fn set_resolver_configuration(&self, params: &ResolverParams) -> NetdResult<()>;
    async fn start_prefix64_discovery(&self, net_id: i32) -> NetdResult<()>;
    async fn stop_prefix64_discovery(&self, net_id: i32) -> NetdResult<()>;
}

/// DHCP client for interfaces configured outside of netd
#[async_trait]
pub trait DhcpClient: Send + Sync {
    async fn dhcp_request(&self, ifname: &str) -> NetdResult<DhcpLease>;
    async fn dhcp_stop(&self, ifname: &str) -> NetdResult<()>;
}

/// System property store (`net.*`, `ctl.start`, `init.svc.*`)
pub trait SystemProperties: Send + Sync {
    fn get_property(&self, key: &str) -> Option<String>;
    fn set_property(&self, key: &str, value: &str);

    /// Value of `key`, `default` when unset or empty
    fn property_or(&self, key: &str, default: &str) -> String {
        self.get_property(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }
}

/// The set of backends one orchestrator drives
#[derive(Clone)]
pub struct Platform {
    pub netd: Arc<dyn Netd>,
    pub resolver: Arc<dyn DnsResolver>,
    pub dhcp: Arc<dyn DhcpClient>,
    pub properties: Arc<dyn SystemProperties>,
}

impl Platform {
    /// Use one object for every backend
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: Netd + DnsResolver + DhcpClient + SystemProperties + 'static,
    {
        Self {
            netd: backend.clone(),
            resolver: backend.clone(),
            dhcp: backend.clone(),
            properties: backend,
        }
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
