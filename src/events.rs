//! Unsolicited controller events
//!
//! netd reports interface, address, route, DNS and quota changes outside of any
//! command. They are re-broadcast to the result listener as results with
//! `broadcast = true`, a topic and a reason string.

use crate::types::NetworkResultOptions;
use crossbeam::channel::Sender;

pub const TOPIC_DNS_INFO: &str = "interface-dns-info";
pub const TOPIC_ADDRESS_CHANGE: &str = "interface-address-change";
pub const TOPIC_INTERFACE_CHANGE: &str = "netd-interface-change";
pub const TOPIC_ROUTE_CHANGE: &str = "route-change";
pub const TOPIC_BANDWIDTH_CONTROL: &str = "netd-bandwidth-control";
pub const TOPIC_DNS_EVENT: &str = "on-dns-event";
pub const TOPIC_NAT64_PREFIX: &str = "on-nat64prefix-event";

/// Event raised by netd or the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetdEvent {
    InterfaceDnsServerInfo {
        ifname: String,
        lifetime: i64,
        servers: Vec<String>,
    },
    InterfaceAddressUpdated {
        addr: String,
        ifname: String,
        flags: i32,
        scope: i32,
    },
    InterfaceAddressRemoved {
        addr: String,
        ifname: String,
        flags: i32,
        scope: i32,
    },
    InterfaceAdded {
        ifname: String,
    },
    InterfaceRemoved {
        ifname: String,
    },
    InterfaceLinkStateChanged {
        ifname: String,
        up: bool,
    },
    InterfaceChanged {
        ifname: String,
        up: bool,
    },
    RouteChanged {
        updated: bool,
        route: String,
        gateway: String,
        ifname: String,
    },
    QuotaLimitReached {
        alert_name: String,
        ifname: String,
    },
    InterfaceClassActivityChanged {
        active: bool,
        label: i32,
        timestamp_ns: i64,
        uid: i32,
    },
    StrictCleartextDetected {
        uid: i32,
        hex: String,
    },
    DnsEvent {
        net_id: i32,
        event_type: i32,
        return_code: i32,
        latency_ms: i32,
        hostname: String,
        ip_addresses: Vec<String>,
        ip_addresses_count: i32,
        uid: i32,
    },
    Nat64Prefix {
        net_id: i32,
        added: bool,
        prefix: String,
        prefix_length: i32,
    },
}

fn state(up: bool) -> &'static str {
    if up {
        "up"
    } else {
        "down"
    }
}

impl NetdEvent {
    /// Topic and reason of the broadcast, `None` for events that are only logged
    pub fn topic_and_reason(&self) -> Option<(&'static str, String)> {
        let encoded = match self {
            NetdEvent::InterfaceDnsServerInfo { ifname, lifetime, servers } => {
                let list: String = servers.iter().map(|s| format!(" {}", s)).collect();
                (TOPIC_DNS_INFO, format!("DnsInfo servers {} {}{}", ifname, lifetime, list))
            }
            NetdEvent::InterfaceAddressUpdated { addr, ifname, flags, scope } => (
                TOPIC_ADDRESS_CHANGE,
                format!("Address updated {} {} {} {}", addr, ifname, flags, scope),
            ),
            NetdEvent::InterfaceAddressRemoved { addr, ifname, flags, scope } => (
                TOPIC_ADDRESS_CHANGE,
                format!("Address removed {} {} {} {}", addr, ifname, flags, scope),
            ),
            NetdEvent::InterfaceAdded { ifname } => {
                (TOPIC_INTERFACE_CHANGE, format!("Iface added {}", ifname))
            }
            NetdEvent::InterfaceRemoved { ifname } => {
                (TOPIC_INTERFACE_CHANGE, format!("Iface removed {}", ifname))
            }
            NetdEvent::InterfaceLinkStateChanged { ifname, up } => (
                TOPIC_INTERFACE_CHANGE,
                format!("Iface linkstate {} {}", ifname, state(*up)),
            ),
            NetdEvent::InterfaceChanged { ifname, up } => (
                TOPIC_INTERFACE_CHANGE,
                format!("Iface changed {} {}", ifname, state(*up)),
            ),
            NetdEvent::RouteChanged { updated, route, gateway, ifname } => (
                TOPIC_ROUTE_CHANGE,
                format!(
                    "Route {} {} via {} dev {}",
                    if *updated { "updated" } else { "removed" },
                    route,
                    gateway,
                    ifname
                ),
            ),
            NetdEvent::QuotaLimitReached { alert_name, ifname } => (
                TOPIC_BANDWIDTH_CONTROL,
                format!("Limit alert {} {}", alert_name, ifname),
            ),
            NetdEvent::DnsEvent {
                net_id,
                event_type,
                return_code,
                latency_ms,
                hostname,
                ip_addresses,
                ip_addresses_count,
                uid,
            } => (
                TOPIC_DNS_EVENT,
                format!(
                    "{} {} {} {} {} {} {} {}",
                    net_id,
                    event_type,
                    return_code,
                    latency_ms,
                    hostname,
                    uid,
                    ip_addresses_count,
                    ip_addresses.join(" ")
                ),
            ),
            NetdEvent::Nat64Prefix { net_id, added, prefix, prefix_length } => (
                TOPIC_NAT64_PREFIX,
                format!(
                    "{} {} {} {}",
                    net_id,
                    if *added { "add" } else { "remove" },
                    prefix,
                    prefix_length
                ),
            ),
            NetdEvent::InterfaceClassActivityChanged { .. } | NetdEvent::StrictCleartextDetected { .. } => {
                return None;
            }
        };
        Some(encoded)
    }

    /// Broadcast result for this event
    pub fn to_broadcast(&self) -> Option<NetworkResultOptions> {
        self.topic_and_reason()
            .map(|(topic, reason)| NetworkResultOptions::broadcast(topic, reason))
    }
}

/// Hands controller events to the result path.
///
/// Cloneable and usable from any thread; broadcasts are delivered in the order
/// they are emitted relative to other results on the same channel.
#[derive(Debug, Clone)]
pub struct NetdEventSink {
    tx: Sender<NetworkResultOptions>,
}

impl NetdEventSink {
    pub fn new(tx: Sender<NetworkResultOptions>) -> Self {
        Self { tx }
    }

    /// Broadcast `event`; returns whether anything was delivered
    pub fn emit(&self, event: NetdEvent) -> bool {
        let Some(result) = event.to_broadcast() else {
            log::debug!("Netd event not broadcast: {:?}", event);
            return false;
        };

        log::debug!("Netd event {:?}: {}", result.topic, result.reason);
        if self.tx.send(result).is_err() {
            log::warn!("Netd event dropped, result channel closed");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_dns_info_reason() {
        let event = NetdEvent::InterfaceDnsServerInfo {
            ifname: "rmnet0".to_string(),
            lifetime: 3600,
            servers: vec!["2001:4860::8888".to_string(), "2001:4860::8844".to_string()],
        };
        let (topic, reason) = event.topic_and_reason().unwrap();
        assert_eq!(topic, TOPIC_DNS_INFO);
        assert_eq!(reason, "DnsInfo servers rmnet0 3600 2001:4860::8888 2001:4860::8844");
    }

    #[test]
    fn test_address_and_link_reasons() {
        let removed = NetdEvent::InterfaceAddressRemoved {
            addr: "192.168.1.5/24".to_string(),
            ifname: "wlan0".to_string(),
            flags: 128,
            scope: 0,
        };
        assert_eq!(
            removed.topic_and_reason(),
            Some((TOPIC_ADDRESS_CHANGE, "Address removed 192.168.1.5/24 wlan0 128 0".to_string()))
        );

        let link = NetdEvent::InterfaceLinkStateChanged { ifname: "wlan0".to_string(), up: false };
        assert_eq!(
            link.topic_and_reason(),
            Some((TOPIC_INTERFACE_CHANGE, "Iface linkstate wlan0 down".to_string()))
        );
    }

    #[test]
    fn test_route_and_nat64_reasons() {
        let route = NetdEvent::RouteChanged {
            updated: true,
            route: "0.0.0.0/0".to_string(),
            gateway: "10.0.0.1".to_string(),
            ifname: "rmnet0".to_string(),
        };
        assert_eq!(route.topic_and_reason().unwrap().1, "Route updated 0.0.0.0/0 via 10.0.0.1 dev rmnet0");

        let prefix = NetdEvent::Nat64Prefix {
            net_id: 100,
            added: false,
            prefix: "64:ff9b::".to_string(),
            prefix_length: 96,
        };
        assert_eq!(
            prefix.topic_and_reason(),
            Some((TOPIC_NAT64_PREFIX, "100 remove 64:ff9b:: 96".to_string()))
        );
    }

    #[test]
    fn test_dns_event_reason() {
        let event = NetdEvent::DnsEvent {
            net_id: 101,
            event_type: 1,
            return_code: 0,
            latency_ms: 42,
            hostname: "example.com".to_string(),
            ip_addresses: vec!["93.184.216.34".to_string(), "2606:2800::1".to_string()],
            ip_addresses_count: 2,
            uid: 1000,
        };
        assert_eq!(
            event.topic_and_reason().unwrap().1,
            "101 1 0 42 example.com 1000 2 93.184.216.34 2606:2800::1"
        );
    }

    #[test]
    fn test_sink_broadcasts() {
        let (tx, rx) = unbounded();
        let sink = NetdEventSink::new(tx);

        assert!(sink.emit(NetdEvent::InterfaceAdded { ifname: "rndis0".to_string() }));
        let result = rx.try_recv().unwrap();
        assert!(result.broadcast);
        assert_eq!(result.topic.as_deref(), Some(TOPIC_INTERFACE_CHANGE));
        assert_eq!(result.reason, "Iface added rndis0");

        assert!(!sink.emit(NetdEvent::StrictCleartextDetected { uid: 1, hex: "00".to_string() }));
        assert!(rx.try_recv().is_err());
    }
}
