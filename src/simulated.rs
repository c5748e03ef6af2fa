//! In-memory controller backend
//!
//! `SimulatedNetd` keeps the state a real netd would (networks, routes, tether
//! list, forwarding rules, resolver caches, system properties) and answers with
//! the errnos netd uses: `ENODEV` for unknown interfaces, `ENONET` for unknown
//! networks, `EEXIST` for duplicates and `ENOENT` for removing something absent.
//! Every call is recorded, and any operation can be made to fail on demand.

use crate::controller::{
    DhcpClient, DhcpLease, DnsResolver, InterfaceConfiguration, Netd, NetdResult, ResolverParams,
    SystemProperties, TetherStatsParcel, IF_STATE_DOWN, IF_STATE_UP,
};
use crate::error::NetdError;
use crate::events::{NetdEvent, NetdEventSink};
use crate::types::LOCAL_NET_ID;
use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Address clatd reports for its IPv4 side
pub const CLAT_ADDRESS: &str = "192.0.0.4";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Route {
    net_id: i32,
    ifname: String,
    destination: String,
    nexthop: String,
    /// Legacy routes carry the uid they were installed for
    uid: Option<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    alive: bool,

    interfaces: BTreeMap<String, InterfaceConfiguration>,
    mtu: HashMap<String, i32>,
    ipv6_enabled: HashMap<String, bool>,
    ipv6_privacy: HashMap<String, bool>,
    addr_gen_mode: HashMap<String, i32>,

    networks: BTreeMap<i32, BTreeSet<String>>,
    default_network: Option<i32>,
    routes: BTreeSet<Route>,
    wakeup: BTreeSet<String>,

    resolver_caches: BTreeSet<i32>,
    resolver_configs: HashMap<i32, ResolverParams>,
    prefix64_discovery: BTreeSet<i32>,

    nat_forwards: BTreeSet<(String, String)>,
    forwarding_requesters: BTreeSet<String>,
    interface_forwards: BTreeSet<(String, String)>,

    tethered: Vec<String>,
    tether_started: bool,
    dhcp_ranges: Vec<String>,
    tether_dns: Option<(i32, Vec<String>)>,
    tether_stats: Vec<TetherStatsParcel>,

    clatd: HashMap<String, String>,
    tcp_buffers: Option<(String, String)>,
    alerts: HashMap<String, i64>,
    quotas: HashMap<String, i64>,
    global_alert: Option<i64>,

    dhcp_lease: Option<DhcpLease>,
    dhcp_running: BTreeSet<String>,

    properties: HashMap<String, String>,

    failures: HashMap<String, Errno>,
    /// Recorded call prefixes that fail, for one argument combination only
    call_failures: Vec<(String, Errno)>,
    calls: Vec<String>,
}

/// Stateful stand-in for netd, the resolver, the DHCP client and the property store
#[derive(Debug)]
pub struct SimulatedNetd {
    state: Mutex<SimState>,
    delay: Mutex<Option<Duration>>,
    events: Mutex<Option<NetdEventSink>>,
}

impl Default for SimulatedNetd {
    fn default() -> Self {
        Self::new()
    }
}

fn service<T>(errno: Errno) -> NetdResult<T> {
    Err(NetdError::service(errno))
}

impl SimulatedNetd {
    /// A running netd with only the local network
    pub fn new() -> Self {
        let mut state = SimState {
            alive: true,
            ..Default::default()
        };
        state.networks.insert(LOCAL_NET_ID, BTreeSet::new());
        state
            .properties
            .insert("init.svc.netd".to_string(), "running".to_string());

        Self {
            state: Mutex::new(state),
            delay: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    /// Builder: plug in interfaces, all down and unconfigured
    pub fn with_interfaces(self, names: &[&str]) -> Self {
        {
            let mut state = self.state.lock();
            for name in names {
                state.interfaces.insert(name.to_string(), blank_interface(name));
            }
        }
        self
    }

    /// Builder: netd not started yet
    pub fn stopped(self) -> Self {
        {
            let mut state = self.state.lock();
            state.alive = false;
            state.properties.remove("init.svc.netd");
        }
        self
    }

    /// Suspend every async call for `delay` before it runs
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Make `op` (a trait method name) fail with `errno` until cleared
    pub fn fail_on(&self, op: &str, errno: Errno) {
        self.state.lock().failures.insert(op.to_string(), errno);
    }

    /// Make calls whose log line starts with `prefix` fail with `errno`,
    /// e.g. `"network_add_route 99 wlan0 2001:"`
    pub fn fail_on_call(&self, prefix: &str, errno: Errno) {
        self.state.lock().call_failures.push((prefix.to_string(), errno));
    }

    pub fn clear_failure(&self, op: &str) {
        let mut state = self.state.lock();
        state.failures.remove(op);
        state.call_failures.retain(|(prefix, _)| !prefix.starts_with(op));
    }

    /// Route unsolicited events to `sink`
    pub fn attach_events(&self, sink: NetdEventSink) {
        *self.events.lock() = Some(sink);
    }

    /// Raise an unsolicited event; false when nothing is attached or it is not broadcast
    pub fn emit(&self, event: NetdEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    /// Hot-plug an interface and announce it
    pub fn add_interface(&self, name: &str) {
        self.state
            .lock()
            .interfaces
            .insert(name.to_string(), blank_interface(name));
        self.emit(NetdEvent::InterfaceAdded { ifname: name.to_string() });
    }

    pub fn set_dhcp_lease(&self, lease: DhcpLease) {
        self.state.lock().dhcp_lease = Some(lease);
    }

    pub fn set_tether_stats(&self, stats: Vec<TetherStatsParcel>) {
        self.state.lock().tether_stats = stats;
    }

    /// Every call so far, as `"<op> <args...>"`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Operation names of every call so far
    pub fn ops(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|c| c.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.ops().iter().filter(|o| *o == op).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn has_network(&self, net_id: i32) -> bool {
        self.state.lock().networks.contains_key(&net_id)
    }

    pub fn network_interfaces(&self, net_id: i32) -> Vec<String> {
        self.state
            .lock()
            .networks
            .get(&net_id)
            .map(|ifaces| ifaces.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_resolver_cache(&self, net_id: i32) -> bool {
        self.state.lock().resolver_caches.contains(&net_id)
    }

    pub fn resolver_config(&self, net_id: i32) -> Option<ResolverParams> {
        self.state.lock().resolver_configs.get(&net_id).cloned()
    }

    pub fn default_network(&self) -> Option<i32> {
        self.state.lock().default_network
    }

    /// Whether a route to `destination` exists in `net_id`
    pub fn has_route(&self, net_id: i32, destination: &str) -> bool {
        self.state
            .lock()
            .routes
            .iter()
            .any(|r| r.net_id == net_id && r.destination == destination)
    }

    pub fn tethered_interfaces(&self) -> Vec<String> {
        self.state.lock().tethered.clone()
    }

    pub fn is_tethering_started(&self) -> bool {
        self.state.lock().tether_started
    }

    pub fn dhcp_ranges(&self) -> Vec<String> {
        self.state.lock().dhcp_ranges.clone()
    }

    pub fn tether_dns(&self) -> Option<(i32, Vec<String>)> {
        self.state.lock().tether_dns.clone()
    }

    pub fn nat_forwards(&self) -> Vec<(String, String)> {
        self.state.lock().nat_forwards.iter().cloned().collect()
    }

    pub fn forwarding_enabled(&self) -> bool {
        !self.state.lock().forwarding_requesters.is_empty()
    }

    pub fn interface_forwards(&self) -> Vec<(String, String)> {
        self.state.lock().interface_forwards.iter().cloned().collect()
    }

    pub fn interface_config(&self, ifname: &str) -> Option<InterfaceConfiguration> {
        self.state.lock().interfaces.get(ifname).cloned()
    }

    pub fn interface_alert(&self, ifname: &str) -> Option<i64> {
        self.state.lock().alerts.get(ifname).copied()
    }

    pub fn interface_quota(&self, ifname: &str) -> Option<i64> {
        self.state.lock().quotas.get(ifname).copied()
    }

    pub fn global_alert(&self) -> Option<i64> {
        self.state.lock().global_alert
    }

    pub fn tcp_buffers(&self) -> Option<(String, String)> {
        self.state.lock().tcp_buffers.clone()
    }

    pub fn has_wakeup(&self, ifname: &str) -> bool {
        self.state.lock().wakeup.contains(ifname)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Record `call` and apply any injected failure for its operation
    fn enter(&self, call: String) -> NetdResult<MutexGuard<'_, SimState>> {
        let mut state = self.state.lock();
        let op = call.split(' ').next().unwrap_or_default().to_string();
        let targeted = state
            .call_failures
            .iter()
            .find(|(prefix, _)| call.starts_with(prefix.as_str()))
            .map(|(_, errno)| *errno);
        state.calls.push(call);

        if let Some(errno) = state.failures.get(&op).copied().or(targeted) {
            log::debug!("Simulated {} failing with {}", op, errno);
            return service(errno);
        }
        Ok(state)
    }
}

fn blank_interface(name: &str) -> InterfaceConfiguration {
    InterfaceConfiguration {
        ifname: name.to_string(),
        hw_addr: String::new(),
        ipv4_addr: String::new(),
        prefix_length: 0,
        flags: vec![IF_STATE_DOWN.to_string()],
    }
}

impl SimState {
    fn interface(&mut self, ifname: &str) -> NetdResult<&mut InterfaceConfiguration> {
        match self.interfaces.get_mut(ifname) {
            Some(cfg) => Ok(cfg),
            None => service(Errno::ENODEV),
        }
    }

    fn require_interface(&self, ifname: &str) -> NetdResult<()> {
        if self.interfaces.contains_key(ifname) {
            Ok(())
        } else {
            service(Errno::ENODEV)
        }
    }

    fn require_network(&self, net_id: i32) -> NetdResult<()> {
        if self.networks.contains_key(&net_id) {
            Ok(())
        } else {
            service(Errno::ENONET)
        }
    }

    fn require_cache(&self, net_id: i32) -> NetdResult<()> {
        if self.resolver_caches.contains(&net_id) {
            Ok(())
        } else {
            service(Errno::ENONET)
        }
    }

    fn add_route(&mut self, route: Route) -> NetdResult<()> {
        self.require_network(route.net_id)?;
        if !self.routes.insert(route) {
            return service(Errno::EEXIST);
        }
        Ok(())
    }

    fn remove_route(&mut self, route: &Route) -> NetdResult<()> {
        if !self.routes.remove(route) {
            return service(Errno::ENOENT);
        }
        Ok(())
    }
}

fn mac_for(ifname: &str) -> String {
    let sum = ifname.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    format!("02:00:00:00:{:02x}:{:02x}", ifname.len() as u8, sum)
}

#[async_trait]
impl Netd for SimulatedNetd {
    async fn is_alive(&self) -> NetdResult<bool> {
        self.pause().await;
        let state = self.enter("is_alive".to_string())?;
        if !state.alive {
            return Err(NetdError::Unavailable("netd is not running".to_string()));
        }
        Ok(true)
    }

    async fn interface_get_list(&self) -> NetdResult<Vec<String>> {
        self.pause().await;
        let state = self.enter("interface_get_list".to_string())?;
        Ok(state.interfaces.keys().cloned().collect())
    }

    async fn interface_get_cfg(&self, ifname: &str) -> NetdResult<InterfaceConfiguration> {
        self.pause().await;
        let mut state = self.enter(format!("interface_get_cfg {}", ifname))?;
        let mut cfg = state.interface(ifname)?.clone();
        cfg.hw_addr = mac_for(ifname);
        Ok(cfg)
    }

    async fn interface_set_cfg(&self, cfg: &InterfaceConfiguration) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!(
            "interface_set_cfg {} {}/{} {}",
            cfg.ifname,
            cfg.ipv4_addr,
            cfg.prefix_length,
            cfg.flags.join(",")
        ))?;
        let current = state.interface(&cfg.ifname)?;

        current.ipv4_addr = cfg.ipv4_addr.clone();
        current.prefix_length = cfg.prefix_length;
        if cfg.flags.iter().any(|f| f == IF_STATE_UP) {
            current.flags = vec![IF_STATE_UP.to_string()];
        } else if cfg.flags.iter().any(|f| f == IF_STATE_DOWN) {
            current.flags = vec![IF_STATE_DOWN.to_string()];
        }
        Ok(())
    }

    async fn interface_clear_addrs(&self, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("interface_clear_addrs {}", ifname))?;
        let cfg = state.interface(ifname)?;
        cfg.ipv4_addr.clear();
        cfg.prefix_length = 0;
        Ok(())
    }

    async fn interface_set_mtu(&self, ifname: &str, mtu: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("interface_set_mtu {} {}", ifname, mtu))?;
        state.require_interface(ifname)?;
        if mtu <= 0 {
            return service(Errno::EINVAL);
        }
        state.mtu.insert(ifname.to_string(), mtu);
        Ok(())
    }

    async fn interface_set_enable_ipv6(&self, ifname: &str, enable: bool) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("interface_set_enable_ipv6 {} {}", ifname, enable))?;
        state.require_interface(ifname)?;
        state.ipv6_enabled.insert(ifname.to_string(), enable);
        Ok(())
    }

    async fn interface_set_ipv6_privacy_extensions(&self, ifname: &str, enable: bool) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("interface_set_ipv6_privacy_extensions {} {}", ifname, enable))?;
        state.require_interface(ifname)?;
        state.ipv6_privacy.insert(ifname.to_string(), enable);
        Ok(())
    }

    async fn set_ipv6_addr_gen_mode(&self, ifname: &str, mode: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("set_ipv6_addr_gen_mode {} {}", ifname, mode))?;
        state.require_interface(ifname)?;
        state.addr_gen_mode.insert(ifname.to_string(), mode);
        Ok(())
    }

    async fn network_create_physical(&self, net_id: i32, permission: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("network_create_physical {} {}", net_id, permission))?;
        if state.networks.contains_key(&net_id) {
            return service(Errno::EEXIST);
        }
        state.networks.insert(net_id, BTreeSet::new());
        Ok(())
    }

    async fn network_destroy(&self, net_id: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("network_destroy {}", net_id))?;
        if state.networks.remove(&net_id).is_none() {
            return service(Errno::ENONET);
        }
        state.routes.retain(|r| r.net_id != net_id);
        if state.default_network == Some(net_id) {
            state.default_network = None;
        }
        Ok(())
    }

    async fn network_add_interface(&self, net_id: i32, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("network_add_interface {} {}", net_id, ifname))?;
        state.require_interface(ifname)?;
        match state.networks.get_mut(&net_id) {
            Some(ifaces) => {
                ifaces.insert(ifname.to_string());
                Ok(())
            }
            None => service(Errno::ENONET),
        }
    }

    async fn network_remove_interface(&self, net_id: i32, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("network_remove_interface {} {}", net_id, ifname))?;
        let Some(ifaces) = state.networks.get_mut(&net_id) else {
            return service(Errno::ENONET);
        };
        if !ifaces.remove(ifname) {
            return service(Errno::ENOENT);
        }
        state.routes.retain(|r| !(r.net_id == net_id && r.ifname == ifname));
        Ok(())
    }

    async fn network_set_default(&self, net_id: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("network_set_default {}", net_id))?;
        state.require_network(net_id)?;
        state.default_network = Some(net_id);
        Ok(())
    }

    async fn network_add_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("network_add_route {} {} {} {}", net_id, ifname, destination, nexthop))?;
        state.add_route(Route {
            net_id,
            ifname: ifname.to_string(),
            destination: destination.to_string(),
            nexthop: nexthop.to_string(),
            uid: None,
        })
    }

    async fn network_remove_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("network_remove_route {} {} {} {}", net_id, ifname, destination, nexthop))?;
        state.remove_route(&Route {
            net_id,
            ifname: ifname.to_string(),
            destination: destination.to_string(),
            nexthop: nexthop.to_string(),
            uid: None,
        })
    }

    async fn network_add_legacy_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str, uid: u32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!(
            "network_add_legacy_route {} {} {} {} {}",
            net_id, ifname, destination, nexthop, uid
        ))?;
        state.add_route(Route {
            net_id,
            ifname: ifname.to_string(),
            destination: destination.to_string(),
            nexthop: nexthop.to_string(),
            uid: Some(uid),
        })
    }

    async fn network_remove_legacy_route(&self, net_id: i32, ifname: &str, destination: &str, nexthop: &str, uid: u32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!(
            "network_remove_legacy_route {} {} {} {} {}",
            net_id, ifname, destination, nexthop, uid
        ))?;
        state.remove_route(&Route {
            net_id,
            ifname: ifname.to_string(),
            destination: destination.to_string(),
            nexthop: nexthop.to_string(),
            uid: Some(uid),
        })
    }

    async fn wakeup_add_interface(&self, ifname: &str, prefix: &str, mark: u32, mask: u32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("wakeup_add_interface {} {} {:#x} {:#x}", ifname, prefix, mark, mask))?;
        state.require_interface(ifname)?;
        if !state.wakeup.insert(ifname.to_string()) {
            return service(Errno::EEXIST);
        }
        Ok(())
    }

    async fn wakeup_del_interface(&self, ifname: &str, prefix: &str, mark: u32, mask: u32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("wakeup_del_interface {} {} {:#x} {:#x}", ifname, prefix, mark, mask))?;
        if !state.wakeup.remove(ifname) {
            return service(Errno::ENOENT);
        }
        Ok(())
    }

    async fn tether_add_forward(&self, internal: &str, external: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("tether_add_forward {} {}", internal, external))?;
        state.require_interface(internal)?;
        state.require_interface(external)?;
        if !state.nat_forwards.insert((internal.to_string(), external.to_string())) {
            return service(Errno::EEXIST);
        }
        Ok(())
    }

    async fn tether_remove_forward(&self, internal: &str, external: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("tether_remove_forward {} {}", internal, external))?;
        if !state.nat_forwards.remove(&(internal.to_string(), external.to_string())) {
            return service(Errno::ENOENT);
        }
        Ok(())
    }

    async fn ipfwd_enable_forwarding(&self, requester: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("ipfwd_enable_forwarding {}", requester))?;
        state.forwarding_requesters.insert(requester.to_string());
        Ok(())
    }

    async fn ipfwd_disable_forwarding(&self, requester: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("ipfwd_disable_forwarding {}", requester))?;
        state.forwarding_requesters.remove(requester);
        Ok(())
    }

    async fn ipfwd_add_interface_forward(&self, from: &str, to: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("ipfwd_add_interface_forward {} {}", from, to))?;
        state.require_interface(from)?;
        state.require_interface(to)?;
        if !state.interface_forwards.insert((from.to_string(), to.to_string())) {
            return service(Errno::EEXIST);
        }
        Ok(())
    }

    async fn ipfwd_remove_interface_forward(&self, from: &str, to: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("ipfwd_remove_interface_forward {} {}", from, to))?;
        if !state.interface_forwards.remove(&(from.to_string(), to.to_string())) {
            return service(Errno::ENOENT);
        }
        Ok(())
    }

    async fn tether_interface_add(&self, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("tether_interface_add {}", ifname))?;
        state.require_interface(ifname)?;
        if state.tethered.iter().any(|i| i == ifname) {
            return service(Errno::EEXIST);
        }
        state.tethered.push(ifname.to_string());
        Ok(())
    }

    async fn tether_interface_remove(&self, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("tether_interface_remove {}", ifname))?;
        let before = state.tethered.len();
        state.tethered.retain(|i| i != ifname);
        if state.tethered.len() == before {
            return service(Errno::ENOENT);
        }
        Ok(())
    }

    async fn tether_interface_list(&self) -> NetdResult<Vec<String>> {
        self.pause().await;
        let state = self.enter("tether_interface_list".to_string())?;
        Ok(state.tethered.clone())
    }

    async fn tether_start(&self, dhcp_ranges: &[String]) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("tether_start {}", dhcp_ranges.join(" ")))?;
        if state.tether_started {
            return service(Errno::EBUSY);
        }
        if dhcp_ranges.len() % 2 != 0 {
            return service(Errno::EINVAL);
        }
        state.tether_started = true;
        state.dhcp_ranges = dhcp_ranges.to_vec();
        Ok(())
    }

    async fn tether_stop(&self) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter("tether_stop".to_string())?;
        state.tether_started = false;
        state.dhcp_ranges.clear();
        Ok(())
    }

    async fn tether_is_enabled(&self) -> NetdResult<bool> {
        self.pause().await;
        let state = self.enter("tether_is_enabled".to_string())?;
        Ok(state.tether_started)
    }

    async fn tether_dns_set(&self, net_id: i32, dns_addrs: &[String]) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("tether_dns_set {} {}", net_id, dns_addrs.join(" ")))?;
        state.tether_dns = Some((net_id, dns_addrs.to_vec()));
        Ok(())
    }

    async fn tether_get_stats(&self) -> NetdResult<Vec<TetherStatsParcel>> {
        self.pause().await;
        let state = self.enter("tether_get_stats".to_string())?;
        Ok(state.tether_stats.clone())
    }

    async fn clatd_start(&self, ifname: &str, nat64_prefix: &str) -> NetdResult<String> {
        self.pause().await;
        let mut state = self.enter(format!("clatd_start {} {}", ifname, nat64_prefix))?;
        state.require_interface(ifname)?;
        if state.clatd.contains_key(ifname) {
            return service(Errno::EBUSY);
        }
        state.clatd.insert(ifname.to_string(), nat64_prefix.to_string());
        Ok(CLAT_ADDRESS.to_string())
    }

    async fn clatd_stop(&self, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("clatd_stop {}", ifname))?;
        if state.clatd.remove(ifname).is_none() {
            return service(Errno::ENODEV);
        }
        Ok(())
    }

    async fn set_tcp_rw_memory_size(&self, rmem: &str, wmem: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("set_tcp_rw_memory_size {}|{}", rmem, wmem))?;
        state.tcp_buffers = Some((rmem.to_string(), wmem.to_string()));
        Ok(())
    }

    async fn bandwidth_set_interface_alert(&self, ifname: &str, bytes: i64) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("bandwidth_set_interface_alert {} {}", ifname, bytes))?;
        if bytes < 0 {
            return service(Errno::EINVAL);
        }
        state.alerts.insert(ifname.to_string(), bytes);
        Ok(())
    }

    async fn bandwidth_remove_interface_alert(&self, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("bandwidth_remove_interface_alert {}", ifname))?;
        if state.alerts.remove(ifname).is_none() {
            return service(Errno::ENOENT);
        }
        Ok(())
    }

    async fn bandwidth_set_interface_quota(&self, ifname: &str, bytes: i64) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("bandwidth_set_interface_quota {} {}", ifname, bytes))?;
        state.quotas.insert(ifname.to_string(), bytes);
        Ok(())
    }

    async fn bandwidth_remove_interface_quota(&self, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("bandwidth_remove_interface_quota {}", ifname))?;
        if state.quotas.remove(ifname).is_none() {
            return service(Errno::ENOENT);
        }
        state.alerts.remove(ifname);
        Ok(())
    }

    async fn bandwidth_set_global_alert(&self, bytes: i64) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("bandwidth_set_global_alert {}", bytes))?;
        if bytes < 0 {
            return service(Errno::EINVAL);
        }
        state.global_alert = Some(bytes);
        Ok(())
    }
}

#[async_trait]
impl DnsResolver for SimulatedNetd {
    async fn create_network_cache(&self, net_id: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("create_network_cache {}", net_id))?;
        if !state.resolver_caches.insert(net_id) {
            return service(Errno::EEXIST);
        }
        Ok(())
    }

    async fn destroy_network_cache(&self, net_id: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("destroy_network_cache {}", net_id))?;
        state.resolver_configs.remove(&net_id);
        state.prefix64_discovery.remove(&net_id);
        if !state.resolver_caches.remove(&net_id) {
            return service(Errno::ENOENT);
        }
        Ok(())
    }

    async fn set_resolver_configuration(&self, params: &ResolverParams) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!(
            "set_resolver_configuration {} {} {}",
            params.net_id,
            params.servers.join(","),
            params.domains.join(",")
        ))?;
        state.require_cache(params.net_id)?;
        state.resolver_configs.insert(params.net_id, params.clone());
        Ok(())
    }

    async fn start_prefix64_discovery(&self, net_id: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("start_prefix64_discovery {}", net_id))?;
        state.require_cache(net_id)?;
        state.prefix64_discovery.insert(net_id);
        Ok(())
    }

    async fn stop_prefix64_discovery(&self, net_id: i32) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("stop_prefix64_discovery {}", net_id))?;
        state.require_cache(net_id)?;
        state.prefix64_discovery.remove(&net_id);
        Ok(())
    }
}

#[async_trait]
impl DhcpClient for SimulatedNetd {
    async fn dhcp_request(&self, ifname: &str) -> NetdResult<DhcpLease> {
        self.pause().await;
        let mut state = self.enter(format!("dhcp_request {}", ifname))?;
        state.require_interface(ifname)?;

        let lease = state.dhcp_lease.clone().unwrap_or_else(|| DhcpLease {
            ipaddr: "192.168.1.100".to_string(),
            gateway: "192.168.1.1".to_string(),
            prefix_length: 24,
            dns1: "192.168.1.1".to_string(),
            dns2: String::new(),
            server: "192.168.1.1".to_string(),
            lease_secs: 86400,
            vendor_info: String::new(),
        });
        state.dhcp_running.insert(ifname.to_string());
        Ok(lease)
    }

    async fn dhcp_stop(&self, ifname: &str) -> NetdResult<()> {
        self.pause().await;
        let mut state = self.enter(format!("dhcp_stop {}", ifname))?;
        state.dhcp_running.remove(ifname);
        Ok(())
    }
}

impl SystemProperties for SimulatedNetd {
    fn get_property(&self, key: &str) -> Option<String> {
        self.state.lock().properties.get(key).cloned()
    }

    fn set_property(&self, key: &str, value: &str) {
        let mut state = self.state.lock();
        state.calls.push(format!("set_property {} {}", key, value));

        // init semantics for the services the orchestrator controls
        match (key, value) {
            ("ctl.start", "netd") => {
                state.alive = true;
                state.properties.insert("init.svc.netd".to_string(), "running".to_string());
            }
            ("ctl.stop", "netd") => {
                state.alive = false;
                state.properties.insert("init.svc.netd".to_string(), "stopped".to_string());
            }
            ("ctl.start", svc) | ("ctl.stop", svc) => {
                let status = if key == "ctl.start" { "running" } else { "stopped" };
                state.properties.insert(format!("init.svc.{}", svc), status.to_string());
            }
            _ => {
                state.properties.insert(key.to_string(), value.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn sim() -> SimulatedNetd {
        SimulatedNetd::new().with_interfaces(&["wlan0", "rmnet0"])
    }

    #[tokio::test]
    async fn test_network_lifecycle() {
        let netd = sim();

        netd.network_create_physical(100, 0).await.unwrap();
        assert!(netd.network_create_physical(100, 0).await.unwrap_err().is(Errno::EEXIST));

        netd.network_add_interface(100, "wlan0").await.unwrap();
        netd.network_add_route(100, "wlan0", "0.0.0.0/0", "10.0.0.1").await.unwrap();
        assert!(netd.has_route(100, "0.0.0.0/0"));

        netd.network_destroy(100).await.unwrap();
        assert!(!netd.has_network(100));
        assert!(!netd.has_route(100, "0.0.0.0/0"));
        assert!(netd.network_destroy(100).await.unwrap_err().is(Errno::ENONET));
    }

    #[tokio::test]
    async fn test_removal_of_absent_state_is_enoent() {
        let netd = sim();
        assert!(netd.tether_interface_remove("wlan0").await.unwrap_err().is(Errno::ENOENT));
        assert!(netd.tether_remove_forward("wlan0", "rmnet0").await.unwrap_err().is(Errno::ENOENT));
        assert!(netd.network_remove_interface(LOCAL_NET_ID, "wlan0").await.unwrap_err().is(Errno::ENOENT));
    }

    #[tokio::test]
    async fn test_unknown_interface_is_enodev() {
        let netd = sim();
        assert!(netd.interface_get_cfg("eth9").await.unwrap_err().is(Errno::ENODEV));
        assert!(netd.tether_interface_add("eth9").await.unwrap_err().is(Errno::ENODEV));
    }

    #[tokio::test]
    async fn test_failure_injection_and_call_log() {
        let netd = sim();
        netd.fail_on("tether_start", Errno::EBUSY);

        let err = netd.tether_start(&["192.168.43.10".into(), "192.168.43.50".into()]).await.unwrap_err();
        assert!(err.is(Errno::EBUSY));
        assert!(!netd.is_tethering_started());

        netd.clear_failure("tether_start");
        netd.tether_start(&["192.168.43.10".into(), "192.168.43.50".into()]).await.unwrap();
        assert!(netd.is_tethering_started());

        assert_eq!(netd.call_count("tether_start"), 2);
        assert_eq!(netd.calls()[1], "tether_start 192.168.43.10 192.168.43.50");
    }

    #[tokio::test]
    async fn test_interface_cfg_flags() {
        let netd = sim();
        let mut cfg = netd.interface_get_cfg("wlan0").await.unwrap();
        assert!(!cfg.is_up());
        assert!(!cfg.hw_addr.is_empty());

        cfg.ipv4_addr = "192.168.43.1".to_string();
        cfg.prefix_length = 24;
        cfg.flags.push(IF_STATE_UP.to_string());
        netd.interface_set_cfg(&cfg).await.unwrap();

        let stored = netd.interface_config("wlan0").unwrap();
        assert!(stored.is_up());
        assert_eq!(stored.ipv4_addr, "192.168.43.1");
    }

    #[test]
    fn test_property_service_control() {
        let netd = SimulatedNetd::new().stopped();
        assert_eq!(netd.get_property("init.svc.netd"), None);

        netd.set_property("ctl.start", "netd");
        assert_eq!(netd.property_or("init.svc.netd", ""), "running");

        netd.set_property("ctl.start", "radvd");
        assert_eq!(netd.property_or("init.svc.radvd", ""), "running");
        assert_eq!(netd.property_or("net.dns1", "8.8.8.8"), "8.8.8.8");
    }

    #[test]
    fn test_hot_plug_emits_event() {
        let netd = SimulatedNetd::new();
        let (tx, rx) = unbounded();
        netd.attach_events(NetdEventSink::new(tx));

        netd.add_interface("rndis0");
        assert!(netd.interface_config("rndis0").is_some());
        assert_eq!(rx.try_recv().unwrap().reason, "Iface added rndis0");
    }
}
