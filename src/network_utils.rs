//! NetworkUtils - Network command orchestrator
//!
//! Decodes nothing and owns everything: the network id map, the FIFO queue of
//! command chains and the IPv6 tethering slot. Immediate commands are answered
//! on the spot; chained commands are queued and driven one step at a time by
//! [`NetworkUtils::advance`]. Only the chain at the front of the queue ever runs,
//! so no two chains touch netd's global state concurrently.

use crate::command::NetworkCommand;
use crate::command_chain::{
    ChainState, CommandChain, CommandResult, Continuation, FailureHandler, Flow, Step, StepOutcome, SUCCESS,
};
use crate::controller::{
    InterfaceConfiguration, NetdResult, Platform, ResolverParams, IF_STATE_DOWN, IF_STATE_UP,
    PERMISSION_NONE,
};
use crate::error::NetdError;
use crate::events::NetdEventSink;
use crate::ipv6;
use crate::net_id_manager::NetIdManager;
use crate::types::*;
use crossbeam::channel::Sender;
use nix::errno::Errno;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SET_DNS_CHAIN: &[Step] = &[Step::SetInterfaceDns, Step::DefaultAsyncSuccess];

const CREATE_NETWORK_CHAIN: &[Step] = &[
    Step::CreateNetwork,
    Step::AddInterfaceToNetwork,
    Step::WakeupAddInterface,
    Step::DefaultAsyncSuccess,
];

/// Network and resolver cache exist but the interface never joined
const CREATE_NETWORK_FAIL_CHAIN: &[Step] = &[Step::DestroyNetwork];

const DESTROY_NETWORK_CHAIN: &[Step] = &[
    Step::WakeupDelInterface,
    Step::RemoveInterfaceToNetwork,
    Step::DestroyNetwork,
    Step::DefaultAsyncSuccess,
];

const SET_DEFAULT_ROUTE_CHAIN: &[Step] = &[Step::AddDefaultRouteToNetwork, Step::DefaultAsyncSuccess];
const REMOVE_DEFAULT_ROUTE_CHAIN: &[Step] = &[Step::RemoveDefaultRoute, Step::DefaultAsyncSuccess];
const ADD_HOST_ROUTE_CHAIN: &[Step] = &[Step::AddRouteToInterface, Step::DefaultAsyncSuccess];
const REMOVE_HOST_ROUTE_CHAIN: &[Step] = &[Step::RemoveRouteFromInterface, Step::DefaultAsyncSuccess];
const REMOVE_NETWORK_ROUTE_CHAIN: &[Step] = &[Step::ClearAddrForInterface, Step::DefaultAsyncSuccess];
const ADD_SECONDARY_ROUTE_CHAIN: &[Step] = &[Step::AddRouteToSecondaryTable, Step::DefaultAsyncSuccess];
const REMOVE_SECONDARY_ROUTE_CHAIN: &[Step] = &[Step::RemoveRouteFromSecondaryTable, Step::DefaultAsyncSuccess];
const SET_MTU_CHAIN: &[Step] = &[Step::SetMtu, Step::DefaultAsyncSuccess];
const SET_DEFAULT_NETWORK_CHAIN: &[Step] = &[Step::SetDefaultNetwork, Step::DefaultAsyncSuccess];
const ADD_INTERFACE_TO_NETWORK_CHAIN: &[Step] = &[Step::AddInterfaceToNetwork, Step::DefaultAsyncSuccess];
const REMOVE_INTERFACE_TO_NETWORK_CHAIN: &[Step] = &[Step::RemoveInterfaceToNetwork, Step::DefaultAsyncSuccess];
const SETUP_PREFIX64_DISCOVERY_CHAIN: &[Step] = &[Step::SetupPrefix64Discovery, Step::DefaultAsyncSuccess];

const IPV6_ENABLE_CHAIN: &[Step] = &[
    Step::SetIpv6PrivacyExtensions,
    Step::SetIpv6AddrGenMode,
    Step::SetIpv6Enabled,
    Step::DefaultAsyncSuccess,
];

const IPV6_DISABLE_CHAIN: &[Step] = &[Step::SetIpv6Enabled, Step::DefaultAsyncSuccess];

const WIFI_ENABLE_CHAIN: &[Step] = &[
    Step::SetConfig,
    Step::TetherInterface,
    Step::AddRouteToLocalNetwork,
    Step::SetIpForwardingEnabled,
    Step::StartTethering,
    Step::SetDnsForwarders,
    Step::EnableNat,
    Step::AddIpv6TetheringInterfaces,
    Step::UpdateIpv6Tethering,
    Step::WifiTetheringSuccess,
];

const WIFI_DISABLE_CHAIN: &[Step] = &[
    Step::StopIpv6Tethering,
    Step::RemoveIpv6TetheringInterfaces,
    Step::UpdateIpv6Tethering,
    Step::UntetherInterface,
    Step::RemoveRouteFromLocalNetwork,
    Step::DisableNat,
    Step::SetIpForwardingDisabled,
    Step::StopTethering,
    Step::WifiTetheringSuccess,
];

const WIFI_FAIL_CHAIN: &[Step] = &[
    Step::StopIpv6Tethering,
    Step::RemoveIpv6TetheringInterfaces,
    Step::SetIpForwardingDisabled,
    Step::StopTethering,
];

const USB_ENABLE_CHAIN: &[Step] = &[
    Step::SetConfig,
    Step::TetherInterface,
    Step::AddRouteToLocalNetwork,
    Step::SetIpForwardingEnabled,
    Step::StartTethering,
    Step::SetDnsForwarders,
    Step::EnableNat,
    Step::AddIpv6TetheringInterfaces,
    Step::UpdateIpv6Tethering,
    Step::UsbTetheringSuccess,
];

const USB_DISABLE_CHAIN: &[Step] = &[
    Step::StopIpv6Tethering,
    Step::RemoveIpv6TetheringInterfaces,
    Step::UpdateIpv6Tethering,
    Step::UntetherInterface,
    Step::RemoveRouteFromLocalNetwork,
    Step::DisableNat,
    Step::SetIpForwardingDisabled,
    Step::StopTethering,
    Step::UsbTetheringSuccess,
];

const USB_FAIL_CHAIN: &[Step] = &[
    Step::StopIpv6Tethering,
    Step::RemoveIpv6TetheringInterfaces,
    Step::SetIpForwardingDisabled,
    Step::StopTethering,
];

const UPDATE_UPSTREAM_CHAIN: &[Step] = &[
    Step::StopIpv6Tethering,
    Step::CleanUpStream,
    Step::CleanUpStreamInterfaceForwarding,
    Step::CreateUpStream,
    Step::CreateUpStreamInterfaceForwarding,
    Step::SetDnsForwarders,
    Step::UpdateIpv6Tethering,
    Step::UpdateUpStreamSuccess,
];

const REMOVE_UPSTREAM_CHAIN: &[Step] = &[
    Step::StopIpv6Tethering,
    Step::CleanUpStreamInterfaceForwarding,
    Step::DefaultAsyncSuccess,
];

/// Longest bootstrap sleep between two shutdown checks
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Delimiter of the six `tcpBufferSizes` values
const TCP_BUFFER_DELIMITER: char = ',';

/// DNS used for radvd when a `net.dnsN` slot is unset
const FALLBACK_DNS: &str = "8.8.8.8";

#[derive(Default)]
struct OrchestratorStats {
    chains_queued: AtomicU64,
    chains_completed: AtomicU64,
    chains_failed: AtomicU64,
    rollbacks: AtomicU64,
    ignored_failures: AtomicU64,
    immediate_commands: AtomicU64,
    queue_depth: AtomicU64,
}

/// Snapshot of the orchestrator counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStatistics {
    pub chains_queued: u64,
    pub chains_completed: u64,
    pub chains_failed: u64,
    pub rollbacks: u64,
    /// Best-effort step failures that were logged and skipped
    pub ignored_failures: u64,
    pub immediate_commands: u64,
    pub queue_depth: u64,
}

/// Cheap handle to the orchestrator counters, readable from any thread
#[derive(Clone)]
pub struct StatsHandle(Arc<OrchestratorStats>);

impl StatsHandle {
    pub fn get_stats(&self) -> OrchestratorStatistics {
        let stats = &self.0;
        OrchestratorStatistics {
            chains_queued: stats.chains_queued.load(Ordering::Relaxed),
            chains_completed: stats.chains_completed.load(Ordering::Relaxed),
            chains_failed: stats.chains_failed.load(Ordering::Relaxed),
            rollbacks: stats.rollbacks.load(Ordering::Relaxed),
            ignored_failures: stats.ignored_failures.load(Ordering::Relaxed),
            immediate_commands: stats.immediate_commands.load(Ordering::Relaxed),
            queue_depth: stats.queue_depth.load(Ordering::Relaxed),
        }
    }
}

/// The single IPv6 tethering slot
#[derive(Debug, Default)]
struct Ipv6Tethering {
    /// Internal interfaces eligible for IPv6 tethering; radvd serves the first
    interfaces: Vec<String>,
    enabled: bool,
}

/// Network command orchestrator
pub struct NetworkUtils {
    platform: Platform,
    config: NetworkConfig,

    /// Results and broadcasts towards the caller
    results: Sender<NetworkResultOptions>,

    net_ids: NetIdManager,

    /// Front chain is the one running
    queue: VecDeque<CommandChain>,

    ipv6: Ipv6Tethering,

    next_chain_id: u64,

    stats: Arc<OrchestratorStats>,
    shutdown: Arc<AtomicBool>,
}

/// Treat a controller `ENOENT` as "already gone"
fn absent_ok(what: &str, res: NetdResult<()>) -> NetdResult<()> {
    match res {
        Err(err) if err.is(Errno::ENOENT) => {
            log::debug!("{}: nothing to remove", what);
            Ok(())
        }
        other => other,
    }
}

/// Log a controller call outcome and reduce it to success
fn report<T>(what: &str, res: &NetdResult<T>) -> bool {
    match res {
        Ok(_) => {
            log::debug!("{}: success", what);
            true
        }
        Err(err) => {
            log::warn!("{}: {}", what, err);
            false
        }
    }
}

/// Return code for an immediate command whose controller call failed
fn failure_code(err: &NetdError) -> i32 {
    match err.service_specific_code() {
        0 => -1,
        code => code,
    }
}

/// Address part of a `setConfig`-style request. `None` leaves no address,
/// `Some(None)` is the unspecified address (keep what is configured).
fn requested_ipv4(ip: &str) -> Option<Option<Ipv4Addr>> {
    let addr: Ipv4Addr = ip.trim().parse().ok()?;
    if addr.is_unspecified() {
        Some(None)
    } else {
        Some(Some(addr))
    }
}

fn prefix_number(prefix: &str) -> u32 {
    prefix.trim().parse().unwrap_or(0)
}

impl NetworkUtils {
    pub fn new(platform: Platform, config: NetworkConfig, results: Sender<NetworkResultOptions>) -> Self {
        log::info!(
            "Initializing NetworkUtils (net ids {}..={})",
            config.min_net_id,
            config.max_net_id
        );

        Self {
            platform,
            net_ids: NetIdManager::with_range(config.min_net_id, config.max_net_id),
            config,
            results,
            queue: VecDeque::new(),
            ipv6: Ipv6Tethering::default(),
            next_chain_id: 1,
            stats: Arc::new(OrchestratorStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sink for unsolicited controller events, sharing the result channel
    pub fn event_sink(&self) -> NetdEventSink {
        NetdEventSink::new(self.results.clone())
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle(self.stats.clone())
    }

    pub fn get_stats(&self) -> OrchestratorStatistics {
        self.stats_handle().get_stats()
    }

    /// Flag that makes a pending [`NetworkUtils::bootstrap`] give up
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn net_ids(&self) -> &NetIdManager {
        &self.net_ids
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn set_debug(&mut self, enabled: bool) {
        log::info!("Network debug {}", if enabled { "enabled" } else { "disabled" });
        self.config.debug = enabled;
    }

    /// Internal interfaces in the IPv6 tethering slot and whether radvd is serving
    pub fn ipv6_tethering(&self) -> (&[String], bool) {
        (&self.ipv6.interfaces, self.ipv6.enabled)
    }

    /// Chains waiting or running
    pub fn pending_chains(&self) -> usize {
        self.queue.len()
    }

    pub fn has_pending_step(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Restart netd if a previous instance of this process left it running, start
    /// it when needed, then wait until it answers. Gives up early once the
    /// shutdown flag is raised.
    pub async fn bootstrap(&mut self) -> bool {
        let props = self.platform.properties.clone();

        let previous: i32 = props.property_or("dev.b2g.pid", "0").parse().unwrap_or(0);
        let current = nix::unistd::getpid();
        props.set_property("dev.b2g.pid", &current.to_string());

        if previous > 0 {
            log::info!("Stopping netd left over from pid {}", previous);
            props.set_property("ctl.stop", "netd");
        }

        if props.property_or("init.svc.netd", "") != "running" {
            log::info!("Starting netd");
            props.set_property("ctl.start", "netd");
        }

        let retry = Duration::from_millis(self.config.netd_connect_retry_ms);
        let max_attempts = self.config.netd_connect_max_attempts;
        let mut attempts = 0u32;

        loop {
            if self.shutting_down() {
                log::info!("Shutdown requested, no longer waiting for netd");
                return false;
            }

            attempts += 1;
            match self.platform.netd.is_alive().await {
                Ok(true) => {
                    log::info!("netd is alive after {} attempt(s)", attempts);
                    return true;
                }
                Ok(false) => log::debug!("netd not ready yet"),
                Err(err) => log::debug!("netd not reachable: {}", err),
            }

            if max_attempts != 0 && attempts >= max_attempts {
                log::error!("Giving up on netd after {} attempts", attempts);
                return false;
            }

            let mut waited = Duration::ZERO;
            while waited < retry && !self.shutting_down() {
                let slice = SHUTDOWN_POLL.min(retry - waited);
                tokio::time::sleep(slice).await;
                waited += slice;
            }
        }
    }

    /// Stop the netd instance this process started
    pub fn stop_netd(&self) {
        log::info!("Stopping netd");
        self.platform.properties.set_property("ctl.stop", "netd");
    }

    /// Dispatch one decoded request. Immediate results are posted before this
    /// returns; chained commands only get queued.
    pub async fn execute_command(&mut self, params: NetworkParams) {
        let id = params.id;
        let cmd = params.cmd;
        log::debug!("Executing {} (id {})", cmd, id);

        let outcome = match cmd {
            NetworkCommand::RemoveNetworkRoute => self.remove_network_route(params),
            NetworkCommand::SetDns => self.set_dns(params),
            NetworkCommand::GetNetId => self.get_net_id(&params),
            NetworkCommand::CreateNetwork => self.create_network(params),
            NetworkCommand::DestroyNetwork => self.destroy_network(params),
            NetworkCommand::SetDefaultRoute => self.set_default_route(params),
            NetworkCommand::RemoveDefaultRoute => self.remove_default_route(params),
            NetworkCommand::AddHostRoute => self.add_host_route(params),
            NetworkCommand::RemoveHostRoute => self.remove_host_route(params),
            NetworkCommand::AddSecondaryRoute => self.add_secondary_route(params),
            NetworkCommand::RemoveSecondaryRoute => self.remove_secondary_route(params),
            NetworkCommand::SetMtu => self.set_mtu(params),
            NetworkCommand::SetDefaultNetwork => self.set_default_network(params),
            NetworkCommand::AddInterfaceToNetwork => self.add_interface_to_network(params),
            NetworkCommand::RemoveInterfaceToNetwork => self.remove_interface_to_network(params),
            NetworkCommand::SetIpv6Status => self.set_ipv6_status(params),
            NetworkCommand::DhcpRequest => self.dhcp_request(&params).await,
            NetworkCommand::StopDhcp => self.stop_dhcp(&params).await,
            NetworkCommand::GetInterfaces => self.get_interfaces().await,
            NetworkCommand::GetInterfaceConfig => self.get_interface_config(&params).await,
            NetworkCommand::SetInterfaceConfig => self.set_interface_config(&params).await,
            NetworkCommand::StartClatd => self.start_clatd(&params).await,
            NetworkCommand::StopClatd => self.stop_clatd(&params).await,
            NetworkCommand::SetTcpBufferSize => self.set_tcp_buffer_size(&params).await,
            NetworkCommand::SetNetworkInterfaceAlarm => self.set_network_interface_alarm(&params).await,
            NetworkCommand::EnableNetworkInterfaceAlarm => self.enable_network_interface_alarm(&params).await,
            NetworkCommand::DisableNetworkInterfaceAlarm => self.disable_network_interface_alarm(&params).await,
            NetworkCommand::SetTetheringAlarm => self.set_tethering_alarm(&params).await,
            NetworkCommand::RemoveTetheringAlarm => self.remove_tethering_alarm(&params).await,
            NetworkCommand::SetDhcpServer => self.set_dhcp_server(&params).await,
            NetworkCommand::GetTetheringStatus => self.get_tethering_status().await,
            NetworkCommand::GetTetherStats => self.get_tether_stats().await,
            NetworkCommand::UpdateUpStream => self.update_up_stream(params),
            NetworkCommand::RemoveUpStream => self.remove_up_stream(params),
            NetworkCommand::SetUsbTethering => self.set_usb_tethering(params),
            NetworkCommand::SetWifiTethering => self.set_wifi_tethering(params),
            NetworkCommand::SetupPrefix64Discovery => self.setup_prefix64_discovery(params),
        };

        if let Some(result) = outcome.into_result() {
            self.stats.immediate_commands.fetch_add(1, Ordering::Relaxed);
            self.post(id, result);
        }
    }

    /// Run one step of the front chain. Returns false when the queue is empty.
    pub async fn advance(&mut self) -> bool {
        let Some(mut chain) = self.queue.pop_front() else {
            return false;
        };

        let (step, cont) = match chain.next_command() {
            Ok(Some(next)) => next,
            Ok(None) => {
                log::debug!("Chain {} finished", chain.id());
                self.stats.chains_completed.fetch_add(1, Ordering::Relaxed);
                self.update_queue_depth();
                if let Some(next) = self.queue.front() {
                    log::debug!("Processing queued chain {}", next.id());
                }
                return true;
            }
            Err(err) => {
                log::error!("Dropping chain {}: {}", chain.id(), err);
                self.stats.chains_failed.fetch_add(1, Ordering::Relaxed);
                self.update_queue_depth();
                return true;
            }
        };

        let outcome = self.run_step(step, cont, &mut chain).await;
        log::debug!("Chain {} step {:?}: {:?}", chain.id(), outcome.step(), outcome.flow());

        match chain.settle(outcome) {
            Ok(Flow::Proceed) => self.queue.push_front(chain),
            Ok(Flow::Fail) if chain.is_best_effort() => {
                log::warn!("Chain {} step {:?} failed, continuing rollback", chain.id(), step);
                self.stats.ignored_failures.fetch_add(1, Ordering::Relaxed);
                self.queue.push_front(chain);
            }
            Ok(Flow::Fail) => self.fail_chain(chain),
            Err(err) => {
                log::error!("{}", err);
                self.fail_chain(chain);
            }
        }
        true
    }

    /// Drive queued chains until none is left
    pub async fn run_until_idle(&mut self) {
        while self.advance().await {}
    }

    pub fn dump_params(&self, params: &NetworkParams, kind: &str) {
        if !self.config.debug {
            return;
        }
        log::info!("Dump params ({}):", kind);
        log::info!("     ifname: {}", params.ifname);
        log::info!("     networktype {}", params.network_type);
        log::info!("     ip: {}", params.ip);
        log::info!("     link: {}", params.link);
        log::info!("     prefix: {}", params.prefix);
        log::info!("     wifiStartIp: {}", params.wifi_start_ip);
        log::info!("     wifiEndIp: {}", params.wifi_end_ip);
        log::info!("     usbStartIp: {}", params.usb_start_ip);
        log::info!("     usbEndIp: {}", params.usb_end_ip);
        log::info!("     dnsserver1: {}", params.dns1);
        log::info!("     dnsserver2: {}", params.dns2);
        log::info!("     internalIfname: {}", params.internal_ifname);
        log::info!("     externalIfname: {}", params.external_ifname);
        log::info!("     netId: {}", params.net_id);
        if kind == "WIFI" {
            log::info!("     wifictrlinterfacename: {}", params.wifictrlinterfacename);
            log::info!("     ssid: {}", params.ssid);
            log::info!("     security: {}", params.security);
        }
        log::info!("     preInternalIfname: {}", params.pre_internal_ifname);
        log::info!("     preExternalIfname: {}", params.pre_external_ifname);
        log::info!("     curInternalIfname: {}", params.cur_internal_ifname);
        log::info!("     curExternalIfname: {}", params.cur_external_ifname);
        log::info!("     ipv6Prefix: {}", params.ipv6_prefix);
    }

    fn post(&self, id: i64, mut result: NetworkResultOptions) {
        result.id = id;
        if self.results.send(result).is_err() {
            log::warn!("Result for request {} dropped, receiver gone", id);
        }
    }

    fn update_queue_depth(&self) {
        self.stats
            .queue_depth
            .store(self.queue.len() as u64, Ordering::Relaxed);
    }

    fn allocate_chain_id(&mut self) -> u64 {
        let id = self.next_chain_id;
        self.next_chain_id += 1;
        id
    }

    /// Queue a chain behind any chain already queued
    fn run_chain(&mut self, params: NetworkParams, steps: &'static [Step], failure: FailureHandler) -> CommandResult {
        let id = self.allocate_chain_id();
        self.queue.push_back(CommandChain::new(id, params, steps, Some(failure)));
        self.stats.chains_queued.fetch_add(1, Ordering::Relaxed);
        self.update_queue_depth();

        if self.queue.len() > 1 {
            log::debug!("{} command chains are queued, chain {} waits", self.queue.len(), id);
        }
        CommandResult::Pending
    }

    /// Rollback runs before anything that was already waiting
    fn run_rollback(&mut self, params: NetworkParams, steps: &'static [Step]) {
        let id = self.allocate_chain_id();
        log::info!("Rolling back request {} with chain {}", params.id, id);
        self.queue.push_front(CommandChain::rollback(id, params, steps));
        self.stats.chains_queued.fetch_add(1, Ordering::Relaxed);
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.update_queue_depth();
    }

    fn fail_chain(&mut self, chain: CommandChain) {
        self.stats.chains_failed.fetch_add(1, Ordering::Relaxed);
        let chain_id = chain.id();
        let handler = chain.failure_handler();
        let failed_step = match chain.state() {
            ChainState::Running(index) => chain.steps().get(index).copied(),
            _ => None,
        };
        let (mut params, mut result) = chain.into_parts();
        result.error = true;

        log::warn!("Chain {} for {} failed", chain_id, params.cmd);

        match handler {
            None => {}
            Some(FailureHandler::Default) => {
                result.ret = false;
                self.post(params.id, result);
            }
            Some(FailureHandler::CreateNetwork) => {
                let forgotten = self.release_failed_network(&params);
                result.ret = false;
                self.post(params.id, result);
                // The create step cleans up after itself; later steps leave a live network
                if forgotten && failed_step.is_some_and(|step| step != Step::CreateNetwork) {
                    self.run_rollback(params, CREATE_NETWORK_FAIL_CHAIN);
                }
            }
            Some(FailureHandler::UsbTethering) => {
                result.result = false;
                self.post(params.id, result);
                params.enable = false;
                self.run_rollback(params, USB_FAIL_CHAIN);
            }
            Some(FailureHandler::WifiTethering) => {
                result.result = false;
                self.post(params.id, result);
                params.enable = false;
                self.run_rollback(params, WIFI_FAIL_CHAIN);
            }
            Some(FailureHandler::UpdateUpStream) => {
                self.post(params.id, result);
            }
        }
        self.update_queue_depth();
    }

    /// Log a best-effort controller call and count it when it failed
    fn tolerate<T>(&self, what: &str, res: &NetdResult<T>) {
        if !report(what, res) {
            self.stats.ignored_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Undo the acquire done by `createNetwork` so a retry creates the network again.
    /// True when the entry is gone and nothing else claims the network.
    fn release_failed_network(&mut self, params: &NetworkParams) -> bool {
        match self.net_ids.lookup(&params.ifname) {
            Some(info) if info.net_id == params.net_id => {}
            _ => {
                log::debug!("Net id {} of {} already released", params.net_id, params.ifname);
                return false;
            }
        }

        match self.net_ids.release(&params.ifname, params.network_type) {
            Ok(info) if info.types == 0 => {
                log::info!("Releasing net id {} of {} after failed creation", info.net_id, params.ifname);
                self.net_ids.forget(&params.ifname);
                true
            }
            Ok(info) => {
                log::debug!("Interface {} still claimed (types {:#x})", params.ifname, info.types);
                false
            }
            Err(err) => {
                log::warn!("Cannot release net id of {}: {}", params.ifname, err);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Command handlers
    // ------------------------------------------------------------------

    /// Resolve `ifname` to its network id, or fail the command immediately
    fn with_net_id(&self, params: &mut NetworkParams) -> Result<(), CommandResult> {
        match self.net_ids.lookup(&params.ifname) {
            Some(info) => {
                params.net_id = info.net_id;
                Ok(())
            }
            None => {
                log::error!("No such interface: {}", params.ifname);
                Err(CommandResult::Code(-1))
            }
        }
    }

    fn lookup_and_run(&mut self, mut params: NetworkParams, steps: &'static [Step]) -> CommandResult {
        if let Err(result) = self.with_net_id(&mut params) {
            return result;
        }
        log::debug!("Obtained net id {} for interface {}", params.net_id, params.ifname);
        self.run_chain(params, steps, FailureHandler::Default)
    }

    fn set_dns(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, SET_DNS_CHAIN)
    }

    fn get_net_id(&self, params: &NetworkParams) -> CommandResult {
        match self.net_ids.lookup(&params.ifname) {
            Some(info) => NetworkResultOptions {
                result: true,
                net_id: Some(info.net_id.to_string()),
                ..Default::default()
            }
            .into(),
            None => {
                log::error!("No such interface: {}", params.ifname);
                NetworkResultOptions {
                    result: false,
                    reason: format!("No such interface: {}", params.ifname),
                    ..Default::default()
                }
                .into()
            }
        }
    }

    fn create_network(&mut self, mut params: NetworkParams) -> CommandResult {
        let known = self.net_ids.lookup(&params.ifname);

        let info = match self.net_ids.acquire(&params.ifname, params.network_type) {
            Ok(info) => info,
            Err(err) => {
                log::error!("createNetwork {}: {}", params.ifname, err);
                return CommandResult::Code(-1);
            }
        };

        if let Some(existing) = known {
            log::debug!("Interface {} ({}) has been created", params.ifname, existing.net_id);
            return CommandResult::Code(SUCCESS);
        }

        log::debug!("Request netd to create a network with net id {}", info.net_id);
        params.net_id = info.net_id;
        self.run_chain(params, CREATE_NETWORK_CHAIN, FailureHandler::CreateNetwork)
    }

    fn destroy_network(&mut self, mut params: NetworkParams) -> CommandResult {
        let info = match self.net_ids.release(&params.ifname, params.network_type) {
            Ok(info) => info,
            Err(err) => {
                log::error!("No existing net id for {}: {}", params.ifname, err);
                return CommandResult::Code(-1);
            }
        };

        if info.types != 0 {
            log::debug!("Interface {} is still in use (types {:#x})", params.ifname, info.types);
            return CommandResult::Code(SUCCESS);
        }

        log::debug!("Interface {} ({}) is no longer used, destroying", params.ifname, info.net_id);
        self.net_ids.forget(&params.ifname);
        params.net_id = info.net_id;
        self.run_chain(params, DESTROY_NETWORK_CHAIN, FailureHandler::Default)
    }

    fn set_default_route(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, SET_DEFAULT_ROUTE_CHAIN)
    }

    fn remove_default_route(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, REMOVE_DEFAULT_ROUTE_CHAIN)
    }

    fn add_host_route(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, ADD_HOST_ROUTE_CHAIN)
    }

    fn remove_host_route(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, REMOVE_HOST_ROUTE_CHAIN)
    }

    fn remove_network_route(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, REMOVE_NETWORK_ROUTE_CHAIN)
    }

    fn add_secondary_route(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, ADD_SECONDARY_ROUTE_CHAIN)
    }

    fn remove_secondary_route(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, REMOVE_SECONDARY_ROUTE_CHAIN)
    }

    fn set_mtu(&mut self, params: NetworkParams) -> CommandResult {
        self.run_chain(params, SET_MTU_CHAIN, FailureHandler::Default)
    }

    fn set_default_network(&mut self, mut params: NetworkParams) -> CommandResult {
        params.loop_index = 0;
        self.lookup_and_run(params, SET_DEFAULT_NETWORK_CHAIN)
    }

    fn setup_prefix64_discovery(&mut self, params: NetworkParams) -> CommandResult {
        self.lookup_and_run(params, SETUP_PREFIX64_DISCOVERY_CHAIN)
    }

    fn add_interface_to_network(&mut self, params: NetworkParams) -> CommandResult {
        if params.net_id == -1 {
            log::debug!("addInterfaceToNetwork without net id");
            return CommandResult::Code(-1);
        }
        if params.ifname.is_empty() {
            log::debug!("addInterfaceToNetwork without ifname");
            return CommandResult::Code(-1);
        }

        let Some(info) = self.net_ids.lookup_by_net_id(params.net_id) else {
            log::debug!("addInterfaceToNetwork: no network {}", params.net_id);
            return CommandResult::Code(-1);
        };

        log::debug!("Add {} to network {}", params.ifname, info.net_id);
        if let Err(err) = self.net_ids.add_interface_to_network(&params.ifname, &info) {
            log::error!("addInterfaceToNetwork: {}", err);
            return CommandResult::Code(-1);
        }
        self.run_chain(params, ADD_INTERFACE_TO_NETWORK_CHAIN, FailureHandler::Default)
    }

    fn remove_interface_to_network(&mut self, params: NetworkParams) -> CommandResult {
        if params.net_id == -1 {
            log::debug!("removeInterfaceToNetwork without net id");
            return CommandResult::Code(-1);
        }
        if params.ifname.is_empty() {
            log::debug!("removeInterfaceToNetwork without ifname");
            return CommandResult::Code(-1);
        }

        let Some(info) = self.net_ids.lookup(&params.ifname) else {
            log::debug!("removeInterfaceToNetwork: unknown interface {}", params.ifname);
            return CommandResult::Code(-1);
        };

        log::debug!("Remove {} from network {}", params.ifname, info.net_id);
        if let Err(err) = self.net_ids.remove_interface_to_network(&params.ifname, &info) {
            log::warn!("removeInterfaceToNetwork: {}", err);
        }
        self.run_chain(params, REMOVE_INTERFACE_TO_NETWORK_CHAIN, FailureHandler::Default)
    }

    fn set_ipv6_status(&mut self, params: NetworkParams) -> CommandResult {
        let steps = if params.enable {
            IPV6_ENABLE_CHAIN
        } else {
            IPV6_DISABLE_CHAIN
        };
        self.run_chain(params, steps, FailureHandler::Default)
    }

    async fn dhcp_request(&self, params: &NetworkParams) -> CommandResult {
        let lease = match self.platform.dhcp.dhcp_request(&params.ifname).await {
            Ok(lease) => lease,
            Err(err) => {
                log::warn!("dhcpRequest {}: {}", params.ifname, err);
                return CommandResult::Code(failure_code(&err));
            }
        };

        let to_u32 = |addr: &str| -> u32 {
            addr.parse::<Ipv4Addr>()
                .map(ipv6::ipv4_to_network_order)
                .unwrap_or(0)
        };
        let mask = ipv6::ipv4_mask(lease.prefix_length);

        NetworkResultOptions {
            result: true,
            dhcp: Some(DhcpLeaseResult {
                ipaddr: to_u32(&lease.ipaddr),
                gateway: to_u32(&lease.gateway),
                dns1: to_u32(&lease.dns1),
                dns2: to_u32(&lease.dns2),
                server: to_u32(&lease.server),
                mask: ipv6::ipv4_to_network_order(mask),
                mask_str: mask.to_string(),
                ipaddr_str: lease.ipaddr,
                gateway_str: lease.gateway,
                dns1_str: lease.dns1,
                dns2_str: lease.dns2,
                server_str: lease.server,
                vendor_str: lease.vendor_info,
                lease: lease.lease_secs,
                prefix_length: lease.prefix_length,
            }),
            ..Default::default()
        }
        .into()
    }

    async fn stop_dhcp(&self, params: &NetworkParams) -> CommandResult {
        match self.platform.dhcp.dhcp_stop(&params.ifname).await {
            Ok(()) => CommandResult::Code(SUCCESS),
            Err(err) => {
                log::warn!("stopDhcp {}: {}", params.ifname, err);
                CommandResult::Code(failure_code(&err))
            }
        }
    }

    async fn get_interfaces(&self) -> CommandResult {
        let res = self.platform.netd.interface_get_list().await;
        let ok = report("getInterfaces", &res);
        NetworkResultOptions {
            result: ok,
            interface_list: res.ok(),
            ..Default::default()
        }
        .into()
    }

    async fn get_interface_config(&self, params: &NetworkParams) -> CommandResult {
        let res = self.platform.netd.interface_get_cfg(&params.ifname).await;
        let mut result = NetworkResultOptions::with_result(report("getInterfaceConfig", &res));

        if let Ok(cfg) = res {
            let flag = if cfg.is_up() { IF_STATE_UP } else { IF_STATE_DOWN };
            result.mac_addr = Some(cfg.hw_addr);
            result.ip_addr = Some(cfg.ipv4_addr);
            result.prefix_length = Some(cfg.prefix_length);
            result.flag = Some(flag.to_string());
        }
        result.into()
    }

    async fn set_interface_config(&self, params: &NetworkParams) -> CommandResult {
        let netd = &self.platform.netd;
        let mut cfg = InterfaceConfiguration {
            ifname: params.ifname.clone(),
            ..Default::default()
        };

        if let Some(Some(addr)) = requested_ipv4(&params.ip) {
            cfg.ipv4_addr = addr.to_string();
            cfg.prefix_length = prefix_number(&params.prefix);
            if !report("setInterfaceConfig address", &netd.interface_set_cfg(&cfg).await) {
                return NetworkResultOptions::with_result(false).into();
            }
        }

        match params.link.as_str() {
            IF_STATE_UP | IF_STATE_DOWN => cfg.flags.push(params.link.clone()),
            other => {
                log::debug!("setInterfaceConfig: unknown link config {:?}", other);
                return NetworkResultOptions::with_result(false).into();
            }
        }

        let ok = report("setInterfaceConfig", &netd.interface_set_cfg(&cfg).await);
        NetworkResultOptions::with_result(ok).into()
    }

    async fn start_clatd(&self, params: &NetworkParams) -> CommandResult {
        log::debug!("startClatd: {} {}", params.ifname, params.nat64_prefix);
        if params.ifname.is_empty() || params.nat64_prefix.is_empty() {
            log::debug!("startClatd argument is empty");
            return NetworkResultOptions::with_result(false).into();
        }

        let res = self
            .platform
            .netd
            .clatd_start(&params.ifname, &params.nat64_prefix)
            .await;
        let mut result = NetworkResultOptions::with_result(report("startClatd", &res));
        result.clatd_address = res.ok();
        result.into()
    }

    async fn stop_clatd(&self, params: &NetworkParams) -> CommandResult {
        if params.ifname.is_empty() {
            log::debug!("stopClatd argument is empty");
            return NetworkResultOptions::with_result(false).into();
        }
        let res = self.platform.netd.clatd_stop(&params.ifname).await;
        NetworkResultOptions::with_result(report("stopClatd", &res)).into()
    }

    async fn set_tcp_buffer_size(&self, params: &NetworkParams) -> CommandResult {
        let sizes: Vec<&str> = params
            .tcp_buffer_sizes
            .split(TCP_BUFFER_DELIMITER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if sizes.len() < 6 {
            log::debug!("tcpBufferSizes {:?} has too few values", params.tcp_buffer_sizes);
            return NetworkResultOptions::with_result(false).into();
        }

        let rmem = sizes[0..3].join(" ");
        let wmem = sizes[3..6].join(" ");
        let res = self.platform.netd.set_tcp_rw_memory_size(&rmem, &wmem).await;
        NetworkResultOptions::with_result(report("setTcpBufferSize", &res)).into()
    }

    async fn set_network_interface_alarm(&self, params: &NetworkParams) -> CommandResult {
        let res = self
            .platform
            .netd
            .bandwidth_set_interface_alert(&params.ifname, params.threshold)
            .await;
        NetworkResultOptions::with_result(report("setNetworkInterfaceAlarm", &res)).into()
    }

    async fn enable_network_interface_alarm(&self, params: &NetworkParams) -> CommandResult {
        let netd = &self.platform.netd;

        let quota = netd.bandwidth_set_interface_quota(&params.ifname, i64::MAX).await;
        if !report("enableNetworkInterfaceAlarm quota", &quota) {
            return NetworkResultOptions::with_result(false).into();
        }

        let alert = netd
            .bandwidth_set_interface_alert(&params.ifname, params.threshold)
            .await;
        NetworkResultOptions::with_result(report("enableNetworkInterfaceAlarm alert", &alert)).into()
    }

    async fn disable_network_interface_alarm(&self, params: &NetworkParams) -> CommandResult {
        let res = self
            .platform
            .netd
            .bandwidth_remove_interface_quota(&params.ifname)
            .await;
        NetworkResultOptions::with_result(report("disableNetworkInterfaceAlarm", &res)).into()
    }

    async fn set_tethering_alarm(&self, params: &NetworkParams) -> CommandResult {
        let res = self.platform.netd.bandwidth_set_global_alert(params.threshold).await;
        NetworkResultOptions::with_result(report("setTetheringAlarm", &res)).into()
    }

    async fn remove_tethering_alarm(&self, params: &NetworkParams) -> CommandResult {
        let res = self
            .platform
            .netd
            .bandwidth_remove_interface_alert(&params.ifname)
            .await;
        NetworkResultOptions::with_result(report("removeTetheringAlarm", &res)).into()
    }

    async fn set_dhcp_server(&self, params: &NetworkParams) -> CommandResult {
        let netd = &self.platform.netd;

        if params.enabled {
            let mut cfg = InterfaceConfiguration {
                ifname: params.ifname.clone(),
                ..Default::default()
            };

            if let Some(Some(addr)) = requested_ipv4(&params.ip) {
                cfg.ipv4_addr = addr.to_string();
                cfg.prefix_length = prefix_number(&params.prefix);
                if !report("setDhcpServer address", &netd.interface_set_cfg(&cfg).await) {
                    return NetworkResultOptions::with_result(false).into();
                }
            }

            cfg.flags.push(IF_STATE_UP.to_string());
            if !report("setDhcpServer bring up", &netd.interface_set_cfg(&cfg).await) {
                return NetworkResultOptions::with_result(false).into();
            }

            let res = netd.tether_start(&dhcp_ranges(params)).await;
            return NetworkResultOptions::with_result(report("setDhcpServer start", &res)).into();
        }

        let tethered = netd.tether_interface_list().await.unwrap_or_default();
        if tethered.len() > 1 {
            log::debug!("setDhcpServer: {} interfaces still tethered", tethered.len());
            return NetworkResultOptions::with_result(true).into();
        }

        let res = netd.tether_stop().await;
        NetworkResultOptions::with_result(report("setDhcpServer stop", &res)).into()
    }

    async fn get_tethering_status(&self) -> CommandResult {
        let enabled = self.platform.netd.tether_is_enabled().await.unwrap_or(false);
        NetworkResultOptions::with_result(enabled).into()
    }

    async fn get_tether_stats(&self) -> CommandResult {
        let res = self.platform.netd.tether_get_stats().await;
        let mut result = NetworkResultOptions::with_result(report("getTetherStats", &res));

        let dummy = &self.config.dummy_upstream_ifname;
        let stats = res
            .unwrap_or_default()
            .into_iter()
            .filter(|parcel| &parcel.iface != dummy)
            .map(|parcel| TetherStats {
                ifname: parcel.iface,
                rx_bytes: parcel.rx_bytes,
                rx_packets: parcel.rx_packets,
                tx_bytes: parcel.tx_bytes,
                tx_packets: parcel.tx_packets,
            })
            .collect();
        result.tether_stats = Some(stats);
        result.into()
    }

    /// Non-IPv6 DNS servers recorded for `ifname` by the connectivity layer
    fn fill_tether_dns(&self, params: &mut NetworkParams, ifname: &str) {
        let props = &self.platform.properties;
        for (slot, target) in [("dns1", &mut params.dns1), ("dns2", &mut params.dns2)] {
            let value = props.property_or(&format!("net.{}.{}", ifname, slot), "");
            if !value.is_empty() && !ipv6::is_ipv6(&value) {
                *target = value;
            }
        }
    }

    fn fill_ipv6_prefix(params: &mut NetworkParams) {
        if params.ipv6_ip.is_empty() {
            return;
        }
        match ipv6::ipv6_prefix(&params.ipv6_ip) {
            Some(prefix) => {
                params.ipv6_routes = vec![prefix.clone(), IPV6_LINK_LOCAL_ROUTE.to_string()];
                params.ipv6_prefix = prefix;
            }
            None => log::debug!("Ignoring malformed ipv6Ip {:?}", params.ipv6_ip),
        }
    }

    fn set_tethering(
        &mut self,
        mut params: NetworkParams,
        kind: &str,
        chains: (&'static [Step], &'static [Step]),
        failure: FailureHandler,
    ) -> CommandResult {
        let external = params.external_ifname.clone();
        self.fill_tether_dns(&mut params, &external);
        Self::fill_ipv6_prefix(&mut params);
        params.loop_index = 0;

        params.net_id = self.net_ids.lookup(&external).map(|i| i.net_id).unwrap_or(-1);
        if params.enable && params.net_id < 0 {
            log::error!("No such interface to enable: {}", external);
            return CommandResult::Code(-1);
        }

        self.dump_params(&params, kind);

        let (enable_chain, disable_chain) = chains;
        if params.enable {
            log::info!("Starting {} tethering on {} <-> {}", kind, params.internal_ifname, external);
            self.run_chain(params, enable_chain, failure)
        } else {
            log::info!("Stopping {} tethering on {} <-> {}", kind, params.internal_ifname, external);
            self.run_chain(params, disable_chain, failure)
        }
    }

    fn set_usb_tethering(&mut self, params: NetworkParams) -> CommandResult {
        self.set_tethering(
            params,
            "USB",
            (USB_ENABLE_CHAIN, USB_DISABLE_CHAIN),
            FailureHandler::UsbTethering,
        )
    }

    fn set_wifi_tethering(&mut self, params: NetworkParams) -> CommandResult {
        self.set_tethering(
            params,
            "WIFI",
            (WIFI_ENABLE_CHAIN, WIFI_DISABLE_CHAIN),
            FailureHandler::WifiTethering,
        )
    }

    fn update_up_stream(&mut self, mut params: NetworkParams) -> CommandResult {
        let current = params.cur_external_ifname.clone();
        self.fill_tether_dns(&mut params, &current);

        let Some(info) = self.net_ids.lookup(&current) else {
            log::error!("No such interface: {}", current);
            return CommandResult::Code(-1);
        };
        params.net_id = info.net_id;

        Self::fill_ipv6_prefix(&mut params);
        params.loop_index = 0;

        let kind = params.kind.clone();
        self.dump_params(&params, &kind);
        self.run_chain(params, UPDATE_UPSTREAM_CHAIN, FailureHandler::UpdateUpStream)
    }

    fn remove_up_stream(&mut self, mut params: NetworkParams) -> CommandResult {
        Self::fill_ipv6_prefix(&mut params);
        params.loop_index = 0;
        self.run_chain(params, REMOVE_UPSTREAM_CHAIN, FailureHandler::Default)
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    async fn run_step(&mut self, step: Step, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        match step {
            Step::ClearAddrForInterface => self.clear_addr_for_interface(cont, chain).await,
            Step::CreateNetwork => self.create_network_step(cont, chain).await,
            Step::DestroyNetwork => self.destroy_network_step(cont, chain).await,
            Step::SetIpv6AddrGenMode => self.set_ipv6_addr_gen_mode(cont, chain).await,
            Step::SetIpv6PrivacyExtensions => self.set_ipv6_privacy_extensions(cont, chain).await,
            Step::SetIpv6Enabled => self.set_ipv6_enabled(cont, chain).await,
            Step::WakeupAddInterface => self.wakeup_interface(cont, chain, true).await,
            Step::WakeupDelInterface => self.wakeup_interface(cont, chain, false).await,
            Step::AddInterfaceToNetwork => self.add_interface_to_network_step(cont, chain).await,
            Step::RemoveInterfaceToNetwork => self.remove_interface_to_network_step(cont, chain).await,
            Step::SetMtu => self.set_mtu_step(cont, chain).await,
            Step::SetDefaultNetwork => self.set_default_network_step(cont, chain).await,
            Step::SetupPrefix64Discovery => self.setup_prefix64_discovery_step(cont, chain).await,
            Step::AddDefaultRouteToNetwork => self.add_default_route_to_network(cont, chain).await,
            Step::RemoveDefaultRoute => self.remove_default_route_step(cont, chain).await,
            Step::SetInterfaceDns => self.set_interface_dns(cont, chain).await,
            Step::AddRouteToInterface => self.add_route_to_interface(cont, chain).await,
            Step::RemoveRouteFromInterface => self.remove_route_from_interface(cont, chain).await,
            Step::AddRouteToSecondaryTable => self.route_in_secondary_table(cont, chain, true).await,
            Step::RemoveRouteFromSecondaryTable => self.route_in_secondary_table(cont, chain, false).await,
            Step::SetConfig => self.set_config(cont, chain).await,
            Step::TetherInterface => self.tether_interface(cont, chain).await,
            Step::UntetherInterface => self.untether_interface(cont, chain).await,
            Step::AddRouteToLocalNetwork => self.add_route_to_local_network(cont, chain).await,
            Step::RemoveRouteFromLocalNetwork => self.remove_route_from_local_network(cont, chain).await,
            Step::SetIpForwardingEnabled => self.set_ip_forwarding_enabled(cont, chain).await,
            Step::SetIpForwardingDisabled => self.set_ip_forwarding_disabled(cont, chain).await,
            Step::StartTethering => self.start_tethering(cont, chain).await,
            Step::StopTethering => self.stop_tethering(cont, chain).await,
            Step::SetDnsForwarders => self.set_dns_forwarders(cont, chain).await,
            Step::EnableNat => self.enable_nat(cont, chain).await,
            Step::DisableNat => self.disable_nat(cont, chain).await,
            Step::CleanUpStream => self.clean_up_stream(cont, chain).await,
            Step::CreateUpStream => self.create_up_stream(cont, chain).await,
            Step::CleanUpStreamInterfaceForwarding => self.clean_up_stream_interface_forwarding(cont, chain).await,
            Step::CreateUpStreamInterfaceForwarding => self.create_up_stream_interface_forwarding(cont, chain).await,
            Step::AddIpv6TetheringInterfaces => self.add_ipv6_tethering_interfaces(cont, chain),
            Step::RemoveIpv6TetheringInterfaces => self.remove_ipv6_tethering_interfaces(cont, chain),
            Step::UpdateIpv6Tethering => self.update_ipv6_tethering(cont, chain).await,
            Step::StopIpv6Tethering => self.stop_ipv6_tethering(cont, chain).await,
            Step::DefaultAsyncSuccess => self.default_async_success(cont, chain),
            Step::UsbTetheringSuccess | Step::WifiTetheringSuccess => self.tethering_success(cont, chain),
            Step::UpdateUpStreamSuccess => self.update_up_stream_success(cont, chain),
        }
    }

    async fn clear_addr_for_interface(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let res = self.platform.netd.interface_clear_addrs(&chain.params().ifname).await;
        cont.finish(report("clearAddrForInterface", &res))
    }

    async fn create_network_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let net_id = chain.params().net_id;
        let network = self.platform.netd.network_create_physical(net_id, PERMISSION_NONE).await;
        let cache = self.platform.resolver.create_network_cache(net_id).await;

        let ok = report("createNetwork physical", &network) & report("createNetwork cache", &cache);
        // Leave nothing half-created behind
        if !ok && network.is_ok() {
            let res = self.platform.netd.network_destroy(net_id).await;
            self.tolerate("createNetwork cleanup", &res);
        }
        if !ok && cache.is_ok() {
            let res = self.platform.resolver.destroy_network_cache(net_id).await;
            self.tolerate("createNetwork cache cleanup", &res);
        }
        cont.finish(ok)
    }

    async fn destroy_network_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let net_id = chain.params().net_id;
        let network = self.platform.netd.network_destroy(net_id).await;
        let cache = self.platform.resolver.destroy_network_cache(net_id).await;
        self.tolerate("destroyNetwork cache", &cache);
        cont.finish(report("destroyNetwork", &network))
    }

    async fn set_ipv6_addr_gen_mode(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let mode = self.config.ipv6_addr_gen_mode;
        let res = self
            .platform
            .netd
            .set_ipv6_addr_gen_mode(&chain.params().ifname, mode)
            .await;
        self.tolerate("setIpv6AddrGenMode", &res);
        cont.proceed()
    }

    async fn set_ipv6_privacy_extensions(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .interface_set_ipv6_privacy_extensions(&params.ifname, params.enable)
            .await;
        self.tolerate("setIpv6PrivacyExtensions", &res);
        cont.proceed()
    }

    async fn set_ipv6_enabled(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .interface_set_enable_ipv6(&params.ifname, params.enable)
            .await;
        cont.finish(report("setIpv6Enabled", &res))
    }

    /// Wake-up packet marking, Wi-Fi only. Never fails the chain.
    async fn wakeup_interface(&self, cont: Continuation, chain: &mut CommandChain, add: bool) -> StepOutcome {
        let params = chain.params();
        if params.network_type != NetworkType::WIFI {
            log::debug!("Wakeup marks ignored for network type {}", params.network_type);
            return cont.proceed();
        }

        let netd = &self.platform.netd;
        let prefix = format!("iface:{}", params.ifname);
        let res = if add {
            netd.wakeup_add_interface(&params.ifname, &prefix, WAKEUP_PACKET_MARK, WAKEUP_PACKET_MASK)
                .await
        } else {
            netd.wakeup_del_interface(&params.ifname, &prefix, WAKEUP_PACKET_MARK, WAKEUP_PACKET_MASK)
                .await
        };
        self.tolerate(if add { "wakeupAddInterface" } else { "wakeupDelInterface" }, &res);
        cont.proceed()
    }

    async fn add_interface_to_network_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .network_add_interface(params.net_id, &params.ifname)
            .await;
        cont.finish(report("addInterfaceToNetwork", &res))
    }

    async fn remove_interface_to_network_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .network_remove_interface(params.net_id, &params.ifname)
            .await;
        cont.finish(report("removeInterfaceToNetwork", &res))
    }

    async fn set_mtu_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self.platform.netd.interface_set_mtu(&params.ifname, params.mtu).await;
        cont.finish(report("setMtu", &res))
    }

    async fn set_default_network_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let res = self.platform.netd.network_set_default(chain.params().net_id).await;
        cont.finish(report("setDefaultNetwork", &res))
    }

    async fn setup_prefix64_discovery_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let resolver = &self.platform.resolver;
        let res = if params.enable {
            resolver.start_prefix64_discovery(params.net_id).await
        } else {
            resolver.stop_prefix64_discovery(params.net_id).await
        };
        cont.finish(report("setupPrefix64Discovery", &res))
    }

    async fn add_default_route_to_network(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params_mut();
        params.loop_index = 0;
        while params.loop_index < params.gateways.len() {
            let gateway = &params.gateways[params.loop_index];
            let destination = ipv6::default_route_for(gateway);
            let res = self
                .platform
                .netd
                .network_add_route(params.net_id, &params.ifname, destination, gateway)
                .await;
            if !report("addDefaultRouteToNetwork", &res) {
                return cont.fail();
            }
            params.loop_index += 1;
        }
        cont.proceed()
    }

    /// Routes may already be gone; failures are logged only
    async fn remove_default_route_step(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params_mut();
        params.loop_index = 0;
        while params.loop_index < params.gateways.len() {
            let gateway = &params.gateways[params.loop_index];
            let destination = ipv6::default_route_for(gateway);
            let res = self
                .platform
                .netd
                .network_remove_route(params.net_id, &params.ifname, destination, gateway)
                .await;
            self.tolerate("removeDefaultRoute", &res);
            params.loop_index += 1;
        }
        cont.proceed()
    }

    async fn set_interface_dns(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let defaults = &self.config.resolver;

        let mut domains = Vec::new();
        if !params.domain.is_empty() {
            domains.push(params.domain.clone());
        }

        let resolver_params = ResolverParams {
            net_id: params.net_id,
            sample_validity_secs: defaults.sample_validity_secs,
            success_threshold: defaults.success_threshold_percent,
            min_samples: defaults.min_samples,
            max_samples: defaults.max_samples,
            base_timeout_ms: defaults.base_timeout_ms,
            retry_count: defaults.retry_count,
            servers: params.dnses.clone(),
            domains,
            tls_name: String::new(),
            tls_servers: Vec::new(),
        };

        let res = self.platform.resolver.set_resolver_configuration(&resolver_params).await;
        let ok = report("setInterfaceDns", &res);
        if !ok {
            chain.result_mut().reason = "Resolver command failed".to_string();
        }
        cont.finish(ok)
    }

    /// `ip/prefixLength` route: on-link when no gateway, legacy route otherwise
    fn host_route(params: &NetworkParams) -> Option<String> {
        let ip = if params.gateway.is_empty() {
            ipv6::subnet_ip(&params.ip, params.prefix_length)?
        } else {
            params.ip.clone()
        };
        Some(format!("{}/{}", ip, params.prefix_length))
    }

    async fn add_route_to_interface(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let netd = &self.platform.netd;

        let res = match Self::host_route(params) {
            None => Err(NetdError::service(Errno::EINVAL)),
            Some(destination) if params.gateway.is_empty() => {
                netd.network_add_route(params.net_id, &params.ifname, &destination, "")
                    .await
            }
            Some(destination) => {
                netd.network_add_legacy_route(params.net_id, &params.ifname, &destination, &params.gateway, 0)
                    .await
            }
        };

        match res {
            Err(err) if err.is(Errno::EEXIST) => {
                log::debug!("addRouteToInterface: route exists, ignored");
                cont.proceed()
            }
            Err(err) => {
                log::warn!("addRouteToInterface: {}", err);
                chain.result_mut().reason = format!("addRoute() failed : {}", err.service_specific_code());
                cont.fail()
            }
            Ok(()) => cont.proceed(),
        }
    }

    async fn remove_route_from_interface(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let netd = &self.platform.netd;

        let res = match Self::host_route(params) {
            None => Err(NetdError::service(Errno::EINVAL)),
            Some(destination) if params.gateway.is_empty() => {
                netd.network_remove_route(params.net_id, &params.ifname, &destination, "")
                    .await
            }
            Some(destination) => {
                netd.network_remove_legacy_route(params.net_id, &params.ifname, &destination, &params.gateway, 0)
                    .await
            }
        };

        match res {
            Err(err) => {
                log::warn!("removeRouteFromInterface: {}", err);
                chain.result_mut().reason = format!("removeRoute() failed : {}", err.service_specific_code());
                cont.fail()
            }
            Ok(()) => cont.proceed(),
        }
    }

    async fn route_in_secondary_table(&self, cont: Continuation, chain: &mut CommandChain, add: bool) -> StepOutcome {
        let params = chain.params();
        let netd = &self.platform.netd;
        let destination = format!("{}/{}", params.ip, params.prefix);

        let res = if add {
            netd.network_add_route(params.net_id, &params.ifname, &destination, &params.gateway)
                .await
        } else {
            netd.network_remove_route(params.net_id, &params.ifname, &destination, &params.gateway)
                .await
        };
        cont.finish(report(
            if add { "addRouteToSecondaryTable" } else { "removeRouteFromSecondaryTable" },
            &res,
        ))
    }

    async fn set_config(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let netd = &self.platform.netd;

        let mut cfg = match netd.interface_get_cfg(&params.ifname).await {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("setConfig: unable to get interface {}: {}", params.ifname, err);
                return cont.fail();
            }
        };

        match requested_ipv4(&params.ip) {
            None => {
                cfg.ipv4_addr.clear();
                cfg.prefix_length = 0;
            }
            Some(Some(addr)) => {
                cfg.ipv4_addr = addr.to_string();
                cfg.prefix_length = prefix_number(&params.prefix);
            }
            Some(None) => {}
        }

        match params.link.as_str() {
            IF_STATE_UP | IF_STATE_DOWN => cfg.flags.push(params.link.clone()),
            other => {
                log::warn!("setConfig: unknown link config {:?}", other);
                return cont.fail();
            }
        }

        let res = netd.interface_set_cfg(&cfg).await;
        cont.finish(report("setConfig", &res))
    }

    async fn tether_interface(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let res = self.platform.netd.tether_interface_add(&chain.params().ifname).await;
        cont.finish(report("tetherInterface", &res))
    }

    async fn untether_interface(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let res = self.platform.netd.tether_interface_remove(&chain.params().ifname).await;
        cont.finish(report("untetherInterface", &absent_ok("untetherInterface", res)))
    }

    async fn add_route_to_local_network(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let netd = &self.platform.netd;

        let Some(network) = ipv6::ipv4_network_addr(&params.ip, &params.prefix) else {
            log::warn!("addRouteToLocalNetwork: invalid address {}/{}", params.ip, params.prefix);
            return cont.fail();
        };
        let route = format!("{}/{}", network, params.prefix.trim());

        let res = netd.network_add_interface(LOCAL_NET_ID, &params.internal_ifname).await;
        if !report("addRouteToLocalNetwork interface", &res) {
            return cont.fail();
        }

        let res = netd
            .network_add_route(LOCAL_NET_ID, &params.internal_ifname, &route, "")
            .await;
        cont.finish(report("addRouteToLocalNetwork route", &res))
    }

    async fn remove_route_from_local_network(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let res = self
            .platform
            .netd
            .network_remove_interface(LOCAL_NET_ID, &chain.params().ifname)
            .await;
        let res = absent_ok("removeRouteFromLocalNetwork", res);
        cont.finish(report("removeRouteFromLocalNetwork", &res))
    }

    async fn set_ip_forwarding_enabled(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let netd = &self.platform.netd;

        let res = netd.ipfwd_enable_forwarding(TETHERING_REQUESTER).await;
        if !report("setIpForwardingEnabled", &res) {
            return cont.fail();
        }

        if params.external_ifname == self.config.dummy_upstream_ifname {
            log::debug!("setIpForwardingEnabled: ignore interface {}", params.external_ifname);
            return cont.proceed();
        }

        let res = netd
            .ipfwd_add_interface_forward(&params.internal_ifname, &params.external_ifname)
            .await;
        cont.finish(report("setIpForwardingEnabled interface", &res))
    }

    async fn set_ip_forwarding_disabled(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let netd = &self.platform.netd;

        // Forwarding stays on while another interface is tethered
        if !self.others_tethered(params).await {
            let res = netd.ipfwd_disable_forwarding(TETHERING_REQUESTER).await;
            if !report("setIpForwardingDisabled", &res) {
                return cont.fail();
            }
        }

        if params.external_ifname == self.config.dummy_upstream_ifname {
            log::debug!("setIpForwardingDisabled: ignore interface {}", params.external_ifname);
            return cont.proceed();
        }

        let res = netd
            .ipfwd_remove_interface_forward(&params.internal_ifname, &params.external_ifname)
            .await;
        self.tolerate("setIpForwardingDisabled interface", &res);
        cont.proceed()
    }

    async fn start_tethering(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let netd = &self.platform.netd;

        if netd.tether_is_enabled().await.unwrap_or(false) {
            log::debug!("startTethering: already running");
            return cont.proceed();
        }

        let res = netd.tether_start(&dhcp_ranges(chain.params())).await;
        cont.finish(report("startTethering", &res))
    }

    /// Whether an interface other than the one this request tethers is still tethered
    async fn others_tethered(&self, params: &NetworkParams) -> bool {
        let tethered = self.platform.netd.tether_interface_list().await.unwrap_or_default();
        tethered
            .iter()
            .any(|i| *i != params.ifname && *i != params.internal_ifname)
    }

    async fn stop_tethering(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        if self.others_tethered(chain.params()).await {
            log::debug!("stopTethering: other interfaces still tethered");
            return cont.proceed();
        }

        let res = self.platform.netd.tether_stop().await;
        cont.finish(report("stopTethering", &res))
    }

    async fn set_dns_forwarders(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let servers: Vec<String> = [&params.dns1, &params.dns2]
            .into_iter()
            .filter(|dns| !dns.is_empty())
            .cloned()
            .collect();

        let res = self.platform.netd.tether_dns_set(params.net_id, &servers).await;
        cont.finish(report("setDnsForwarders", &res))
    }

    async fn enable_nat(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .tether_add_forward(&params.internal_ifname, &params.external_ifname)
            .await;
        cont.finish(report("enableNat", &res))
    }

    async fn disable_nat(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .tether_remove_forward(&params.internal_ifname, &params.external_ifname)
            .await;
        cont.finish(report("disableNat", &absent_ok("disableNat", res)))
    }

    /// The previous upstream may have no NAT rule; failures are logged only
    async fn clean_up_stream(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .tether_remove_forward(&params.pre_internal_ifname, &params.pre_external_ifname)
            .await;
        self.tolerate("cleanUpStream", &res);
        cont.proceed()
    }

    async fn create_up_stream(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        let res = self
            .platform
            .netd
            .tether_add_forward(&params.cur_internal_ifname, &params.cur_external_ifname)
            .await;
        cont.finish(report("createUpStream", &res))
    }

    async fn clean_up_stream_interface_forwarding(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        if params.pre_external_ifname == self.config.dummy_upstream_ifname {
            log::debug!("cleanUpStreamInterfaceForwarding: ignore interface {}", params.pre_external_ifname);
            return cont.proceed();
        }

        let res = self
            .platform
            .netd
            .ipfwd_remove_interface_forward(&params.pre_internal_ifname, &params.pre_external_ifname)
            .await;
        self.tolerate("cleanUpStreamInterfaceForwarding", &res);
        cont.proceed()
    }

    async fn create_up_stream_interface_forwarding(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params();
        if params.cur_external_ifname == self.config.dummy_upstream_ifname {
            log::debug!("createUpStreamInterfaceForwarding: ignore interface {}", params.cur_external_ifname);
            return cont.proceed();
        }

        let res = self
            .platform
            .netd
            .ipfwd_add_interface_forward(&params.cur_internal_ifname, &params.cur_external_ifname)
            .await;
        cont.finish(report("createUpStreamInterfaceForwarding", &res))
    }

    fn add_ipv6_tethering_interfaces(&mut self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let internal = &chain.params().internal_ifname;
        if !self.ipv6.interfaces.contains(internal) {
            self.ipv6.interfaces.push(internal.clone());
        }
        cont.proceed()
    }

    fn remove_ipv6_tethering_interfaces(&mut self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let internal = &chain.params().internal_ifname;
        self.ipv6.interfaces.retain(|i| i != internal);
        cont.proceed()
    }

    /// Compose and write the radvd config for the first IPv6 tethering interface.
    /// False when there is no IPv6 DNS to announce or the file cannot be written.
    fn compose_ipv6_tether_conf(&self, iface: &str, prefix: &str, dns_count: usize) -> bool {
        let props = &self.platform.properties;
        let servers: Vec<String> = (1..=dns_count)
            .map(|i| props.property_or(&format!("net.dns{}", i), FALLBACK_DNS))
            .filter(|dns| ipv6::is_ipv6(dns))
            .collect();

        if servers.is_empty() {
            log::debug!("Not enabling IPv6 tethering, no IPv6 DNS");
            return false;
        }

        let contents = ipv6::radvd_config(iface, prefix, &servers);
        let path = &self.config.radvd_conf_path;
        match ipv6::write_radvd_config(path, &contents, self.config.radvd_conf_owner) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Cannot write {}: {}", path.display(), err);
                false
            }
        }
    }

    async fn update_ipv6_tethering(&mut self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params_mut();

        let external = if params.external_ifname.is_empty() {
            &params.cur_external_ifname
        } else {
            &params.external_ifname
        };

        if *external == self.config.ipv6_tethering_excluded_upstream {
            log::debug!("No IPv6 tethering with {} as upstream", external);
            return cont.proceed();
        }

        if params.ipv6_prefix.is_empty() || params.dnses.is_empty() {
            log::debug!(
                "No IPv6 tethering, missing {}",
                if params.dnses.is_empty() { "DNS" } else { "prefix" }
            );
            return cont.proceed();
        }

        if self.ipv6.interfaces.is_empty() || self.ipv6.enabled {
            log::debug!(
                "No IPv6 tethering, {}",
                if self.ipv6.enabled { "already active" } else { "no interface available" }
            );
            return cont.proceed();
        }

        let iface = self.ipv6.interfaces[0].clone();
        log::info!("Enabling IPv6 tethering for {} via {} ({})", external, iface, params.ipv6_prefix);

        if !self.compose_ipv6_tether_conf(&iface, &params.ipv6_prefix, params.dnses.len()) {
            return cont.proceed();
        }

        self.platform.properties.set_property("ctl.start", "radvd");
        self.ipv6.enabled = true;

        params.loop_index = 0;
        while params.loop_index < params.ipv6_routes.len() {
            let route = &params.ipv6_routes[params.loop_index];
            let res = self
                .platform
                .netd
                .network_add_route(LOCAL_NET_ID, &iface, route, "")
                .await;
            if !report("addIpv6RouteToLocalNetwork", &res) {
                return cont.fail();
            }
            params.loop_index += 1;
        }
        cont.proceed()
    }

    async fn stop_ipv6_tethering(&mut self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params_mut();

        if params.ipv6_prefix.is_empty() || self.ipv6.interfaces.is_empty() || !self.ipv6.enabled {
            return cont.proceed();
        }

        let iface = self.ipv6.interfaces[0].clone();
        log::info!("Disabling IPv6 tethering on {}", iface);
        self.platform.properties.set_property("ctl.stop", "radvd");
        self.ipv6.enabled = false;

        params.loop_index = 0;
        while params.loop_index < params.ipv6_routes.len() {
            let route = &params.ipv6_routes[params.loop_index];
            let res = self
                .platform
                .netd
                .network_remove_route(LOCAL_NET_ID, &iface, route, "")
                .await;
            self.tolerate("removeIpv6LocalNetworkRoute", &res);
            params.loop_index += 1;
        }
        cont.proceed()
    }

    fn default_async_success(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        chain.result_mut().ret = true;
        self.post(chain.params().id, chain.result().clone());
        cont.proceed()
    }

    fn tethering_success(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let enable = chain.params().enable;
        let result = chain.result_mut();
        result.enable = Some(enable);
        result.result = true;
        self.post(chain.params().id, chain.result().clone());
        cont.proceed()
    }

    fn update_up_stream_success(&self, cont: Continuation, chain: &mut CommandChain) -> StepOutcome {
        let params = chain.params().clone();
        let result = chain.result_mut();
        result.cur_external_ifname = Some(params.cur_external_ifname);
        result.cur_internal_ifname = Some(params.cur_internal_ifname);
        self.post(params.id, chain.result().clone());
        cont.proceed()
    }
}

/// Wi-Fi DHCP range, plus the USB range when both ends are given
fn dhcp_ranges(params: &NetworkParams) -> Vec<String> {
    let mut ranges = vec![params.wifi_start_ip.clone(), params.wifi_end_ip.clone()];
    if !params.usb_start_ip.is_empty() && !params.usb_end_ip.is_empty() {
        ranges.push(params.usb_start_ip.clone());
        ranges.push(params.usb_end_ip.clone());
    }
    ranges
}
