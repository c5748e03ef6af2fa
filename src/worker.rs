//! NetworkWorker - Thread boundary of the orchestrator
//!
//! Owns the dedicated `NetworkUtils` thread. Requests are decoded on the caller's
//! thread and handed over a channel; results come back over another channel and
//! are delivered to the registered listener on whichever thread pumps them.

use crate::controller::Platform;
use crate::error::WorkerError;
use crate::events::NetdEventSink;
use crate::network_utils::{NetworkUtils, OrchestratorStatistics, StatsHandle};
use crate::types::{NetworkConfig, NetworkParams, NetworkResultOptions};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// Name of the orchestrator thread
pub const WORKER_THREAD_NAME: &str = "NetworkUtils";

/// Receives every command result and every broadcast
pub trait NetworkEventListener: Send + Sync {
    fn on_result(&self, result: &NetworkResultOptions);
}

impl<F> NetworkEventListener for F
where
    F: Fn(&NetworkResultOptions) + Send + Sync,
{
    fn on_result(&self, result: &NetworkResultOptions) {
        self(result)
    }
}

enum WorkerMessage {
    Command(NetworkParams),
    SetDebug(bool),
}

/// Worker counters plus the orchestrator snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatistics {
    pub orchestrator: OrchestratorStatistics,
    pub messages_posted: u64,
    pub results_delivered: u64,
    /// Results that found no listener
    pub results_dropped: u64,
}

/// Front end of the orchestrator thread
pub struct NetworkWorker {
    requests: Option<mpsc::UnboundedSender<WorkerMessage>>,

    results_tx: Sender<NetworkResultOptions>,
    results: Receiver<NetworkResultOptions>,

    listener: RwLock<Option<Arc<dyn NetworkEventListener>>>,

    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,

    stats: StatsHandle,
    messages_posted: AtomicU64,
    results_delivered: AtomicU64,
    results_dropped: AtomicU64,
}

impl NetworkWorker {
    /// Spawn the orchestrator thread. It bootstraps netd before serving requests;
    /// requests posted meanwhile wait in the channel.
    pub fn new(platform: Platform, config: NetworkConfig) -> Result<Self, WorkerError> {
        let (results_tx, results) = channel::unbounded();
        let (requests, inbox) = mpsc::unbounded_channel();

        let utils = NetworkUtils::new(platform, config, results_tx.clone());
        let stats = utils.stats_handle();
        let shutdown = utils.shutdown_flag();

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(utils, inbox))?;

        log::info!("Network worker started");

        Ok(Self {
            requests: Some(requests),
            results_tx,
            results,
            listener: RwLock::new(None),
            thread: Some(thread),
            shutdown,
            stats,
            messages_posted: AtomicU64::new(0),
            results_delivered: AtomicU64::new(0),
            results_dropped: AtomicU64::new(0),
        })
    }

    /// Register the result listener. A second call while one is set is ignored.
    pub fn start(&self, listener: Arc<dyn NetworkEventListener>) {
        let mut slot = self.listener.write();
        if slot.is_some() {
            log::debug!("Result listener already registered");
            return;
        }
        *slot = Some(listener);
    }

    /// Drop the listener; results delivered from now on go nowhere
    pub fn shutdown(&self) {
        log::info!("Network worker listener cleared");
        *self.listener.write() = None;
    }

    pub fn has_listener(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Decode `options` and hand it to the orchestrator thread.
    ///
    /// A dictionary that does not decode, including one naming an unknown
    /// command, is rejected here and never reaches the thread.
    pub fn post_message(&self, options: serde_json::Value) -> Result<(), WorkerError> {
        let params = NetworkParams::from_value(options)?;
        log::debug!("Posting {} (id {})", params.cmd, params.id);
        self.send(WorkerMessage::Command(params))?;
        self.messages_posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Toggle parameter dumps on the orchestrator thread
    pub fn update_debug(&self, enabled: bool) -> Result<(), WorkerError> {
        self.send(WorkerMessage::SetDebug(enabled))
    }

    fn send(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        let requests = self.requests.as_ref().ok_or(WorkerError::NotRunning)?;
        requests.send(message).map_err(|_| WorkerError::NotRunning)
    }

    /// Sink that broadcasts controller events through the result path
    pub fn event_sink(&self) -> NetdEventSink {
        NetdEventSink::new(self.results_tx.clone())
    }

    /// Deliver every result already waiting. Returns how many were handled.
    pub fn dispatch_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok(result) = self.results.try_recv() {
            self.deliver(&result);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for one result and deliver it
    pub fn dispatch_next(&self, timeout: Duration) -> bool {
        match self.results.recv_timeout(timeout) {
            Ok(result) => {
                self.deliver(&result);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn deliver(&self, result: &NetworkResultOptions) {
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => {
                listener.on_result(result);
                self.results_delivered.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                log::debug!("No listener, dropping result {}", result.id);
                self.results_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_stats(&self) -> WorkerStatistics {
        WorkerStatistics {
            orchestrator: self.stats.get_stats(),
            messages_posted: self.messages_posted.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for NetworkWorker {
    fn drop(&mut self) {
        // Closing the request channel lets the thread drain its queue and exit;
        // the flag releases a bootstrap still waiting for netd
        self.shutdown.store(true, Ordering::Relaxed);
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Network worker thread panicked");
            }
        }
        log::info!("Network worker stopped");
    }
}

fn run_worker(mut utils: NetworkUtils, mut inbox: mpsc::UnboundedReceiver<WorkerMessage>) {
    let shutdown = utils.shutdown_flag();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Cannot build worker runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async move {
        if !utils.bootstrap().await {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("Worker dropped before netd came up");
                utils.stop_netd();
                return;
            }
            log::warn!("netd did not come up, serving requests anyway");
        }

        loop {
            // Requests already waiting run between two chain steps
            match inbox.try_recv() {
                Ok(message) => {
                    handle_message(&mut utils, message).await;
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            if utils.has_pending_step() {
                utils.advance().await;
                continue;
            }

            match inbox.recv().await {
                Some(message) => handle_message(&mut utils, message).await,
                None => break,
            }
        }

        if utils.has_pending_step() {
            log::info!("Finishing {} queued chain(s) before exit", utils.pending_chains());
            utils.run_until_idle().await;
        }
        utils.stop_netd();
    });
}

async fn handle_message(utils: &mut NetworkUtils, message: WorkerMessage) {
    match message {
        WorkerMessage::Command(params) => utils.execute_command(params).await,
        WorkerMessage::SetDebug(enabled) => utils.set_debug(enabled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedNetd;
    use nix::errno::Errno;
    use parking_lot::Mutex;
    use serde_json::json;

    fn worker() -> (Arc<SimulatedNetd>, NetworkWorker) {
        let netd = Arc::new(SimulatedNetd::new().with_interfaces(&["wlan0", "rmnet0"]));
        let worker = NetworkWorker::new(Platform::from_backend(netd.clone()), NetworkConfig::default()).unwrap();
        (netd, worker)
    }

    fn collector() -> (Arc<Mutex<Vec<NetworkResultOptions>>>, Arc<dyn NetworkEventListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn NetworkEventListener> =
            Arc::new(move |result: &NetworkResultOptions| sink.lock().push(result.clone()));
        (seen, listener)
    }

    fn pump(worker: &NetworkWorker, seen: &Mutex<Vec<NetworkResultOptions>>, count: usize) {
        while seen.lock().len() < count {
            assert!(worker.dispatch_next(Duration::from_secs(5)), "timed out waiting for results");
        }
    }

    #[test]
    fn test_invalid_message_rejected_synchronously() {
        let (netd, worker) = worker();

        let err = worker.post_message(json!({ "id": 1, "cmd": "rebootModem" })).unwrap_err();
        assert!(matches!(err, WorkerError::Decode(_)));
        assert!(worker.post_message(json!({ "id": 2 })).is_err());
        assert_eq!(worker.get_stats().messages_posted, 0);

        drop(worker);
        assert_eq!(netd.call_count("interface_set_mtu"), 0);
    }

    #[test]
    fn test_results_reach_listener() {
        let (_netd, worker) = worker();
        let (seen, listener) = collector();
        worker.start(listener);

        worker
            .post_message(json!({ "id": 10, "cmd": "createNetwork", "ifname": "wlan0", "networkType": 0 }))
            .unwrap();
        worker
            .post_message(json!({ "id": 11, "cmd": "getNetId", "ifname": "wlan0" }))
            .unwrap();
        pump(&worker, &seen, 2);

        // The immediate getNetId may overtake the queued chain
        let results = seen.lock();
        let created = results.iter().find(|r| r.id == 10).unwrap();
        assert!(created.ret);
        let net_id = results.iter().find(|r| r.id == 11).unwrap();
        assert_eq!(net_id.net_id.as_deref(), Some("100"));
        assert_eq!(worker.get_stats().results_delivered, 2);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (_netd, worker) = worker();
        let (first, listener) = collector();
        let (second, other) = collector();

        worker.start(listener);
        worker.start(other);
        worker.post_message(json!({ "id": 1, "cmd": "getInterfaces" })).unwrap();
        pump(&worker, &first, 1);

        assert!(second.lock().is_empty());
    }

    #[test]
    fn test_shutdown_drops_results() {
        let (_netd, worker) = worker();
        let (seen, listener) = collector();
        worker.start(listener);
        worker.shutdown();
        assert!(!worker.has_listener());

        worker.post_message(json!({ "id": 1, "cmd": "getTetheringStatus" })).unwrap();
        assert!(worker.dispatch_next(Duration::from_secs(5)));

        assert!(seen.lock().is_empty());
        assert_eq!(worker.get_stats().results_dropped, 1);
    }

    #[test]
    fn test_events_broadcast_through_worker() {
        let (netd, worker) = worker();
        let (seen, listener) = collector();
        worker.start(listener);
        netd.attach_events(worker.event_sink());

        netd.add_interface("rndis0");
        pump(&worker, &seen, 1);

        let results = seen.lock();
        assert!(results[0].broadcast);
        assert_eq!(results[0].reason, "Iface added rndis0");
    }

    #[test]
    fn test_drop_while_netd_unreachable() {
        let netd = Arc::new(SimulatedNetd::new());
        netd.fail_on("is_alive", Errno::ECONNREFUSED);
        let config = NetworkConfig {
            netd_connect_retry_ms: 10,
            ..Default::default()
        };
        let worker = NetworkWorker::new(Platform::from_backend(netd.clone()), config).unwrap();
        worker.post_message(json!({ "id": 1, "cmd": "getInterfaces" })).unwrap();

        let (done_tx, done_rx) = channel::bounded(1);
        std::thread::spawn(move || {
            drop(worker);
            let _ = done_tx.send(());
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
        assert_eq!(netd.call_count("interface_get_list"), 0);
    }

    #[test]
    fn test_update_debug_reaches_worker() {
        let (_netd, worker) = worker();
        assert!(worker.update_debug(true).is_ok());
    }
}
