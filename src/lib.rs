//! # gonk-netd - Network command orchestrator
//!
//! Turns high-level network requests (tethering, routing, DNS, network id
//! lifecycle) into ordered sequences of calls against a privileged network
//! controller, and reports exactly one result per request.
//!
//! ## Architecture
//!
//! - **NetIdManager**: interface name to network id, reference counted per network type
//! - **CommandChain**: fixed step list with a cursor, a failure handler and a settle-once protocol
//! - **NetworkUtils**: the orchestrator; immediate commands, the FIFO chain queue and every step
//! - **NetworkWorker**: the dedicated orchestrator thread, request decoding and result delivery
//! - **Controller traits**: `Netd`, `DnsResolver`, `DhcpClient`, `SystemProperties`,
//!   with `SimulatedNetd` as an in-memory backend
//!
//! ## Example
//!
//! ```no_run
//! use gonk_netd::{NetworkConfig, NetworkResultOptions, NetworkWorker, Platform, SimulatedNetd};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(SimulatedNetd::new().with_interfaces(&["wlan0"]));
//!     let worker = NetworkWorker::new(Platform::from_backend(backend), NetworkConfig::default())?;
//!
//!     worker.start(Arc::new(|result: &NetworkResultOptions| println!("{:?}", result)));
//!     worker.post_message(json!({ "id": 1, "cmd": "createNetwork", "ifname": "wlan0", "networkType": 0 }))?;
//!
//!     worker.dispatch_next(Duration::from_secs(1));
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod error;
pub mod command;
pub mod net_id_manager;
pub mod command_chain;
pub mod controller;
pub mod ipv6;
pub mod events;
pub mod network_utils;
pub mod worker;
pub mod simulated;

pub use types::*;
pub use error::{NetIdError, NetdError, WorkerError};
pub use command::NetworkCommand;
pub use net_id_manager::{NetIdInfo, NetIdManager};
pub use command_chain::{CommandChain, CommandResult, FailureHandler, Step};
pub use controller::{DhcpClient, DnsResolver, Netd, Platform, SystemProperties};
pub use events::{NetdEvent, NetdEventSink};
pub use network_utils::{NetworkUtils, OrchestratorStatistics};
pub use worker::{NetworkEventListener, NetworkWorker, WorkerStatistics};
pub use simulated::SimulatedNetd;
