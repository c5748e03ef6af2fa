//! Command chains - ordered multi-step network operations
//!
//! A chain binds one request's [`NetworkParams`] to a fixed list of [`Step`]s and an
//! optional [`FailureHandler`]. The orchestrator pulls steps one at a time; every
//! step receives a [`Continuation`] and must settle it exactly once, either
//! proceeding to the next step or failing the chain. Settling consumes the
//! continuation, and the chain rejects any outcome it did not hand out or has
//! already seen.

use crate::error::errno_description;
use crate::types::{NetworkParams, NetworkResultOptions};

/// One atomic controller operation (or local bookkeeping action) of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    // Interface and network lifecycle
    ClearAddrForInterface,
    CreateNetwork,
    DestroyNetwork,
    SetIpv6AddrGenMode,
    SetIpv6PrivacyExtensions,
    SetIpv6Enabled,
    WakeupAddInterface,
    WakeupDelInterface,
    AddInterfaceToNetwork,
    RemoveInterfaceToNetwork,
    SetMtu,
    SetDefaultNetwork,
    SetupPrefix64Discovery,

    // Routing and DNS
    AddDefaultRouteToNetwork,
    RemoveDefaultRoute,
    SetInterfaceDns,
    AddRouteToInterface,
    RemoveRouteFromInterface,
    AddRouteToSecondaryTable,
    RemoveRouteFromSecondaryTable,

    // Tethering
    SetConfig,
    TetherInterface,
    UntetherInterface,
    AddRouteToLocalNetwork,
    RemoveRouteFromLocalNetwork,
    SetIpForwardingEnabled,
    SetIpForwardingDisabled,
    StartTethering,
    StopTethering,
    SetDnsForwarders,
    EnableNat,
    DisableNat,

    // Upstream switching
    CleanUpStream,
    CreateUpStream,
    CleanUpStreamInterfaceForwarding,
    CreateUpStreamInterfaceForwarding,

    // IPv6 tethering
    AddIpv6TetheringInterfaces,
    RemoveIpv6TetheringInterfaces,
    UpdateIpv6Tethering,
    StopIpv6Tethering,

    // Terminal steps that post the result
    DefaultAsyncSuccess,
    UsbTetheringSuccess,
    WifiTetheringSuccess,
    UpdateUpStreamSuccess,
}

/// What happens to the request when one of its steps fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHandler {
    /// Post `ret = false`
    Default,
    /// Give the net id back, tear down a network netd already created, post `ret = false`
    CreateNetwork,
    /// Post the failure, then roll USB tethering back
    UsbTethering,
    /// Post the failure, then roll Wi-Fi tethering back
    WifiTethering,
    /// Post the failure only
    UpdateUpStream,
}

/// Verdict a step hands back through its continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Proceed,
    Fail,
}

/// Proof that a step settled its continuation.
///
/// Only [`Continuation`] can create one. It is `Copy` so the chain, not the type
/// system alone, is what rejects a second delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    chain: u64,
    index: usize,
    step: Step,
    flow: Flow,
}

impl StepOutcome {
    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn step(&self) -> Step {
        self.step
    }
}

/// Right to settle one dispatched step, spent by [`proceed`](Self::proceed) or
/// [`fail`](Self::fail).
#[must_use = "a step must settle its continuation"]
#[derive(Debug)]
pub struct Continuation {
    chain: u64,
    index: usize,
    step: Step,
    settled: bool,
}

impl Continuation {
    pub fn proceed(self) -> StepOutcome {
        self.settle(Flow::Proceed)
    }

    pub fn fail(self) -> StepOutcome {
        self.settle(Flow::Fail)
    }

    /// Proceed when `ok`, fail otherwise
    pub fn finish(self, ok: bool) -> StepOutcome {
        if ok {
            self.proceed()
        } else {
            self.fail()
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    fn settle(mut self, flow: Flow) -> StepOutcome {
        self.settled = true;
        StepOutcome {
            chain: self.chain,
            index: self.index,
            step: self.step,
            flow,
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if !self.settled {
            log::error!(
                "Step {:?} (#{}) of chain {} dropped its continuation",
                self.step, self.index, self.chain
            );
        }
    }
}

/// Misuse of the step protocol
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("chain {0} already has a step in flight")]
    StepInFlight(u64),

    #[error("chain {chain} has no step waiting to settle (outcome for step #{index})")]
    AlreadySettled { chain: u64, index: usize },

    #[error("outcome of chain {outcome_chain} delivered to chain {chain}")]
    ForeignOutcome { chain: u64, outcome_chain: u64 },
}

/// Lifecycle of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Created,
    Running(usize),
    Finished,
}

/// One in-flight multi-step operation
#[derive(Debug)]
pub struct CommandChain {
    id: u64,
    params: NetworkParams,
    steps: &'static [Step],

    /// -1 before the first dispatch, only ever increases
    cursor: isize,
    in_flight: bool,

    failure: Option<FailureHandler>,

    /// Step failures are logged and skipped instead of ending the chain
    best_effort: bool,

    /// Result accumulated across steps
    result: NetworkResultOptions,
}

impl CommandChain {
    pub fn new(id: u64, params: NetworkParams, steps: &'static [Step], failure: Option<FailureHandler>) -> Self {
        Self {
            id,
            params,
            steps,
            cursor: -1,
            in_flight: false,
            failure,
            best_effort: false,
            result: NetworkResultOptions::default(),
        }
    }

    /// Rollback chain: no failure handler, every step best-effort
    pub fn rollback(id: u64, params: NetworkParams, steps: &'static [Step]) -> Self {
        Self {
            best_effort: true,
            ..Self::new(id, params, steps, None)
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut NetworkParams {
        &mut self.params
    }

    pub fn result(&self) -> &NetworkResultOptions {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut NetworkResultOptions {
        &mut self.result
    }

    pub fn failure_handler(&self) -> Option<FailureHandler> {
        self.failure
    }

    pub fn is_best_effort(&self) -> bool {
        self.best_effort
    }

    pub fn steps(&self) -> &'static [Step] {
        self.steps
    }

    pub fn state(&self) -> ChainState {
        match self.cursor {
            c if c < 0 => ChainState::Created,
            c if (c as usize) < self.steps.len() => ChainState::Running(c as usize),
            _ => ChainState::Finished,
        }
    }

    /// Advance the cursor and hand out the step there, `None` once exhausted
    pub fn next_command(&mut self) -> Result<Option<(Step, Continuation)>, ChainError> {
        if self.in_flight {
            return Err(ChainError::StepInFlight(self.id));
        }
        if self.state() == ChainState::Finished {
            return Ok(None);
        }

        self.cursor += 1;
        let index = self.cursor as usize;
        let Some(step) = self.steps.get(index).copied() else {
            return Ok(None);
        };

        self.in_flight = true;
        Ok(Some((
            step,
            Continuation {
                chain: self.id,
                index,
                step,
                settled: false,
            },
        )))
    }

    /// Accept the outcome of the step in flight
    pub fn settle(&mut self, outcome: StepOutcome) -> Result<Flow, ChainError> {
        if outcome.chain != self.id {
            return Err(ChainError::ForeignOutcome {
                chain: self.id,
                outcome_chain: outcome.chain,
            });
        }
        if !self.in_flight || outcome.index as isize != self.cursor {
            return Err(ChainError::AlreadySettled {
                chain: self.id,
                index: outcome.index,
            });
        }

        self.in_flight = false;
        Ok(outcome.flow)
    }

    /// Give up the parameters and accumulated result
    pub fn into_parts(self) -> (NetworkParams, NetworkResultOptions) {
        (self.params, self.result)
    }
}

/// Success return code of immediate commands
pub const SUCCESS: i32 = 0;

/// What a command handler hands back to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Linux-style return code, 0 for success
    Code(i32),
    /// Fully populated result
    Result(NetworkResultOptions),
    /// A chain was queued and will post the result itself
    Pending,
}

impl CommandResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, CommandResult::Pending)
    }

    /// Result to post, `None` while pending
    pub fn into_result(self) -> Option<NetworkResultOptions> {
        match self {
            CommandResult::Code(code) => {
                let mut result = NetworkResultOptions {
                    error: code != SUCCESS,
                    result_code: Some(code),
                    ..Default::default()
                };
                if code != SUCCESS {
                    result.reason = errno_description(code).to_string();
                }
                Some(result)
            }
            CommandResult::Result(result) => Some(result),
            CommandResult::Pending => None,
        }
    }
}

impl From<NetworkResultOptions> for CommandResult {
    fn from(result: NetworkResultOptions) -> Self {
        CommandResult::Result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NetworkCommand;

    const TWO_STEPS: &[Step] = &[Step::SetMtu, Step::DefaultAsyncSuccess];

    fn chain(id: u64) -> CommandChain {
        CommandChain::new(id, NetworkParams::new(NetworkCommand::SetMtu), TWO_STEPS, Some(FailureHandler::Default))
    }

    #[test]
    fn test_cursor_walks_steps_in_order() {
        let mut chain = chain(1);
        assert_eq!(chain.state(), ChainState::Created);

        let (first, cont) = chain.next_command().unwrap().unwrap();
        assert_eq!(first, Step::SetMtu);
        assert_eq!(chain.state(), ChainState::Running(0));
        assert_eq!(chain.settle(cont.proceed()), Ok(Flow::Proceed));

        let (second, cont) = chain.next_command().unwrap().unwrap();
        assert_eq!(second, Step::DefaultAsyncSuccess);
        chain.settle(cont.proceed()).unwrap();

        assert!(chain.next_command().unwrap().is_none());
        assert_eq!(chain.state(), ChainState::Finished);
        assert!(chain.next_command().unwrap().is_none());
    }

    #[test]
    fn test_double_settle_rejected() {
        let mut chain = chain(1);
        let (_, cont) = chain.next_command().unwrap().unwrap();
        let outcome = cont.fail();

        assert_eq!(chain.settle(outcome), Ok(Flow::Fail));
        assert_eq!(
            chain.settle(outcome),
            Err(ChainError::AlreadySettled { chain: 1, index: 0 })
        );
    }

    #[test]
    fn test_foreign_outcome_rejected() {
        let mut a = chain(1);
        let mut b = chain(2);
        let (_, cont_a) = a.next_command().unwrap().unwrap();
        let (_, cont_b) = b.next_command().unwrap().unwrap();

        assert_eq!(
            b.settle(cont_a.proceed()),
            Err(ChainError::ForeignOutcome { chain: 2, outcome_chain: 1 })
        );
        assert_eq!(b.settle(cont_b.proceed()), Ok(Flow::Proceed));
    }

    #[test]
    fn test_no_dispatch_while_in_flight() {
        let mut chain = chain(5);
        let (_, cont) = chain.next_command().unwrap().unwrap();
        assert_eq!(chain.next_command().unwrap_err(), ChainError::StepInFlight(5));
        chain.settle(cont.finish(true)).unwrap();
        assert!(chain.next_command().unwrap().is_some());
    }

    #[test]
    fn test_rollback_is_best_effort() {
        let rollback = CommandChain::rollback(9, NetworkParams::new(NetworkCommand::SetWifiTethering), TWO_STEPS);
        assert!(rollback.is_best_effort());
        assert!(rollback.failure_handler().is_none());
    }

    #[test]
    fn test_command_result_codes() {
        let ok = CommandResult::Code(SUCCESS).into_result().unwrap();
        assert!(!ok.error);
        assert_eq!(ok.result_code, Some(0));
        assert!(ok.reason.is_empty());

        let failed = CommandResult::Code(-1).into_result().unwrap();
        assert!(failed.error);
        assert_eq!(failed.result_code, Some(-1));
        assert_eq!(failed.reason, errno_description(1));

        assert!(CommandResult::Pending.into_result().is_none());
        assert!(CommandResult::Pending.is_pending());
    }
}
