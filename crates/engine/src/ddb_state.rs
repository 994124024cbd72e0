//! DocumentDB lifecycle state machine.
//!
//! The main axis is linear (with an optional redo-reprocess loop before
//! live config is applied):
//!
//! ```text
//! Construct -> Load -> ReplayTransactionLog -> [RedoReprocess] ->
//!     ApplyLiveConfig -> [Reprocess] -> Online -> Shutdown -> Dead
//! ```
//!
//! Orthogonal to it sits the config state (`Ok` / `NeedRestart`), latched
//! when an attribute-aspect change arrives that cannot be applied hot.
//!
//! Transitions happen on the master thread; a concurrent `close()` wins
//! every race because each `enter_*` guard refuses once the closed latch
//! is set.

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// The lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Under construction.
    Construct,
    /// Loading persisted structures.
    Load,
    /// Replaying the transaction log.
    ReplayTransactionLog,
    /// Re-running reprocessing discovered during replay.
    RedoReprocess,
    /// Applying the live (non-replay) config.
    ApplyLiveConfig,
    /// Reprocessing after a live config change.
    Reprocess,
    /// Serving.
    Online,
    /// Shutting down.
    Shutdown,
    /// Gone.
    Dead,
}

impl State {
    /// Stable name for status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Construct => "CONSTRUCT",
            State::Load => "LOAD",
            State::ReplayTransactionLog => "REPLAY_TRANSACTION_LOG",
            State::RedoReprocess => "REDO_REPROCESS",
            State::ApplyLiveConfig => "APPLY_LIVE_CONFIG",
            State::Reprocess => "REPROCESS",
            State::Online => "ONLINE",
            State::Shutdown => "SHUTDOWN",
            State::Dead => "DEAD",
        }
    }
}

/// Whether the active config can keep running this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    /// Config fully applied.
    Ok,
    /// An attribute-aspect change was delayed; a restart is needed to
    /// apply it.
    NeedRestart,
}

impl ConfigState {
    /// Stable name for status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigState::Ok => "OK",
            ConfigState::NeedRestart => "NEED_RESTART",
        }
    }
}

struct Inner {
    state: State,
    config_state: ConfigState,
    delayed_config: bool,
}

/// Shared, thread-safe lifecycle state.
pub struct DdbState {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for DdbState {
    fn default() -> Self {
        Self::new()
    }
}

impl DdbState {
    /// Start in `Construct`.
    pub fn new() -> Self {
        DdbState {
            inner: Mutex::new(Inner {
                state: State::Construct,
                config_state: ConfigState::Ok,
                delayed_config: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Current config state.
    pub fn config_state(&self) -> ConfigState {
        self.inner.lock().config_state
    }

    /// True once shutdown has begun.
    pub fn closed(&self) -> bool {
        self.inner.lock().state >= State::Shutdown
    }

    /// Reconfiguration is allowed from ApplyLiveConfig until shutdown.
    pub fn allow_reconfig(&self) -> bool {
        let inner = self.inner.lock();
        inner.state >= State::ApplyLiveConfig && inner.state < State::Shutdown
    }

    /// TLS/config pruning is allowed only while online.
    pub fn allow_prune(&self) -> bool {
        self.inner.lock().state == State::Online
    }

    fn enter(&self, target: State, allowed_from: &[State]) -> bool {
        let mut inner = self.inner.lock();
        if inner.state >= State::Shutdown && target < State::Shutdown {
            return false;
        }
        debug_assert!(
            allowed_from.contains(&inner.state),
            "illegal transition {} -> {}",
            inner.state.as_str(),
            target.as_str()
        );
        debug!(from = inner.state.as_str(), to = target.as_str(), "state transition");
        inner.state = target;
        self.cond.notify_all();
        true
    }

    /// Construct -> Load.
    pub fn enter_load_state(&self) -> bool {
        self.enter(State::Load, &[State::Construct])
    }

    /// Load -> ReplayTransactionLog.
    pub fn enter_replay_transaction_log_state(&self) -> bool {
        self.enter(State::ReplayTransactionLog, &[State::Load])
    }

    /// ReplayTransactionLog -> RedoReprocess.
    pub fn enter_redo_reprocess_state(&self) -> bool {
        self.enter(State::RedoReprocess, &[State::ReplayTransactionLog])
    }

    /// ReplayTransactionLog / RedoReprocess -> ApplyLiveConfig.
    pub fn enter_apply_live_config_state(&self) -> bool {
        self.enter(
            State::ApplyLiveConfig,
            &[State::ReplayTransactionLog, State::RedoReprocess],
        )
    }

    /// ApplyLiveConfig -> Reprocess.
    pub fn enter_reprocess_state(&self) -> bool {
        self.enter(State::Reprocess, &[State::ApplyLiveConfig])
    }

    /// ApplyLiveConfig / Reprocess -> Online.
    pub fn enter_online_state(&self) -> bool {
        self.enter(State::Online, &[State::ApplyLiveConfig, State::Reprocess])
    }

    /// Any state -> Shutdown. Idempotent.
    pub fn enter_shutdown_state(&self) {
        let mut inner = self.inner.lock();
        if inner.state < State::Shutdown {
            debug!(from = inner.state.as_str(), "state transition to SHUTDOWN");
            inner.state = State::Shutdown;
        }
        self.cond.notify_all();
    }

    /// Shutdown -> Dead.
    pub fn enter_dead_state(&self) {
        let mut inner = self.inner.lock();
        if inner.state < State::Dead {
            inner.state = State::Dead;
        }
        self.cond.notify_all();
    }

    /// Latch the need-restart config state and the delayed-config marker.
    pub fn set_config_state_need_restart(&self) {
        let mut inner = self.inner.lock();
        inner.config_state = ConfigState::NeedRestart;
        inner.delayed_config = true;
    }

    /// True while an attribute-aspect change is being delayed.
    pub fn delayed_config(&self) -> bool {
        self.inner.lock().delayed_config
    }

    /// Clear the delayed-config marker (the aspect change landed or went
    /// away).
    pub fn clear_delayed_config(&self) {
        let mut inner = self.inner.lock();
        inner.delayed_config = false;
        inner.config_state = ConfigState::Ok;
    }

    /// Block until the database is online or closed.
    pub fn wait_for_online_state(&self) {
        let mut inner = self.inner.lock();
        while inner.state < State::Online {
            self.cond.wait(&mut inner);
        }
    }
}
