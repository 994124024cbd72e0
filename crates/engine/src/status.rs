//! Externally visible health snapshot.

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    /// Fully up.
    Up,
    /// Functioning but degraded or still initializing.
    Partial,
    /// Not serving.
    Down,
}

impl StatusState {
    /// Stable name for reporting.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Up => "UPOK",
            StatusState::Partial => "PARTIAL",
            StatusState::Down => "DOWN",
        }
    }
}

/// Snapshot of a DocumentDB's health.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Component name, e.g. `documentdb:music`.
    pub component: String,
    /// Coarse classification.
    pub state: StatusState,
    /// The lifecycle state's name.
    pub internal_state: String,
    /// The config state's name.
    pub internal_config_state: String,
    /// Progress percentage during replay/reprocess.
    pub progress: Option<f32>,
    /// Human-readable detail.
    pub message: String,
}

impl StatusReport {
    /// A report with no progress and no message.
    pub fn new(
        component: impl Into<String>,
        state: StatusState,
        internal_state: impl Into<String>,
        internal_config_state: impl Into<String>,
    ) -> Self {
        StatusReport {
            component: component.into(),
            state,
            internal_state: internal_state.into(),
            internal_config_state: internal_config_state.into(),
            progress: None,
            message: String::new(),
        }
    }

    /// Attach a progress percentage.
    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Attach a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}
