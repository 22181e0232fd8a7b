//! Engine lifecycle types.
//!
//! # State Transitions
//!
//! ```text
//!             start()               run()
//! Created ──────────────→ Running ─────────→ (consuming)
//!    │          │            │                    │
//!    │      (bootstrap       │ shutdown signal /  │ fatal error
//!    │       failure)        │ stream end         ↓
//!    ↓          ↓            ↓                 Failed
//! Stopped    Failed       Stopped
//! ```
//!
//! - **Created**: constructed, metadata resolved, nothing connected.
//! - **Starting**: `start()` in progress — pool connecting, routes loading.
//! - **Running**: consuming the change stream strictly sequentially.
//! - **Stopped**: stream ended or shutdown was signalled; clean exit.
//! - **Failed**: a fatal error halted consumption (causal gap, stale
//!   metadata); the local replica must not consume further events.

/// State of the apply engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed but not started.
    Created,

    /// `start()` in progress.
    Starting,

    /// Consuming events.
    Running,

    /// Clean exit after shutdown or end of stream.
    Stopped,

    /// Halted on a fatal error; resuming risks silent divergence.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}
