use std::{
    fmt,
    time::Duration,
};

use models_sync_types::SequenceId;

/// The error taxonomy surfaced by the library.
///
/// Errors either return to the originating caller (sync calls, optimistic
/// submissions, confirmation futures) or reach subscribers as
/// `Arc<ModelError>` items where no caller exists.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// An operation was invoked in a state that forbids it.
    #[error("cannot {operation} in state `{state}`")]
    InvalidState {
        state: String,
        operation: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The sync boundary could not be located in retained channel history.
    #[error("sequence id `{0}` is not locatable in retained channel history")]
    InsufficientHistory(SequenceId),

    /// The sync function kept failing and the retry budget is exhausted.
    #[error("sync failed after {attempts} attempt(s): {source}")]
    SyncFailed { attempts: u32, source: anyhow::Error },

    /// A fresh sync superseded outstanding optimistic work.
    #[error("superseded by a new sync")]
    SyncInterrupted,

    #[error("merge function failed: {source}")]
    MergeFailed { source: anyhow::Error },

    #[error("optimistic event was not confirmed within {timeout:?}")]
    ConfirmationTimeout { timeout: Duration },

    #[error("optimistic event was rejected by the server")]
    Rejected,

    #[error("optimistic event was cancelled")]
    Cancelled,

    #[error("model is disposed")]
    Disposed,

    /// The transport reported a continuity gap on the channel.
    #[error("channel discontinuity: {reason}")]
    Discontinuity { reason: String },

    #[error("transport failure: {source}")]
    Transport { source: anyhow::Error },
}

impl ModelError {
    pub(crate) fn invalid_state(state: impl fmt::Display, operation: &'static str) -> Self {
        Self::InvalidState {
            state: state.to_string(),
            operation,
        }
    }

    pub(crate) fn transport(source: anyhow::Error) -> Self {
        Self::Transport { source }
    }
}
