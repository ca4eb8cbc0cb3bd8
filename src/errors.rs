// Typed rejection taxonomy for the signal surface.
// Every rejected signal tells the caller whether to retry, force, or abort.

use thiserror::Error;
use uuid::Uuid;

use crate::instance::RunState;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("signal not legal in run state {run_state:?}: {reason}")]
    StateConflict { run_state: RunState, reason: String },

    #[error("instance is paused")]
    Paused,

    #[error("instance is cancelled")]
    Cancelled,

    #[error("stage '{stage}' has incomplete required requirements: {missing:?}")]
    RequirementsIncomplete { stage: String, missing: Vec<String> },

    #[error("transient infrastructure failure: {reason}")]
    TransientInfra { reason: String },

    #[error("fatal engine error: {reason}")]
    FatalEngine { reason: String },

    #[error("unknown instance {0}")]
    UnknownInstance(Uuid),

    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
}

impl WorkflowError {
    /// Rejections leave persisted state untouched; infrastructure and
    /// engine failures may require the caller to intervene.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            WorkflowError::TransientInfra { .. } | WorkflowError::FatalEngine { .. }
        )
    }
}
