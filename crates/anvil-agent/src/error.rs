use anvil_process::{InstanceId, Status};

use crate::scheduler::OperationKind;
use crate::state_machine::LifecycleEvent;

pub type Result<T, E = AnvilError> = std::result::Result<T, E>;

/// Failure kinds surfaced to callers of the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum AnvilError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cannot apply {event} while instance is {from}")]
    InvalidTransition { from: Status, event: LifecycleEvent },

    #[error("instance {instance_id} is busy ({operation})")]
    OperationInProgress {
        instance_id: InstanceId,
        operation: OperationKind,
    },

    #[error("instance {instance_id} is running ({status})")]
    InstanceRunning {
        instance_id: InstanceId,
        status: Status,
    },

    #[error("failed to spawn server process: {0}")]
    Spawn(String),

    #[error("server process is not running for instance {0}")]
    ProcessNotRunning(InstanceId),

    #[error("invalid archive: {0}")]
    InvalidArchiveShape(String),

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("invalid world source: {0}")]
    InvalidWorldSource(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AnvilError {
    pub fn instance_not_found(id: &InstanceId) -> Self {
        AnvilError::NotFound {
            kind: "instance",
            id: id.0.clone(),
        }
    }

    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            AnvilError::NotFound { .. } => "not_found",
            AnvilError::InvalidTransition { .. } => "invalid_transition",
            AnvilError::OperationInProgress { .. } => "operation_in_progress",
            AnvilError::InstanceRunning { .. } => "instance_running",
            AnvilError::Spawn(_) => "spawn_failed",
            AnvilError::ProcessNotRunning(_) => "process_not_running",
            AnvilError::InvalidArchiveShape(_) => "invalid_archive_shape",
            AnvilError::NameConflict(_) => "name_conflict",
            AnvilError::InvalidWorldSource(_) => "invalid_world_source",
            AnvilError::InvalidArgument(_) => "invalid_argument",
            AnvilError::Cancelled => "cancelled",
            AnvilError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for AnvilError {
    fn from(value: std::io::Error) -> Self {
        AnvilError::Internal(anyhow::Error::new(value))
    }
}
