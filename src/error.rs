use std::path::PathBuf;

use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cgroup {0} already exists")]
    AlreadyExists(String),

    #[error("permission denied under cgroup root {0}")]
    Permission(PathBuf),

    #[error("cgroup v2 hierarchy not available at {0}")]
    Unavailable(PathBuf),

    #[error("failed to write {controller} for cgroup {group}: {source}")]
    ControllerFailed {
        group: String,
        controller: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare cgroup attach for {group}: {source}")]
    AttachFailed {
        group: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("failed to signal process group {pgid}: {source}")]
    SignalFailed {
        pgid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("deadline elapsed before job exited")]
    DeadlineElapsed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Boundary conversion: internal kinds become wire-level status codes.
/// Resource setup and spawn failures surface as invalid-argument with a
/// descriptive message; the supervisor has already torn down partial state.
impl From<WorkerError> for Status {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::InvalidArgument(_)
            | WorkerError::AlreadyExists(_)
            | WorkerError::Permission(_)
            | WorkerError::Unavailable(_)
            | WorkerError::ControllerFailed { .. }
            | WorkerError::AttachFailed { .. }
            | WorkerError::SpawnFailed(_) => Status::invalid_argument(err.to_string()),
            WorkerError::DeadlineElapsed => Status::cancelled(err.to_string()),
            WorkerError::SignalFailed { .. } | WorkerError::Io(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_setup_errors_surface_as_invalid_argument() {
        let err = WorkerError::ControllerFailed {
            group: "g".to_string(),
            controller: "cpu.weight",
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        let status = Status::from(err);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("cpu.weight"));
    }

    #[test]
    fn deadline_elapsed_surfaces_as_cancelled() {
        let status = Status::from(WorkerError::DeadlineElapsed);
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }
}
