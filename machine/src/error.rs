//! Error types shared across the orchestrator.

use crate::phase::MachinePhase;
use thiserror::Error;

/// Exit status of a session that completed normally.
pub const EXIT_SUCCESS: i32 = 0;
/// Generic failure status for fatal and runtime faults without their own code.
pub const EXIT_FATAL_ERROR: i32 = 3;
/// Status for allocation failures.
pub const EXIT_OUT_OF_MEMORY: i32 = 9;

/// Errors raised by the lifecycle controller and its collaborators.
#[derive(Debug, Error)]
pub enum MachineError {
    /// Structured fatal fault. Carries an explicit exit code when the raiser
    /// wants one propagated.
    #[error("fatal error: {message}")]
    Fatal {
        message: String,
        exit_code: Option<i32>,
    },

    /// Generic runtime fault.
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// An operation only legal in a specific phase was attempted outside it.
    #[error("`{operation}` is not permitted during the {phase} phase")]
    WrongPhase {
        operation: &'static str,
        phase: MachinePhase,
    },

    #[error("state registration is closed (attempted to register `{0}`)")]
    RegistrationClosed(String),

    #[error("duplicate state item `{0}`")]
    DuplicateStateItem(String),

    #[error("duplicate component tag `{0}`")]
    DuplicateTag(String),

    #[error("unknown component tag `{0}`")]
    UnknownTag(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl MachineError {
    pub fn fatal(message: impl Into<String>) -> Self {
        MachineError::Fatal {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn fatal_with_code(message: impl Into<String>, exit_code: i32) -> Self {
        MachineError::Fatal {
            message: message.into(),
            exit_code: Some(exit_code),
        }
    }

    /// Process exit status for a session interrupted by this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            MachineError::Fatal {
                exit_code: Some(code),
                ..
            } if *code != EXIT_SUCCESS => *code,
            MachineError::OutOfMemory(_) => EXIT_OUT_OF_MEMORY,
            _ => EXIT_FATAL_ERROR,
        }
    }

    /// Structured faults raised deliberately, as opposed to generic runtime faults.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MachineError::Fatal { .. } | MachineError::OutOfMemory(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MachineError>;

/// Failure of a single component activation attempt.
#[derive(Debug, Error)]
pub enum StartError {
    /// The component needs `0` to be started first. Expected during
    /// activation; the attempt is retried on the next pass.
    #[error("missing dependency `{0}`")]
    MissingDependency(String),

    #[error(transparent)]
    Fatal(#[from] MachineError),
}

/// Outcome of [`Component::start`](crate::component::Component::start):
/// `Ok` for started, otherwise missing dependency or fatal.
pub type StartResult = std::result::Result<(), StartError>;
