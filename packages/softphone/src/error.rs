//! Error taxonomy for controller intents.

use engine_process::ProcessError;

use crate::call::CallState;
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneError {
    /// Rejected before anything was spawned or written
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to start engine: {0}")]
    Spawn(String),

    /// The engine's input is gone; the session has been torn down
    #[error("failed to write to engine: {0}")]
    Write(String),

    #[error("not registered")]
    NotRegistered,

    #[error("cannot {operation} while session is {session} and call is {call}")]
    InvalidState {
        operation: &'static str,
        session: SessionState,
        call: CallState,
    },

    #[error("controller is not running")]
    ControllerGone,
}

impl PhoneError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Spawn(_) => "spawn_error",
            Self::Write(_) => "write_error",
            Self::NotRegistered => "not_registered",
            Self::InvalidState { .. } => "invalid_state",
            Self::ControllerGone => "controller_gone",
        }
    }
}

impl From<ProcessError> for PhoneError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::SpawnFailed(msg) => Self::Spawn(msg),
            other => Self::Write(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(PhoneError::NotRegistered.error_code(), "not_registered");
        assert_eq!(
            PhoneError::InvalidInput("port".into()).error_code(),
            "invalid_input"
        );
        assert_eq!(PhoneError::ControllerGone.error_code(), "controller_gone");
    }

    #[test]
    fn process_errors_map_to_spawn_or_write() {
        let spawn: PhoneError = ProcessError::SpawnFailed("missing".into()).into();
        assert_eq!(spawn, PhoneError::Spawn("missing".into()));

        let write: PhoneError = ProcessError::ProcessExited.into();
        assert!(matches!(write, PhoneError::Write(_)));
    }

    #[test]
    fn invalid_state_message_names_both_machines() {
        let err = PhoneError::InvalidState {
            operation: "dial",
            session: SessionState::Registered,
            call: CallState::Active,
        };
        assert_eq!(
            err.to_string(),
            "cannot dial while session is registered and call is active"
        );
    }
}
