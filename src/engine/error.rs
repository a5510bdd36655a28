use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

/// Every failure the engine surfaces. Each variant names what was wrong so
/// the wire layer can render a user-facing message.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input. Recoverable by correcting the request.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// The slot filled up between query and commit. Re-query slots and pick another.
    #[error("slot at {start} on service {service_id} is fully booked")]
    Capacity { service_id: Ulid, start: Ms },

    /// A pricing invariant broke. Fatal, never corrected silently.
    #[error("pricing invariant violated: {0}")]
    Pricing(String),

    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Expected failures the caller can fix by re-prompting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Validation { .. }
                | EngineError::Capacity { .. }
                | EngineError::InvalidTransition { .. }
                | EngineError::NotFound(_)
                | EngineError::AlreadyExists(_)
                | EngineError::LimitExceeded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_names_field() {
        let e = EngineError::validation("quantity", "3 exceeds max 2");
        assert_eq!(e.to_string(), "invalid quantity: 3 exceeds max 2");
        assert!(e.is_recoverable());
    }

    #[test]
    fn pricing_errors_are_fatal() {
        let e = EngineError::Pricing("total -1 is negative".into());
        assert!(!e.is_recoverable());
        assert!(e.to_string().contains("negative"));
    }

    #[test]
    fn transition_message() {
        let e = EngineError::InvalidTransition {
            from: "pending",
            to: "completed",
        };
        assert_eq!(e.to_string(), "cannot move from pending to completed");
    }
}
