use thiserror::Error;
use uuid::Uuid;

pub type SequencerResult<T> = Result<T, SequencerError>;

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Edit conflicts with in-flight enrollments: {0}")]
    EditConflict(String),

    #[error("Contact already enrolled (enrollment {enrollment_id})")]
    AlreadyEnrolled { enrollment_id: Uuid },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Store lock not acquired within {timeout_ms}ms")]
    StoreTimeout { timeout_ms: u64 },

    #[error("Store invariant violated: {0}")]
    Invariant(String),

    #[error("Claim on scheduled email {0} is not held by this worker")]
    ClaimLost(Uuid),

    #[error("Contact lookup error: {0}")]
    ContactLookup(String),

    #[error("Template rendering error: {0}")]
    Render(String),

    #[error("Mail transport error: {0}")]
    Transport(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SequencerError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Failures the dispatcher retries with backoff rather than surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ContactLookup(_)
                | Self::Render(_)
                | Self::Transport(_)
                | Self::Timeout(_)
                | Self::StoreTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SequencerError::Transport("502".into()).is_transient());
        assert!(SequencerError::Timeout(5000).is_transient());
        assert!(!SequencerError::Validation("bad order".into()).is_transient());
        assert!(!SequencerError::AlreadyEnrolled {
            enrollment_id: Uuid::new_v4()
        }
        .is_transient());
    }

    #[test]
    fn test_not_found_message() {
        let id = Uuid::nil();
        let err = SequencerError::not_found("Sequence", id);
        assert_eq!(err.to_string(), format!("Sequence {} not found", id));
    }
}
