//! Error taxonomy for the scheduler core.
//!
//! `StoreError` wraps a backend failure together with the operation name
//! that failed, so logs can say "findFit failed" rather than just
//! propagating an opaque driver error. The remaining variants are fatal
//! (`SchemaPartial`, `IsolationUnsupported`, `InvariantViolation`) or
//! ordinary rejections a caller can act on (`JobNotFound`,
//! `IllegalTransition`, `ApplicationNotFound`, `ApplicationInUse`).

use crate::model::JobState;
use thiserror::Error;

/// A failure from the persistence backend, tagged with the operation that
/// produced it. `source` is boxed so this crate stays backend-agnostic —
/// `retz-store-postgres` and `retz-testing` each wrap their own driver error
/// (`sqlx::Error`) without retz-core depending on sqlx.
#[derive(Debug, Error)]
#[error("store operation `{op}` failed: {source}")]
pub struct StoreError {
    pub op: &'static str,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl StoreError {
    pub fn new(op: &'static str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            op,
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetzError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("referenced application `{0}` does not exist or owner is disabled")]
    ApplicationNotFound(String),

    #[error("application `{0}` still has non-terminal jobs")]
    ApplicationInUse(String),

    #[error("database schema is partially migrated: refusing to start")]
    SchemaPartial,

    #[error("database backend does not advertise SERIALIZABLE isolation")]
    IsolationUnsupported,

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

/// Classifies an error as safe to retry (the caller should let the next
/// natural re-delivery — an offer, a status update, a reconcile — paper
/// over it) or fatal (integrity is compromised; the process should not
/// continue serving requests). One place to ask "is this transient"
/// instead of matching on variants ad hoc at every call site.
pub trait Categorizable {
    fn is_retryable(&self) -> bool;
    fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

impl Categorizable for RetzError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetzError::Store(_)
                | RetzError::JobNotFound(_)
                | RetzError::IllegalTransition { .. }
                | RetzError::ApplicationNotFound(_)
                | RetzError::ApplicationInUse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_and_not_found_are_retryable() {
        assert!(RetzError::JobNotFound(1).is_retryable());
        assert!(RetzError::IllegalTransition {
            from: JobState::Finished,
            to: JobState::Started,
        }
        .is_retryable());
        assert!(!RetzError::JobNotFound(1).is_fatal());
    }

    #[test]
    fn schema_and_invariant_errors_are_fatal() {
        assert!(RetzError::SchemaPartial.is_fatal());
        assert!(RetzError::IsolationUnsupported.is_fatal());
        assert!(RetzError::InvariantViolation("bad state".into()).is_fatal());
        assert!(!RetzError::SchemaPartial.is_retryable());
    }
}
