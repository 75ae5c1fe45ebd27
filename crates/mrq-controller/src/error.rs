use mrq_client::BackendError;
use mrq_core::RecordId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// A fetch or enumeration failed. Prior state is kept and the next poll
    /// tick retries.
    #[error("fetching records failed: {source}")]
    TransientFetch {
        #[source]
        source: BackendError,
    },
    #[error("action on record {record_id} was rejected: {reason}")]
    ActionRejected { record_id: RecordId, reason: String },
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("record {0} is not loaded in this session")]
    UnknownRecord(RecordId),
    #[error("review session is closed")]
    SessionClosed,
}

impl ControllerError {
    pub fn fetch(source: BackendError) -> Self {
        ControllerError::TransientFetch { source }
    }
}

/// A batch member could not be turned into an action payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {record_id}: {reason}")]
pub struct ResolutionError {
    pub record_id: RecordId,
    pub reason: String,
}

impl ResolutionError {
    pub fn new(record_id: RecordId, reason: impl Into<String>) -> Self {
        Self {
            record_id,
            reason: reason.into(),
        }
    }
}
