//! Error kinds shared across the relay.

use thiserror::Error;

/// Failures produced by the relay core.
///
/// Validation and input errors are reported back to the offending client
/// frame; `StorageBusy` is retryable inside the write path; `StorageCorrupt`
/// is fatal to the process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RelayError {
    /// The submitted event is missing fields or has fields outside their domain.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A filter carries an unknown option or a value outside its domain.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The event signature (or its id digest) does not verify.
    #[error("bad signature")]
    SignatureInvalid,

    /// The publisher or its `d`-tag is outside the allow-list.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// An event with this id is already stored.
    #[error("duplicate event")]
    Duplicate,

    /// The storage engine reported contention; the operation may be retried.
    #[error("storage busy")]
    StorageBusy,

    /// The storage engine reported a structural failure.
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    /// An inbound frame was not JSON, not an array, or used an unknown verb.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl RelayError {
    /// Returns a short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RelayError::MalformedEvent(_) => "malformed_event",
            RelayError::BadInput(_) => "bad_input",
            RelayError::SignatureInvalid => "signature_invalid",
            RelayError::NotAuthorized(_) => "not_authorized",
            RelayError::Duplicate => "duplicate",
            RelayError::StorageBusy => "storage_busy",
            RelayError::StorageCorrupt(_) => "storage_corrupt",
            RelayError::ProtocolViolation(_) => "protocol_violation",
        }
    }

    /// Indicates whether the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::StorageBusy)
    }

    /// Indicates whether the process must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::StorageCorrupt(_))
    }

    /// Machine-readable reason string for OK and CLOSED frames.
    pub fn reason(&self) -> String {
        match self {
            RelayError::MalformedEvent(m) => format!("invalid: {m}"),
            RelayError::BadInput(m) => format!("invalid: {m}"),
            RelayError::SignatureInvalid => "invalid: bad signature".into(),
            RelayError::NotAuthorized(m) => format!("restricted: {m}"),
            RelayError::Duplicate => "duplicate: already have this event".into(),
            RelayError::StorageBusy => "error: relay is busy, try again".into(),
            RelayError::StorageCorrupt(_) => "error: storage failure".into(),
            RelayError::ProtocolViolation(m) => format!("invalid: {m}"),
        }
    }
}
