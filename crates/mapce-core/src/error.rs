//! Error types and the synchronous admission result.

use thiserror::Error;

/// Result returned synchronously from every facade operation. The
/// protocol outcome, if any, arrives later through the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    /// Accepted; an observer callback will follow
    NoError,
    /// Rejected: wrong connection state, capacity, or policy
    BadStatus,
    /// Rejected: no instance on the device can serve the request
    NoSupport,
    /// Rejected: malformed parameters
    BadParam,
}

impl AdmissionStatus {
    /// True for `NoError`
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, AdmissionStatus::NoError)
    }
}

/// Errors inside the MCE core
#[derive(Debug, Error)]
pub enum MapError {
    /// OBEX layer failure
    #[error("obex error: {0}")]
    Obex(#[from] mapce_obex::ObexError),

    /// Transport layer failure
    #[error("transport error: {0}")]
    Transport(#[from] mapce_transport::TransportError),

    /// A request is already current on the instance
    #[error("request already in flight")]
    RequestInFlight,

    /// Instance has no connected OBEX session
    #[error("instance not connected")]
    NotConnected,

    /// No instance can serve the request
    #[error("no instance supports the request")]
    NoInstance,

    /// The service dispatcher has stopped
    #[error("service stopped")]
    ServiceStopped,
}

/// Result type for MCE core operations
pub type Result<T> = std::result::Result<T, MapError>;
