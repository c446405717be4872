use thiserror::Error;

use crate::ReasonCode;

/// Failure to bring up a broker session.
///
/// Creation and connection failures are reported separately so the caller
/// can tell a bad configuration from an unreachable or refusing broker.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The transport could not create the session object.
    #[error("failed to create client, return code {0}")]
    Create(ReasonCode),

    /// The session was created but the broker connection failed.
    #[error("failed to connect, return code {0}")]
    Connect(ReasonCode),
}

impl ConnectError {
    /// Numeric reason code reported by the transport.
    pub fn reason_code(&self) -> ReasonCode {
        // ---
        match self {
            ConnectError::Create(code) | ConnectError::Connect(code) => *code,
        }
    }
}

/// Errors surfaced by the crate's fallible operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Opening the broker session failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The transport refused the publish handoff.
    #[error("publish rejected by transport, return code {0}")]
    Rejected(ReasonCode),

    /// The connection was not usable when the publish was attempted.
    #[error("connection is not usable")]
    Unusable,

    /// The connection was lost before the broker acknowledged the publish.
    #[error("connection lost before delivery was confirmed")]
    ConnectionLost,

    /// The completion handler was dropped without being invoked.
    ///
    /// Only happens under [`FailurePolicy::Legacy`](crate::FailurePolicy::Legacy).
    #[error("publish dropped without a delivery outcome")]
    Dropped,
}

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, Error>;
