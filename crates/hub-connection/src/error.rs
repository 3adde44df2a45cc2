//! Unified error type for the Hub-side connection facade.

use capydeploy_discovery::DiscoveryError;
use capydeploy_protocol::ErrorKind;
use capydeploy_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_NOT_ACCEPTED, WS_ERR_CODE_NOT_FOUND, WS_ERR_CODE_NOT_IMPLEMENTED,
    WS_ERR_CODE_UNAUTHORIZED,
};
use capydeploy_transfer::TransferError;

use crate::pairing::PairingError;
use crate::ws_client::WsError;

/// Errors surfaced by [`crate::manager::ConnectionManager`]'s typed facade
/// methods.
///
/// Wraps every error type the facade can produce (transport, discovery,
/// token-store I/O, chunked transfer) so a UI collaborator never has to
/// match on `tungstenite::Error` or `serde_json::Error` directly — only on
/// [`ErrorKind`] via [`CoreError::error_kind`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Ws(#[from] WsError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upload cancelled")]
    Cancelled,

    #[error("not connected to an agent")]
    NotConnected,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Maps this error onto the flat kind vocabulary shared with the Agent.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CoreError::Ws(WsError::AgentError { code, .. }) => match *code {
                c if c == WS_ERR_CODE_BAD_REQUEST || c == WS_ERR_CODE_NOT_FOUND => {
                    ErrorKind::BadRequest
                }
                c if c == WS_ERR_CODE_UNAUTHORIZED => ErrorKind::AuthRequired,
                c if c == WS_ERR_CODE_NOT_ACCEPTED => ErrorKind::ProtocolViolation,
                c if c == WS_ERR_CODE_CONFLICT => ErrorKind::Busy,
                c if c == WS_ERR_CODE_NOT_IMPLEMENTED || c == WS_ERR_CODE_INTERNAL => {
                    ErrorKind::Internal
                }
                _ => ErrorKind::Internal,
            },
            CoreError::Ws(WsError::Timeout) => ErrorKind::Timeout,
            CoreError::Ws(WsError::Closed) => ErrorKind::ConnectionLost,
            CoreError::Ws(WsError::PairingFailed(_)) => ErrorKind::PairingRequired,
            CoreError::Ws(WsError::Ws(_)) => ErrorKind::ConnectionLost,
            CoreError::Ws(WsError::Json(_)) => ErrorKind::ProtocolViolation,
            CoreError::Discovery(_) => ErrorKind::DiscoveryUnavailable,
            CoreError::Pairing(_) => ErrorKind::Internal,
            CoreError::Transfer(e) => e.error_kind(),
            CoreError::Io(_) => ErrorKind::Internal,
            CoreError::Json(_) => ErrorKind::ProtocolViolation,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::NotConnected => ErrorKind::ConnectionLost,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_codes_map_to_expected_kinds() {
        let err = CoreError::Ws(WsError::AgentError {
            code: WS_ERR_CODE_CONFLICT,
            message: "busy".into(),
        });
        assert_eq!(err.error_kind(), ErrorKind::Busy);

        let err = CoreError::Ws(WsError::AgentError {
            code: WS_ERR_CODE_UNAUTHORIZED,
            message: "nope".into(),
        });
        assert_eq!(err.error_kind(), ErrorKind::AuthRequired);
    }

    #[test]
    fn closed_maps_to_connection_lost() {
        assert_eq!(
            CoreError::Ws(WsError::Closed).error_kind(),
            ErrorKind::ConnectionLost
        );
    }

    #[test]
    fn cancelled_is_preserved() {
        assert_eq!(CoreError::Cancelled.error_kind(), ErrorKind::Cancelled);
    }
}
