use serde::{Deserialize, Serialize};

/// Stable, small set of error kinds carried on the wire in
/// `OperationResult.error_kind` / `WsError.code`'s sibling string form.
///
/// Kept deliberately flat rather than nested per-layer: callers switch on
/// this value directly, and new kinds should be rare enough that adding one
/// is a deliberate protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cannot bind/listen multicast (L1).
    DiscoveryUnavailable,
    /// Malformed frame, oversize, or out-of-order message (L2/L5).
    ProtocolViolation,
    /// Envelope parsed but the payload was invalid (L6).
    BadRequest,
    /// Message type not in the dispatch table (L6).
    UnknownType,
    /// No token presented and no pairing in progress (L4/L5).
    AuthRequired,
    /// Peer not authorized yet; a pairing code has been issued (L4/L5).
    PairingRequired,
    /// Pairing code's TTL elapsed (L4).
    CodeExpired,
    /// Confirmed code does not match the pending one (L4).
    CodeInvalid,
    /// Too many failed pairing attempts within the window (L4).
    RateLimited,
    /// `confirm_pairing` received with no pairing in progress (L4).
    NoPendingPairing,
    /// Presented token is unknown or was revoked (L5).
    AuthFailed,
    /// Another peer already holds the single active connection slot (L5).
    Busy,
    /// Request exceeded its deadline (L6).
    Timeout,
    /// Session or operation was cancelled (L5/L6/L7).
    Cancelled,
    /// Heartbeat missed or transport closed (L5).
    ConnectionLost,
    /// Chunk offset does not match the writer's expected offset (L7).
    OffsetMismatch,
    /// Chunk checksum does not match the declared value (L7).
    ChecksumMismatch,
    /// `complete_upload` received before all bytes were written (L7).
    IncompleteUpload,
    /// Staging directory has no room for this upload (L7).
    StagingFull,
    /// Unexpected handler failure, including caught panics (L6).
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::OffsetMismatch).unwrap(),
            "\"offset_mismatch\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::NoPendingPairing).unwrap(),
            "\"no_pending_pairing\""
        );
    }

    #[test]
    fn error_kind_roundtrip() {
        for kind in [
            ErrorKind::DiscoveryUnavailable,
            ErrorKind::ProtocolViolation,
            ErrorKind::BadRequest,
            ErrorKind::UnknownType,
            ErrorKind::AuthRequired,
            ErrorKind::PairingRequired,
            ErrorKind::CodeExpired,
            ErrorKind::CodeInvalid,
            ErrorKind::RateLimited,
            ErrorKind::NoPendingPairing,
            ErrorKind::AuthFailed,
            ErrorKind::Busy,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
            ErrorKind::ConnectionLost,
            ErrorKind::OffsetMismatch,
            ErrorKind::ChecksumMismatch,
            ErrorKind::IncompleteUpload,
            ErrorKind::StagingFull,
            ErrorKind::Internal,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: ErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(kind, parsed);
        }
    }
}
