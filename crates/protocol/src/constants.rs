use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Time to wait for a pong response (or any incoming message) before the
/// second strike against the connection.
///
/// This acts as a read deadline: if *nothing* arrives within this window
/// (no pong, no response, no push event), one heartbeat has been missed.
/// Two consecutive misses close the session with `ConnectionLost`.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(45);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Maximum size of a single text frame (the JSON envelope). Oversize text
/// frames close the session with `ProtocolViolation`.
pub const WS_MAX_TEXT_FRAME_SIZE: usize = 1024 * 1024;

/// Size for binary chunks (1 MB).
pub const WS_CHUNK_SIZE: usize = 1024 * 1024;

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary request/response operations (chunk uploads).
///
/// Binary transfers (chunk uploads) may take significantly longer than
/// text requests due to disk I/O and network conditions.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Current wire protocol version, carried in `hub_connected`/`info_response`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Outcome of comparing a peer's advertised protocol version to ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCompatibility {
    /// Peer is on the same protocol version.
    Compatible,
    /// Peer is on an older version. Still interoperates, but the caller
    /// should surface a warning.
    Deprecated { peer_version: u32 },
    /// Peer is on a newer version than this side understands.
    Incompatible { reason: String, peer_version: u32 },
}

/// Compares a peer's advertised protocol version against [`PROTOCOL_VERSION`].
///
/// A missing/zero version (pre-versioning peers) is treated as deprecated,
/// not incompatible — this side still understands the original wire shape.
pub fn check_protocol_compatibility(peer_version: u32) -> ProtocolCompatibility {
    if peer_version == PROTOCOL_VERSION {
        ProtocolCompatibility::Compatible
    } else if peer_version < PROTOCOL_VERSION {
        ProtocolCompatibility::Deprecated { peer_version }
    } else {
        ProtocolCompatibility::Incompatible {
            reason: format!(
                "peer protocol version {peer_version} is newer than supported version {PROTOCOL_VERSION}"
            ),
            peer_version,
        }
    }
}

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Connection management / handshake
    #[serde(rename = "hub_connected")]
    HubConnected,
    #[serde(rename = "auth_ok")]
    AuthOk,
    #[serde(rename = "busy")]
    Busy,

    // Pairing
    #[serde(rename = "pairing_required")]
    PairingRequired,
    #[serde(rename = "confirm_pairing")]
    ConfirmPairing,
    #[serde(rename = "pair_success")]
    PairSuccess,

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Requests from Hub to Agent
    #[serde(rename = "get_info")]
    GetInfo,
    #[serde(rename = "get_config")]
    GetConfig,
    #[serde(rename = "get_steam_users")]
    GetSteamUsers,
    #[serde(rename = "list_shortcuts")]
    ListShortcuts,
    #[serde(rename = "create_shortcut")]
    CreateShortcut,
    #[serde(rename = "delete_shortcut")]
    DeleteShortcut,
    #[serde(rename = "delete_game")]
    DeleteGame,
    #[serde(rename = "apply_artwork")]
    ApplyArtwork,
    #[serde(rename = "restart_steam")]
    RestartSteam,
    #[serde(rename = "init_upload")]
    InitUpload,
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "complete_upload")]
    CompleteUpload,
    #[serde(rename = "cancel_upload")]
    CancelUpload,

    // Responses from Agent to Hub
    #[serde(rename = "info_response")]
    InfoResponse,
    #[serde(rename = "config_response")]
    ConfigResponse,
    #[serde(rename = "steam_users_response")]
    SteamUsersResponse,
    #[serde(rename = "shortcuts_response")]
    ShortcutsResponse,
    #[serde(rename = "artwork_response")]
    ArtworkResponse,
    #[serde(rename = "steam_response")]
    SteamResponse,
    #[serde(rename = "upload_response")]
    UploadResponse,
    #[serde(rename = "upload_chunk_response")]
    UploadChunkResponse,
    #[serde(rename = "operation_result")]
    OperationResult,
    #[serde(rename = "error")]
    Error,

    // Events from Agent to Hub (push notifications)
    #[serde(rename = "upload_progress")]
    UploadProgress,
    #[serde(rename = "operation_event")]
    OperationEvent,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// WebSocket close code sent by the Agent when it tears down a session
/// because the Hub's pairing token was revoked. In the private-use range
/// (4000-4999) since this is application-specific, not a standard close
/// reason. The Hub checks for this code to suppress auto-reconnect.
pub const WS_CLOSE_TOKEN_REVOKED: u16 = 4001;

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_NOT_ACCEPTED: i32 = 406;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
