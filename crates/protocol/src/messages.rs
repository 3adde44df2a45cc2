use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{AgentInfo, ArtworkConfig, ShortcutConfig, ShortcutInfo, UploadConfig};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Starts a new upload session, carrying the full file manifest so the
/// Agent can compute resume offsets from what's already on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub config: UploadConfig,
    pub total_size: i64,
    pub files: Vec<FileEntry>,
}

/// A file in the upload manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub relative_path: String,
    pub size: i64,
}

/// Finalizes an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub upload_id: String,
    pub create_shortcut: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut: Option<ShortcutConfig>,
}

/// Cancels an active upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadRequest {
    pub upload_id: String,
}

/// Creates a Steam shortcut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShortcutRequest {
    pub user_id: u32,
    pub shortcut: ShortcutConfig,
}

/// Removes a Steam shortcut, optionally restarting Steam afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteShortcutRequest {
    pub user_id: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub app_id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub restart_steam: bool,
}

/// Lists shortcuts for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListShortcutsRequest {
    pub user_id: u32,
}

/// Requests artwork application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyArtworkRequest {
    pub user_id: String,
    pub app_id: u32,
    pub artwork: Option<ArtworkConfig>,
}

/// Requests deletion of a game (agent handles everything internally).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteGameRequest {
    pub app_id: u32,
}

// ---------------------------------------------------------------------------
// Connection payloads
// ---------------------------------------------------------------------------

/// Sent when a Hub connects to an Agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConnectedRequest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hub_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Protocol version advertised by the Hub (0 = legacy/pre-negotiation).
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub protocol_version: u32,
}

/// Agent's response to an already-authorized Hub connection (`auth_ok`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOkResponse {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub accept_connections: bool,
    /// Protocol version advertised by the Agent (0 = legacy/pre-negotiation).
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub protocol_version: u32,
}

/// Sent when a Hub needs to pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequiredResponse {
    pub code: String,
    pub expires_in: i32,
}

/// Sent by Hub to confirm pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmPairingRequest {
    pub code: String,
}

/// Sent when pairing is successful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSuccessResponse {
    pub token: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Contains agent information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub agent: AgentInfo,
    /// Names of the collaborator operations this Agent actually supports,
    /// so a Hub can avoid calling into an `Unsupported` operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Acknowledges upload initialization. `resume_from` maps relative paths to
/// the byte offset already present on disk for each, absent when starting
/// fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub chunk_size: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<HashMap<String, i64>>,
}

/// Acknowledges a binary chunk write, or reports a per-chunk failure
/// (offset/checksum mismatch) without tearing down the upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub upload_id: String,
    #[serde(default = "default_true")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub bytes_written: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub total_written: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

fn default_true() -> bool {
    true
}

/// Confirms upload completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub app_id: u32,
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub install_path: String,
}

// ---------------------------------------------------------------------------
// Steam payloads
// ---------------------------------------------------------------------------

/// A Steam user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteamUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avatar_url: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub last_login_at: i64,
}

/// List of Steam users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteamUsersResponse {
    pub users: Vec<SteamUser>,
}

/// List of shortcuts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortcutsListResponse {
    pub shortcuts: Vec<ShortcutInfo>,
}

/// Result of shortcut creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShortcutResponse {
    pub app_id: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub steam_restarted: bool,
}

/// Result of game deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteGameResponse {
    pub status: String,
    pub game_name: String,
    pub steam_restarted: bool,
}

// ---------------------------------------------------------------------------
// Artwork payloads
// ---------------------------------------------------------------------------

/// Artwork operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtworkResponse {
    pub applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<ArtworkFailed>,
}

/// A failed artwork application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtworkFailed {
    #[serde(rename = "type")]
    pub art_type: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Operation payloads
// ---------------------------------------------------------------------------

/// Generic result for operations that don't have a dedicated response type
/// (pairing confirmation, shortcut deletion, cancel-upload, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Push notification for operation progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: String,
    pub game_name: String,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Steam control payloads
// ---------------------------------------------------------------------------

/// Result of Steam restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSteamResponse {
    pub success: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Upload progress payload
// ---------------------------------------------------------------------------

/// Upload progress event, pushed every 250 ms while an upload is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgressEvent {
    pub upload_id: String,
    pub transferred_bytes: i64,
    pub total_bytes: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_file: String,
    pub percentage: f64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_connected_omit_empty() {
        let req = HubConnectedRequest {
            name: "Hub".into(),
            version: "0.1.0".into(),
            platform: String::new(),
            hub_id: String::new(),
            token: String::new(),
            protocol_version: 0,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("platform"));
        assert!(!json.contains("hubId"));
        assert!(!json.contains("token"));
        assert!(!json.contains("protocolVersion"));
    }

    #[test]
    fn hub_connected_protocol_version_present() {
        let req = HubConnectedRequest {
            name: "Hub".into(),
            version: "0.1.0".into(),
            platform: String::new(),
            hub_id: String::new(),
            token: String::new(),
            protocol_version: 1,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"protocolVersion\":1"));
    }

    #[test]
    fn hub_connected_legacy_json_defaults_to_zero() {
        let json = r#"{"name":"Hub","version":"0.1.0"}"#;
        let req: HubConnectedRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.protocol_version, 0);
    }

    #[test]
    fn auth_ok_response_roundtrip() {
        let resp = AuthOkResponse {
            name: "Agent".into(),
            version: "0.6.0".into(),
            platform: "steamdeck".into(),
            accept_connections: true,
            protocol_version: 1,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"acceptConnections\":true"));
        assert!(json.contains("\"protocolVersion\":1"));
        let parsed: AuthOkResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(resp, parsed);
    }

    #[test]
    fn auth_ok_legacy_json_defaults_to_zero() {
        let json = r#"{
            "name":"Agent","version":"0.6.0","platform":"steamdeck",
            "acceptConnections":true
        }"#;
        let resp: AuthOkResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.protocol_version, 0);
    }

    #[test]
    fn init_upload_response_roundtrip() {
        let mut resume = HashMap::new();
        resume.insert("file1.bin".to_string(), 1024i64);
        let resp = InitUploadResponse {
            upload_id: "u1".into(),
            chunk_size: 1048576,
            resume_from: Some(resume),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: InitUploadResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(resp, parsed);
    }

    #[test]
    fn operation_result_error_kind_omitted_on_success() {
        let result = OperationResult {
            ok: true,
            error_kind: None,
            message: String::new(),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("errorKind"));
    }

    #[test]
    fn operation_result_carries_error_kind_on_failure() {
        let result = OperationResult {
            ok: false,
            error_kind: Some(ErrorKind::CodeInvalid),
            message: "bad code".into(),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"code_invalid\""));
        let parsed: OperationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error_kind, Some(ErrorKind::CodeInvalid));
    }

    #[test]
    fn operation_event_roundtrip() {
        let evt = OperationEvent {
            event_type: "install".into(),
            status: "progress".into(),
            game_name: "TestGame".into(),
            progress: 42.5,
            message: String::new(),
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains("\"type\":\"install\""));
        assert!(!json.contains("message"));
        let parsed: OperationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(evt, parsed);
    }

    #[test]
    fn delete_shortcut_omit_empty() {
        let req = DeleteShortcutRequest {
            user_id: 12345,
            app_id: 0,
            name: String::new(),
            restart_steam: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("appId"));
        assert!(!json.contains("name"));
        assert!(!json.contains("restartSteam"));
    }

    #[test]
    fn upload_chunk_response_success_omits_error_kind() {
        let resp = UploadChunkResponse {
            upload_id: "u1".into(),
            ok: true,
            bytes_written: 1024,
            total_written: 1024,
            error_kind: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("errorKind"));
    }

    #[test]
    fn upload_chunk_response_failure_carries_error_kind() {
        let resp = UploadChunkResponse {
            upload_id: "u1".into(),
            ok: false,
            bytes_written: 0,
            total_written: 512,
            error_kind: Some(ErrorKind::OffsetMismatch),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"offset_mismatch\""));
        let parsed: UploadChunkResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error_kind, Some(ErrorKind::OffsetMismatch));
    }

    #[test]
    fn artwork_failed_type_field() {
        let f = ArtworkFailed {
            art_type: "hero".into(),
            error: "file not found".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"type\":\"hero\""));
    }
}
