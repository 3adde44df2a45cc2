use serde::{Deserialize, Serialize};

/// Information about a discovered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub accept_connections: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_image_formats: Vec<String>,
}

/// Configuration for uploading a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    pub game_name: String,
    pub install_path: String,
    pub executable: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub launch_options: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tags: String,
}

/// Configuration for creating a Steam shortcut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutConfig {
    pub name: String,
    pub exe: String,
    pub start_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub launch_options: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<ArtworkConfig>,
}

/// Artwork paths for a shortcut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtworkConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub grid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hero: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub banner: String,
}

/// Information about an existing shortcut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutInfo {
    pub app_id: u32,
    pub name: String,
    pub exe: String,
    pub start_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub launch_options: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub last_played: i64,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Current state of an upload.
///
/// `Init` covers the window between `init_upload` and the first chunk;
/// `Finalising` covers the gap between the last chunk and a verified
/// `complete_upload` (manifest hash check, shortcut creation if requested).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "streaming")]
    Streaming,
    #[serde(rename = "finalising")]
    Finalising,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "failed")]
    Failed,
}

/// Progress information for an active upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub status: UploadState,
    pub total_bytes: i64,
    pub transferred_bytes: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_file: String,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl UploadProgress {
    /// Returns the upload progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}
