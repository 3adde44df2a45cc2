//! Chunked upload pipeline run against a connected Agent.
//!
//! Scans a local directory, opens an upload session on the Agent, streams
//! each file as fixed-size checksummed chunks (resuming from the offsets
//! the Agent reports), and finalises the session. Grounded in the same
//! scan/init/chunk/complete shape as a deploy pipeline, trimmed to the
//! generic transfer mechanics — shortcut creation is the only
//! Steam-specific step left, since the caller already decided on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use capydeploy_protocol::constants::MessageType;
use capydeploy_protocol::messages::{
    CompleteUploadRequest, CompleteUploadResponse, FileEntry, InitUploadRequest,
    InitUploadResponse,
};
use capydeploy_protocol::types::{ShortcutConfig, UploadConfig};
use capydeploy_transfer::ChunkReader;

use crate::error::CoreError;
use crate::ws_client::WsClient;

/// A local directory to upload, plus the install metadata the Agent needs
/// to stage it and (optionally) register a Steam shortcut for it.
#[derive(Debug, Clone)]
pub struct UploadManifest {
    /// Root directory on the Hub's machine; walked recursively.
    pub local_path: PathBuf,
    pub config: UploadConfig,
    pub create_shortcut: bool,
    pub shortcut: Option<ShortcutConfig>,
}

/// Handle to an in-flight upload.
///
/// Progress is observed through
/// [`ConnectionManager::take_events`](crate::manager::ConnectionManager::take_events)
/// (`ConnectionEvent::AgentEvent` carrying `upload_progress`); this handle
/// is only for awaiting the final result or requesting cancellation.
pub struct UploadHandle {
    join: tokio::task::JoinHandle<Result<CompleteUploadResponse, CoreError>>,
    cancel: CancellationToken,
}

impl UploadHandle {
    /// Requests cancellation. A chunk already in flight still completes;
    /// no further chunks are read or sent afterward.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the upload to finish, fail, or be cancelled.
    pub async fn join(self) -> Result<CompleteUploadResponse, CoreError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(CoreError::Internal(format!("upload task panicked: {e}"))),
        }
    }
}

pub(crate) fn spawn_upload(
    ws_client: Arc<Mutex<Option<WsClient>>>,
    manifest: UploadManifest,
) -> UploadHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let join = tokio::spawn(run_upload(ws_client, manifest, task_cancel));
    UploadHandle { join, cancel }
}

async fn run_upload(
    ws_client: Arc<Mutex<Option<WsClient>>>,
    manifest: UploadManifest,
    cancel: CancellationToken,
) -> Result<CompleteUploadResponse, CoreError> {
    let root = manifest.local_path.clone();
    let (files, total_size) = tokio::task::spawn_blocking(move || scan_files(&root))
        .await
        .map_err(|e| CoreError::Internal(format!("scan task join error: {e}")))??;

    let init_req = InitUploadRequest {
        config: manifest.config.clone(),
        total_size,
        files: files.clone(),
    };
    let init_resp: InitUploadResponse =
        request(&ws_client, MessageType::InitUpload, Some(&init_req)).await?;

    let chunk_size = if init_resp.chunk_size > 0 {
        init_resp.chunk_size as usize
    } else {
        capydeploy_transfer::DEFAULT_CHUNK_SIZE
    };

    for file in &files {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let local_path = manifest.local_path.join(&file.relative_path);
        let resume_offset = init_resp
            .resume_from
            .as_ref()
            .and_then(|m| m.get(&file.relative_path))
            .copied()
            .unwrap_or(0);

        let mut reader = tokio::task::spawn_blocking({
            let path = local_path.clone();
            move || ChunkReader::new(&path, chunk_size)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("open task join error: {e}")))??;

        if resume_offset > 0 {
            reader.seek_to(resume_offset)?;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let (next_reader, chunk) = tokio::task::spawn_blocking(move || {
                let chunk = reader.next_chunk();
                (reader, chunk)
            })
            .await
            .map_err(|e| CoreError::Internal(format!("read task join error: {e}")))?;
            reader = next_reader;

            let Some(chunk) = chunk? else { break };

            let header = serde_json::json!({
                "uploadId": init_resp.upload_id,
                "filePath": file.relative_path,
                "offset": chunk.offset,
                "checksum": chunk.checksum,
            });

            let client_guard = ws_client.lock().await;
            let client = client_guard.as_ref().ok_or(CoreError::NotConnected)?;
            client.send_binary(&header, &chunk.data).await?;
            drop(client_guard);

            debug!(file = %file.relative_path, offset = chunk.offset, "chunk sent");
        }
    }

    let complete_req = CompleteUploadRequest {
        upload_id: init_resp.upload_id.clone(),
        create_shortcut: manifest.create_shortcut,
        shortcut: manifest.shortcut.clone(),
    };
    request(&ws_client, MessageType::CompleteUpload, Some(&complete_req)).await
}

async fn request<Req, Resp>(
    ws_client: &Arc<Mutex<Option<WsClient>>>,
    msg_type: MessageType,
    payload: Option<&Req>,
) -> Result<Resp, CoreError>
where
    Req: serde::Serialize,
    Resp: for<'de> serde::Deserialize<'de>,
{
    let client_guard = ws_client.lock().await;
    let client = client_guard.as_ref().ok_or(CoreError::NotConnected)?;
    let resp = client.send_request(msg_type, payload).await?;
    drop(client_guard);
    resp.parse_payload::<Resp>()?
        .ok_or_else(|| CoreError::Internal(format!("empty {msg_type:?} response")))
}

/// Recursively walks `root`, returning file entries with `/`-normalized
/// relative paths and the total byte size.
fn scan_files(root: &Path) -> Result<(Vec<FileEntry>, i64), CoreError> {
    let mut files = Vec::new();
    let mut total_size = 0i64;
    walk_dir(root, root, &mut files, &mut total_size)?;
    Ok((files, total_size))
}

fn walk_dir(
    root: &Path,
    current: &Path,
    files: &mut Vec<FileEntry>,
    total_size: &mut i64,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            walk_dir(root, &path, files, total_size)?;
        } else if metadata.is_file() {
            let rel_path = path.strip_prefix(root).map_err(std::io::Error::other)?;
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");
            let size = metadata.len() as i64;
            files.push(FileEntry {
                relative_path: rel_str,
                size,
            });
            *total_size += size;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_all_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("game.exe"), b"EXE").unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data").join("config.ini"), b"CFG").unwrap();

        let (files, total_size) = scan_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(total_size, 6);
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert!(paths.contains(&"game.exe"));
        assert!(paths.contains(&"data/config.ini"));
    }

    #[test]
    fn scan_empty_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (files, total_size) = scan_files(dir.path()).unwrap();
        assert!(files.is_empty());
        assert_eq!(total_size, 0);
    }

    #[tokio::test]
    async fn upload_without_connection_fails_fast() {
        let ws_client = Arc::new(Mutex::new(None));
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("game.exe"), b"EXE").unwrap();

        let manifest = UploadManifest {
            local_path: dir.path().to_path_buf(),
            config: UploadConfig {
                game_name: "Test Game".into(),
                install_path: "/home/deck/Games/test".into(),
                executable: "game.exe".into(),
                launch_options: String::new(),
                tags: String::new(),
            },
            create_shortcut: false,
            shortcut: None,
        };

        let handle = spawn_upload(ws_client, manifest);
        let result = handle.join().await;
        assert!(matches!(result, Err(CoreError::NotConnected)));
    }
}
