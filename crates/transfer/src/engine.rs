//! Upload session lifecycle: staging directories, disk-backed resume, and
//! `upload_id` reuse for concurrent `init_upload` calls against the same
//! manifest.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use capydeploy_protocol::messages::{CompleteUploadResponse, FileEntry, InitUploadResponse};
use capydeploy_protocol::types::UploadConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chunked::ChunkWriter;
use crate::manifest::manifest_hash;
use crate::types::UploadSession;
use crate::{DEFAULT_CHUNK_SIZE, RESUME_WINDOW, TransferError};

/// Sidecar recorded alongside a staging directory so a later `init_upload`
/// can recognise it as belonging to the same manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestSidecar {
    install_path: String,
    total_size: i64,
    file_manifest_hash: String,
}

/// A staged upload in progress: its session state, the writer appending
/// chunks to disk, and (once completed) the cached response for
/// idempotent `complete_upload` retries.
pub struct StagedUpload {
    pub session: Arc<UploadSession>,
    pub writer: Mutex<ChunkWriter>,
    pub staging_dir: PathBuf,
    result: Mutex<Option<CompleteUploadResponse>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl StagedUpload {
    /// Returns the cached completion response, if `complete_upload` already
    /// ran successfully once for this session.
    pub async fn cached_result(&self) -> Option<CompleteUploadResponse> {
        self.result.lock().await.clone()
    }

    /// Records the completion response so later `complete_upload` calls for
    /// the same `upload_id` replay it instead of re-running the commit.
    pub async fn set_result(&self, response: CompleteUploadResponse) {
        *self.result.lock().await = Some(response);
    }

    async fn cancel_pending_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().await.take() {
            handle.abort();
        }
    }
}

/// Tracks all active and recently-cancelled uploads for an Agent process.
pub struct UploadEngine {
    staging_root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<StagedUpload>>>,
    by_manifest: RwLock<HashMap<String, String>>,
}

impl UploadEngine {
    /// Creates an engine rooted at `staging_root` (created if missing).
    pub fn new(staging_root: PathBuf) -> Self {
        Self {
            staging_root,
            sessions: RwLock::new(HashMap::new()),
            by_manifest: RwLock::new(HashMap::new()),
        }
    }

    /// Begins (or resumes) an upload session for the given manifest.
    ///
    /// A concurrent or repeated `init_upload` with an identical manifest
    /// hash while a session is still active resolves to that same session.
    /// Otherwise, if a staging directory from a prior (cancelled or
    /// interrupted) session matches the manifest hash, its on-disk state is
    /// adopted and `resume_from` is computed by stat-ing each expected file.
    pub async fn init_upload(
        &self,
        config: UploadConfig,
        total_size: i64,
        files: Vec<FileEntry>,
    ) -> Result<(Arc<StagedUpload>, InitUploadResponse), TransferError> {
        let hash = manifest_hash(&config.install_path, total_size, &files);

        if let Some(upload_id) = self.by_manifest.read().await.get(&hash).cloned() {
            if let Some(staged) = self.sessions.read().await.get(&upload_id).cloned() {
                if staged.session.is_active() {
                    staged.cancel_pending_cleanup().await;
                    let resume_from = self.stat_resume_offsets(&staged, &files).await?;
                    let resp = InitUploadResponse {
                        upload_id,
                        chunk_size: DEFAULT_CHUNK_SIZE as i32,
                        resume_from: Some(resume_from),
                    };
                    return Ok((staged, resp));
                }
            }
        }

        // No live session — look for an abandoned staging directory whose
        // sidecar matches this manifest, and resume into it if found.
        let existing = self.find_matching_staging_dir(&hash).await?;
        let (upload_id, staging_dir, resume_from) = match existing {
            Some((upload_id, staging_dir)) => {
                let resume_from = self.stat_dir_offsets(&staging_dir, &files).await?;
                (upload_id, staging_dir, Some(resume_from))
            }
            None => {
                let upload_id = uuid::Uuid::new_v4().to_string();
                let staging_dir = self.staging_root.join(&upload_id);
                tokio::fs::create_dir_all(&staging_dir).await?;
                self.write_sidecar(&upload_id, &config.install_path, total_size, &hash)
                    .await?;
                (upload_id, staging_dir, None)
            }
        };

        let mut writer = ChunkWriter::new(&staging_dir);
        if let Some(ref offsets) = resume_from {
            for (path, offset) in offsets {
                writer.seed_offset(path, *offset);
            }
        }

        let session = Arc::new(UploadSession::new(
            upload_id.clone(),
            config,
            total_size,
            files,
        ));
        session.start();
        if let Some(ref offsets) = resume_from {
            for (path, offset) in offsets {
                session.add_progress(*offset, path, 0);
            }
        }

        let staged = Arc::new(StagedUpload {
            session,
            writer: Mutex::new(writer),
            staging_dir,
            result: Mutex::new(None),
            cleanup: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        self.sessions
            .write()
            .await
            .insert(upload_id.clone(), staged.clone());
        self.by_manifest.write().await.insert(hash, upload_id.clone());

        Ok((
            staged,
            InitUploadResponse {
                upload_id,
                chunk_size: DEFAULT_CHUNK_SIZE as i32,
                resume_from,
            },
        ))
    }

    /// Returns a tracked upload by id.
    pub async fn get(&self, upload_id: &str) -> Option<Arc<StagedUpload>> {
        self.sessions.read().await.get(upload_id).cloned()
    }

    /// Cancels an upload: marks the session cancelled, drops its writer's
    /// open handles, and schedules the staging directory for deletion after
    /// [`RESUME_WINDOW`] unless a matching `init_upload` resumes it first.
    pub async fn cancel_upload(&self, upload_id: &str) -> Result<(), TransferError> {
        let staged = self
            .get(upload_id)
            .await
            .ok_or_else(|| TransferError::SessionNotFound(upload_id.to_string()))?;

        staged.session.cancel();

        let staging_dir = staged.staging_dir.clone();
        let cancel = staged.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(RESUME_WINDOW) => {
                    if let Err(e) = tokio::fs::remove_dir_all(&staging_dir).await {
                        tracing::warn!(path = %staging_dir.display(), error = %e, "failed to clean up staging dir");
                    }
                }
            }
        });
        *staged.cleanup.lock().await = Some(handle);

        Ok(())
    }

    /// Validates every staged file against its declared size, then
    /// atomically renames the staging directory into its install path.
    ///
    /// Returns [`TransferError::IncompleteUpload`] without touching disk if
    /// any file is short. Callers are responsible for checking
    /// [`StagedUpload::cached_result`] before calling this a second time for
    /// the same `upload_id`, since the staging directory no longer exists
    /// once the rename has succeeded.
    pub async fn complete_upload(&self, upload_id: &str) -> Result<PathBuf, TransferError> {
        let staged = self
            .get(upload_id)
            .await
            .ok_or_else(|| TransferError::SessionNotFound(upload_id.to_string()))?;

        if !staged.session.is_active() {
            return Err(TransferError::SessionNotActive(upload_id.to_string()));
        }

        staged.cancel_pending_cleanup().await;

        for file in staged.session.files() {
            let path = staged.staging_dir.join(&file.relative_path);
            let actual = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len() as i64,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            if actual != file.size {
                return Err(TransferError::IncompleteUpload {
                    relative_path: file.relative_path,
                    expected: file.size,
                    actual,
                });
            }
        }

        staged.session.finalise();

        let install_path = PathBuf::from(staged.session.config().install_path);
        if let Some(parent) = install_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::metadata(&install_path).await.is_ok() {
            tokio::fs::remove_dir_all(&install_path).await?;
        }
        tokio::fs::rename(&staged.staging_dir, &install_path).await?;
        let _ = tokio::fs::remove_file(self.sidecar_path(upload_id)).await;

        staged.session.complete();
        Ok(install_path)
    }

    /// Removes the session (and its manifest index entry) permanently,
    /// typically once `complete_upload` has committed the result.
    pub async fn forget(&self, upload_id: &str) {
        self.sessions.write().await.remove(upload_id);
        self.by_manifest
            .write()
            .await
            .retain(|_, v| v != upload_id);
    }

    async fn write_sidecar(
        &self,
        upload_id: &str,
        install_path: &str,
        total_size: i64,
        hash: &str,
    ) -> Result<(), TransferError> {
        let sidecar = ManifestSidecar {
            install_path: install_path.to_string(),
            total_size,
            file_manifest_hash: hash.to_string(),
        };
        let json = serde_json::to_vec(&sidecar)
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(self.sidecar_path(upload_id), json).await?;
        Ok(())
    }

    fn sidecar_path(&self, upload_id: &str) -> PathBuf {
        self.staging_root.join(format!("{upload_id}.manifest"))
    }

    async fn find_matching_staging_dir(
        &self,
        hash: &str,
    ) -> Result<Option<(String, PathBuf)>, TransferError> {
        let mut entries = match tokio::fs::read_dir(&self.staging_root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("manifest") {
                continue;
            }
            let Ok(data) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(sidecar) = serde_json::from_slice::<ManifestSidecar>(&data) else {
                continue;
            };
            if sidecar.file_manifest_hash == hash {
                let upload_id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let staging_dir = self.staging_root.join(&upload_id);
                if staging_dir.is_dir() {
                    return Ok(Some((upload_id, staging_dir)));
                }
            }
        }
        Ok(None)
    }

    /// Computes resume offsets for a live, tracked session by stat-ing its
    /// staging directory directly (the source of truth, not the in-memory
    /// `chunk_offsets` cache).
    async fn stat_resume_offsets(
        &self,
        staged: &StagedUpload,
        files: &[FileEntry],
    ) -> Result<HashMap<String, i64>, TransferError> {
        self.stat_dir_offsets(&staged.staging_dir, files).await
    }

    async fn stat_dir_offsets(
        &self,
        staging_dir: &std::path::Path,
        files: &[FileEntry],
    ) -> Result<HashMap<String, i64>, TransferError> {
        let mut offsets = HashMap::new();
        for file in files {
            let path = staging_dir.join(&file.relative_path);
            let size = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len() as i64,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            offsets.insert(file.relative_path.clone(), size.min(file.size));
        }
        Ok(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploadConfig {
        UploadConfig {
            game_name: "TestGame".into(),
            install_path: "/games/test".into(),
            executable: "game.exe".into(),
            launch_options: String::new(),
            tags: String::new(),
        }
    }

    fn files() -> Vec<FileEntry> {
        vec![FileEntry {
            relative_path: "game.exe".into(),
            size: 1024,
        }]
    }

    #[tokio::test]
    async fn init_upload_creates_fresh_session() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());

        let (staged, resp) = engine
            .init_upload(config(), 1024, files())
            .await
            .unwrap();

        assert!(resp.resume_from.is_none());
        assert!(staged.session.is_active());
        assert!(staged.staging_dir.exists());
    }

    #[tokio::test]
    async fn repeated_init_upload_same_manifest_reuses_session() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());

        let (staged1, resp1) = engine
            .init_upload(config(), 1024, files())
            .await
            .unwrap();
        let (staged2, resp2) = engine
            .init_upload(config(), 1024, files())
            .await
            .unwrap();

        assert_eq!(resp1.upload_id, resp2.upload_id);
        assert!(Arc::ptr_eq(&staged1.session, &staged2.session));
    }

    #[tokio::test]
    async fn different_manifest_gets_distinct_session() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());

        let (_staged1, resp1) = engine
            .init_upload(config(), 1024, files())
            .await
            .unwrap();
        let (_staged2, resp2) = engine
            .init_upload(config(), 2048, files())
            .await
            .unwrap();

        assert_ne!(resp1.upload_id, resp2.upload_id);
    }

    #[tokio::test]
    async fn cancel_then_resume_within_window_reuses_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());

        let (staged, resp) = engine
            .init_upload(config(), 1024, files())
            .await
            .unwrap();
        let upload_id = resp.upload_id.clone();
        let staging_dir = staged.staging_dir.clone();

        // Simulate a partially-written file before cancelling.
        tokio::fs::write(staging_dir.join("game.exe"), vec![0u8; 512])
            .await
            .unwrap();

        engine.cancel_upload(&upload_id).await.unwrap();
        engine.forget(&upload_id).await;

        let (_staged2, resp2) = engine
            .init_upload(config(), 1024, files())
            .await
            .unwrap();

        let resume = resp2.resume_from.unwrap();
        assert_eq!(resume.get("game.exe"), Some(&512));
    }

    #[tokio::test]
    async fn cancel_unknown_upload_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());
        let result = engine.cancel_upload("nonexistent").await;
        assert!(matches!(result, Err(TransferError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn completion_result_is_cached_for_idempotent_retries() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());
        let (staged, _resp) = engine
            .init_upload(config(), 1024, files())
            .await
            .unwrap();

        assert!(staged.cached_result().await.is_none());

        let response = CompleteUploadResponse {
            success: true,
            path: "/games/test".into(),
            app_id: 42,
        };
        staged.set_result(response.clone()).await;

        assert_eq!(staged.cached_result().await, Some(response));
    }

    #[tokio::test]
    async fn complete_upload_renames_staging_dir_into_install_path() {
        let dir = tempfile::tempdir().unwrap();
        let install_root = tempfile::tempdir().unwrap();
        let install_path = install_root.path().join("TestGame");
        let mut cfg = config();
        cfg.install_path = install_path.to_string_lossy().into_owned();
        let engine = UploadEngine::new(dir.path().to_path_buf());

        let (staged, resp) = engine.init_upload(cfg, 1024, files()).await.unwrap();
        tokio::fs::write(staged.staging_dir.join("game.exe"), vec![0u8; 1024])
            .await
            .unwrap();

        let committed = engine.complete_upload(&resp.upload_id).await.unwrap();
        assert_eq!(committed, install_path);
        assert!(install_path.join("game.exe").exists());
        assert!(!staged.staging_dir.exists());
        assert_eq!(staged.session.status(), capydeploy_protocol::types::UploadState::Done);
    }

    #[tokio::test]
    async fn complete_upload_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());

        let (staged, resp) = engine.init_upload(config(), 1024, files()).await.unwrap();
        tokio::fs::write(staged.staging_dir.join("game.exe"), vec![0u8; 100])
            .await
            .unwrap();

        let result = engine.complete_upload(&resp.upload_id).await;
        assert!(matches!(
            result,
            Err(TransferError::IncompleteUpload { expected: 1024, actual: 100, .. })
        ));
    }

    #[tokio::test]
    async fn complete_upload_unknown_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());
        let result = engine.complete_upload("nonexistent").await;
        assert!(matches!(result, Err(TransferError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn complete_upload_rejects_cancelled_session() {
        let dir = tempfile::tempdir().unwrap();
        let engine = UploadEngine::new(dir.path().to_path_buf());

        let (staged, resp) = engine.init_upload(config(), 1024, files()).await.unwrap();
        tokio::fs::write(staged.staging_dir.join("game.exe"), vec![0u8; 1024])
            .await
            .unwrap();
        engine.cancel_upload(&resp.upload_id).await.unwrap();

        let result = engine.complete_upload(&resp.upload_id).await;
        assert!(matches!(result, Err(TransferError::SessionNotActive(_))));
    }
}
