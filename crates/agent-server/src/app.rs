//! Concrete [`Handler`] wiring pairing, auth, and upload state together into
//! a runnable Agent.
//!
//! This is the piece a binary actually constructs: everything else in this
//! crate (server, connection, auth, pairing) is generic infrastructure, and
//! [`collaborator::Collaborator`] is the seam for platform code this crate
//! never implements.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use capydeploy_protocol::ErrorKind;
use capydeploy_protocol::constants::{
    MessageType, PROTOCOL_VERSION, ProtocolCompatibility, check_protocol_compatibility,
};
use capydeploy_protocol::envelope::Message;
use capydeploy_protocol::messages::{
    ApplyArtworkRequest, AuthOkResponse, CancelUploadRequest, CompleteUploadRequest,
    ConfirmPairingRequest, CreateShortcutRequest, DeleteGameRequest, DeleteShortcutRequest,
    HubConnectedRequest, InfoResponse, InitUploadRequest, ListShortcutsRequest,
    PairSuccessResponse, PairingRequiredResponse, UploadChunkResponse, UploadProgressEvent,
};
use capydeploy_protocol::messages::{OperationResult, ShortcutsListResponse, SteamUsersResponse};
use capydeploy_protocol::types::AgentInfo;
use capydeploy_transfer::{ProgressTracker, UploadEngine, validate_upload_path};
use tokio::sync::{Mutex, RwLock};

use crate::auth::{AuthError, AuthStore};
use crate::collaborator::{Collaborator, CollaboratorError};
use crate::connection::Sender;
use crate::handler::{Handler, HandlerFuture};
use crate::pairing::PairingEngine;

/// Static identity and storage locations for an [`App`] instance.
pub struct AppConfig {
    /// Stable identifier for this Agent (independent of hostname).
    pub agent_id: String,
    pub agent_name: String,
    pub platform: String,
    pub version: String,
    /// Root directory for in-progress upload staging.
    pub staging_root: PathBuf,
    /// Path to the paired-Hub token store.
    pub auth_path: PathBuf,
    /// Shared flag controlling whether new Hubs may connect.
    pub accept_connections: Arc<AtomicBool>,
}

/// The Agent side of the protocol: a concrete [`Handler`] backed by
/// [`AuthStore`], [`PairingEngine`], and [`UploadEngine`], delegating
/// anything platform-specific to a [`Collaborator`].
pub struct App<C: Collaborator> {
    agent_id: String,
    agent_name: String,
    platform: String,
    version: String,
    accept_connections: Arc<AtomicBool>,
    auth: AuthStore,
    pairing: PairingEngine,
    uploads: UploadEngine,
    progress: Arc<ProgressTracker>,
    collaborator: Arc<C>,
    /// `hub_id` from the most recent `hub_connected`, so `confirm_pairing`
    /// (which carries only a code) knows who it belongs to.
    pending_hub_id: Mutex<Option<String>>,
    /// Sender for the currently authenticated/paired connection, used by
    /// the progress tracker's background callback to push events.
    active_sender: RwLock<Option<Sender>>,
}

impl<C: Collaborator> App<C> {
    /// Builds a new Agent, loading any persisted peer tokens from
    /// `config.auth_path`.
    pub fn new(config: AppConfig, collaborator: C) -> Result<Arc<Self>, AuthError> {
        let auth = AuthStore::new(config.auth_path)?;
        let progress = Arc::new(ProgressTracker::new(None));

        let app = Arc::new(Self {
            agent_id: config.agent_id,
            agent_name: config.agent_name,
            platform: config.platform,
            version: config.version,
            accept_connections: config.accept_connections,
            auth,
            pairing: PairingEngine::new(),
            uploads: UploadEngine::new(config.staging_root),
            progress,
            collaborator: Arc::new(collaborator),
            pending_hub_id: Mutex::new(None),
            active_sender: RwLock::new(None),
        });

        let push_target = Arc::clone(&app);
        app.progress.on_progress(Box::new(move |progress| {
            let Some(sender) = push_target.active_sender.try_read().ok().and_then(|s| s.clone())
            else {
                return;
            };
            let event = UploadProgressEvent {
                upload_id: progress.upload_id,
                transferred_bytes: progress.transferred_bytes,
                total_bytes: progress.total_bytes,
                current_file: progress.current_file,
                percentage: progress.percentage(),
            };
            if let Ok(msg) = Message::new(
                uuid::Uuid::new_v4().to_string(),
                MessageType::UploadProgress,
                Some(&event),
            ) {
                let _ = sender.send_msg(msg);
            }
        }));
        app.progress.start();

        Ok(app)
    }

    fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            id: self.agent_id.clone(),
            name: self.agent_name.clone(),
            platform: self.platform.clone(),
            version: self.version.clone(),
            accept_connections: self.accept_connections.load(Ordering::Relaxed),
            supported_image_formats: vec!["png".into(), "jpg".into()],
        }
    }

    async fn set_active(&self, sender: Sender) {
        *self.active_sender.write().await = Some(sender);
    }

    async fn clear_active(&self) {
        *self.active_sender.write().await = None;
    }

    /// Revokes a paired Hub's token.
    ///
    /// If the revoked peer is the one currently connected, the session is
    /// closed immediately with [`capydeploy_protocol::constants::WS_CLOSE_TOKEN_REVOKED`]
    /// rather than left open on a token that no longer verifies — the Hub's
    /// next request would otherwise hang until the heartbeat timeout
    /// instead of failing fast with `AuthFailed`.
    pub async fn revoke_peer(&self, peer_id: &str) -> Result<(), AuthError> {
        self.auth.remove(peer_id)?;

        let is_active = self.pending_hub_id.lock().await.as_deref() == Some(peer_id);
        if is_active {
            if let Some(sender) = self.active_sender.read().await.clone() {
                let _ = sender.close_with_code(
                    capydeploy_protocol::constants::WS_CLOSE_TOKEN_REVOKED,
                    "token revoked",
                );
            }
            *self.pending_hub_id.lock().await = None;
            self.clear_active().await;
        }

        Ok(())
    }
}

fn collaborator_error_code(err: &CollaboratorError) -> i32 {
    match err {
        CollaboratorError::Unsupported => 501,
        CollaboratorError::Failed(_) => 500,
    }
}

impl<C: Collaborator> Handler for App<C> {
    fn on_hub_connected(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: HubConnectedRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid hub_connected payload");
                    return;
                }
            };

            match check_protocol_compatibility(req.protocol_version) {
                ProtocolCompatibility::Incompatible { reason, .. } => {
                    let _ = sender.send_error(&msg, 406, &reason);
                    return;
                }
                ProtocolCompatibility::Deprecated { peer_version } => {
                    tracing::warn!(
                        peer_version,
                        current = PROTOCOL_VERSION,
                        "hub advertised an older protocol version"
                    );
                }
                ProtocolCompatibility::Compatible => {}
            }

            *self.pending_hub_id.lock().await = Some(req.hub_id.clone());

            let authenticated = !req.token.is_empty() && self.auth.verify_token(&req.hub_id, &req.token);

            if authenticated {
                let _ = self.auth.touch(&req.hub_id, chrono::Utc::now());
                self.set_active(sender.clone()).await;
                let resp = AuthOkResponse {
                    name: self.agent_name.clone(),
                    version: self.version.clone(),
                    platform: self.platform.clone(),
                    accept_connections: self.accept_connections.load(Ordering::Relaxed),
                    protocol_version: PROTOCOL_VERSION,
                };
                if let Ok(reply) = msg.reply(MessageType::AuthOk, Some(&resp)) {
                    let _ = sender.send_msg(reply);
                }
                return;
            }

            let (code, ttl) = self.pairing.begin_pair(&req.hub_id, &req.name, &req.platform);
            tracing::info!(hub = %req.name, "pairing required, code issued");
            let resp = PairingRequiredResponse {
                code,
                expires_in: ttl as i32,
            };
            if let Ok(reply) = msg.reply(MessageType::PairingRequired, Some(&resp)) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_confirm_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: ConfirmPairingRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid confirm_pairing payload");
                    return;
                }
            };

            let hub_id = self.pending_hub_id.lock().await.clone();
            let Some(hub_id) = hub_id else {
                let result = OperationResult {
                    ok: false,
                    error_kind: Some(ErrorKind::NoPendingPairing),
                    message: "no pairing in progress".into(),
                };
                if let Ok(reply) = msg.reply(MessageType::OperationResult, Some(&result)) {
                    let _ = sender.send_msg(reply);
                }
                return;
            };

            match self.pairing.verify(&hub_id, &req.code, &self.auth) {
                Ok(token) => {
                    self.set_active(sender.clone()).await;
                    let resp = PairSuccessResponse { token };
                    if let Ok(reply) = msg.reply(MessageType::PairSuccess, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let result = OperationResult {
                        ok: false,
                        error_kind: Some(e.error_kind()),
                        message: e.to_string(),
                    };
                    if let Ok(reply) = msg.reply(MessageType::OperationResult, Some(&result)) {
                        let _ = sender.send_msg(reply);
                    }
                }
            }
        })
    }

    fn on_get_info(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let resp = InfoResponse {
                agent: self.agent_info(),
                capabilities: self
                    .collaborator
                    .capabilities()
                    .into_iter()
                    .map(String::from)
                    .collect(),
            };
            if let Ok(reply) = msg.reply(MessageType::InfoResponse, Some(&resp)) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_get_config(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.collaborator.get_config().await {
                Ok(resp) => {
                    if let Ok(reply) = msg.reply(MessageType::ConfigResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, collaborator_error_code(&e), &e.to_string());
                }
            }
        })
    }

    fn on_get_steam_users(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.collaborator.get_steam_users().await {
                Ok(users) => {
                    let resp = SteamUsersResponse { users };
                    if let Ok(reply) = msg.reply(MessageType::SteamUsersResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, collaborator_error_code(&e), &e.to_string());
                }
            }
        })
    }

    fn on_list_shortcuts(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: ListShortcutsRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid list_shortcuts payload");
                    return;
                }
            };
            match self.collaborator.list_shortcuts(req.user_id).await {
                Ok(shortcuts) => {
                    let resp = ShortcutsListResponse { shortcuts };
                    if let Ok(reply) = msg.reply(MessageType::ShortcutsResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, collaborator_error_code(&e), &e.to_string());
                }
            }
        })
    }

    fn on_create_shortcut(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: CreateShortcutRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid create_shortcut payload");
                    return;
                }
            };
            match self
                .collaborator
                .create_shortcut(req.user_id, req.shortcut)
                .await
            {
                Ok(resp) => {
                    if let Ok(reply) = msg.reply(MessageType::SteamResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, collaborator_error_code(&e), &e.to_string());
                }
            }
        })
    }

    fn on_delete_shortcut(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: DeleteShortcutRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid delete_shortcut payload");
                    return;
                }
            };
            let result = match self
                .collaborator
                .delete_shortcut(req.user_id, req.app_id, req.name, req.restart_steam)
                .await
            {
                Ok(()) => OperationResult {
                    ok: true,
                    error_kind: None,
                    message: String::new(),
                },
                Err(e) => OperationResult {
                    ok: false,
                    error_kind: Some(e.error_kind()),
                    message: e.to_string(),
                },
            };
            if let Ok(reply) = msg.reply(MessageType::OperationResult, Some(&result)) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_delete_game(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: DeleteGameRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid delete_game payload");
                    return;
                }
            };
            match self.collaborator.delete_game(req.app_id).await {
                Ok(resp) => {
                    if let Ok(reply) = msg.reply(MessageType::SteamResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, collaborator_error_code(&e), &e.to_string());
                }
            }
        })
    }

    fn on_apply_artwork(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: ApplyArtworkRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid apply_artwork payload");
                    return;
                }
            };
            match self
                .collaborator
                .apply_artwork(req.user_id, req.app_id, req.artwork)
                .await
            {
                Ok(resp) => {
                    if let Ok(reply) = msg.reply(MessageType::ArtworkResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, collaborator_error_code(&e), &e.to_string());
                }
            }
        })
    }

    fn on_restart_steam(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            match self.collaborator.restart_steam().await {
                Ok(resp) => {
                    if let Ok(reply) = msg.reply(MessageType::SteamResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, collaborator_error_code(&e), &e.to_string());
                }
            }
        })
    }

    fn on_init_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: InitUploadRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid init_upload payload");
                    return;
                }
            };

            for file in &req.files {
                if let Err(e) = validate_upload_path(&file.relative_path) {
                    let _ = sender.send_error(&msg, 400, &e.to_string());
                    return;
                }
            }

            match self.uploads.init_upload(req.config, req.total_size, req.files).await {
                Ok((staged, resp)) => {
                    self.progress.track(staged.session.clone());
                    if let Ok(reply) = msg.reply(MessageType::UploadResponse, Some(&resp)) {
                        let _ = sender.send_msg(reply);
                    }
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, 500, &e.to_string());
                }
            }
        })
    }

    fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: CompleteUploadRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid complete_upload payload");
                    return;
                }
            };

            let Some(staged) = self.uploads.get(&req.upload_id).await else {
                let _ = sender.send_error(&msg, 404, "unknown upload_id");
                return;
            };

            if let Some(cached) = staged.cached_result().await {
                if let Ok(reply) = msg.reply(MessageType::UploadResponse, Some(&cached)) {
                    let _ = sender.send_msg(reply);
                }
                return;
            }

            let install_path = match self.uploads.complete_upload(&req.upload_id).await {
                Ok(path) => path,
                Err(e) => {
                    let code = match e.error_kind() {
                        ErrorKind::IncompleteUpload => 409,
                        _ => 500,
                    };
                    let _ = sender.send_error(&msg, code, &e.to_string());
                    return;
                }
            };
            self.progress.untrack(&req.upload_id);

            // The commit already happened on disk; a shortcut-creation
            // failure is reported but doesn't roll back the install.
            let app_id = if req.create_shortcut {
                match req.shortcut {
                    Some(shortcut) => match self.collaborator.create_shortcut(0, shortcut).await {
                        Ok(resp) => resp.app_id,
                        Err(e) => {
                            tracing::warn!(error = %e, "shortcut creation failed after upload commit");
                            0
                        }
                    },
                    None => 0,
                }
            } else {
                0
            };

            let resp = capydeploy_protocol::messages::CompleteUploadResponse {
                success: true,
                path: install_path.to_string_lossy().into_owned(),
                app_id,
            };
            staged.set_result(resp.clone()).await;

            if let Ok(reply) = msg.reply(MessageType::UploadResponse, Some(&resp)) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_cancel_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: CancelUploadRequest = match msg.parse_payload() {
                Ok(Some(r)) => r,
                _ => {
                    let _ = sender.send_error(&msg, 400, "invalid cancel_upload payload");
                    return;
                }
            };

            self.progress.untrack(&req.upload_id);
            let result = match self.uploads.cancel_upload(&req.upload_id).await {
                Ok(()) => OperationResult {
                    ok: true,
                    error_kind: None,
                    message: String::new(),
                },
                Err(e) => OperationResult {
                    ok: false,
                    error_kind: Some(e.error_kind()),
                    message: e.to_string(),
                },
            };
            if let Ok(reply) = msg.reply(MessageType::OperationResult, Some(&result)) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: crate::binary::BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Err(e) = validate_upload_path(&header.relative_path) {
                let resp = UploadChunkResponse {
                    upload_id: header.upload_id,
                    ok: false,
                    bytes_written: 0,
                    total_written: 0,
                    error_kind: Some(e.error_kind()),
                };
                if let Ok(reply) =
                    Message::new(header.id, MessageType::UploadChunkResponse, Some(&resp))
                {
                    let _ = sender.send_msg(reply);
                }
                return;
            }

            let Some(staged) = self.uploads.get(&header.upload_id).await else {
                let resp = UploadChunkResponse {
                    upload_id: header.upload_id,
                    ok: false,
                    bytes_written: 0,
                    total_written: 0,
                    error_kind: Some(ErrorKind::BadRequest),
                };
                if let Ok(reply) =
                    Message::new(header.id, MessageType::UploadChunkResponse, Some(&resp))
                {
                    let _ = sender.send_msg(reply);
                }
                return;
            };

            if !staged.session.is_active() {
                let e = capydeploy_transfer::TransferError::SessionNotActive(
                    header.upload_id.clone(),
                );
                let resp = UploadChunkResponse {
                    upload_id: header.upload_id,
                    ok: false,
                    bytes_written: 0,
                    total_written: 0,
                    error_kind: Some(e.error_kind()),
                };
                if let Ok(reply) =
                    Message::new(header.id, MessageType::UploadChunkResponse, Some(&resp))
                {
                    let _ = sender.send_msg(reply);
                }
                return;
            }

            let chunk = capydeploy_transfer::Chunk {
                offset: header.offset,
                size: header.length,
                data,
                file_path: header.relative_path.clone(),
                checksum: header.checksum.clone(),
            };

            let write_result = { staged.writer.lock().await.write_chunk(&chunk) };

            let resp = match write_result {
                Ok(()) => {
                    staged
                        .session
                        .add_progress(chunk.size as i64, &chunk.file_path, chunk.offset);
                    self.progress.notify_progress(&header.upload_id);
                    UploadChunkResponse {
                        upload_id: header.upload_id.clone(),
                        ok: true,
                        bytes_written: chunk.size as i64,
                        total_written: staged.session.get_resume_offset(&chunk.file_path),
                        error_kind: None,
                    }
                }
                Err(e) => UploadChunkResponse {
                    upload_id: header.upload_id.clone(),
                    ok: false,
                    bytes_written: 0,
                    total_written: staged.session.get_resume_offset(&chunk.file_path),
                    error_kind: Some(e.error_kind()),
                },
            };

            if let Ok(reply) =
                Message::new(header.id, MessageType::UploadChunkResponse, Some(&resp))
            {
                let _ = sender.send_msg(reply);
            }
        })
    }

    fn on_hub_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.clear_active().await;
            *self.pending_hub_id.lock().await = None;
        })
    }
}
