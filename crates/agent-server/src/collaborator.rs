//! External integration point for platform-specific operations (Steam
//! shortcut management, artwork application, process control) that the
//! networking core itself does not implement.
//!
//! A concrete [`Collaborator`] is supplied by the binary embedding this
//! crate. Every method defaults to [`CollaboratorError::Unsupported`], so a
//! collaborator only needs to override the operations its platform
//! actually backs, and advertises those through
//! [`capabilities`](Collaborator::capabilities).

use std::future::Future;
use std::pin::Pin;

use capydeploy_protocol::messages::{
    ArtworkResponse, ConfigResponse, CreateShortcutResponse, DeleteGameResponse,
    RestartSteamResponse, SteamUser,
};
use capydeploy_protocol::types::{ArtworkConfig, ShortcutConfig, ShortcutInfo};

/// Error from a collaborator operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    /// Maps to the wire-level error kind carried back to the Hub.
    pub fn error_kind(&self) -> capydeploy_protocol::ErrorKind {
        use capydeploy_protocol::ErrorKind;
        match self {
            CollaboratorError::Unsupported => ErrorKind::BadRequest,
            CollaboratorError::Failed(_) => ErrorKind::Internal,
        }
    }
}

/// A boxed future returned by collaborator methods.
pub type CollaboratorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

/// Platform-specific operations the Agent delegates outside the networking
/// core: Steam shortcut management, artwork application, process control,
/// and telemetry sampling.
pub trait Collaborator: Send + Sync + 'static {
    /// Names of the operations this collaborator actually implements, for
    /// diagnostics (e.g. surfaced in `get_info`'s logs).
    fn capabilities(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Returns the Agent's persistent configuration (install root, ...).
    fn get_config(&self) -> CollaboratorFuture<'_, ConfigResponse> {
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Lists Steam users known to this machine.
    fn get_steam_users(&self) -> CollaboratorFuture<'_, Vec<SteamUser>> {
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Lists shortcuts for a given Steam user.
    fn list_shortcuts(&self, user_id: u32) -> CollaboratorFuture<'_, Vec<ShortcutInfo>> {
        let _ = user_id;
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Creates a new Steam shortcut.
    fn create_shortcut(
        &self,
        user_id: u32,
        shortcut: ShortcutConfig,
    ) -> CollaboratorFuture<'_, CreateShortcutResponse> {
        let _ = (user_id, shortcut);
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Deletes a Steam shortcut, optionally restarting Steam afterward.
    fn delete_shortcut(
        &self,
        user_id: u32,
        app_id: u32,
        name: String,
        restart_steam: bool,
    ) -> CollaboratorFuture<'_, ()> {
        let _ = (user_id, app_id, name, restart_steam);
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Removes an installed game entirely (files, shortcut, artwork).
    fn delete_game(&self, app_id: u32) -> CollaboratorFuture<'_, DeleteGameResponse> {
        let _ = app_id;
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Applies artwork images to an existing shortcut.
    fn apply_artwork(
        &self,
        user_id: String,
        app_id: u32,
        artwork: Option<ArtworkConfig>,
    ) -> CollaboratorFuture<'_, ArtworkResponse> {
        let _ = (user_id, app_id, artwork);
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Restarts the local Steam client.
    fn restart_steam(&self) -> CollaboratorFuture<'_, RestartSteamResponse> {
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }

    /// Samples a point-in-time telemetry snapshot (CPU/disk/thermal, ...).
    ///
    /// Not surfaced over the wire today; present so a collaborator can be
    /// polled by future diagnostics without changing this trait's shape.
    fn sample_telemetry(&self) -> CollaboratorFuture<'_, ()> {
        Box::pin(async { Err(CollaboratorError::Unsupported) })
    }
}

/// A [`Collaborator`] that implements nothing, for tests and headless runs.
pub struct NullCollaborator;

impl Collaborator for NullCollaborator {}
