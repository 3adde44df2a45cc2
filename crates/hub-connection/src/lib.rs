//! Hub connection manager for connecting to Agents.
//!
//! Provides WebSocket client, mDNS discovery integration,
//! and Hub-Agent pairing flow.

mod discovery;
pub mod error;
pub mod manager;
pub mod pairing;
pub(crate) mod pairing_flow;
pub(crate) mod pumps;
pub(crate) mod reconnection;
pub mod types;
pub mod upload;
pub mod ws_client;

pub use error::CoreError;
pub use manager::ConnectionManager;
pub use pairing::{PeerRecord, TokenStore};
pub use types::{ConnectedAgent, ConnectionEvent, ConnectionState, HubIdentity, ReconnectConfig};
pub use upload::{UploadHandle, UploadManifest};
pub use ws_client::{HandshakeResult, WsClient, WsError};
