pub mod constants;
pub mod envelope;
pub mod error;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{
    check_protocol_compatibility, MessageType, ProtocolCompatibility, PROTOCOL_VERSION,
};
pub use envelope::{Message, WsError};
pub use error::ErrorKind;
pub use types::{
    AgentInfo, ArtworkConfig, ShortcutConfig, ShortcutInfo, UploadConfig, UploadProgress,
    UploadState,
};
