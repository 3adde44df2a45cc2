//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide domain logic (shortcuts, uploads, Steam control,
//! ...) while the server framework handles connection management, routing,
//! and the binary protocol.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use capydeploy_protocol::envelope::Message;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling WebSocket messages from a Hub.
///
/// The server dispatches parsed messages to the appropriate method. Each
/// method receives:
/// - `sender`: channel to send responses/events back to the Hub
/// - `msg`: the parsed JSON envelope (for text) or binary message
///
/// Default implementations reply with "not implemented" so handlers only
/// need to override the message types they care about.
pub trait Handler: Send + Sync + 'static {
    /// Called when a Hub first connects (`hub_connected`).
    /// The handler should validate auth/pairing and send `auth_ok` or
    /// `pairing_required` via the sender.
    fn on_hub_connected(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called when a Hub confirms pairing (`confirm_pairing`).
    fn on_confirm_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "pairing not implemented");
        })
    }

    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) =
                msg.reply(capydeploy_protocol::MessageType::Pong, Option::<&()>::None)
            {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `get_info`.
    fn on_get_info(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `get_config`.
    fn on_get_config(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `get_steam_users`.
    fn on_get_steam_users(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `list_shortcuts`.
    fn on_list_shortcuts(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `create_shortcut`.
    fn on_create_shortcut(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `delete_shortcut`.
    fn on_delete_shortcut(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `delete_game`.
    fn on_delete_game(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `apply_artwork`.
    fn on_apply_artwork(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `restart_steam`.
    fn on_restart_steam(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `init_upload`.
    fn on_init_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `complete_upload`.
    fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for `cancel_upload`.
    fn on_cancel_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, 501, "not implemented");
        })
    }

    /// Called for a binary upload chunk (`upload_chunk`, carried as a binary
    /// frame, never as JSON — see the frame codec in `capydeploy-protocol`).
    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: crate::binary::BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = (header, data);
        Box::pin(async move {
            tracing::warn!("binary chunk received but handler not implemented");
            let _ = sender;
        })
    }

    /// Called when the Hub disconnects (cleanup hook).
    fn on_hub_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}

/// Forwards to the wrapped handler, so `Arc<App<C>>` (the only constructible
/// form of [`crate::App`], since its progress callback captures itself via
/// `Arc::clone`) can be handed to [`crate::AgentServer`] directly.
impl<T: Handler + ?Sized> Handler for Arc<T> {
    fn on_hub_connected(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_hub_connected(sender, msg)
    }

    fn on_confirm_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_confirm_pairing(sender, msg)
    }

    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_ping(sender, msg)
    }

    fn on_get_info(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_get_info(sender, msg)
    }

    fn on_get_config(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_get_config(sender, msg)
    }

    fn on_get_steam_users(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_get_steam_users(sender, msg)
    }

    fn on_list_shortcuts(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_list_shortcuts(sender, msg)
    }

    fn on_create_shortcut(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_create_shortcut(sender, msg)
    }

    fn on_delete_shortcut(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_delete_shortcut(sender, msg)
    }

    fn on_delete_game(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_delete_game(sender, msg)
    }

    fn on_apply_artwork(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_apply_artwork(sender, msg)
    }

    fn on_restart_steam(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_restart_steam(sender, msg)
    }

    fn on_init_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_init_upload(sender, msg)
    }

    fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_complete_upload(sender, msg)
    }

    fn on_cancel_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        (**self).on_cancel_upload(sender, msg)
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: crate::binary::BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        (**self).on_binary_chunk(sender, header, data)
    }

    fn on_hub_disconnected(&self) -> HandlerFuture<'_> {
        (**self).on_hub_disconnected()
    }
}
