//! Hub connection management: read/write pumps, ping/pong, send buffering.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use capydeploy_protocol::constants::{
    MessageType, WS_MAX_MESSAGE_SIZE, WS_MAX_TEXT_FRAME_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use capydeploy_protocol::envelope::Message;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::binary::parse_binary_message;
use crate::handler::Handler;

/// Upper bound on handler invocations running concurrently for a single
/// Hub connection. Bounds memory and file-descriptor use when a Hub fires
/// off many requests back to back; excess requests simply wait for a
/// permit rather than piling up unbounded spawned tasks.
const HANDLER_CONCURRENCY: usize = 16;

/// Metadata about the connected Hub.
#[derive(Debug, Clone)]
pub struct HubMeta {
    pub name: String,
    pub version: String,
    pub hub_id: String,
    pub remote_addr: String,
}

/// Handle for sending messages to the connected Hub.
///
/// Cloneable and cheap, wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the channel is closed (Hub disconnected).
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Sends a raw binary frame.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Binary(data.into()))
            .map_err(|_| SendError)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Sends a WebSocket close frame with a specific close code.
    ///
    /// Used to actively tear down a session instead of waiting for the
    /// Hub to notice on its own — e.g. when its pairing token is revoked
    /// while connected, the frame carries [`capydeploy_protocol::constants::WS_CLOSE_TOKEN_REVOKED`]
    /// so the Hub knows not to reconnect with the same token.
    pub fn close_with_code(&self, code: u16, reason: &str) -> Result<(), SendError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.tx
            .try_send(WsMessage::Close(Some(frame)))
            .map_err(|_| SendError)
    }

    /// Builds a `Sender` directly from a channel half, for handler tests
    /// that need to inspect what a `Handler` impl sends without spinning
    /// up a real WebSocket connection.
    #[cfg(test)]
    pub(crate) fn for_test(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a Hub.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct HubConnection {
    pub meta: HubMeta,
    sender: Sender,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    healthy: Arc<AtomicBool>,
}

impl HubConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Returns `false` once the read pump has observed silence past
    /// [`WS_PONG_WAIT`] — i.e. two missed heartbeat periods — even if the
    /// connection hasn't been torn down yet. Used to decide whether a new
    /// `hub_connected` should evict this connection or be rejected as busy.
    pub fn is_heartbeat_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed) && self.sender.is_connected()
    }

    /// Signals shutdown without waiting for the pumps to finish.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signals shutdown and waits for the read/write pumps to actually
    /// finish, so a caller can rely on the connection's resources (the
    /// WS socket, any in-flight handler task) being fully torn down
    /// before proceeding — e.g. before accepting a replacement Hub.
    pub async fn close_and_wait(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// Returns the [`HubConnection`] handle. The pumps run as background
/// tokio tasks and stop when the connection is closed or the cancel
/// token is triggered.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: HubMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> HubConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };
    let healthy = Arc::new(AtomicBool::new(true));
    let handler_slots = Arc::new(Semaphore::new(HANDLER_CONCURRENCY));

    let (ws_sink, ws_stream) = ws_stream.split();

    // Write pump.
    let write_cancel = cancel.clone();
    let write_task = tokio::spawn(write_pump(ws_sink, rx, write_cancel));

    // Read pump.
    let read_cancel = cancel.clone();
    let read_handler = handler.clone();
    let read_sender = sender.clone();
    let read_meta = meta.clone();
    let read_healthy = healthy.clone();
    let read_task = tokio::spawn(async move {
        read_pump(
            ws_stream,
            read_sender,
            read_handler,
            read_cancel.clone(),
            read_healthy,
            handler_slots,
        )
        .await;
        // When read pump exits, cancel the write pump too.
        read_cancel.cancel();
        handler.on_hub_disconnected().await;
        tracing::info!(hub = %read_meta.name, "hub disconnected");
    });

    HubConnection {
        meta,
        sender,
        cancel,
        tasks: vec![write_task, read_task],
        healthy,
    }
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
///
/// Tracks heartbeat liveness with a two-strikes rule: a ping tick
/// (`WS_PING_PERIOD`) with no frame received since the last one counts as
/// a missed beat; `healthy` flips to `false` as soon as a second
/// consecutive beat is missed (i.e. `WS_PONG_WAIT`, two ping periods, of
/// total silence), so callers deciding busy-vs-evict see staleness before
/// the connection is actually torn down.
async fn read_pump<S, H>(
    mut stream: S,
    sender: Sender,
    handler: Arc<H>,
    cancel: CancellationToken,
    healthy: Arc<AtomicBool>,
    handler_slots: Arc<Semaphore>,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let beats_per_wait = (WS_PONG_WAIT.as_secs_f64() / WS_PING_PERIOD.as_secs_f64()).ceil() as u32;
    let mut beat = tokio::time::interval(WS_PING_PERIOD);
    beat.reset();
    let mut missed_beats = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = beat.tick() => {
                missed_beats += 1;
                if missed_beats >= 2 {
                    healthy.store(false, Ordering::Relaxed);
                }
                if missed_beats >= beats_per_wait {
                    tracing::warn!("heartbeat silence exceeded {:?}, closing connection", WS_PONG_WAIT);
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        missed_beats = 0;
                        healthy.store(true, Ordering::Relaxed);
                        beat.reset();
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_TEXT_FRAME_SIZE {
                                    tracing::error!(
                                        "text frame exceeds {} byte limit ({}), closing session with ProtocolViolation",
                                        WS_MAX_TEXT_FRAME_SIZE, text.len()
                                    );
                                    break;
                                }
                                dispatch_text(&handler, &sender, &text, &handler_slots).await;
                            }
                            WsMessage::Binary(data) => {
                                if data.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_binary(&handler, &sender, &data, &handler_slots).await;
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Ping(data) => {
                                // Auto-respond to pings from Hub.
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::info!("received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
///
/// Runs the handler call on its own task, gated by a permit from
/// `handler_slots`, so a burst of requests can't spawn unbounded
/// concurrent work. A handler panic is caught at the task boundary and
/// turned into an `Internal` error reply instead of taking down the read
/// pump.
async fn dispatch_text<H: Handler>(
    handler: &Arc<H>,
    sender: &Sender,
    text: &str,
    handler_slots: &Arc<Semaphore>,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    if msg.msg_type == MessageType::UploadChunk {
        tracing::warn!("upload_chunk must arrive as a binary frame, not JSON text");
        let _ = sender.send_error(&msg, 400, "upload_chunk must be sent as a binary frame");
        return;
    }

    let Ok(permit) = handler_slots.clone().acquire_owned().await else {
        return;
    };
    let handler = handler.clone();
    let sender = sender.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let msg_id = msg.id.clone();
        let msg_type = msg.msg_type;
        let reply_sender = sender.clone();
        let outcome = AssertUnwindSafe(run_handler(&handler, sender, msg))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!(id = %msg_id, msg_type = ?msg_type, "handler panicked while processing request");
            let _ = reply_sender.send_msg(Message::error(msg_id, 500, "internal error"));
        }
    });
}

/// Invokes the handler method matching `msg.msg_type`.
async fn run_handler<H: Handler>(handler: &Arc<H>, s: Sender, msg: Message) {
    match msg.msg_type {
        MessageType::HubConnected => handler.on_hub_connected(s, msg).await,
        MessageType::ConfirmPairing => handler.on_confirm_pairing(s, msg).await,
        MessageType::Ping => handler.on_ping(s, msg).await,
        MessageType::GetInfo => handler.on_get_info(s, msg).await,
        MessageType::GetConfig => handler.on_get_config(s, msg).await,
        MessageType::GetSteamUsers => handler.on_get_steam_users(s, msg).await,
        MessageType::ListShortcuts => handler.on_list_shortcuts(s, msg).await,
        MessageType::CreateShortcut => handler.on_create_shortcut(s, msg).await,
        MessageType::DeleteShortcut => handler.on_delete_shortcut(s, msg).await,
        MessageType::DeleteGame => handler.on_delete_game(s, msg).await,
        MessageType::ApplyArtwork => handler.on_apply_artwork(s, msg).await,
        MessageType::RestartSteam => handler.on_restart_steam(s, msg).await,
        MessageType::InitUpload => handler.on_init_upload(s, msg).await,
        MessageType::CompleteUpload => handler.on_complete_upload(s, msg).await,
        MessageType::CancelUpload => handler.on_cancel_upload(s, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = s.send_error(&msg, 501, "unknown message type");
        }
    }
}

/// Dispatches a binary WebSocket frame (an upload chunk) to the handler.
///
/// Binary chunks are routed through the same bounded pool as text
/// messages so a flood of chunks can't starve other request handling.
async fn dispatch_binary<H: Handler>(
    handler: &Arc<H>,
    sender: &Sender,
    data: &[u8],
    handler_slots: &Arc<Semaphore>,
) {
    let msg = match parse_binary_message(data) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!("failed to parse binary message: {e}");
            return;
        }
    };

    let Ok(permit) = handler_slots.clone().acquire_owned().await else {
        return;
    };
    let handler = handler.clone();
    let sender = sender.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let outcome = AssertUnwindSafe(handler.on_binary_chunk(sender, msg.header, msg.data))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!("handler panicked while processing binary chunk");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_error_display() {
        let err = SendError;
        assert!(err.to_string().contains("buffer full"));
    }

    #[test]
    fn hub_meta_clone() {
        let meta = HubMeta {
            name: "TestHub".into(),
            version: "1.0".into(),
            hub_id: "h1".into(),
            remote_addr: "127.0.0.1".into(),
        };
        let cloned = meta.clone();
        assert_eq!(meta.name, cloned.name);
    }

    struct NoopHandler;

    impl crate::handler::Handler for NoopHandler {
        fn on_hub_connected(&self, _sender: Sender, _msg: Message) -> crate::handler::HandlerFuture<'_> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn read_pump_closes_session_on_oversize_text_frame() {
        use futures_util::stream;

        let (tx, _rx) = mpsc::channel::<WsMessage>(8);
        let sender = Sender { tx };
        let healthy = Arc::new(AtomicBool::new(true));
        let handler_slots = Arc::new(Semaphore::new(HANDLER_CONCURRENCY));
        let cancel = CancellationToken::new();

        let huge = "x".repeat(
            capydeploy_protocol::constants::WS_MAX_TEXT_FRAME_SIZE + 1,
        );
        let oversize: Result<WsMessage, tokio_tungstenite::tungstenite::Error> =
            Ok(WsMessage::Text(huge.into()));
        // A well-formed frame after the oversize one should never be reached
        // once the session closes.
        let follow_up = Message::new::<()>("after", MessageType::Ping, None).unwrap();
        let follow_up_json = serde_json::to_string(&follow_up).unwrap();
        let s: Result<WsMessage, tokio_tungstenite::tungstenite::Error> =
            Ok(WsMessage::Text(follow_up_json.into()));
        let combined = Box::pin(stream::iter(vec![oversize, s]));

        read_pump(
            combined,
            sender,
            Arc::new(NoopHandler),
            cancel,
            healthy.clone(),
            handler_slots,
        )
        .await;

        // read_pump returned — the oversize frame closed the session
        // before the follow-up ping could be dispatched.
    }
}
