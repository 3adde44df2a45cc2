//! WebSocket read pump — dispatches incoming messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use capydeploy_protocol::constants::{WS_MAX_TEXT_FRAME_SIZE, WS_PONG_WAIT};
use capydeploy_protocol::envelope::Message;

use crate::ws_client::{DisconnectCallback, EventCallback};

/// Reads messages from the WebSocket and dispatches them.
///
/// Uses a pong deadline to detect dead connections: if no pong arrives
/// within [`WS_PONG_WAIT`] after a ping was sent, the connection is
/// considered dead and the loop exits (triggering reconnect).
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    on_event: Arc<Mutex<Option<EventCallback>>>,
    on_disconnect: DisconnectCallback,
    agent_closed: Arc<AtomicBool>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    // Pong deadline: any incoming message (not just Pong) resets the timer.
    // If nothing arrives within WS_PONG_WAIT the connection is considered dead.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout — connection dead, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        // ANY incoming message resets the deadline.
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                if !handle_text_message(&text, &pending, &on_event).await {
                                    warn!("closing session after protocol violation");
                                    break;
                                }
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                if let Some(ref f) = frame {
                                    use capydeploy_protocol::constants::WS_CLOSE_TOKEN_REVOKED;
                                    if u16::from(f.code) == WS_CLOSE_TOKEN_REVOKED {
                                        debug!("agent revoked token (close code {WS_CLOSE_TOKEN_REVOKED})");
                                        agent_closed.store(true, Ordering::Relaxed);
                                    }
                                }
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary — ignore
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if let Some(cb) = on_disconnect.lock().await.as_ref() {
        cb();
    }
}

/// Handles a text message from the WebSocket.
///
/// Returns `false` if the frame exceeds [`WS_MAX_TEXT_FRAME_SIZE`] — a
/// protocol violation that should close the session — `true` otherwise
/// (including a malformed-but-within-limit frame, which is just dropped).
async fn handle_text_message(
    text: &str,
    pending: &Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    on_event: &Arc<Mutex<Option<EventCallback>>>,
) -> bool {
    if text.len() > WS_MAX_TEXT_FRAME_SIZE {
        warn!(
            "text frame exceeds {} byte limit ({} bytes)",
            WS_MAX_TEXT_FRAME_SIZE,
            text.len()
        );
        return false;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return true;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    // Route response to pending request.
    let mut map = pending.lock().await;
    if let Some(tx) = map.remove(&msg.id) {
        let _ = tx.send(msg);
        return true;
    }
    drop(map);

    // Push event to callback.
    let guard = on_event.lock().await;
    if let Some(cb) = guard.as_ref() {
        let msg_type = msg.msg_type.clone();
        cb(msg_type, msg);
    } else {
        warn!(msg_type = ?msg.msg_type, id = %msg.id, "no event callback set — dropping push event");
    }
    true
}
