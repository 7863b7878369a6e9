//! Request/response correlation.
//!
//! Outbound requests reserve a slot keyed by message id before the frame
//! goes out; the response handler resolves the slot by `originMsgId`.
//! The pending table sits under a single mutex whose critical sections are
//! insert/remove only — the channel hand-off itself is lock-free.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::dispatcher::MessageHandler;
use crate::error::RpcError;
use crate::message::{msg_type, Message, ResponsePayload};

/// What the response handler forwards to a waiting request.
#[derive(Debug)]
struct ResponseEnvelope {
    msg_type: u8,
    data: Vec<u8>,
}

/// One-shot response callback registered outside the request path.
pub type TempHandler = Box<dyn FnOnce(u8, Vec<u8>) + Send>;

#[derive(Default)]
pub struct RequestTracker {
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>,
    /// Legacy correlator: callbacks keyed by message id, consulted when no
    /// pending request slot matches. Guarded by its own mutex.
    temp_handlers: Mutex<HashMap<String, TempHandler>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `msg` and wait for the raw response bytes.
    ///
    /// Exactly one of four outcomes happens in bounded time: response data,
    /// remote error, local timeout, or the send error itself.
    pub async fn request_raw(
        &self,
        conn: &Connection,
        msg: &Message,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg.id.clone(), tx);

        if let Err(e) = conn.send(msg).await {
            self.pending.lock().remove(&msg.id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => match envelope.msg_type {
                msg_type::RESPONSE_OK => Ok(envelope.data),
                msg_type::RESPONSE_FAIL => {
                    Err(RpcError::Remote(String::from_utf8_lossy(&envelope.data).into_owned()))
                }
                other => Err(RpcError::InvalidMessageType(other)),
            },
            // Sender dropped without resolving: the tracker was torn down.
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&msg.id);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Send `msg` and decode the response data as JSON.
    pub async fn request<T: DeserializeOwned>(
        &self,
        conn: &Connection,
        msg: &Message,
        timeout: Duration,
    ) -> Result<T, RpcError> {
        let data = self.request_raw(conn, msg, timeout).await?;
        serde_json::from_slice(&data).map_err(|e| RpcError::Internal(format!("decode response: {e}")))
    }

    /// Fire-and-forget: no correlation slot, no wait.
    pub async fn request_ignore(&self, conn: &Connection, msg: &Message) -> Result<(), RpcError> {
        conn.send(msg).await
    }

    /// Register a callback for the response to an already-sent message.
    /// Fire-and-forget senders that still want the eventual reply use this
    /// instead of blocking in `request_raw`.
    pub fn register_temp_handler(&self, message_id: &str, handler: TempHandler) {
        self.temp_handlers.lock().insert(message_id.to_string(), handler);
    }

    pub fn remove_temp_handler(&self, message_id: &str) {
        self.temp_handlers.lock().remove(message_id);
    }

    /// Resolve the pending slot a response frame belongs to, falling back
    /// to the temp-handler table. Unmatched responses (late arrivals after
    /// a timeout) are discarded.
    pub fn handle_response(&self, msg: &Message) {
        let envelope: ResponsePayload = match serde_json::from_slice(&msg.payload) {
            Ok(env) => env,
            Err(e) => {
                debug!("undecodable response payload for message {}: {e}", msg.id);
                return;
            }
        };
        let sender = self.pending.lock().remove(&envelope.origin_msg_id);
        if let Some(tx) = sender {
            let _ = tx.send(ResponseEnvelope {
                msg_type: msg.msg_type,
                data: envelope.data,
            });
            return;
        }
        let handler = self.temp_handlers.lock().remove(&envelope.origin_msg_id);
        match handler {
            Some(handler) => handler(msg.msg_type, envelope.data),
            None => debug!("discarding unmatched response for {}", envelope.origin_msg_id),
        }
    }

    /// Drop every pending slot and callback; waiting requests observe
    /// `ConnectionClosed`.
    pub fn clear(&self) {
        self.pending.lock().clear();
        self.temp_handlers.lock().clear();
    }
}

/// Dispatcher adapter feeding response frames into a tracker.
pub struct ResponseHandler {
    tracker: Arc<RequestTracker>,
}

impl ResponseHandler {
    pub fn new(tracker: Arc<RequestTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl MessageHandler for ResponseHandler {
    async fn handle(&self, _conn_id: &str, msg: &Message) -> Result<Option<Value>, RpcError> {
        self.tracker.handle_response(msg);
        Ok(None)
    }
}
