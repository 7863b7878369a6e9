//! Message routing.
//!
//! Base handlers run in registration order before any service dispatch;
//! the first error short-circuits into a fail response. Service handlers
//! are keyed by (service, type). A missing handler is a silent drop so
//! fire-and-forget messages stay cheap.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::RpcError;
use crate::message::{service, Message};

/// A handler observes a message and optionally produces a result that is
/// wrapped into a success response. `Ok(None)` produces nothing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, conn_id: &str, msg: &Message) -> Result<Option<Value>, RpcError>;
}

/// Blanket adapter so plain async-compatible closures can be registered.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&str, &Message) -> Result<Option<Value>, RpcError> + Send + Sync,
{
    async fn handle(&self, conn_id: &str, msg: &Message) -> Result<Option<Value>, RpcError> {
        (self.0)(conn_id, msg)
    }
}

#[derive(Default)]
pub struct Dispatcher {
    base_handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    service_handlers: DashMap<(u8, u8), Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gate that runs before every dispatch.
    pub fn add_base_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.base_handlers.write().push(handler);
    }

    /// Register the handler for one (service, type) pair.
    pub fn register(&self, svc: u8, msg_type: u8, handler: Arc<dyn MessageHandler>) {
        self.service_handlers.insert((svc, msg_type), handler);
    }

    pub fn has_handler(&self, svc: u8, msg_type: u8) -> bool {
        self.service_handlers.contains_key(&(svc, msg_type))
    }

    /// Process one inbound message and send back whatever response it
    /// produces. Response send errors are logged, never surfaced to the
    /// peer.
    pub async fn dispatch(&self, conn: &Arc<Connection>, msg: Message) {
        let bases: Vec<Arc<dyn MessageHandler>> = self.base_handlers.read().clone();
        for base in bases {
            if let Err(e) = base.handle(conn.id(), &msg).await {
                self.send_fail(conn, &msg.id, &e.to_string()).await;
                return;
            }
        }

        let handler = match self.service_handlers.get(&(msg.service, msg.msg_type)) {
            Some(h) => h.clone(),
            None => {
                debug!(
                    "no handler for service {} type {}, dropping message {}",
                    msg.service, msg.msg_type, msg.id
                );
                return;
            }
        };

        match handler.handle(conn.id(), &msg).await {
            Ok(Some(result)) => {
                // Response frames bypass result wrapping; a response to a
                // response would loop.
                if msg.service == service::RESPONSE {
                    return;
                }
                match Message::success_response(conn.id(), &msg.id, &result) {
                    Ok(reply) => {
                        if let Err(e) = conn.send(&reply).await {
                            warn!("failed to send response for {}: {e}", msg.id);
                        }
                    }
                    Err(e) => warn!("failed to encode response for {}: {e}", msg.id),
                }
            }
            Ok(None) => {}
            Err(e) => self.send_fail(conn, &msg.id, &e.to_string()).await,
        }
    }

    async fn send_fail(&self, conn: &Arc<Connection>, origin_id: &str, error: &str) {
        let reply = Message::fail_response(conn.id(), origin_id, error);
        if let Err(e) = conn.send(&reply).await {
            warn!("failed to send fail response for {origin_id}: {e}");
        }
    }
}
