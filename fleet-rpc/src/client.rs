//! RPC client.
//!
//! A client owns one connection, a reader task feeding its own dispatcher,
//! and a request tracker. With auth options set, `connect` logs in before
//! returning and a per-connection refresh task keeps the token fresh.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_core::credentials::AccessToken;

use crate::auth::{AuthRequest, HeartbeatHandler};
use crate::codec::FrameCodec;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::manager::ServerOptions;
use crate::message::{msg_type, service, Message};
use crate::tracker::{RequestTracker, ResponseHandler, TempHandler};

#[derive(Debug, Clone)]
pub struct ClientAuthOptions {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone)]
pub struct ClientOptions {
    pub addr: String,
    pub codec: FrameCodec,
    pub request_timeout: Duration,
    pub keepalive: Option<Duration>,
    pub auth: Option<ClientAuthOptions>,
}

impl ClientOptions {
    pub fn new(addr: &str) -> Self {
        let defaults = ServerOptions::default();
        Self {
            addr: addr.to_string(),
            codec: defaults.codec,
            request_timeout: Duration::from_secs(30),
            keepalive: defaults.keepalive,
            auth: None,
        }
    }

    pub fn with_auth(mut self, client_id: &str, client_secret: &str) -> Self {
        self.auth = Some(ClientAuthOptions {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        });
        self
    }
}

pub struct RpcClient {
    options: ClientOptions,
    conn: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<RequestTracker>,
    token: RwLock<Option<AccessToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    /// Dial, start the reader, and (with auth options) log in.
    pub async fn connect(options: ClientOptions) -> Result<Arc<Self>, RpcError> {
        let stream = TcpStream::connect(&options.addr)
            .await
            .map_err(|e| RpcError::Internal(format!("connect {}: {e}", options.addr)))?;
        if let Some(interval) = options.keepalive {
            let keepalive = TcpKeepalive::new().with_time(interval);
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                debug!("keepalive: {e}");
            }
        }

        let (conn, read_half) = Connection::new(stream, options.codec, true)?;
        let dispatcher = Arc::new(Dispatcher::new());
        let tracker = Arc::new(RequestTracker::new());
        dispatcher.register(
            service::RESPONSE,
            msg_type::RESPONSE_OK,
            Arc::new(ResponseHandler::new(tracker.clone())),
        );
        dispatcher.register(
            service::RESPONSE,
            msg_type::RESPONSE_FAIL,
            Arc::new(ResponseHandler::new(tracker.clone())),
        );
        dispatcher.register(service::SYSTEM, msg_type::HEARTBEAT, Arc::new(HeartbeatHandler));

        let client = Arc::new(Self {
            options,
            conn: conn.clone(),
            dispatcher: dispatcher.clone(),
            tracker: tracker.clone(),
            token: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        // Reader task: frames → dispatcher until the stream ends.
        let reader_conn = conn.clone();
        let reader_tracker = tracker;
        let codec = client.options.codec;
        let mut read_half = read_half;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_conn.closed() => break,
                    frame = codec.read_frame(&mut read_half) => {
                        match frame {
                            Ok(frame) => {
                                reader_conn.record_read(frame.len());
                                match Message::decode(&frame) {
                                    Ok(mut msg) => {
                                        msg.conn_id = reader_conn.id().to_string();
                                        dispatcher.dispatch(&reader_conn, msg).await;
                                    }
                                    Err(e) => {
                                        warn!("undecodable frame: {e}");
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!("client read ended: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            reader_conn.close().await;
            // Waiting requests observe ConnectionClosed instead of hanging
            // until their deadline.
            reader_tracker.clear();
        });
        client.tasks.lock().push(handle);

        if client.options.auth.is_some() {
            let token = client.login().await?;
            info!("authenticated, token expires in {}s", token.expires_in);
            *client.token.write() = Some(token.clone());
            Self::spawn_refresh(&client, token.expires_in);
        }

        Ok(client)
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Service handlers for server-initiated traffic register here.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn token(&self) -> Option<AccessToken> {
        self.token.read().clone()
    }

    /// Request with JSON payload and JSON response.
    pub async fn request<P: Serialize, T: DeserializeOwned>(
        &self,
        svc: u8,
        msg_type: u8,
        payload: &P,
    ) -> Result<T, RpcError> {
        let msg = Message::with_json(msg_type, svc, self.conn.id(), payload)
            .map_err(|e| RpcError::Internal(format!("encode request: {e}")))?;
        self.tracker
            .request(&self.conn, &msg, self.options.request_timeout)
            .await
    }

    /// Request returning the raw response bytes.
    pub async fn request_raw<P: Serialize>(
        &self,
        svc: u8,
        msg_type: u8,
        payload: &P,
    ) -> Result<Vec<u8>, RpcError> {
        let msg = Message::with_json(msg_type, svc, self.conn.id(), payload)
            .map_err(|e| RpcError::Internal(format!("encode request: {e}")))?;
        self.tracker
            .request_raw(&self.conn, &msg, self.options.request_timeout)
            .await
    }

    /// Fire-and-forget send.
    pub async fn notify<P: Serialize>(&self, svc: u8, msg_type: u8, payload: &P) -> Result<(), RpcError> {
        let msg = Message::with_json(msg_type, svc, self.conn.id(), payload)
            .map_err(|e| RpcError::Internal(format!("encode request: {e}")))?;
        self.tracker.request_ignore(&self.conn, &msg).await
    }

    /// Send without blocking; `callback` fires once when the response
    /// arrives. The callback is dropped if the connection closes first.
    pub async fn notify_with_callback<P: Serialize>(
        &self,
        svc: u8,
        msg_type: u8,
        payload: &P,
        callback: TempHandler,
    ) -> Result<(), RpcError> {
        let msg = Message::with_json(msg_type, svc, self.conn.id(), payload)
            .map_err(|e| RpcError::Internal(format!("encode request: {e}")))?;
        self.tracker.register_temp_handler(&msg.id, callback);
        if let Err(e) = self.tracker.request_ignore(&self.conn, &msg).await {
            self.tracker.remove_temp_handler(&msg.id);
            return Err(e);
        }
        Ok(())
    }

    async fn login(&self) -> Result<AccessToken, RpcError> {
        let auth = self
            .options
            .auth
            .as_ref()
            .ok_or_else(|| RpcError::AuthFailed("no client credentials configured".to_string()))?;
        let request = AuthRequest {
            client_id: auth.client_id.clone(),
            client_secret: auth.client_secret.clone(),
        };
        self.request(service::SYSTEM, msg_type::AUTH, &request).await
    }

    /// Per-connection refresh task: sleep 80% of the token lifetime,
    /// re-authenticate, update the interval from the fresh token. Exits
    /// when the connection goes away.
    fn spawn_refresh(client: &Arc<Self>, initial_expires_in: u64) {
        let weak: Weak<Self> = Arc::downgrade(client);
        let conn = client.conn.clone();
        let handle = tokio::spawn(async move {
            let mut expires_in = initial_expires_in.max(1);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(expires_in as f64 * 0.8)) => {}
                    _ = conn.closed() => {
                        debug!("refresh task exiting: connection closed");
                        break;
                    }
                }
                let Some(client) = weak.upgrade() else { break };
                if !client.conn.is_connected() {
                    debug!("refresh task exiting: disconnected");
                    break;
                }
                match client.login().await {
                    Ok(token) => {
                        expires_in = token.expires_in.max(1);
                        debug!("token refreshed, next in {}s", (expires_in as f64 * 0.8) as u64);
                        *client.token.write() = Some(token);
                    }
                    Err(e) => {
                        warn!("token refresh failed: {e}");
                    }
                }
            }
        });
        client.tasks.lock().push(handle);
    }

    pub async fn close(&self) {
        self.conn.close().await;
        self.tracker.clear();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthGate, AuthHandler, TokenTable};
    use crate::dispatcher::{FnHandler, MessageHandler};
    use crate::manager::RpcServer;
    use async_trait::async_trait;
    use fleet_core::credentials::{CredentialProvider, MemoryCredentials};
    use serde_json::{json, Value};

    fn echo_dispatcher() -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(10, 1, Arc::new(FnHandler(|_: &str, msg: &Message| {
            let payload: Value = serde_json::from_slice(&msg.payload)
                .map_err(|e| RpcError::Internal(e.to_string()))?;
            Ok(Some(json!({ "echo": payload["payload"] })))
        })));
        dispatcher
    }

    fn test_server(dispatcher: Arc<Dispatcher>) -> Arc<RpcServer> {
        RpcServer::new(
            ServerOptions {
                listen_addr: "127.0.0.1:0".to_string(),
                ..ServerOptions::default()
            },
            dispatcher,
        )
    }

    /// Echo round trip: registered user service answers, response payload
    /// mirrors the request.
    #[tokio::test]
    async fn test_echo_round_trip() {
        let server = test_server(echo_dispatcher());
        let addr = server.start().await.unwrap();

        let client = RpcClient::connect(ClientOptions::new(&addr.to_string()))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let reply: Value = client.request(10, 1, &json!({ "payload": "hi" })).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(reply, json!({ "echo": "hi" }));

        client.close().await;
        server.shutdown().await;
    }

    /// Auth gate: user traffic is rejected before login and accepted after.
    #[tokio::test]
    async fn test_auth_gate_round_trip() {
        let credentials = Arc::new(MemoryCredentials::new());
        credentials.insert_client("cli", "s3cret");
        let tokens = Arc::new(TokenTable::new());

        let dispatcher = echo_dispatcher();
        dispatcher.add_base_handler(Arc::new(AuthGate::new(tokens.clone())));
        dispatcher.register(
            service::SYSTEM,
            msg_type::AUTH,
            Arc::new(AuthHandler::new(tokens.clone(), credentials)),
        );

        let server = test_server(dispatcher);
        let hook_tokens = tokens.clone();
        server.on_connection_closed(Arc::new(move |conn_id| hook_tokens.remove(conn_id)));
        let addr = server.start().await.unwrap();

        // Unauthenticated client: gate rejects with the canonical text.
        let bare = RpcClient::connect(ClientOptions::new(&addr.to_string())).await.unwrap();
        let err = bare
            .request::<_, Value>(10, 1, &json!({ "payload": "hi" }))
            .await
            .unwrap_err();
        match err {
            RpcError::Remote(text) => assert_eq!(text, "connection not authenticated"),
            other => panic!("unexpected error: {other:?}"),
        }
        bare.close().await;

        // Authenticated client: login happens inside connect.
        let authed = RpcClient::connect(
            ClientOptions::new(&addr.to_string()).with_auth("cli", "s3cret"),
        )
        .await
        .unwrap();
        assert!(authed.token().is_some());
        assert_eq!(tokens.len(), 1);
        let reply: Value = authed.request(10, 1, &json!({ "payload": "hi" })).await.unwrap();
        assert_eq!(reply, json!({ "echo": "hi" }));

        // Token entry goes away with the connection.
        authed.close().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tokens.len(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_notify_with_callback() {
        let server = test_server(echo_dispatcher());
        let addr = server.start().await.unwrap();
        let client = RpcClient::connect(ClientOptions::new(&addr.to_string()))
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .notify_with_callback(
                10,
                1,
                &json!({ "payload": "ping" }),
                Box::new(move |_msg_type, data| {
                    let _ = tx.send(data);
                }),
            )
            .await
            .unwrap();

        let data = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("callback within two seconds")
            .unwrap();
        let value: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value, json!({ "echo": "ping" }));

        client.close().await;
        server.shutdown().await;
    }

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _conn_id: &str, _msg: &Message) -> Result<Option<Value>, RpcError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Some(json!("late")))
        }
    }

    /// A slow handler triggers the local timeout; the pending slot is
    /// removed and the eventual response is silently dropped.
    #[tokio::test]
    async fn test_request_timeout() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(10, 1, Arc::new(SlowHandler));
        let server = test_server(dispatcher);
        let addr = server.start().await.unwrap();

        let mut options = ClientOptions::new(&addr.to_string());
        options.request_timeout = Duration::from_millis(300);
        let client = RpcClient::connect(options).await.unwrap();

        let started = std::time::Instant::now();
        let err = client
            .request::<_, Value>(10, 1, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_secs(1));
        assert_eq!(client.tracker.pending_count(), 0);

        // The late response arrives after ~2s and must be discarded
        // without disturbing the connection.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(client.conn().is_connected());

        client.close().await;
        server.shutdown().await;
    }

    /// Refresh task re-authenticates once 80% of the token lifetime has
    /// elapsed.
    #[tokio::test]
    async fn test_token_refresh_updates_token() {
        struct ShortLived {
            inner: MemoryCredentials,
        }

        #[async_trait]
        impl fleet_core::credentials::CredentialProvider for ShortLived {
            async fn credential_content(
                &self,
                id: &str,
            ) -> Result<(String, fleet_core::credentials::CredentialKind), fleet_core::credentials::CredentialError>
            {
                self.inner.credential_content(id).await
            }

            async fn authenticate_client(
                &self,
                client_id: &str,
                client_secret: &str,
            ) -> Result<AccessToken, fleet_core::credentials::CredentialError> {
                let mut token = self.inner.authenticate_client(client_id, client_secret).await?;
                token.expires_in = 1;
                token.access_token = format!("tok-{}", uuid::Uuid::new_v4().simple());
                Ok(token)
            }
        }

        let inner = MemoryCredentials::new();
        inner.insert_client("cli", "s3cret");
        let credentials = Arc::new(ShortLived { inner });
        let tokens = Arc::new(TokenTable::new());

        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(
            service::SYSTEM,
            msg_type::AUTH,
            Arc::new(AuthHandler::new(tokens, credentials)),
        );
        let server = test_server(dispatcher);
        let addr = server.start().await.unwrap();

        let client = RpcClient::connect(
            ClientOptions::new(&addr.to_string()).with_auth("cli", "s3cret"),
        )
        .await
        .unwrap();
        let first = client.token().unwrap().access_token;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let second = client.token().unwrap().access_token;
        assert_ne!(first, second, "refresh should have replaced the token");

        client.close().await;
        server.shutdown().await;
    }
}
