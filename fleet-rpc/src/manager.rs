//! Server-side connection manager.
//!
//! One accept loop per listener; every accepted connection gets a reader
//! task and a heartbeat task. The registry is the source of truth for
//! broadcast and shutdown.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::message::Message;

/// Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Unstarted = 0,
    Listening = 1,
    Closing = 2,
    Closed = 3,
}

impl ManagerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ManagerState::Listening,
            2 => ManagerState::Closing,
            3 => ManagerState::Closed,
            _ => ManagerState::Unstarted,
        }
    }
}

/// Runs against the raw socket before a connection is published; the auth
/// interceptor uses this for an in-band handshake.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<(), RpcError>;
}

/// Invoked exactly once per connection after it leaves the registry.
pub type ConnectionClosedHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    pub keepalive: Option<Duration>,
    pub codec: FrameCodec,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8700".to_string(),
            max_connections: 1024,
            heartbeat_interval: Duration::from_secs(25),
            keepalive: Some(Duration::from_secs(60)),
            codec: FrameCodec::default(),
        }
    }
}

pub struct RpcServer {
    options: ServerOptions,
    dispatcher: Arc<Dispatcher>,
    connections: DashMap<String, Arc<Connection>>,
    state: AtomicU8,
    closed_hooks: RwLock<Vec<ConnectionClosedHook>>,
    interceptor: RwLock<Option<Arc<dyn Interceptor>>>,
    close_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RpcServer {
    pub fn new(options: ServerOptions, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            options,
            dispatcher,
            connections: DashMap::new(),
            state: AtomicU8::new(ManagerState::Unstarted as u8),
            closed_hooks: RwLock::new(Vec::new()),
            interceptor: RwLock::new(None),
            close_tx,
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Address actually bound; useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn set_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }

    pub fn on_connection_closed(&self, hook: ConnectionClosedHook) {
        self.closed_hooks.write().push(hook);
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, RpcError> {
        self.state
            .compare_exchange(
                ManagerState::Unstarted as u8,
                ManagerState::Listening as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|s| {
                RpcError::Internal(format!("server already started (state {s})"))
            })?;

        let listener = TcpListener::bind(&self.options.listen_addr)
            .await
            .map_err(|e| RpcError::Internal(format!("bind {}: {e}", self.options.listen_addr)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RpcError::Internal(format!("local addr: {e}")))?;
        *self.local_addr.lock() = Some(addr);
        info!("rpc server listening on {addr}");

        let server = self.clone();
        let handle = tokio::spawn(async move {
            server.accept_loop(listener).await;
        });
        self.tasks.lock().push(handle);
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut close_rx = self.close_tx.subscribe();
        loop {
            tokio::select! {
                _ = close_rx.changed() => {
                    if *close_rx.borrow() {
                        debug!("accept loop stopping");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.handle_accept(stream, peer).await,
                        Err(e) => {
                            // Transient accept failures back off briefly.
                            warn!("accept error: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_accept(self: &Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        if self.connections.len() >= self.options.max_connections {
            warn!("rejecting {peer}: {}", RpcError::MaxConnections);
            return;
        }

        if let Some(interval) = self.options.keepalive {
            let keepalive = TcpKeepalive::new().with_time(interval);
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                debug!("keepalive on {peer}: {e}");
            }
        }

        let interceptor = self.interceptor.read().clone();
        if let Some(interceptor) = interceptor {
            if let Err(e) = interceptor.intercept(&mut stream, peer).await {
                warn!("interceptor rejected {peer}: {e}");
                return;
            }
        }

        let (conn, read_half) = match Connection::new(stream, self.options.codec, false) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to set up connection from {peer}: {e}");
                return;
            }
        };

        info!("connection {} accepted from {peer}", conn.id());
        self.connections.insert(conn.id().to_string(), conn.clone());
        self.spawn_reader(conn.clone(), read_half);
        self.spawn_heartbeat(conn);
    }

    fn spawn_reader(self: &Arc<Self>, conn: Arc<Connection>, mut read_half: OwnedReadHalf) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            let codec = server.options.codec;
            loop {
                tokio::select! {
                    _ = conn.closed() => break,
                    frame = codec.read_frame(&mut read_half) => {
                        match frame {
                            Ok(frame) => {
                                conn.record_read(frame.len());
                                match Message::decode(&frame) {
                                    Ok(mut msg) => {
                                        msg.conn_id = conn.id().to_string();
                                        server.dispatcher.dispatch(&conn, msg).await;
                                    }
                                    Err(e) => {
                                        warn!("undecodable frame on {}: {e}", conn.id());
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!("read on {} ended: {e}", conn.id());
                                break;
                            }
                        }
                    }
                }
            }
            server.teardown_connection(&conn).await;
        });
        self.tasks.lock().push(handle);
    }

    /// Heartbeat ticker for server-originated connections.
    fn spawn_heartbeat(self: &Arc<Self>, conn: Arc<Connection>) {
        let interval = self.options.heartbeat_interval.max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = conn.closed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = conn.send(Message::heartbeat()).await {
                            debug!("heartbeat on {} stopped: {e}", conn.id());
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn teardown_connection(&self, conn: &Arc<Connection>) {
        conn.close().await;
        if self.connections.remove(conn.id()).is_some() {
            info!("connection {} closed", conn.id());
            let hooks: Vec<ConnectionClosedHook> = self.closed_hooks.read().clone();
            for hook in hooks {
                hook(conn.id());
            }
        }
    }

    /// Best-effort send to every registered connection.
    pub async fn broadcast(&self, msg: &Message) -> Result<(), RpcError> {
        let conns: Vec<Arc<Connection>> = self.connections.iter().map(|e| e.clone()).collect();
        let mut failures = Vec::new();
        for conn in conns {
            if let Err(e) = conn.send(msg).await {
                failures.push(format!("{}: {e}", conn.id()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RpcError::Internal(format!(
                "broadcast failed for {} connection(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    /// Close-once: stop accepting, close every connection, wait for every
    /// task.
    pub async fn shutdown(&self) {
        let prev = self.state.swap(ManagerState::Closing as u8, Ordering::AcqRel);
        if prev == ManagerState::Closing as u8 || prev == ManagerState::Closed as u8 {
            return;
        }
        let _ = self.close_tx.send(true);

        let conns: Vec<Arc<Connection>> = self.connections.iter().map(|e| e.clone()).collect();
        for conn in conns {
            conn.close().await;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.state.store(ManagerState::Closed as u8, Ordering::Release);
        info!("rpc server closed");
    }
}
