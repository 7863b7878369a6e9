//! A single peer endpoint.
//!
//! The connection owns the write half of the socket; the reader task owns
//! the read half. `send` is the only mutator and is serialized by a write
//! mutex, so it is safe for arbitrary concurrent callers without changing
//! the wire contract.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::codec::FrameCodec;
use crate::error::{CodecError, IoStage, RpcError};
use crate::message::Message;

/// Atomic snapshot of a connection's state and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub last_active_ms: i64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_frames: u64,
    pub write_frames: u64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Locally generated endpoint identifier: the nanosecond clock as a
/// zero-padded 19-digit decimal. Never on the wire.
fn generate_connection_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{nanos:019}")
}

pub struct Connection {
    id: String,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    codec: FrameCodec,
    writer: Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
    closed: AtomicBool,
    last_active_ms: AtomicI64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    read_frames: AtomicU64,
    write_frames: AtomicU64,
    close_tx: watch::Sender<bool>,
    is_client: bool,
}

impl Connection {
    /// Split a connected stream into a `Connection` (write side) and the
    /// read half for the reader task.
    pub fn new(
        stream: TcpStream,
        codec: FrameCodec,
        is_client: bool,
    ) -> Result<(Arc<Self>, OwnedReadHalf), RpcError> {
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| RpcError::Internal(format!("peer addr: {e}")))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| RpcError::Internal(format!("local addr: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let (close_tx, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id: generate_connection_id(),
            remote_addr,
            local_addr,
            codec,
            writer: Mutex::new(write_half),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            last_active_ms: AtomicI64::new(now_millis()),
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            read_frames: AtomicU64::new(0),
            write_frames: AtomicU64::new(0),
            close_tx,
            is_client,
        });
        Ok((conn, read_half))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            connected: self.connected.load(Ordering::Acquire),
            last_active_ms: self.last_active_ms.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            read_frames: self.read_frames.load(Ordering::Relaxed),
            write_frames: self.write_frames.load(Ordering::Relaxed),
        }
    }

    /// Encode and write one message as one frame.
    pub async fn send(&self, msg: &Message) -> Result<(), RpcError> {
        if !self.is_connected() {
            return Err(RpcError::ConnectionClosed);
        }
        let bytes = msg.encode()?;
        let mut writer = self.writer.lock().await;
        if !self.is_connected() {
            return Err(RpcError::ConnectionClosed);
        }
        match self.codec.write_frame(&mut *writer, &bytes).await {
            Ok(()) => {
                self.write_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                self.write_frames.fetch_add(1, Ordering::Relaxed);
                self.last_active_ms.store(now_millis(), Ordering::Relaxed);
                Ok(())
            }
            Err(CodecError::Io { stage: IoStage::Write, source }) => {
                Err(RpcError::from_write_error(source))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record an inbound frame against the stats counters.
    pub(crate) fn record_read(&self, bytes: usize) {
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read_frames.fetch_add(1, Ordering::Relaxed);
        self.last_active_ms.store(now_millis(), Ordering::Relaxed);
    }

    /// Resolves when `close` runs; used by the reader and heartbeat tasks.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Idempotent close: one state transition, one socket shutdown, no
    /// further sends succeed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let _ = self.close_tx.send(true);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("connection {} shutdown: {e}", self.id);
        }
    }
}
