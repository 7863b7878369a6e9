//! Fleet RPC - length-framed, multi-service TCP RPC runtime
//!
//! Design:
//! - One frame = one message; frames are length-prefixed, big-endian
//! - Messages route by (service, type) through a dispatcher with base gates
//! - Outbound requests correlate to responses by message id
//! - Message-level auth is a base gate plus a System/Auth login handler

pub mod auth;
pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod message;
pub mod tracker;

pub use auth::{AuthGate, AuthHandler, AuthRequest, HeartbeatHandler, TokenTable};
pub use client::{ClientAuthOptions, ClientOptions, RpcClient};
pub use codec::{DelimiterCodec, FrameCodec, DEFAULT_HEADER_LEN, DEFAULT_MAX_FRAME_LEN};
pub use connection::{Connection, ConnectionState};
pub use dispatcher::{Dispatcher, FnHandler, MessageHandler};
pub use error::{CodecError, IoStage, RpcError};
pub use manager::{ConnectionClosedHook, Interceptor, ManagerState, RpcServer, ServerOptions};
pub use message::{msg_type, service, Message, ResponsePayload};
pub use tracker::{RequestTracker, ResponseHandler, TempHandler};
