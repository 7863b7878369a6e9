//! Fleet Core - shared contracts and plumbing for the fleet control plane
//!
//! Everything the other crates agree on lives here:
//! - Collaborator traits (KV store, credentials, registry, metric sink)
//! - The Server domain model
//! - Node identity
//! - The process-wide periodic scheduler
//! - Node configuration

pub mod config;
pub mod credentials;
pub mod kv;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod server;

pub use config::NodeConfig;
pub use credentials::{AccessToken, CredentialKind, CredentialProvider, MemoryCredentials};
pub use kv::{KvError, KvStore, MemoryKvStore};
pub use metrics::{MemorySink, MetricSample, MetricSink};
pub use node::node_id;
pub use registry::{MemoryRegistry, ServiceInstance, ServiceRegistry};
pub use scheduler::Scheduler;
pub use server::{MemoryCatalog, Server, ServerCatalog};
