//! Executor error types.
//!
//! Command failures fold into `CommandResult`; these errors are reserved
//! for catastrophic local failures — cannot resolve the credential, cannot
//! dial, cannot open a channel, history store down.

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("ssh connect to {host}:{port} failed: {reason}")]
    Connect { host: String, port: u16, reason: String },
    #[error("ssh authentication rejected for {user}@{host}")]
    AuthRejected { user: String, host: String },
    #[error("credential error: {0}")]
    Credential(String),
    #[error("ssh channel error: {0}")]
    Channel(String),
    #[error("history store error: {0}")]
    History(String),
    #[error("{0}")]
    Internal(String),
}
