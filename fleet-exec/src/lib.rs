//! Fleet Exec - remote execution over SSH
//!
//! Single and batch command execution with try/catch/finally semantics,
//! retries, timeouts, conditional execution, cancellation, async result
//! retrieval, persisted history, and the Git bootstrap path.

pub mod command;
pub mod error;
pub mod executor;
pub mod git;
pub mod history;
pub mod ssh;

pub use command::{
    BatchCommand, BatchMode, BatchResult, Command, CommandResult, ExecSpec, ExecStatus,
    ExecuteKind, ExecuteRequest, ExecuteResult,
};
pub use error::ExecError;
pub use executor::{run_batch, run_single, BatchExecutor, Executor};
pub use git::{clone_repository, GitCloneRequest, GitCloneResult};
pub use history::HistoryStore;
pub use ssh::{build_command_line, AcceptAnyHostKey, CommandOutput, CommandRunner, SshClient};
