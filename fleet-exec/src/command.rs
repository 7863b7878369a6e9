//! Command and result types for remote execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fleet_core::server::Server;

/// Terminal and in-flight execution states. `status` on a result is the
/// truth source; errors are folded in, not thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    Sequential,
    Parallel,
}

fn default_timeout_secs() -> u64 {
    60
}

/// One remote shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Exported into the remote shell before the command runs. Ordered so
    /// the built command line is deterministic.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Report `Success` even if the final attempt failed.
    #[serde(default)]
    pub ignore_error: bool,
    /// In a sequential batch with `stop_on_error`, a failure of this
    /// command does not stop the batch.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Shell expression probed first; non-zero exit skips the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub retry_interval_secs: u64,
}

impl Command {
    pub fn shell(id: &str, name: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            command: command.to_string(),
            work_dir: None,
            env: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            ignore_error: false,
            continue_on_error: false,
            condition: None,
            retry_times: 0,
            retry_interval_secs: 0,
        }
    }
}

/// Structured batch with exception-style control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCommand {
    pub id: String,
    pub name: String,
    pub mode: BatchMode,
    /// Whole-batch deadline; zero means none. On expiry the in-flight
    /// commands are cancelled.
    #[serde(default)]
    pub total_timeout_secs: u64,
    #[serde(rename = "try")]
    pub try_commands: Vec<Command>,
    #[serde(default, rename = "catch")]
    pub catch_commands: Vec<Command>,
    #[serde(default, rename = "finally")]
    pub finally_commands: Vec<Command>,
    /// Sequential mode: stop the phase after a failed command, unless the
    /// failing command carries `continue_on_error`.
    #[serde(default)]
    pub stop_on_error: bool,
    /// Report overall `Success` even when the try phase had failures.
    #[serde(default)]
    pub continue_on_failed: bool,
}

/// Outcome of one command, including every retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: String,
    pub name: String,
    /// The command text as recorded for history; secrets are masked before
    /// it lands here.
    pub command: String,
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Condition probe said no; the command never ran.
    #[serde(default)]
    pub skipped: bool,
    pub retry_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Aggregated batch outcome. Counters cover the try phase; catch and
/// finally results are carried in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub name: String,
    pub status: ExecStatus,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub try_results: Vec<CommandResult>,
    #[serde(default)]
    pub catch_results: Vec<CommandResult>,
    #[serde(default)]
    pub finally_results: Vec<CommandResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteKind {
    Single,
    Batch,
}

/// What to run against a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecSpec {
    Single(Command),
    Batch(BatchCommand),
}

impl ExecSpec {
    pub fn kind(&self) -> ExecuteKind {
        match self {
            ExecSpec::Single(_) => ExecuteKind::Single,
            ExecSpec::Batch(_) => ExecuteKind::Batch,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub server: Server,
    pub spec: ExecSpec,
    /// Persist the result into the history store.
    #[serde(default)]
    pub save_log: bool,
}

/// Top-level record of one execute call; persisted when `save_log` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub request_id: String,
    pub kind: ExecuteKind,
    pub server_id: String,
    #[serde(rename = "async")]
    pub async_exec: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_result: Option<BatchResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_json_shape() {
        let batch = BatchCommand {
            id: "b1".into(),
            name: "deploy".into(),
            mode: BatchMode::Sequential,
            total_timeout_secs: 0,
            try_commands: vec![Command::shell("c1", "step", "echo hi")],
            catch_commands: vec![],
            finally_commands: vec![],
            stop_on_error: true,
            continue_on_failed: false,
        };
        let json = serde_json::to_value(&batch).unwrap();
        assert!(json.get("try").is_some());
        assert_eq!(json["mode"], "sequential");

        let parsed: BatchCommand = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.try_commands.len(), 1);
        assert!(parsed.catch_commands.is_empty());
    }

    #[test]
    fn test_execute_result_round_trip() {
        let result = ExecuteResult {
            request_id: "r1".into(),
            kind: ExecuteKind::Single,
            server_id: "s1".into(),
            async_exec: true,
            start_time: Utc::now(),
            end_time: Utc::now(),
            command_result: None,
            batch_result: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["async"], true);
        let parsed: ExecuteResult = serde_json::from_value(json).unwrap();
        assert!(parsed.async_exec);
    }
}
