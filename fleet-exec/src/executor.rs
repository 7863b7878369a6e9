//! Remote command executor.
//!
//! Single commands get condition probes, retries and ignore-error
//! semantics; batches get try/catch/finally with sequential or parallel
//! phases. Failures fold into the structured result; the outer `Result`
//! is reserved for dial and credential failures.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_core::credentials::CredentialProvider;

use crate::command::{
    BatchCommand, BatchMode, BatchResult, Command, CommandResult, ExecSpec, ExecStatus,
    ExecuteRequest, ExecuteResult,
};
use crate::error::ExecError;
use crate::history::HistoryStore;
use crate::ssh::{build_command_line, CommandOutput, CommandRunner, SshClient};

/// Condition probes get a short, fixed deadline.
const CONDITION_TIMEOUT: Duration = Duration::from_secs(10);

/// Object-safe execute seam so control loops (monitoring) can be driven by
/// a fake in tests.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult, ExecError>;
}

pub struct Executor {
    credentials: Arc<dyn CredentialProvider>,
    history: Option<Arc<HistoryStore>>,
    results: DashMap<String, ExecuteResult>,
    cancels: DashMap<String, watch::Sender<bool>>,
}

impl Executor {
    pub fn new(credentials: Arc<dyn CredentialProvider>, history: Option<Arc<HistoryStore>>) -> Arc<Self> {
        Arc::new(Self {
            credentials,
            history,
            results: DashMap::new(),
            cancels: DashMap::new(),
        })
    }

    /// Synchronous execute: dial, run, persist when asked.
    pub async fn execute_request(&self, request: ExecuteRequest) -> Result<ExecuteResult, ExecError> {
        let (_, cancel_rx) = watch::channel(false);
        let request_id = new_request_id();
        self.run_request(request, request_id, cancel_rx, false).await
    }

    async fn run_request(
        &self,
        request: ExecuteRequest,
        request_id: String,
        cancel: watch::Receiver<bool>,
        async_exec: bool,
    ) -> Result<ExecuteResult, ExecError> {
        let start_time = Utc::now();
        let ssh = SshClient::connect(&request.server, &*self.credentials).await?;
        let runner: Arc<dyn CommandRunner> = Arc::new(ssh.clone());

        let (command_result, batch_result) = match &request.spec {
            ExecSpec::Single(cmd) => (Some(run_single(&*runner, cmd, cancel).await), None),
            ExecSpec::Batch(batch) => (None, Some(run_batch(runner.clone(), batch, cancel).await)),
        };
        ssh.close().await;

        let result = ExecuteResult {
            request_id: request_id.clone(),
            kind: request.spec.kind(),
            server_id: request.server.id.clone(),
            async_exec,
            start_time,
            end_time: Utc::now(),
            command_result,
            batch_result,
        };

        if request.save_log {
            if let Some(history) = &self.history {
                if let Err(e) = history.save(&result).await {
                    warn!("failed to persist result {request_id}: {e}");
                }
            }
        }
        Ok(result)
    }

    /// Detach the execution onto a background task and return its request
    /// id immediately.
    pub fn execute_async(self: &Arc<Self>, request: ExecuteRequest) -> String {
        let request_id = new_request_id();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.insert(request_id.clone(), cancel_tx);

        let executor = self.clone();
        let id = request_id.clone();
        tokio::spawn(async move {
            let server_id = request.server.id.clone();
            let kind = request.spec.kind();
            let save_log = request.save_log;
            let outcome = executor.run_request(request, id.clone(), cancel_rx, true).await;
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    // Dial/credential failures still need a retrievable
                    // record for the async caller.
                    warn!("async execute {id} failed: {e}");
                    let now = Utc::now();
                    let failure = ExecuteResult {
                        request_id: id.clone(),
                        kind,
                        server_id,
                        async_exec: true,
                        start_time: now,
                        end_time: now,
                        command_result: Some(CommandResult {
                            command_id: String::new(),
                            name: "connect".to_string(),
                            command: String::new(),
                            status: ExecStatus::Failed,
                            stdout: String::new(),
                            stderr: String::new(),
                            exit_code: None,
                            error: Some(e.to_string()),
                            skipped: false,
                            retry_count: 0,
                            start_time: now,
                            end_time: now,
                            duration_ms: 0,
                        }),
                        batch_result: None,
                    };
                    if save_log {
                        if let Some(history) = &executor.history {
                            if let Err(e) = history.save(&failure).await {
                                warn!("failed to persist failure {id}: {e}");
                            }
                        }
                    }
                    failure
                }
            };
            executor.results.insert(id.clone(), result);
            executor.cancels.remove(&id);
            info!("async execute {id} finished");
        });

        request_id
    }

    /// In-memory results first, then the history store.
    pub async fn async_result(&self, request_id: &str) -> Result<Option<ExecuteResult>, ExecError> {
        if let Some(result) = self.results.get(request_id) {
            return Ok(Some(result.clone()));
        }
        match &self.history {
            Some(history) => history.get(request_id).await,
            None => Ok(None),
        }
    }

    /// Fire the cancel signal of a running async execution.
    pub fn cancel_execution(&self, request_id: &str) -> bool {
        match self.cancels.get(request_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Drop finished results older than the caller cares to keep around.
    pub fn forget_result(&self, request_id: &str) {
        self.results.remove(request_id);
    }
}

#[async_trait]
impl BatchExecutor for Executor {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult, ExecError> {
        self.execute_request(request).await
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn result_from_output(cmd: &Command, output: &CommandOutput, retry_count: u32) -> CommandResult {
    let now = Utc::now();
    CommandResult {
        command_id: cmd.id.clone(),
        name: cmd.name.clone(),
        command: cmd.command.clone(),
        status: output.status,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
        exit_code: output.exit_code,
        error: match output.status {
            ExecStatus::Success => None,
            ExecStatus::Timeout => Some("command timed out".to_string()),
            ExecStatus::Cancelled => Some("command cancelled".to_string()),
            _ => Some(if output.stderr.is_empty() {
                match output.exit_code {
                    Some(code) => format!("exit code {code}"),
                    None => "channel closed without exit status".to_string(),
                }
            } else {
                output.stderr.clone()
            }),
        },
        skipped: false,
        retry_count,
        start_time: now,
        end_time: now,
        duration_ms: 0,
    }
}

/// Run one command: condition probe, retries, ignore-error folding.
pub async fn run_single(
    runner: &dyn CommandRunner,
    cmd: &Command,
    cancel: watch::Receiver<bool>,
) -> CommandResult {
    let start_time = Utc::now();
    let started = std::time::Instant::now();

    let finish = |mut result: CommandResult| {
        result.start_time = start_time;
        result.end_time = Utc::now();
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    };

    if let Some(condition) = &cmd.condition {
        let probe = match runner.run(condition, CONDITION_TIMEOUT, cancel.clone()).await {
            Ok(output) => output,
            Err(e) => {
                return finish(CommandResult {
                    command_id: cmd.id.clone(),
                    name: cmd.name.clone(),
                    command: cmd.command.clone(),
                    status: ExecStatus::Failed,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    error: Some(format!("condition probe failed: {e}")),
                    skipped: false,
                    retry_count: 0,
                    start_time,
                    end_time: start_time,
                    duration_ms: 0,
                });
            }
        };
        if probe.exit_code != Some(0) {
            debug!("condition not met for {}, skipping", cmd.name);
            return finish(CommandResult {
                command_id: cmd.id.clone(),
                name: cmd.name.clone(),
                command: cmd.command.clone(),
                status: ExecStatus::Success,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: probe.exit_code,
                error: None,
                skipped: true,
                retry_count: 0,
                start_time,
                end_time: start_time,
                duration_ms: 0,
            });
        }
    }

    let command_line = build_command_line(cmd);
    let timeout = Duration::from_secs(cmd.timeout_secs.max(1));
    let attempts = 1 + cmd.retry_times;
    let mut last: Option<CommandResult> = None;

    for attempt in 0..attempts {
        match runner.run(&command_line, timeout, cancel.clone()).await {
            Ok(output) => {
                let result = result_from_output(cmd, &output, attempt);
                match output.status {
                    ExecStatus::Success => return finish(result),
                    // Timeout and cancellation are terminal, not retried.
                    ExecStatus::Timeout | ExecStatus::Cancelled => return finish(result),
                    _ => last = Some(result),
                }
            }
            Err(e) => {
                last = Some(CommandResult {
                    command_id: cmd.id.clone(),
                    name: cmd.name.clone(),
                    command: cmd.command.clone(),
                    status: ExecStatus::Failed,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    error: Some(e.to_string()),
                    skipped: false,
                    retry_count: attempt,
                    start_time,
                    end_time: start_time,
                    duration_ms: 0,
                });
            }
        }
        if attempt + 1 < attempts && cmd.retry_interval_secs > 0 {
            tokio::time::sleep(Duration::from_secs(cmd.retry_interval_secs)).await;
        }
    }

    let mut result = last.unwrap_or_else(|| CommandResult {
        command_id: cmd.id.clone(),
        name: cmd.name.clone(),
        command: cmd.command.clone(),
        status: ExecStatus::Failed,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: None,
        error: Some("no attempt executed".to_string()),
        skipped: false,
        retry_count: 0,
        start_time,
        end_time: start_time,
        duration_ms: 0,
    });
    if cmd.ignore_error {
        result.status = ExecStatus::Success;
    }
    finish(result)
}

/// Run one phase of a batch in the configured mode.
async fn run_phase(
    runner: Arc<dyn CommandRunner>,
    commands: &[Command],
    mode: BatchMode,
    stop_on_error: bool,
    cancel: watch::Receiver<bool>,
) -> Vec<CommandResult> {
    match mode {
        BatchMode::Sequential => {
            let mut results = Vec::with_capacity(commands.len());
            for cmd in commands {
                let result = run_single(&*runner, cmd, cancel.clone()).await;
                let failed = result.status != ExecStatus::Success;
                let continue_anyway = cmd.continue_on_error;
                results.push(result);
                if failed && stop_on_error && !continue_anyway {
                    break;
                }
            }
            results
        }
        BatchMode::Parallel => {
            let mut handles = Vec::with_capacity(commands.len());
            for cmd in commands {
                let runner = runner.clone();
                let cmd = cmd.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    run_single(&*runner, &cmd, cancel).await
                }));
            }
            let mut results = Vec::with_capacity(handles.len());
            for (i, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        // A panicked worker still yields an entry so the
                        // result count matches the command count.
                        let cmd = &commands[i];
                        let now = Utc::now();
                        results.push(CommandResult {
                            command_id: cmd.id.clone(),
                            name: cmd.name.clone(),
                            command: cmd.command.clone(),
                            status: ExecStatus::Failed,
                            stdout: String::new(),
                            stderr: String::new(),
                            exit_code: None,
                            error: Some(format!("worker panicked: {e}")),
                            skipped: false,
                            retry_count: 0,
                            start_time: now,
                            end_time: now,
                            duration_ms: 0,
                        });
                    }
                }
            }
            results
        }
    }
}

/// Try/catch/finally over one runner.
pub async fn run_batch(
    runner: Arc<dyn CommandRunner>,
    batch: &BatchCommand,
    cancel: watch::Receiver<bool>,
) -> BatchResult {
    // A whole-batch deadline folds into the cancel signal: expiry cancels
    // whatever is still running.
    let cancel = if batch.total_timeout_secs > 0 {
        let (tx, rx) = watch::channel(false);
        let mut outer = cancel;
        let total = Duration::from_secs(batch.total_timeout_secs);
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(total);
            tokio::pin!(deadline);
            let mut outer_alive = true;
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    result = outer.changed(), if outer_alive => {
                        match result {
                            Ok(()) if *outer.borrow() => break,
                            Ok(()) => {}
                            Err(_) => outer_alive = false,
                        }
                    }
                }
            }
            let _ = tx.send(true);
        });
        rx
    } else {
        cancel
    };

    let try_results = run_phase(
        runner.clone(),
        &batch.try_commands,
        batch.mode,
        batch.stop_on_error,
        cancel.clone(),
    )
    .await;

    let total = try_results.len();
    let failed = try_results.iter().filter(|r| r.status != ExecStatus::Success).count();
    let success = total - failed;
    let try_succeeded = failed == 0;

    let catch_results = if !try_succeeded && !batch.catch_commands.is_empty() {
        debug!("batch {} entering catch phase", batch.id);
        run_phase(runner.clone(), &batch.catch_commands, batch.mode, false, cancel.clone()).await
    } else {
        Vec::new()
    };

    let finally_results = if !batch.finally_commands.is_empty() {
        run_phase(runner, &batch.finally_commands, batch.mode, false, cancel).await
    } else {
        Vec::new()
    };

    let status = if try_succeeded || batch.continue_on_failed {
        ExecStatus::Success
    } else {
        ExecStatus::Failed
    };

    BatchResult {
        batch_id: batch.id.clone(),
        name: batch.name.clone(),
        status,
        total,
        success,
        failed,
        try_results,
        catch_results,
        finally_results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::credentials::MemoryCredentials;
    use fleet_core::server::Server;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted runner: interprets a tiny command language.
    /// `echo <text>` prints, `exit:<code>` exits with the code,
    /// `sleep:<ms>` waits (observing cancellation), `flaky:<n>` fails the
    /// first n invocations, `false` exits 1.
    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl FakeRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    fn output(exit_code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: if exit_code == 0 { String::new() } else { "failed".to_string() },
            exit_code: Some(exit_code),
            status: if exit_code == 0 { ExecStatus::Success } else { ExecStatus::Failed },
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            command_line: &str,
            _timeout: Duration,
            mut cancel: watch::Receiver<bool>,
        ) -> Result<CommandOutput, ExecError> {
            self.calls.lock().push(command_line.to_string());

            if let Some(text) = command_line.strip_prefix("echo ") {
                return Ok(output(0, &format!("{text}\n")));
            }
            if let Some(code) = command_line.strip_prefix("exit:") {
                let code: i32 = code.parse().map_err(|_| ExecError::Internal("bad exit".into()))?;
                return Ok(output(code, ""));
            }
            if command_line == "false" {
                return Ok(output(1, ""));
            }
            if command_line == "true" {
                return Ok(output(0, ""));
            }
            if let Some(ms) = command_line.strip_prefix("sleep:") {
                let ms: u64 = ms.parse().map_err(|_| ExecError::Internal("bad sleep".into()))?;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        return Ok(output(0, "slept"));
                    }
                    changed = cancel.changed() => {
                        if changed.is_ok() && *cancel.borrow() {
                            return Ok(CommandOutput {
                                stdout: String::new(),
                                stderr: String::new(),
                                exit_code: None,
                                status: ExecStatus::Cancelled,
                            });
                        }
                        return Ok(output(0, "slept"));
                    }
                }
            }
            if let Some(n) = command_line.strip_prefix("flaky:") {
                let n: u32 = n.parse().map_err(|_| ExecError::Internal("bad flaky".into()))?;
                let mut attempts = self.attempts.lock();
                let count = attempts.entry(command_line.to_string()).or_insert(0);
                *count += 1;
                return Ok(if *count > n { output(0, "recovered") } else { output(1, "") });
            }
            Ok(output(0, ""))
        }

        async fn upload(&self, path: &str, content: &[u8]) -> Result<(), ExecError> {
            self.uploads.lock().push((path.to_string(), content.to_vec()));
            Ok(())
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test process so
        // the cancel arm stays quiet.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_single_success() {
        let runner = FakeRunner::new();
        let cmd = Command::shell("c1", "hello", "echo hi");
        let result = run_single(&*runner, &cmd, no_cancel()).await;
        assert_eq!(result.status, ExecStatus::Success);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.retry_count, 0);
        assert!(!result.skipped);
    }

    #[tokio::test]
    async fn test_condition_not_met_skips() {
        let runner = FakeRunner::new();
        let mut cmd = Command::shell("c1", "guarded", "echo should-not-run");
        cmd.condition = Some("false".to_string());
        let result = run_single(&*runner, &cmd, no_cancel()).await;
        assert_eq!(result.status, ExecStatus::Success);
        assert!(result.skipped);
        assert!(!runner.calls().iter().any(|c| c.contains("should-not-run")));
    }

    #[tokio::test]
    async fn test_condition_met_runs() {
        let runner = FakeRunner::new();
        let mut cmd = Command::shell("c1", "guarded", "echo ran");
        cmd.condition = Some("true".to_string());
        let result = run_single(&*runner, &cmd, no_cancel()).await;
        assert_eq!(result.status, ExecStatus::Success);
        assert!(!result.skipped);
        assert_eq!(result.stdout, "ran\n");
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let runner = FakeRunner::new();
        let mut cmd = Command::shell("c1", "flaky", "flaky:2");
        cmd.retry_times = 3;
        let result = run_single(&*runner, &cmd, no_cancel()).await;
        assert_eq!(result.status, ExecStatus::Success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_failed() {
        let runner = FakeRunner::new();
        let mut cmd = Command::shell("c1", "broken", "false");
        cmd.retry_times = 2;
        let result = run_single(&*runner, &cmd, no_cancel()).await;
        assert_eq!(result.status, ExecStatus::Failed);
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_ignore_error_folds_to_success() {
        let runner = FakeRunner::new();
        let mut cmd = Command::shell("c1", "tolerated", "exit:7");
        cmd.ignore_error = true;
        let result = run_single(&*runner, &cmd, no_cancel()).await;
        assert_eq!(result.status, ExecStatus::Success);
        assert_eq!(result.exit_code, Some(7));
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let runner = FakeRunner::new();
        let cmd = Command::shell("c1", "long", "sleep:5000");
        let (tx, rx) = watch::channel(false);

        let runner2 = runner.clone();
        let handle = tokio::spawn(async move { run_single(&*runner2, &cmd, rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancel should finish the command")
            .unwrap();
        assert_eq!(result.status, ExecStatus::Cancelled);
    }

    fn batch(mode: BatchMode) -> BatchCommand {
        BatchCommand {
            id: "b1".into(),
            name: "batch".into(),
            mode,
            total_timeout_secs: 0,
            try_commands: vec![],
            catch_commands: vec![],
            finally_commands: vec![],
            stop_on_error: false,
            continue_on_failed: false,
        }
    }

    /// try [echo a, false, echo b] sequential with stop_on_error: the third
    /// command never runs, catch and finally both run.
    #[tokio::test]
    async fn test_try_catch_finally_sequential() {
        let runner = FakeRunner::new();
        let mut b = batch(BatchMode::Sequential);
        b.stop_on_error = true;
        b.try_commands = vec![
            Command::shell("t1", "a", "echo a"),
            Command::shell("t2", "boom", "false"),
            Command::shell("t3", "b", "echo b"),
        ];
        b.catch_commands = vec![Command::shell("c1", "c", "echo c")];
        b.finally_commands = vec![Command::shell("f1", "d", "echo d")];

        let result = run_batch(runner.clone(), &b, no_cancel()).await;
        assert_eq!(result.try_results.len(), 2);
        assert_eq!(result.try_results[0].status, ExecStatus::Success);
        assert_eq!(result.try_results[1].status, ExecStatus::Failed);
        assert_eq!(result.catch_results.len(), 1);
        assert_eq!(result.catch_results[0].status, ExecStatus::Success);
        assert_eq!(result.finally_results.len(), 1);
        assert_eq!(result.finally_results[0].status, ExecStatus::Success);
        assert_eq!(result.status, ExecStatus::Failed);
        assert_eq!(result.failed, 1);
        assert!(!runner.calls().iter().any(|c| c.contains("echo b")));

        // Same batch with continue_on_failed reports overall success.
        let runner = FakeRunner::new();
        let mut b2 = b.clone();
        b2.continue_on_failed = true;
        let result = run_batch(runner, &b2, no_cancel()).await;
        assert_eq!(result.status, ExecStatus::Success);
    }

    #[tokio::test]
    async fn test_stop_on_error_honors_continue_on_error() {
        let runner = FakeRunner::new();
        let mut b = batch(BatchMode::Sequential);
        b.stop_on_error = true;
        let mut tolerated = Command::shell("t2", "boom", "false");
        tolerated.continue_on_error = true;
        b.try_commands = vec![
            Command::shell("t1", "a", "echo a"),
            tolerated,
            Command::shell("t3", "b", "echo b"),
        ];

        let result = run_batch(runner, &b, no_cancel()).await;
        assert_eq!(result.try_results.len(), 3, "failing command must not stop the phase");
        assert_eq!(result.failed, 1);
    }

    /// Parallel mode returns exactly N entries regardless of failures.
    #[tokio::test]
    async fn test_parallel_returns_all_results() {
        let runner = FakeRunner::new();
        let mut b = batch(BatchMode::Parallel);
        b.try_commands = vec![
            Command::shell("t1", "a", "echo a"),
            Command::shell("t2", "boom", "false"),
            Command::shell("t3", "b", "echo b"),
            Command::shell("t4", "boom2", "exit:3"),
        ];

        let result = run_batch(runner, &b, no_cancel()).await;
        assert_eq!(result.try_results.len(), 4);
        assert_eq!(result.total, 4);
        assert_eq!(result.success, 2);
        assert_eq!(result.failed, 2);
        assert_eq!(result.status, ExecStatus::Failed);
    }

    #[tokio::test]
    async fn test_catch_skipped_when_try_succeeds() {
        let runner = FakeRunner::new();
        let mut b = batch(BatchMode::Sequential);
        b.try_commands = vec![Command::shell("t1", "a", "echo a")];
        b.catch_commands = vec![Command::shell("c1", "c", "echo c")];
        b.finally_commands = vec![Command::shell("f1", "d", "echo d")];

        let result = run_batch(runner.clone(), &b, no_cancel()).await;
        assert!(result.catch_results.is_empty());
        assert_eq!(result.finally_results.len(), 1);
        assert_eq!(result.status, ExecStatus::Success);
        assert!(!runner.calls().iter().any(|c| c.contains("echo c")));
    }

    #[tokio::test]
    async fn test_empty_catch_stays_empty_on_failure() {
        let runner = FakeRunner::new();
        let mut b = batch(BatchMode::Sequential);
        b.try_commands = vec![Command::shell("t1", "boom", "false")];
        b.finally_commands = vec![Command::shell("f1", "d", "echo d")];

        let result = run_batch(runner, &b, no_cancel()).await;
        assert!(result.catch_results.is_empty());
        assert_eq!(result.finally_results.len(), 1);
    }

    #[tokio::test]
    async fn test_total_timeout_cancels_batch() {
        let runner = FakeRunner::new();
        let mut b = batch(BatchMode::Parallel);
        b.total_timeout_secs = 1;
        b.try_commands = vec![Command::shell("t1", "long", "sleep:30000")];

        let started = std::time::Instant::now();
        let result = run_batch(runner, &b, no_cancel()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.try_results.len(), 1);
        assert_eq!(result.try_results[0].status, ExecStatus::Cancelled);
    }

    /// Async execution against an unreachable server leaves a retrievable
    /// failure record; cancel on an unknown id is a no-op.
    #[tokio::test]
    async fn test_async_execute_records_connect_failure() {
        let credentials = Arc::new(MemoryCredentials::new());
        let executor = Executor::new(credentials, None);

        let server = Server {
            id: "s1".into(),
            name: "unreachable".into(),
            host: "127.0.0.1".into(),
            port: 1,
            username: "root".into(),
            credential_id: "missing".into(),
            install_aio: false,
        };
        let request = ExecuteRequest {
            server,
            spec: ExecSpec::Single(Command::shell("c1", "x", "true")),
            save_log: false,
        };

        let request_id = executor.execute_async(request);
        let mut result = None;
        for _ in 0..50 {
            if let Some(r) = executor.async_result(&request_id).await.unwrap() {
                result = Some(r);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let result = result.expect("async result should appear");
        assert!(result.async_exec);
        let command_result = result.command_result.expect("failure record");
        assert_eq!(command_result.status, ExecStatus::Failed);
        assert!(command_result.error.is_some());

        assert!(!executor.cancel_execution("nope"));
    }
}
