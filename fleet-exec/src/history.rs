//! Execution history persistence.
//!
//! SQLite behind a dedicated worker thread, since `rusqlite::Connection`
//! is not Send+Sync. Async callers talk to the worker over an mpsc
//! channel with oneshot replies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::command::{ExecuteKind, ExecuteResult};
use crate::error::ExecError;

/// Commands sent to the SQLite worker thread.
enum HistoryCommand {
    Save {
        result: Box<ExecuteResult>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Get {
        request_id: String,
        reply: oneshot::Sender<Result<Option<ExecuteResult>, String>>,
    },
    Recent {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<ExecuteResult>, String>>,
    },
    Cleanup {
        cutoff: DateTime<Utc>,
        reply: oneshot::Sender<Result<usize, String>>,
    },
    Close,
}

pub struct HistoryStore {
    sender: mpsc::Sender<HistoryCommand>,
    _handle: std::thread::JoinHandle<()>,
}

impl HistoryStore {
    /// Open (or create) the history database and start its worker thread.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ExecError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let (sender, receiver) = mpsc::channel(64);
        let handle = std::thread::spawn(move || history_worker(path, receiver));
        Ok(Self {
            sender,
            _handle: handle,
        })
    }

    /// Upsert by request id.
    pub async fn save(&self, result: &ExecuteResult) -> Result<(), ExecError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(HistoryCommand::Save {
                result: Box::new(result.clone()),
                reply,
            })
            .await
            .map_err(|_| ExecError::History("worker gone".to_string()))?;
        rx.await
            .map_err(|_| ExecError::History("worker dropped reply".to_string()))?
            .map_err(ExecError::History)
    }

    pub async fn get(&self, request_id: &str) -> Result<Option<ExecuteResult>, ExecError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(HistoryCommand::Get {
                request_id: request_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| ExecError::History("worker gone".to_string()))?;
        rx.await
            .map_err(|_| ExecError::History("worker dropped reply".to_string()))?
            .map_err(ExecError::History)
    }

    /// Latest results, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<ExecuteResult>, ExecError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(HistoryCommand::Recent { limit, reply })
            .await
            .map_err(|_| ExecError::History("worker gone".to_string()))?;
        rx.await
            .map_err(|_| ExecError::History("worker dropped reply".to_string()))?
            .map_err(ExecError::History)
    }

    /// Delete records created before `now - ttl`; returns how many went.
    pub async fn cleanup_expired(&self, ttl: Duration) -> Result<usize, ExecError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(ttl)
                .map_err(|e| ExecError::History(format!("ttl out of range: {e}")))?;
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(HistoryCommand::Cleanup { cutoff, reply })
            .await
            .map_err(|_| ExecError::History("worker gone".to_string()))?;
        rx.await
            .map_err(|_| ExecError::History("worker dropped reply".to_string()))?
            .map_err(ExecError::History)
    }

    pub async fn close(&self) {
        let _ = self.sender.send(HistoryCommand::Close).await;
    }
}

/// Worker thread that owns the SQLite connection.
fn history_worker(path: String, mut receiver: mpsc::Receiver<HistoryCommand>) {
    let conn = match Connection::open_with_flags(
        &path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!("history open {path}: {e}");
            return;
        }
    };

    if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;") {
        warn!("history pragma: {e}");
    }
    if let Err(e) = conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS execute_results (
            request_id     TEXT PRIMARY KEY,
            kind           TEXT NOT NULL,
            server_id      TEXT NOT NULL,
            is_async       INTEGER NOT NULL,
            start_time     TEXT NOT NULL,
            end_time       TEXT NOT NULL,
            command_result TEXT,
            batch_result   TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_execute_results_created
            ON execute_results (created_at);",
    ) {
        error!("history schema: {e}");
        return;
    }

    while let Some(cmd) = receiver.blocking_recv() {
        match cmd {
            HistoryCommand::Save { result, reply } => {
                let _ = reply.send(do_save(&conn, &result));
            }
            HistoryCommand::Get { request_id, reply } => {
                let _ = reply.send(do_get(&conn, &request_id));
            }
            HistoryCommand::Recent { limit, reply } => {
                let _ = reply.send(do_recent(&conn, limit));
            }
            HistoryCommand::Cleanup { cutoff, reply } => {
                let _ = reply.send(do_cleanup(&conn, cutoff));
            }
            HistoryCommand::Close => break,
        }
    }
}

fn kind_to_str(kind: ExecuteKind) -> &'static str {
    match kind {
        ExecuteKind::Single => "single",
        ExecuteKind::Batch => "batch",
    }
}

fn kind_from_str(s: &str) -> Result<ExecuteKind, String> {
    match s {
        "single" => Ok(ExecuteKind::Single),
        "batch" => Ok(ExecuteKind::Batch),
        other => Err(format!("unknown kind {other}")),
    }
}

fn do_save(conn: &Connection, result: &ExecuteResult) -> Result<(), String> {
    let now = Utc::now().to_rfc3339();
    let command_result = result
        .command_result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| e.to_string())?;
    let batch_result = result
        .batch_result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| e.to_string())?;

    conn.execute(
        "INSERT INTO execute_results
            (request_id, kind, server_id, is_async, start_time, end_time,
             command_result, batch_result, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(request_id) DO UPDATE SET
            kind = excluded.kind,
            server_id = excluded.server_id,
            is_async = excluded.is_async,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            command_result = excluded.command_result,
            batch_result = excluded.batch_result,
            updated_at = excluded.updated_at",
        params![
            result.request_id,
            kind_to_str(result.kind),
            result.server_id,
            result.async_exec as i64,
            result.start_time.to_rfc3339(),
            result.end_time.to_rfc3339(),
            command_result,
            batch_result,
            now,
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn row_to_result(row: &rusqlite::Row<'_>) -> Result<ExecuteResult, String> {
    let request_id: String = row.get(0).map_err(|e| e.to_string())?;
    let kind: String = row.get(1).map_err(|e| e.to_string())?;
    let server_id: String = row.get(2).map_err(|e| e.to_string())?;
    let is_async: i64 = row.get(3).map_err(|e| e.to_string())?;
    let start_time: String = row.get(4).map_err(|e| e.to_string())?;
    let end_time: String = row.get(5).map_err(|e| e.to_string())?;
    let command_result: Option<String> = row.get(6).map_err(|e| e.to_string())?;
    let batch_result: Option<String> = row.get(7).map_err(|e| e.to_string())?;

    let parse_time = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| e.to_string())
    };

    Ok(ExecuteResult {
        request_id,
        kind: kind_from_str(&kind)?,
        server_id,
        async_exec: is_async != 0,
        start_time: parse_time(&start_time)?,
        end_time: parse_time(&end_time)?,
        command_result: command_result
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| e.to_string())?,
        batch_result: batch_result
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| e.to_string())?,
    })
}

const RESULT_COLUMNS: &str = "request_id, kind, server_id, is_async, start_time, end_time,
                    command_result, batch_result";

fn do_get(conn: &Connection, request_id: &str) -> Result<Option<ExecuteResult>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM execute_results WHERE request_id = ?1"
        ))
        .map_err(|e| e.to_string())?;

    let mut rows = stmt.query([request_id]).map_err(|e| e.to_string())?;
    let Some(row) = rows.next().map_err(|e| e.to_string())? else {
        return Ok(None);
    };
    row_to_result(row).map(Some)
}

fn do_recent(conn: &Connection, limit: usize) -> Result<Vec<ExecuteResult>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM execute_results
             ORDER BY created_at DESC LIMIT ?1"
        ))
        .map_err(|e| e.to_string())?;

    let mut rows = stmt.query([limit as i64]).map_err(|e| e.to_string())?;
    let mut results = Vec::new();
    while let Some(row) = rows.next().map_err(|e| e.to_string())? {
        results.push(row_to_result(row)?);
    }
    Ok(results)
}

fn do_cleanup(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM execute_results WHERE created_at < ?1",
        [cutoff.to_rfc3339()],
    )
    .map_err(|e| e.to_string())
}
