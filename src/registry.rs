//! Durable process registry: one sqlite file per workspace recording every
//! supervised session, so sibling invocations can find the live session's
//! IPC endpoint and retrieve logs after exit.
//!
//! The store is best-effort. When the database cannot be opened (read-only
//! filesystem, locked volume) the registry degrades to a no-op and the
//! session runs without durable history.

use anyhow::Result;
use nix::sys::signal;
use nix::unistd::Pid;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::logs;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pid_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pid INTEGER UNIQUE NOT NULL,
  cli TEXT NOT NULL,
  args TEXT NOT NULL,
  prompt TEXT,
  logFile TEXT NOT NULL,
  fifoFile TEXT NOT NULL,
  status TEXT NOT NULL CHECK(status IN ('idle','active','exited')),
  exitReason TEXT NOT NULL DEFAULT '',
  exitCode INTEGER,
  startedAt INTEGER NOT NULL,
  updatedAt INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pid_records_status ON pid_records(status);
"#;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Active,
    Exited,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Active => "active",
            Status::Exited => "exited",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Status::Idle),
            "active" => Some(Status::Active),
            "exited" => Some(Status::Exited),
            _ => None,
        }
    }
}

/// One registered session.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub pid: i64,
    pub cli: String,
    pub args: Vec<String>,
    pub prompt: Option<String>,
    pub log_file: String,
    pub fifo_file: String,
    pub status: Status,
    pub exit_reason: String,
    pub exit_code: Option<i64>,
    pub started_at: i64,
    pub updated_at: i64,
}

impl Record {
    pub fn new(
        pid: i64,
        cli: String,
        args: Vec<String>,
        prompt: Option<String>,
        log_file: String,
        fifo_file: String,
    ) -> Self {
        let now = now_ms();
        Self {
            pid,
            cli,
            args,
            prompt,
            log_file,
            fifo_file,
            status: Status::Active,
            exit_reason: String::new(),
            exit_code: None,
            started_at: now,
            updated_at: now,
        }
    }
}

enum Backend {
    Sqlite(Connection),
    /// No-op fallback when the store is unavailable.
    Memory,
}

pub struct Registry {
    backend: Backend,
}

impl Registry {
    /// Open (and initialize) the workspace registry: directories, schema,
    /// `.gitignore`, WAL mode, then a stale sweep marking rows whose pid is
    /// no longer alive as exited.
    pub fn open(cwd: &Path) -> Self {
        match Self::open_sqlite(cwd) {
            Ok(registry) => registry,
            Err(e) => {
                warn!("registry unavailable, continuing without history: {}", e);
                Self {
                    backend: Backend::Memory,
                }
            }
        }
    }

    fn open_sqlite(cwd: &Path) -> Result<Self> {
        logs::ensure_layout(cwd)?;

        let conn = Connection::open(db_path(cwd))?;
        // WAL so sibling invocations can read while the supervisor writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;

        let registry = Self {
            backend: Backend::Sqlite(conn),
        };
        registry.stale_sweep()?;
        Ok(registry)
    }

    /// Whether records actually persist.
    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Sqlite(_))
    }

    /// Insert a session record, replacing any previous row for the same pid
    /// (the OS reuses pids; one row per pid, latest values win).
    pub fn register(&self, record: &Record) -> Result<()> {
        let Backend::Sqlite(conn) = &self.backend else {
            return Ok(());
        };

        conn.execute(
            "INSERT INTO pid_records
               (pid, cli, args, prompt, logFile, fifoFile, status, exitReason, exitCode, startedAt, updatedAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(pid) DO UPDATE SET
               cli = excluded.cli,
               args = excluded.args,
               prompt = excluded.prompt,
               logFile = excluded.logFile,
               fifoFile = excluded.fifoFile,
               status = excluded.status,
               exitReason = excluded.exitReason,
               exitCode = excluded.exitCode,
               startedAt = excluded.startedAt,
               updatedAt = excluded.updatedAt",
            params![
                record.pid,
                record.cli,
                serde_json::to_string(&record.args)?,
                record.prompt,
                record.log_file,
                record.fifo_file,
                record.status.as_str(),
                record.exit_reason,
                record.exit_code,
                record.started_at,
                record.updated_at,
            ],
        )?;
        debug!("registered session pid={}", record.pid);
        Ok(())
    }

    /// Update a session's status and, when provided, its exit fields.
    pub fn update_status(
        &self,
        pid: i64,
        status: Status,
        exit_reason: Option<&str>,
        exit_code: Option<i64>,
    ) -> Result<()> {
        let Backend::Sqlite(conn) = &self.backend else {
            return Ok(());
        };

        let mut fields = vec!["status = ?", "updatedAt = ?"];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(status.as_str().to_string()), Box::new(now_ms())];

        if let Some(reason) = exit_reason {
            fields.push("exitReason = ?");
            values.push(Box::new(reason.to_string()));
        }
        if let Some(code) = exit_code {
            fields.push("exitCode = ?");
            values.push(Box::new(code));
        }
        values.push(Box::new(pid));

        let sql = format!(
            "UPDATE pid_records SET {} WHERE pid = ?",
            fields.join(", ")
        );
        let args: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, args.as_slice())?;
        Ok(())
    }

    /// The most recently started non-exited session, if any. This is how an
    /// out-of-band invocation locates the IPC endpoint to write to.
    pub fn find_active_ipc(&self) -> Result<Option<Record>> {
        let Backend::Sqlite(conn) = &self.backend else {
            return Ok(None);
        };

        let record = conn
            .query_row(
                "SELECT * FROM pid_records WHERE status != 'exited'
                 ORDER BY startedAt DESC, id DESC LIMIT 1",
                [],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Look up a session by pid, live or exited (for log retrieval).
    pub fn find_by_pid(&self, pid: i64) -> Result<Option<Record>> {
        let Backend::Sqlite(conn) = &self.backend else {
            return Ok(None);
        };

        let record = conn
            .query_row(
                "SELECT * FROM pid_records WHERE pid = ?",
                params![pid],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Mark every non-exited row whose pid is gone as exited. Safe to run
    /// repeatedly; already-exited rows are never touched.
    fn stale_sweep(&self) -> Result<()> {
        let Backend::Sqlite(conn) = &self.backend else {
            return Ok(());
        };

        let pids: Vec<i64> = {
            let mut stmt =
                conn.prepare("SELECT pid FROM pid_records WHERE status != 'exited'")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for pid in pids {
            if !pid_alive(pid) {
                info!("stale session pid={} marked exited", pid);
                conn.execute(
                    "UPDATE pid_records
                     SET status = 'exited', exitReason = 'stale-cleanup', updatedAt = ?1
                     WHERE pid = ?2",
                    params![now_ms(), pid],
                )?;
            }
        }
        Ok(())
    }
}

fn db_path(cwd: &Path) -> PathBuf {
    logs::state_dir(cwd).join("pid.sqlite")
}

/// Probe a pid with signal 0. EPERM means the process exists but belongs to
/// someone else, which still counts as alive.
pub fn pid_alive(pid: i64) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
    let args_json: String = row.get("args")?;
    let status_str: String = row.get("status")?;

    Ok(Record {
        pid: row.get("pid")?,
        cli: row.get("cli")?,
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        prompt: row.get("prompt")?,
        log_file: row.get("logFile")?,
        fifo_file: row.get("fifoFile")?,
        status: Status::from_str(&status_str).unwrap_or(Status::Exited),
        exit_reason: row.get("exitReason")?,
        exit_code: row.get("exitCode")?,
        started_at: row.get("startedAt")?,
        updated_at: row.get("updatedAt")?,
    })
}
