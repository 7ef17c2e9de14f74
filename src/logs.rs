//! Per-session log sinks under `<cwd>/.agent-yes/`.
//!
//! Each session appends to three files: the verbatim PTY byte stream, the
//! escape-stripped decoded lines, and a structured debug trace. A failing
//! sink is dropped while the rest of the pipeline keeps running.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const GITIGNORE_BODY: &str = "logs/\nfifo/\n*.sqlite*\n";

pub fn state_dir(cwd: &Path) -> PathBuf {
    cwd.join(".agent-yes")
}

pub fn logs_dir(cwd: &Path) -> PathBuf {
    state_dir(cwd).join("logs")
}

pub fn fifo_dir(cwd: &Path) -> PathBuf {
    state_dir(cwd).join("fifo")
}

pub fn raw_log_path(cwd: &Path, pid: i32) -> PathBuf {
    logs_dir(cwd).join(format!("{}.raw.log", pid))
}

pub fn lines_log_path(cwd: &Path, pid: i32) -> PathBuf {
    logs_dir(cwd).join(format!("{}.lines.log", pid))
}

pub fn debug_log_path(cwd: &Path, pid: i32) -> PathBuf {
    logs_dir(cwd).join(format!("{}.debug.log", pid))
}

/// Create the workspace state directories and the `.gitignore` that keeps
/// session artifacts out of version control. The `.gitignore` is only ever
/// created, never overwritten.
pub fn ensure_layout(cwd: &Path) -> Result<()> {
    std::fs::create_dir_all(logs_dir(cwd)).context("failed to create logs directory")?;
    std::fs::create_dir_all(fifo_dir(cwd)).context("failed to create fifo directory")?;

    let gitignore = state_dir(cwd).join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE_BODY).context("failed to write .gitignore")?;
    }
    Ok(())
}

/// The three append-only writers for one session.
///
/// Sinks are independent: a sink that fails to open or write is disabled
/// and the failure is recorded in the debug trace (when that sink is still
/// alive) so the session itself is never interrupted.
pub struct SessionLogs {
    raw: Option<File>,
    lines: Option<File>,
    debug: Option<File>,
}

impl SessionLogs {
    pub fn open(cwd: &Path, pid: i32) -> Self {
        if let Err(e) = std::fs::create_dir_all(logs_dir(cwd)) {
            warn!("failed to create log directory: {}", e);
        }

        let open = |path: PathBuf| -> Option<File> {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!("failed to open log file {:?}: {}", path, e);
                    None
                }
            }
        };

        Self {
            raw: open(raw_log_path(cwd, pid)),
            lines: open(lines_log_path(cwd, pid)),
            debug: open(debug_log_path(cwd, pid)),
        }
    }

    /// Append verbatim PTY bytes, escape sequences included.
    pub fn raw(&mut self, data: &[u8]) {
        if let Some(file) = &mut self.raw {
            if file.write_all(data).and_then(|_| file.flush()).is_err() {
                self.raw = None;
                self.trace("logs", "raw sink dropped after write failure");
            }
        }
    }

    /// Append one decoded line, newline-terminated.
    pub fn line(&mut self, line: &str) {
        if let Some(file) = &mut self.lines {
            if writeln!(file, "{}", line).and_then(|_| file.flush()).is_err() {
                self.lines = None;
                self.trace("logs", "line sink dropped after write failure");
            }
        }
    }

    /// Append a structured debug record.
    pub fn trace(&mut self, component: &str, message: &str) {
        self.trace_json(serde_json::json!({
            "ts": crate::registry::now_ms(),
            "component": component,
            "message": message,
        }));
    }

    pub fn trace_json(&mut self, record: serde_json::Value) {
        if let Some(file) = &mut self.debug {
            if writeln!(file, "{}", record).and_then(|_| file.flush()).is_err() {
                self.debug = None;
            }
        }
    }
}

/// Read the final `n` lines of a line log, in order.
pub fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read log file {:?}", path))?;
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(n);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_layout_creates_gitignore_once() {
        let dir = tempdir().unwrap();
        ensure_layout(dir.path()).unwrap();

        let gitignore = state_dir(dir.path()).join(".gitignore");
        assert_eq!(std::fs::read_to_string(&gitignore).unwrap(), GITIGNORE_BODY);

        // A user-edited file must survive re-initialization.
        std::fs::write(&gitignore, "custom\n").unwrap();
        ensure_layout(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&gitignore).unwrap(), "custom\n");
    }

    #[test]
    fn test_session_logs_append() {
        let dir = tempdir().unwrap();
        ensure_layout(dir.path()).unwrap();

        let mut logs = SessionLogs::open(dir.path(), 4242);
        logs.raw(b"\x1b[31mraw bytes\x1b[0m");
        logs.line("first");
        logs.line("second");
        logs.trace("test", "hello");
        drop(logs);

        let raw = std::fs::read(raw_log_path(dir.path(), 4242)).unwrap();
        assert_eq!(raw, b"\x1b[31mraw bytes\x1b[0m");

        let lines = std::fs::read_to_string(lines_log_path(dir.path(), 4242)).unwrap();
        assert_eq!(lines, "first\nsecond\n");

        let debug = std::fs::read_to_string(debug_log_path(dir.path(), 4242)).unwrap();
        let record: serde_json::Value = serde_json::from_str(debug.lines().next().unwrap()).unwrap();
        assert_eq!(record["component"], "test");
        assert_eq!(record["message"], "hello");
    }

    #[test]
    fn test_tail_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tail.log");
        let body: String = (0..50).map(|i| format!("line-{}\n", i)).collect();
        std::fs::write(&path, body).unwrap();

        let tail = tail_lines(&path, 10).unwrap();
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0], "line-40");
        assert_eq!(tail[9], "line-49");

        let all = tail_lines(&path, 1000).unwrap();
        assert_eq!(all.len(), 50);
    }
}
