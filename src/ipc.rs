//! Out-of-band IPC: a per-session named FIFO that sibling invocations write
//! a line into, forwarded verbatim onto the assistant's stdin.
//!
//! Wire format: the raw UTF-8 bytes of the line followed by a single `\r`.
//! A sender connects, writes one frame, and closes. Frames are kept at or
//! below PIPE_BUF so concurrent senders cannot interleave.

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::stat::Mode;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::logs;
use crate::registry::Registry;

/// How long a sender keeps retrying to reach a session's FIFO.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fifo_path(cwd: &Path, pid: i32) -> PathBuf {
    logs::fifo_dir(cwd).join(format!("{}.stdin", pid))
}

/// The receiving side of a session's FIFO.
///
/// A blocking thread reopens the FIFO after each writer disconnects and
/// forwards every frame through the returned channel. The endpoint is
/// unlinked on shutdown.
pub struct IpcEndpoint {
    path: PathBuf,
}

impl IpcEndpoint {
    pub fn create(cwd: &Path, pid: i32) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let dir = logs::fifo_dir(cwd);
        std::fs::create_dir_all(&dir).context("failed to create fifo directory")?;

        let path = fifo_path(cwd, pid);
        if path.exists() {
            std::fs::remove_file(&path).context("failed to remove stale fifo")?;
        }
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
            .context("failed to create fifo")?;

        let (tx, rx) = mpsc::channel(1024);
        let reader_path = path.clone();
        std::thread::spawn(move || Self::reader_thread(reader_path, tx));

        info!("IPC endpoint at {:?}", path);
        Ok((Self { path }, rx))
    }

    fn reader_thread(path: PathBuf, tx: mpsc::Sender<Vec<u8>>) {
        loop {
            // Blocks until a writer opens the FIFO; EOF when it closes.
            let mut file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    debug!("fifo reader stopping: {}", e);
                    break;
                }
            };

            let mut buf = [0u8; 4096];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("fifo read error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the FIFO from the filesystem.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("failed to unlink fifo {:?}: {}", self.path, e);
        }
    }
}

/// Forward one line into the active session in `cwd`.
///
/// Resolves the newest non-exited session from the registry, connects to
/// its FIFO (retrying until the supervisor's reader is up, bounded by the
/// connect timeout), and writes a single `<text>\r` frame.
pub async fn send_to_active(cwd: &Path, text: &str) -> Result<()> {
    let registry = Registry::open(cwd);
    let record = registry
        .find_active_ipc()?
        .context("no active agent-yes session in this directory")?;

    let mut frame = text.as_bytes().to_vec();
    frame.push(b'\r');
    if frame.len() > libc::PIPE_BUF {
        bail!(
            "frame of {} bytes exceeds the atomic pipe write limit ({})",
            frame.len(),
            libc::PIPE_BUF
        );
    }

    let path = PathBuf::from(&record.fifo_file);
    let fd = open_writer(&path)
        .await
        .with_context(|| format!("session {} is not accepting input", record.pid))?;

    nix::unistd::write(&fd, &frame).context("failed to write frame")?;
    info!("forwarded {} bytes to session {}", frame.len(), record.pid);
    Ok(())
}

/// Open the FIFO for writing without blocking forever: a non-blocking open
/// fails with ENXIO until a reader exists, so retry up to the deadline.
async fn open_writer(path: &Path) -> Result<OwnedFd> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match nix::fcntl::open(path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
            Ok(raw) => return Ok(unsafe { OwnedFd::from_raw_fd(raw) }),
            Err(nix::errno::Errno::ENXIO) | Err(nix::errno::Errno::ENOENT) => {
                if Instant::now() >= deadline {
                    bail!("timed out connecting to {:?}", path);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                warn!("fifo open error: {}", e);
                return Err(e.into());
            }
        }
    }
}
