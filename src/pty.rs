//! PTY (pseudo-terminal) driver for spawning and communicating with the
//! supervised assistant.
//!
//! Provides:
//! - Creating a PTY and spawning the assistant inside it
//! - Reading output chunks and writing input bytes
//! - Terminal resize (with a minimum-column clamp) and signalling
//! - Raw-mode acquisition for the controlling terminal, restored on drop

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, read, setsid, write, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Assistants misrender below this width; resize requests are clamped.
const MIN_COLS: u16 = 20;

/// Original terminal settings, saved once when raw mode is first enabled.
static ORIGINAL_TERMIOS: OnceLock<libc::termios> = OnceLock::new();

/// PTY handle for communicating with the child process.
pub struct Pty {
    master_fd: OwnedFd,
    child_pid: Pid,
    running: Arc<AtomicBool>,
}

impl Pty {
    /// Open a PTY of the given size and spawn `command` inside it with the
    /// inherited environment, `TERM=xterm-color`, and `cwd` as its working
    /// directory. `command[0]` is the binary.
    pub fn spawn(
        command: &[String],
        cwd: &Path,
        rows: Option<u16>,
        cols: Option<u16>,
    ) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("command cannot be empty");
        }

        let winsize = match (rows, cols) {
            (Some(r), Some(c)) => Winsize {
                ws_row: r,
                ws_col: c.max(MIN_COLS),
                ws_xpixel: 0,
                ws_ypixel: 0,
            },
            _ => clamp_winsize(get_terminal_size().unwrap_or(Winsize {
                ws_row: 24,
                ws_col: 80,
                ws_xpixel: 0,
                ws_ypixel: 0,
            })),
        };

        let OpenptyResult { master, slave } =
            openpty(&winsize, None).context("failed to open PTY")?;

        match unsafe { fork() }.context("failed to fork")? {
            ForkResult::Parent { child } => {
                drop(slave);

                // Non-blocking master so reads can be polled.
                let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )?;

                info!("spawned assistant with pid {}", child);

                Ok(Self {
                    master_fd: master,
                    child_pid: child,
                    running: Arc::new(AtomicBool::new(true)),
                })
            }
            ForkResult::Child => {
                drop(master);

                setsid().ok();

                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                }

                let slave_raw = slave.as_raw_fd();
                dup2(slave_raw, libc::STDIN_FILENO).ok();
                dup2(slave_raw, libc::STDOUT_FILENO).ok();
                dup2(slave_raw, libc::STDERR_FILENO).ok();
                if slave_raw > 2 {
                    drop(slave);
                }

                std::env::set_current_dir(cwd).ok();
                std::env::set_var("TERM", "xterm-color");
                std::env::set_var("FORCE_COLOR", "1");

                let cmd = CString::new(command[0].as_str()).unwrap();
                let args: Vec<CString> = command
                    .iter()
                    .map(|s| CString::new(s.as_str()).unwrap())
                    .collect();

                let _ = execvp(&cmd, &args);
                // Conventional "command not found" code so the parent can
                // surface an install hint.
                unsafe { libc::_exit(127) }
            }
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master_fd.as_raw_fd()
    }

    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_tty() -> bool {
        unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
    }

    /// Send a signal to the child process.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal::kill(self.child_pid, sig)?;
        Ok(())
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        restore_terminal();
        if self.is_running() {
            let _ = self.signal(Signal::SIGTERM);
        }
    }
}

/// Scoped raw-mode acquisition for the supervisor's own terminal.
///
/// `acquire` returns `None` when stdin is not a TTY (headless runs). The
/// guard restores the saved settings when dropped, which covers every exit
/// path including panics.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn acquire() -> Result<Option<Self>> {
        let stdin_fd = libc::STDIN_FILENO;

        if !Pty::is_tty() {
            debug!("stdin is not a TTY, skipping raw mode");
            return Ok(None);
        }

        unsafe {
            let mut termios: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(stdin_fd, &mut termios) != 0 {
                anyhow::bail!("failed to get terminal attributes");
            }
            let _ = ORIGINAL_TERMIOS.set(termios);

            let mut raw = termios;
            raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN);
            raw.c_iflag &= !(libc::IXON | libc::ICRNL);
            raw.c_oflag &= !libc::OPOST;

            if libc::tcsetattr(stdin_fd, libc::TCSANOW, &raw) != 0 {
                anyhow::bail!("failed to set raw mode");
            }
        }

        debug!("terminal set to raw mode");
        Ok(Some(Self { _private: () }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        restore_terminal();
    }
}

/// Restore the original terminal settings, if raw mode was ever enabled.
pub fn restore_terminal() {
    if let Some(termios) = ORIGINAL_TERMIOS.get() {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, termios);
        }
        debug!("terminal restored");
    }
}

/// Async PTY wrapper.
///
/// PTY reads and writes are bridged to tokio channels by background threads
/// since the master fd must be polled even in non-blocking mode.
pub struct AsyncPty {
    output_rx: mpsc::Receiver<Vec<u8>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    child_pid: Pid,
    master_fd: RawFd,
    pty: Option<Pty>,
}

impl AsyncPty {
    pub fn new(pty: Pty) -> Self {
        let running = pty.running_flag();
        let child_pid = pty.child_pid();
        let master_fd = pty.master_fd();

        let (output_tx, output_rx) = mpsc::channel(1024);
        let (input_tx, input_rx) = mpsc::channel(1024);

        let reader_running = Arc::clone(&running);
        std::thread::spawn(move || {
            Self::reader_thread(master_fd, reader_running, output_tx);
        });

        let writer_running = Arc::clone(&running);
        std::thread::spawn(move || {
            Self::writer_thread(master_fd, writer_running, input_rx);
        });

        Self {
            output_rx,
            input_tx,
            running,
            child_pid,
            master_fd,
            pty: Some(pty),
        }
    }

    fn reader_thread(fd: RawFd, running: Arc<AtomicBool>, tx: mpsc::Sender<Vec<u8>>) {
        let mut buf = [0u8; 8192];
        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            match read(fd, &mut buf) {
                Ok(0) => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(nix::errno::Errno::EIO) => {
                    // The child closed its side of the terminal.
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    error!("PTY read error: {}", e);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        debug!("PTY reader thread exiting");
    }

    fn writer_thread(fd: RawFd, running: Arc<AtomicBool>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(data) = rx.blocking_recv() {
            if !running.load(Ordering::SeqCst) {
                // Write-after-exit is dropped.
                continue;
            }

            let mut written = 0;
            while written < data.len() {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                match write(borrowed, &data[written..]) {
                    Ok(n) => written += n,
                    Err(nix::errno::Errno::EAGAIN) => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        debug!("PTY write error: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("PTY writer thread exiting");
    }

    /// Receive the next output chunk; `None` means the PTY closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    /// Queue bytes for the child's stdin.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| anyhow::anyhow!("PTY channel closed"))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn child_pid(&self) -> i32 {
        self.child_pid.as_raw()
    }

    /// Resize the PTY; columns are clamped to the supported minimum.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols.max(MIN_COLS),
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        unsafe {
            if libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &winsize) < 0 {
                anyhow::bail!("failed to resize PTY");
            }
        }
        debug!("PTY resized to {}x{}", winsize.ws_col, rows);
        Ok(())
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal::kill(self.child_pid, sig)?;
        Ok(())
    }

    /// Reap the child, waiting up to `grace` before escalating to SIGKILL.
    ///
    /// Returns the exit code, with `128 + signal` for a signal-killed child.
    pub fn wait_exit(&mut self, grace: Duration) -> i32 {
        self.running.store(false, Ordering::SeqCst);
        let start = Instant::now();

        let code = loop {
            match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => break code,
                Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
                Ok(_) => {
                    if start.elapsed() >= grace {
                        let _ = self.signal(Signal::SIGKILL);
                        match waitpid(self.child_pid, None) {
                            Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
                            Ok(WaitStatus::Exited(_, code)) => break code,
                            _ => break 128 + Signal::SIGKILL as i32,
                        }
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(nix::errno::Errno::ECHILD) => break 0,
                Err(_) => break 1,
            }
        };

        self.pty.take();
        code
    }
}

impl Drop for AsyncPty {
    fn drop(&mut self) {
        if self.pty.is_some() {
            let _ = self.signal(Signal::SIGTERM);
            let _ = self.wait_exit(Duration::from_secs(2));
        }
    }
}

/// Current terminal size of the supervisor's own stdout.
pub fn get_terminal_size() -> Option<Winsize> {
    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    unsafe {
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) == 0 {
            Some(winsize)
        } else {
            None
        }
    }
}

fn clamp_winsize(mut ws: Winsize) -> Winsize {
    ws.ws_col = ws.ws_col.max(MIN_COLS);
    if ws.ws_row == 0 {
        ws.ws_row = 24;
    }
    ws
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_terminal_size() {
        // May be absent in CI without a terminal.
        if let Some(ws) = get_terminal_size() {
            assert!(ws.ws_row > 0 || ws.ws_col > 0);
        }
    }

    #[test]
    fn test_clamp_winsize() {
        let ws = clamp_winsize(Winsize {
            ws_row: 0,
            ws_col: 5,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });
        assert_eq!(ws.ws_col, MIN_COLS);
        assert_eq!(ws.ws_row, 24);
    }
}
