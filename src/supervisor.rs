//! Supervisor: owns the PTY, the log sinks, the registry record, the IPC
//! endpoint, the match engine and the auto-responder, and runs the session
//! event loop until the child exits.
//!
//! Input ordering: each source (terminal stdin, IPC frames, auto-responder
//! injections) is drained in arrival order into a single write stream to the
//! PTY. Output ordering: every PTY chunk reaches the terminal and the raw
//! log before it can produce a transition, so an injected reply is always
//! emitted after the prompt that caused it.

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ipc::IpcEndpoint;
use crate::logs::{self, SessionLogs};
use crate::matcher::{MatchEngine, Transition};
use crate::profile::AssistantProfile;
use crate::pty::{get_terminal_size, AsyncPty, Pty, RawModeGuard};
use crate::registry::{now_ms, Record, Registry, Status};
use crate::responder::AutoResponder;
use crate::screen::{LineDecoder, RingBuffer};

/// How long a terminating child gets before SIGKILL.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Cadence of the debounce/housekeeping timer.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

pub struct SupervisorConfig {
    /// CLI name recorded in the registry.
    pub cli: String,
    /// Full command line, binary first.
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub prompt: Option<String>,
    pub auto_yes: bool,
    /// Force Ready after this long without a ready-pattern match; zero
    /// disables the fallback.
    pub ready_timeout: Duration,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub profile: Arc<AssistantProfile>,
}

/// Run one supervised session to completion. Returns the exit code the
/// supervisor process should exit with.
pub async fn run(config: SupervisorConfig) -> Result<i32> {
    // The PTY must exist before anything touches the registry; a spawn
    // failure leaves no trace behind.
    let pty = Pty::spawn(&config.command, &config.cwd, config.rows, config.cols)
        .context("failed to spawn assistant")?;
    let pid = pty.child_pid().as_raw();

    let registry = Registry::open(&config.cwd);
    let record = Record::new(
        pid as i64,
        config.cli.clone(),
        config.command.clone(),
        config.prompt.clone(),
        logs::lines_log_path(&config.cwd, pid).to_string_lossy().to_string(),
        crate::ipc::fifo_path(&config.cwd, pid).to_string_lossy().to_string(),
    );
    if let Err(e) = registry.register(&record) {
        warn!("failed to register session: {}", e);
    }

    // The session runs without out-of-band input if the FIFO cannot be made.
    let (endpoint, mut ipc_rx) = match IpcEndpoint::create(&config.cwd, pid) {
        Ok((endpoint, rx)) => (Some(endpoint), rx),
        Err(e) => {
            warn!("out-of-band input unavailable: {}", e);
            let (_tx, rx) = mpsc::channel(1);
            (None, rx)
        }
    };

    let mut session_logs = SessionLogs::open(&config.cwd, pid);
    session_logs.trace_json(serde_json::json!({
        "ts": now_ms(),
        "component": "supervisor",
        "message": "session started",
        "record": record,
    }));

    let _raw_guard = RawModeGuard::acquire().context("failed to configure terminal")?;

    // Terminal stdin source. Read in a plain thread so raw-mode keystrokes
    // arrive unbuffered; the channel closes on EOF (headless runs).
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(1024);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigwinch = signal(SignalKind::window_change())?;

    let mut async_pty = AsyncPty::new(pty);
    let mut decoder = LineDecoder::new();
    let mut ring = RingBuffer::new();
    let mut engine = MatchEngine::new(Arc::clone(&config.profile));

    let (inject_tx, mut inject_rx) = mpsc::channel::<Vec<u8>>(1024);
    let mut responder = AutoResponder::new(config.auto_yes, &config.profile.reply_keys, inject_tx);

    let mut stdout = tokio::io::stdout();
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let started = Instant::now();
    let mut term_sent_at: Option<Instant> = None;
    let mut user_abort = false;

    loop {
        select! {
            _ = sigint.recv() => {
                if engine.seen_ready() {
                    debug!("SIGINT forwarded to child");
                    let _ = async_pty.signal(Signal::SIGINT);
                } else {
                    info!("SIGINT before ready, aborting");
                    user_abort = true;
                    let _ = async_pty.signal(Signal::SIGTERM);
                    break;
                }
            }

            _ = sigterm.recv() => {
                info!("SIGTERM received, forwarding to child");
                let _ = async_pty.signal(Signal::SIGTERM);
                term_sent_at.get_or_insert_with(Instant::now);
            }

            _ = sigwinch.recv() => {
                if let Some(ws) = get_terminal_size() {
                    let _ = async_pty.resize(ws.ws_row, ws.ws_col);
                }
            }

            Some(data) = stdin_rx.recv() => {
                if data.contains(&0x03) && !engine.seen_ready() {
                    // Control-C while the assistant is still loading aborts
                    // the supervisor instead of reaching the child.
                    user_abort = true;
                    session_logs.trace("supervisor", "user abort before ready");
                    let _ = async_pty.signal(Signal::SIGTERM);
                    break;
                } else if data.contains(&0x19) {
                    let enabled = !responder.enabled();
                    responder.set_enabled(enabled);
                    eprint!("\r\n[auto-yes: {}]\r\n", if enabled { "ON" } else { "OFF" });
                } else {
                    if let Some(t) = engine.note_reply() {
                        log_transition(&mut session_logs, &t);
                    }
                    if let Err(e) = async_pty.send(data).await {
                        debug!("stdin forward failed: {}", e);
                    }
                }
            }

            Some(frame) = ipc_rx.recv() => {
                session_logs.trace(
                    "ipc",
                    &format!("forwarding {} byte frame", frame.len()),
                );
                if let Some(t) = engine.note_reply() {
                    log_transition(&mut session_logs, &t);
                }
                if let Err(e) = async_pty.send(frame).await {
                    debug!("ipc forward failed: {}", e);
                }
            }

            Some(data) = inject_rx.recv() => {
                if let Err(e) = async_pty.send(data).await {
                    debug!("injection failed: {}", e);
                }
            }

            chunk = async_pty.recv() => {
                let Some(data) = chunk else {
                    info!("PTY closed");
                    break;
                };

                let text = String::from_utf8_lossy(&data).to_string();

                // Answer terminal queries the child expects from a real
                // terminal, or full-screen assistants hang at startup.
                if text.contains("\x1b[6n") {
                    let _ = async_pty.send(b"\x1b[1;1R".to_vec()).await;
                }
                if text.contains("\x1b[c") || text.contains("\x1b[0c") {
                    let _ = async_pty.send(b"\x1b[?1;2c".to_vec()).await;
                }

                stdout.write_all(&data).await?;
                stdout.flush().await?;
                session_logs.raw(&data);

                for line in decoder.feed(&data) {
                    session_logs.line(&line);
                    ring.push(line);
                }

                if let Some(t) = engine.observe(&text) {
                    handle_transition(t, &responder, &mut engine, &mut session_logs).await?;
                }
            }

            _ = tick.tick() => {
                if let Some(t) = engine.tick() {
                    handle_transition(t, &responder, &mut engine, &mut session_logs).await?;
                }

                if !engine.seen_ready()
                    && !config.ready_timeout.is_zero()
                    && started.elapsed() >= config.ready_timeout
                {
                    debug!("no ready pattern within timeout, forcing ready");
                    if let Some(t) = engine.force_ready() {
                        log_transition(&mut session_logs, &t);
                    }
                }

                if let Some(sent) = term_sent_at {
                    if sent.elapsed() >= EXIT_GRACE && async_pty.is_running() {
                        warn!("child ignored SIGTERM, escalating");
                        let _ = async_pty.signal(Signal::SIGKILL);
                    }
                }
            }
        }

        // Child exit surfaces as `recv()` returning None once every buffered
        // chunk has been drained; the running flag goes false earlier, while
        // output may still be queued.
    }

    // Teardown: reap, record, release.
    let mut exit_code = async_pty.wait_exit(EXIT_GRACE);
    if user_abort {
        exit_code = 130;
    }
    let exit_reason = if user_abort {
        "user-abort"
    } else if exit_code == 0 {
        "normal"
    } else {
        "crash"
    };

    if let Some(t) = engine.note_exit() {
        log_transition(&mut session_logs, &t);
    }
    session_logs.trace(
        "supervisor",
        &format!("child exited: code={} reason={}", exit_code, exit_reason),
    );
    debug!("ring buffer holds {} lines at exit", ring.len());

    if let Err(e) = registry.update_status(
        pid as i64,
        Status::Exited,
        Some(exit_reason),
        Some(exit_code as i64),
    ) {
        warn!("failed to record exit: {}", e);
    }

    if let Some(endpoint) = endpoint {
        endpoint.unlink();
    }
    crate::pty::restore_terminal();

    if user_abort {
        eprintln!("User aborted: SIGINT");
    }
    if exit_code == 127 {
        if let Some(hint) = &config.profile.install_hint {
            eprintln!("{} does not appear to be installed. Try: {}", config.cli, hint);
        }
    }

    Ok(exit_code)
}

async fn handle_transition(
    transition: Transition,
    responder: &AutoResponder,
    engine: &mut MatchEngine,
    session_logs: &mut SessionLogs,
) -> Result<()> {
    log_transition(session_logs, &transition);
    if responder.on_transition(transition).await? {
        // The reply answers the confirmation; advance the state machine.
        if let Some(follow) = engine.note_reply() {
            log_transition(session_logs, &follow);
        }
    }
    Ok(())
}

fn log_transition(session_logs: &mut SessionLogs, transition: &Transition) {
    info!("state {} -> {}", transition.from, transition.to);
    session_logs.trace_json(serde_json::json!({
        "ts": now_ms(),
        "component": "matcher",
        "from": transition.from,
        "to": transition.to,
    }));
}
