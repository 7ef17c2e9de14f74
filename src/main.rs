//! agent-yes: PTY supervisor that auto-confirms routine prompts from
//! interactive AI coding CLIs.
//!
//! The assistant runs inside a PTY; its output is mirrored to the terminal
//! and to per-session logs while a pattern state machine watches for
//! "awaiting confirmation" prompts and answers the routine ones. Sibling
//! invocations can forward a line into the running session with `--send`.
//!
//! Usage:
//!   agent-yes --cli claude --prompt "fix the tests"
//!   agent-yes --send "also update the changelog"

// Allow dead code - this binary has public API components that may not be used internally
#![allow(dead_code)]

mod ipc;
mod logs;
mod matcher;
mod profile;
mod pty;
mod registry;
mod responder;
mod screen;
mod supervisor;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use profile::AssistantProfile;
use supervisor::SupervisorConfig;

/// PTY supervisor that auto-confirms routine prompts from AI coding CLIs
#[derive(Parser, Debug)]
#[command(name = "agent-yes")]
#[command(about = "PTY supervisor that auto-confirms routine prompts from AI coding CLIs")]
#[command(version)]
struct Args {
    /// Assistant CLI to supervise (claude, codex, gemini, copilot, cursor)
    #[arg(long, default_value = "claude")]
    cli: String,

    /// Initial prompt handed to the assistant
    #[arg(short, long)]
    prompt: Option<String>,

    /// Disable auto-confirmation; supervise and log only
    #[arg(long)]
    no_auto_yes: bool,

    /// Verbose (debug-level) logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the binary to execute instead of the profile's
    #[arg(long)]
    bin: Option<String>,

    /// Extra "ready" pattern (repeatable); with --bin, replaces the profile's
    #[arg(long)]
    ready_pattern: Vec<String>,

    /// Extra "awaiting confirmation" pattern (repeatable)
    #[arg(long)]
    confirm_pattern: Vec<String>,

    /// Extra "dangerous confirmation" pattern (repeatable)
    #[arg(long)]
    dangerous_pattern: Vec<String>,

    /// Key sequence sent to accept a confirmation
    #[arg(long)]
    reply_keys: Option<String>,

    /// Seconds before forcing the ready state when no ready pattern ever
    /// matches (0 disables the fallback)
    #[arg(long, default_value = "30")]
    ready_timeout: u64,

    /// Terminal rows (for headless mode)
    #[arg(long)]
    rows: Option<u16>,

    /// Terminal columns (for headless mode)
    #[arg(long)]
    cols: Option<u16>,

    /// Forward a line into the active session in this directory and exit
    #[arg(long, conflicts_with = "logs")]
    send: Option<String>,

    /// Print the final lines of a session's line log and exit
    #[arg(long)]
    logs: Option<i32>,

    /// Extra arguments for the assistant (after --)
    #[arg(last = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { args.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("working directory is inaccessible")?;

    // Out-of-band sender: forward one line into the running session here.
    if let Some(text) = &args.send {
        ipc::send_to_active(&cwd, text).await?;
        return Ok(());
    }

    // Log retrieval for an exited (or running) session.
    if let Some(pid) = args.logs {
        let registry = registry::Registry::open(&cwd);
        let record = registry
            .find_by_pid(pid as i64)?
            .with_context(|| format!("no session recorded for pid {}", pid))?;
        for line in logs::tail_lines(std::path::Path::new(&record.log_file), screen::RING_CAP)? {
            println!("{}", line);
        }
        return Ok(());
    }

    let profile = Arc::new(resolve_profile(&args)?);
    let command = match &args.bin {
        Some(bin) => {
            let mut command = vec![bin.clone()];
            command.extend(args.args.iter().cloned());
            if let Some(prompt) = &args.prompt {
                command.push(prompt.clone());
            }
            command
        }
        None => profile.build_command(&args.cli, &args.args, args.prompt.as_deref()),
    };

    info!("agent-yes v{}", env!("CARGO_PKG_VERSION"));
    info!("command: {:?}", command);

    let exit_code = supervisor::run(SupervisorConfig {
        cli: args.cli.clone(),
        command,
        cwd,
        prompt: args.prompt.clone(),
        auto_yes: !args.no_auto_yes,
        ready_timeout: Duration::from_secs(args.ready_timeout),
        rows: args.rows,
        cols: args.cols,
        profile,
    })
    .await?;

    std::process::exit(exit_code);
}

/// Resolve the profile for this run: the built-in table for `--cli`, or a
/// pattern-flag-defined one when `--bin` bypasses the built-ins. Pattern
/// flags extend a built-in profile and replace a `--bin` one.
fn resolve_profile(args: &Args) -> Result<AssistantProfile> {
    let mut profile = if args.bin.is_some() {
        profile::get_profile("default")?
    } else {
        profile::get_profile(&args.cli)?
    };

    if args.bin.is_some() && !args.ready_pattern.is_empty() {
        profile.ready.clear();
    }
    for (flag, patterns) in [
        (&args.ready_pattern, &mut profile.ready),
        (&args.confirm_pattern, &mut profile.confirm),
        (&args.dangerous_pattern, &mut profile.dangerous),
    ] {
        for pattern in flag {
            patterns.push(
                Regex::new(pattern).with_context(|| format!("invalid pattern: {}", pattern))?,
            );
        }
    }
    if let Some(keys) = &args.reply_keys {
        profile.reply_keys = keys.clone();
    }

    Ok(profile)
}
