use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

/// Spawn the supervisor around `sh -c <script>` in its own workspace.
fn spawn_supervisor(dir: &TempDir, extra: &[&str], script: &str) -> Child {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_agent-yes"));
    cmd.current_dir(dir.path())
        .arg("--bin")
        .arg("sh")
        .arg("--ready-pattern")
        .arg("READY")
        .arg("--ready-timeout")
        .arg("0")
        .arg("--log-level")
        .arg("error")
        .arg("--rows")
        .arg("24")
        .arg("--cols")
        .arg("80");
    for arg in extra {
        cmd.arg(arg);
    }
    cmd.arg("--")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

/// Read the child's stdout until it contains `needle` or the deadline hits.
async fn read_until(child: &mut Child, needle: &[u8], deadline: Duration) -> Vec<u8> {
    let stdout = child.stdout.as_mut().unwrap();
    let mut output = Vec::new();
    let end = Instant::now() + deadline;

    loop {
        if output.windows(needle.len()).any(|w| w == needle) {
            break;
        }
        let now = Instant::now();
        if now >= end {
            break;
        }
        let mut buf = [0u8; 512];
        match timeout(end - now, stdout.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => output.extend_from_slice(&buf[..n]),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    output
}

/// Run the out-of-band sender in the workspace until it succeeds.
async fn send_frame(dir: &Path, text: &str) {
    let end = Instant::now() + Duration::from_secs(5);
    loop {
        let status = Command::new(env!("CARGO_BIN_EXE_agent-yes"))
            .current_dir(dir)
            .arg("--log-level")
            .arg("error")
            .arg("--send")
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        if status.success() {
            return;
        }
        if Instant::now() >= end {
            panic!("sender never reached the session");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_out_of_band_frame_reaches_child_stdin() {
    let dir = tempdir().unwrap();
    let mut child = spawn_supervisor(&dir, &[], "echo READY; head -n 1");

    send_frame(dir.path(), "do the thing").await;

    let output = read_until(&mut child, b"do the thing", Duration::from_secs(5)).await;
    assert!(
        output.windows(12).any(|w| w == b"do the thing"),
        "injected frame not seen in output: {}",
        String::from_utf8_lossy(&output)
    );

    // `head` consumed the forwarded line and exited cleanly.
    let status = timeout(Duration::from_secs(5), child.wait()).await.unwrap().unwrap();
    assert_eq!(status.code(), Some(0));
}

#[tokio::test]
async fn test_auto_confirms_routine_prompt() {
    let dir = tempdir().unwrap();
    let mut child = spawn_supervisor(
        &dir,
        &["--confirm-pattern", "y/N"],
        r#"echo READY; printf "Apply changes? (y/N) "; head -n 1 >/dev/null; echo CONFIRMED"#,
    );

    let output = read_until(&mut child, b"CONFIRMED", Duration::from_secs(5)).await;
    assert!(
        output.windows(9).any(|w| w == b"CONFIRMED"),
        "confirmation was not auto-answered: {}",
        String::from_utf8_lossy(&output)
    );

    let status = timeout(Duration::from_secs(5), child.wait()).await.unwrap().unwrap();
    assert_eq!(status.code(), Some(0));
}

#[tokio::test]
async fn test_dangerous_prompt_is_withheld() {
    let dir = tempdir().unwrap();
    let mut child = spawn_supervisor(
        &dir,
        &["--confirm-pattern", "y/N", "--dangerous-pattern", "rm -rf"],
        r#"echo READY; printf "About to run rm -rf /tmp/x (y/N) "; head -n 1 >/dev/null; echo ANSWERED"#,
    );

    // The prompt matches both tables; dangerous wins and nothing is injected.
    let output = read_until(&mut child, b"ANSWERED", Duration::from_secs(2)).await;
    assert!(
        !output.windows(8).any(|w| w == b"ANSWERED"),
        "dangerous confirmation was answered automatically"
    );

    child.kill().await.unwrap();
}

#[tokio::test]
async fn test_child_exit_code_passes_through() {
    let dir = tempdir().unwrap();
    let mut child = spawn_supervisor(&dir, &[], "exit 7");

    let status = timeout(Duration::from_secs(10), child.wait()).await.unwrap().unwrap();
    assert_eq!(status.code(), Some(7));
}

#[tokio::test]
async fn test_line_log_persists_after_exit() {
    let dir = tempdir().unwrap();
    let mut child = spawn_supervisor(&dir, &[], "echo READY; echo second-line");

    let status = timeout(Duration::from_secs(10), child.wait()).await.unwrap().unwrap();
    assert_eq!(status.code(), Some(0));

    let logs_dir = dir.path().join(".agent-yes").join("logs");
    let lines_log = std::fs::read_dir(&logs_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.to_string_lossy().ends_with(".lines.log"))
        .expect("no line log written");

    let contents = std::fs::read_to_string(&lines_log).unwrap();
    assert!(contents.contains("READY"), "line log missing output: {}", contents);
    assert!(contents.contains("second-line"));

    // The registry remembers the exited session.
    assert!(dir.path().join(".agent-yes").join("pid.sqlite").exists());
}
