use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_coordinator_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("replica-coordinator");

    // R2 answers first; R1 and R3 are slower.
    let mut r1 = spawn_server(&binary, &["replica", "--reply", "OK-R1", "--delay-ms", "400"]).await?;
    let mut r2 = spawn_server(&binary, &["replica", "--reply", "OK-R2"]).await?;
    let mut r3 = spawn_server(&binary, &["replica", "--reply", "OK-R3", "--delay-ms", "400"]).await?;

    let mut coordinator = spawn_server(
        &binary,
        &[
            "coordinator",
            &r1.addr,
            &r2.addr,
            &r3.addr,
            "--dispatch-deadline-ms",
            "2000",
        ],
    )
    .await?;

    let output = run_send(&binary, &coordinator.addr, "hello").await?;
    assert!(output.status.success(), "send failed: {output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "OK-R2");

    // Without any live replica the coordinator answers with an unresolved reply.
    r1.stop().await;
    r2.stop().await;
    r3.stop().await;

    let output = run_send(&binary, &coordinator.addr, "anyone?").await?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("all-failed"), "unexpected stderr: {stderr}");

    coordinator.stop().await;
    Ok(())
}

struct ServerProcess {
    child: Child,
    addr: String,
    log_task: tokio::task::JoinHandle<()>,
}

impl ServerProcess {
    async fn stop(&mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
        self.log_task.abort();
    }
}

async fn spawn_server(binary: &Path, args: &[&str]) -> Result<ServerProcess> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {args:?}"))?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;
    let mut stdout = BufReader::new(stdout);
    let addr = read_listen_addr(&mut stdout).await?;

    // Drain additional logs in the background so the pipe never fills.
    let log_task = tokio::spawn(drain_stdout(stdout));

    Ok(ServerProcess {
        child,
        addr,
        log_task,
    })
}

async fn run_send(binary: &Path, coordinator: &str, payload: &str) -> Result<std::process::Output> {
    let output = Command::new(binary)
        .args(["send", "--coordinator", coordinator, payload])
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .output();
    timeout(READ_TIMEOUT, output)
        .await
        .context("send did not finish in time")?
        .context("failed to run send")
}

async fn read_listen_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for listening banner"))??;
    if bytes == 0 {
        return Err(anyhow!("server exited before reporting its address"));
    }

    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected banner format")?;
    if !trimmed.contains("listening on") || !addr.contains(':') {
        return Err(anyhow!("banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}
