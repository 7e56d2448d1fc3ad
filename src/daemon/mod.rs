//! Daemon lifecycle.
//!
//! Owns the `~/.hl/` runtime files (socket, pid, log, options echo) and the
//! ordering of startup and teardown: subscriptions come up before the IPC
//! socket binds, and on the way down the accept loop stops before the
//! subscriptions so no handler can observe a half-dead transport.

pub mod server;
pub mod state;
pub mod subs;

use std::fs;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::cache::Cache;
use crate::client::IpcClient;
use crate::paths::HlPaths;
use crate::transport::info::InfoClient;
use crate::transport::ws::WsTransport;
use crate::transport::Network;
use crate::util::now_ms;

use server::IpcServer;
use state::DaemonState;
use subs::SubscriptionManager;

/// How long `server start` waits for the spawned daemon's socket to appear.
const READY_WAIT: Duration = Duration::from_secs(5);
const READY_POLL_MS: u64 = 100;
/// Grace given to a graceful IPC shutdown before escalating to signals.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Run the daemon in the foreground until shutdown. This is the body of the
/// internal `server run` subcommand that `server start` spawns detached.
pub async fn run_foreground(paths: &HlPaths, testnet: bool) -> Result<()> {
    paths.ensure_dir()?;
    ensure_not_running(paths)?;

    fs::write(&paths.pid, format!("{}\n", std::process::id()))
        .with_context(|| format!("write {}", paths.pid.display()))?;

    let result = run_inner(paths, testnet).await;
    cleanup_runtime_files(paths);
    result
}

async fn run_inner(paths: &HlPaths, testnet: bool) -> Result<()> {
    let started_at = now_ms();
    let echo = json!({
        "testnet": testnet,
        "startedAt": started_at,
        "startedAtIso": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "pid": std::process::id(),
    });
    fs::write(
        &paths.server_json,
        serde_json::to_string_pretty(&echo)? + "\n",
    )
    .with_context(|| format!("write {}", paths.server_json.display()))?;

    let network = Network::from_testnet_flag(testnet);
    tracing::info!(testnet, "daemon starting");

    let cache = Arc::new(Cache::new());
    let transport = WsTransport::connect(network);
    let mut subs = SubscriptionManager::new(
        transport.clone(),
        InfoClient::new(network),
        Arc::clone(&cache),
    );
    if let Err(e) = subs.start().await {
        subs.stop();
        return Err(e);
    }

    let daemon_state = DaemonState::new(started_at, testnet, cache, transport.connected_watch());
    let (shutdown_tx, _) = watch::channel(false);
    let server = match IpcServer::bind(&paths.socket, daemon_state, shutdown_tx.clone()) {
        Ok(server) => server,
        Err(e) => {
            subs.stop();
            return Err(e);
        }
    };
    tracing::info!(socket = %paths.socket.display(), "daemon ready");

    let mut server_task = tokio::spawn(server.run());
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    tokio::select! {
        // The server only returns once the shutdown watch flips (IPC
        // `shutdown`); connections are already drained at that point.
        _ = &mut server_task => {}
        _ = sigint.recv() => {
            tracing::info!("interrupt received");
            let _ = shutdown_tx.send(true);
            let _ = server_task.await;
        }
        _ = sigterm.recv() => {
            tracing::info!("terminate received");
            let _ = shutdown_tx.send(true);
            let _ = server_task.await;
        }
    }

    subs.stop();
    tracing::info!("daemon stopped");
    Ok(())
}

/// Spawn the daemon detached and wait until its socket exists. The child is
/// this same binary re-invoked as `server run`, with stdout/stderr appended
/// to the log file.
pub async fn start_detached(paths: &HlPaths, testnet: bool) -> Result<()> {
    paths.ensure_dir()?;
    if let Some(pid) = read_pid(paths) {
        if daemon_alive(pid) {
            bail!("Daemon already running (pid {pid})");
        }
    }
    // A stale socket would satisfy the readiness poll immediately.
    if paths.socket.exists() {
        let _ = fs::remove_file(&paths.socket);
    }

    let exe = std::env::current_exe().context("resolve current executable")?;
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log)
        .with_context(|| format!("open {}", paths.log.display()))?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("server").arg("run");
    if testnet {
        cmd.arg("--testnet");
    }
    cmd.stdin(Stdio::null())
        .stdout(log.try_clone().context("clone log handle")?)
        .stderr(log);
    {
        use std::os::unix::process::CommandExt;
        // New process group: the daemon must survive the invoking terminal.
        cmd.process_group(0);
    }
    cmd.spawn().context("spawn daemon process")?;

    let deadline = tokio::time::Instant::now() + READY_WAIT;
    loop {
        if paths.socket.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "Daemon did not become ready within {}s (see {})",
                READY_WAIT.as_secs(),
                paths.log.display()
            );
        }
        tokio::time::sleep(Duration::from_millis(READY_POLL_MS)).await;
    }
}

/// Stop a running daemon: IPC `shutdown` first, then SIGTERM, then SIGKILL.
/// Returns `false` when nothing was running.
pub async fn stop(paths: &HlPaths) -> Result<bool> {
    let mut was_running = false;

    if let Some(client) = IpcClient::try_connect(paths).await {
        was_running = true;
        match client.shutdown().await {
            Ok(_) => {
                let deadline = tokio::time::Instant::now() + STOP_GRACE;
                while tokio::time::Instant::now() < deadline {
                    if !paths.socket.exists() {
                        return Ok(true);
                    }
                    tokio::time::sleep(Duration::from_millis(READY_POLL_MS)).await;
                }
                tracing::warn!("daemon did not exit within grace period, escalating");
            }
            Err(e) => tracing::debug!("ipc shutdown failed: {e}"),
        }
    }

    if let Some(pid) = read_pid(paths) {
        if daemon_alive(pid) {
            was_running = true;
            unsafe { libc::kill(pid, libc::SIGTERM) };
            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            while pid_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(READY_POLL_MS)).await;
            }
            if pid_alive(pid) {
                tracing::warn!(pid, "daemon ignored SIGTERM, sending SIGKILL");
                unsafe { libc::kill(pid, libc::SIGKILL) };
                let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
                while pid_alive(pid) && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(READY_POLL_MS)).await;
                }
            }
        }
        // The killed (or long-dead) process cannot clean up after itself.
        if !daemon_alive(pid) {
            cleanup_runtime_files(paths);
        }
    }

    Ok(was_running)
}

/// Fail when a live daemon holds the PID file; remove it when stale.
/// Liveness interrogates the OS, never the file's mere presence, and a
/// recycled pid now owned by some other program counts as stale too.
fn ensure_not_running(paths: &HlPaths) -> Result<()> {
    if let Some(pid) = read_pid(paths) {
        if daemon_alive(pid) {
            bail!("Daemon already running (pid {pid})");
        }
        tracing::warn!(pid, "removing stale pid file");
        let _ = fs::remove_file(&paths.pid);
    }
    Ok(())
}

fn cleanup_runtime_files(paths: &HlPaths) {
    let _ = fs::remove_file(&paths.socket);
    let _ = fs::remove_file(&paths.pid);
}

pub fn read_pid(paths: &HlPaths) -> Option<i32> {
    let raw = fs::read_to_string(&paths.pid).ok()?;
    raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let res = unsafe { libc::kill(pid, 0) };
    if res == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether `pid` is alive AND still runs this binary. The OS recycles pids,
/// so a live pid alone does not prove the daemon is up; the recorded process
/// must also be the same executable before it blocks a start or receives a
/// signal.
pub fn daemon_alive(pid: i32) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    let ours = match own_exe_name() {
        Some(name) => name,
        // Cannot identify ourselves; fall back to liveness only.
        None => return true,
    };
    match process_exe_name(pid) {
        Some(theirs) => theirs == ours,
        // A daemon of this user would be readable under /proc; an entry we
        // cannot read is some other owner's process, not our daemon.
        None => false,
    }
}

fn own_exe_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.file_name()?.to_string_lossy().into_owned())
}

/// Executable name behind a live pid, from `/proc/<pid>/exe` with a
/// `/proc/<pid>/cmdline` fallback. An on-disk replacement of the binary
/// leaves a " (deleted)" suffix on the link target.
fn process_exe_name(pid: i32) -> Option<String> {
    if let Ok(link) = fs::read_link(format!("/proc/{pid}/exe")) {
        if let Some(name) = link.file_name() {
            let name = name.to_string_lossy();
            return Some(name.trim_end_matches(" (deleted)").to_string());
        }
    }
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let argv0 = raw.split(|b| *b == 0).next().filter(|a| !a.is_empty())?;
    let argv0 = String::from_utf8_lossy(argv0).into_owned();
    std::path::Path::new(&argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (tempfile::TempDir, HlPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HlPaths::in_dir(tmp.path());
        (tmp, paths)
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-4));
    }

    #[test]
    fn read_pid_parses_and_rejects_garbage() {
        let (_tmp, paths) = temp_paths();
        assert_eq!(read_pid(&paths), None);

        fs::write(&paths.pid, "12345\n").unwrap();
        assert_eq!(read_pid(&paths), Some(12345));

        fs::write(&paths.pid, "not-a-pid").unwrap();
        assert_eq!(read_pid(&paths), None);
    }

    #[test]
    fn stale_pid_file_is_removed() {
        let (_tmp, paths) = temp_paths();
        // A pid far beyond pid_max cannot be alive.
        fs::write(&paths.pid, "999999999\n").unwrap();
        ensure_not_running(&paths).unwrap();
        assert!(!paths.pid.exists());
    }

    #[test]
    fn own_process_counts_as_a_running_daemon() {
        assert!(daemon_alive(std::process::id() as i32));
        assert!(!daemon_alive(999_999_999));
    }

    #[test]
    fn recycled_pid_of_another_program_is_stale() {
        // pid 1 is always alive but never this binary, which is exactly the
        // shape of a crashed daemon whose pid the OS handed to someone else.
        assert!(pid_alive(1));
        assert!(!daemon_alive(1));

        let (_tmp, paths) = temp_paths();
        fs::write(&paths.pid, "1\n").unwrap();
        ensure_not_running(&paths).unwrap();
        assert!(!paths.pid.exists());
    }

    #[test]
    fn live_pid_file_blocks_start() {
        let (_tmp, paths) = temp_paths();
        fs::write(&paths.pid, format!("{}\n", std::process::id())).unwrap();
        let err = ensure_not_running(&paths).unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert!(paths.pid.exists());
    }
}
