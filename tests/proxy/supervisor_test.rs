//! Integration tests for the restart-coordinating supervisor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use debug_mcp_wrapper::proxy::{
    FixedBackoff, RespawnBackoff, Supervisor, SupervisorError, SupervisorHandle,
    SupervisorSettings, SupervisorState, SupervisorStats,
};
use debug_mcp_wrapper::worker::WorkerCommand;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

fn cat_settings() -> SupervisorSettings {
    SupervisorSettings::new(WorkerCommand::new("cat"))
        .restart_interval(Duration::ZERO)
        .stop_timeout(Duration::from_secs(2))
}

/// A running supervisor wired to in-memory client streams.
struct Harness {
    client_in: DuplexStream,
    client_out: DuplexStream,
    handle: SupervisorHandle,
    cancel: CancellationToken,
    task: JoinHandle<Result<SupervisorStats, SupervisorError>>,
}

impl Harness {
    fn start(supervisor: Supervisor) -> Self {
        let (client_in, input) = tokio::io::duplex(4096);
        let (output, client_out) = tokio::io::duplex(4096);
        let handle = supervisor.handle();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { supervisor.run(input, output, cancel).await }
        });

        Self {
            client_in,
            client_out,
            handle,
            cancel,
            task,
        }
    }

    async fn wait_for_generation(&self, generation: u64) {
        let mut workers = self.handle.subscribe_worker();
        within(workers.wait_for(|w| w.generation >= generation && w.pid.is_some()))
            .await
            .unwrap();
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.client_in.write_all(bytes).await.unwrap();
        self.client_in.flush().await.unwrap();
    }

    async fn expect_output(&mut self, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        within(self.client_out.read_exact(&mut buf)).await.unwrap();
        assert_eq!(buf, expected);
    }

    async fn shutdown(self) -> SupervisorStats {
        self.cancel.cancel();
        let stats = within(self.task).await.unwrap().unwrap();
        assert_eq!(self.handle.state(), SupervisorState::Stopped);
        stats
    }
}

#[cfg(unix)]
fn sigkill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL).unwrap();
}

#[tokio::test]
async fn forwards_bytes_both_ways() {
    let mut harness = Harness::start(Supervisor::new(cat_settings()));
    harness.wait_for_generation(1).await;
    assert_eq!(harness.handle.state(), SupervisorState::Running);

    harness.send(b"{\"jsonrpc\":\"2.0\"}\n").await;
    harness.expect_output(b"{\"jsonrpc\":\"2.0\"}\n").await;

    let stats = harness.shutdown().await;
    assert_eq!(stats.spawns, 1);
    assert_eq!(stats.restarts, 0);
}

#[tokio::test]
async fn input_during_restart_is_replayed_in_order() {
    // A worker that ignores SIGTERM keeps the restart window open for the grace period.
    let command = WorkerCommand::new("sh")
        .arg("-c")
        .arg("trap '' TERM; exec cat");
    let settings = SupervisorSettings::new(command)
        .restart_interval(Duration::ZERO)
        .stop_timeout(Duration::from_secs(1));
    let mut harness = Harness::start(Supervisor::new(settings));
    harness.wait_for_generation(1).await;

    assert!(harness.handle.request_restart());
    let mut states = harness.handle.subscribe();
    within(states.wait_for(|s| *s == SupervisorState::Restarting))
        .await
        .unwrap();

    harness.send(b"x").await;
    within(async {
        while harness.handle.buffered().await < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    harness.send(b"y").await;

    harness.expect_output(b"xy").await;
    assert!(harness.handle.worker().generation >= 2);

    let stats = harness.shutdown().await;
    assert_eq!(stats.restarts, 1);
    assert!(stats.replayed_chunks >= 1);
    assert_eq!(stats.replay_failures, 0);
}

#[tokio::test]
async fn scheduled_restarts_replace_the_worker() {
    let settings = cat_settings().restart_interval(Duration::from_millis(300));
    let harness = Harness::start(Supervisor::new(settings));
    harness.wait_for_generation(3).await;

    let stats = harness.shutdown().await;
    assert!(stats.restarts >= 2);
    assert_eq!(stats.recoveries, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn crashed_worker_is_recovered() {
    let supervisor = Supervisor::new(cat_settings()).with_backoff(FixedBackoff::immediate());
    let mut harness = Harness::start(supervisor);
    harness.wait_for_generation(1).await;

    let pid = harness.handle.worker().pid.unwrap();
    sigkill(pid);
    harness.wait_for_generation(2).await;
    assert_ne!(harness.handle.worker().pid, Some(pid));

    harness.send(b"after\n").await;
    harness.expect_output(b"after\n").await;

    let stats = harness.shutdown().await;
    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.restarts, 0);
    assert_eq!(stats.spawns, 2);
}

#[derive(Debug, Clone, Default)]
struct CountingBackoff(Arc<AtomicU32>);

impl RespawnBackoff for CountingBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0.fetch_add(1, Ordering::SeqCst);
        Duration::from_millis(50)
    }
}

#[cfg(unix)]
#[tokio::test]
async fn failed_respawns_are_retried_with_backoff() {
    let root = tempfile::tempdir().unwrap();
    let workdir = root.path().join("debug-mcp");
    std::fs::create_dir(&workdir).unwrap();

    let backoff = CountingBackoff::default();
    let settings = SupervisorSettings::new(WorkerCommand::new("cat").working_dir(&workdir))
        .restart_interval(Duration::ZERO)
        .stop_timeout(Duration::from_secs(2));
    let supervisor = Supervisor::new(settings).with_backoff(backoff.clone());
    let mut harness = Harness::start(supervisor);
    harness.wait_for_generation(1).await;

    std::fs::remove_dir(&workdir).unwrap();
    sigkill(harness.handle.worker().pid.unwrap());

    within(async {
        while backoff.0.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(harness.handle.state(), SupervisorState::Recovering);

    std::fs::create_dir(&workdir).unwrap();
    harness.wait_for_generation(2).await;

    harness.send(b"back\n").await;
    harness.expect_output(b"back\n").await;

    let stats = harness.shutdown().await;
    assert!(stats.spawn_failures >= 2);
    assert_eq!(stats.recoveries, 1);
}

#[tokio::test]
async fn initial_spawn_failure_is_fatal() {
    let settings = SupervisorSettings::new(WorkerCommand::new("/nonexistent/debug-mcp-php"));
    let supervisor = Supervisor::new(settings);
    let (_client_in, input) = tokio::io::duplex(64);
    let (output, _client_out) = tokio::io::duplex(64);

    let err = supervisor
        .run(input, output, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SupervisorError::InitialSpawn(_)));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn supervisor_runs_only_once() {
    let supervisor = Supervisor::new(cat_settings());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (_client_in, input) = tokio::io::duplex(64);
    let (output, _client_out) = tokio::io::duplex(64);
    let stats = within(supervisor.run(input, output, cancel.clone()))
        .await
        .unwrap();
    assert_eq!(stats.spawns, 1);

    let (_client_in, input) = tokio::io::duplex(64);
    let (output, _client_out) = tokio::io::duplex(64);
    let err = supervisor.run(input, output, cancel).await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning));
}

/// Worker that idles without reading stdin on its first run and runs `cat` afterwards.
fn stalls_then_cats(dir: &std::path::Path, first_run: &str) -> WorkerCommand {
    WorkerCommand::new("sh")
        .arg("-c")
        .arg(format!(
            "if [ -e started ]; then exec cat; fi; touch started; {first_run}"
        ))
        .working_dir(dir)
}

#[tokio::test]
async fn output_follows_new_worker_while_old_pipe_stays_open() {
    // The backgrounded sleep keeps the old worker's stdout open after it is stopped.
    let command = WorkerCommand::new("sh").arg("-c").arg("sleep 30 & exec cat");
    let settings = SupervisorSettings::new(command)
        .restart_interval(Duration::ZERO)
        .stop_timeout(Duration::from_millis(500));
    let mut harness = Harness::start(Supervisor::new(settings));
    harness.wait_for_generation(1).await;

    assert!(harness.handle.request_restart());
    harness.wait_for_generation(2).await;

    harness.send(b"hello\n").await;
    harness.expect_output(b"hello\n").await;

    let stats = harness.shutdown().await;
    assert_eq!(stats.restarts, 1);
}

#[tokio::test]
async fn shutdown_completes_when_replacement_never_reads() {
    let command = WorkerCommand::new("sh")
        .arg("-c")
        .arg("trap '' TERM; exec sleep 1000");
    let settings = SupervisorSettings::new(command)
        .restart_interval(Duration::ZERO)
        .stop_timeout(Duration::from_secs(1));
    let mut harness = Harness::start(Supervisor::new(settings));
    harness.wait_for_generation(1).await;

    assert!(harness.handle.request_restart());
    let mut states = harness.handle.subscribe();
    within(states.wait_for(|s| *s == SupervisorState::Restarting))
        .await
        .unwrap();

    // More than a pipe holds, so replaying it into the new worker blocks.
    harness.send(&vec![b'r'; 40 * 4096]).await;
    harness.wait_for_generation(2).await;

    let stats = harness.shutdown().await;
    assert!(stats.replay_failures >= 1);
}

#[tokio::test]
async fn restart_unblocks_writer_stuck_on_full_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let grace = Duration::from_secs(1);
    let settings = SupervisorSettings::new(stalls_then_cats(dir.path(), "exec sleep 1000"))
        .restart_interval(Duration::ZERO)
        .stop_timeout(grace);
    let mut harness = Harness::start(Supervisor::new(settings));
    harness.wait_for_generation(1).await;

    // Twice what a default pipe holds, one distinct byte per 4 KiB chunk.
    let sent: Vec<u8> = (0..32u8).flat_map(|i| vec![b'A' + i; 4096]).collect();
    let handle = harness.handle.clone();
    let restart = async {
        // Let the forwarder block on the full pipe first.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let started = std::time::Instant::now();
        assert!(handle.request_restart());
        let mut workers = handle.subscribe_worker();
        within(workers.wait_for(|w| w.generation >= 2))
            .await
            .unwrap();
        started.elapsed()
    };
    let ((), elapsed) = tokio::join!(harness.send(&sent), restart);
    assert!(elapsed < grace * 3, "restart took {elapsed:?}");

    let last = vec![b'A' + 31; 4096];
    let mut received = Vec::new();
    within(async {
        let mut buf = vec![0u8; 8192];
        while !received.ends_with(&last) {
            let n = harness.client_out.read(&mut buf).await.unwrap();
            assert!(n > 0, "client output closed early");
            received.extend_from_slice(&buf[..n]);
        }
    })
    .await;

    // Only what the old worker's pipe had accepted is lost.
    assert!(sent.ends_with(&received));
    assert!(received.len() + 64 * 1024 >= sent.len());

    let stats = harness.shutdown().await;
    assert_eq!(stats.restarts, 1);
    assert!(stats.replayed_chunks >= 1);
}

#[tokio::test]
async fn input_refused_by_worker_reaches_recovered_worker() {
    let dir = tempfile::tempdir().unwrap();
    let settings = SupervisorSettings::new(stalls_then_cats(dir.path(), "exec 0<&-; sleep 2"))
        .restart_interval(Duration::ZERO)
        .stop_timeout(Duration::from_secs(2));
    let supervisor = Supervisor::new(settings).with_backoff(FixedBackoff::immediate());
    let mut harness = Harness::start(supervisor);
    harness.wait_for_generation(1).await;

    // Give the first worker time to close its stdin.
    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.send(b"hello\n").await;
    within(async {
        while harness.handle.buffered().await < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(harness.handle.worker().generation, 1);

    harness.wait_for_generation(2).await;
    harness.expect_output(b"hello\n").await;

    let stats = harness.shutdown().await;
    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.restarts, 0);
}
