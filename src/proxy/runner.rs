//! Supervisor that keeps one worker alive behind an uninterrupted byte stream.
//!
//! Four activities run as separate tasks against shared state:
//!
//! - the restart scheduler replaces the worker on a fixed period (and on
//!   request through a [`SupervisorHandle`]);
//! - the crash monitor respawns the worker when it exits unexpectedly;
//! - input forwarding routes client bytes to the worker, or to the
//!   [`ReplayBuffer`] while a replacement is in progress;
//! - output forwarding copies worker bytes to the client, following each new
//!   worker generation.
//!
//! The current worker and the restart-in-progress flag live together in one
//! slot behind a `RwLock`. Input forwarding holds the read lock while it
//! routes and writes a chunk, and every swap or flag change happens under the
//! write lock, so a chunk is either handed to the old worker's pipe before a
//! restart begins or buffered for the new worker. Bytes already accepted by
//! the old worker's pipe but never processed by it are lost with that worker.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::WrapperConfig;
use crate::proxy::{
    FixedBackoff, ReplayBuffer, ReplayError, RespawnBackoff, StateMachine, SupervisorState,
    SupervisorStats, WorkerInfo, DEFAULT_BUFFER_CAPACITY,
};
use crate::worker::{SpawnError, WorkerCommand, WorkerHandle, DEFAULT_STOP_TIMEOUT};

/// Default period between scheduled restarts.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(60);

/// Size of the read buffer used by both forwarding directions.
const CHUNK_SIZE: usize = 4096;

/// Error type for supervisor operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// The first worker could not be started; there is nothing to supervise.
    #[error("Failed to start worker: {0}")]
    InitialSpawn(#[source] SpawnError),
    /// A replacement worker could not be started.
    #[error("Failed to start replacement worker: {0}")]
    Spawn(#[source] SpawnError),
    /// Buffered input could not be delivered to the new worker.
    #[error("Failed to replay buffered input: {0}")]
    Replay(#[from] ReplayError),
    /// `run` was called a second time.
    #[error("Supervisor has already been run")]
    AlreadyRunning,
}

/// Error that ends one forwarding activity.
#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    #[error("Failed to read client input: {0}")]
    ReadInput(#[source] io::Error),
    #[error("Failed to write worker input: {0}")]
    WriteWorker(#[source] io::Error),
    #[error("Failed to write client output: {0}")]
    WriteOutput(#[source] io::Error),
}

/// Why a worker is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The restart timer fired.
    Scheduled,
    /// A restart was requested through a [`SupervisorHandle`].
    Requested,
    /// The worker exited on its own.
    Crashed,
}

/// Plain settings consumed by the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// What to launch for every worker generation.
    pub command: WorkerCommand,
    /// Period of scheduled restarts; zero disables the timer.
    pub restart_interval: Duration,
    /// Chunks retained while a worker is being replaced.
    pub buffer_capacity: usize,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
}

impl SupervisorSettings {
    /// Settings with default timings for the given command.
    #[must_use]
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn from_config(config: &WrapperConfig) -> Self {
        Self {
            command: config.worker_command(),
            restart_interval: config.restart_interval(),
            buffer_capacity: config.buffer_size,
            stop_timeout: config.stop_timeout(),
        }
    }

    #[must_use]
    pub fn restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval;
        self
    }

    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    #[must_use]
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Supervisor fronting a periodically replaced worker process.
#[derive(Debug)]
pub struct Supervisor {
    settings: SupervisorSettings,
    backoff: Arc<dyn RespawnBackoff>,
    buffer: Arc<ReplayBuffer>,
    machine: Arc<StateMachine>,
    requests_tx: mpsc::Sender<()>,
    requests_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl Supervisor {
    /// Create a supervisor with the default fixed respawn backoff.
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        Self {
            buffer: Arc::new(ReplayBuffer::new(settings.buffer_capacity)),
            settings,
            backoff: Arc::new(FixedBackoff::default()),
            machine: Arc::new(StateMachine::new()),
            requests_tx,
            requests_rx: std::sync::Mutex::new(Some(requests_rx)),
        }
    }

    /// Create a supervisor from a validated configuration.
    #[must_use]
    pub fn from_config(config: &WrapperConfig) -> Self {
        Self::new(SupervisorSettings::from_config(config))
            .with_backoff(FixedBackoff::new(config.respawn_delay()))
    }

    /// Replace the delay strategy used between respawn attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: impl RespawnBackoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    #[must_use]
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.machine.state()
    }

    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        self.machine.stats()
    }

    /// Get a cloneable handle for observing and poking the supervisor.
    #[must_use]
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            requests: self.requests_tx.clone(),
            machine: Arc::clone(&self.machine),
            buffer: Arc::clone(&self.buffer),
        }
    }

    /// Run until `cancel` fires, then stop the worker and return the stats.
    ///
    /// `input` is the client's byte stream towards the worker and `output`
    /// receives everything the workers write to stdout.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::InitialSpawn` if the first worker cannot be
    /// started, or `SupervisorError::AlreadyRunning` on a second call.
    pub async fn run<R, W>(
        &self,
        input: R,
        output: W,
        cancel: CancellationToken,
    ) -> Result<SupervisorStats, SupervisorError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let requests = self
            .requests_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SupervisorError::AlreadyRunning)?;

        self.machine.transition(SupervisorState::Starting);
        tracing::info!(
            program = %self.settings.command.program(),
            restart_interval_secs = self.settings.restart_interval.as_secs(),
            buffer_capacity = self.settings.buffer_capacity,
            "Starting supervisor"
        );

        let first = match WorkerHandle::spawn(&self.settings.command, 1) {
            Ok(worker) => Arc::new(worker),
            Err(e) => {
                self.machine.transition(SupervisorState::Stopped);
                return Err(SupervisorError::InitialSpawn(e));
            }
        };

        let activities = cancel.child_token();
        let shared = Arc::new(Shared::new(self, first, activities.clone()));
        self.machine.transition(SupervisorState::Running);

        let mut tasks = JoinSet::new();
        tasks.spawn(schedule_restarts(Arc::clone(&shared), requests));
        tasks.spawn(monitor_crashes(Arc::clone(&shared)));
        tasks.spawn({
            let shared = Arc::clone(&shared);
            async move {
                match forward_input(&shared, input).await {
                    Ok(()) => tracing::debug!("Input forwarding finished"),
                    Err(e) => tracing::error!(error = %e, "Input forwarding stopped"),
                }
            }
        });
        let mut output_task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                match forward_output(&shared, output).await {
                    Ok(()) => tracing::debug!("Output forwarding finished"),
                    Err(e) => tracing::error!(error = %e, "Output forwarding stopped"),
                }
            }
        });

        cancel.cancelled().await;

        tracing::info!("Shutting down supervisor");
        self.machine.transition(SupervisorState::ShuttingDown);
        activities.cancel();
        shared.shutdown().await;

        // Let the last worker's output drain before giving up on it.
        if tokio::time::timeout(self.settings.stop_timeout, &mut output_task)
            .await
            .is_err()
        {
            tracing::warn!("Worker output did not close, abandoning it");
            output_task.abort();
        }

        let settle = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(self.settings.stop_timeout, settle)
            .await
            .is_err()
        {
            tracing::warn!("Supervisor activities did not finish, aborting them");
        }
        tasks.shutdown().await;

        self.machine.transition(SupervisorState::Stopped);
        let stats = self.machine.stats();
        tracing::info!(?stats, "Supervisor stopped");
        Ok(stats)
    }
}

/// Cloneable view of a supervisor for callers outside `run`.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    requests: mpsc::Sender<()>,
    machine: Arc<StateMachine>,
    buffer: Arc<ReplayBuffer>,
}

impl SupervisorHandle {
    /// Ask for a restart cycle outside the timer schedule.
    ///
    /// Requests made while one is already pending are merged. Returns `false`
    /// once the supervisor is gone.
    pub fn request_restart(&self) -> bool {
        match self.requests.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.machine.state()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.machine.subscribe()
    }

    /// Identity of the current worker.
    #[must_use]
    pub fn worker(&self) -> WorkerInfo {
        self.machine.worker()
    }

    /// Watch worker replacements.
    #[must_use]
    pub fn subscribe_worker(&self) -> watch::Receiver<WorkerInfo> {
        self.machine.subscribe_worker()
    }

    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        self.machine.stats()
    }

    /// Number of input chunks waiting for the next worker.
    pub async fn buffered(&self) -> usize {
        self.buffer.len().await
    }
}

/// The current worker together with the restart-in-progress flag.
#[derive(Debug)]
struct Slot {
    worker: Arc<WorkerHandle>,
    restarting: bool,
}

/// Snapshot of the slot published after every change.
#[derive(Debug, Clone)]
struct Current {
    worker: Arc<WorkerHandle>,
    restarting: bool,
}

struct Shared {
    settings: SupervisorSettings,
    backoff: Arc<dyn RespawnBackoff>,
    buffer: Arc<ReplayBuffer>,
    machine: Arc<StateMachine>,
    slot: RwLock<Slot>,
    current: watch::Sender<Current>,
    /// Serializes restart cycles, recoveries and shutdown.
    cycle: Mutex<()>,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

impl Shared {
    fn new(supervisor: &Supervisor, first: Arc<WorkerHandle>, cancel: CancellationToken) -> Self {
        supervisor.machine.record_spawn(WorkerInfo {
            generation: first.generation(),
            pid: first.id(),
        });

        Self {
            settings: supervisor.settings.clone(),
            backoff: Arc::clone(&supervisor.backoff),
            buffer: Arc::clone(&supervisor.buffer),
            machine: Arc::clone(&supervisor.machine),
            current: watch::Sender::new(Current {
                worker: Arc::clone(&first),
                restarting: false,
            }),
            slot: RwLock::new(Slot {
                worker: first,
                restarting: false,
            }),
            cycle: Mutex::new(()),
            next_generation: AtomicU64::new(2),
            cancel,
        }
    }

    fn current_worker(&self) -> Arc<WorkerHandle> {
        Arc::clone(&self.current.borrow().worker)
    }

    /// Back to `Running` unless shutdown has begun meanwhile.
    fn resume(&self) {
        if !self.cancel.is_cancelled() {
            self.machine.transition(SupervisorState::Running);
        }
    }

    fn publish(&self, slot: &Slot) {
        self.current.send_replace(Current {
            worker: Arc::clone(&slot.worker),
            restarting: slot.restarting,
        });
    }

    /// Send one chunk of client input to the worker or the replay buffer.
    async fn route_input(&self, chunk: &[u8]) -> Result<(), ForwardError> {
        let slot = self.slot.read().await;

        if slot.restarting {
            self.buffer.add(chunk).await;
            tracing::trace!(len = chunk.len(), "Buffered input during restart");
            return Ok(());
        }

        match slot.worker.write_input(chunk).await {
            Ok(()) => Ok(()),
            // The worker is gone; the crash monitor will replay this.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe || slot.worker.has_exited() => {
                tracing::debug!(
                    generation = slot.worker.generation(),
                    error = %e,
                    "Worker input unavailable, buffering chunk"
                );
                self.buffer.add(chunk).await;
                Ok(())
            }
            Err(e) => Err(ForwardError::WriteWorker(e)),
        }
    }

    /// Set the restart flag and return the worker being replaced.
    async fn begin_replacement(&self) -> Arc<WorkerHandle> {
        let grace = self.settings.stop_timeout;
        let mut slot = if let Ok(slot) = tokio::time::timeout(grace, self.slot.write()).await {
            slot
        } else {
            // A write to a worker that stopped reading holds the slot.
            let stuck = self.current_worker();
            tracing::warn!(
                generation = stuck.generation(),
                "Worker input blocked, killing worker before restart"
            );
            if let Err(e) = stuck.stop(Duration::ZERO).await {
                tracing::warn!(error = %e, "Error killing blocked worker");
            }
            self.slot.write().await
        };

        slot.restarting = true;
        self.publish(&slot);
        Arc::clone(&slot.worker)
    }

    /// Install `worker`, replay buffered input into it and clear the flag.
    async fn install(&self, worker: Arc<WorkerHandle>) -> Result<usize, ReplayError> {
        let mut slot = self.slot.write().await;
        slot.worker = Arc::clone(&worker);
        self.machine.record_spawn(WorkerInfo {
            generation: worker.generation(),
            pid: worker.id(),
        });

        let replayed = self.bounded_replay(&worker).await;

        slot.restarting = false;
        self.publish(&slot);

        match &replayed {
            Ok(chunks) => self.machine.record_replay(*chunks),
            Err(e) => self.machine.record_replay_failure(e.written),
        }
        replayed
    }

    /// Clear the flag without a new worker.
    async fn abandon_replacement(&self) {
        let mut slot = self.slot.write().await;
        slot.restarting = false;
        self.publish(&slot);
    }

    /// Replay into `worker`, killing it if it stops reading.
    ///
    /// Once the grace period passes (or shutdown begins) the worker is killed,
    /// which fails the pending write and leaves the unwritten suffix buffered
    /// for the next worker.
    async fn bounded_replay(&self, worker: &WorkerHandle) -> Result<usize, ReplayError> {
        let grace = self.settings.stop_timeout;
        let mut replay = Box::pin(self.replay_into(worker));

        tokio::select! {
            biased;
            replayed = &mut replay => return replayed,
            () = tokio::time::sleep(grace) => {
                tracing::warn!(
                    generation = worker.generation(),
                    "Worker not reading replayed input, killing it"
                );
            }
            () = self.cancel.cancelled() => {
                tracing::debug!(generation = worker.generation(), "Replay interrupted by shutdown");
            }
        }

        if let Err(e) = worker.stop(Duration::ZERO).await {
            tracing::warn!(error = %e, "Error killing worker during replay");
        }

        // A descendant may still hold the worker's input open.
        if let Ok(replayed) = tokio::time::timeout(grace, &mut replay).await {
            return replayed;
        }
        drop(replay);
        Err(ReplayError::sink_closed(self.buffer.len().await))
    }

    async fn replay_into(&self, worker: &WorkerHandle) -> Result<usize, ReplayError> {
        let pending = self.buffer.len().await;
        if pending == 0 {
            return Ok(0);
        }

        tracing::info!(
            chunks = pending,
            generation = worker.generation(),
            "Replaying buffered input"
        );

        let mut input = worker.input().await;
        match input.as_mut() {
            Some(stdin) => self.buffer.replay(stdin).await,
            None => Err(ReplayError::sink_closed(pending)),
        }
    }

    fn spawn_worker(&self) -> Result<Arc<WorkerHandle>, SpawnError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        match WorkerHandle::spawn(&self.settings.command, generation) {
            Ok(worker) => Ok(Arc::new(worker)),
            Err(e) => {
                self.machine.record_spawn_failure();
                Err(e)
            }
        }
    }

    /// Restart cycle: stop the old worker, spawn a new one, replay the buffer.
    async fn restart(&self, reason: RestartReason) -> Result<(), SupervisorError> {
        let _cycle = self.cycle.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let old = self.begin_replacement().await;
        self.machine.transition(SupervisorState::Restarting);
        tracing::info!(
            ?reason,
            generation = old.generation(),
            "Buffering input during restart"
        );

        match old.stop(self.settings.stop_timeout).await {
            Ok(outcome) => tracing::debug!(?outcome, "Old worker stopped"),
            Err(e) => tracing::warn!(error = %e, "Error stopping worker"),
        }
        drop(old);

        let result = match self.spawn_worker() {
            Ok(worker) => self
                .install(worker)
                .await
                .map(|_| ())
                .map_err(SupervisorError::Replay),
            Err(e) => {
                self.abandon_replacement().await;
                Err(SupervisorError::Spawn(e))
            }
        };

        if result.is_ok() {
            self.machine.record_restart();
        }
        self.resume();
        result
    }

    /// Replace a worker that exited on its own, retrying until a spawn works.
    async fn recover(&self, crashed: &WorkerHandle) -> Result<(), SupervisorError> {
        let _cycle = self.cycle.lock().await;
        if self.cancel.is_cancelled()
            || self.current_worker().generation() != crashed.generation()
        {
            return Ok(());
        }

        self.begin_replacement().await;
        self.machine.transition(SupervisorState::Recovering);
        tracing::info!(
            reason = ?RestartReason::Crashed,
            generation = crashed.generation(),
            "Attempting immediate restart"
        );

        let mut attempt: u32 = 0;
        loop {
            match self.spawn_worker() {
                Ok(worker) => {
                    let replayed = self.install(worker).await;
                    self.machine.record_recovery();
                    self.resume();
                    return replayed.map(|_| ()).map_err(SupervisorError::Replay);
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::error!(
                        error = %e,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Failed to respawn worker"
                    );

                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            self.abandon_replacement().await;
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Stop the current worker once no replacement is in flight.
    async fn shutdown(&self) {
        let _cycle = self.cycle.lock().await;
        let worker = self.current_worker();
        match worker.stop(self.settings.stop_timeout).await {
            Ok(outcome) => tracing::info!(?outcome, "Worker stopped"),
            Err(e) => tracing::warn!(error = %e, "Error stopping worker during shutdown"),
        }
    }
}

/// Timer activity: restart on every tick or request.
async fn schedule_restarts(shared: Arc<Shared>, mut requests: mpsc::Receiver<()>) {
    let period = shared.settings.restart_interval;
    let mut ticker = (!period.is_zero()).then(|| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let reason = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return,
            () = tick => RestartReason::Scheduled,
            Some(()) = requests.recv() => RestartReason::Requested,
        };

        tracing::info!(?reason, "Restart triggered");
        if let Err(e) = shared.restart(reason).await {
            tracing::error!(error = %e, "Failed to restart worker");
        }
    }
}

/// Crash-monitor activity: respawn workers that exit outside a restart.
async fn monitor_crashes(shared: Arc<Shared>) {
    let mut current = shared.current.subscribe();

    loop {
        let worker = Arc::clone(&current.borrow_and_update().worker);

        let status = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return,
            status = worker.wait() => status,
        };

        // Let an in-flight restart finish before judging the exit.
        loop {
            if !current.borrow_and_update().restarting {
                break;
            }
            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => return,
                changed = current.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        if shared.cancel.is_cancelled() {
            return;
        }
        if shared.current_worker().generation() != worker.generation() {
            continue;
        }

        match status {
            Ok(status) => tracing::warn!(
                generation = worker.generation(),
                pid = ?worker.id(),
                %status,
                "Worker died unexpectedly"
            ),
            Err(e) => tracing::warn!(
                generation = worker.generation(),
                error = %e,
                "Worker died unexpectedly"
            ),
        }

        if let Err(e) = shared.recover(&worker).await {
            tracing::error!(error = %e, "Recovery finished with an error");
        }
    }
}

/// Input-forwarding activity: client bytes to the worker or the buffer.
async fn forward_input<R>(shared: &Shared, mut input: R) -> Result<(), ForwardError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Ok(()),
            read = input.read(&mut buf) => read.map_err(ForwardError::ReadInput)?,
        };

        if n == 0 {
            tracing::info!("Client input closed");
            return Ok(());
        }

        shared.route_input(&buf[..n]).await?;
    }
}

/// Output-forwarding activity: worker bytes to the client, across generations.
///
/// Once a newer generation is installed, the old worker's stdout is drained
/// for at most the stop grace period. A descendant of the old worker can hold
/// the pipe open indefinitely.
async fn forward_output<W>(shared: &Shared, mut output: W) -> Result<(), ForwardError>
where
    W: AsyncWrite + Unpin,
{
    let mut current = shared.current.subscribe();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let worker = Arc::clone(&current.borrow_and_update().worker);
        let generation = worker.generation();
        let stdout = worker.take_output();
        drop(worker);

        if let Some(mut stdout) = stdout {
            let mut drain_until: Option<Instant> = None;

            loop {
                let read = if let Some(deadline) = drain_until {
                    if let Ok(read) = tokio::time::timeout_at(deadline, stdout.read(&mut buf)).await {
                        read
                    } else {
                        tracing::warn!(generation, "Replaced worker output still open, dropping it");
                        break;
                    }
                } else {
                    tokio::select! {
                        read = stdout.read(&mut buf) => read,
                        changed = current.changed() => {
                            if changed.is_err()
                                || current.borrow_and_update().worker.generation() != generation
                            {
                                drain_until = Some(Instant::now() + shared.settings.stop_timeout);
                            }
                            continue;
                        }
                    }
                };

                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(generation, error = %e, "Error reading worker stdout");
                        0
                    }
                };
                if n == 0 {
                    tracing::debug!(generation, "Worker output closed");
                    break;
                }
                output
                    .write_all(&buf[..n])
                    .await
                    .map_err(ForwardError::WriteOutput)?;
                output.flush().await.map_err(ForwardError::WriteOutput)?;
            }
        }

        // Wait for the next generation.
        while current.borrow_and_update().worker.generation() == generation {
            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => return Ok(()),
                changed = current.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
