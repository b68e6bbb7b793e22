//! Supervisor lifecycle state machine.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

/// Current lifecycle state of a supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Starting,
    Running,
    /// Scheduled or requested replacement: stop, spawn, replay.
    Restarting,
    /// Replacement after an unexpected exit; the stop step is skipped.
    Recovering,
    ShuttingDown,
    Stopped,
}

/// Identity of the worker currently behind the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub generation: u64,
    pub pid: Option<u32>,
}

/// Counters over the life of one supervisor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    /// Workers started, including the first.
    pub spawns: u64,
    /// Completed scheduled or requested restart cycles.
    pub restarts: u64,
    /// Completed recoveries after an unexpected exit.
    pub recoveries: u64,
    /// Failed spawn attempts after the first worker.
    pub spawn_failures: u64,
    /// Chunks delivered to a new worker by replay.
    pub replayed_chunks: u64,
    /// Replays that stopped on a write error.
    pub replay_failures: u64,
}

/// State machine shared between the supervisor's activities and its handles.
#[derive(Debug)]
pub struct StateMachine {
    state: watch::Sender<SupervisorState>,
    worker: watch::Sender<WorkerInfo>,
    stats: Mutex<SupervisorStats>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(SupervisorState::Starting),
            worker: watch::Sender::new(WorkerInfo::default()),
            stats: Mutex::new(SupervisorStats::default()),
        }
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn transition(&self, new_state: SupervisorState) {
        let old = self.state.send_replace(new_state);
        tracing::debug!(from = ?old, to = ?new_state, "State transition");
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn worker(&self) -> WorkerInfo {
        *self.worker.borrow()
    }

    /// Watch worker replacements.
    #[must_use]
    pub fn subscribe_worker(&self) -> watch::Receiver<WorkerInfo> {
        self.worker.subscribe()
    }

    /// Record that a new worker is now current.
    pub fn record_spawn(&self, info: WorkerInfo) {
        self.worker.send_replace(info);
        self.update(|s| s.spawns = s.spawns.saturating_add(1));
    }

    pub fn record_restart(&self) {
        self.update(|s| s.restarts = s.restarts.saturating_add(1));
    }

    pub fn record_recovery(&self) {
        self.update(|s| s.recoveries = s.recoveries.saturating_add(1));
    }

    pub fn record_spawn_failure(&self) {
        self.update(|s| s.spawn_failures = s.spawn_failures.saturating_add(1));
    }

    pub fn record_replay(&self, chunks: usize) {
        let chunks = u64::try_from(chunks).unwrap_or(u64::MAX);
        self.update(|s| s.replayed_chunks = s.replayed_chunks.saturating_add(chunks));
    }

    pub fn record_replay_failure(&self, written: usize) {
        self.record_replay(written);
        self.update(|s| s.replay_failures = s.replay_failures.saturating_add(1));
    }

    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut SupervisorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
