//! Run state machine for one supervised child.
//!
//! `RunMonitor` owns the `RunState` and decides, per output chunk, whether to
//! approve a prompt, record a session id, or stop. It performs no I/O; the
//! supervisor applies its decisions to the real process.

use std::time::{Duration, Instant};

use crate::core::limits::{LimitExceeded, LimitPolicy};
use crate::core::scanner;
use crate::core::types::OutputStream;

/// Lifecycle phase: `Idle -> Running -> (Stopping) -> Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Stopping,
    Exited,
}

/// Why a run was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Limit(LimitExceeded),
    Interrupted,
}

/// Mutable bookkeeping for a single run. Never shared across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    /// Processed stdout chunks. Only ever incremented.
    pub iterations: u32,
    /// Captured once when the child is spawned.
    pub started_at: Option<Instant>,
    /// Session id from the latest matching chunk.
    pub captured_session_id: Option<String>,
    phase: Phase,
}

impl RunState {
    fn new() -> Self {
        Self {
            iterations: 0,
            started_at: None,
            captured_session_id: None,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True from spawn until the child exits.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Running | Phase::Stopping)
    }
}

/// Decisions produced by a single output chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Write an affirmative answer to the child's stdin.
    pub approve: bool,
    /// Session id captured from this chunk.
    pub captured: Option<String>,
    /// A ceiling was crossed; the run must stop.
    pub exceeded: Option<LimitExceeded>,
}

/// Final summary of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Exit code, `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub iterations: u32,
    pub elapsed: Duration,
    pub session_id: Option<String>,
    pub stop_reason: Option<StopReason>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct RunMonitor {
    policy: LimitPolicy,
    auto_approve: bool,
    state: RunState,
    stop_reason: Option<StopReason>,
    ended_at: Option<Instant>,
}

impl RunMonitor {
    pub fn new(policy: LimitPolicy, auto_approve: bool) -> Self {
        Self {
            policy,
            auto_approve,
            state: RunState::new(),
            stop_reason: None,
            ended_at: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Mark the child as spawned. Only the first call has an effect.
    pub fn start(&mut self, now: Instant) {
        if self.state.phase == Phase::Idle {
            self.state.phase = Phase::Running;
            self.state.started_at = Some(now);
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        let end = self.ended_at.unwrap_or(now);
        self.state
            .started_at
            .map(|start| end.saturating_duration_since(start))
            .unwrap_or_default()
    }

    /// Process one chunk of child output.
    ///
    /// Only stdout chunks are scanned. While running a chunk is counted and
    /// checked against the ceilings. Once a stop was requested the count is
    /// frozen and prompts are left alone, but a session id the child prints
    /// while shutting down is still recorded.
    pub fn on_output(
        &mut self,
        stream: OutputStream,
        chunk: &[u8],
        now: Instant,
    ) -> ChunkOutcome {
        if stream != OutputStream::Stdout {
            return ChunkOutcome::default();
        }
        match self.state.phase {
            Phase::Running => {
                let text = String::from_utf8_lossy(chunk);
                let found = scanner::scan(&text);
                if let Some(id) = &found.session_id {
                    self.state.captured_session_id = Some(id.clone());
                }
                self.state.iterations += 1;

                ChunkOutcome {
                    approve: found.prompt && self.auto_approve,
                    captured: found.session_id,
                    exceeded: self.policy.evaluate(self.state.iterations, self.elapsed(now)),
                }
            }
            Phase::Stopping => ChunkOutcome {
                captured: self.capture_session(chunk),
                ..ChunkOutcome::default()
            },
            Phase::Idle | Phase::Exited => ChunkOutcome::default(),
        }
    }

    /// Process a stdout chunk read after the child already exited.
    ///
    /// It is counted if the run was never stopped and scanned for a session
    /// id, but never approved or checked against the ceilings.
    pub fn on_trailing_output(&mut self, stream: OutputStream, chunk: &[u8]) -> ChunkOutcome {
        if stream != OutputStream::Stdout || !self.state.is_active() {
            return ChunkOutcome::default();
        }
        if self.state.phase == Phase::Running {
            self.state.iterations += 1;
        }
        ChunkOutcome {
            captured: self.capture_session(chunk),
            ..ChunkOutcome::default()
        }
    }

    fn capture_session(&mut self, chunk: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(chunk);
        let id = scanner::extract_session_id(&text)?.to_string();
        self.state.captured_session_id = Some(id.clone());
        Some(id)
    }

    /// Re-check the ceilings while the child is silent.
    pub fn on_tick(&self, now: Instant) -> Option<LimitExceeded> {
        if self.state.phase != Phase::Running {
            return None;
        }
        self.policy.evaluate(self.state.iterations, self.elapsed(now))
    }

    /// Move from `Running` to `Stopping`.
    ///
    /// Returns `false` (and changes nothing) unless the run is currently
    /// running, so only the first request triggers termination.
    pub fn request_stop(&mut self, reason: StopReason) -> bool {
        if self.state.phase != Phase::Running {
            return false;
        }
        self.state.phase = Phase::Stopping;
        self.stop_reason = Some(reason);
        true
    }

    /// Record the child's exit and produce the final report.
    pub fn on_exit(&mut self, exit_code: Option<i32>, now: Instant) -> RunReport {
        if self.state.phase != Phase::Exited {
            self.state.phase = Phase::Exited;
            self.ended_at = Some(now);
        }
        RunReport {
            exit_code,
            iterations: self.state.iterations,
            elapsed: self.elapsed(now),
            session_id: self.state.captured_session_id.clone(),
            stop_reason: self.stop_reason,
        }
    }
}
