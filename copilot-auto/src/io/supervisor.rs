//! Event loop that owns one child process from spawn to exit.
//!
//! Output chunks, cancellation, limit checks and the kill timer are all
//! handled on the calling thread, one at a time, so the run state needs no
//! locking. The loop wakes at least every [`TICK`] to re-check the duration
//! ceiling and the grace timer even when the child is silent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::limits::{LimitExceeded, LimitPolicy};
use crate::core::monitor::{RunMonitor, RunReport, RunState, StopReason};
use crate::core::types::OutputStream;
use crate::io::child::{ChildControl, ChildEvent};

/// Time between the graceful termination signal and the forced kill.
pub const GRACE_PERIOD: Duration = Duration::from_millis(2000);
/// Line written to the child's stdin to accept a confirmation prompt.
pub const APPROVAL_LINE: &str = "yes";

const TICK: Duration = Duration::from_millis(50);
/// How long to keep reading output already in flight after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Cooperative cancellation shared between the caller and one run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle events reported to the caller while a run is supervised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Started { argv: Vec<String> },
    /// Raw output, unchanged and in arrival order.
    Output { stream: OutputStream, bytes: Vec<u8> },
    AutoApproved,
    SessionCaptured { id: String },
    LimitExceeded(LimitExceeded),
    Interrupted,
    Stopping,
    /// The child outlived the grace period and was killed.
    ForceKilled,
    Exited(RunReport),
}

pub struct Supervisor<C: ChildControl> {
    child: C,
    monitor: RunMonitor,
    grace_period: Duration,
    kill_deadline: Option<Instant>,
    force_killed: bool,
    reaped: bool,
}

impl<C: ChildControl> Supervisor<C> {
    /// Take ownership of a just-spawned child. The run clock starts now.
    pub fn new(child: C, policy: LimitPolicy, auto_approve: bool) -> Self {
        let mut monitor = RunMonitor::new(policy, auto_approve);
        monitor.start(Instant::now());
        Self {
            child,
            monitor,
            grace_period: GRACE_PERIOD,
            kill_deadline: None,
            force_killed: false,
            reaped: false,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn state(&self) -> &RunState {
        self.monitor.state()
    }

    /// Begin graceful termination.
    ///
    /// Only the first call while running has an effect: it sends the
    /// termination signal and arms the kill timer. Returns whether it did.
    pub fn stop<F: FnMut(&RunEvent)>(&mut self, reason: StopReason, on_event: &mut F) -> bool {
        if !self.monitor.request_stop(reason) {
            debug!("stop requested while not running, ignoring");
            return false;
        }
        info!(?reason, "stopping child");
        on_event(&RunEvent::Stopping);
        if self.reaped {
            return true;
        }
        if let Err(err) = self.child.terminate() {
            warn!(err = %format!("{err:#}"), "failed to signal child");
        }
        self.kill_deadline = Some(Instant::now() + self.grace_period);
        true
    }

    /// Drive the child until it exits and return the final report.
    #[instrument(skip_all)]
    pub fn run<F: FnMut(&RunEvent)>(
        mut self,
        events: Receiver<ChildEvent>,
        cancel: &CancelToken,
        mut on_event: F,
    ) -> Result<RunReport> {
        let mut streams_open = true;
        let mut interrupted = false;

        let exit = loop {
            if streams_open {
                match events.recv_timeout(TICK) {
                    Ok(event) => self.handle_event(event, &mut on_event),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => streams_open = false,
                }
            } else {
                thread::sleep(TICK);
            }

            if !interrupted && cancel.is_cancelled() {
                interrupted = true;
                info!("run cancelled by caller");
                on_event(&RunEvent::Interrupted);
                self.stop(StopReason::Interrupted, &mut on_event);
            }

            if let Some(exceeded) = self.monitor.on_tick(Instant::now()) {
                info!(%exceeded, "limit reached while idle");
                on_event(&RunEvent::LimitExceeded(exceeded));
                self.stop(StopReason::Limit(exceeded), &mut on_event);
            }

            // Reap before escalating so an exit during the grace period is not
            // mistaken for a hang.
            match self.child.try_wait() {
                Ok(Some(exit)) => {
                    self.reaped = true;
                    break exit;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "lost track of child, killing it");
                    self.abandon();
                    return Err(err.context("poll supervised child"));
                }
            }

            self.escalate_if_due(&mut on_event);
        };
        debug!(exit_code = ?exit.code, "child exited");

        if streams_open {
            self.drain(&events, &mut on_event);
        }

        let report = self.monitor.on_exit(exit.code, Instant::now());
        info!(
            exit_code = ?report.exit_code,
            iterations = report.iterations,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        on_event(&RunEvent::Exited(report.clone()));
        Ok(report)
    }

    fn handle_event<F: FnMut(&RunEvent)>(&mut self, event: ChildEvent, on_event: &mut F) {
        let (stream, bytes) = match event {
            ChildEvent::Output(stream, bytes) => (stream, bytes),
            ChildEvent::Closed(stream) => {
                debug!(?stream, "stream closed");
                return;
            }
        };

        let outcome = self.monitor.on_output(stream, &bytes, Instant::now());
        on_event(&RunEvent::Output { stream, bytes });

        if outcome.approve {
            self.approve(on_event);
        }
        report_capture(outcome.captured, on_event);
        if let Some(exceeded) = outcome.exceeded {
            info!(%exceeded, "limit reached");
            on_event(&RunEvent::LimitExceeded(exceeded));
            self.stop(StopReason::Limit(exceeded), on_event);
        }
    }

    fn approve<F: FnMut(&RunEvent)>(&mut self, on_event: &mut F) {
        if self.reaped {
            return;
        }
        match self.child.write_line(APPROVAL_LINE) {
            Ok(()) => {
                debug!("confirmation prompt answered");
                on_event(&RunEvent::AutoApproved);
            }
            // The child may hang on the prompt; the duration ceiling still applies.
            Err(err) => warn!(err = %format!("{err:#}"), "failed to answer confirmation prompt"),
        }
    }

    /// Signal and kill a child whose status can no longer be observed.
    fn abandon(&mut self) {
        if let Err(err) = self.child.terminate() {
            warn!(err = %format!("{err:#}"), "failed to signal child");
        }
        if let Err(err) = self.child.kill() {
            warn!(err = %format!("{err:#}"), "failed to kill child");
        }
    }

    fn escalate_if_due<F: FnMut(&RunEvent)>(&mut self, on_event: &mut F) {
        let Some(deadline) = self.kill_deadline else {
            return;
        };
        if self.force_killed || self.reaped || Instant::now() < deadline {
            return;
        }
        warn!(grace_ms = self.grace_period.as_millis() as u64, "grace period elapsed, killing child");
        self.force_killed = true;
        if let Err(err) = self.child.kill() {
            warn!(err = %format!("{err:#}"), "failed to kill child");
        }
        on_event(&RunEvent::ForceKilled);
    }

    /// Process output that was still in flight when the child exited.
    ///
    /// Chunks are counted and scanned for a session id, but never
    /// approved or checked against the ceilings.
    fn drain<F: FnMut(&RunEvent)>(&mut self, events: &Receiver<ChildEvent>, on_event: &mut F) {
        loop {
            match events.recv_timeout(DRAIN_TIMEOUT) {
                Ok(ChildEvent::Output(stream, bytes)) => {
                    let outcome = self.monitor.on_trailing_output(stream, &bytes);
                    on_event(&RunEvent::Output { stream, bytes });
                    report_capture(outcome.captured, on_event);
                }
                Ok(ChildEvent::Closed(stream)) => debug!(?stream, "stream closed"),
                Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    // A grandchild may still hold the pipes open.
                    debug!("output streams still open after exit, giving up");
                    return;
                }
            }
        }
    }
}

fn report_capture<F: FnMut(&RunEvent)>(captured: Option<String>, on_event: &mut F) {
    if let Some(id) = captured {
        debug!(session_id = %id, "session id captured");
        on_event(&RunEvent::SessionCaptured { id });
    }
}
