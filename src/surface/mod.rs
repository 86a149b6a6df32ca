//! Per-surface buffer submission state machine
//!
//! Every on-screen surface owns one [`SurfaceStateMachine`]. It turns client
//! commit requests into compositor protocol calls and turns compositor
//! events back into exactly one `OnSubmission` (followed by one
//! `OnPresentation`) per accepted commit.
//!
//! # Submission State Machine
//!
//! ```text
//!            commit (gate open)
//!   Idle ─────────────────────────► Committing { buffer, waiting_on }
//!    ▲                                   │
//!    │    release(waiting_on)            │
//!    └───────────────────────────────────┘
//!          or immediately when no release is expected
//! ```
//!
//! A commit completes immediately when the compositor will never send a
//! release for the buffer it replaces:
//! - the very first commit on the surface (nothing is replaced),
//! - a resubmission of the buffer that is still attached,
//! - the replaced buffer was already released (or is gone).
//!
//! Otherwise completion waits for the release of the replaced buffer.
//!
//! While a commit is outstanding (or a frame callback is pending and
//! throttling is enabled) one further commit is held as the pending commit.
//!
//! Notifications are queued in an outbox; callers drain it with
//! [`SurfaceStateMachine::drain_notifications`] after every operation.

use log::{debug, error, info};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::buffer::{BufferParams, BufferRegistry, BufferState};
use crate::config::{HostConfig, SurfaceConfig};
use crate::error::{HostError, HostResult};
use crate::protocol::{
    BufferId, ClientNotification, CompositorEvent, CompositorProxy, FaultLog, PresentationFeedback,
    ProtocolFault, ProtocolViolation, ProtocolWarning, Rect, SubmissionResult, SurfaceId,
};

/// What happened to an accepted commit request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDisposition {
    /// Dispatched and already completed (`OnSubmission` is in the outbox)
    Completed,
    /// Dispatched; completes when the replaced buffer is released
    AwaitingRelease,
    /// Held until the outstanding commit completes or the frame callback arrives
    Queued,
}

/// The commit currently being processed by the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub buffer: BufferId,
    /// Buffer whose release completes this submission
    pub waiting_on: Option<BufferId>,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    Committing(Submission),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingCommit {
    buffer: BufferId,
    damage: Rect,
}

/// Presentation bookkeeping for one dispatched commit
#[derive(Debug, Clone)]
struct FeedbackEntry {
    buffer: BufferId,
    /// `OnSubmission` was delivered
    submitted: bool,
    feedback: Option<PresentationFeedback>,
}

/// Counters for a single surface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    pub commits_requested: u64,
    pub commits_dispatched: u64,
    pub commits_queued: u64,
    pub resubmissions: u64,
    pub completed: u64,
    pub completed_immediately: u64,
    pub failed: u64,
}

pub struct SurfaceStateMachine {
    id: SurfaceId,
    config: SurfaceConfig,
    presentation_enabled: bool,
    registry: BufferRegistry,
    state: SubmissionState,
    pending: Option<PendingCommit>,
    prev_submitted: Option<BufferId>,
    frame_callback_pending: bool,
    feedback_queue: VecDeque<FeedbackEntry>,
    outbox: Vec<ClientNotification>,
    faults: FaultLog,
    stats: SurfaceStats,
}

impl SurfaceStateMachine {
    pub fn new(id: SurfaceId, config: &HostConfig) -> Self {
        debug!("Created state machine for {}", id);
        Self {
            id,
            config: config.surface.clone(),
            presentation_enabled: config.presentation.enabled,
            registry: BufferRegistry::new(),
            state: SubmissionState::Idle,
            pending: None,
            prev_submitted: None,
            frame_callback_pending: false,
            feedback_queue: VecDeque::new(),
            outbox: Vec::new(),
            faults: FaultLog::new(),
            stats: SurfaceStats::default(),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn state(&self) -> SubmissionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SubmissionState::Idle
    }

    /// Buffer of the outstanding (not yet completed) submission
    pub fn submitted_buffer(&self) -> Option<BufferId> {
        match self.state {
            SubmissionState::Committing(submission) => Some(submission.buffer),
            SubmissionState::Idle => None,
        }
    }

    /// Most recently dispatched buffer (the one attached at the compositor)
    pub fn prev_submitted_buffer(&self) -> Option<BufferId> {
        self.prev_submitted
    }

    /// Buffer held for the next commit
    pub fn pending_buffer(&self) -> Option<BufferId> {
        self.pending.map(|p| p.buffer)
    }

    pub fn frame_callback_pending(&self) -> bool {
        self.frame_callback_pending
    }

    pub fn stats(&self) -> &SurfaceStats {
        &self.stats
    }

    pub fn faults(&self) -> &FaultLog {
        &self.faults
    }

    /// The compositor misbehaved often enough to give up on this surface
    pub fn has_fatal_faults(&self) -> bool {
        self.faults.exceeds(self.config.max_protocol_faults)
    }

    /// Takes every notification produced since the last call
    pub fn drain_notifications(&mut self) -> Vec<ClientNotification> {
        std::mem::take(&mut self.outbox)
    }

    pub fn create_buffer(&mut self, buffer: BufferId, params: BufferParams) -> HostResult<()> {
        self.registry.create(buffer, params)?;
        Ok(())
    }

    /// Removes a buffer unless the compositor may still read it
    pub fn destroy_buffer(&mut self, buffer: BufferId) -> HostResult<()> {
        let state = self.registry.state(buffer).ok_or(HostError::UnknownBuffer {
            surface: self.id,
            buffer,
        })?;

        if state == BufferState::AwaitingRelease || self.pending_buffer() == Some(buffer) {
            return Err(HostError::BufferInUse {
                surface: self.id,
                buffer,
            });
        }

        self.registry.remove(buffer);
        Ok(())
    }

    /// Handles a client commit request
    pub fn commit_buffer(
        &mut self,
        buffer: BufferId,
        damage: Rect,
        compositor: &mut dyn CompositorProxy,
    ) -> HostResult<CommitDisposition> {
        if !self.registry.contains(buffer) {
            return Err(HostError::UnknownBuffer {
                surface: self.id,
                buffer,
            });
        }
        if self.pending.is_some() {
            return Err(HostError::CommitPending(self.id));
        }

        self.stats.commits_requested += 1;
        let commit = PendingCommit { buffer, damage };

        if !self.can_dispatch() {
            debug!(
                "{}: queueing {} (state: {:?}, frame callback pending: {})",
                self.id, buffer, self.state, self.frame_callback_pending
            );
            self.pending = Some(commit);
            self.stats.commits_queued += 1;
            return Ok(CommitDisposition::Queued);
        }

        self.dispatch(commit, compositor)
    }

    /// `wl_buffer.release`
    pub fn on_buffer_release(&mut self, buffer: BufferId, compositor: &mut dyn CompositorProxy) {
        match self.registry.state(buffer) {
            Some(BufferState::AwaitingRelease) => {
                self.registry.mark_released(buffer);
            }
            Some(state) => {
                self.faults.record(ProtocolFault::UnexpectedRelease {
                    surface: self.id,
                    buffer,
                    state,
                });
                return;
            }
            None => {
                self.faults.record(ProtocolFault::UnknownBufferReleased {
                    surface: self.id,
                    buffer,
                });
                return;
            }
        }

        debug!("{}: {} released", self.id, buffer);

        if let SubmissionState::Committing(submission) = self.state {
            if submission.waiting_on == Some(buffer) {
                self.complete_submission(compositor);
            }
        }
    }

    /// `wl_callback.done` for the outstanding frame callback
    pub fn on_frame_callback(&mut self, compositor: &mut dyn CompositorProxy) {
        if !self.frame_callback_pending {
            self.faults
                .record(ProtocolFault::UnexpectedFrameCallback { surface: self.id });
            return;
        }

        self.frame_callback_pending = false;
        self.try_dispatch_pending(compositor);
    }

    /// `wp_presentation_feedback.presented` / `discarded`
    pub fn on_presentation_feedback(&mut self, buffer: BufferId, feedback: PresentationFeedback) {
        // Without presentation support every entry gets synthetic feedback
        let entry = self
            .feedback_queue
            .iter_mut()
            .filter(|_| self.presentation_enabled)
            .find(|e| e.buffer == buffer && e.feedback.is_none());

        match entry {
            Some(entry) => {
                entry.feedback = Some(feedback);
                self.flush_presentations();
            }
            None => self.faults.record(ProtocolFault::UnmatchedPresentation {
                surface: self.id,
                buffer,
            }),
        }
    }

    /// Routes a compositor event addressed to this surface
    pub fn handle_event(&mut self, event: &CompositorEvent, compositor: &mut dyn CompositorProxy) {
        match *event {
            CompositorEvent::BufferRelease { buffer, .. } => self.on_buffer_release(buffer, compositor),
            CompositorEvent::FrameDone { .. } => self.on_frame_callback(compositor),
            CompositorEvent::Presentation {
                buffer, feedback, ..
            } => self.on_presentation_feedback(buffer, feedback),
        }
    }

    /// Warns when the outstanding submission waits too long for its release
    pub fn check_stall(&self, now: Instant) -> Option<ProtocolWarning> {
        let SubmissionState::Committing(submission) = self.state else {
            return None;
        };
        let waiting_on = submission.waiting_on?;
        let elapsed = now.saturating_duration_since(submission.started_at);

        if elapsed > self.config.release_stall_timeout() {
            Some(ProtocolWarning::ReleaseStalled {
                surface: self.id,
                buffer: submission.buffer,
                waiting_on,
                elapsed,
            })
        } else {
            None
        }
    }

    /// Cancels all bookkeeping and releases every buffer.
    ///
    /// Outstanding and queued commits are failed so every accepted commit
    /// still gets exactly one `OnSubmission` and one `OnPresentation`.
    pub fn shutdown(&mut self) {
        if let SubmissionState::Committing(submission) =
            std::mem::replace(&mut self.state, SubmissionState::Idle)
        {
            self.push_submission(submission.buffer, SubmissionResult::Failure);
            if let Some(entry) = self.feedback_queue.iter_mut().find(|e| !e.submitted) {
                entry.submitted = true;
            }
        }

        for entry in std::mem::take(&mut self.feedback_queue) {
            let feedback = entry.feedback.unwrap_or_else(PresentationFeedback::failure);
            self.push_presentation(entry.buffer, feedback);
        }

        if let Some(pending) = self.pending.take() {
            self.fail_commit(pending.buffer);
        }

        self.frame_callback_pending = false;
        self.prev_submitted = None;
        let held = self.registry.awaiting_release();
        let released = self.registry.clear();

        info!(
            "🧹 {} shut down, released {} buffers ({} still held by the compositor)",
            self.id, released, held
        );
    }

    fn can_dispatch(&self) -> bool {
        self.is_idle() && !(self.config.throttle_on_frame_callback && self.frame_callback_pending)
    }

    /// Issues the protocol calls for a commit and decides when it completes
    fn dispatch(
        &mut self,
        commit: PendingCommit,
        compositor: &mut dyn CompositorProxy,
    ) -> HostResult<CommitDisposition> {
        let buffer = commit.buffer;
        let state = self.registry.state(buffer).ok_or(HostError::UnknownBuffer {
            surface: self.id,
            buffer,
        })?;
        let previous = self.prev_submitted;

        // Same buffer as the last commit and the compositor still holds it
        let resubmission = previous == Some(buffer) && state == BufferState::AwaitingRelease;

        if resubmission {
            self.registry.note_resubmission(buffer);
            self.stats.resubmissions += 1;
        } else if !self.registry.mark_in_flight(buffer) {
            return Err(self.violation(ProtocolViolation::BufferNotReleased {
                surface: self.id,
                buffer,
            }));
        }

        let waiting_on = match previous {
            None => None,
            Some(prev) if prev == buffer => None,
            Some(prev) => match self.registry.state(prev) {
                Some(BufferState::AwaitingRelease) => Some(prev),
                _ => None,
            },
        };

        self.state = SubmissionState::Committing(Submission {
            buffer,
            waiting_on,
            started_at: Instant::now(),
        });

        let damage = if commit.damage.is_empty() {
            self.registry
                .get(buffer)
                .map(|b| b.params().extent())
                .unwrap_or_default()
        } else {
            commit.damage
        };

        // Frame and feedback requests are double-buffered state and must
        // precede the commit they apply to.
        compositor.attach(self.id, buffer);
        compositor.damage(self.id, damage);
        if !self.frame_callback_pending {
            compositor.request_frame_callback(self.id);
            self.frame_callback_pending = true;
        }
        if self.presentation_enabled {
            compositor.request_presentation_feedback(self.id, buffer);
        }
        compositor.commit(self.id);

        self.feedback_queue.push_back(FeedbackEntry {
            buffer,
            submitted: false,
            feedback: None,
        });
        self.prev_submitted = Some(buffer);
        self.stats.commits_dispatched += 1;

        match waiting_on {
            None => {
                debug!(
                    "{}: {} committed, completing immediately (resubmission: {})",
                    self.id, buffer, resubmission
                );
                self.stats.completed_immediately += 1;
                self.complete_submission(compositor);
                Ok(CommitDisposition::Completed)
            }
            Some(prev) => {
                debug!("{}: {} committed, waiting for release of {}", self.id, buffer, prev);
                Ok(CommitDisposition::AwaitingRelease)
            }
        }
    }

    fn complete_submission(&mut self, compositor: &mut dyn CompositorProxy) {
        let SubmissionState::Committing(submission) =
            std::mem::replace(&mut self.state, SubmissionState::Idle)
        else {
            return;
        };

        self.push_submission(submission.buffer, SubmissionResult::Success);
        self.stats.completed += 1;

        let synthetic = !self.presentation_enabled;
        if let Some(entry) = self.feedback_queue.iter_mut().find(|e| !e.submitted) {
            entry.submitted = true;
            if synthetic {
                entry.feedback = Some(PresentationFeedback::synthetic());
            }
        }
        self.flush_presentations();

        self.try_dispatch_pending(compositor);
    }

    fn try_dispatch_pending(&mut self, compositor: &mut dyn CompositorProxy) {
        if !self.can_dispatch() {
            return;
        }
        let Some(commit) = self.pending.take() else {
            return;
        };

        if let Err(err) = self.dispatch(commit, compositor) {
            error!("{}: queued commit of {} failed: {}", self.id, commit.buffer, err);
            self.fail_commit(commit.buffer);
        }
    }

    /// Delivers presentations in commit order, each after its submission
    fn flush_presentations(&mut self) {
        while let Some(front) = self.feedback_queue.front() {
            if !front.submitted || front.feedback.is_none() {
                break;
            }
            if let Some(FeedbackEntry {
                buffer,
                feedback: Some(feedback),
                ..
            }) = self.feedback_queue.pop_front()
            {
                self.push_presentation(buffer, feedback);
            }
        }
    }

    fn fail_commit(&mut self, buffer: BufferId) {
        self.push_submission(buffer, SubmissionResult::Failure);
        self.push_presentation(buffer, PresentationFeedback::failure());
    }

    fn push_submission(&mut self, buffer: BufferId, result: SubmissionResult) {
        if result == SubmissionResult::Failure {
            self.stats.failed += 1;
        }
        self.outbox.push(ClientNotification::Submission {
            surface: self.id,
            buffer,
            result,
        });
    }

    fn push_presentation(&mut self, buffer: BufferId, feedback: PresentationFeedback) {
        self.outbox.push(ClientNotification::Presentation {
            surface: self.id,
            buffer,
            feedback,
        });
    }

    fn violation(&self, violation: ProtocolViolation) -> HostError {
        if self.config.abort_on_violation {
            panic!("{}", violation);
        }
        error!("❌ {}", violation);
        HostError::Protocol(violation)
    }
}

impl std::fmt::Debug for SurfaceStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceStateMachine")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending", &self.pending_buffer())
            .field("prev_submitted", &self.prev_submitted)
            .field("frame_callback_pending", &self.frame_callback_pending)
            .field("buffers", &self.registry.len())
            .field("awaiting_release", &self.registry.awaiting_release())
            .finish()
    }
}

/// How often a running surface polls [`SurfaceStateMachine::check_stall`]
pub(crate) fn stall_check_interval(config: &SurfaceConfig) -> Duration {
    (config.release_stall_timeout() / 2).max(Duration::from_millis(1))
}
