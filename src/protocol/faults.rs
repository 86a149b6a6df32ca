//! Protocol faults, violations and warnings
//!
//! Three severities, mirroring how each side is allowed to misbehave:
//!
//! 1. **Violation** ([`ProtocolViolation`]): the GPU client broke a buffer
//!    precondition. Returned to the caller as an error (or aborts in strict mode).
//! 2. **Fault** ([`ProtocolFault`]): the compositor sent an event that does not
//!    fit the surface state. Logged and ignored; too many of them are fatal for
//!    the surface.
//! 3. **Warning** ([`ProtocolWarning`]): suspicious but legal, e.g. a release
//!    that has not arrived for a long time.

use log::warn;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

use super::{BufferId, SurfaceId};
use crate::buffer::BufferState;

/// Number of recent faults kept per surface for diagnostics
const FAULT_HISTORY_SIZE: usize = 16;

/// Client-side precondition violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// A buffer other than the previous one was committed before the
    /// compositor released it
    #[error("{buffer} committed on {surface} while still awaiting release")]
    BufferNotReleased { surface: SurfaceId, buffer: BufferId },
}

/// Compositor events that do not match the surface state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    #[error("release for unknown {buffer} on {surface}")]
    UnknownBufferReleased { surface: SurfaceId, buffer: BufferId },
    #[error("release for {buffer} on {surface} which is {state:?}")]
    UnexpectedRelease {
        surface: SurfaceId,
        buffer: BufferId,
        state: BufferState,
    },
    #[error("frame callback on {surface} without an outstanding request")]
    UnexpectedFrameCallback { surface: SurfaceId },
    #[error("presentation feedback for {buffer} on {surface} matches no commit")]
    UnmatchedPresentation { surface: SurfaceId, buffer: BufferId },
}

/// Non-fatal observations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolWarning {
    /// The outstanding submission has been waiting on a release for too long
    ReleaseStalled {
        surface: SurfaceId,
        buffer: BufferId,
        waiting_on: BufferId,
        elapsed: Duration,
    },
}

impl std::fmt::Display for ProtocolWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolWarning::ReleaseStalled {
                surface,
                buffer,
                waiting_on,
                elapsed,
            } => write!(
                f,
                "Submission of {} on {} still waiting for release of {} after {:?}",
                buffer, surface, waiting_on, elapsed
            ),
        }
    }
}

/// Per-surface fault accounting
#[derive(Debug, Clone, Default)]
pub struct FaultLog {
    recent: VecDeque<ProtocolFault>,
    total: u64,
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a compositor fault; the offending event is otherwise ignored
    pub fn record(&mut self, fault: ProtocolFault) {
        warn!("Ignoring compositor event: {}", fault);
        if self.recent.len() >= FAULT_HISTORY_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back(fault);
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn recent(&self) -> impl Iterator<Item = &ProtocolFault> {
        self.recent.iter()
    }

    pub fn last(&self) -> Option<&ProtocolFault> {
        self.recent.back()
    }

    /// Whether the surface has seen more faults than it may tolerate
    pub fn exceeds(&self, max_faults: u32) -> bool {
        self.total > u64::from(max_faults)
    }
}
