//! Error types returned synchronously to callers of the buffer host
//!
//! Request-level failures (unknown identifiers, buffers still in use,
//! violated preconditions) surface here. Failures that happen after a
//! request was accepted are reported as `OnSubmission(Failure)` instead.

use thiserror::Error;

use crate::buffer::BufferFormat;
use crate::protocol::{BufferId, ProtocolViolation, SurfaceId};

/// Rejected buffer creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferCreateError {
    #[error("{0} already exists")]
    AlreadyExists(BufferId),
    #[error("{buffer} has invalid size {width}x{height}")]
    InvalidSize {
        buffer: BufferId,
        width: u32,
        height: u32,
    },
    #[error("{buffer} stride {stride} is too small for {width} pixels of {format:?}")]
    StrideTooSmall {
        buffer: BufferId,
        stride: u32,
        width: u32,
        format: BufferFormat,
    },
    #[error("{buffer} has {planes} dmabuf planes, expected 1 to 4")]
    InvalidPlaneCount { buffer: BufferId, planes: usize },
}

/// Errors reported by the buffer host for a client request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("unknown {0}")]
    UnknownSurface(SurfaceId),
    #[error("{0} already exists")]
    SurfaceExists(SurfaceId),
    #[error("unknown {buffer} on {surface}")]
    UnknownBuffer { surface: SurfaceId, buffer: BufferId },
    #[error("{buffer} on {surface} is still in use by the compositor")]
    BufferInUse { surface: SurfaceId, buffer: BufferId },
    #[error("{0} already has a queued commit")]
    CommitPending(SurfaceId),
    #[error("buffer creation failed: {0}")]
    BufferCreate(#[from] BufferCreateError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("buffer host service is no longer running")]
    ServiceStopped,
}

pub type HostResult<T> = std::result::Result<T, HostError>;
