//! Client buffers and their release state
//!
//! A buffer is created by the GPU client, committed to the compositor any
//! number of times and finally destroyed. Between a commit and the matching
//! `wl_buffer.release` the compositor may still read it, so the client must
//! not touch or free it.
//!
//! # Release State Machine
//!
//! ```text
//!  Unsubmitted ──commit──► AwaitingRelease ──release──► Released
//!                               ▲                           │
//!                               └──────────commit───────────┘
//! ```
//!
//! Committing the same buffer again while it is still `AwaitingRelease`
//! (a resubmission) keeps it there.

pub mod registry;

use serde::{Deserialize, Serialize};

use crate::error::BufferCreateError;
use crate::protocol::{BufferId, Rect};

pub use registry::BufferRegistry;

/// Maximum number of dmabuf planes (matches zwp_linux_buffer_params_v1)
const MAX_DMABUF_PLANES: usize = 4;

/// Pixel formats accepted for client buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
    /// 2-plane YUV; stride refers to the luma plane
    Nv12,
}

impl BufferFormat {
    /// Bytes per pixel of the first plane
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            BufferFormat::Argb8888
            | BufferFormat::Xrgb8888
            | BufferFormat::Abgr8888
            | BufferFormat::Xbgr8888 => 4,
            BufferFormat::Rgb565 => 2,
            BufferFormat::Nv12 => 1,
        }
    }
}

/// One plane of a dmabuf-backed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmabufPlane {
    pub offset: u32,
    pub stride: u32,
}

/// Backing storage of a buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BufferKind {
    /// wl_shm pool slice
    Shm { offset: u32, stride: u32 },
    /// Accelerated buffer imported through linux-dmabuf
    Dmabuf { planes: Vec<DmabufPlane>, modifier: u64 },
}

/// Parameters supplied with a buffer creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferParams {
    pub width: u32,
    pub height: u32,
    pub format: BufferFormat,
    pub kind: BufferKind,
}

impl BufferParams {
    /// Tightly packed shared-memory buffer
    pub fn shm(width: u32, height: u32, format: BufferFormat) -> Self {
        Self {
            width,
            height,
            format,
            kind: BufferKind::Shm {
                offset: 0,
                stride: width.saturating_mul(format.bytes_per_pixel()),
            },
        }
    }

    /// Single-plane dmabuf with a linear layout
    pub fn dmabuf(width: u32, height: u32, format: BufferFormat) -> Self {
        Self {
            width,
            height,
            format,
            kind: BufferKind::Dmabuf {
                planes: vec![DmabufPlane {
                    offset: 0,
                    stride: width.saturating_mul(format.bytes_per_pixel()),
                }],
                modifier: 0,
            },
        }
    }

    /// Full-buffer extent, used when a commit carries no damage
    pub fn extent(&self) -> Rect {
        let width = i32::try_from(self.width).unwrap_or(i32::MAX);
        let height = i32::try_from(self.height).unwrap_or(i32::MAX);
        Rect::from_size(width, height)
    }

    /// Checks the parameters for the buffer about to be created
    pub fn validate(&self, buffer: BufferId) -> Result<(), BufferCreateError> {
        if self.width == 0 || self.height == 0 {
            return Err(BufferCreateError::InvalidSize {
                buffer,
                width: self.width,
                height: self.height,
            });
        }

        let min_stride = u64::from(self.width) * u64::from(self.format.bytes_per_pixel());
        let check_stride = |stride: u32| {
            if u64::from(stride) < min_stride {
                Err(BufferCreateError::StrideTooSmall {
                    buffer,
                    stride,
                    width: self.width,
                    format: self.format,
                })
            } else {
                Ok(())
            }
        };

        match &self.kind {
            BufferKind::Shm { stride, .. } => check_stride(*stride),
            BufferKind::Dmabuf { planes, .. } => {
                if planes.is_empty() || planes.len() > MAX_DMABUF_PLANES {
                    return Err(BufferCreateError::InvalidPlaneCount {
                        buffer,
                        planes: planes.len(),
                    });
                }
                check_stride(planes[0].stride)
            }
        }
    }
}

/// Release state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    /// Created but never committed
    Unsubmitted,
    /// Committed; the compositor may still be reading it
    AwaitingRelease,
    /// The compositor gave it back
    Released,
}

impl BufferState {
    /// Whether the client may reuse the buffer for a new submission
    pub fn is_released(&self) -> bool {
        !matches!(self, BufferState::AwaitingRelease)
    }
}

/// A client buffer tracked by a surface
#[derive(Debug, Clone)]
pub struct Buffer {
    id: BufferId,
    params: BufferParams,
    state: BufferState,
    commit_count: u64,
}

impl Buffer {
    fn new(id: BufferId, params: BufferParams) -> Self {
        Self {
            id,
            params,
            state: BufferState::Unsubmitted,
            commit_count: 0,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn params(&self) -> &BufferParams {
        &self.params
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.state.is_released()
    }

    /// Number of times the buffer was committed, resubmissions included
    pub fn commit_count(&self) -> u64 {
        self.commit_count
    }

    fn mark_in_flight(&mut self) {
        debug_assert!(self.state.is_released());
        self.state = BufferState::AwaitingRelease;
    }

    fn mark_released(&mut self) {
        self.state = BufferState::Released;
    }
}
