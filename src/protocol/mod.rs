//! Wire-level vocabulary shared by the buffer host and its peers
//!
//! The host sits between two external parties:
//!
//! - **GPU client**: creates buffers, asks for them to be committed and
//!   consumes [`ClientNotification`]s (`OnSubmission` / `OnPresentation`).
//! - **Compositor**: receives attach/damage/frame/commit calls through a
//!   [`CompositorProxy`] and answers asynchronously with [`CompositorEvent`]s.
//!
//! Both proxies are traits so the state machine can be driven by a real
//! transport, a channel (see [`crate::host::service`]) or a plain `Vec`
//! recorder in tests and scenario replays.
//!
//! # Usage
//!
//! ```
//! use axiom_buffer_host::protocol::{BufferId, CompositorProxy, CompositorRequest, Rect, SurfaceId};
//!
//! let mut calls: Vec<CompositorRequest> = Vec::new();
//! calls.attach(SurfaceId(1), BufferId(7));
//! calls.damage(SurfaceId(1), Rect::from_size(64, 64));
//! calls.commit(SurfaceId(1));
//! assert_eq!(calls.len(), 3);
//! ```

pub mod faults;

use bitflags::bitflags;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::buffer::BufferParams;

// Re-export commonly used types
pub use faults::{FaultLog, ProtocolFault, ProtocolViolation, ProtocolWarning};

/// Identifier of an on-screen surface, chosen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub u32);

/// Opaque buffer identifier, unique within one surface's registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Damage rectangle in buffer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle anchored at the origin
    pub fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

bitflags! {
    /// Presentation kinds reported by the compositor (wp_presentation_feedback.kind)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PresentationFlags: u32 {
        const VSYNC = 0x1;
        const HW_CLOCK = 0x2;
        const HW_COMPLETION = 0x4;
        const ZERO_COPY = 0x8;
    }
}

/// How (and whether) a committed buffer reached the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresentationFeedback {
    /// The content was shown
    Presented {
        /// Presentation time since the clock epoch
        timestamp: Duration,
        /// Output refresh interval (zero if unknown)
        refresh: Duration,
        /// Output vblank sequence counter
        sequence: u64,
        flags: PresentationFlags,
    },
    /// The content was never shown; reported to the client as a failed presentation
    Discarded,
}

impl PresentationFeedback {
    /// Feedback stamped with the current wall clock, used when the compositor
    /// does not support presentation-time reporting
    pub fn synthetic() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::Presented {
            timestamp,
            refresh: Duration::ZERO,
            sequence: 0,
            flags: PresentationFlags::empty(),
        }
    }

    pub fn failure() -> Self {
        Self::Discarded
    }

    pub fn is_presented(&self) -> bool {
        matches!(self, Self::Presented { .. })
    }
}

/// Outcome of a single submission as reported by `OnSubmission`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionResult {
    Success,
    Failure,
}

/// Notifications delivered to the GPU client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientNotification {
    /// `OnSubmission`: the commit finished and the previous buffer may be reused
    Submission {
        surface: SurfaceId,
        buffer: BufferId,
        result: SubmissionResult,
    },
    /// `OnPresentation`: presentation feedback for a completed submission
    Presentation {
        surface: SurfaceId,
        buffer: BufferId,
        feedback: PresentationFeedback,
    },
}

impl ClientNotification {
    pub fn surface(&self) -> SurfaceId {
        match self {
            Self::Submission { surface, .. } | Self::Presentation { surface, .. } => *surface,
        }
    }

    pub fn buffer(&self) -> BufferId {
        match self {
            Self::Submission { buffer, .. } | Self::Presentation { buffer, .. } => *buffer,
        }
    }

    pub fn is_submission(&self) -> bool {
        matches!(self, Self::Submission { .. })
    }

    /// Hands the notification to a client proxy
    pub fn deliver(self, client: &mut dyn GpuClientProxy) {
        match self {
            Self::Submission {
                surface,
                buffer,
                result,
            } => client.on_submission(surface, buffer, result),
            Self::Presentation {
                surface,
                buffer,
                feedback,
            } => client.on_presentation(surface, buffer, feedback),
        }
    }
}

/// Receiver side of the completion callbacks (the remote rendering process)
pub trait GpuClientProxy {
    fn on_submission(&mut self, surface: SurfaceId, buffer: BufferId, result: SubmissionResult);
    fn on_presentation(&mut self, surface: SurfaceId, buffer: BufferId, feedback: PresentationFeedback);
}

/// Outbound protocol calls to the compositor
///
/// Calls are fire-and-forget; answers come back as [`CompositorEvent`]s.
#[cfg_attr(test, mockall::automock)]
pub trait CompositorProxy {
    fn attach(&mut self, surface: SurfaceId, buffer: BufferId);
    fn damage(&mut self, surface: SurfaceId, region: Rect);
    fn request_frame_callback(&mut self, surface: SurfaceId);
    fn request_presentation_feedback(&mut self, surface: SurfaceId, buffer: BufferId);
    fn commit(&mut self, surface: SurfaceId);
}

/// A [`CompositorProxy`] call captured as a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum CompositorRequest {
    Attach { surface: SurfaceId, buffer: BufferId },
    Damage { surface: SurfaceId, region: Rect },
    FrameCallback { surface: SurfaceId },
    PresentationFeedback { surface: SurfaceId, buffer: BufferId },
    Commit { surface: SurfaceId },
}

/// Asynchronous events coming back from the compositor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CompositorEvent {
    /// wl_buffer.release
    BufferRelease { surface: SurfaceId, buffer: BufferId },
    /// wl_callback.done for the outstanding frame callback
    FrameDone { surface: SurfaceId },
    /// wp_presentation_feedback.presented / discarded
    Presentation {
        surface: SurfaceId,
        buffer: BufferId,
        feedback: PresentationFeedback,
    },
}

impl CompositorEvent {
    pub fn surface(&self) -> SurfaceId {
        match self {
            Self::BufferRelease { surface, .. }
            | Self::FrameDone { surface }
            | Self::Presentation { surface, .. } => *surface,
        }
    }
}

/// Requests issued by the GPU client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    CreateSurface {
        surface: SurfaceId,
    },
    DestroySurface {
        surface: SurfaceId,
    },
    CreateBuffer {
        surface: SurfaceId,
        buffer: BufferId,
        params: BufferParams,
    },
    DestroyBuffer {
        surface: SurfaceId,
        buffer: BufferId,
    },
    CommitBuffer {
        surface: SurfaceId,
        buffer: BufferId,
        damage: Rect,
    },
}

impl ClientRequest {
    pub fn surface(&self) -> SurfaceId {
        match self {
            Self::CreateSurface { surface }
            | Self::DestroySurface { surface }
            | Self::CreateBuffer { surface, .. }
            | Self::DestroyBuffer { surface, .. }
            | Self::CommitBuffer { surface, .. } => *surface,
        }
    }
}

impl CompositorRequest {
    fn send_to(self, tx: &mpsc::UnboundedSender<CompositorRequest>) {
        if let Err(err) = tx.send(self) {
            debug!("Compositor transport closed, dropping {:?}", err.0);
        }
    }
}

impl CompositorProxy for Vec<CompositorRequest> {
    fn attach(&mut self, surface: SurfaceId, buffer: BufferId) {
        self.push(CompositorRequest::Attach { surface, buffer });
    }

    fn damage(&mut self, surface: SurfaceId, region: Rect) {
        self.push(CompositorRequest::Damage { surface, region });
    }

    fn request_frame_callback(&mut self, surface: SurfaceId) {
        self.push(CompositorRequest::FrameCallback { surface });
    }

    fn request_presentation_feedback(&mut self, surface: SurfaceId, buffer: BufferId) {
        self.push(CompositorRequest::PresentationFeedback { surface, buffer });
    }

    fn commit(&mut self, surface: SurfaceId) {
        self.push(CompositorRequest::Commit { surface });
    }
}

impl CompositorProxy for mpsc::UnboundedSender<CompositorRequest> {
    fn attach(&mut self, surface: SurfaceId, buffer: BufferId) {
        CompositorRequest::Attach { surface, buffer }.send_to(self);
    }

    fn damage(&mut self, surface: SurfaceId, region: Rect) {
        CompositorRequest::Damage { surface, region }.send_to(self);
    }

    fn request_frame_callback(&mut self, surface: SurfaceId) {
        CompositorRequest::FrameCallback { surface }.send_to(self);
    }

    fn request_presentation_feedback(&mut self, surface: SurfaceId, buffer: BufferId) {
        CompositorRequest::PresentationFeedback { surface, buffer }.send_to(self);
    }

    fn commit(&mut self, surface: SurfaceId) {
        CompositorRequest::Commit { surface }.send_to(self);
    }
}

impl GpuClientProxy for Vec<ClientNotification> {
    fn on_submission(&mut self, surface: SurfaceId, buffer: BufferId, result: SubmissionResult) {
        self.push(ClientNotification::Submission {
            surface,
            buffer,
            result,
        });
    }

    fn on_presentation(&mut self, surface: SurfaceId, buffer: BufferId, feedback: PresentationFeedback) {
        self.push(ClientNotification::Presentation {
            surface,
            buffer,
            feedback,
        });
    }
}

impl GpuClientProxy for mpsc::UnboundedSender<ClientNotification> {
    fn on_submission(&mut self, surface: SurfaceId, buffer: BufferId, result: SubmissionResult) {
        let notification = ClientNotification::Submission {
            surface,
            buffer,
            result,
        };
        if self.send(notification).is_err() {
            debug!("GPU client went away, dropping submission of {} on {}", buffer, surface);
        }
    }

    fn on_presentation(&mut self, surface: SurfaceId, buffer: BufferId, feedback: PresentationFeedback) {
        let notification = ClientNotification::Presentation {
            surface,
            buffer,
            feedback,
        };
        if self.send(notification).is_err() {
            debug!("GPU client went away, dropping presentation of {} on {}", buffer, surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_emptiness() {
        assert!(Rect::default().is_empty());
        assert!(Rect::new(10, 10, 0, 5).is_empty());
        assert!(!Rect::from_size(1, 1).is_empty());
    }

    #[test]
    fn test_notification_delivery_to_recorder() {
        let mut client: Vec<ClientNotification> = Vec::new();
        ClientNotification::Submission {
            surface: SurfaceId(1),
            buffer: BufferId(2),
            result: SubmissionResult::Success,
        }
        .deliver(&mut client);

        assert_eq!(client.len(), 1);
        assert!(client[0].is_submission());
        assert_eq!(client[0].buffer(), BufferId(2));
        assert_eq!(client[0].surface(), SurfaceId(1));
    }

    #[test]
    fn test_channel_compositor_survives_closed_receiver() {
        let (mut tx, rx) = mpsc::unbounded_channel::<CompositorRequest>();
        drop(rx);
        // Must not panic
        tx.attach(SurfaceId(1), BufferId(1));
        tx.commit(SurfaceId(1));
    }

    #[test]
    fn test_feedback_serializes_with_kind_tag() {
        let json = serde_json::to_value(PresentationFeedback::failure()).unwrap();
        assert_eq!(json["kind"], "discarded");
        assert!(PresentationFeedback::synthetic().is_presented());
    }

    #[test]
    fn test_event_surface_routing_key() {
        let event = CompositorEvent::BufferRelease {
            surface: SurfaceId(9),
            buffer: BufferId(1),
        };
        assert_eq!(event.surface(), SurfaceId(9));
        assert_eq!(CompositorEvent::FrameDone { surface: SurfaceId(3) }.surface(), SurfaceId(3));
    }
}
