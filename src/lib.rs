//! # Axiom Buffer Host
//!
//! Per-surface buffer submission and completion tracking for a GPU client
//! that presents through a Wayland compositor.
//!
//! ## Architecture
//!
//! - `protocol`: identifiers, compositor/client messages and proxy traits
//! - `buffer`: buffer parameters, release state and the per-surface registry
//! - `surface`: the submission state machine (commit, release, frame, feedback)
//! - `host`: routing by surface id, synchronously or as a tokio service
//! - `config`: TOML configuration
//! - `scenario`: scripted replays used by the CLI and tests
//!
//! ## Usage
//!
//! ```rust
//! use axiom_buffer_host::{
//!     BufferFormat, BufferId, BufferManagerHost, BufferParams, ClientNotification,
//!     CommitDisposition, CompositorRequest, HostConfig, Rect, SurfaceId,
//! };
//!
//! let mut host = BufferManagerHost::new(
//!     HostConfig::default(),
//!     Vec::<CompositorRequest>::new(),
//!     Vec::<ClientNotification>::new(),
//! );
//! host.create_surface(SurfaceId(1)).unwrap();
//! host.create_buffer(SurfaceId(1), BufferId(1), BufferParams::shm(64, 64, BufferFormat::Argb8888))
//!     .unwrap();
//!
//! // The first commit on a surface completes immediately
//! let disposition = host.commit_buffer(SurfaceId(1), BufferId(1), Rect::default()).unwrap();
//! assert_eq!(disposition, CommitDisposition::Completed);
//! assert_eq!(host.client().len(), 1);
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod scenario;
pub mod surface;

// Re-export main types for easy access
pub use buffer::{BufferFormat, BufferKind, BufferParams, BufferRegistry, BufferState};
pub use config::HostConfig;
pub use error::{BufferCreateError, HostError, HostResult};
pub use host::{BufferHostHandle, BufferHostService, BufferManagerHost, RequestOutcome};
pub use protocol::{
    BufferId, ClientNotification, ClientRequest, CompositorEvent, CompositorProxy,
    CompositorRequest, GpuClientProxy, PresentationFeedback, Rect, SubmissionResult, SurfaceId,
};
pub use scenario::{Scenario, ScenarioReport};
pub use surface::{CommitDisposition, SurfaceStateMachine};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
