//! Scripted scenario replay
//!
//! A scenario is a TOML list of client requests, compositor events and
//! expectations. It is replayed through a [`BufferManagerHost`] wired to
//! recording proxies so every outbound compositor call and every client
//! notification can be inspected afterwards.
//!
//! ```toml
//! name = "double buffering"
//!
//! [[steps]]
//! action = "create_surface"
//! surface = 1
//!
//! [[steps]]
//! action = "create_buffer"
//! surface = 1
//! buffer = 1
//!
//! [[steps]]
//! action = "commit"
//! surface = 1
//! buffer = 1
//!
//! [[steps]]
//! action = "expect"
//! surface = 1
//! buffer = 1
//! submissions = 1
//! ```

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::buffer::{BufferFormat, BufferParams};
use crate::config::HostConfig;
use crate::error::HostResult;
use crate::host::BufferManagerHost;
use crate::protocol::{
    BufferId, ClientNotification, CompositorEvent, CompositorRequest, PresentationFeedback,
    PresentationFlags, Rect, SurfaceId,
};

fn default_width() -> u32 {
    256
}

fn default_height() -> u32 {
    256
}

/// One scripted action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    CreateSurface {
        surface: SurfaceId,
    },
    DestroySurface {
        surface: SurfaceId,
    },
    /// Creates a shared-memory buffer
    CreateBuffer {
        surface: SurfaceId,
        buffer: BufferId,
        #[serde(default = "default_width")]
        width: u32,
        #[serde(default = "default_height")]
        height: u32,
        #[serde(default)]
        format: Option<BufferFormat>,
    },
    DestroyBuffer {
        surface: SurfaceId,
        buffer: BufferId,
    },
    Commit {
        surface: SurfaceId,
        buffer: BufferId,
        #[serde(default)]
        damage: Option<Rect>,
    },
    /// Compositor: wl_buffer.release
    Release {
        surface: SurfaceId,
        buffer: BufferId,
    },
    /// Compositor: frame callback done
    FrameDone {
        surface: SurfaceId,
    },
    /// Compositor: presentation feedback `presented`
    Presented {
        surface: SurfaceId,
        buffer: BufferId,
        timestamp_us: u64,
        #[serde(default)]
        refresh_us: u64,
        #[serde(default)]
        sequence: u64,
    },
    /// Compositor: presentation feedback `discarded`
    Discarded {
        surface: SurfaceId,
        buffer: BufferId,
    },
    /// Checks how many `OnSubmission`s were delivered for a buffer so far
    Expect {
        surface: SurfaceId,
        buffer: BufferId,
        submissions: usize,
        #[serde(default)]
        presentations: Option<usize>,
    },
}

/// A named sequence of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A step that failed, by position in the scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: usize,
    pub message: String,
}

/// A commit that never produced `OnSubmission` during the replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutstandingCommit {
    pub surface: SurfaceId,
    pub buffer: BufferId,
    /// Still held as the pending commit rather than dispatched
    pub queued: bool,
}

/// Everything observed while replaying a scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub notifications: Vec<ClientNotification>,
    pub compositor_calls: Vec<CompositorRequest>,
    /// Requests the host rejected
    pub errors: Vec<StepFailure>,
    pub expectation_failures: Vec<StepFailure>,
    pub outstanding: Vec<OutstandingCommit>,
    pub faults: u64,
}

impl ScenarioReport {
    /// No expectation failed and every commit completed
    pub fn passed(&self) -> bool {
        self.expectation_failures.is_empty() && self.outstanding.is_empty()
    }

    pub fn submissions(&self) -> usize {
        self.notifications.iter().filter(|n| n.is_submission()).count()
    }
}

impl Scenario {
    /// Load a scenario from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse scenario file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(contents)?;
        Ok(scenario)
    }

    /// Double buffering on a single surface, ending with a resubmission
    pub fn reference() -> Self {
        let surface = SurfaceId(1);
        let (first, second) = (BufferId(1), BufferId(2));
        let create = |buffer| Step::CreateBuffer {
            surface,
            buffer,
            width: default_width(),
            height: default_height(),
            format: None,
        };
        let commit = |buffer| Step::Commit {
            surface,
            buffer,
            damage: None,
        };
        let expect = |buffer, submissions| Step::Expect {
            surface,
            buffer,
            submissions,
            presentations: None,
        };

        Self {
            name: "reference".to_string(),
            steps: vec![
                Step::CreateSurface { surface },
                create(first),
                create(second),
                commit(first),
                expect(first, 1),
                Step::FrameDone { surface },
                commit(second),
                expect(second, 0),
                Step::Release {
                    surface,
                    buffer: first,
                },
                Step::FrameDone { surface },
                expect(second, 1),
                commit(second),
                expect(second, 2),
            ],
        }
    }

    /// Replays the scenario against a fresh host
    pub fn run(&self, config: &HostConfig) -> ScenarioReport {
        info!("🎬 Running scenario '{}' ({} steps)", self.name, self.steps.len());

        let mut host = BufferManagerHost::new(config.clone(), Vec::new(), Vec::new());
        let mut errors = Vec::new();
        let mut expectation_failures = Vec::new();
        let mut calls_seen = 0;
        let mut notifications_seen = 0;

        for (index, step) in self.steps.iter().enumerate() {
            debug!("Step {}: {:?}", index, step);

            match run_step(&mut host, step) {
                Ok(Some(failure)) => {
                    warn!("❌ Step {}: {}", index, failure);
                    expectation_failures.push(StepFailure {
                        step: index,
                        message: failure,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Step {} rejected: {}", index, e);
                    errors.push(StepFailure {
                        step: index,
                        message: e.to_string(),
                    });
                }
            }

            for call in &host.compositor()[calls_seen..] {
                debug!("  → compositor {:?}", call);
            }
            calls_seen = host.compositor().len();

            for notification in &host.client()[notifications_seen..] {
                info!("  ← client {:?}", notification);
            }
            notifications_seen = host.client().len();
        }

        let mut outstanding = Vec::new();
        let mut faults = 0;
        for id in host.surface_ids() {
            let Some(surface) = host.surface(id) else {
                continue;
            };
            faults += surface.faults().total();
            if let Some(buffer) = surface.submitted_buffer() {
                outstanding.push(OutstandingCommit {
                    surface: id,
                    buffer,
                    queued: false,
                });
            }
            if let Some(buffer) = surface.pending_buffer() {
                outstanding.push(OutstandingCommit {
                    surface: id,
                    buffer,
                    queued: true,
                });
            }
        }

        ScenarioReport {
            name: self.name.clone(),
            notifications: host.client().clone(),
            compositor_calls: host.compositor().clone(),
            errors,
            expectation_failures,
            outstanding,
            faults,
        }
    }
}

type RecordingHost = BufferManagerHost<Vec<CompositorRequest>, Vec<ClientNotification>>;

/// Runs one step; `Ok(Some(..))` describes a failed expectation
fn run_step(host: &mut RecordingHost, step: &Step) -> HostResult<Option<String>> {
    match *step {
        Step::CreateSurface { surface } => host.create_surface(surface)?,
        Step::DestroySurface { surface } => host.destroy_surface(surface)?,
        Step::CreateBuffer {
            surface,
            buffer,
            width,
            height,
            format,
        } => {
            let params = BufferParams::shm(width, height, format.unwrap_or(BufferFormat::Argb8888));
            host.create_buffer(surface, buffer, params)?
        }
        Step::DestroyBuffer { surface, buffer } => host.destroy_buffer(surface, buffer)?,
        Step::Commit {
            surface,
            buffer,
            damage,
        } => {
            let disposition = host.commit_buffer(surface, buffer, damage.unwrap_or_default())?;
            debug!("  {} on {}: {:?}", buffer, surface, disposition);
        }
        Step::Release { surface, buffer } => {
            host.handle_event(CompositorEvent::BufferRelease { surface, buffer })
        }
        Step::FrameDone { surface } => host.handle_event(CompositorEvent::FrameDone { surface }),
        Step::Presented {
            surface,
            buffer,
            timestamp_us,
            refresh_us,
            sequence,
        } => host.handle_event(CompositorEvent::Presentation {
            surface,
            buffer,
            feedback: PresentationFeedback::Presented {
                timestamp: Duration::from_micros(timestamp_us),
                refresh: Duration::from_micros(refresh_us),
                sequence,
                flags: PresentationFlags::VSYNC,
            },
        }),
        Step::Discarded { surface, buffer } => host.handle_event(CompositorEvent::Presentation {
            surface,
            buffer,
            feedback: PresentationFeedback::Discarded,
        }),
        Step::Expect {
            surface,
            buffer,
            submissions,
            presentations,
        } => {
            let matching = |want_submission: bool| {
                host.client()
                    .iter()
                    .filter(|n| n.surface() == surface && n.buffer() == buffer)
                    .filter(|n| n.is_submission() == want_submission)
                    .count()
            };

            let seen = matching(true);
            if seen != submissions {
                return Ok(Some(format!(
                    "expected {} submissions of {} on {}, saw {}",
                    submissions, buffer, surface, seen
                )));
            }
            if let Some(expected) = presentations {
                let seen = matching(false);
                if seen != expected {
                    return Ok(Some(format!(
                        "expected {} presentations of {} on {}, saw {}",
                        expected, buffer, surface, seen
                    )));
                }
            }
        }
    }

    Ok(None)
}
