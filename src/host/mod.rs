//! Buffer manager host
//!
//! Owns one [`SurfaceStateMachine`] per surface and routes client requests
//! and compositor events to the right one by [`SurfaceId`]. Every
//! notification a surface produces is forwarded to the GPU client proxy
//! before the routing call returns.
//!
//! [`BufferManagerHost`] is the synchronous form; [`service`] runs the same
//! routing as a tokio actor with one task per surface.

pub mod service;

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::Instant;

use crate::buffer::BufferParams;
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::protocol::{
    BufferId, ClientRequest, CompositorEvent, CompositorProxy, GpuClientProxy, ProtocolWarning,
    Rect, SurfaceId,
};
use crate::surface::{CommitDisposition, SurfaceStateMachine};

pub use service::{BufferHostHandle, BufferHostService, ServiceStats};

/// Result of a successfully routed client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Done,
    Commit(CommitDisposition),
}

/// Host-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    pub surfaces_created: u64,
    pub surfaces_destroyed: u64,
    /// Surfaces removed because the compositor kept misbehaving
    pub surfaces_torn_down: u64,
    pub requests_routed: u64,
    pub events_routed: u64,
    pub events_discarded: u64,
}

pub struct BufferManagerHost<C: CompositorProxy, G: GpuClientProxy> {
    config: HostConfig,
    surfaces: HashMap<SurfaceId, SurfaceStateMachine>,
    compositor: C,
    client: G,
    stats: HostStats,
}

impl<C: CompositorProxy, G: GpuClientProxy> BufferManagerHost<C, G> {
    pub fn new(config: HostConfig, compositor: C, client: G) -> Self {
        info!(
            "🧩 Buffer host ready (throttle: {}, presentation: {})",
            config.surface.throttle_on_frame_callback, config.presentation.enabled
        );
        Self {
            config,
            surfaces: HashMap::new(),
            compositor,
            client,
            stats: HostStats::default(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn compositor(&self) -> &C {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut C {
        &mut self.compositor
    }

    pub fn client(&self) -> &G {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut G {
        &mut self.client
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&SurfaceStateMachine> {
        self.surfaces.get(&id)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    pub fn surface_ids(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<_> = self.surfaces.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn create_surface(&mut self, id: SurfaceId) -> HostResult<()> {
        if self.surfaces.contains_key(&id) {
            return Err(HostError::SurfaceExists(id));
        }
        self.surfaces.insert(id, SurfaceStateMachine::new(id, &self.config));
        self.stats.surfaces_created += 1;
        Ok(())
    }

    /// Removes a surface, failing whatever it still had in flight
    pub fn destroy_surface(&mut self, id: SurfaceId) -> HostResult<()> {
        let mut machine = self.surfaces.remove(&id).ok_or(HostError::UnknownSurface(id))?;
        machine.shutdown();
        forward_notifications(&mut machine, &mut self.client);
        self.stats.surfaces_destroyed += 1;
        Ok(())
    }

    pub fn create_buffer(&mut self, surface: SurfaceId, buffer: BufferId, params: BufferParams) -> HostResult<()> {
        self.handle_request(ClientRequest::CreateBuffer {
            surface,
            buffer,
            params,
        })
        .map(|_| ())
    }

    pub fn destroy_buffer(&mut self, surface: SurfaceId, buffer: BufferId) -> HostResult<()> {
        self.handle_request(ClientRequest::DestroyBuffer { surface, buffer })
            .map(|_| ())
    }

    pub fn commit_buffer(
        &mut self,
        surface: SurfaceId,
        buffer: BufferId,
        damage: Rect,
    ) -> HostResult<CommitDisposition> {
        match self.handle_request(ClientRequest::CommitBuffer {
            surface,
            buffer,
            damage,
        })? {
            RequestOutcome::Commit(disposition) => Ok(disposition),
            RequestOutcome::Done => Ok(CommitDisposition::Completed),
        }
    }

    /// Routes a client request to its surface
    pub fn handle_request(&mut self, request: ClientRequest) -> HostResult<RequestOutcome> {
        self.stats.requests_routed += 1;

        match request {
            ClientRequest::CreateSurface { surface } => {
                self.create_surface(surface).map(|_| RequestOutcome::Done)
            }
            ClientRequest::DestroySurface { surface } => {
                self.destroy_surface(surface).map(|_| RequestOutcome::Done)
            }
            request => {
                let id = request.surface();
                let machine = self
                    .surfaces
                    .get_mut(&id)
                    .ok_or(HostError::UnknownSurface(id))?;
                let outcome = apply_surface_request(machine, request, &mut self.compositor);
                forward_notifications(machine, &mut self.client);
                outcome
            }
        }
    }

    /// Routes a compositor event to its surface.
    ///
    /// Events for unknown surfaces are dropped; they race with surface
    /// destruction.
    pub fn handle_event(&mut self, event: CompositorEvent) {
        let id = event.surface();
        let Some(machine) = self.surfaces.get_mut(&id) else {
            debug!("Dropping {:?} for unknown {}", event, id);
            self.stats.events_discarded += 1;
            return;
        };

        self.stats.events_routed += 1;
        machine.handle_event(&event, &mut self.compositor);
        forward_notifications(machine, &mut self.client);

        if machine.has_fatal_faults() {
            error!(
                "❌ {} exceeded {} compositor faults, tearing it down",
                id, self.config.surface.max_protocol_faults
            );
            if let Some(mut machine) = self.surfaces.remove(&id) {
                machine.shutdown();
                forward_notifications(&mut machine, &mut self.client);
            }
            self.stats.surfaces_torn_down += 1;
        }
    }

    /// Collects release stall warnings across all surfaces
    pub fn check_stalls(&self, now: Instant) -> Vec<ProtocolWarning> {
        let mut warnings: Vec<_> = self
            .surfaces
            .values()
            .filter_map(|machine| machine.check_stall(now))
            .collect();
        warnings.sort_by_key(|w| match w {
            ProtocolWarning::ReleaseStalled { surface, .. } => *surface,
        });
        for warning in &warnings {
            warn!("⏳ {}", warning);
        }
        warnings
    }

    /// Shuts down every surface
    pub fn shutdown(&mut self) {
        let ids = self.surface_ids();
        for id in ids {
            if let Some(mut machine) = self.surfaces.remove(&id) {
                machine.shutdown();
                forward_notifications(&mut machine, &mut self.client);
                self.stats.surfaces_destroyed += 1;
            }
        }
        info!("🛑 Buffer host shut down");
    }
}

/// Applies a surface-scoped request to its state machine.
///
/// `DestroySurface` shuts the machine down; the caller is responsible for
/// dropping it afterwards.
pub(crate) fn apply_surface_request(
    machine: &mut SurfaceStateMachine,
    request: ClientRequest,
    compositor: &mut dyn CompositorProxy,
) -> HostResult<RequestOutcome> {
    match request {
        ClientRequest::CreateSurface { surface } => Err(HostError::SurfaceExists(surface)),
        ClientRequest::DestroySurface { .. } => {
            machine.shutdown();
            Ok(RequestOutcome::Done)
        }
        ClientRequest::CreateBuffer { buffer, params, .. } => {
            machine.create_buffer(buffer, params)?;
            Ok(RequestOutcome::Done)
        }
        ClientRequest::DestroyBuffer { buffer, .. } => {
            machine.destroy_buffer(buffer)?;
            Ok(RequestOutcome::Done)
        }
        ClientRequest::CommitBuffer { buffer, damage, .. } => machine
            .commit_buffer(buffer, damage, compositor)
            .map(RequestOutcome::Commit),
    }
}

pub(crate) fn forward_notifications(machine: &mut SurfaceStateMachine, client: &mut dyn GpuClientProxy) {
    for notification in machine.drain_notifications() {
        notification.deliver(client);
    }
}
