//! Asynchronous buffer host service
//!
//! Runs the host as a set of tokio tasks:
//!
//! - a **router** that owns the surface table, accepts client requests and
//!   compositor events and forwards them by [`SurfaceId`],
//! - one **surface task** per surface that owns its [`SurfaceStateMachine`]
//!   and processes its messages strictly in arrival order.
//!
//! Client requests carry a oneshot reply; notifications produced while
//! handling a request are sent to the client channel before the reply.
//! Compositor events are fire-and-forget.

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::{apply_surface_request, forward_notifications, RequestOutcome};
use crate::buffer::BufferParams;
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::protocol::{
    BufferId, ClientNotification, ClientRequest, CompositorEvent, CompositorRequest,
    ProtocolWarning, Rect, SurfaceId,
};
use crate::surface::{stall_check_interval, CommitDisposition, SurfaceStateMachine};

type Reply = oneshot::Sender<HostResult<RequestOutcome>>;

/// Service-wide counters, readable while the service runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub live_surfaces: usize,
    pub requests_routed: u64,
    pub events_routed: u64,
    pub events_discarded: u64,
    pub surfaces_torn_down: u64,
}

enum SurfaceMessage {
    Request(ClientRequest, Reply),
    Event(CompositorEvent),
}

struct SurfaceTask {
    generation: u64,
    tx: mpsc::UnboundedSender<SurfaceMessage>,
    handle: JoinHandle<()>,
}

/// The router task state
pub struct BufferHostService {
    config: HostConfig,
    compositor: mpsc::UnboundedSender<CompositorRequest>,
    client: mpsc::UnboundedSender<ClientNotification>,
    surfaces: HashMap<SurfaceId, SurfaceTask>,
    next_generation: u64,
    retired_tx: mpsc::UnboundedSender<(SurfaceId, u64)>,
    /// Tasks of destroyed surfaces that may still be draining
    finishing: Vec<JoinHandle<()>>,
    stats: Arc<RwLock<ServiceStats>>,
}

/// Client-side handle to a running [`BufferHostService`]
///
/// Dropping the handle stops the service and fails outstanding commits.
pub struct BufferHostHandle {
    requests: mpsc::UnboundedSender<(ClientRequest, Reply)>,
    events: mpsc::UnboundedSender<CompositorEvent>,
    shutdown: mpsc::Sender<()>,
    stats: Arc<RwLock<ServiceStats>>,
    task: Option<JoinHandle<()>>,
}

impl BufferHostService {
    /// Spawns the router on the current tokio runtime
    pub fn spawn(
        config: HostConfig,
        compositor: mpsc::UnboundedSender<CompositorRequest>,
        client: mpsc::UnboundedSender<ClientNotification>,
    ) -> BufferHostHandle {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(ServiceStats::default()));

        let service = Self {
            config,
            compositor,
            client,
            surfaces: HashMap::new(),
            next_generation: 0,
            retired_tx,
            finishing: Vec::new(),
            stats: Arc::clone(&stats),
        };

        let task = tokio::spawn(service.run(requests_rx, events_rx, retired_rx, shutdown_rx));
        info!("🚀 Buffer host service started");

        BufferHostHandle {
            requests: requests_tx,
            events: events_tx,
            shutdown: shutdown_tx,
            stats,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<(ClientRequest, Reply)>,
        mut events: mpsc::UnboundedReceiver<CompositorEvent>,
        mut retired: mpsc::UnboundedReceiver<(SurfaceId, u64)>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                Some((request, reply)) = requests.recv() => self.route_request(request, reply),
                Some(event) = events.recv() => self.route_event(event),
                Some((id, generation)) = retired.recv() => self.retire(id, generation),
                else => break,
            }
        }

        self.shutdown().await;
    }

    fn route_request(&mut self, request: ClientRequest, reply: Reply) {
        self.stats.write().requests_routed += 1;
        let id = request.surface();

        if let ClientRequest::CreateSurface { surface } = request {
            let result = self.spawn_surface(surface).map(|_| RequestOutcome::Done);
            let _ = reply.send(result);
            return;
        }

        let destroy = matches!(request, ClientRequest::DestroySurface { .. });
        let Some(task) = self.surfaces.get(&id) else {
            let _ = reply.send(Err(HostError::UnknownSurface(id)));
            return;
        };

        if let Err(mpsc::error::SendError(message)) = task.tx.send(SurfaceMessage::Request(request, reply)) {
            // The task already retired itself; the table update is still queued
            if let SurfaceMessage::Request(_, reply) = message {
                let _ = reply.send(Err(HostError::UnknownSurface(id)));
            }
            return;
        }

        if destroy {
            if let Some(task) = self.surfaces.remove(&id) {
                self.finishing.push(task.handle);
            }
            self.stats.write().live_surfaces = self.surfaces.len();
        }
    }

    fn route_event(&mut self, event: CompositorEvent) {
        let id = event.surface();
        let delivered = match self.surfaces.get(&id) {
            Some(task) => task.tx.send(SurfaceMessage::Event(event)).is_ok(),
            None => {
                debug!("Dropping {:?} for unknown {}", event, id);
                false
            }
        };

        let mut stats = self.stats.write();
        if delivered {
            stats.events_routed += 1;
        } else {
            stats.events_discarded += 1;
        }
    }

    fn spawn_surface(&mut self, id: SurfaceId) -> HostResult<()> {
        if self.surfaces.contains_key(&id) {
            return Err(HostError::SurfaceExists(id));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SurfaceWorker {
            machine: SurfaceStateMachine::new(id, &self.config),
            compositor: self.compositor.clone(),
            client: self.client.clone(),
            retired: self.retired_tx.clone(),
            generation,
        };
        let interval = stall_check_interval(&self.config.surface);
        let handle = tokio::spawn(worker.run(rx, interval));

        self.surfaces.insert(id, SurfaceTask { generation, tx, handle });
        self.stats.write().live_surfaces = self.surfaces.len();
        debug!("Spawned task for {} (generation {})", id, generation);
        Ok(())
    }

    fn retire(&mut self, id: SurfaceId, generation: u64) {
        let current = self
            .surfaces
            .get(&id)
            .map_or(false, |task| task.generation == generation);
        if current {
            if let Some(task) = self.surfaces.remove(&id) {
                self.finishing.push(task.handle);
            }
        }

        let mut stats = self.stats.write();
        stats.surfaces_torn_down += 1;
        stats.live_surfaces = self.surfaces.len();
    }

    async fn shutdown(mut self) {
        info!("🛑 Shutting down buffer host service ({} surfaces)", self.surfaces.len());

        // Closing a surface channel makes its task fail what is in flight and exit
        let mut handles: Vec<_> = self.surfaces.drain().map(|(_, task)| task.handle).collect();
        handles.append(&mut self.finishing);

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Surface task ended abnormally: {}", e);
            }
        }

        self.stats.write().live_surfaces = 0;
    }
}

/// State owned by one surface task
struct SurfaceWorker {
    machine: SurfaceStateMachine,
    compositor: mpsc::UnboundedSender<CompositorRequest>,
    client: mpsc::UnboundedSender<ClientNotification>,
    retired: mpsc::UnboundedSender<(SurfaceId, u64)>,
    generation: u64,
}

impl SurfaceWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SurfaceMessage>, stall_interval: std::time::Duration) {
        let mut stall_timer = interval(stall_interval);
        stall_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_stall: Option<(BufferId, BufferId)> = None;

        loop {
            tokio::select! {
                biased;

                message = rx.recv() => match message {
                    Some(SurfaceMessage::Request(request, reply)) => {
                        let destroy = matches!(request, ClientRequest::DestroySurface { .. });
                        let result = apply_surface_request(&mut self.machine, request, &mut self.compositor);
                        forward_notifications(&mut self.machine, &mut self.client);
                        let _ = reply.send(result);
                        if destroy {
                            debug!("{} destroyed by client", self.machine.id());
                            return;
                        }
                    }
                    Some(SurfaceMessage::Event(event)) => {
                        self.machine.handle_event(&event, &mut self.compositor);
                        forward_notifications(&mut self.machine, &mut self.client);
                        if self.machine.has_fatal_faults() {
                            self.tear_down();
                            break;
                        }
                    }
                    None => {
                        self.machine.shutdown();
                        forward_notifications(&mut self.machine, &mut self.client);
                        return;
                    }
                },
                _ = stall_timer.tick() => {
                    match self.machine.check_stall(Instant::now()) {
                        Some(warning) => {
                            let ProtocolWarning::ReleaseStalled { buffer, waiting_on, .. } = &warning;
                            let key = (*buffer, *waiting_on);
                            // One warning per stalled submission
                            if last_stall != Some(key) {
                                warn!("⏳ {}", warning);
                                last_stall = Some(key);
                            }
                        }
                        None => last_stall = None,
                    }
                }
            }
        }

        self.reject_queued(&mut rx).await;
    }

    fn tear_down(&mut self) {
        let id = self.machine.id();
        error!(
            "❌ {} exceeded its compositor fault budget ({} faults), tearing it down",
            id,
            self.machine.faults().total()
        );
        self.machine.shutdown();
        forward_notifications(&mut self.machine, &mut self.client);
        let _ = self.retired.send((id, self.generation));
    }

    /// Answers requests routed here before the router saw the teardown
    async fn reject_queued(&self, rx: &mut mpsc::UnboundedReceiver<SurfaceMessage>) {
        let id = self.machine.id();
        rx.close();
        while let Some(message) = rx.recv().await {
            match message {
                SurfaceMessage::Request(_, reply) => {
                    let _ = reply.send(Err(HostError::UnknownSurface(id)));
                }
                SurfaceMessage::Event(event) => debug!("Dropping {:?} for torn down {}", event, id),
            }
        }
    }
}

impl BufferHostHandle {
    /// Sends a raw client request and waits for its outcome
    pub async fn request(&self, request: ClientRequest) -> HostResult<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((request, tx))
            .map_err(|_| HostError::ServiceStopped)?;
        rx.await.map_err(|_| HostError::ServiceStopped)?
    }

    pub async fn create_surface(&self, surface: SurfaceId) -> HostResult<()> {
        self.request(ClientRequest::CreateSurface { surface }).await.map(|_| ())
    }

    pub async fn destroy_surface(&self, surface: SurfaceId) -> HostResult<()> {
        self.request(ClientRequest::DestroySurface { surface }).await.map(|_| ())
    }

    pub async fn create_buffer(&self, surface: SurfaceId, buffer: BufferId, params: BufferParams) -> HostResult<()> {
        self.request(ClientRequest::CreateBuffer {
            surface,
            buffer,
            params,
        })
        .await
        .map(|_| ())
    }

    pub async fn destroy_buffer(&self, surface: SurfaceId, buffer: BufferId) -> HostResult<()> {
        self.request(ClientRequest::DestroyBuffer { surface, buffer })
            .await
            .map(|_| ())
    }

    pub async fn commit_buffer(
        &self,
        surface: SurfaceId,
        buffer: BufferId,
        damage: Rect,
    ) -> HostResult<CommitDisposition> {
        match self
            .request(ClientRequest::CommitBuffer {
                surface,
                buffer,
                damage,
            })
            .await?
        {
            RequestOutcome::Commit(disposition) => Ok(disposition),
            RequestOutcome::Done => Ok(CommitDisposition::Completed),
        }
    }

    /// Sender for the compositor side of the transport
    pub fn event_sender(&self) -> mpsc::UnboundedSender<CompositorEvent> {
        self.events.clone()
    }

    pub fn send_event(&self, event: CompositorEvent) -> HostResult<()> {
        self.events.send(event).map_err(|_| HostError::ServiceStopped)
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats.read().clone()
    }

    /// Stops the service, failing whatever is still in flight
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(()).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Buffer host service ended abnormally: {}", e);
            }
        }
    }
}
