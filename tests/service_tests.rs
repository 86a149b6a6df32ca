// Async buffer host service tests
//
// Exercises the router and per-surface tasks over real tokio channels:
// request replies, event routing, surface teardown and shutdown.

use axiom_buffer_host::{
    BufferFormat, BufferHostHandle, BufferHostService, BufferId, BufferParams, ClientNotification,
    CommitDisposition, CompositorEvent, CompositorRequest, HostConfig, HostError, Rect,
    SubmissionResult, SurfaceId,
};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{sleep, timeout};

const SURFACE: SurfaceId = SurfaceId(1);

struct Harness {
    host: BufferHostHandle,
    compositor: UnboundedReceiver<CompositorRequest>,
    client: UnboundedReceiver<ClientNotification>,
}

fn spawn(config: HostConfig) -> Harness {
    let (compositor_tx, compositor) = unbounded_channel();
    let (client_tx, client) = unbounded_channel();
    Harness {
        host: BufferHostService::spawn(config, compositor_tx, client_tx),
        compositor,
        client,
    }
}

fn unthrottled() -> HostConfig {
    let mut config = HostConfig::default();
    config.surface.throttle_on_frame_callback = false;
    config
}

async fn setup_surface(host: &BufferHostHandle, buffers: &[u32]) {
    host.create_surface(SURFACE).await.unwrap();
    for &id in buffers {
        host.create_buffer(SURFACE, BufferId(id), BufferParams::shm(64, 64, BufferFormat::Argb8888))
            .await
            .unwrap();
    }
}

async fn next_notification(client: &mut UnboundedReceiver<ClientNotification>) -> ClientNotification {
    timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("client channel closed")
}

/// Next `OnSubmission`, skipping presentations
async fn next_submission(client: &mut UnboundedReceiver<ClientNotification>) -> (BufferId, SubmissionResult) {
    loop {
        if let ClientNotification::Submission { buffer, result, .. } = next_notification(client).await {
            return (buffer, result);
        }
    }
}

#[tokio::test]
async fn test_reference_flow_through_service() {
    let mut h = spawn(unthrottled());
    setup_surface(&h.host, &[1, 2]).await;

    let disposition = h.host.commit_buffer(SURFACE, BufferId(1), Rect::default()).await.unwrap();
    assert_eq!(disposition, CommitDisposition::Completed);
    assert_eq!(next_submission(&mut h.client).await, (BufferId(1), SubmissionResult::Success));

    let disposition = h.host.commit_buffer(SURFACE, BufferId(2), Rect::default()).await.unwrap();
    assert_eq!(disposition, CommitDisposition::AwaitingRelease);

    h.host
        .send_event(CompositorEvent::BufferRelease {
            surface: SURFACE,
            buffer: BufferId(1),
        })
        .unwrap();
    assert_eq!(next_submission(&mut h.client).await, (BufferId(2), SubmissionResult::Success));

    let disposition = h.host.commit_buffer(SURFACE, BufferId(2), Rect::default()).await.unwrap();
    assert_eq!(disposition, CommitDisposition::Completed);
    assert_eq!(next_submission(&mut h.client).await, (BufferId(2), SubmissionResult::Success));

    h.host.shutdown().await;
}

#[tokio::test]
async fn test_compositor_receives_calls_in_order() {
    let mut h = spawn(HostConfig::default());
    setup_surface(&h.host, &[3]).await;

    h.host.commit_buffer(SURFACE, BufferId(3), Rect::default()).await.unwrap();

    let mut calls = Vec::new();
    while let Ok(call) = h.compositor.try_recv() {
        calls.push(call);
    }
    assert_eq!(
        calls.first(),
        Some(&CompositorRequest::Attach {
            surface: SURFACE,
            buffer: BufferId(3),
        })
    );
    assert_eq!(calls.last(), Some(&CompositorRequest::Commit { surface: SURFACE }));
    assert_eq!(calls.len(), 5);

    h.host.shutdown().await;
}

#[tokio::test]
async fn test_request_errors_are_returned() {
    let h = spawn(HostConfig::default());

    assert_eq!(
        h.host.commit_buffer(SurfaceId(9), BufferId(1), Rect::default()).await,
        Err(HostError::UnknownSurface(SurfaceId(9)))
    );

    setup_surface(&h.host, &[1]).await;
    assert_eq!(
        h.host.create_surface(SURFACE).await,
        Err(HostError::SurfaceExists(SURFACE))
    );
    assert_eq!(
        h.host.commit_buffer(SURFACE, BufferId(7), Rect::default()).await,
        Err(HostError::UnknownBuffer {
            surface: SURFACE,
            buffer: BufferId(7),
        })
    );

    h.host.commit_buffer(SURFACE, BufferId(1), Rect::default()).await.unwrap();
    assert_eq!(
        h.host.destroy_buffer(SURFACE, BufferId(1)).await,
        Err(HostError::BufferInUse {
            surface: SURFACE,
            buffer: BufferId(1),
        })
    );

    h.host.shutdown().await;
}

#[tokio::test]
async fn test_destroy_surface_fails_outstanding_commit() {
    let mut h = spawn(unthrottled());
    setup_surface(&h.host, &[1, 2]).await;

    h.host.commit_buffer(SURFACE, BufferId(1), Rect::default()).await.unwrap();
    h.host.commit_buffer(SURFACE, BufferId(2), Rect::default()).await.unwrap();
    assert_eq!(next_submission(&mut h.client).await, (BufferId(1), SubmissionResult::Success));

    h.host.destroy_surface(SURFACE).await.unwrap();
    assert_eq!(next_submission(&mut h.client).await, (BufferId(2), SubmissionResult::Failure));

    assert_eq!(
        h.host.destroy_surface(SURFACE).await,
        Err(HostError::UnknownSurface(SURFACE))
    );

    // The id can be reused right away
    h.host.create_surface(SURFACE).await.unwrap();

    h.host.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_resolves_every_commit() {
    let Harness {
        host, mut client, ..
    } = spawn(unthrottled());
    setup_surface(&host, &[1, 2, 3]).await;

    host.commit_buffer(SURFACE, BufferId(1), Rect::default()).await.unwrap();
    host.commit_buffer(SURFACE, BufferId(2), Rect::default()).await.unwrap();
    let queued = host.commit_buffer(SURFACE, BufferId(3), Rect::default()).await.unwrap();
    assert_eq!(queued, CommitDisposition::Queued);

    host.shutdown().await;

    let mut notifications = Vec::new();
    while let Some(notification) = client.recv().await {
        notifications.push(notification);
    }

    let submissions: Vec<_> = notifications
        .iter()
        .filter_map(|n| match n {
            ClientNotification::Submission { buffer, result, .. } => Some((*buffer, *result)),
            _ => None,
        })
        .collect();
    assert_eq!(
        submissions,
        vec![
            (BufferId(1), SubmissionResult::Success),
            (BufferId(2), SubmissionResult::Failure),
            (BufferId(3), SubmissionResult::Failure),
        ]
    );
    assert_eq!(notifications.len(), 6);
}

#[tokio::test]
async fn test_misbehaving_compositor_tears_surface_down() {
    let mut config = HostConfig::default();
    config.surface.max_protocol_faults = 1;
    let h = spawn(config);
    setup_surface(&h.host, &[1]).await;

    // Frame callbacks nobody asked for
    for _ in 0..2 {
        h.host.send_event(CompositorEvent::FrameDone { surface: SURFACE }).unwrap();
    }

    let torn_down = timeout(Duration::from_secs(2), async {
        while h.host.stats().surfaces_torn_down == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(torn_down.is_ok(), "surface was never torn down");

    // The router processes the teardown before it sees this request
    let result = timeout(Duration::from_secs(2), async {
        loop {
            match h.host.commit_buffer(SURFACE, BufferId(1), Rect::default()).await {
                Err(HostError::UnknownSurface(_)) => break,
                _ => sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await;
    assert!(result.is_ok());
    assert_eq!(h.host.stats().live_surfaces, 0);

    h.host.shutdown().await;
}

#[tokio::test]
async fn test_request_racing_teardown_reports_unknown_surface() {
    for _ in 0..50 {
        let mut config = HostConfig::default();
        config.surface.max_protocol_faults = 1;
        let h = spawn(config);
        setup_surface(&h.host, &[1]).await;

        for _ in 0..2 {
            h.host.send_event(CompositorEvent::FrameDone { surface: SURFACE }).unwrap();
        }

        // Either handled before the teardown or rejected after it
        match h.host.destroy_buffer(SURFACE, BufferId(1)).await {
            Ok(()) | Err(HostError::UnknownSurface(_)) => {}
            Err(e) => panic!("request failed while the service was running: {:?}", e),
        }

        h.host.shutdown().await;
    }
}

#[tokio::test]
async fn test_events_for_unknown_surfaces_are_counted() {
    let h = spawn(HostConfig::default());
    let events = h.host.event_sender();

    events
        .send(CompositorEvent::FrameDone {
            surface: SurfaceId(42),
        })
        .unwrap();

    let counted = timeout(Duration::from_secs(2), async {
        while h.host.stats().events_discarded == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(counted.is_ok());

    h.host.shutdown().await;
}

#[tokio::test]
async fn test_surfaces_progress_independently() {
    let mut h = spawn(unthrottled());
    for surface in [SurfaceId(1), SurfaceId(2)] {
        h.host.create_surface(surface).await.unwrap();
        for id in [1, 2] {
            h.host
                .create_buffer(surface, BufferId(id), BufferParams::shm(32, 32, BufferFormat::Xrgb8888))
                .await
                .unwrap();
        }
        h.host.commit_buffer(surface, BufferId(1), Rect::default()).await.unwrap();
        h.host.commit_buffer(surface, BufferId(2), Rect::default()).await.unwrap();
    }

    // Only surface 2 gets its release
    h.host
        .send_event(CompositorEvent::BufferRelease {
            surface: SurfaceId(2),
            buffer: BufferId(1),
        })
        .unwrap();

    let mut completed = Vec::new();
    while completed.len() < 3 {
        match next_notification(&mut h.client).await {
            ClientNotification::Submission { surface, buffer, .. } => completed.push((surface, buffer)),
            _ => {}
        }
    }

    assert!(completed.contains(&(SurfaceId(2), BufferId(2))));
    assert!(!completed.contains(&(SurfaceId(1), BufferId(2))));
    assert_eq!(h.host.stats().live_surfaces, 2);

    h.host.shutdown().await;
}
