// Submission lifecycle integration tests for the Axiom buffer host
//
// Drives the synchronous host through complete commit/release/frame cycles
// and checks the completion guarantees seen by the GPU client.

use axiom_buffer_host::{
    BufferFormat, BufferId, BufferManagerHost, BufferParams, ClientNotification, CommitDisposition,
    CompositorEvent, CompositorRequest, HostConfig, HostError, PresentationFeedback, Rect,
    Scenario, SubmissionResult, SurfaceId,
};
use proptest::prelude::*;
use std::time::Duration;

type RecordingHost = BufferManagerHost<Vec<CompositorRequest>, Vec<ClientNotification>>;

const SURFACE: SurfaceId = SurfaceId(1);

fn host_with(config: HostConfig, buffers: &[u32]) -> RecordingHost {
    let mut host = BufferManagerHost::new(config, Vec::new(), Vec::new());
    host.create_surface(SURFACE).unwrap();
    for &id in buffers {
        host.create_buffer(SURFACE, BufferId(id), BufferParams::shm(128, 128, BufferFormat::Argb8888))
            .unwrap();
    }
    host
}

fn submissions_of(host: &RecordingHost, buffer: u32) -> Vec<SubmissionResult> {
    host.client()
        .iter()
        .filter_map(|n| match n {
            ClientNotification::Submission { buffer: b, result, .. } if *b == BufferId(buffer) => Some(*result),
            _ => None,
        })
        .collect()
}

fn release(host: &mut RecordingHost, buffer: u32) {
    host.handle_event(CompositorEvent::BufferRelease {
        surface: SURFACE,
        buffer: BufferId(buffer),
    });
}

fn frame_done(host: &mut RecordingHost) {
    host.handle_event(CompositorEvent::FrameDone { surface: SURFACE });
}

#[test]
fn test_reference_behaviour() {
    let mut host = host_with(HostConfig::default(), &[1, 2]);

    assert_eq!(
        host.commit_buffer(SURFACE, BufferId(1), Rect::default()).unwrap(),
        CommitDisposition::Completed
    );
    assert_eq!(submissions_of(&host, 1), vec![SubmissionResult::Success]);

    frame_done(&mut host);
    host.commit_buffer(SURFACE, BufferId(2), Rect::default()).unwrap();
    assert!(submissions_of(&host, 2).is_empty());

    release(&mut host, 1);
    frame_done(&mut host);
    assert_eq!(submissions_of(&host, 2), vec![SubmissionResult::Success]);

    assert_eq!(
        host.commit_buffer(SURFACE, BufferId(2), Rect::default()).unwrap(),
        CommitDisposition::Completed
    );
    assert_eq!(submissions_of(&host, 2).len(), 2);
}

#[test]
fn test_first_commit_needs_no_compositor_events() {
    let mut host = host_with(HostConfig::default(), &[5]);
    host.commit_buffer(SURFACE, BufferId(5), Rect::from_size(128, 128)).unwrap();

    assert_eq!(submissions_of(&host, 5), vec![SubmissionResult::Success]);
    assert_eq!(host.stats().events_routed, 0);
}

#[test]
fn test_destroy_rejected_until_release() {
    let mut config = HostConfig::default();
    config.surface.throttle_on_frame_callback = false;
    let mut host = host_with(config, &[1, 2]);

    host.commit_buffer(SURFACE, BufferId(1), Rect::default()).unwrap();
    host.commit_buffer(SURFACE, BufferId(2), Rect::default()).unwrap();

    assert_eq!(
        host.destroy_buffer(SURFACE, BufferId(1)),
        Err(HostError::BufferInUse {
            surface: SURFACE,
            buffer: BufferId(1),
        })
    );

    release(&mut host, 1);
    assert_eq!(host.destroy_buffer(SURFACE, BufferId(1)), Ok(()));
    assert!(host.surface(SURFACE).unwrap().registry().get(BufferId(1)).is_none());
}

#[test]
fn test_invalid_buffer_parameters_rejected() {
    let mut host = host_with(HostConfig::default(), &[]);

    let result = host.create_buffer(SURFACE, BufferId(1), BufferParams::shm(0, 64, BufferFormat::Rgb565));
    assert!(matches!(result, Err(HostError::BufferCreate(_))));

    host.create_buffer(SURFACE, BufferId(1), BufferParams::dmabuf(64, 64, BufferFormat::Nv12))
        .unwrap();
    assert!(matches!(
        host.create_buffer(SURFACE, BufferId(1), BufferParams::dmabuf(64, 64, BufferFormat::Nv12)),
        Err(HostError::BufferCreate(_))
    ));
}

#[test]
fn test_compositor_call_sequence_for_one_commit() {
    let mut host = host_with(HostConfig::default(), &[1]);
    host.commit_buffer(SURFACE, BufferId(1), Rect::new(4, 4, 16, 16)).unwrap();

    assert_eq!(
        host.compositor().as_slice(),
        &[
            CompositorRequest::Attach {
                surface: SURFACE,
                buffer: BufferId(1),
            },
            CompositorRequest::Damage {
                surface: SURFACE,
                region: Rect::new(4, 4, 16, 16),
            },
            CompositorRequest::FrameCallback { surface: SURFACE },
            CompositorRequest::PresentationFeedback {
                surface: SURFACE,
                buffer: BufferId(1),
            },
            CompositorRequest::Commit { surface: SURFACE },
        ]
    );
}

#[test]
fn test_demo_scenarios_pass() {
    for source in [
        include_str!("../demos/reference.toml"),
        include_str!("../demos/triple_buffering.toml"),
    ] {
        let scenario = Scenario::parse(source).unwrap();

        for throttle in [true, false] {
            let mut config = HostConfig::default();
            config.surface.throttle_on_frame_callback = throttle;
            let report = scenario.run(&config);

            assert!(
                report.passed(),
                "{} (throttle: {}): {:?}",
                report.name,
                throttle,
                report.expectation_failures
            );
            assert!(report.errors.is_empty(), "{:?}", report.errors);
        }
    }
}

#[test]
fn test_builtin_reference_matches_demo_file() {
    let from_file = Scenario::parse(include_str!("../demos/reference.toml")).unwrap();
    assert_eq!(from_file, Scenario::reference());
}

#[derive(Debug, Clone)]
enum Op {
    Commit(u32),
    Destroy(u32),
    Release(u32),
    FrameDone,
    Presented(u32),
    Discarded(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u32..4).prop_map(Op::Commit),
        1 => (1u32..4).prop_map(Op::Destroy),
        4 => (1u32..4).prop_map(Op::Release),
        3 => Just(Op::FrameDone),
        2 => (1u32..4).prop_map(Op::Presented),
        1 => (1u32..4).prop_map(Op::Discarded),
    ]
}

proptest! {
    #[test]
    fn test_every_accepted_commit_completes_exactly_once(
        ops in prop::collection::vec(op(), 1..80),
        throttle in any::<bool>(),
        presentation in any::<bool>(),
        max_faults in prop_oneof![Just(3u32), Just(1000u32)],
    ) {
        let mut config = HostConfig::default();
        config.surface.throttle_on_frame_callback = throttle;
        config.presentation.enabled = presentation;
        config.surface.max_protocol_faults = max_faults;
        let mut host = host_with(config, &[1, 2, 3]);

        let mut accepted = Vec::new();
        for op in ops {
            match op {
                Op::Commit(b) => {
                    if host.commit_buffer(SURFACE, BufferId(b), Rect::default()).is_ok() {
                        accepted.push(BufferId(b));
                    }
                }
                Op::Destroy(b) => {
                    let _ = host.destroy_buffer(SURFACE, BufferId(b));
                }
                Op::Release(b) => release(&mut host, b),
                Op::FrameDone => frame_done(&mut host),
                Op::Presented(b) => host.handle_event(CompositorEvent::Presentation {
                    surface: SURFACE,
                    buffer: BufferId(b),
                    feedback: PresentationFeedback::Presented {
                        timestamp: Duration::from_millis(16),
                        refresh: Duration::from_millis(16),
                        sequence: 1,
                        flags: Default::default(),
                    },
                }),
                Op::Discarded(b) => host.handle_event(CompositorEvent::Presentation {
                    surface: SURFACE,
                    buffer: BufferId(b),
                    feedback: PresentationFeedback::Discarded,
                }),
            }
        }

        // Tearing the surface down resolves whatever is still outstanding
        let _ = host.destroy_surface(SURFACE);

        let submitted: Vec<BufferId> = host
            .client()
            .iter()
            .filter(|n| n.is_submission())
            .map(|n| n.buffer())
            .collect();
        let presented: Vec<BufferId> = host
            .client()
            .iter()
            .filter(|n| !n.is_submission())
            .map(|n| n.buffer())
            .collect();

        prop_assert_eq!(&submitted, &accepted);
        prop_assert_eq!(&presented, &accepted);

        // Each presentation follows its own submission
        let mut submissions_seen = 0;
        let mut presentations_seen = 0;
        for notification in host.client() {
            if notification.is_submission() {
                submissions_seen += 1;
            } else {
                presentations_seen += 1;
                prop_assert!(presentations_seen <= submissions_seen);
            }
        }
    }

    #[test]
    fn test_resubmission_never_waits(repeats in 2usize..6) {
        let mut config = HostConfig::default();
        config.surface.throttle_on_frame_callback = false;
        let mut host = host_with(config, &[1, 2]);

        host.commit_buffer(SURFACE, BufferId(1), Rect::default()).unwrap();
        host.commit_buffer(SURFACE, BufferId(2), Rect::default()).unwrap();
        release(&mut host, 1);

        for _ in 0..repeats {
            prop_assert_eq!(
                host.commit_buffer(SURFACE, BufferId(2), Rect::default()).unwrap(),
                CommitDisposition::Completed
            );
        }
        prop_assert_eq!(submissions_of(&host, 2).len(), repeats + 1);
    }
}
