//! Status sync gate and mirror merging against a stub publisher.

mod support;

use std::time::Duration;

use machinetalk::application::ApplicationStatus;
use machinetalk::StatusState;
use machinetalk_proto::{
    Container, ContainerType, EmcStatusConfig, EmcStatusInterp, EmcStatusIo, EmcStatusMotion,
    EmcStatusTask, InterpreterState, MotionAxis, Position, TaskMode,
};
use support::StubPublisher;

fn full_update_for(topic: &str) -> Container {
    let mut container = Container::with_type(ContainerType::MtEmcstatFullUpdate);
    match topic {
        "motion" => {
            container.emc_status_motion = Some(EmcStatusMotion {
                enabled: Some(true),
                position: Some(Position {
                    x: Some(10.0),
                    y: Some(20.0),
                    ..Default::default()
                }),
                axis: vec![MotionAxis {
                    index: 0,
                    homed: Some(true),
                    ..Default::default()
                }],
                ..Default::default()
            });
        }
        "config" => {
            container.emc_status_config = Some(EmcStatusConfig {
                axes: Some(3),
                max_velocity: Some(50.0),
                ..Default::default()
            });
        }
        "io" => {
            container.emc_status_io = Some(EmcStatusIo {
                estop: Some(false),
                flood: Some(false),
                ..Default::default()
            });
        }
        "task" => {
            container.emc_status_task = Some(EmcStatusTask {
                task_mode: Some(TaskMode::EmcTaskModeAuto as i32),
                file: Some("part.ngc".to_owned()),
                ..Default::default()
            });
        }
        "interp" => {
            container.emc_status_interp = Some(EmcStatusInterp {
                interp_state: Some(InterpreterState::EmcTaskInterpIdle as i32),
                ..Default::default()
            });
        }
        _ => unreachable!(),
    }
    container
}

#[test]
fn synced_requires_a_full_update_on_every_topic() {
    support::init_tracing();
    let server = StubPublisher::start();

    let status = ApplicationStatus::new().unwrap();
    status.set_status_uri(&server.endpoint);
    status.start();

    // four of the five topics: the endpoint must keep syncing
    let partial_topics = ["motion", "config", "io", "task"];
    assert!(support::wait_for(Duration::from_secs(5), || {
        for topic in partial_topics {
            server.publish(topic, &full_update_for(topic));
        }
        status.state() == StatusState::Syncing
    }));
    for _ in 0..5 {
        for topic in partial_topics {
            server.publish(topic, &full_update_for(topic));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!status.synced(), "a missing topic must gate synced");

    // the fifth topic completes the snapshot
    server.publish("interp", &full_update_for("interp"));
    assert!(support::wait_for(Duration::from_secs(2), || {
        server.publish("interp", &full_update_for("interp"));
        status.synced()
    }));
    assert!(status.wait_synced(Some(Duration::from_millis(100))));

    // mirror reflects the snapshots
    assert_eq!(status.motion().enabled, Some(true));
    assert_eq!(status.config().axes, Some(3));
    assert_eq!(status.task().file.as_deref(), Some("part.ngc"));

    // auto mode + idle interpreter
    assert!(status.running());

    status.stop();
    assert!(!status.synced());
}

#[test]
fn incremental_updates_merge_into_the_mirror() {
    support::init_tracing();
    let server = StubPublisher::start();

    let status = ApplicationStatus::new().unwrap();
    status.set_status_uri(&server.endpoint);
    status.start();

    let topics = ["motion", "config", "io", "task", "interp"];
    assert!(support::wait_for(Duration::from_secs(5), || {
        for topic in topics {
            server.publish(topic, &full_update_for(topic));
        }
        status.synced()
    }));

    // partial position update: only x changes, y survives
    let mut incremental = Container::with_type(ContainerType::MtEmcstatIncrementalUpdate);
    incremental.emc_status_motion = Some(EmcStatusMotion {
        position: Some(Position {
            x: Some(11.5),
            ..Default::default()
        }),
        ..Default::default()
    });
    assert!(support::wait_for(Duration::from_secs(2), || {
        server.publish("motion", &incremental);
        status.motion().position.map(|p| p[0]) == Some(11.5)
    }));
    assert_eq!(status.motion().position.unwrap()[1], 20.0);
    assert_eq!(status.motion().axis[0].homed, Some(true));

    status.stop();
}
