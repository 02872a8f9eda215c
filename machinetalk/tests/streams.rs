//! Error and log stream endpoints against a stub publisher.

mod support;

use std::sync::mpsc;
use std::time::Duration;

use machinetalk::application::{ApplicationError, ApplicationLog};
use machinetalk_proto::{Container, ContainerType, LogMessage, MsgLevel, MsgOrigin};
use support::StubPublisher;

#[test]
fn error_messages_are_buffered_and_drained() {
    support::init_tracing();
    let server = StubPublisher::start();

    let error = ApplicationError::new().unwrap();
    error.set_error_uri(&server.endpoint);
    error.start();
    // no liveness handshake on the error stream
    assert!(error.wait_connected(Some(Duration::from_secs(2))));

    let mut container = Container::with_type(ContainerType::MtEmcOperatorError);
    container.note.push("joint 0 following error".to_owned());

    // keep publishing until the late-joining subscriber sees a message
    let mut batch = Vec::new();
    assert!(support::wait_for(Duration::from_secs(5), || {
        server.publish("error", &container);
        batch = error.messages();
        !batch.is_empty()
    }));
    assert_eq!(batch[0].kind, ContainerType::MtEmcOperatorError);
    assert_eq!(batch[0].notes, vec!["joint 0 following error".to_owned()]);

    // drain semantics: reading cleared the buffer
    std::thread::sleep(Duration::from_millis(100));
    let _ = error.messages();
    assert!(error.messages().is_empty());

    error.stop();
    assert!(!error.connected());
}

#[test]
fn log_records_are_filtered_by_level() {
    support::init_tracing();
    let server = StubPublisher::start();

    let log = ApplicationLog::new().unwrap();
    log.set_log_uri(&server.endpoint);
    log.set_log_level(MsgLevel::MsgInfo);
    let (records_tx, records_rx) = mpsc::channel();
    log.on_message_received(move |record| {
        let _ = records_tx.send(record.clone());
    });
    log.start();
    assert!(log.wait_connected(Some(Duration::from_secs(2))));

    let mut debug_container = Container::with_type(ContainerType::MtLogMessage);
    debug_container.log_message = Some(LogMessage {
        level: MsgLevel::MsgDbg as i32,
        origin: MsgOrigin::MsgRtuser as i32,
        text: Some("noisy detail".to_owned()),
        ..Default::default()
    });

    let mut error_container = Container::with_type(ContainerType::MtLogMessage);
    error_container.log_message = Some(LogMessage {
        level: MsgLevel::MsgErr as i32,
        origin: MsgOrigin::MsgRtuser as i32,
        tag: Some("rtapi".to_owned()),
        pid: Some(42),
        text: Some("joint fault".to_owned()),
        ..Default::default()
    });
    error_container.tv_sec = Some(12);
    error_container.tv_nsec = Some(500_000_000);

    // debug records sit above the configured level and must never
    // surface; publish both until the error record arrives
    let record = loop {
        server.publish("log", &debug_container);
        server.publish("log", &error_container);
        match records_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(record) => break record,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => panic!("log endpoint dropped"),
        }
    };
    assert_eq!(record.level, MsgLevel::MsgErr);
    assert_eq!(record.tag, "rtapi");
    assert_eq!(record.pid, 42);
    assert_eq!(record.text, "joint fault");
    assert_eq!(record.timestamp_ms, 12_500);

    // nothing below the threshold ever came through
    while let Ok(record) = records_rx.try_recv() {
        assert_ne!(record.level, MsgLevel::MsgDbg);
    }

    log.stop();
}
