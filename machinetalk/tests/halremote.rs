//! Remote component bind/sync/set protocol against stub services.

mod support;

use std::time::Duration;

use machinetalk::halremote::{PinValue, RemoteComponent};
use machinetalk::RemoteComponentState;
use machinetalk_proto::{self as proto, Component, Container, ContainerType, PinDirection, ValueType};
use support::{StubPublisher, StubRouter};

fn wire_pin(name: Option<&str>, handle: u32, value: bool) -> proto::Pin {
    proto::Pin {
        name: name.map(str::to_owned),
        handle: Some(handle),
        r#type: Some(ValueType::HalBit as i32),
        halbit: Some(value),
        ..Default::default()
    }
}

fn full_update(pins: Vec<proto::Pin>) -> Container {
    let mut container = Container::with_type(ContainerType::MtHalrcompFullUpdate);
    container.comp.push(Component {
        name: Some("anddemo".to_owned()),
        pin: pins,
        ..Default::default()
    });
    container
}

fn incremental_update(pins: Vec<proto::Pin>) -> Container {
    let mut container = Container::with_type(ContainerType::MtHalrcompIncrementalUpdate);
    container.pin = pins;
    container
}

#[test]
fn pins_mirror_the_server_and_in_pins_never_emit_set() {
    support::init_tracing();
    let halrcmd = StubRouter::start();
    let halrcomp = StubPublisher::start();

    let component = RemoteComponent::new("anddemo").unwrap();
    let button = component.create_pin("button0", ValueType::HalBit, PinDirection::HalOut);
    let led = component.create_pin("led", ValueType::HalBit, PinDirection::HalIn);
    component.set_halrcmd_uri(&halrcmd.endpoint);
    component.set_halrcomp_uri(&halrcomp.endpoint);
    component.start();

    // the bind payload declares both pins with qualified names
    let bind = halrcmd
        .recv_request_of(ContainerType::MtHalrcompBind, Duration::from_secs(5))
        .expect("bind request");
    let descriptor = &bind.comp[0];
    assert_eq!(descriptor.name.as_deref(), Some("anddemo"));
    assert_eq!(descriptor.no_create, Some(false));
    let names: Vec<_> = descriptor
        .pin
        .iter()
        .map(|pin| pin.name.clone().unwrap())
        .collect();
    assert!(names.contains(&"anddemo.button0".to_owned()));
    assert!(names.contains(&"anddemo.led".to_owned()));

    halrcmd.reply(Container::with_type(ContainerType::MtHalrcompBindConfirm));

    // the first full update assigns handles and values
    let snapshot = full_update(vec![
        wire_pin(Some("anddemo.button0"), 7, false),
        wire_pin(Some("anddemo.led"), 8, true),
    ]);
    assert!(support::wait_for(Duration::from_secs(5), || {
        halrcomp.publish("anddemo", &snapshot);
        component.connected()
    }));
    assert_eq!(component.state(), RemoteComponentState::Synced);
    // let queued duplicate snapshots drain before poking at pins
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(button.handle(), 7);
    assert_eq!(led.handle(), 8);
    assert_eq!(led.value(), PinValue::Bit(true));
    assert!(led.synced());

    // an incremental update flips the input pin without any SET frame
    let update = incremental_update(vec![wire_pin(None, 8, false)]);
    assert!(support::wait_for(Duration::from_secs(2), || {
        halrcomp.publish("anddemo", &update);
        led.value() == PinValue::Bit(false)
    }));
    assert!(led.synced());
    assert!(halrcmd
        .recv_request_of(ContainerType::MtHalrcompSet, Duration::from_millis(400))
        .is_none());

    // a local write on an out pin emits exactly one SET with the handle
    button.set(true);
    assert!(!button.synced());
    let set = halrcmd
        .recv_request_of(ContainerType::MtHalrcompSet, Duration::from_secs(2))
        .expect("set frame");
    assert_eq!(set.pin.len(), 1);
    assert_eq!(set.pin[0].handle, Some(7));
    assert_eq!(set.pin[0].halbit, Some(true));

    // the server echoing the value back re-syncs the pin
    let echo = incremental_update(vec![wire_pin(None, 7, true)]);
    assert!(support::wait_for(Duration::from_secs(2), || {
        halrcomp.publish("anddemo", &echo);
        button.synced()
    }));
    assert_eq!(button.value(), PinValue::Bit(true));

    component.stop();
    assert!(!component.connected());
}

#[test]
fn bind_reject_is_terminal_until_restarted() {
    support::init_tracing();
    let halrcmd = StubRouter::start();
    let halrcomp = StubPublisher::start();

    let component = RemoteComponent::new("anddemo").unwrap();
    let button = component.create_pin("button0", ValueType::HalBit, PinDirection::HalOut);
    component.set_no_create(true);
    component.set_halrcmd_uri(&halrcmd.endpoint);
    component.set_halrcomp_uri(&halrcomp.endpoint);
    component.start();

    let bind = halrcmd
        .recv_request_of(ContainerType::MtHalrcompBind, Duration::from_secs(5))
        .expect("bind request");
    assert_eq!(bind.comp[0].no_create, Some(true));

    let mut reject = Container::with_type(ContainerType::MtHalrcompBindReject);
    reject.note.push("schema mismatch".to_owned());
    halrcmd.reply(reject);

    assert!(support::wait_for(Duration::from_secs(2), || {
        component.state() == RemoteComponentState::Error
    }));
    assert!(component.error_string().trim_end().ends_with("schema mismatch"));
    assert!(!component.connected());

    // no SET frames come out of a dead component
    button.set(true);
    assert!(halrcmd
        .recv_request_of(ContainerType::MtHalrcompSet, Duration::from_millis(400))
        .is_none());

    // stop is the only exit; a fresh start begins a new bind cycle
    component.stop();
    assert_eq!(component.state(), RemoteComponentState::Down);
    component.start();
    assert!(halrcmd
        .recv_request_of(ContainerType::MtHalrcompBind, Duration::from_secs(5))
        .is_some());
    component.stop();
}

#[test]
fn no_bind_attaches_without_a_handshake() {
    support::init_tracing();
    let halrcmd = StubRouter::start();
    let halrcomp = StubPublisher::start();

    let component = RemoteComponent::new("anddemo").unwrap();
    component.create_pin("led", ValueType::HalBit, PinDirection::HalIn);
    component.set_no_bind(true);
    component.set_halrcmd_uri(&halrcmd.endpoint);
    component.set_halrcomp_uri(&halrcomp.endpoint);
    component.start();

    let snapshot = full_update(vec![wire_pin(Some("anddemo.led"), 3, true)]);
    assert!(support::wait_for(Duration::from_secs(5), || {
        halrcomp.publish("anddemo", &snapshot);
        component.connected()
    }));
    // the component came up without ever sending a bind request
    assert!(halrcmd
        .recv_request_of(ContainerType::MtHalrcompBind, Duration::from_millis(200))
        .is_none());
    assert_eq!(component.pin_value("led"), Some(PinValue::Bit(true)));

    component.stop();
}
