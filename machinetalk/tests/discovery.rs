//! Service resolution and endpoint lifecycle through the browser
//! contract.

mod support;

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use machinetalk::application::ApplicationCommand;
use machinetalk::discovery::{
    Browser, BrowserEvent, Service, ServiceDiscovery, ServiceRecord,
};
use machinetalk::Error;
use support::StubRouter;

/// Browser backend fed by the test through an mpsc channel.
struct PipeBrowser {
    source: Mutex<Option<Receiver<BrowserEvent>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PipeBrowser {
    fn new() -> (Self, Sender<BrowserEvent>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (
            PipeBrowser {
                source: Mutex::new(Some(rx)),
                thread: None,
            },
            tx,
        )
    }
}

impl Browser for PipeBrowser {
    fn start(&mut self, events: Sender<BrowserEvent>) -> machinetalk::Result<()> {
        let source = self
            .source
            .lock()
            .unwrap()
            .take()
            .expect("pipe browser restarted");
        self.thread = Some(std::thread::spawn(move || {
            for event in source {
                if events.send(event).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn record(name: &str, service: &str, server: &str, address: Option<&str>, dsn: &str) -> ServiceRecord {
    let mut txt = BTreeMap::new();
    txt.insert("service".to_owned(), service.to_owned());
    txt.insert("dsn".to_owned(), dsn.to_owned());
    txt.insert("uuid".to_owned(), "12345678".to_owned());
    ServiceRecord {
        name: name.to_owned(),
        type_string: "_machinekit._tcp.local.".to_owned(),
        server: server.to_owned(),
        address: address.map(|address| address.parse().unwrap()),
        port: 5700,
        txt,
    }
}

#[test]
fn records_resolve_uris_with_the_local_rewrite_rule() {
    support::init_tracing();
    let (browser, events) = PipeBrowser::new();

    let halrcomp = Service::new("halrcomp");
    let command = Service::new("command");
    let discovery = ServiceDiscovery::with_browser(Box::new(browser));
    discovery.register(&halrcomp).unwrap();
    discovery.register(&command).unwrap();
    discovery.start().unwrap();

    // registrations are frozen while the browser runs
    let late = Service::new("status");
    assert!(matches!(
        discovery.register(&late),
        Err(Error::DiscoveryRunning)
    ));

    // .local hostname: rewritten to the resolved address
    events
        .send(BrowserEvent::Added(record(
            "Halrcomp on sandybox",
            "halrcomp",
            "sandybox.local",
            Some("10.0.0.10"),
            "tcp://sandybox.local:5700",
        )))
        .unwrap();
    assert!(support::wait_for(Duration::from_secs(2), || halrcomp.ready()));
    assert_eq!(halrcomp.uri(), "tcp://10.0.0.10:5700");

    // foreign hostname: raw dsn surfaces unchanged
    events
        .send(BrowserEvent::Added(record(
            "Command on gateway",
            "command",
            "somehost.local",
            Some("10.0.0.11"),
            "tcp://gateway:5701",
        )))
        .unwrap();
    assert!(support::wait_for(Duration::from_secs(2), || command.ready()));
    assert_eq!(command.uri(), "tcp://gateway:5701");

    // removal drops readiness
    events
        .send(BrowserEvent::Removed {
            name: "Halrcomp on sandybox".to_owned(),
        })
        .unwrap();
    assert!(support::wait_for(Duration::from_secs(2), || !halrcomp.ready()));

    drop(events);
    discovery.stop();
    assert!(!command.ready(), "stop clears all records");
}

#[test]
fn discovered_services_drive_the_endpoint_lifecycle() {
    support::init_tracing();
    let server = StubRouter::start();
    let (browser, events) = PipeBrowser::new();

    let command = ApplicationCommand::new().unwrap();
    let discovery = ServiceDiscovery::with_browser(Box::new(browser));
    discovery.register_container(command.services()).unwrap();
    discovery.start().unwrap();

    assert!(!command.connected());
    events
        .send(BrowserEvent::Added(record(
            "Command on testbox",
            "command",
            "testbox.local",
            None,
            &server.endpoint,
        )))
        .unwrap();

    // resolution turns the endpoint on
    assert!(command.wait_connected(Some(Duration::from_secs(5))));
    assert_eq!(command.command_uri(), server.endpoint);

    // record loss turns it off again
    events
        .send(BrowserEvent::Removed {
            name: "Command on testbox".to_owned(),
        })
        .unwrap();
    assert!(support::wait_for(Duration::from_secs(2), || {
        !command.connected()
    }));

    drop(events);
    discovery.stop();
}
