//! Ticket tracking against a stub command service.

mod support;

use std::time::Duration;

use machinetalk::application::ApplicationCommand;
use machinetalk_proto::{Container, ContainerType};
use support::StubRouter;

fn reply_with_ticket(kind: ContainerType, ticket: u32) -> Container {
    let mut container = Container::with_type(kind);
    container.reply_ticket = Some(ticket);
    container
}

#[test]
fn tickets_are_strictly_increasing_and_tracked() {
    support::init_tracing();
    let server = StubRouter::start();

    let command = ApplicationCommand::new().unwrap();
    command.set_command_uri(&server.endpoint);

    // not connected yet: commands are refused
    assert_eq!(command.abort(), None);

    command.start();
    assert!(command.wait_connected(Some(Duration::from_secs(5))));

    let first = command.run_program(42).expect("connected");
    let second = command.execute_mdi("G0 X1").expect("connected");
    let third = command.abort().expect("connected");
    assert_eq!(first, 1);
    assert_eq!(second, first + 1);
    assert_eq!(third, second + 1);

    // the requests arrive in ticket order with their parameters
    let run = server
        .recv_request_of(ContainerType::MtEmcTaskPlanRun, Duration::from_secs(2))
        .unwrap();
    assert_eq!(run.ticket, Some(first));
    assert_eq!(
        run.emc_command_params.as_ref().unwrap().line_number,
        Some(42)
    );
    assert_eq!(run.interp_name.as_deref(), Some("execute"));

    let mdi = server
        .recv_request_of(ContainerType::MtEmcTaskPlanExecute, Duration::from_secs(2))
        .unwrap();
    assert_eq!(mdi.ticket, Some(second));
    assert_eq!(
        mdi.emc_command_params.as_ref().unwrap().command.as_deref(),
        Some("G0 X1")
    );

    // executed reply for the first ticket satisfies its wait
    server.reply(reply_with_ticket(ContainerType::MtEmccmdExecuted, first));
    assert!(command.wait_executed(Some(first), Some(Duration::from_secs(2))));

    // a completion for a different, earlier ticket must not satisfy the
    // wait for the second one
    server.reply(reply_with_ticket(ContainerType::MtEmccmdCompleted, first));
    assert!(!command.wait_completed(Some(second), Some(Duration::from_millis(400))));
    assert_eq!(command.completed_ticket(), first);

    server.reply(reply_with_ticket(ContainerType::MtEmccmdCompleted, second));
    assert!(command.wait_completed(Some(second), Some(Duration::from_secs(2))));

    // an already-observed reply satisfies the wait immediately
    assert!(command.wait_completed(Some(first), Some(Duration::from_millis(10))));

    command.stop();
    command.stop();
    assert!(!command.connected());
}

#[test]
fn service_error_sets_the_error_string_without_disconnecting() {
    support::init_tracing();
    let server = StubRouter::start();

    let command = ApplicationCommand::new().unwrap();
    command.set_command_uri(&server.endpoint);
    command.start();
    assert!(command.wait_connected(Some(Duration::from_secs(5))));

    let mut error = Container::with_type(ContainerType::MtError);
    error.note.push("spindle fault".to_owned());
    server.reply(error);

    assert!(support::wait_for(Duration::from_secs(2), || {
        command.error_string().contains("spindle fault")
    }));
    assert!(command.connected());

    command.stop();
}
