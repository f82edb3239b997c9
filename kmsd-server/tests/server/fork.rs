//! Process-per-connection dispatch.

use kmsd_server::{AssociationGroupId, ExecutionStrategy, Server};

use super::common::{Client, RunningServer, echo_handler, loopback_config};

#[test]
fn test_forked_workers_echo() {
    let config = loopback_config()
        .with_execution(ExecutionStrategy::ProcessFork)
        .with_max_connections(2);
    let server = RunningServer::start(
        Server::builder(config, echo_handler)
            .initial_association_group(AssociationGroupId::new(41)),
    );

    let mut client = Client::connect(server.addr);
    let greeting = client.greeting();
    assert_eq!(greeting.group, 42);
    assert_ne!(greeting.pid, std::process::id(), "served by a child process");
    assert_eq!(client.echo(b"forked"), b"forked");

    let mut next = Client::connect(server.addr);
    assert_eq!(next.greeting().group, 43);
    assert_eq!(next.echo(b"again"), b"again");

    server.wait_idle();
    let stats = server.admission.stats().expect("stats");
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.released, 2);
    assert_eq!(stats.available, 2);

    server.stop().expect("clean stop");
}

#[test]
fn test_killed_worker_returns_its_permit() {
    let config = loopback_config()
        .with_execution(ExecutionStrategy::ProcessFork)
        .with_max_connections(1);
    let server = RunningServer::start(Server::builder(config, echo_handler));

    let mut doomed = Client::connect(server.addr);
    let pid = doomed.greeting().pid;
    assert_eq!(server.admission.stats().expect("stats").in_flight(), 1);

    // Safety: pid is a worker forked by this test's server.
    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) }, 0);
    assert!(doomed.drain().is_empty(), "connection closed by the dying worker");

    server.wait_idle();

    // The only permit is back, so the next connection is admitted.
    let mut next = Client::connect(server.addr);
    next.greeting();
    assert_eq!(next.echo(b"recovered"), b"recovered");

    server.stop().expect("clean stop");
}
