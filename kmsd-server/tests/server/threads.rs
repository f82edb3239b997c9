//! Thread-per-connection dispatch.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kmsd_server::{
    AssociationGroupId, ExecutionStrategy, OsThreadSpawner, Server, Work, WorkerSpawner,
};

use super::common::{Client, RunningServer, echo_handler, loopback_config};

#[test]
fn test_echo_with_consecutive_groups() {
    let config = loopback_config().with_execution(ExecutionStrategy::ThreadSpawn);
    let server = RunningServer::start(
        Server::builder(config, echo_handler)
            .initial_association_group(AssociationGroupId::new(100)),
    );

    for expected in 101..104 {
        let mut client = Client::connect(server.addr);
        assert_eq!(client.greeting().group, expected);
        assert_eq!(client.echo(b"hello"), b"hello");
    }

    server.stop().expect("clean stop");
}

#[test]
fn test_group_wraps_at_u32_max() {
    let config = loopback_config().with_execution(ExecutionStrategy::ThreadSpawn);
    let server = RunningServer::start(
        Server::builder(config, echo_handler)
            .initial_association_group(AssociationGroupId::new(u32::MAX - 1)),
    );

    let groups: Vec<u32> = (0..3)
        .map(|_| {
            let mut client = Client::connect(server.addr);
            let group = client.greeting().group;
            client.echo(b"");
            group
        })
        .collect();
    assert_eq!(groups, vec![u32::MAX, 0, 1]);

    server.stop().expect("clean stop");
}

/// Fails the first spawn, then delegates to real threads.
struct FlakySpawner {
    calls: AtomicUsize,
    inner: OsThreadSpawner,
}

impl WorkerSpawner for FlakySpawner {
    fn spawn(&self, name: String, work: Work) -> io::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        self.inner.spawn(name, work)
    }
}

#[test]
fn test_spawn_failure_drops_connection_and_keeps_serving() {
    let config = loopback_config()
        .with_execution(ExecutionStrategy::ThreadSpawn)
        .with_max_connections(1);
    let spawner = Arc::new(FlakySpawner {
        calls: AtomicUsize::new(0),
        inner: OsThreadSpawner::new(),
    });
    let server = RunningServer::start(Server::builder(config, echo_handler).spawner(spawner));

    let mut rejected = Client::connect(server.addr);
    assert!(rejected.drain().is_empty(), "closed without a greeting");

    // With a single permit this would block forever had the failed
    // dispatch leaked its permit.
    let mut served = Client::connect(server.addr);
    served.greeting();
    assert_eq!(served.echo(b"still alive"), b"still alive");

    server.wait_idle();
    let stats = server.admission.stats().expect("stats");
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.released, 2);

    server.stop().expect("clean stop");
}

#[test]
fn test_handler_panic_releases_permit() {
    let config = loopback_config()
        .with_execution(ExecutionStrategy::ThreadSpawn)
        .with_max_connections(1);
    let handler = |stream: &mut TcpStream, group: AssociationGroupId| {
        if group.get() == 1 {
            panic!("protocol engine failure");
        }
        echo_handler(stream, group);
    };
    let server = RunningServer::start(
        Server::builder(config, handler).initial_association_group(AssociationGroupId::new(0)),
    );

    let mut crashed = Client::connect(server.addr);
    assert!(crashed.drain().is_empty());

    let mut served = Client::connect(server.addr);
    assert_eq!(served.greeting().group, 2);
    assert_eq!(served.echo(b"ok"), b"ok");

    server.wait_idle();
    server.stop().expect("clean stop");
}

#[test]
fn test_inline_strategy_serves_sequentially() {
    let config = loopback_config().with_execution(ExecutionStrategy::Inline);
    let server = RunningServer::start(
        Server::builder(config, echo_handler).initial_association_group(AssociationGroupId::new(7)),
    );

    let mut first = Client::connect(server.addr);
    let first_greeting = first.greeting();
    assert_eq!(first_greeting.group, 8);
    assert_eq!(first_greeting.pid, std::process::id());
    assert_eq!(first.echo(b"one"), b"one");

    let mut second = Client::connect(server.addr);
    assert_eq!(second.greeting().group, 9);
    assert_eq!(second.echo(b"two"), b"two");

    server.stop().expect("clean stop");
}
