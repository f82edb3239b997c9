//! Bounded concurrency under the thread strategy.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kmsd_server::{AssociationGroupId, ExecutionStrategy, Server};

use super::common::{Client, RunningServer, echo_handler, loopback_config};

#[test]
fn test_limit_holds_back_extra_connections() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        move |stream: &mut TcpStream, group: AssociationGroupId| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            echo_handler(stream, group);
            active.fetch_sub(1, Ordering::SeqCst);
        }
    };

    let config = loopback_config()
        .with_execution(ExecutionStrategy::ThreadSpawn)
        .with_max_connections(2);
    let server = RunningServer::start(Server::builder(config, handler));

    let mut first = Client::connect(server.addr);
    let mut second = Client::connect(server.addr);
    first.greeting();
    second.greeting();

    // Accepted by the kernel, but waiting for a permit.
    let mut third = Client::connect(server.addr);
    let err = third
        .greeting_within(Duration::from_millis(300))
        .expect_err("third connection must wait");
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    let stats = server.admission.stats().expect("stats");
    assert_eq!(stats.capacity, 2);
    assert_eq!(stats.available, 0);
    assert_eq!(stats.in_flight(), 2);

    assert_eq!(first.echo(b"bye"), b"bye");
    third.greeting();
    assert_eq!(third.echo(b"admitted"), b"admitted");
    assert_eq!(second.echo(b"done"), b"done");

    server.wait_idle();
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let stats = server.admission.stats().expect("stats");
    assert_eq!(stats.acquired, 3);
    assert_eq!(stats.released, 3);
    assert_eq!(stats.available, 2);

    server.stop().expect("clean stop");
}

#[test]
fn test_unlimited_has_no_pool() {
    let config = loopback_config().with_max_connections(0);
    let server = RunningServer::start(Server::builder(config, echo_handler));
    assert!(!server.admission.is_enabled());

    let mut clients: Vec<Client> = (0..4).map(|_| Client::connect(server.addr)).collect();
    for client in &mut clients {
        client.greeting();
    }
    for client in &mut clients {
        assert_eq!(client.echo(b"x"), b"x");
    }

    server.stop().expect("clean stop");
}
