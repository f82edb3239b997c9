//! Startup, shutdown and pre-connected descriptors.

use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use kmsd_server::{
    AddressFamily, AssociationGroupId, ConnectionOutcome, SeededRandomProvider, Server,
    ServerConfig, ServerError, ShutdownSignal,
};

use super::common::{Client, RunningServer, echo_handler, init_tracing, loopback_config};

#[test]
fn test_shutdown_stops_loop_and_closes_listeners() {
    let server = RunningServer::start(Server::builder(loopback_config(), echo_handler));
    let addr = server.addr;

    let mut client = Client::connect(addr);
    client.greeting();
    assert_eq!(client.echo(b"before"), b"before");

    server.stop().expect("clean stop");
    assert!(TcpStream::connect(addr).is_err(), "listener closed");
}

#[test]
fn test_external_shutdown_signal() {
    let shutdown = ShutdownSignal::new();
    let server = RunningServer::start(
        Server::builder(loopback_config(), echo_handler).shutdown(shutdown.clone()),
    );

    shutdown.request();
    assert!(server.shutdown.is_requested());
    server.stop().expect("clean stop");
}

#[test]
fn test_connection_after_shutdown_request_is_not_served() {
    let server = RunningServer::start(
        Server::builder(loopback_config(), echo_handler)
            .initial_association_group(AssociationGroupId::new(0)),
    );
    let addr = server.addr;

    let mut early = Client::connect(addr);
    assert_eq!(early.greeting().group, 1);
    early.echo(b"");

    server.shutdown.request();
    // Either the loop already exited and the connect fails, or the
    // connection is accepted and closed without dispatch.
    if let Ok(stream) = TcpStream::connect(addr) {
        let mut late = Client { stream };
        assert!(
            late.greeting_within(Duration::from_secs(5)).is_err(),
            "closed without dispatch"
        );
    }
    server.stop().expect("clean stop");
}

#[test]
fn test_no_listeners() {
    init_tracing();
    let occupied = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = occupied.local_addr().expect("addr").port();

    let config = ServerConfig::default().with_listen([format!("127.0.0.1:{port}")]);
    let mut server = Server::builder(config, echo_handler).build().expect("build");
    assert!(matches!(server.bind_configured(), Err(ServerError::NoListeners)));
    assert!(matches!(server.run(), Err(ServerError::NoListeners)));
}

#[test]
fn test_partial_bind_is_enough() {
    init_tracing();
    let config = ServerConfig::default()
        .with_listen(["127.0.0.1:notaport", "127.0.0.1:0"]);
    let mut server = Server::builder(config, echo_handler).build().expect("build");
    assert_eq!(server.bind_configured().expect("one listener"), 1);
}

#[test]
fn test_family_restricted_config() {
    init_tracing();
    let mut config = ServerConfig::default().with_listen(["127.0.0.1:0"]);
    config.address_family = AddressFamily::Ipv6;
    let mut server = Server::builder(config, echo_handler).build().expect("build");
    assert!(matches!(server.bind_configured(), Err(ServerError::NoListeners)));
}

#[test]
fn test_serve_preconnected() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let mut client = Client::connect(listener.local_addr().expect("addr"));
    let (accepted, _) = listener.accept().expect("accept");

    let mut server = Server::builder(ServerConfig::inetd(), echo_handler)
        .initial_association_group(AssociationGroupId::new(u32::MAX))
        .build()
        .expect("build");
    assert!(!server.admission().is_enabled());

    let worker = std::thread::spawn(move || {
        let outcome = server.serve_preconnected(accepted);
        (outcome, server.association_group())
    });

    assert_eq!(client.greeting().group, 0);
    assert_eq!(client.echo(b"inetd"), b"inetd");
    let (outcome, group) = worker.join().expect("join");
    assert_eq!(outcome, ConnectionOutcome::Served);
    assert_eq!(group, AssociationGroupId::new(0));
}

#[test]
fn test_seeded_groups_are_reproducible() {
    let first = Server::builder(loopback_config(), echo_handler)
        .random(SeededRandomProvider::new(7))
        .build()
        .expect("build");
    let second = Server::builder(loopback_config(), echo_handler)
        .random(SeededRandomProvider::new(7))
        .build()
        .expect("build");
    assert_eq!(first.association_group(), second.association_group());

    let server = RunningServer::start(
        Server::builder(loopback_config(), echo_handler).random(SeededRandomProvider::new(7)),
    );
    let mut client = Client::connect(server.addr);
    assert_eq!(client.greeting().group, first.association_group().next().get());
    client.echo(b"");
    server.stop().expect("clean stop");
}
