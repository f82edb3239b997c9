//! Shared helpers: a framed echo handler and a background server.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kmsd_server::{
    AdmissionController, AssociationGroupId, ConnectionHandler, RandomProvider, ServerBuilder,
    ServerConfig, ServerResult, ShutdownSignal,
};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Greeting sent by [`echo_handler`] before echoing: the association group
/// and the serving process id, both big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Greeting {
    pub group: u32,
    pub pid: u32,
}

/// Writes a [`Greeting`], then echoes until the client half-closes.
pub fn echo_handler(stream: &mut TcpStream, group: AssociationGroupId) {
    let mut greeting = [0u8; 8];
    greeting[..4].copy_from_slice(&group.get().to_be_bytes());
    greeting[4..].copy_from_slice(&std::process::id().to_be_bytes());
    if stream.write_all(&greeting).is_err() {
        return;
    }
    let mut buf = [0u8; 256];
    while let Ok(n) = stream.read(&mut buf) {
        if n == 0 || stream.write_all(&buf[..n]).is_err() {
            break;
        }
    }
}

/// A client connection to a test server.
pub struct Client {
    pub stream: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        Self { stream }
    }

    /// Read the greeting, waiting at most `timeout`.
    pub fn greeting_within(&mut self, timeout: Duration) -> io::Result<Greeting> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut raw = [0u8; 8];
        let result = self.stream.read_exact(&mut raw);
        self.stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        result?;
        Ok(Greeting {
            group: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            pid: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    pub fn greeting(&mut self) -> Greeting {
        self.greeting_within(Duration::from_secs(10))
            .expect("greeting")
    }

    /// Send `payload`, half-close, and return everything echoed back.
    pub fn echo(&mut self, payload: &[u8]) -> Vec<u8> {
        self.stream.write_all(payload).expect("write");
        self.stream.shutdown(Shutdown::Write).expect("half-close");
        let mut reply = Vec::new();
        self.stream.read_to_end(&mut reply).expect("read to EOF");
        reply
    }

    /// Read until EOF and return the bytes seen.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        let _ = self.stream.read_to_end(&mut rest);
        rest
    }
}

/// A server running on a background thread.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub admission: AdmissionController,
    pub shutdown: ShutdownSignal,
    handle: JoinHandle<ServerResult<()>>,
}

impl RunningServer {
    /// Build, bind and start `builder`. Its config must listen on loopback
    /// with port 0.
    pub fn start<H, R>(builder: ServerBuilder<H, R>) -> Self
    where
        H: ConnectionHandler,
        R: RandomProvider,
    {
        init_tracing();
        let mut server = builder.build().expect("build");
        server.bind_configured().expect("bind");
        let addr = server.local_addrs()[0];
        let admission = server.admission().clone();
        let shutdown = server.shutdown_signal();
        let handle = thread::spawn(move || server.run());
        Self {
            addr,
            admission,
            shutdown,
            handle,
        }
    }

    /// Request shutdown, wake the accept loop and return its result.
    pub fn stop(self) -> ServerResult<()> {
        self.shutdown.request();
        let _ = TcpStream::connect(self.addr);
        self.handle.join().expect("server thread panicked")
    }

    /// Wait until every acquired permit has been released.
    pub fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let stats = self.admission.stats().expect("admission enabled");
            if stats.in_flight() == 0 {
                return;
            }
            assert!(Instant::now() < deadline, "permits never released: {stats:?}");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Loopback-only config on an ephemeral port.
pub fn loopback_config() -> ServerConfig {
    ServerConfig::default().with_listen(["127.0.0.1:0"])
}
