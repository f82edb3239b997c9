//! Echo Server Example - the kmsd listener stack around a trivial handler.
//!
//! Every connection is greeted with its association group, then echoed
//! until the client closes.
//!
//! # Usage
//!
//! Standalone on the default addresses:
//! ```bash
//! cargo run --example echo_server -- --port 1688
//! ```
//!
//! Forked workers, at most four at a time:
//! ```bash
//! cargo run --example echo_server -- --strategy process-fork --max-connections 4
//! ```
//!
//! Under inetd (descriptor 0 is the connection):
//! ```bash
//! echo_server --inetd
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;

use clap::{Parser, ValueEnum};
use kmsd_server::{AssociationGroupId, ExecutionStrategy, Server, ServerConfig, ServerError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    Inline,
    Thread,
    ProcessFork,
}

impl From<Strategy> for ExecutionStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Inline => ExecutionStrategy::Inline,
            Strategy::Thread => ExecutionStrategy::ThreadSpawn,
            Strategy::ProcessFork => ExecutionStrategy::ProcessFork,
        }
    }
}

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "echo_server")]
#[command(about = "Echo server on the kmsd listener stack", long_about = None)]
struct Args {
    /// Address to listen on; repeat for more (defaults to 0.0.0.0 and [::])
    #[arg(short, long)]
    listen: Vec<String>,

    /// Port used for addresses without one
    #[arg(short, long, default_value_t = kmsd_server::DEFAULT_PORT)]
    port: u16,

    /// Concurrent connection limit, 0 for unlimited
    #[arg(short, long, default_value_t = 0)]
    max_connections: u32,

    /// Per-connection I/O timeout in seconds, 0 to disable
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// How connections are executed
    #[arg(short, long, value_enum, default_value_t = Strategy::Thread)]
    strategy: Strategy,

    /// Serve the connection on stdin and exit
    #[arg(long)]
    inetd: bool,

    /// Do not log peer addresses
    #[arg(short, long)]
    quiet: bool,
}

fn echo(stream: &mut TcpStream, group: AssociationGroupId) {
    if writeln!(stream, "group {group}").is_err() {
        return;
    }
    let mut buf = [0u8; 1024];
    while let Ok(n) = stream.read(&mut buf) {
        if n == 0 || stream.write_all(&buf[..n]).is_err() {
            break;
        }
    }
}

fn main() -> Result<(), ServerError> {
    let args = Args::parse();

    // Logs go to stderr; under inetd stdout is the connection.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kmsd_server=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = if args.inetd {
        ServerConfig::inetd()
    } else {
        ServerConfig::default()
    };
    if !args.listen.is_empty() {
        config = config.with_listen(args.listen);
    }
    config.default_port = args.port;
    let config = config
        .with_max_connections(args.max_connections)
        .with_connection_timeout_secs(args.timeout)
        .with_execution(args.strategy.into())
        .with_log_connections(!args.quiet);

    let mut server = Server::builder(config, echo).build()?;
    if args.inetd {
        return server.run();
    }

    let count = server.bind_configured()?;
    server
        .shutdown_signal()
        .install_os_handlers()
        .map_err(ServerError::Signal)?;
    tracing::info!(listeners = count, "echo server ready");
    server.run()
}
