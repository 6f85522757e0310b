use std::{net::ToSocketAddrs, process, sync::Arc};

use clap::Parser;
use tracing::error;
use tunnel_core::{ClientConfig, LoggingObserver, Timeouts, TunnelClient};

/// Reverse tunnel client: authenticates to a server and exposes a local
/// TCP service through the public port the server assigns.
#[derive(Parser, Debug)]
#[command(name = "tunnel-client", version)]
struct Args {
    /// Tunnel server address, e.g. `tunnel.example.com:13882`.
    #[arg(long)]
    server: String,

    /// Account login.
    #[arg(long)]
    login: String,

    /// Account password.
    #[arg(long)]
    password: String,

    /// Local port the tunneled service listens on (loopback only).
    #[arg(long)]
    local_port: u16,

    /// Maximum consecutive reconnect attempts before giving up.
    #[arg(long, default_value_t = 10)]
    max_retries: u32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let server_addr = match args.server.to_socket_addrs().ok().and_then(|mut it| it.next()) {
        Some(addr) => addr,
        None => {
            error!(server = args.server, "failed to resolve server address");
            process::exit(1);
        }
    };

    let config = ClientConfig {
        server_addr,
        login: args.login,
        password: args.password,
        local_port: args.local_port,
        timeouts: Timeouts::default(),
        vc_queue_size: 100,
        max_retries: args.max_retries,
    };

    let client = Arc::new(TunnelClient::new(config, Arc::new(LoggingObserver)));
    let stop = client.stop_handle();
    ctrlc::set_handler(move || {
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("failed to register signal handler");

    client.run();
}
