use std::{
    net::TcpListener,
    path::PathBuf,
    process,
    sync::{Arc, atomic::AtomicBool},
};

use clap::Parser;
use tracing::{error, info};
use tunnel_core::{Config, PortAllocator, ServerShared, Timeouts, serve};

/// Reverse tunnel server: exposes dynamically allocated public ports for
/// authenticated clients.
#[derive(Parser, Debug)]
#[command(name = "tunnel-server", version)]
struct Args {
    /// Path to the JSON config file (accounts, port range, timeouts).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Overrides the control link bind host from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Overrides the control link bind port from the config file.
    #[arg(long)]
    port: Option<u16>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "using built-in defaults, config file unavailable");
            Config::default()
        }
    };
    if let Some(host) = args.host {
        config.bind_host = host;
    }
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    let bind_addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = match TcpListener::bind(&bind_addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_addr, error = %err, "failed to bind control link listener");
            process::exit(1);
        }
    };
    info!(bind_addr, accounts = config.accounts.len(), "tunnel server listening");

    let timeouts: Timeouts = config.timeouts;
    let shared = Arc::new(ServerShared {
        verifier: Arc::new(config.clone()),
        allocator: Arc::new(PortAllocator::new(config.port_range)),
        timeouts,
        bind_host: config.bind_host.clone(),
        vc_queue_size: 1000,
        stop: Arc::new(AtomicBool::new(false)),
    });

    {
        let stop = Arc::clone(&shared.stop);
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .expect("failed to register signal handler");
    }

    serve(listener, shared);
}
