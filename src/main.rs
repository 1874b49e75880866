//! emberkv server entry point: parses the configuration, wires the
//! storage, client registry and expiry sweeper together and accepts
//! connections until interrupted.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use emberkv::commands::{CommandHandler, ServerContext};
use emberkv::connection::handle_connection;
use emberkv::eviction::{self, EvictionPolicy};
use emberkv::storage::start_expiry_sweeper;
use emberkv::{alloc, DEFAULT_DATABASES, DEFAULT_HOST, DEFAULT_PORT};

struct Config {
    host: String,
    port: u16,
    databases: usize,
    maxmemory: usize,
    policy: EvictionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            databases: DEFAULT_DATABASES,
            maxmemory: 0,
            policy: EvictionPolicy::NoEviction,
        }
    }
}

impl Config {
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let take_value = |i: usize| -> String {
                args.get(i + 1).cloned().unwrap_or_else(|| {
                    eprintln!("Error: {} requires a value", args[i]);
                    std::process::exit(1);
                })
            };
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = take_value(i);
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = take_value(i).parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--databases" => {
                    config.databases = take_value(i).parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid database count");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--maxmemory" => {
                    config.maxmemory = take_value(i).parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid maxmemory byte count");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--maxmemory-policy" => {
                    let name = take_value(i);
                    config.policy = EvictionPolicy::parse(&name).unwrap_or_else(|| {
                        eprintln!(
                            "Error: unknown policy '{}' (noeviction, allkeys-lru, allkeys-lfu)",
                            name
                        );
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--version" | "-v" => {
                    println!("emberkv version {}", emberkv::VERSION);
                    std::process::exit(0);
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
        }
        config
    }

    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"
emberkv - An In-Memory Key-Value Database

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>              Port to listen on (default: 6379)
        --databases <N>            Number of databases (default: 16)
        --maxmemory <BYTES>        Memory limit; 0 means unlimited
        --maxmemory-policy <NAME>  noeviction | allkeys-lru | allkeys-lfu
    -v, --version                  Print version information
        --help                     Print this help message

CONNECTING:
    Any RESP client works:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET greeting hello
    OK
    127.0.0.1:6379> OBJECT ENCODING greeting
    "embstr"
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    eviction::set_maxmemory(config.maxmemory);
    eviction::set_policy(config.policy);

    // Force the shared-singleton registry to build before the startup
    // snapshot so its cost lands in the baseline, not the dataset.
    emberkv::object::shared::shared();
    alloc::snapshot_startup();

    let ctx = Arc::new(ServerContext::new(config.databases));
    info!(
        databases = config.databases,
        policy = config.policy.name(),
        "storage initialized"
    );

    let _sweeper = start_expiry_sweeper(Arc::clone(&ctx.storage));

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("listening on {}", config.bind_address());

    let shutdown = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
        info!("shutdown signal received");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&ctx)) => {}
        _ = shutdown => {}
    }

    info!("server shutdown complete");
    Ok(())
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let commands = CommandHandler::new(Arc::clone(&ctx));
                let registry = Arc::clone(&ctx.clients);
                tokio::spawn(handle_connection(stream, addr, commands, registry));
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}
