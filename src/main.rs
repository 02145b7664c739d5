//! RavenKV server binary
//!
//! Loads the configuration, replays the append-only file when enabled, and
//! serves RESP clients until Ctrl+C.

use anyhow::Context;
use ravenkv::aof::{self, Aof};
use ravenkv::commands::CommandRegistry;
use ravenkv::config::{Config, Invocation};
use ravenkv::connection::{handle_connection, ConnectionStats};
use ravenkv::database::Server;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!(
        r#"
RavenKV - In-Memory Key-Value Server with Sorted Sets and Transactions

USAGE:
    ravenkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>                Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>                Port to listen on (default: 6379)
        --databases <N>              Number of databases (default: 16)
        --shards <N>                 Lock shards per database (default: 16)
        --expiry-interval-ms <MS>    Expiry timer tick (default: 100)
        --appendonly <yes|no>        Enable the append-only file (default: no)
        --appendfilename <PATH>      Append-only file path (default: appendonly.aof)
        --appendfsync <POLICY>       always, everysec or no (default: everysec)
        --max-request-bytes <N>      Largest request a client may send (default: 8388608)
    -v, --version                    Print version information
        --help                       Print this help message

Every option can also be set through RAVENKV_<NAME>, for example
RAVENKV_PORT=6380. Flags win over the environment.

EXAMPLES:
    ravenkv                                   # Start on 127.0.0.1:6379
    ravenkv --port 6380 --appendonly yes      # Persist writes on port 6380

CONNECTING:
    $ redis-cli -p 6379
    127.0.0.1:6379> ZADD board 10 alice 20 bob
    (integer) 2
    127.0.0.1:6379> ZRANGE board 0 -1 WITHSCORES
    1) "alice"
    2) "10"
    3) "bob"
    4) "20"
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
    ____                        __ ____    __
   / __ \____ __   _____  ____ / //_/ |  / /
  / /_/ / __ `/ | / / _ \/ __ \/ ,<  | | / /
 / _, _/ /_/ /| |/ /  __/ / / / /| | | |/ /
/_/ |_|\__,_/ |___/\___/_/ /_/_/ |_| |___/

RavenKV v{}
──────────────────────────────────────────────
Listening on {} ({} databases, append-only {})

Use Ctrl+C to shutdown gracefully.
"#,
        ravenkv::VERSION,
        config.bind_address(),
        config.databases,
        if config.append_only { "on" } else { "off" },
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::load()? {
        Invocation::Run(config) => config,
        Invocation::Help => {
            print_help();
            return Ok(());
        }
        Invocation::Version => {
            println!("RavenKV version {}", ravenkv::VERSION);
            return Ok(());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    print_banner(&config);

    let registry = Arc::new(CommandRegistry::standard());
    let server = Arc::new(Server::new(
        config.databases,
        registry,
        config.database_config(),
    ));

    // Replay before attaching, so recovered commands are not appended again.
    let append_log = if config.append_only {
        let replayed = aof::load(&server, &config.append_filename)
            .await
            .with_context(|| {
                format!("loading {}", config.append_filename.display())
            })?;
        info!(records = replayed, "append-only file loaded");

        let log = Arc::new(Aof::open(&config.append_filename, config.append_fsync).await?);
        server.attach_append_log(log.clone());
        Some(log)
    } else {
        None
    };

    let stats = Arc::new(ConnectionStats::new());
    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("binding {}", config.bind_address()))?;
    info!(address = %config.bind_address(), "ready to accept connections");

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&server), Arc::clone(&stats), config.max_request_size) => {}
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
            info!("shutdown signal received, stopping server");
        }
    }

    if let Some(log) = append_log {
        if let Err(e) = log.close().await {
            warn!(error = %e, "append-only file was not closed cleanly");
        }
    }

    info!(
        served = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        "server shutdown complete"
    );
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    server: Arc<Server>,
    stats: Arc<ConnectionStats>,
    max_request_size: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server = Arc::clone(&server);
                let stats = Arc::clone(&stats);
                tokio::spawn(handle_connection(stream, addr, server, stats, max_request_size));
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}
