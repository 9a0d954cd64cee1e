//! chisel - TCP tunnel over a WebSocket-framed SSH transport.
//!
//! Thin CLI rim around `xevo-tunnel`: flag parsing, logging setup, signal
//! handling and exit codes. All tunnel behavior lives in the library.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use xevo_tunnel::{parse_route, Client, ClientOptions, Server, ServerOptions};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Server {
                host,
                port,
                key,
                authfile,
                auth,
                proxy,
                socks5,
                reverse,
                no_loop,
            } => {
                let mut opts = ServerOptions::new();
                opts.host = host;
                opts.port = port;
                opts.key_seed = key;
                opts.auth_file = authfile;
                opts.auth = auth;
                opts.proxy = proxy;
                opts.socks5 = socks5;
                opts.reverse = reverse;
                opts.no_loop = no_loop;
                run_server(opts).await
            }
            Commands::Client {
                auth,
                fingerprint,
                keepalive,
                server,
                routes,
            } => {
                let mut opts = ClientOptions::new(server);
                opts.auth = auth;
                opts.fingerprint = fingerprint;
                opts.keepalive = Duration::from_secs(keepalive);
                for spec in &routes {
                    let route = parse_route(spec).context("cannot parse route")?;
                    opts.routes.push(route);
                }
                run_client(opts).await
            }
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(opts: ServerOptions) -> Result<()> {
    let server = Arc::new(Server::new(opts).context("server startup failed")?);

    let signal_target = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_target.shutdown();
        }
    });

    server.run().await.context("server failed")
}

async fn run_client(opts: ClientOptions) -> Result<()> {
    let client = Arc::new(Client::new(opts).context("client startup failed")?);

    let signal_target = Arc::clone(&client);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_target.shutdown();
        }
    });

    client.run().await.context("client failed")
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
