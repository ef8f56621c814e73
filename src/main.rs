//! FlashGate - Worker-side Connection Core for a Multi-threaded TCP Proxy
//!
//! This is the main entry point for the FlashGate server.
//! It parses options, starts the workers and waits for Ctrl+C.

use flashgate::config::{Invocation, ServerOptions};
use flashgate::server::Server;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!(
        r#"
FlashGate - Worker-side Connection Core for a Multi-threaded TCP Proxy

USAGE:
    flashgate [OPTIONS]

OPTIONS:
    -h, --host <HOST>                  Host to bind to (default: {host})
    -p, --port <PORT>                  Port to listen on (default: {port})
    -w, --workers <N>                  Worker threads (default: available cores)
    -m, --max-connections <N>          Listener connection limit (default: unlimited)
        --global-max-connections <N>   Process-wide connection limit (default: unlimited)
        --balance <exact|none>         Cross-worker balancing (default: exact)
    -v, --version                      Print version information
        --help                         Print this help message

EXAMPLES:
    flashgate                          # Start on {host}:{port}
    flashgate --workers 4 -m 1000      # 4 workers, at most 1000 connections
    flashgate --balance none           # Keep each socket on the worker that accepted it

LOGGING:
    Set RUST_LOG to change verbosity, e.g. RUST_LOG=flashgate=debug.
    Access logs use the target flashgate::access.
"#,
        host = flashgate::DEFAULT_HOST,
        port = flashgate::DEFAULT_PORT,
    );
}

fn print_banner(options: &ServerOptions, server: &Server) {
    println!(
        r#"
FlashGate v{}
──────────────────────────────────────────────────────────────
Listening on {} with {} worker(s), balancing: {:?}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashgate::VERSION,
        server.local_addr(),
        server.workers().len(),
        options.balance,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = match ServerOptions::parse(std::env::args().skip(1)) {
        Ok(Invocation::Run(options)) => options,
        Ok(Invocation::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Invocation::Version) => {
            println!("FlashGate version {}", flashgate::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let server = Server::start(&options)?;
    print_banner(&options, &server);

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    server.stop_listeners()?;
    info!(
        open_connections = server.num_connections(),
        "Listeners stopped, closing connections"
    );
    server.shutdown();

    info!("Server shutdown complete");
    Ok(())
}
