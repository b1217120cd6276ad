//! Simple table server example
//!
//! Run with: cargo run --example simple_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example simple_server                    # binds to 0.0.0.0:5810
//!   cargo run --example simple_server localhost          # binds to 127.0.0.1:5810
//!   cargo run --example simple_server 127.0.0.1:5811     # binds to 127.0.0.1:5811
//!
//! The server publishes `/server/uptime` from an in-process client and logs
//! every client that connects or disconnects. Connect with the
//! `simple_client` example to see values flow both ways.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use nettables::instance::ConnectionEvent;
use nettables::{ServerConfig, TableServer, ValueType};

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:5810
/// - "127.0.0.1" -> 127.0.0.1:5810
/// - "127.0.0.1:5811" -> 127.0.0.1:5811
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, nettables::protocol::DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: simple_server [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:5810)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ServerConfig::default();
    if let Some(addr_str) = args.get(1) {
        match parse_bind_addr(addr_str) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nettables=debug".parse()?)
                .add_directive("simple_server=debug".parse()?),
        )
        .init();

    println!("Starting table server on {}", config.bind_addr);

    let server = TableServer::new(config);
    let local = server.instance().local_client("server");

    let _connections = local.add_connection_listener(true, |event| match event {
        ConnectionEvent::Connected(info) => {
            println!("[{}] Connected: {} from {}", info.id, info.name, info.peer_string())
        }
        ConnectionEvent::Disconnected(info) => println!("[{}] Disconnected", info.id),
    })?;

    let uptime = local.publish("/server/uptime", ValueType::Double)?;
    let started = Instant::now();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if let Err(e) = uptime.set(started.elapsed().as_secs_f64()) {
                tracing::warn!(error = %e, "Failed to update uptime");
            }
        }
    });

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                eprintln!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            let stats = server.stats().snapshot();
            println!(
                "Stats: connections={} rejected={} bytes_in={} bytes_out={}",
                stats.total_connections,
                stats.rejected_connections,
                stats.total_bytes_received,
                stats.total_bytes_sent,
            );
        }
    }

    Ok(())
}
