//! DCE/RPC server exposing SRVSVC and WKSSVC

use clap::Parser;
use smb_rpc::dcerpc::services::srvsvc::ShareEntry;
use smb_rpc::server::{RpcServer, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rpc-server")]
#[command(about = "Rust DCE/RPC Server", long_about = None)]
struct Args {
    /// Server name
    #[arg(short = 'n', long, default_value = "RUST-RPC-SERVER")]
    server_name: String,

    /// Server comment
    #[arg(short = 'c', long, default_value = "Rust RPC Server")]
    comment: String,

    /// Workgroup/domain name
    #[arg(short = 'w', long, default_value = "WORKGROUP")]
    domain: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value = "4135")]
    port: u16,

    /// Bind address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind: String,

    /// Maximum connections
    #[arg(long, default_value = "100")]
    max_connections: usize,

    /// Seconds a connection may stay idle
    #[arg(long, default_value = "300")]
    idle_timeout: u64,

    /// Share definitions (can be specified multiple times)
    /// Format: name:path[:comment]
    #[arg(short = 's', long, value_parser = parse_share)]
    shares: Vec<ShareEntry>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn parse_share(s: &str) -> Result<ShareEntry, String> {
    let parts: Vec<&str> = s.splitn(3, ':').collect();
    if parts.len() < 2 || parts[0].is_empty() {
        return Err("Share format: name:path[:comment]".to_string());
    }

    Ok(ShareEntry::disk(
        parts[0],
        parts[1],
        parts.get(2).copied().unwrap_or(""),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    for share in &args.shares {
        tracing::info!("Adding share '{}' -> {}", share.name, share.path);
    }

    let config = ServerConfig {
        server_name: args.server_name,
        server_comment: args.comment,
        domain: args.domain,
        max_connections: args.max_connections,
        read_timeout: Some(Duration::from_secs(args.idle_timeout)),
        shares: args.shares,
        ..ServerConfig::default()
    };
    let server = RpcServer::with_config(config);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    tracing::info!("Press Ctrl+C to stop");
    tracing::info!("Test with:");
    tracing::info!("  rpc-client -H 127.0.0.1 -p {} shares", args.port);

    // Handle shutdown signal
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, stopping server...");
        std::process::exit(0);
    });

    server.run(addr).await?;

    Ok(())
}
