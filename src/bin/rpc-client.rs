//! DCE/RPC client CLI

use clap::{Parser, Subcommand};
use smb_rpc::client::{ClientConfig, RpcClient};
use smb_rpc::dcerpc::interfaces;
use smb_rpc::dcerpc::services::srvsvc::{ServerInfo, ShareInfo};
use smb_rpc::dcerpc::transport::TcpTransport;
use smb_rpc::error::WError;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rpc-client")]
#[command(about = "Rust DCE/RPC Client", long_about = None)]
struct Args {
    /// RPC server address or hostname
    #[arg(short = 'H', long)]
    host: String,

    /// Port to connect to
    #[arg(short = 'p', long, default_value = "4135")]
    port: u16,

    /// Largest fragment to send and receive
    #[arg(short = 'f', long, default_value = "4280")]
    max_frag: u16,

    /// Seconds to wait for each reply
    #[arg(short = 't', long, default_value = "30")]
    timeout: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List shares (NetrShareEnum)
    Shares {
        #[arg(short = 'L', long, default_value = "1")]
        level: u32,
    },

    /// Show one share (NetrShareGetInfo)
    ShareInfo {
        /// Share name
        name: String,
        #[arg(short = 'L', long, default_value = "1")]
        level: u32,
    },

    /// Show server information (NetrServerGetInfo)
    ServerInfo {
        #[arg(short = 'L', long, default_value = "101")]
        level: u32,
    },

    /// Show workstation information (NetrWkstaGetInfo)
    WkstaInfo {
        #[arg(short = 'L', long, default_value = "100")]
        level: u32,
    },
}

fn check_status(status: u32) -> Result<(), Box<dyn std::error::Error>> {
    if status == 0 {
        return Ok(());
    }
    let name = WError::from_u32(status)
        .map(|e| format!("{:?}", e))
        .unwrap_or_else(|| "unknown".to_string());
    Err(format!("server returned WERROR 0x{:08x} ({})", status, name).into())
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

    let timeout = Duration::from_secs(args.timeout);
    let endpoint = format!("{}:{}", args.host, args.port);
    let mut transport = TcpTransport::new(&endpoint).with_read_timeout(timeout);
    transport.connect().await?;

    let config = ClientConfig {
        max_xmit_frag: args.max_frag,
        max_recv_frag: args.max_frag,
        read_timeout: timeout,
    };
    let mut client = RpcClient::with_config(transport, config);
    let server_name = format!("\\\\{}", args.host);

    match args.command {
        Commands::Shares { level } => {
            client.bind(&interfaces::srvsvc()).await?;
            let response = client.share_enum(&server_name, level).await?;
            check_status(response.status)?;
            println!("{} share(s):", response.total_entries);
            for name in response.share_names() {
                println!("  {}", name);
            }
        }
        Commands::ShareInfo { name, level } => {
            client.bind(&interfaces::srvsvc()).await?;
            let response = client.share_get_info(&server_name, &name, level).await?;
            check_status(response.status)?;
            match &response.info {
                ShareInfo::Level0(info) => {
                    if let Some(info) = info.get() {
                        println!("Name: {}", info.netname.as_str().unwrap_or(""));
                    }
                }
                ShareInfo::Level1(info) => {
                    if let Some(info) = info.get() {
                        println!("Name:    {}", info.netname.as_str().unwrap_or(""));
                        println!("Type:    0x{:08x}", info.share_type);
                        println!("Comment: {}", info.remark.as_str().unwrap_or(""));
                    }
                }
                ShareInfo::Unknown(level) => println!("Level {} not understood", level),
            }
        }
        Commands::ServerInfo { level } => {
            client.bind(&interfaces::srvsvc()).await?;
            let response = client.server_get_info(&server_name, level).await?;
            check_status(response.status)?;
            match &response.info {
                ServerInfo::Level100(info) => {
                    if let Some(info) = info.get() {
                        println!("Platform: {}", info.platform_id);
                        println!("Name:     {}", info.name.as_str().unwrap_or(""));
                    }
                }
                ServerInfo::Level101(info) => {
                    if let Some(info) = info.get() {
                        println!("Platform: {}", info.platform_id);
                        println!("Name:     {}", info.name.as_str().unwrap_or(""));
                        println!("Version:  {}.{}", info.version_major, info.version_minor);
                        println!("Type:     0x{:08x}", info.server_type);
                        println!("Comment:  {}", info.comment.as_str().unwrap_or(""));
                    }
                }
                ServerInfo::Unknown(level) => println!("Level {} not understood", level),
            }
        }
        Commands::WkstaInfo { level } => {
            client.bind(&interfaces::wkssvc()).await?;
            let response = client.wksta_get_info(&server_name, level).await?;
            check_status(response.status)?;
            println!("Computer: {}", response.info.computer_name().unwrap_or(""));
            println!("Domain:   {}", response.info.lan_group().unwrap_or(""));
        }
    }

    client.close().await?;
    Ok(())
}
