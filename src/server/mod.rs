//! RPC server implementation

pub mod pipes;

use crate::dcerpc::bind::AssocGroupAllocator;
use crate::dcerpc::endpoint::RpcEndpoint;
use crate::dcerpc::services::srvsvc::ShareEntry;
use crate::dcerpc::services::{HostIdentity, ServiceRegistry};
use crate::dcerpc::transport::{read_pdu, with_deadline};
use crate::error::{Error, Result};
use bytes::BytesMut;
use pipes::PipeManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// RPC server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name
    pub server_name: String,
    /// Server comment reported by the server service
    pub server_comment: String,
    /// Workgroup/domain name
    pub domain: String,
    /// Reported OS version
    pub version_major: u32,
    pub version_minor: u32,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Idle time after which a connection is dropped
    pub read_timeout: Option<Duration>,
    /// Published shares; IPC$ is always added
    pub shares: Vec<ShareEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let identity = HostIdentity::default();
        Self {
            server_name: identity.server_name,
            server_comment: identity.comment,
            domain: identity.domain,
            version_major: identity.version_major,
            version_minor: identity.version_minor,
            max_connections: 100,
            read_timeout: Some(Duration::from_secs(300)),
            shares: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Identity reported by the services
    pub fn identity(&self) -> HostIdentity {
        HostIdentity {
            server_name: self.server_name.clone(),
            comment: self.server_comment.clone(),
            domain: self.domain.clone(),
            version_major: self.version_major,
            version_minor: self.version_minor,
        }
    }
}

/// RPC server: serves the registered services over TCP and named pipes
pub struct RpcServer {
    config: ServerConfig,
    registry: ServiceRegistry,
    allocator: Arc<AssocGroupAllocator>,
    pipes: Arc<PipeManager>,
}

impl RpcServer {
    /// Create a new RPC server with default config
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a new RPC server with custom config
    pub fn with_config(config: ServerConfig) -> Self {
        let registry = ServiceRegistry::with_defaults(config.identity(), config.shares.clone());
        let allocator = Arc::new(AssocGroupAllocator::new());
        let pipes = Arc::new(PipeManager::new(registry.clone(), allocator.clone()));
        Self {
            config,
            registry,
            allocator,
            pipes,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Named pipes backed by the same services and association groups
    pub fn pipe_manager(&self) -> Arc<PipeManager> {
        Arc::clone(&self.pipes)
    }

    /// Run the RPC server on the specified address
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until it fails
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("RPC server listening on {}", local_addr);
        info!("Server name: {}", self.config.server_name);
        info!("Domain: {}", self.config.domain);
        info!("Pipes: {}", self.registry.pipe_names().join(", "));

        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let permit = match Arc::clone(&limit).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        "Refusing connection from {}: {} connections open",
                        remote_addr, self.config.max_connections
                    );
                    continue;
                }
            };
            info!("New connection from {}", remote_addr);

            let endpoint = RpcEndpoint::with_registry(self.registry.clone(), self.allocator.clone());
            let read_timeout = self.config.read_timeout;

            // Spawn a task to handle the connection
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, endpoint, read_timeout).await {
                    error!("Connection error from {}: {}", remote_addr, e);
                }
                debug!("Connection from {} closed", remote_addr);
                drop(permit);
            });
        }
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve one TCP connection until the peer closes it
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    mut endpoint: RpcEndpoint,
    read_timeout: Option<Duration>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(8192);

    loop {
        let pdu = match with_deadline(read_timeout, read_pdu(&mut stream, &mut buffer)).await {
            Ok(Some(pdu)) => pdu,
            Ok(None) => return Ok(()),
            Err(Error::Timeout) => {
                debug!("Connection idle for {:?}, closing", read_timeout);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for response in endpoint.process(&pdu)? {
            stream.write_all(&response).await?;
        }
        stream.flush().await?;
    }
}
