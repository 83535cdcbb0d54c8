//! Shared context for end-to-end tests

use crate::client::{ClientConfig, RpcClient};
use crate::dcerpc::transport::{NamedPipeTransport, TcpTransport};
use crate::error::{Error, Result};
use crate::server::{RpcServer, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A running server on a loopback listener
pub struct TestContext {
    pub server: Arc<RpcServer>,
    pub addr: SocketAddr,
    server_task: JoinHandle<Result<()>>,
}

impl TestContext {
    /// Start a server with the default configuration
    pub async fn new() -> Result<Self> {
        Self::with_config(ServerConfig::default()).await
    }

    pub async fn with_config(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = Arc::new(RpcServer::with_config(config));
        let task_server = Arc::clone(&server);
        let server_task = tokio::spawn(async move { task_server.serve(listener).await });

        Ok(Self {
            server,
            addr,
            server_task,
        })
    }

    /// Connect a new TCP client
    pub async fn client(&self) -> Result<RpcClient<TcpTransport>> {
        self.client_with_config(ClientConfig::default()).await
    }

    pub async fn client_with_config(&self, config: ClientConfig) -> Result<RpcClient<TcpTransport>> {
        let mut transport =
            TcpTransport::new(&self.addr.to_string()).with_read_timeout(config.read_timeout);
        transport.connect().await?;
        Ok(RpcClient::with_config(transport, config))
    }

    /// Open a pipe instance and wrap it in a client
    pub async fn pipe_client(&self, name: &str) -> Result<RpcClient<NamedPipeTransport>> {
        let pipe = self.server.pipe_manager().open_pipe(name).await?;
        Ok(RpcClient::new(NamedPipeTransport::new(name, pipe)))
    }

    /// Stop the accept loop
    pub async fn shutdown(self) -> Result<()> {
        self.server_task.abort();
        match self.server_task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::ConnectionError(e.to_string())),
        }
    }
}
