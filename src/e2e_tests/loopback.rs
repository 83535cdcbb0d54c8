//! Loopback connections between an RPC client and server in one process

use crate::client::RpcClient;
use crate::dcerpc::bind::AssocGroupAllocator;
use crate::dcerpc::endpoint::RpcEndpoint;
use crate::dcerpc::services::{HostIdentity, ServiceRegistry};
use crate::dcerpc::transport::TcpTransport;
use crate::error::Result;
use crate::server::handle_connection;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// A connected pair of TCP streams on localhost
pub struct LoopbackTransport;

impl LoopbackTransport {
    /// Create a client/server stream pair using TCP on localhost
    pub async fn new() -> Result<(TcpStream, TcpStream)> {
        // Bind to a random port on localhost
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let client_future = TcpStream::connect(addr);
        let server_future = async { listener.accept().await.map(|(stream, _)| stream) };

        let (client_stream, server_stream) = tokio::try_join!(client_future, server_future)?;

        Ok((client_stream, server_stream))
    }
}

/// A single server connection task with a client on the other end
pub struct TestHarness {
    server_handle: Option<tokio::task::JoinHandle<Result<()>>>,
    client: Option<RpcClient<TcpTransport>>,
}

impl TestHarness {
    /// Serve the default services on one loopback connection
    pub async fn new() -> Result<Self> {
        let registry = ServiceRegistry::with_defaults(HostIdentity::default(), Vec::new());
        Self::with_registry(registry).await
    }

    pub async fn with_registry(registry: ServiceRegistry) -> Result<Self> {
        let (client_stream, server_stream) = LoopbackTransport::new().await?;

        let endpoint = RpcEndpoint::with_registry(registry, Arc::new(AssocGroupAllocator::new()));
        let server_handle = tokio::spawn(handle_connection(server_stream, endpoint, None));

        Ok(Self {
            server_handle: Some(server_handle),
            client: Some(RpcClient::new(TcpTransport::from_stream(client_stream))),
        })
    }

    /// Take the client; the harness keeps the server task
    pub fn client(&mut self) -> Option<RpcClient<TcpTransport>> {
        self.client.take()
    }

    /// Close the client side and wait for the server task to finish
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(mut client) = self.client.take() {
            client.close().await?;
        }
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| crate::error::Error::ConnectionError(e.to_string()))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcerpc::interfaces;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_loopback_transport() {
        let (mut client, mut server) = LoopbackTransport::new().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_harness_serves_one_client() {
        let mut harness = TestHarness::new().await.unwrap();
        let mut client = harness.client().unwrap();

        client.bind(&interfaces::srvsvc()).await.unwrap();
        let response = client.share_enum("\\\\localhost", 1).await.unwrap();
        assert_eq!(response.share_names(), vec!["IPC$"]);

        client.close().await.unwrap();
        harness.shutdown().await.unwrap();
    }
}
