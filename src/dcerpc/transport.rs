//! DCE/RPC transport layer - handles RPC over named pipes and TCP

use crate::dcerpc::packet::RpcHeader;
use crate::dcerpc::COMMON_HEADER_LENGTH;
use crate::error::{Error, Result};
use bytes::BytesMut;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(feature = "server")]
use crate::server::pipes::SharedPipe;

/// RPC transport type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// RPC over SMB named pipes
    NamedPipe,
    /// RPC directly over TCP
    Tcp,
}

/// RPC transport trait
#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send one serialized PDU
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive exactly one PDU
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&mut self) -> Result<()>;
}

/// Read one whole PDU from a byte stream.
///
/// Bytes past the PDU stay in `buffer` for the next call. Returns `None`
/// when the stream ends cleanly between PDUs.
pub async fn read_pdu<R>(reader: &mut R, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if buffer.len() >= COMMON_HEADER_LENGTH {
            let frag_length = RpcHeader::peek_frag_length(&buffer[..COMMON_HEADER_LENGTH])?;
            if frag_length < COMMON_HEADER_LENGTH {
                return Err(Error::malformed_pdu(
                    8,
                    format!("fragment length {} shorter than the header", frag_length),
                ));
            }
            if buffer.len() >= frag_length {
                return Ok(Some(buffer.split_to(frag_length).to_vec()));
            }
            buffer.reserve(frag_length - buffer.len());
        }

        if reader.read_buf(buffer).await? == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            debug!("Stream closed with {} bytes of a partial PDU", buffer.len());
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Run `operation` under an optional deadline
pub(crate) async fn with_deadline<T, F>(deadline: Option<Duration>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| Error::Timeout)?,
        None => operation.await,
    }
}

/// Named pipe transport for RPC over SMB.
///
/// Talks to a pipe opened through the server's pipe manager; every
/// write runs the pipe's endpoint and queues its answers for `receive`.
#[cfg(feature = "server")]
pub struct NamedPipeTransport {
    pipe_name: String,
    handle: Option<SharedPipe>,
}

#[cfg(feature = "server")]
impl NamedPipeTransport {
    pub fn new(pipe_name: &str, handle: SharedPipe) -> Self {
        Self {
            pipe_name: pipe_name.to_string(),
            handle: Some(handle),
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    fn handle(&self) -> Result<&SharedPipe> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::ConnectionError("Pipe not connected".to_string()))
    }
}

#[cfg(feature = "server")]
#[async_trait::async_trait]
impl RpcTransport for NamedPipeTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut pipe = self.handle()?.lock().await;
        pipe.write(data)?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut pipe = self.handle()?.lock().await;
        pipe.read_pdu().ok_or_else(|| {
            Error::InvalidState(format!("no pending data on pipe {}", self.pipe_name))
        })
    }

    fn transport_type(&self) -> TransportType {
        TransportType::NamedPipe
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        self.handle = None;
        Ok(())
    }
}

/// TCP transport for RPC
pub struct TcpTransport {
    stream: Option<TcpStream>,
    endpoint: String,
    buffer: BytesMut,
    read_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
            buffer: BytesMut::with_capacity(8192),
            read_timeout: None,
        }
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        let endpoint = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        Self {
            stream: Some(stream),
            endpoint,
            buffer: BytesMut::with_capacity(8192),
            read_timeout: None,
        }
    }

    /// Bound every receive by `timeout`
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub async fn connect(&mut self) -> Result<()> {
        let stream = with_deadline(self.read_timeout, async {
            TcpStream::connect(&self.endpoint).await.map_err(Error::from)
        })
        .await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", self.endpoint);
        self.stream = Some(stream);
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl RpcTransport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ConnectionError("Not connected".to_string()))?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ConnectionError("Not connected".to_string()))?;
        let buffer = &mut self.buffer;
        with_deadline(self.read_timeout, read_pdu(stream, buffer))
            .await?
            .ok_or(Error::ConnectionClosed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcerpc::packet::ResponsePacket;

    fn pdu(call_id: u32, stub_len: usize) -> Vec<u8> {
        ResponsePacket::new(call_id, 0, vec![0xAB; stub_len])
            .serialize()
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_pdu_splits_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let first = pdu(1, 10);
        let second = pdu(2, 100);

        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let writer = tokio::spawn(async move {
            client.write_all(&stream).await.unwrap();
        });

        let mut buffer = BytesMut::new();
        assert_eq!(read_pdu(&mut server, &mut buffer).await.unwrap(), Some(first));
        assert_eq!(read_pdu(&mut server, &mut buffer).await.unwrap(), Some(second));
        writer.await.unwrap();
        assert_eq!(read_pdu(&mut server, &mut buffer).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_pdu_partial_then_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bytes = pdu(1, 10);
        client.write_all(&bytes[..20]).await.unwrap();
        drop(client);

        let mut buffer = BytesMut::new();
        assert!(matches!(
            read_pdu(&mut server, &mut buffer).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buffer = BytesMut::new();
        let result = with_deadline(
            Some(Duration::from_millis(20)),
            read_pdu(&mut server, &mut buffer),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_tcp_transport_not_connected() {
        let mut transport = TcpTransport::new("127.0.0.1:1");
        assert!(!transport.is_connected());
        assert_eq!(transport.transport_type(), TransportType::Tcp);
        assert!(matches!(
            transport.send(&[0u8; 16]).await,
            Err(Error::ConnectionError(_))
        ));
    }
}
