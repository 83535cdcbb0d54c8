//! Named pipe support for the SMB side of the server
//!
//! Maps `\PIPE\name` opens on the IPC$ share to RPC endpoints

use crate::dcerpc::bind::AssocGroupAllocator;
use crate::dcerpc::endpoint::RpcEndpoint;
use crate::dcerpc::packet::RpcHeader;
use crate::dcerpc::services::{strip_pipe_prefix, ServiceRegistry};
use crate::dcerpc::COMMON_HEADER_LENGTH;
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Largest single write accepted by a pipe
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;

/// A pipe instance shared between the SMB handler and its transports
pub type SharedPipe = Arc<Mutex<NamedPipe>>;

/// One open instance of an RPC named pipe
pub struct NamedPipe {
    /// Instance id assigned by the manager
    pub id: u64,
    /// Pipe name (without \\pipe\\ prefix)
    pub name: String,
    /// Maximum message size
    pub max_message_size: usize,
    endpoint: RpcEndpoint,
    /// Bytes written by the client that do not yet form a whole PDU
    inbound: BytesMut,
    /// Serialized PDUs waiting to be read by the client
    outbound: BytesMut,
}

impl NamedPipe {
    /// Create a pipe instance talking to `endpoint`
    pub fn new(id: u64, name: String, endpoint: RpcEndpoint) -> Self {
        Self {
            id,
            name,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            endpoint,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
        }
    }

    /// Write data to the pipe. Every complete PDU is processed at once
    /// and its answers queued for reading.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > self.max_message_size {
            return Err(Error::InvalidParameter("Message too large".to_string()));
        }
        debug!("Pipe {}: write of {} bytes", self.name, data.len());

        self.inbound.extend_from_slice(data);
        while self.inbound.len() >= COMMON_HEADER_LENGTH {
            let frag_length = RpcHeader::peek_frag_length(&self.inbound)?;
            if frag_length < COMMON_HEADER_LENGTH {
                self.inbound.clear();
                return Err(Error::malformed_pdu(
                    8,
                    format!("fragment length {} shorter than the header", frag_length),
                ));
            }
            if self.inbound.len() < frag_length {
                break;
            }
            let pdu = self.inbound.split_to(frag_length);
            for response in self.endpoint.process(&pdu)? {
                self.outbound.extend_from_slice(&response);
            }
        }
        Ok(data.len())
    }

    /// Read data from the pipe
    pub fn read(&mut self, max_len: usize) -> Vec<u8> {
        let len = std::cmp::min(self.outbound.len(), max_len);
        self.outbound.split_to(len).to_vec()
    }

    /// Peek at data without removing it
    pub fn peek(&self, max_len: usize) -> Vec<u8> {
        let len = std::cmp::min(self.outbound.len(), max_len);
        self.outbound[..len].to_vec()
    }

    /// Bytes waiting to be read
    pub fn available(&self) -> usize {
        self.outbound.len()
    }

    /// Pop the next whole queued PDU
    pub fn read_pdu(&mut self) -> Option<Vec<u8>> {
        let frag_length = RpcHeader::peek_frag_length(&self.outbound).ok()?;
        if frag_length < COMMON_HEADER_LENGTH || frag_length > self.outbound.len() {
            return None;
        }
        Some(self.outbound.split_to(frag_length).to_vec())
    }

    /// Transceive - write then read in one operation
    pub fn transceive(&mut self, write_data: &[u8], max_read: usize) -> Result<Vec<u8>> {
        self.write(write_data)?;
        Ok(self.read(max_read))
    }

    /// Drop anything not yet read
    pub fn discard(&mut self) {
        let pending = self.outbound.remaining();
        self.outbound.clear();
        self.inbound.clear();
        if pending > 0 {
            debug!("Pipe {}: discarded {} unread bytes", self.name, pending);
        }
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }
}

/// Named pipe manager
pub struct PipeManager {
    registry: ServiceRegistry,
    allocator: Arc<AssocGroupAllocator>,
    /// Open pipe instances by id
    pipes: Arc<RwLock<HashMap<u64, SharedPipe>>>,
    next_id: AtomicU64,
}

impl PipeManager {
    /// Create a pipe manager serving the services of `registry`
    pub fn new(registry: ServiceRegistry, allocator: Arc<AssocGroupAllocator>) -> Self {
        Self {
            registry,
            allocator,
            pipes: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a new instance of a named pipe
    pub async fn open_pipe(&self, name: &str) -> Result<SharedPipe> {
        let clean_name = strip_pipe_prefix(name);
        let service = self.registry.by_pipe(clean_name).ok_or_else(|| {
            Error::InvalidParameter(format!("Pipe '{}' not found", name))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = RpcEndpoint::for_service(service, self.allocator.clone());
        let pipe = Arc::new(Mutex::new(NamedPipe::new(
            id,
            clean_name.to_ascii_lowercase(),
            endpoint,
        )));
        self.pipes.write().await.insert(id, Arc::clone(&pipe));
        debug!("Opened pipe {} as instance {}", clean_name, id);

        Ok(pipe)
    }

    /// Check if a pipe name is served
    pub fn pipe_exists(&self, name: &str) -> bool {
        self.registry.by_pipe(name).is_some()
    }

    /// Close a pipe instance. Returns whether it was open.
    pub async fn close_pipe(&self, id: u64) -> bool {
        let removed = self.pipes.write().await.remove(&id);
        match removed {
            Some(pipe) => {
                pipe.lock().await.discard();
                true
            }
            None => false,
        }
    }

    /// Number of open pipe instances
    pub async fn open_count(&self) -> usize {
        self.pipes.read().await.len()
    }

    /// Names of all pipes that can be opened
    pub fn pipe_names(&self) -> Vec<String> {
        self.registry.pipe_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcerpc::packet::{BindAckPacket, ResponsePacket};
    use crate::dcerpc::services::HostIdentity;
    use crate::dcerpc::PacketType;

    fn manager() -> PipeManager {
        PipeManager::new(
            ServiceRegistry::with_defaults(HostIdentity::default(), Vec::new()),
            Arc::new(AssocGroupAllocator::new()),
        )
    }

    /// Bind to srvsvc as captured from a Windows client
    fn srvsvc_bind_bytes() -> Vec<u8> {
        vec![
            5, 0,    // Version 5.0
            11,   // Type = bind (11)
            0x03, // Flags (first_frag | last_frag)
            0x10, 0x00, 0x00, 0x00, // Data representation
            0x48, 0x00, // Fragment length (72)
            0x00, 0x00, // Auth length
            0x01, 0x00, 0x00, 0x00, // Call ID
            0x00, 0x10, // Max xmit frag
            0x00, 0x10, // Max recv frag
            0x00, 0x00, 0x00, 0x00, // Assoc group
            0x01, 0x00, 0x00, 0x00, // Num contexts
            0x00, 0x00, // Context ID
            0x01, 0x00, // Num transfer syntaxes
            // Interface UUID for srvsvc (16 bytes)
            0xc8, 0x4f, 0x32, 0x4b, // time_low
            0x70, 0x16, // time_mid
            0xd3, 0x01, // time_hi_and_version
            0x12, 0x78, // clock_seq_hi_and_reserved, clock_seq_low
            0x5a, 0x47, 0xbf, 0x6e, 0xe1, 0x88, // node
            0x03, 0x00, // Interface version
            0x00, 0x00, // Interface version minor
            // Transfer syntax UUID (NDR) (16 bytes)
            0x04, 0x5d, 0x88, 0x8a, // time_low
            0xeb, 0x1c, // time_mid
            0xc9, 0x11, // time_hi_and_version
            0x9f, 0xe8, // clock_seq_hi_and_reserved, clock_seq_low
            0x08, 0x00, 0x2b, 0x10, 0x48, 0x60, // node
            0x02, 0x00, 0x00, 0x00, // Transfer syntax version
        ]
    }

    #[tokio::test]
    async fn test_pipe_creation() {
        let manager = manager();
        let pipe = manager.open_pipe("\\PIPE\\SrvSvc").await.unwrap();
        let pipe = pipe.lock().await;
        assert_eq!(pipe.name, "srvsvc");
        assert!(pipe.endpoint().service().is_some());
        assert_eq!(manager.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_pipe() {
        let manager = manager();
        assert!(manager.open_pipe("\\pipe\\samr").await.is_err());
        assert!(!manager.pipe_exists("samr"));
        assert!(manager.pipe_exists("\\PIPE\\wkssvc"));
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let manager = manager();
        let first = manager.open_pipe("srvsvc").await.unwrap();
        let second = manager.open_pipe("srvsvc").await.unwrap();

        first.lock().await.write(&srvsvc_bind_bytes()).unwrap();
        assert!(first.lock().await.available() > 0);
        assert_eq!(second.lock().await.available(), 0);

        let id = first.lock().await.id;
        assert!(manager.close_pipe(id).await);
        assert!(!manager.close_pipe(id).await);
        assert_eq!(manager.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_rpc_pipe_bind() {
        let manager = manager();
        let pipe = manager.open_pipe("srvsvc").await.unwrap();
        let mut pipe = pipe.lock().await;

        let response = pipe.transceive(&srvsvc_bind_bytes(), 1024).unwrap();
        let ack = BindAckPacket::deserialize(&response).unwrap();
        assert_eq!(ack.header.packet_type, PacketType::BindAck);
        assert_eq!(ack.header.call_id, 1);
        assert!(ack.results[0].is_accepted());
        assert_eq!(ack.secondary_address, "\\PIPE\\srvsvc");
    }

    #[tokio::test]
    async fn test_pipe_read_and_peek() {
        let manager = manager();
        let pipe = manager.open_pipe("srvsvc").await.unwrap();
        let mut pipe = pipe.lock().await;
        pipe.write(&srvsvc_bind_bytes()).unwrap();
        let total = pipe.available();

        // Peek doesn't remove data
        let head = pipe.peek(4);
        assert_eq!(head, vec![5, 0, 12, 3]);
        assert_eq!(pipe.available(), total);

        let first = pipe.read(10);
        let rest = pipe.read(total);
        assert_eq!(first.len() + rest.len(), total);
        assert_eq!(pipe.available(), 0);
    }

    #[tokio::test]
    async fn test_split_write() {
        let manager = manager();
        let pipe = manager.open_pipe("srvsvc").await.unwrap();
        let mut pipe = pipe.lock().await;

        let bind = srvsvc_bind_bytes();
        pipe.write(&bind[..30]).unwrap();
        assert_eq!(pipe.available(), 0);
        pipe.write(&bind[30..]).unwrap();
        assert!(pipe.read_pdu().is_some());
        assert!(pipe.read_pdu().is_none());
    }

    #[tokio::test]
    async fn test_request_through_pipe() {
        use crate::dcerpc::ndr::NdrMessage;
        use crate::dcerpc::packet::RequestPacket;
        use crate::dcerpc::services::srvsvc::{NetrShareEnumRequest, NetrShareEnumResponse};

        let manager = manager();
        let pipe = manager.open_pipe("srvsvc").await.unwrap();
        let mut pipe = pipe.lock().await;
        pipe.transceive(&srvsvc_bind_bytes(), 1024).unwrap();

        let stub = NetrShareEnumRequest::new("\\\\SERVER", 0).to_bytes().unwrap();
        let request = RequestPacket::new(2, 0, 15, stub).serialize().unwrap();
        pipe.write(&request).unwrap();
        let response = ResponsePacket::deserialize(&pipe.read_pdu().unwrap()).unwrap();
        let result = NetrShareEnumResponse::from_bytes(&response.stub_data).unwrap();
        assert_eq!(result.share_names(), vec!["IPC$"]);
    }

    #[test]
    fn test_oversized_write() {
        let registry = ServiceRegistry::with_defaults(HostIdentity::default(), Vec::new());
        let endpoint = RpcEndpoint::for_service(
            registry.by_pipe("srvsvc").unwrap(),
            Arc::new(AssocGroupAllocator::new()),
        );
        let mut pipe = NamedPipe::new(1, "srvsvc".to_string(), endpoint);
        pipe.max_message_size = 16;
        assert!(matches!(
            pipe.write(&[0u8; 17]),
            Err(Error::InvalidParameter(_))
        ));
    }
}
