//! DCE/RPC services implementation
//!
//! A service is an interface identifier, the named pipe it listens on and
//! a table of operation handlers. Handlers are opaque byte-in/byte-out
//! functions that do their own NDR work.
//! - SRVSVC: Server Service for share enumeration and server info
//! - WKSSVC: Workstation Service for workstation identity queries

pub mod srvsvc;
pub mod wkssvc;

use crate::dcerpc::ndr::NdrDecoder;
use crate::dcerpc::packet::BindPacket;
use crate::dcerpc::{RpcInterface, SyntaxId, SUPPORTED_TRANSFER_SYNTAXES};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Handler for one operation number: request stub in, response stub out
pub type OperationHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Operation number to handler mapping
#[derive(Default)]
pub struct OperationTable {
    handlers: HashMap<u16, OperationHandler>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `opnum`
    pub fn register<F>(&mut self, opnum: u16, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers.insert(opnum, Box::new(handler));
    }

    pub fn get(&self, opnum: u16) -> Option<&OperationHandler> {
        self.handlers.get(&opnum)
    }

    pub fn contains(&self, opnum: u16) -> bool {
        self.handlers.contains_key(&opnum)
    }

    /// Registered operation numbers in ascending order
    pub fn opnums(&self) -> Vec<u16> {
        let mut opnums: Vec<u16> = self.handlers.keys().copied().collect();
        opnums.sort_unstable();
        opnums
    }
}

impl fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTable")
            .field("opnums", &self.opnums())
            .finish()
    }
}

/// RPC service trait
pub trait RpcService: Send + Sync {
    /// Get the interface definition
    fn interface(&self) -> &RpcInterface;

    /// Pipe name without the `\PIPE\` prefix, e.g. `srvsvc`
    fn pipe_name(&self) -> &str;

    /// Transfer syntaxes the service can speak
    fn transfer_syntaxes(&self) -> &[SyntaxId] {
        &SUPPORTED_TRANSFER_SYNTAXES
    }

    /// Handlers keyed by operation number
    fn operations(&self) -> &OperationTable;

    /// Get service name
    fn name(&self) -> &str {
        &self.interface().name
    }
}

/// Identity reported by the server and workstation services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub server_name: String,
    pub comment: String,
    pub domain: String,
    pub version_major: u32,
    pub version_minor: u32,
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self {
            server_name: "RUST-RPC-SERVER".to_string(),
            comment: "Rust RPC Server".to_string(),
            domain: "WORKGROUP".to_string(),
            version_major: 10,
            version_minor: 0,
        }
    }
}

/// RPC service registry
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<Uuid, Arc<dyn RpcService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service
    pub fn register(&mut self, service: Arc<dyn RpcService>) {
        let uuid = service.interface().uuid;
        self.services.insert(uuid, service);
    }

    /// Get a service by interface UUID
    pub fn get(&self, uuid: &Uuid) -> Option<Arc<dyn RpcService>> {
        self.services.get(uuid).cloned()
    }

    /// Get a service by pipe name, ignoring case and any `\PIPE\` prefix
    pub fn by_pipe(&self, pipe_name: &str) -> Option<Arc<dyn RpcService>> {
        let name = strip_pipe_prefix(pipe_name);
        self.services
            .values()
            .find(|service| service.pipe_name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// The service named by the first abstract syntax of `bind` that any
    /// registered service implements
    pub fn find_for_bind(&self, bind: &BindPacket) -> Option<Arc<dyn RpcService>> {
        bind.contexts
            .iter()
            .find_map(|context| self.get(&context.abstract_syntax.uuid))
    }

    /// Pipe names of all registered services, sorted
    pub fn pipe_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .values()
            .map(|service| service.pipe_name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Initialize with the SRVSVC and WKSSVC services
    pub fn with_defaults(identity: HostIdentity, shares: Vec<srvsvc::ShareEntry>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(srvsvc::SrvSvcService::new(identity.clone(), shares)));
        registry.register(Arc::new(wkssvc::WksSvcService::new(identity)));
        registry
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("pipes", &self.pipe_names())
            .finish()
    }
}

/// Read the pointer arm of an info union whose level has no known layout.
/// Only a null arm can be skipped safely.
pub(crate) fn decode_unknown_arm(decoder: &mut NdrDecoder<'_>, level: u32) -> Result<u32> {
    let offset = decoder.position();
    if decoder.decode_u32()? != 0 {
        return Err(Error::malformed_ndr(
            offset,
            format!("non-null referent for unknown info level {}", level),
        ));
    }
    Ok(level)
}

/// Strip a leading `\PIPE\` (any case) from a pipe path
pub fn strip_pipe_prefix(pipe_name: &str) -> &str {
    let trimmed = pipe_name.trim_start_matches('\\');
    match trimmed.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("pipe\\") => &trimmed[5..],
        _ => trimmed,
    }
}
