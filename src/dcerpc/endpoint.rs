//! Server side of one RPC association: binds, reassembles request
//! fragments, dispatches calls and fragments the answers.

use crate::dcerpc::bind::{AssocGroupAllocator, BindNegotiator};
use crate::dcerpc::dispatch::{dispatch, fault_status_for};
use crate::dcerpc::fragment::{fragment_response, FragmentAssembler};
use crate::dcerpc::packet::{
    BindAckPacket, BindNakPacket, BindPacket, FaultPacket, Pdu, RequestPacket, RpcHeader,
};
use crate::dcerpc::services::{RpcService, ServiceRegistry};
use crate::dcerpc::{
    BindNakReason, FaultStatus, PacketType, SyntaxId, DCERPC_VERSION_MAJOR, DEFAULT_MAX_FRAG,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bytes shown by the hex traces before truncating
const HEX_TRACE_LIMIT: usize = 256;

/// Space separated hex of at most the first 256 bytes
pub(crate) fn hex_preview(data: &[u8]) -> String {
    data.iter()
        .take(HEX_TRACE_LIMIT)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// How the endpoint finds the service it talks to
enum ServiceSource {
    /// Named pipes: the pipe decides the service up front
    Fixed,
    /// TCP: each bind picks a registered service
    Registry(ServiceRegistry),
}

/// Per-connection RPC state machine
pub struct RpcEndpoint {
    source: ServiceSource,
    service: Option<Arc<dyn RpcService>>,
    negotiator: BindNegotiator,
    assoc_group_id: Option<u32>,
    /// Accepted presentation contexts and their transfer syntax
    contexts: HashMap<u16, SyntaxId>,
    max_xmit_frag: u16,
    max_recv_frag: u16,
    assembler: FragmentAssembler,
}

impl RpcEndpoint {
    /// Endpoint bound to a single service, as behind a named pipe
    pub fn for_service(service: Arc<dyn RpcService>, allocator: Arc<AssocGroupAllocator>) -> Self {
        Self::build(ServiceSource::Fixed, Some(service), allocator)
    }

    /// Endpoint that selects its service from `registry` at bind time
    pub fn with_registry(registry: ServiceRegistry, allocator: Arc<AssocGroupAllocator>) -> Self {
        Self::build(ServiceSource::Registry(registry), None, allocator)
    }

    fn build(
        source: ServiceSource,
        service: Option<Arc<dyn RpcService>>,
        allocator: Arc<AssocGroupAllocator>,
    ) -> Self {
        Self {
            source,
            service,
            negotiator: BindNegotiator::new(allocator),
            assoc_group_id: None,
            contexts: HashMap::new(),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assembler: FragmentAssembler::new(),
        }
    }

    /// Whether a bind has been acknowledged on this connection
    pub fn is_bound(&self) -> bool {
        self.assoc_group_id.is_some()
    }

    pub fn assoc_group_id(&self) -> Option<u32> {
        self.assoc_group_id
    }

    /// Largest fragment this endpoint sends
    pub fn max_xmit_frag(&self) -> u16 {
        self.max_xmit_frag
    }

    /// Largest fragment this endpoint announced it receives
    pub fn max_recv_frag(&self) -> u16 {
        self.max_recv_frag
    }

    /// The service calls are dispatched to, once known
    pub fn service(&self) -> Option<&Arc<dyn RpcService>> {
        self.service.as_ref()
    }

    /// Transfer syntax of an accepted presentation context
    pub fn accepted_context(&self, context_id: u16) -> Option<SyntaxId> {
        self.contexts.get(&context_id).copied()
    }

    /// Answer a bind or alter_context PDU
    pub fn bind(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let packet = BindPacket::deserialize(data)?;
        match packet.header.packet_type {
            PacketType::AlterContext => self.answer_alter_context(&packet),
            _ => self.answer_bind(&packet),
        }
    }

    /// Feed one request fragment. Returns the serialized response or
    /// fault fragments once the call is complete, nothing before.
    pub fn handle_request_fragment(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let request = RequestPacket::deserialize(data)?;
        self.handle_request(&request)
    }

    /// Process any PDU received from the client and return the PDUs to
    /// send back, in order
    pub fn process(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        debug!(
            "RPC: Incoming {} bytes (hex): {}",
            data.len(),
            hex_preview(data)
        );

        let header = RpcHeader::parse(data)?;
        if header.version_major != DCERPC_VERSION_MAJOR
            && header.packet_type != PacketType::Bind
        {
            warn!(
                "RPC: Invalid version {}.{} on {:?}",
                header.version_major, header.version_minor, header.packet_type
            );
            return Ok(vec![self.protocol_fault(header.call_id, 0)?]);
        }

        let responses = match Pdu::decode(data)? {
            Pdu::Bind(bind) => vec![self.answer_bind(&bind)?],
            Pdu::AlterContext(alter) => vec![self.answer_alter_context(&alter)?],
            Pdu::Request(request) => self.handle_request(&request)?,
            Pdu::Other { header, .. } => {
                match header.packet_type {
                    PacketType::Orphaned => {
                        debug!("RPC: Call {} orphaned by the client", header.call_id);
                        self.assembler.reset();
                    }
                    other => debug!("RPC: Ignoring {:?} PDU", other),
                }
                Vec::new()
            }
            other => {
                let header = other.header();
                warn!(
                    "RPC: Unexpected {:?} PDU from client, call {}",
                    header.packet_type, header.call_id
                );
                vec![self.protocol_fault(header.call_id, 0)?]
            }
        };

        for response in &responses {
            debug!(
                "RPC: Outgoing {} bytes (hex): {}",
                response.len(),
                hex_preview(response)
            );
        }
        Ok(responses)
    }

    fn answer_bind(&mut self, bind: &BindPacket) -> Result<Vec<u8>> {
        let call_id = bind.header.call_id;
        if bind.header.version_major != DCERPC_VERSION_MAJOR {
            warn!(
                "RPC: Bind with unsupported version {}.{}, sending bind_nak",
                bind.header.version_major, bind.header.version_minor
            );
            return BindNakPacket::new(call_id, BindNakReason::ProtocolVersionNotSupported)
                .serialize();
        }

        if let ServiceSource::Registry(registry) = &self.source {
            self.service = registry.find_for_bind(bind);
        }
        debug!(
            "RPC: Bind call {} with {} context(s) for {}",
            call_id,
            bind.contexts.len(),
            self.service
                .as_ref()
                .map(|service| service.name())
                .unwrap_or("no service")
        );

        let ack = self.negotiator.negotiate(self.service.as_deref(), bind);

        // A new bind starts a new association
        self.contexts.clear();
        self.assembler.reset();
        self.assoc_group_id = Some(ack.assoc_group_id);
        self.max_xmit_frag = ack.max_xmit_frag;
        self.max_recv_frag = ack.max_recv_frag;
        self.record_contexts(bind, &ack);

        ack.serialize()
    }

    fn answer_alter_context(&mut self, alter: &BindPacket) -> Result<Vec<u8>> {
        let assoc_group_id = match self.assoc_group_id {
            Some(id) => id,
            None => {
                warn!("RPC: alter_context before bind");
                return self.protocol_fault(alter.header.call_id, 0);
            }
        };

        if self.service.is_none() {
            if let ServiceSource::Registry(registry) = &self.source {
                self.service = registry.find_for_bind(alter);
            }
        }

        let mut ack =
            self.negotiator
                .negotiate_alter_context(self.service.as_deref(), alter, assoc_group_id);
        // Fragment sizes stay as negotiated by the bind
        ack.max_xmit_frag = self.max_xmit_frag;
        ack.max_recv_frag = self.max_recv_frag;
        self.record_contexts(alter, &ack);

        ack.serialize()
    }

    fn record_contexts(&mut self, bind: &BindPacket, ack: &BindAckPacket) {
        for (context, result) in bind.contexts.iter().zip(&ack.results) {
            if result.is_accepted() {
                self.contexts
                    .insert(context.context_id, result.transfer_syntax);
            }
        }
    }

    fn handle_request(&mut self, request: &RequestPacket) -> Result<Vec<Vec<u8>>> {
        let call_id = request.header.call_id;
        let context_id = request.context_id;
        let opnum = request.opnum;

        let stub = match self.assembler.push(request) {
            Ok(Some(stub)) => stub,
            Ok(None) => return Ok(Vec::new()),
            Err(Error::Reassembly(reason)) => {
                warn!("RPC: Reassembly of call {} failed: {}", call_id, reason);
                return Ok(vec![self.protocol_fault(call_id, context_id)?]);
            }
            Err(e) => return Err(e),
        };

        let service = match (&self.service, self.contexts.contains_key(&context_id)) {
            (Some(service), true) => service.clone(),
            _ => {
                warn!(
                    "RPC: Call {} on context {} which is not accepted",
                    call_id, context_id
                );
                let fault = FaultPacket::did_not_execute(
                    call_id,
                    context_id,
                    FaultStatus::UnknownInterface,
                );
                return Ok(vec![fault.serialize()?]);
            }
        };

        debug!(
            "RPC: Request call {} opnum {} (0x{:02x}) with {} bytes of stub data",
            call_id,
            opnum,
            opnum,
            stub.len()
        );

        match dispatch(service.as_ref(), opnum, &stub) {
            Ok(payload) => fragment_response(call_id, context_id, &payload, self.max_xmit_frag)?
                .iter()
                .map(|fragment| fragment.serialize())
                .collect(),
            Err(e) => {
                warn!("RPC: {} opnum {} failed: {}", service.name(), opnum, e);
                let fault = match fault_status_for(&e) {
                    FaultStatus::OpRangeError => FaultPacket::op_range_error(call_id, context_id),
                    status => FaultPacket::new(call_id, context_id, status as u32),
                };
                Ok(vec![fault.serialize()?])
            }
        }
    }

    fn protocol_fault(&self, call_id: u32, context_id: u16) -> Result<Vec<u8>> {
        FaultPacket::did_not_execute(call_id, context_id, FaultStatus::ProtocolError).serialize()
    }
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("service", &self.service.as_ref().map(|s| s.name().to_string()))
            .field("assoc_group_id", &self.assoc_group_id)
            .field("contexts", &self.contexts)
            .field("max_xmit_frag", &self.max_xmit_frag)
            .finish()
    }
}
