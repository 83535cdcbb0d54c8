//! Presentation context negotiation: turns a bind (or alter_context) into
//! the matching acknowledgment.

use crate::dcerpc::packet::{BindAckPacket, BindPacket, ContextElement, ContextResult, RpcHeader};
use crate::dcerpc::services::RpcService;
use crate::dcerpc::{NegotiationResult, PacketType, RejectionReason, MIN_FRAG_SIZE};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Hands out association group ids. Shared by every connection of a
/// listener; zero is never returned because it means "unassigned".
#[derive(Debug)]
pub struct AssocGroupAllocator {
    next: AtomicU32,
}

impl AssocGroupAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Allocator whose first id is `first` (or 1 if `first` is zero)
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1)),
        }
    }

    /// Take the next association group id
    pub fn allocate(&self) -> u32 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(match current.wrapping_add(1) {
                    0 => 1,
                    next => next,
                })
            })
            .unwrap_or_else(|current| current)
    }
}

impl Default for AssocGroupAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Negotiates presentation contexts against one service
#[derive(Debug, Clone)]
pub struct BindNegotiator {
    allocator: Arc<AssocGroupAllocator>,
}

impl BindNegotiator {
    pub fn new(allocator: Arc<AssocGroupAllocator>) -> Self {
        Self { allocator }
    }

    /// Outcome for a single presentation context.
    ///
    /// The first client candidate the service supports wins, in the
    /// client's order.
    pub fn negotiate_context(
        service: Option<&dyn RpcService>,
        context: &ContextElement,
    ) -> ContextResult {
        let service = match service {
            Some(service) if service.interface().syntax_id() == context.abstract_syntax => service,
            _ => {
                return ContextResult::rejected(
                    NegotiationResult::ProviderRejection,
                    RejectionReason::AbstractSyntaxNotSupported,
                )
            }
        };

        let supported = service.transfer_syntaxes();
        if let Some(chosen) = context
            .transfer_syntaxes
            .iter()
            .find(|candidate| supported.contains(candidate))
        {
            return ContextResult::accepted(*chosen);
        }

        if context
            .transfer_syntaxes
            .iter()
            .any(|candidate| candidate.is_bind_time_feature_negotiation())
        {
            // Bind time feature negotiation is acknowledged, never accepted
            return ContextResult::rejected(
                NegotiationResult::NegotiateAck,
                RejectionReason::AbstractSyntaxNotSupported,
            );
        }

        ContextResult::rejected(
            NegotiationResult::ProviderRejection,
            RejectionReason::ProposedTransferSyntaxesNotSupported,
        )
    }

    /// Answer a bind. A zero association group requests a new one;
    /// anything else is echoed.
    pub fn negotiate(&self, service: Option<&dyn RpcService>, bind: &BindPacket) -> BindAckPacket {
        let assoc_group_id = if bind.assoc_group_id == 0 {
            self.allocator.allocate()
        } else {
            bind.assoc_group_id
        };
        let secondary_address = service
            .map(|service| format!("\\PIPE\\{}", service.pipe_name()))
            .unwrap_or_default();

        self.build_ack(
            PacketType::BindAck,
            service,
            bind,
            assoc_group_id,
            secondary_address,
        )
    }

    /// Answer an alter_context on an association that already has a group
    pub fn negotiate_alter_context(
        &self,
        service: Option<&dyn RpcService>,
        alter: &BindPacket,
        assoc_group_id: u32,
    ) -> BindAckPacket {
        self.build_ack(
            PacketType::AlterContextResp,
            service,
            alter,
            assoc_group_id,
            String::new(),
        )
    }

    fn build_ack(
        &self,
        packet_type: PacketType,
        service: Option<&dyn RpcService>,
        bind: &BindPacket,
        assoc_group_id: u32,
        secondary_address: String,
    ) -> BindAckPacket {
        let results: Vec<ContextResult> = bind
            .contexts
            .iter()
            .map(|context| {
                let result = Self::negotiate_context(service, context);
                if result.is_accepted() {
                    debug!(
                        "Context {} accepted with transfer syntax {} v{}",
                        context.context_id,
                        result.transfer_syntax.uuid,
                        result.transfer_syntax.major_version()
                    );
                } else {
                    warn!(
                        "Context {} for {} not accepted: result {}, reason {}",
                        context.context_id,
                        context.abstract_syntax.uuid,
                        result.result,
                        result.reason
                    );
                }
                result
            })
            .collect();

        BindAckPacket {
            header: RpcHeader::new(packet_type, bind.header.call_id),
            // Each side announces what it can receive, never below the floor
            max_xmit_frag: bind.max_recv_frag.max(MIN_FRAG_SIZE),
            max_recv_frag: bind.max_xmit_frag.max(MIN_FRAG_SIZE),
            assoc_group_id,
            secondary_address,
            results,
            auth_verifier: Vec::new(),
        }
    }
}

impl Default for BindNegotiator {
    fn default() -> Self {
        Self::new(Arc::new(AssocGroupAllocator::new()))
    }
}
