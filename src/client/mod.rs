//! RPC client implementation

use crate::dcerpc::fragment::{fragment_request, FragmentAssembler};
use crate::dcerpc::ndr::NdrMessage;
use crate::dcerpc::packet::{BindAckPacket, BindPacket, ContextElement, Pdu};
use crate::dcerpc::services::srvsvc::{
    NetrServerGetInfoRequest, NetrServerGetInfoResponse, NetrShareEnumRequest,
    NetrShareEnumResponse, NetrShareGetInfoRequest, NetrShareGetInfoResponse, SrvSvcOpnum,
};
use crate::dcerpc::services::wkssvc::{
    NetrWkstaGetInfoRequest, NetrWkstaGetInfoResponse, WksSvcOpnum,
};
use crate::dcerpc::transport::{with_deadline, RpcTransport};
use crate::dcerpc::{
    interfaces, RpcInterface, SyntaxId, BIND_TIME_FEATURE_NEGOTIATION, DEFAULT_MAX_FRAG,
    NDR_TRANSFER_SYNTAX_V2,
};
use crate::error::{Error, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// RPC client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Largest fragment the client offers to send
    pub max_xmit_frag: u16,
    /// Largest fragment the client accepts
    pub max_recv_frag: u16,
    /// Deadline for each PDU the client waits for
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Association established by a successful bind
#[derive(Debug, Clone)]
pub struct Association {
    pub interface: RpcInterface,
    pub context_id: u16,
    pub transfer_syntax: SyntaxId,
    pub assoc_group_id: u32,
    pub secondary_address: String,
    /// Largest fragment the server accepts from us
    pub max_xmit_frag: u16,
}

/// RPC client over a transport
pub struct RpcClient<T: RpcTransport> {
    config: ClientConfig,
    transport: T,
    association: Option<Association>,
    call_id: u32,
}

impl<T: RpcTransport> RpcClient<T> {
    /// Create a client with default configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Self {
            config,
            transport,
            association: None,
            call_id: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The association from the last successful bind
    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Bind to an interface.
    ///
    /// Offers NDR in context 0 and bind time feature negotiation in
    /// context 1, the way Windows clients do.
    pub async fn bind(&mut self, interface: &RpcInterface) -> Result<&Association> {
        let abstract_syntax = interface.syntax_id();
        let mut bind = BindPacket::new(
            self.next_call_id(),
            vec![
                ContextElement::new(0, abstract_syntax, vec![NDR_TRANSFER_SYNTAX_V2]),
                ContextElement::new(1, abstract_syntax, vec![BIND_TIME_FEATURE_NEGOTIATION]),
            ],
        );
        bind.max_xmit_frag = self.config.max_xmit_frag;
        bind.max_recv_frag = self.config.max_recv_frag;

        debug!("Binding to {} with call {}", interface.name, bind.header.call_id);
        self.transport.send(&bind.serialize()?).await?;

        let ack = match Pdu::decode(&self.receive().await?)? {
            Pdu::BindAck(ack) => ack,
            Pdu::BindNak(nak) => {
                warn!("Bind to {} refused, reason {}", interface.name, nak.reason);
                return Err(Error::BindNak { reason: nak.reason });
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "expected bind_ack, got {:?}",
                    other.header().packet_type
                )))
            }
        };

        let association = Self::accept(interface, &bind, &ack)?;
        debug!(
            "Bound to {} on context {}, assoc group 0x{:x}, secondary address {:?}",
            interface.name,
            association.context_id,
            association.assoc_group_id,
            association.secondary_address
        );
        Ok(self.association.insert(association))
    }

    /// First accepted context of the ack, or the first rejection as an error
    fn accept(interface: &RpcInterface, bind: &BindPacket, ack: &BindAckPacket) -> Result<Association> {
        let accepted = bind
            .contexts
            .iter()
            .zip(&ack.results)
            .find(|(_, result)| result.is_accepted());

        match accepted {
            Some((context, result)) => Ok(Association {
                interface: interface.clone(),
                context_id: context.context_id,
                transfer_syntax: result.transfer_syntax,
                assoc_group_id: ack.assoc_group_id,
                secondary_address: ack.secondary_address.clone(),
                max_xmit_frag: ack.max_recv_frag.min(bind.max_xmit_frag),
            }),
            None => {
                let (result, reason) = ack
                    .results
                    .first()
                    .map(|r| (r.result, r.reason))
                    .unwrap_or_default();
                Err(Error::BindRejected { result, reason })
            }
        }
    }

    /// Make an RPC call: fragment the request, then reassemble the
    /// response stub. A fault PDU becomes [`Error::Fault`].
    pub async fn call(&mut self, opnum: u16, input: &[u8]) -> Result<Vec<u8>> {
        let (context_id, max_xmit_frag) = match &self.association {
            Some(association) => (association.context_id, association.max_xmit_frag),
            None => return Err(Error::InvalidState("not bound".to_string())),
        };
        let call_id = self.next_call_id();

        let fragments = fragment_request(call_id, context_id, opnum, None, input, max_xmit_frag)?;
        debug!(
            "Call {} opnum {}: sending {} bytes in {} fragment(s)",
            call_id,
            opnum,
            input.len(),
            fragments.len()
        );
        for fragment in &fragments {
            self.transport.send(&fragment.serialize()?).await?;
        }

        let mut assembler = FragmentAssembler::new();
        loop {
            match Pdu::decode(&self.receive().await?)? {
                Pdu::Response(response) => {
                    if response.header.call_id != call_id {
                        return Err(Error::InvalidState(format!(
                            "response for call {} while waiting for call {}",
                            response.header.call_id, call_id
                        )));
                    }
                    if let Some(stub) = assembler.push(&response)? {
                        return Ok(stub);
                    }
                }
                Pdu::Fault(fault) => {
                    warn!("Call {} opnum {} faulted: 0x{:08x}", call_id, opnum, fault.status);
                    return Err(Error::Fault {
                        status: fault.status,
                    });
                }
                other => {
                    return Err(Error::InvalidState(format!(
                        "unexpected {:?} during call {}",
                        other.header().packet_type,
                        call_id
                    )))
                }
            }
        }
    }

    /// Encode a typed request, run it and decode the typed response
    pub async fn invoke<Req, Resp>(&mut self, opnum: u16, request: &Req) -> Result<Resp>
    where
        Req: NdrMessage + Sync,
        Resp: NdrMessage,
    {
        let stub = request.to_bytes()?;
        let response = self.call(opnum, &stub).await?;
        Resp::from_bytes(&response)
    }

    /// NetrShareEnum on a client bound to SRVSVC
    pub async fn share_enum(&mut self, server_name: &str, level: u32) -> Result<NetrShareEnumResponse> {
        self.ensure_bound_to(&interfaces::srvsvc())?;
        let request = NetrShareEnumRequest::new(server_name, level);
        self.invoke(SrvSvcOpnum::NetrShareEnum as u16, &request).await
    }

    /// NetrShareGetInfo on a client bound to SRVSVC
    pub async fn share_get_info(
        &mut self,
        server_name: &str,
        share_name: &str,
        level: u32,
    ) -> Result<NetrShareGetInfoResponse> {
        self.ensure_bound_to(&interfaces::srvsvc())?;
        let request = NetrShareGetInfoRequest::new(server_name, share_name, level);
        self.invoke(SrvSvcOpnum::NetrShareGetInfo as u16, &request).await
    }

    /// NetrServerGetInfo on a client bound to SRVSVC
    pub async fn server_get_info(
        &mut self,
        server_name: &str,
        level: u32,
    ) -> Result<NetrServerGetInfoResponse> {
        self.ensure_bound_to(&interfaces::srvsvc())?;
        let request = NetrServerGetInfoRequest::new(server_name, level);
        self.invoke(SrvSvcOpnum::NetrServerGetInfo as u16, &request).await
    }

    /// NetrWkstaGetInfo on a client bound to WKSSVC
    pub async fn wksta_get_info(
        &mut self,
        server_name: &str,
        level: u32,
    ) -> Result<NetrWkstaGetInfoResponse> {
        self.ensure_bound_to(&interfaces::wkssvc())?;
        let request = NetrWkstaGetInfoRequest::new(server_name, level);
        self.invoke(WksSvcOpnum::NetrWkstaGetInfo as u16, &request).await
    }

    /// Close the RPC connection
    pub async fn close(&mut self) -> Result<()> {
        self.association = None;
        self.transport.close().await
    }

    fn ensure_bound_to(&self, interface: &RpcInterface) -> Result<()> {
        match &self.association {
            Some(association) if association.interface.uuid == interface.uuid => Ok(()),
            Some(association) => Err(Error::InvalidState(format!(
                "bound to {}, not {}",
                association.interface.name, interface.name
            ))),
            None => Err(Error::InvalidState("not bound".to_string())),
        }
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        with_deadline(Some(self.config.read_timeout), self.transport.receive()).await
    }

    fn next_call_id(&mut self) -> u32 {
        self.call_id = self.call_id.wrapping_add(1);
        self.call_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcerpc::bind::AssocGroupAllocator;
    use crate::dcerpc::endpoint::RpcEndpoint;
    use crate::dcerpc::packet::BindNakPacket;
    use crate::dcerpc::services::srvsvc::{ShareEntry, SrvSvcService};
    use crate::dcerpc::services::HostIdentity;
    use crate::dcerpc::transport::TransportType;
    use crate::dcerpc::{BindNakReason, FaultStatus};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Transport answering from an in-process endpoint
    struct EndpointTransport {
        endpoint: RpcEndpoint,
        pending: VecDeque<Vec<u8>>,
        sent: usize,
    }

    impl EndpointTransport {
        fn srvsvc(shares: Vec<ShareEntry>) -> Self {
            let service = Arc::new(SrvSvcService::new(HostIdentity::default(), shares));
            Self {
                endpoint: RpcEndpoint::for_service(service, Arc::new(AssocGroupAllocator::new())),
                pending: VecDeque::new(),
                sent: 0,
            }
        }
    }

    #[async_trait::async_trait]
    impl RpcTransport for EndpointTransport {
        async fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent += 1;
            self.pending.extend(self.endpoint.process(data)?);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Vec<u8>> {
            self.pending.pop_front().ok_or(Error::ConnectionClosed)
        }

        fn transport_type(&self) -> TransportType {
            TransportType::NamedPipe
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Transport answering every PDU with a canned reply
    struct CannedTransport(Vec<u8>);

    #[async_trait::async_trait]
    impl RpcTransport for CannedTransport {
        async fn send(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn receive(&mut self) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }

        fn transport_type(&self) -> TransportType {
            TransportType::Tcp
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.max_xmit_frag, 4280);
        assert_eq!(config.max_recv_frag, 4280);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_bind_picks_ndr_context() {
        let mut client = RpcClient::new(EndpointTransport::srvsvc(Vec::new()));
        let association = client.bind(&interfaces::srvsvc()).await.unwrap();
        assert_eq!(association.context_id, 0);
        assert_eq!(association.transfer_syntax, NDR_TRANSFER_SYNTAX_V2);
        assert_eq!(association.secondary_address, "\\PIPE\\srvsvc");
        assert_ne!(association.assoc_group_id, 0);
    }

    #[tokio::test]
    async fn test_bind_wrong_interface_is_rejected() {
        let mut client = RpcClient::new(EndpointTransport::srvsvc(Vec::new()));
        let error = client.bind(&interfaces::wkssvc()).await.unwrap_err();
        assert!(matches!(error, Error::BindRejected { result: 2, reason: 1 }));
        assert!(client.association().is_none());
    }

    #[tokio::test]
    async fn test_bind_nak() {
        let nak = BindNakPacket::new(1, BindNakReason::ProtocolVersionNotSupported)
            .serialize()
            .unwrap();
        let mut client = RpcClient::new(CannedTransport(nak));
        let error = client.bind(&interfaces::srvsvc()).await.unwrap_err();
        assert!(matches!(error, Error::BindNak { reason: 4 }));
    }

    #[tokio::test]
    async fn test_call_before_bind() {
        let mut client = RpcClient::new(EndpointTransport::srvsvc(Vec::new()));
        assert!(matches!(
            client.call(15, &[]).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_share_enum() {
        let shares = vec![
            ShareEntry::disk("public", "/srv/public", "Public files"),
            ShareEntry::disk("backup$", "/srv/backup", "Backups"),
        ];
        let mut client = RpcClient::new(EndpointTransport::srvsvc(shares));
        client.bind(&interfaces::srvsvc()).await.unwrap();

        let response = client.share_enum("\\\\SERVER", 1).await.unwrap();
        assert_eq!(response.status, 0);
        assert_eq!(response.share_names(), vec!["IPC$", "public", "backup$"]);
        assert_eq!(response.total_entries, 3);
    }

    #[tokio::test]
    async fn test_large_request_is_fragmented() {
        let config = ClientConfig {
            max_xmit_frag: 64,
            ..ClientConfig::default()
        };
        let mut client = RpcClient::with_config(EndpointTransport::srvsvc(Vec::new()), config);
        client.bind(&interfaces::srvsvc()).await.unwrap();
        assert_eq!(client.association().unwrap().max_xmit_frag, 64);

        let long_name = format!("\\\\{}", "S".repeat(100));
        let response = client.server_get_info(&long_name, 101).await.unwrap();
        assert_eq!(response.status, 0);
        // bind plus several request fragments
        assert!(client.transport().sent > 3);
    }

    #[tokio::test]
    async fn test_fault_surfaces_as_error() {
        let mut client = RpcClient::new(EndpointTransport::srvsvc(Vec::new()));
        client.bind(&interfaces::srvsvc()).await.unwrap();
        let error = client.call(99, &[]).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Fault { status } if status == FaultStatus::OpRangeError as u32
        ));

        // The association stays usable after a fault
        let response = client.server_get_info("\\\\SERVER", 100).await.unwrap();
        assert_eq!(response.status, 0);
    }

    #[tokio::test]
    async fn test_helper_checks_interface() {
        let mut client = RpcClient::new(EndpointTransport::srvsvc(Vec::new()));
        client.bind(&interfaces::srvsvc()).await.unwrap();
        assert!(matches!(
            client.wksta_get_info("\\\\SERVER", 100).await,
            Err(Error::InvalidState(_))
        ));
    }
}
