//! Tests for DCE/RPC implementation

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::dcerpc::bind::AssocGroupAllocator;
    use crate::dcerpc::endpoint::RpcEndpoint;
    use crate::dcerpc::fragment::{fragment_request, reassemble};
    use crate::dcerpc::ndr::*;
    use crate::dcerpc::packet::*;
    use crate::dcerpc::services::srvsvc::*;
    use crate::dcerpc::services::{HostIdentity, ServiceRegistry};
    use std::sync::Arc;

    fn registry_endpoint(shares: Vec<ShareEntry>) -> RpcEndpoint {
        RpcEndpoint::with_registry(
            ServiceRegistry::with_defaults(HostIdentity::default(), shares),
            Arc::new(AssocGroupAllocator::new()),
        )
    }

    fn bind_srvsvc(endpoint: &mut RpcEndpoint, max_frag: u16) -> BindAckPacket {
        let mut bind = BindPacket::new(
            1,
            vec![ContextElement::new(
                0,
                interfaces::srvsvc().syntax_id(),
                vec![NDR_TRANSFER_SYNTAX_V2],
            )],
        );
        bind.max_xmit_frag = max_frag;
        bind.max_recv_frag = max_frag;
        let out = endpoint.process(&bind.serialize().unwrap()).unwrap();
        BindAckPacket::deserialize(&out[0]).unwrap()
    }

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    #[test]
    fn test_share_container_layout() {
        let entries = vec![
            ShareInfo1 {
                netname: NdrPtr::new(NdrString::new("IPC$")),
                share_type: ShareType::Ipc as u32 | STYPE_SPECIAL,
                remark: NdrPtr::new(NdrString::new("Remote IPC")),
            },
            ShareInfo1 {
                netname: NdrPtr::new(NdrString::new("data")),
                share_type: ShareType::DiskTree as u32,
                remark: NdrPtr::new(NdrString::new("")),
            },
        ];
        let info = ShareEnumStruct {
            info: ShareEnumUnion::Level1(NdrPtr::new(ShareInfoContainer::new(entries))),
        };

        let mut encoder = NdrEncoder::new();
        encoder.encode_top_level(&info).unwrap();
        let bytes = encoder.into_bytes().unwrap();

        // Level, switch, then the container pointer
        assert_eq!(u32_at(&bytes, 0), 1);
        assert_eq!(u32_at(&bytes, 4), 1);
        assert_eq!(u32_at(&bytes, 8), 0x0002_0000);
        // Container: count and array pointer
        assert_eq!(u32_at(&bytes, 12), 2);
        assert_eq!(u32_at(&bytes, 16), 0x0002_0004);
        // Conformant array of fixed parts, strings deferred past it
        assert_eq!(u32_at(&bytes, 20), 2);
        assert_eq!(u32_at(&bytes, 24), 0x0002_0008);
        assert_eq!(u32_at(&bytes, 28), 0x8000_0003);
        assert_eq!(u32_at(&bytes, 32), 0x0002_000c);
        assert_eq!(u32_at(&bytes, 36), 0x0002_0010);
        assert_eq!(u32_at(&bytes, 40), 0);
        assert_eq!(u32_at(&bytes, 44), 0x0002_0014);
        // First deferred referent: "IPC$" with its terminator
        assert_eq!(u32_at(&bytes, 48), 5);
        assert_eq!(u32_at(&bytes, 52), 0);
        assert_eq!(u32_at(&bytes, 56), 5);
        assert_eq!(&bytes[60..70], utf16("IPC$\0").as_slice());

        let mut decoder = NdrDecoder::new(&bytes);
        let decoded: ShareEnumStruct = decoder.decode_top_level().unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn test_full_exchange_with_fragmentation() {
        let shares = (0..80)
            .map(|i| ShareEntry::disk(format!("projects{:02}", i), "/srv", "Project files"))
            .collect();
        let mut endpoint = registry_endpoint(shares);
        let ack = bind_srvsvc(&mut endpoint, MIN_FRAG_SIZE);
        assert!(ack.results[0].is_accepted());
        assert_eq!(ack.max_xmit_frag, MIN_FRAG_SIZE);

        let stub = NetrShareEnumRequest::new("\\\\SERVER", 1).to_bytes().unwrap();
        let mut responses = Vec::new();
        for fragment in fragment_request(2, 0, 15, None, &stub, 40).unwrap() {
            responses.extend(endpoint.process(&fragment.serialize().unwrap()).unwrap());
        }
        assert!(responses.len() > 2);

        let fragments: Vec<ResponsePacket> = responses
            .iter()
            .map(|bytes| ResponsePacket::deserialize(bytes).unwrap())
            .collect();
        assert!(fragments[0].header.packet_flags.is_first_frag());
        assert!(fragments.last().unwrap().header.packet_flags.is_last_frag());

        // Allocation hints count down the bytes still to come
        let total: usize = fragments.iter().map(|f| f.stub_data.len()).sum();
        let mut remaining = total;
        for fragment in &fragments {
            assert_eq!(fragment.alloc_hint as usize, remaining);
            assert!(fragment.header.frag_length <= MIN_FRAG_SIZE);
            remaining -= fragment.stub_data.len();
        }

        let response = NetrShareEnumResponse::from_bytes(&reassemble(fragments).unwrap()).unwrap();
        assert_eq!(response.status, 0);
        assert_eq!(response.share_names().len(), 81);
        assert_eq!(response.share_names()[1], "projects00");
    }

    #[test]
    fn test_unsupported_opnum_never_fragments() {
        let mut endpoint = registry_endpoint(Vec::new());
        bind_srvsvc(&mut endpoint, 64);

        let out = endpoint
            .process(&RequestPacket::new(3, 0, 0x7f, vec![0u8; 4000]).serialize().unwrap())
            .unwrap();
        assert_eq!(out.len(), 1);
        let fault = FaultPacket::deserialize(&out[0]).unwrap();
        assert_eq!(fault.status, FaultStatus::OpRangeError as u32);
        assert_eq!(fault.header.call_id, 3);
    }

    #[test]
    fn test_big_endian_bind_is_understood() {
        let mut endpoint = registry_endpoint(Vec::new());
        let mut bind = BindPacket::new(
            9,
            vec![ContextElement::new(
                0,
                interfaces::wkssvc().syntax_id(),
                vec![NDR_TRANSFER_SYNTAX_V2],
            )],
        );
        bind.header.data_representation = [0x00, 0x00, 0x00, 0x00];
        bind.max_recv_frag = 2048;

        let out = endpoint.process(&bind.serialize().unwrap()).unwrap();
        let ack = BindAckPacket::deserialize(&out[0]).unwrap();
        assert!(ack.header.is_little_endian());
        assert_eq!(ack.header.call_id, 9);
        assert_eq!(ack.max_xmit_frag, 2048);
        assert!(ack.results[0].is_accepted());
        assert_eq!(ack.secondary_address, "\\PIPE\\wkssvc");
    }

    #[test]
    fn test_unknown_context_after_bind() {
        let mut endpoint = registry_endpoint(Vec::new());
        bind_srvsvc(&mut endpoint, 4280);

        let stub = NetrServerGetInfoRequest::new("\\\\SERVER", 100).to_bytes().unwrap();
        let out = endpoint
            .process(&RequestPacket::new(4, 5, 21, stub.clone()).serialize().unwrap())
            .unwrap();
        let fault = FaultPacket::deserialize(&out[0]).unwrap();
        assert_eq!(fault.fault_status(), Some(FaultStatus::UnknownInterface));

        // The accepted context still works
        let out = endpoint
            .process(&RequestPacket::new(5, 0, 21, stub).serialize().unwrap())
            .unwrap();
        let response = ResponsePacket::deserialize(&out[0]).unwrap();
        let info = NetrServerGetInfoResponse::from_bytes(&response.stub_data).unwrap();
        assert_eq!(info.info.level(), 100);
    }

    #[test]
    fn test_share_get_info_errors() {
        let mut endpoint = registry_endpoint(vec![ShareEntry::disk("data", "/srv/data", "")]);
        bind_srvsvc(&mut endpoint, 4280);

        let call = |endpoint: &mut RpcEndpoint, call_id: u32, name: &str, level: u32| {
            let stub = NetrShareGetInfoRequest::new("\\\\SERVER", name, level)
                .to_bytes()
                .unwrap();
            let out = endpoint
                .process(&RequestPacket::new(call_id, 0, 16, stub).serialize().unwrap())
                .unwrap();
            let response = ResponsePacket::deserialize(&out[0]).unwrap();
            NetrShareGetInfoResponse::from_bytes(&response.stub_data).unwrap()
        };

        assert_eq!(call(&mut endpoint, 2, "DATA", 1).status, 0);
        assert_eq!(
            call(&mut endpoint, 3, "missing", 1).status,
            crate::error::WError::NetNameNotFound as u32
        );
        assert_eq!(
            call(&mut endpoint, 4, "data", 502).status,
            crate::error::WError::InvalidLevel as u32
        );
    }

    #[test]
    fn test_bind_time_feature_negotiation_context() {
        let mut endpoint = registry_endpoint(Vec::new());
        let syntax = interfaces::srvsvc().syntax_id();
        let bind = BindPacket::new(
            1,
            vec![
                ContextElement::new(0, syntax, vec![NDR_TRANSFER_SYNTAX_V2]),
                ContextElement::new(1, syntax, vec![BIND_TIME_FEATURE_NEGOTIATION]),
            ],
        );
        let out = endpoint.process(&bind.serialize().unwrap()).unwrap();
        let ack = BindAckPacket::deserialize(&out[0]).unwrap();

        assert_eq!(ack.results.len(), 2);
        assert!(ack.results[0].is_accepted());
        assert_eq!(
            ack.results[1].negotiation_result(),
            Ok(NegotiationResult::NegotiateAck)
        );
        assert_eq!(ack.results[1].transfer_syntax, SyntaxId::NIL);
        assert!(endpoint.accepted_context(1).is_none());
    }
}
