//! Fragmentation and reassembly of request and response stub data
//!
//! A logical call payload is split into fragments no larger than the
//! negotiated maximum fragment size. Every fragment carries the number of
//! payload bytes still to come, counted from its own start, as its
//! allocation hint.

use crate::dcerpc::packet::{
    RequestPacket, ResponsePacket, RpcHeader, OBJECT_UUID_LENGTH, REQUEST_FIXED_LENGTH,
    RESPONSE_FIXED_LENGTH,
};
use crate::dcerpc::{PacketFlags, COMMON_HEADER_LENGTH};
use crate::error::{Error, Result};
use bytes::BytesMut;
use tracing::debug;
use uuid::Uuid;

/// Largest allocation hint used to pre-size a reassembly buffer
const MAX_PREALLOCATION: usize = 1 << 20;

/// Payload bytes that fit in one fragment of `max_frag` bytes whose
/// kind-specific fields take `fixed_length` bytes
pub fn max_pdu_data_length(max_frag: u16, fixed_length: usize) -> Result<usize> {
    let overhead = COMMON_HEADER_LENGTH + fixed_length;
    if (max_frag as usize) <= overhead {
        return Err(Error::InvalidParameter(format!(
            "max fragment size {} leaves no room for data after {} bytes of headers",
            max_frag, overhead
        )));
    }
    Ok(max_frag as usize - overhead)
}

/// One slice of a payload with its flags and allocation hint
struct Chunk<'a> {
    flags: PacketFlags,
    alloc_hint: u32,
    data: &'a [u8],
}

fn split(payload: &[u8], max_data: usize) -> Vec<Chunk<'_>> {
    if payload.is_empty() {
        return vec![Chunk {
            flags: PacketFlags::complete(),
            alloc_hint: 0,
            data: payload,
        }];
    }

    let count = (payload.len() + max_data - 1) / max_data;
    payload
        .chunks(max_data)
        .enumerate()
        .map(|(index, data)| {
            let mut flags = PacketFlags::empty();
            if index == 0 {
                flags |= PacketFlags::FIRST_FRAG;
            }
            if index + 1 == count {
                flags |= PacketFlags::LAST_FRAG;
            }
            Chunk {
                flags,
                alloc_hint: (payload.len() - index * max_data) as u32,
                data,
            }
        })
        .collect()
}

/// Split a response payload into response fragments
pub fn fragment_response(
    call_id: u32,
    context_id: u16,
    payload: &[u8],
    max_xmit_frag: u16,
) -> Result<Vec<ResponsePacket>> {
    let max_data = max_pdu_data_length(max_xmit_frag, RESPONSE_FIXED_LENGTH)?;
    let fragments: Vec<ResponsePacket> = split(payload, max_data)
        .into_iter()
        .map(|chunk| {
            let mut response = ResponsePacket::new(call_id, context_id, chunk.data.to_vec());
            response.header.packet_flags = chunk.flags;
            response.alloc_hint = chunk.alloc_hint;
            response
        })
        .collect();

    debug!(
        "Call {}: {} response bytes in {} fragment(s) of at most {} data bytes",
        call_id,
        payload.len(),
        fragments.len(),
        max_data
    );
    Ok(fragments)
}

/// Split a request payload into request fragments
pub fn fragment_request(
    call_id: u32,
    context_id: u16,
    opnum: u16,
    object: Option<Uuid>,
    payload: &[u8],
    max_xmit_frag: u16,
) -> Result<Vec<RequestPacket>> {
    let fixed_length = REQUEST_FIXED_LENGTH + object.map_or(0, |_| OBJECT_UUID_LENGTH);
    let max_data = max_pdu_data_length(max_xmit_frag, fixed_length)?;
    Ok(split(payload, max_data)
        .into_iter()
        .map(|chunk| {
            let mut request = RequestPacket::new(call_id, context_id, opnum, chunk.data.to_vec());
            if let Some(object) = object {
                request = request.with_object(object);
            }
            request.header.packet_flags =
                chunk.flags | (request.header.packet_flags & PacketFlags::OBJECT_UUID);
            request.alloc_hint = chunk.alloc_hint;
            request
        })
        .collect())
}

/// A PDU carrying one fragment of a call's stub data
pub trait Fragment {
    fn header(&self) -> &RpcHeader;
    fn stub_data(&self) -> &[u8];
    fn alloc_hint(&self) -> u32;
}

impl Fragment for RequestPacket {
    fn header(&self) -> &RpcHeader {
        &self.header
    }

    fn stub_data(&self) -> &[u8] {
        &self.stub_data
    }

    fn alloc_hint(&self) -> u32 {
        self.alloc_hint
    }
}

impl Fragment for ResponsePacket {
    fn header(&self) -> &RpcHeader {
        &self.header
    }

    fn stub_data(&self) -> &[u8] {
        &self.stub_data
    }

    fn alloc_hint(&self) -> u32 {
        self.alloc_hint
    }
}

/// Where an assembler is in the fragment sequence of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyState {
    /// No call in progress
    AwaitingFirst,
    /// First fragment seen, last not yet
    Accumulating { call_id: u32, received: usize },
    /// The last fragment of `call_id` completed the call
    Complete { call_id: u32 },
}

/// Accumulates the fragments of one call at a time
#[derive(Debug)]
pub struct FragmentAssembler {
    call_id: u32,
    buffer: BytesMut,
    state: AssemblyState,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self {
            call_id: 0,
            buffer: BytesMut::new(),
            state: AssemblyState::AwaitingFirst,
        }
    }

    pub fn state(&self) -> &AssemblyState {
        &self.state
    }

    /// Whether a call has started but not yet completed
    pub fn in_progress(&self) -> bool {
        matches!(self.state, AssemblyState::Accumulating { .. })
    }

    /// Drop any partial call
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = AssemblyState::AwaitingFirst;
    }

    fn fail(&mut self, reason: String) -> Error {
        self.reset();
        Error::Reassembly(reason)
    }

    /// Add a fragment. Returns the whole payload once the last fragment
    /// of the call has arrived.
    pub fn push<F: Fragment + ?Sized>(&mut self, fragment: &F) -> Result<Option<Vec<u8>>> {
        let header = fragment.header();
        let flags = header.packet_flags;

        if self.in_progress() {
            if header.call_id != self.call_id {
                let reason = format!(
                    "fragment for call {} while call {} is incomplete",
                    header.call_id, self.call_id
                );
                return Err(self.fail(reason));
            }
            if flags.is_first_frag() {
                let reason = format!("call {} restarted before its last fragment", self.call_id);
                return Err(self.fail(reason));
            }
        } else {
            if !flags.is_first_frag() {
                let reason = format!(
                    "call {} fragment without a preceding first fragment",
                    header.call_id
                );
                return Err(self.fail(reason));
            }
            self.call_id = header.call_id;
            self.buffer.clear();
            self.buffer
                .reserve((fragment.alloc_hint() as usize).min(MAX_PREALLOCATION));
        }

        self.buffer.extend_from_slice(fragment.stub_data());

        if flags.is_last_frag() {
            let payload = self.buffer.split().to_vec();
            self.state = AssemblyState::Complete {
                call_id: self.call_id,
            };
            Ok(Some(payload))
        } else {
            self.state = AssemblyState::Accumulating {
                call_id: self.call_id,
                received: self.buffer.len(),
            };
            Ok(None)
        }
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassemble a complete fragment sequence of one call
pub fn reassemble<I, F>(fragments: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = F>,
    F: Fragment,
{
    let mut assembler = FragmentAssembler::new();
    let mut payload = None;
    let mut call_id = 0;

    for fragment in fragments {
        if payload.is_some() {
            return Err(Error::Reassembly(format!(
                "fragment for call {} after the last fragment",
                fragment.header().call_id
            )));
        }
        call_id = fragment.header().call_id;
        payload = assembler.push(&fragment)?;
    }

    payload.ok_or(Error::IncompleteCall { call_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_max_pdu_data_length() {
        assert_eq!(max_pdu_data_length(4096, RESPONSE_FIXED_LENGTH).unwrap(), 4072);
        assert_eq!(max_pdu_data_length(4280, REQUEST_FIXED_LENGTH).unwrap(), 4256);
        assert_eq!(max_pdu_data_length(25, RESPONSE_FIXED_LENGTH).unwrap(), 1);
        assert!(max_pdu_data_length(24, RESPONSE_FIXED_LENGTH).is_err());
    }

    #[test]
    fn test_ten_thousand_bytes_at_4096() {
        let payload = vec![0xAB; 10_000];
        let fragments = fragment_response(1, 0, &payload, 4096).unwrap();

        assert_eq!(fragments.len(), 3);
        let lengths: Vec<usize> = fragments.iter().map(|f| f.stub_data.len()).collect();
        assert_eq!(lengths, vec![4072, 4072, 1856]);
        assert_eq!(lengths.iter().sum::<usize>(), 10_000);

        let hints: Vec<u32> = fragments.iter().map(|f| f.alloc_hint).collect();
        assert_eq!(hints, vec![10_000, 10_000 - 4072, 1856]);

        assert_eq!(fragments[0].header.packet_flags, PacketFlags::FIRST_FRAG);
        assert_eq!(fragments[1].header.packet_flags, PacketFlags::empty());
        assert_eq!(fragments[2].header.packet_flags, PacketFlags::LAST_FRAG);

        for fragment in &fragments {
            assert!(fragment.serialize().unwrap().len() <= 4096);
        }
    }

    #[test]
    fn test_single_chunk_has_both_flags() {
        let fragments = fragment_response(2, 0, &[1, 2, 3], 4280).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].header.packet_flags, PacketFlags::complete());
        assert_eq!(fragments[0].alloc_hint, 3);

        // Exactly one fragment's worth still fits
        let payload = vec![0; 4072];
        let fragments = fragment_response(2, 0, &payload, 4096).unwrap();
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn test_empty_payload() {
        let fragments = fragment_response(3, 0, &[], 4280).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].header.packet_flags, PacketFlags::complete());
        assert_eq!(fragments[0].alloc_hint, 0);
        assert_eq!(reassemble(fragments).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_request_fragments_with_object() {
        let object = Uuid::from_u128(42);
        let payload = vec![7; 100];
        let fragments = fragment_request(4, 1, 15, Some(object), &payload, 80).unwrap();

        // 80 - 16 - 8 - 16 = 40 data bytes per fragment
        assert_eq!(fragments.len(), 3);
        for fragment in &fragments {
            assert_eq!(fragment.object, Some(object));
            assert!(fragment.header.packet_flags.contains(PacketFlags::OBJECT_UUID));
            assert!(fragment.serialize().unwrap().len() <= 80);
        }
        assert!(fragments[0].header.packet_flags.is_first_frag());
        assert!(fragments[2].header.packet_flags.is_last_frag());
        assert_eq!(reassemble(fragments).unwrap(), payload);
    }

    #[test]
    fn test_call_id_change_is_rejected() {
        let mut fragments = fragment_response(5, 0, &[1; 100], 50).unwrap();
        fragments[1].header.call_id = 6;

        let mut assembler = FragmentAssembler::new();
        assert_eq!(assembler.push(&fragments[0]).unwrap(), None);
        assert!(assembler.in_progress());
        assert!(matches!(
            assembler.push(&fragments[1]),
            Err(Error::Reassembly(_))
        ));
        assert_eq!(assembler.state(), &AssemblyState::AwaitingFirst);
    }

    #[test]
    fn test_missing_first_fragment() {
        let fragments = fragment_response(5, 0, &[1; 100], 50).unwrap();
        let mut assembler = FragmentAssembler::new();
        assert!(matches!(
            assembler.push(&fragments[1]),
            Err(Error::Reassembly(_))
        ));
    }

    #[test]
    fn test_restart_before_last_is_rejected() {
        let fragments = fragment_response(5, 0, &[1; 100], 50).unwrap();
        let mut assembler = FragmentAssembler::new();
        assembler.push(&fragments[0]).unwrap();
        assert!(assembler.push(&fragments[0]).is_err());
    }

    #[test]
    fn test_stream_without_last_fragment() {
        let mut fragments = fragment_response(9, 0, &[1; 100], 50).unwrap();
        fragments.pop();
        assert!(matches!(
            reassemble(fragments),
            Err(Error::IncompleteCall { call_id: 9 })
        ));
    }

    #[test]
    fn test_assembler_handles_consecutive_calls() {
        let mut assembler = FragmentAssembler::new();
        for call_id in 1..=3u32 {
            let payload = vec![call_id as u8; 70];
            let mut result = None;
            for fragment in fragment_response(call_id, 0, &payload, 50).unwrap() {
                result = assembler.push(&fragment).unwrap();
            }
            assert_eq!(result, Some(payload));
            assert_eq!(assembler.state(), &AssemblyState::Complete { call_id });
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn fragment_then_reassemble_is_identity(
            payload in proptest::collection::vec(any::<u8>(), 0..6000),
            max_frag in 25u16..5000,
        ) {
            let fragments = fragment_response(77, 0, &payload, max_frag).unwrap();

            let mut offset = 0;
            for fragment in &fragments {
                prop_assert_eq!(fragment.alloc_hint as usize, payload.len() - offset);
                prop_assert!(fragment.serialize().unwrap().len() <= max_frag as usize);
                offset += fragment.stub_data.len();
            }

            let max_data = max_pdu_data_length(max_frag, RESPONSE_FIXED_LENGTH).unwrap();
            if payload.len() <= max_data {
                prop_assert_eq!(fragments.len(), 1);
                prop_assert_eq!(fragments[0].header.packet_flags, PacketFlags::complete());
            }

            prop_assert_eq!(reassemble(fragments).unwrap(), payload);
        }
    }
}
