//! DCE/RPC packet structures and serialization
//!
//! Every PDU starts with the 16-byte common header. The integer
//! representation nibble of the header's data representation selects the
//! byte order of all multi-byte PDU fields, the header's own lengths
//! included. Lengths are always recomputed when a PDU is serialized.

use crate::dcerpc::ndr::{FormatLabel, IntegerRepresentation};
use crate::dcerpc::{
    BindNakReason, FaultStatus, NegotiationResult, PacketFlags, PacketType, RejectionReason,
    SyntaxId, COMMON_HEADER_LENGTH, DCERPC_VERSION_MAJOR, DCERPC_VERSION_MINOR, DEFAULT_MAX_FRAG,
};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::convert::TryFrom;
use uuid::Uuid;

/// Fixed fields of a request: alloc hint, context id, opnum
pub const REQUEST_FIXED_LENGTH: usize = 8;
/// Fixed fields of a response: alloc hint, context id, cancel count, reserved
pub const RESPONSE_FIXED_LENGTH: usize = 8;
/// Fixed fields of a fault: response fields, status, reserved
pub const FAULT_FIXED_LENGTH: usize = 16;
/// Length of the optional object UUID in a request
pub const OBJECT_UUID_LENGTH: usize = 16;

/// Data representation sent by this implementation: little-endian, ASCII, IEEE
pub const LITTLE_ENDIAN_DATA_REPRESENTATION: [u8; 4] = [0x10, 0x00, 0x00, 0x00];

/// Common DCE/RPC packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    pub data_representation: [u8; 4],
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl RpcHeader {
    pub fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            version_major: DCERPC_VERSION_MAJOR,
            version_minor: DCERPC_VERSION_MINOR,
            packet_type,
            packet_flags: PacketFlags::complete(),
            data_representation: LITTLE_ENDIAN_DATA_REPRESENTATION,
            frag_length: 0, // Computed on serialize
            auth_length: 0,
            call_id,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.data_representation[0] >> 4 == IntegerRepresentation::LittleEndian as u8
    }

    /// Parse the common header and check its lengths against `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < COMMON_HEADER_LENGTH {
            return Err(Error::malformed_pdu(
                data.len(),
                format!(
                    "common header needs {} bytes, got {}",
                    COMMON_HEADER_LENGTH,
                    data.len()
                ),
            ));
        }

        let mut data_representation = [0u8; 4];
        data_representation.copy_from_slice(&data[4..8]);
        let little_endian = FormatLabel::from_bytes(&data_representation)?.is_little_endian();
        let mut reader = PduReader::new(data, little_endian);
        reader.skip(8)?;
        let frag_length = reader.read_u16()?;
        let auth_length = reader.read_u16()?;
        let call_id = reader.read_u32()?;

        let header = Self {
            version_major: data[0],
            version_minor: data[1],
            packet_type: PacketType::try_from(data[2])?,
            packet_flags: PacketFlags::from_bits_retain(data[3]),
            data_representation,
            frag_length,
            auth_length,
            call_id,
        };

        let frag_len = frag_length as usize;
        if frag_len < COMMON_HEADER_LENGTH {
            return Err(Error::malformed_pdu(
                8,
                format!("fragment length {} shorter than the header", frag_len),
            ));
        }
        if frag_len > data.len() {
            return Err(Error::malformed_pdu(
                8,
                format!(
                    "fragment length {} exceeds buffer of {} bytes",
                    frag_len,
                    data.len()
                ),
            ));
        }
        if COMMON_HEADER_LENGTH + auth_length as usize > frag_len {
            return Err(Error::malformed_pdu(
                10,
                format!(
                    "auth length {} does not fit fragment of {} bytes",
                    auth_length, frag_len
                ),
            ));
        }
        Ok(header)
    }

    /// Fragment length announced by a raw common header
    pub fn peek_frag_length(header: &[u8]) -> Result<usize> {
        Ok(Self::parse_lengths(header)?.0)
    }

    fn parse_lengths(header: &[u8]) -> Result<(usize, usize)> {
        if header.len() < COMMON_HEADER_LENGTH {
            return Err(Error::malformed_pdu(header.len(), "truncated common header"));
        }
        let mut dr = [0u8; 4];
        dr.copy_from_slice(&header[4..8]);
        let mut reader = PduReader::new(header, FormatLabel::from_bytes(&dr)?.is_little_endian());
        reader.skip(8)?;
        let frag_length = reader.read_u16()? as usize;
        let auth_length = reader.read_u16()? as usize;
        Ok((frag_length, auth_length))
    }
}

/// Writer for PDU fields in the byte order of a header's data representation
pub(crate) struct PduWriter {
    buffer: Vec<u8>,
    little_endian: bool,
}

impl PduWriter {
    /// Start a PDU with `header`; lengths are patched by [`PduWriter::finish`]
    pub(crate) fn new(header: &RpcHeader) -> Result<Self> {
        let label = FormatLabel::from_bytes(&header.data_representation)?;
        let mut writer = Self {
            buffer: Vec::with_capacity(64),
            little_endian: label.is_little_endian(),
        };
        writer.buffer.extend_from_slice(&[
            header.version_major,
            header.version_minor,
            header.packet_type as u8,
            header.packet_flags.bits(),
        ]);
        writer.buffer.extend_from_slice(&header.data_representation);
        writer.u16(0);
        writer.u16(0);
        writer.u32(header.call_id);
        Ok(writer)
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub(crate) fn u16(&mut self, value: u16) {
        let mut bytes = [0u8; 2];
        if self.little_endian {
            LittleEndian::write_u16(&mut bytes, value);
        } else {
            BigEndian::write_u16(&mut bytes, value);
        }
        self.buffer.extend_from_slice(&bytes);
    }

    pub(crate) fn u32(&mut self, value: u32) {
        let mut bytes = [0u8; 4];
        if self.little_endian {
            LittleEndian::write_u32(&mut bytes, value);
        } else {
            BigEndian::write_u32(&mut bytes, value);
        }
        self.buffer.extend_from_slice(&bytes);
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub(crate) fn uuid(&mut self, uuid: &Uuid) {
        if self.little_endian {
            self.buffer.extend_from_slice(&uuid.to_bytes_le());
        } else {
            self.buffer.extend_from_slice(uuid.as_bytes());
        }
    }

    pub(crate) fn syntax_id(&mut self, syntax: &SyntaxId) {
        self.uuid(&syntax.uuid);
        self.u32(syntax.version);
    }

    /// Pad with zeros to a multiple of `alignment` from the PDU start
    pub(crate) fn pad_to(&mut self, alignment: usize) {
        let padding = (alignment - self.buffer.len() % alignment) % alignment;
        self.buffer.resize(self.buffer.len() + padding, 0);
    }

    /// Append the auth verifier and fill in both header lengths
    pub(crate) fn finish(mut self, auth_verifier: &[u8]) -> Result<Vec<u8>> {
        let auth_length = u16::try_from(auth_verifier.len()).map_err(|_| {
            Error::InvalidParameter(format!(
                "auth verifier of {} bytes is too long",
                auth_verifier.len()
            ))
        })?;
        self.buffer.extend_from_slice(auth_verifier);
        let frag_length = u16::try_from(self.buffer.len()).map_err(|_| {
            Error::InvalidParameter(format!(
                "PDU of {} bytes exceeds the maximum fragment length",
                self.buffer.len()
            ))
        })?;
        if self.little_endian {
            LittleEndian::write_u16(&mut self.buffer[8..10], frag_length);
            LittleEndian::write_u16(&mut self.buffer[10..12], auth_length);
        } else {
            BigEndian::write_u16(&mut self.buffer[8..10], frag_length);
            BigEndian::write_u16(&mut self.buffer[10..12], auth_length);
        }
        Ok(self.buffer)
    }
}

/// Reader for PDU fields, reporting the offset of any truncation
pub(crate) struct PduReader<'a> {
    data: &'a [u8],
    position: usize,
    little_endian: bool,
}

impl<'a> PduReader<'a> {
    pub(crate) fn new(data: &'a [u8], little_endian: bool) -> Self {
        Self {
            data,
            position: 0,
            little_endian,
        }
    }

    /// Reader positioned after the common header of a parsed PDU,
    /// bounded by the fragment length and excluding the auth verifier.
    fn for_body(data: &'a [u8], header: &RpcHeader) -> Self {
        let end = header.frag_length as usize - header.auth_length as usize;
        Self {
            data: &data[..end],
            position: COMMON_HEADER_LENGTH,
            little_endian: header.is_little_endian(),
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::malformed_pdu(
                self.position,
                format!("needed {} bytes, {} remaining", len, self.remaining()),
            ));
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(if self.little_endian {
            LittleEndian::read_u16(bytes)
        } else {
            BigEndian::read_u16(bytes)
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.data[self.position.min(self.data.len())..].to_vec();
        self.position = self.data.len();
        rest
    }

    pub(crate) fn read_uuid(&mut self) -> Result<Uuid> {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(self.take(16)?);
        Ok(if self.little_endian {
            Uuid::from_bytes_le(bytes)
        } else {
            Uuid::from_bytes(bytes)
        })
    }

    pub(crate) fn read_syntax_id(&mut self) -> Result<SyntaxId> {
        let uuid = self.read_uuid()?;
        let version = self.read_u32()?;
        Ok(SyntaxId { uuid, version })
    }

    /// Skip padding to a multiple of `alignment` from the PDU start
    pub(crate) fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - self.position % alignment) % alignment;
        self.skip(padding)
    }
}

fn auth_verifier(data: &[u8], header: &RpcHeader) -> Vec<u8> {
    let end = header.frag_length as usize;
    data[end - header.auth_length as usize..end].to_vec()
}

fn expect_type(header: &RpcHeader, allowed: &[PacketType]) -> Result<()> {
    if allowed.contains(&header.packet_type) {
        Ok(())
    } else {
        Err(Error::malformed_pdu(
            2,
            format!("unexpected packet type {:?}", header.packet_type),
        ))
    }
}

/// Presentation context proposed by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId, transfer_syntaxes: Vec<SyntaxId>) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        }
    }
}

/// Bind packet - establishes context. Also carries alter_context PDUs,
/// which share the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPacket {
    pub header: RpcHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub contexts: Vec<ContextElement>,
    pub auth_verifier: Vec<u8>,
}

impl BindPacket {
    pub fn new(call_id: u32, contexts: Vec<ContextElement>) -> Self {
        Self {
            header: RpcHeader::new(PacketType::Bind, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            contexts,
            auth_verifier: Vec::new(),
        }
    }

    /// An alter_context PDU adding contexts to an existing association
    pub fn alter_context(call_id: u32, contexts: Vec<ContextElement>) -> Self {
        let mut packet = Self::new(call_id, contexts);
        packet.header.packet_type = PacketType::AlterContext;
        packet
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.contexts.len()).map_err(|_| {
            Error::InvalidParameter(format!("{} presentation contexts", self.contexts.len()))
        })?;

        let mut writer = PduWriter::new(&self.header)?;
        writer.u16(self.max_xmit_frag);
        writer.u16(self.max_recv_frag);
        writer.u32(self.assoc_group_id);
        writer.u8(count);
        writer.bytes(&[0, 0, 0]); // Reserved

        for context in &self.contexts {
            let transfer_count = u8::try_from(context.transfer_syntaxes.len()).map_err(|_| {
                Error::InvalidParameter(format!(
                    "{} transfer syntaxes in context {}",
                    context.transfer_syntaxes.len(),
                    context.context_id
                ))
            })?;
            writer.u16(context.context_id);
            writer.u8(transfer_count);
            writer.u8(0); // Reserved
            writer.syntax_id(&context.abstract_syntax);
            for syntax in &context.transfer_syntaxes {
                writer.syntax_id(syntax);
            }
        }

        writer.finish(&self.auth_verifier)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header = RpcHeader::parse(data)?;
        expect_type(&header, &[PacketType::Bind, PacketType::AlterContext])?;
        let mut reader = PduReader::for_body(data, &header);

        let max_xmit_frag = reader.read_u16()?;
        let max_recv_frag = reader.read_u16()?;
        let assoc_group_id = reader.read_u32()?;
        let count = reader.read_u8()?;
        reader.skip(3)?;

        let mut contexts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let context_id = reader.read_u16()?;
            let transfer_count = reader.read_u8()?;
            reader.skip(1)?;
            let abstract_syntax = reader.read_syntax_id()?;
            let mut transfer_syntaxes = Vec::with_capacity(transfer_count as usize);
            for _ in 0..transfer_count {
                transfer_syntaxes.push(reader.read_syntax_id()?);
            }
            contexts.push(ContextElement {
                context_id,
                abstract_syntax,
                transfer_syntaxes,
            });
        }

        Ok(Self {
            auth_verifier: auth_verifier(data, &header),
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            contexts,
        })
    }
}

/// Outcome for one presentation context, position-correlated with the bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextResult {
    pub result: u16,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

impl ContextResult {
    pub fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: NegotiationResult::Acceptance as u16,
            reason: RejectionReason::NotSpecified as u16,
            transfer_syntax,
        }
    }

    pub fn rejected(result: NegotiationResult, reason: RejectionReason) -> Self {
        Self {
            result: result as u16,
            reason: reason as u16,
            transfer_syntax: SyntaxId::NIL,
        }
    }

    pub fn negotiation_result(&self) -> std::result::Result<NegotiationResult, u16> {
        NegotiationResult::try_from(self.result)
    }

    pub fn is_accepted(&self) -> bool {
        self.result == NegotiationResult::Acceptance as u16
    }
}

/// Bind acknowledgment packet, also used for alter_context_resp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAckPacket {
    pub header: RpcHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Secondary address without its terminator, e.g. `\PIPE\srvsvc`
    pub secondary_address: String,
    pub results: Vec<ContextResult>,
    pub auth_verifier: Vec<u8>,
}

impl BindAckPacket {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.results.len())
            .map_err(|_| Error::InvalidParameter(format!("{} results", self.results.len())))?;

        let mut writer = PduWriter::new(&self.header)?;
        writer.u16(self.max_xmit_frag);
        writer.u16(self.max_recv_frag);
        writer.u32(self.assoc_group_id);

        if self.secondary_address.is_empty() {
            writer.u16(0);
        } else {
            let length = u16::try_from(self.secondary_address.len() + 1).map_err(|_| {
                Error::InvalidParameter("secondary address too long".to_string())
            })?;
            writer.u16(length);
            writer.bytes(self.secondary_address.as_bytes());
            writer.u8(0);
        }
        writer.pad_to(4);

        writer.u8(count);
        writer.bytes(&[0, 0, 0]); // Reserved
        for result in &self.results {
            writer.u16(result.result);
            writer.u16(result.reason);
            writer.syntax_id(&result.transfer_syntax);
        }

        writer.finish(&self.auth_verifier)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header = RpcHeader::parse(data)?;
        expect_type(&header, &[PacketType::BindAck, PacketType::AlterContextResp])?;
        let mut reader = PduReader::for_body(data, &header);

        let max_xmit_frag = reader.read_u16()?;
        let max_recv_frag = reader.read_u16()?;
        let assoc_group_id = reader.read_u32()?;

        let address_offset = reader.position();
        let address_length = reader.read_u16()? as usize;
        let mut address = reader.read_bytes(address_length)?;
        if address.last() == Some(&0) {
            address.pop();
        }
        let secondary_address = String::from_utf8(address).map_err(|_| {
            Error::malformed_pdu(address_offset, "secondary address is not ASCII")
        })?;
        reader.align(4)?;

        let count = reader.read_u8()?;
        reader.skip(3)?;
        let mut results = Vec::with_capacity(count as usize);
        for _ in 0..count {
            results.push(ContextResult {
                result: reader.read_u16()?,
                reason: reader.read_u16()?,
                transfer_syntax: reader.read_syntax_id()?,
            });
        }

        Ok(Self {
            auth_verifier: auth_verifier(data, &header),
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_address,
            results,
        })
    }
}

/// Bind refusal, listing the protocol versions the server supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindNakPacket {
    pub header: RpcHeader,
    pub reason: u16,
    pub versions: Vec<(u8, u8)>,
}

impl BindNakPacket {
    pub fn new(call_id: u32, reason: BindNakReason) -> Self {
        Self {
            header: RpcHeader::new(PacketType::BindNak, call_id),
            reason: reason as u16,
            versions: vec![(DCERPC_VERSION_MAJOR, DCERPC_VERSION_MINOR)],
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.versions.len())
            .map_err(|_| Error::InvalidParameter(format!("{} versions", self.versions.len())))?;
        let mut writer = PduWriter::new(&self.header)?;
        writer.u16(self.reason);
        writer.u8(count);
        for (major, minor) in &self.versions {
            writer.u8(*major);
            writer.u8(*minor);
        }
        writer.finish(&[])
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header = RpcHeader::parse(data)?;
        expect_type(&header, &[PacketType::BindNak])?;
        let mut reader = PduReader::for_body(data, &header);

        let reason = reader.read_u16()?;
        // Some peers omit the version list entirely
        let count = if reader.remaining() > 0 {
            reader.read_u8()?
        } else {
            0
        };
        let mut versions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            versions.push((reader.read_u8()?, reader.read_u8()?));
        }

        Ok(Self {
            header,
            reason,
            versions,
        })
    }
}

/// Request packet - actual RPC call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    pub header: RpcHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    /// Present if and only if the OBJECT_UUID flag is set
    pub object: Option<Uuid>,
    pub stub_data: Vec<u8>,
    pub auth_verifier: Vec<u8>,
}

impl RequestPacket {
    pub fn new(call_id: u32, context_id: u16, opnum: u16, stub_data: Vec<u8>) -> Self {
        Self {
            header: RpcHeader::new(PacketType::Request, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id,
            opnum,
            object: None,
            stub_data,
            auth_verifier: Vec::new(),
        }
    }

    /// Attach an object UUID, setting the matching flag
    pub fn with_object(mut self, object: Uuid) -> Self {
        self.object = Some(object);
        self.header.packet_flags |= PacketFlags::OBJECT_UUID;
        self
    }

    /// Fixed fields preceding the stub data
    pub fn fixed_length(&self) -> usize {
        REQUEST_FIXED_LENGTH + self.object.map_or(0, |_| OBJECT_UUID_LENGTH)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.object.is_some() != self.header.packet_flags.contains(PacketFlags::OBJECT_UUID) {
            return Err(Error::InvalidParameter(
                "object UUID and OBJECT_UUID flag disagree".to_string(),
            ));
        }

        let mut writer = PduWriter::new(&self.header)?;
        writer.u32(self.alloc_hint);
        writer.u16(self.context_id);
        writer.u16(self.opnum);
        if let Some(object) = &self.object {
            writer.uuid(object);
        }
        writer.bytes(&self.stub_data);
        writer.finish(&self.auth_verifier)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header = RpcHeader::parse(data)?;
        expect_type(&header, &[PacketType::Request])?;
        let mut reader = PduReader::for_body(data, &header);

        let alloc_hint = reader.read_u32()?;
        let context_id = reader.read_u16()?;
        let opnum = reader.read_u16()?;
        let object = if header.packet_flags.contains(PacketFlags::OBJECT_UUID) {
            Some(reader.read_uuid()?)
        } else {
            None
        };
        let stub_data = reader.read_rest();

        Ok(Self {
            auth_verifier: auth_verifier(data, &header),
            header,
            alloc_hint,
            context_id,
            opnum,
            object,
            stub_data,
        })
    }
}

/// Response packet - RPC call result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub header: RpcHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub_data: Vec<u8>,
    pub auth_verifier: Vec<u8>,
}

impl ResponsePacket {
    pub fn new(call_id: u32, context_id: u16, stub_data: Vec<u8>) -> Self {
        Self {
            header: RpcHeader::new(PacketType::Response, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id,
            cancel_count: 0,
            stub_data,
            auth_verifier: Vec::new(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut writer = PduWriter::new(&self.header)?;
        writer.u32(self.alloc_hint);
        writer.u16(self.context_id);
        writer.u8(self.cancel_count);
        writer.u8(0); // Reserved
        writer.bytes(&self.stub_data);
        writer.finish(&self.auth_verifier)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header = RpcHeader::parse(data)?;
        expect_type(&header, &[PacketType::Response])?;
        let mut reader = PduReader::for_body(data, &header);

        let alloc_hint = reader.read_u32()?;
        let context_id = reader.read_u16()?;
        let cancel_count = reader.read_u8()?;
        reader.skip(1)?;
        let stub_data = reader.read_rest();

        Ok(Self {
            auth_verifier: auth_verifier(data, &header),
            header,
            alloc_hint,
            context_id,
            cancel_count,
            stub_data,
        })
    }
}

/// Fault packet - RPC error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultPacket {
    pub header: RpcHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
    pub auth_verifier: Vec<u8>,
}

impl FaultPacket {
    pub fn new(call_id: u32, context_id: u16, status: u32) -> Self {
        Self {
            header: RpcHeader::new(PacketType::Fault, call_id),
            alloc_hint: (COMMON_HEADER_LENGTH + FAULT_FIXED_LENGTH) as u32,
            context_id,
            cancel_count: 0,
            status,
            auth_verifier: Vec::new(),
        }
    }

    /// Single unfragmented fault for a call that was never executed
    pub fn did_not_execute(call_id: u32, context_id: u16, status: FaultStatus) -> Self {
        let mut fault = Self::new(call_id, context_id, status as u32);
        fault.header.packet_flags = PacketFlags::complete() | PacketFlags::DID_NOT_EXECUTE;
        fault
    }

    /// Fault answering an operation number the service does not implement
    pub fn op_range_error(call_id: u32, context_id: u16) -> Self {
        Self::did_not_execute(call_id, context_id, FaultStatus::OpRangeError)
    }

    pub fn fault_status(&self) -> Option<FaultStatus> {
        FaultStatus::from_u32(self.status)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut writer = PduWriter::new(&self.header)?;
        writer.u32(self.alloc_hint);
        writer.u16(self.context_id);
        writer.u8(self.cancel_count);
        writer.u8(0); // Reserved
        writer.u32(self.status);
        writer.u32(0); // Reserved
        writer.finish(&self.auth_verifier)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header = RpcHeader::parse(data)?;
        expect_type(&header, &[PacketType::Fault])?;
        let mut reader = PduReader::for_body(data, &header);

        let alloc_hint = reader.read_u32()?;
        let context_id = reader.read_u16()?;
        let cancel_count = reader.read_u8()?;
        reader.skip(1)?;
        let status = reader.read_u32()?;
        reader.skip(4)?;

        Ok(Self {
            auth_verifier: auth_verifier(data, &header),
            header,
            alloc_hint,
            context_id,
            cancel_count,
            status,
        })
    }
}

/// Any connection-oriented PDU, dispatched on the packet type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Bind(BindPacket),
    AlterContext(BindPacket),
    BindAck(BindAckPacket),
    AlterContextResp(BindAckPacket),
    BindNak(BindNakPacket),
    Request(RequestPacket),
    Response(ResponsePacket),
    Fault(FaultPacket),
    /// Auth3, shutdown, cancel and orphaned PDUs, kept as raw body bytes
    Other { header: RpcHeader, body: Vec<u8> },
}

impl Pdu {
    /// Decode one PDU from the start of `data`
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = RpcHeader::parse(data)?;
        let pdu = match header.packet_type {
            PacketType::Bind => Pdu::Bind(BindPacket::deserialize(data)?),
            PacketType::AlterContext => Pdu::AlterContext(BindPacket::deserialize(data)?),
            PacketType::BindAck => Pdu::BindAck(BindAckPacket::deserialize(data)?),
            PacketType::AlterContextResp => {
                Pdu::AlterContextResp(BindAckPacket::deserialize(data)?)
            }
            PacketType::BindNak => Pdu::BindNak(BindNakPacket::deserialize(data)?),
            PacketType::Request => Pdu::Request(RequestPacket::deserialize(data)?),
            PacketType::Response => Pdu::Response(ResponsePacket::deserialize(data)?),
            PacketType::Fault => Pdu::Fault(FaultPacket::deserialize(data)?),
            _ => Pdu::Other {
                body: data[COMMON_HEADER_LENGTH..header.frag_length as usize].to_vec(),
                header,
            },
        };
        Ok(pdu)
    }

    pub fn header(&self) -> &RpcHeader {
        match self {
            Pdu::Bind(p) | Pdu::AlterContext(p) => &p.header,
            Pdu::BindAck(p) | Pdu::AlterContextResp(p) => &p.header,
            Pdu::BindNak(p) => &p.header,
            Pdu::Request(p) => &p.header,
            Pdu::Response(p) => &p.header,
            Pdu::Fault(p) => &p.header,
            Pdu::Other { header, .. } => header,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Pdu::Bind(p) | Pdu::AlterContext(p) => p.serialize(),
            Pdu::BindAck(p) | Pdu::AlterContextResp(p) => p.serialize(),
            Pdu::BindNak(p) => p.serialize(),
            Pdu::Request(p) => p.serialize(),
            Pdu::Response(p) => p.serialize(),
            Pdu::Fault(p) => p.serialize(),
            Pdu::Other { header, body } => {
                let mut writer = PduWriter::new(header)?;
                let auth_start = body.len().saturating_sub(header.auth_length as usize);
                writer.bytes(&body[..auth_start]);
                writer.finish(&body[auth_start..])
            }
        }
    }
}
