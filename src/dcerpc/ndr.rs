//! NDR (Network Data Representation) encoding/decoding for DCE/RPC
//! This implements the actual wire format for RPC stub data.
//!
//! Embedded pointers are deferred: the construct that contains a pointer
//! carries only a 4-byte referent id, and the referent itself is written
//! after the whole construct, in the order the pointers were encountered.
//! Each referent is a construct of its own, so its embedded pointers are
//! written right after it, before the next sibling referent.
//!
//! Decoding mirrors this in two phases. The fixed part of a construct is
//! decoded first and every non-null pointer reserves a slot in a
//! [`ReferentArena`]. The deferred region is then decoded slot by slot in
//! the same order, and finally the slots are bound back into the pointer
//! fields. Order is the only correlation between a pointer and its data.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::any::Any;
use std::convert::TryFrom;
use std::fmt;

/// NDR format label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatLabel {
    pub integer_representation: IntegerRepresentation,
    pub character_representation: CharacterRepresentation,
    pub floating_point_representation: FloatingPointRepresentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IntegerRepresentation {
    BigEndian = 0,
    LittleEndian = 1,
}

impl TryFrom<u8> for IntegerRepresentation {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(IntegerRepresentation::BigEndian),
            1 => Ok(IntegerRepresentation::LittleEndian),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CharacterRepresentation {
    ASCII = 0,
    EBCDIC = 1,
}

impl TryFrom<u8> for CharacterRepresentation {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(CharacterRepresentation::ASCII),
            1 => Ok(CharacterRepresentation::EBCDIC),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FloatingPointRepresentation {
    IEEE = 0,
    VAX = 1,
    Cray = 2,
    IBM = 3,
}

impl TryFrom<u8> for FloatingPointRepresentation {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(FloatingPointRepresentation::IEEE),
            1 => Ok(FloatingPointRepresentation::VAX),
            2 => Ok(FloatingPointRepresentation::Cray),
            3 => Ok(FloatingPointRepresentation::IBM),
            other => Err(other),
        }
    }
}

impl Default for FormatLabel {
    fn default() -> Self {
        Self {
            integer_representation: IntegerRepresentation::LittleEndian,
            character_representation: CharacterRepresentation::ASCII,
            floating_point_representation: FloatingPointRepresentation::IEEE,
        }
    }
}

impl FormatLabel {
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.integer_representation as u8) << 4 | self.character_representation as u8,
            self.floating_point_representation as u8,
            0, // Reserved
            0, // Reserved
        ]
    }

    /// Parse the data representation bytes of a PDU header
    pub fn from_bytes(bytes: &[u8; 4]) -> Result<Self> {
        let integer_representation = IntegerRepresentation::try_from(bytes[0] >> 4)
            .map_err(|v| Error::malformed_pdu(4, format!("unknown integer representation {}", v)))?;
        let character_representation = CharacterRepresentation::try_from(bytes[0] & 0x0F)
            .map_err(|v| {
                Error::malformed_pdu(4, format!("unknown character representation {}", v))
            })?;
        let floating_point_representation = FloatingPointRepresentation::try_from(bytes[1])
            .map_err(|v| {
                Error::malformed_pdu(5, format!("unknown floating point representation {}", v))
            })?;
        Ok(Self {
            integer_representation,
            character_representation,
            floating_point_representation,
        })
    }

    pub fn is_little_endian(&self) -> bool {
        self.integer_representation == IntegerRepresentation::LittleEndian
    }
}

/// First referent id handed out by an encoder, MIDL style
const FIRST_REFERENT_ID: u32 = 0x0002_0000;

/// A value that can be written to an NDR stream.
///
/// `encode` writes the fixed part of the value. Embedded pointers go
/// through [`NdrEncoder::encode_pointer`], which defers their referents.
pub trait NdrEncode {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()>;
}

/// A value that can be read from an NDR stream.
pub trait NdrDecode: Sized + 'static {
    /// Decode the fixed part of the value. Embedded pointers are read with
    /// [`NdrDecoder::decode_pointer`] and stay unbound until
    /// [`NdrDecode::bind_referents`] runs.
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self>;

    /// Bind the deferred referents of every embedded pointer, in the same
    /// order the pointers were decoded.
    fn bind_referents(&mut self, _arena: &mut ReferentArena) -> Result<()> {
        Ok(())
    }
}

/// NDR encoder
pub struct NdrEncoder<'a> {
    buffer: Vec<u8>,
    deferred: Vec<&'a dyn NdrEncode>,
    next_referent_id: u32,
}

impl<'a> NdrEncoder<'a> {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            deferred: Vec::new(),
            next_referent_id: FIRST_REFERENT_ID,
        }
    }

    /// Get the encoded bytes, writing any referents still pending
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let pending = std::mem::take(&mut self.deferred);
        for referent in pending {
            self.encode_top_level(referent)?;
        }
        Ok(self.buffer)
    }

    /// Current length of the stream
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Encode alignment padding
    fn align(&mut self, alignment: usize) {
        let offset = self.buffer.len();
        let padding = (alignment - (offset % alignment)) % alignment;
        self.buffer.resize(offset + padding, 0);
    }

    /// Encode a u8
    pub fn encode_u8(&mut self, value: u8) -> Result<()> {
        self.buffer.push(value);
        Ok(())
    }

    /// Encode a u16
    pub fn encode_u16(&mut self, value: u16) -> Result<()> {
        self.align(2);
        self.buffer.write_u16::<LittleEndian>(value)?;
        Ok(())
    }

    /// Encode a u32
    pub fn encode_u32(&mut self, value: u32) -> Result<()> {
        self.align(4);
        self.buffer.write_u32::<LittleEndian>(value)?;
        Ok(())
    }

    /// Encode a u64 (aligned like the 4-byte types)
    pub fn encode_u64(&mut self, value: u64) -> Result<()> {
        self.align(4);
        self.buffer.write_u64::<LittleEndian>(value)?;
        Ok(())
    }

    /// Encode raw bytes without alignment
    pub fn encode_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn next_referent_id(&mut self) -> u32 {
        let id = self.next_referent_id;
        self.next_referent_id = self.next_referent_id.wrapping_add(4).max(FIRST_REFERENT_ID);
        id
    }

    /// Encode `value` as a top-level construct: its fixed part, then the
    /// referents of the pointers it embeds.
    pub fn encode_top_level(&mut self, value: &'a dyn NdrEncode) -> Result<()> {
        let outer = std::mem::take(&mut self.deferred);
        value.encode(self)?;
        let referents = std::mem::replace(&mut self.deferred, outer);
        for referent in referents {
            self.encode_top_level(referent)?;
        }
        Ok(())
    }

    /// Encode an embedded pointer. Only the referent id is written here;
    /// the referent follows the enclosing construct.
    pub fn encode_pointer<T: NdrEncode>(&mut self, value: Option<&'a T>) -> Result<()> {
        match value {
            Some(referent) => {
                let id = self.next_referent_id();
                self.encode_u32(id)?;
                self.deferred.push(referent);
            }
            None => self.encode_u32(0)?,
        }
        Ok(())
    }

    /// Encode a top-level pointer parameter: the referent id followed
    /// directly by the referent.
    pub fn encode_unique_pointer<T: NdrEncode>(&mut self, value: Option<&'a T>) -> Result<()> {
        match value {
            Some(referent) => {
                let id = self.next_referent_id();
                self.encode_u32(id)?;
                self.encode_top_level(referent)
            }
            None => self.encode_u32(0),
        }
    }

    /// Encode a conformant array: element count, then the elements
    pub fn encode_conformant_array<T: NdrEncode>(&mut self, array: &'a [T]) -> Result<()> {
        self.encode_u32(array.len() as u32)?;
        for item in array {
            item.encode(self)?;
        }
        Ok(())
    }

    /// Encode a unicode string as a conformant varying array of UTF-16 code
    /// units, exactly as given (no terminator is added).
    pub fn encode_unicode_string(&mut self, string: &str) -> Result<()> {
        let units: Vec<u16> = string.encode_utf16().collect();
        self.encode_utf16_units(&units)
    }

    /// Encode a `[string]` unicode string, which carries a null terminator
    pub fn encode_terminated_unicode_string(&mut self, string: &str) -> Result<()> {
        let units: Vec<u16> = string.encode_utf16().chain(std::iter::once(0)).collect();
        self.encode_utf16_units(&units)
    }

    fn encode_utf16_units(&mut self, units: &[u16]) -> Result<()> {
        self.encode_u32(units.len() as u32)?; // Max count
        self.encode_u32(0)?; // Offset
        self.encode_u32(units.len() as u32)?; // Actual count
        for &unit in units {
            self.encode_u16(unit)?;
        }
        Ok(())
    }
}

impl Default for NdrEncoder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

type DecodeFn = fn(&mut NdrDecoder<'_>) -> Result<Box<dyn Any>>;

fn decode_boxed<T: NdrDecode>(decoder: &mut NdrDecoder<'_>) -> Result<Box<dyn Any>> {
    Ok(Box::new(T::decode(decoder)?))
}

/// A pointer whose referent has been recorded but not yet decoded
struct PendingReferent {
    referent_id: u32,
    slot: usize,
    decode: DecodeFn,
}

/// Flat storage for decoded referents, indexed by the slot a pointer
/// reserved when it was decoded.
#[derive(Default)]
pub struct ReferentArena {
    slots: Vec<(u32, Option<Box<dyn Any>>)>,
}

impl ReferentArena {
    fn reserve(&mut self, referent_id: u32) -> usize {
        self.slots.push((referent_id, None));
        self.slots.len() - 1
    }

    fn fill(&mut self, slot: usize, value: Box<dyn Any>) {
        if let Some(entry) = self.slots.get_mut(slot) {
            entry.1 = Some(value);
        }
    }

    /// Remove the referent stored in `slot`
    pub fn take<T: NdrDecode>(&mut self, slot: usize) -> Result<T> {
        let (referent_id, value) = match self.slots.get_mut(slot) {
            Some((id, value)) => (*id, value.take()),
            None => (0, None),
        };
        let value = value.ok_or_else(|| {
            Error::malformed_ndr(
                0,
                format!("referent 0x{:08x} has no deferred data", referent_id),
            )
        })?;
        value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
            Error::malformed_ndr(
                0,
                format!("referent 0x{:08x} bound to the wrong type", referent_id),
            )
        })
    }

    /// Number of slots reserved so far
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for ReferentArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferentArena")
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// NDR decoder
pub struct NdrDecoder<'a> {
    data: &'a [u8],
    position: usize,
    pending: Vec<PendingReferent>,
    arena: ReferentArena,
}

impl<'a> NdrDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            pending: Vec::new(),
            arena: ReferentArena::default(),
        }
    }

    /// Get current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get remaining bytes count
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Skip alignment padding
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - (self.position % alignment)) % alignment;
        self.take(padding, "alignment padding")?;
        Ok(())
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::malformed_ndr(
                self.position,
                format!(
                    "{} needs {} bytes, {} remaining",
                    what,
                    len,
                    self.remaining()
                ),
            ));
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    /// Decode a u8
    pub fn decode_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Decode a u16
    pub fn decode_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        Ok(LittleEndian::read_u16(self.take(2, "u16")?))
    }

    /// Decode a u32
    pub fn decode_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        Ok(LittleEndian::read_u32(self.take(4, "u32")?))
    }

    /// Decode a u64
    pub fn decode_u64(&mut self) -> Result<u64> {
        self.align(4)?;
        Ok(LittleEndian::read_u64(self.take(8, "u64")?))
    }

    /// Decode raw bytes
    pub fn decode_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len, "byte run")?.to_vec())
    }

    /// Decode a top-level construct of type `T`, including the deferred
    /// referents of every pointer it embeds.
    pub fn decode_top_level<T: NdrDecode>(&mut self) -> Result<T> {
        let outer = std::mem::take(&mut self.pending);
        let mut value = T::decode(self)?;
        let referents = std::mem::replace(&mut self.pending, outer);
        self.decode_referents(referents)?;
        value.bind_referents(&mut self.arena)?;
        Ok(value)
    }

    fn decode_referents(&mut self, referents: Vec<PendingReferent>) -> Result<()> {
        for referent in referents {
            let outer = std::mem::take(&mut self.pending);
            let value = (referent.decode)(self).map_err(|e| match e {
                Error::MalformedNdr { offset, reason } => Error::MalformedNdr {
                    offset,
                    reason: format!("referent 0x{:08x}: {}", referent.referent_id, reason),
                },
                other => other,
            })?;
            let nested = std::mem::replace(&mut self.pending, outer);
            self.decode_referents(nested)?;
            self.arena.fill(referent.slot, value);
        }
        Ok(())
    }

    /// Decode an embedded pointer. The referent is decoded after the
    /// enclosing construct and bound by [`NdrPtr::bind`].
    pub fn decode_pointer<T: NdrDecode>(&mut self) -> Result<NdrPtr<T>> {
        let referent_id = self.decode_u32()?;
        if referent_id == 0 {
            return Ok(NdrPtr::null());
        }
        let slot = self.arena.reserve(referent_id);
        self.pending.push(PendingReferent {
            referent_id,
            slot,
            decode: decode_boxed::<T>,
        });
        Ok(NdrPtr(PtrState::Deferred(slot)))
    }

    /// Decode a top-level pointer parameter, whose referent follows the
    /// referent id directly.
    pub fn decode_unique_pointer<T: NdrDecode>(&mut self) -> Result<Option<T>> {
        let referent_id = self.decode_u32()?;
        if referent_id == 0 {
            Ok(None)
        } else {
            Ok(Some(self.decode_top_level()?))
        }
    }

    /// Decode a conformant array of inline elements
    pub fn decode_conformant_array<T: NdrDecode>(&mut self) -> Result<Vec<T>> {
        let count = self.decode_u32()? as usize;
        let mut array = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            array.push(T::decode(self)?);
        }
        Ok(array)
    }

    /// Decode a unicode string, reporting whether it carried a terminator.
    /// A final null code unit is always taken to be the terminator.
    pub fn decode_unicode_string(&mut self) -> Result<(String, bool)> {
        let start = self.position;
        let max_count = self.decode_u32()?;
        let offset = self.decode_u32()?;
        let actual_count = self.decode_u32()?;
        if offset as u64 + actual_count as u64 > max_count as u64 {
            return Err(Error::malformed_ndr(
                start,
                format!(
                    "string offset {} + actual count {} exceeds max count {}",
                    offset, actual_count, max_count
                ),
            ));
        }
        let raw = self.take(actual_count as usize * 2, "string characters")?;
        let mut units: Vec<u16> = raw.chunks_exact(2).map(LittleEndian::read_u16).collect();
        let terminated = units.last() == Some(&0);
        if terminated {
            units.pop();
        }
        let value = String::from_utf16(&units)
            .map_err(|e| Error::malformed_ndr(start, format!("Invalid UTF-16: {}", e)))?;
        Ok((value, terminated))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PtrState<T> {
    Null,
    Deferred(usize),
    Value(T),
}

/// An embedded NDR pointer.
///
/// After decoding, a pointer holds the arena slot of its referent until
/// the enclosing top-level construct binds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdrPtr<T>(PtrState<T>);

impl<T> NdrPtr<T> {
    pub fn new(value: T) -> Self {
        Self(PtrState::Value(value))
    }

    pub fn null() -> Self {
        Self(PtrState::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.0, PtrState::Null)
    }

    pub fn get(&self) -> Option<&T> {
        match &self.0 {
            PtrState::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self.0 {
            PtrState::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: NdrEncode> NdrPtr<T> {
    /// Encode as an embedded pointer of the construct being written
    pub fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        match &self.0 {
            PtrState::Value(value) => encoder.encode_pointer(Some(value)),
            PtrState::Null => encoder.encode_pointer::<T>(None),
            PtrState::Deferred(slot) => Err(Error::InvalidState(format!(
                "pointer still bound to referent slot {}",
                slot
            ))),
        }
    }
}

impl<T: NdrDecode> NdrPtr<T> {
    /// Resolve the referent recorded for this pointer
    pub fn bind(&mut self, arena: &mut ReferentArena) -> Result<()> {
        if let PtrState::Deferred(slot) = self.0 {
            let mut value: T = arena.take(slot)?;
            value.bind_referents(arena)?;
            self.0 = PtrState::Value(value);
        }
        Ok(())
    }
}

impl<T> Default for NdrPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Option<T>> for NdrPtr<T> {
    fn from(value: Option<T>) -> Self {
        value.map(NdrPtr::new).unwrap_or_else(NdrPtr::null)
    }
}

impl NdrPtr<NdrString> {
    /// Borrow the pointed-to string
    pub fn as_str(&self) -> Option<&str> {
        self.get().map(|s| s.value.as_str())
    }
}

/// A unicode string referent.
///
/// `terminated` records whether the encoding carries a trailing null code
/// unit, which `[string]` attributed fields require. The wire does not
/// mark the difference, so decoding treats a trailing null as the
/// terminator: a counted value that really ends in U+0000 comes back
/// terminated, without that character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdrString {
    pub value: String,
    pub terminated: bool,
}

impl NdrString {
    /// A `[string]` value, encoded with its terminator
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            terminated: true,
        }
    }

    /// A counted value, encoded without a terminator
    pub fn counted(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            terminated: false,
        }
    }
}

impl NdrEncode for NdrString {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        if self.terminated {
            encoder.encode_terminated_unicode_string(&self.value)
        } else {
            encoder.encode_unicode_string(&self.value)
        }
    }
}

impl NdrDecode for NdrString {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        let (value, terminated) = decoder.decode_unicode_string()?;
        Ok(Self { value, terminated })
    }
}

impl NdrEncode for u32 {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(*self)
    }
}

impl NdrDecode for u32 {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        decoder.decode_u32()
    }
}

/// A `Vec` is encoded as a conformant array of its elements
impl<T: NdrEncode> NdrEncode for Vec<T> {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_conformant_array(self)
    }
}

impl<T: NdrDecode> NdrDecode for Vec<T> {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        decoder.decode_conformant_array()
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        for item in self.iter_mut() {
            item.bind_referents(arena)?;
        }
        Ok(())
    }
}

/// The parameters of one direction of a call.
///
/// Every parameter is its own top-level construct, so a pointer embedded in
/// one parameter has its referent written before the next parameter starts.
pub trait NdrMessage: Sized {
    fn encode_params<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()>;

    fn decode_params(decoder: &mut NdrDecoder<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut encoder = NdrEncoder::new();
        self.encode_params(&mut encoder)?;
        encoder.into_bytes()
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut decoder = NdrDecoder::new(data);
        Self::decode_params(&mut decoder)
    }
}
