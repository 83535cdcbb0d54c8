//! DCE/RPC (Distributed Computing Environment / Remote Procedure Call) implementation
//! This is the engine behind SMB named pipes and services like SRVSVC and WKSSVC.

pub mod bind;
pub mod dispatch;
pub mod endpoint;
pub mod fragment;
pub mod ndr;
pub mod packet;
pub mod services;
pub mod transport;

#[cfg(test)]
mod tests;

use crate::error::Error;
use bitflags::bitflags;
use std::convert::TryFrom;
use uuid::Uuid;

/// DCE/RPC protocol version
pub const DCERPC_VERSION_MAJOR: u8 = 5;
pub const DCERPC_VERSION_MINOR: u8 = 0;

/// Size of the header shared by every connection-oriented PDU
pub const COMMON_HEADER_LENGTH: usize = 16;

/// Default fragment size offered by Windows clients
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// Smallest fragment size a peer may negotiate
pub const MIN_FRAG_SIZE: u16 = 1432;

/// DCE/RPC packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResp = 15,
    Auth3 = 16,
    Shutdown = 17,
    CancelRequest = 18,
    Orphaned = 19,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Request),
            2 => Ok(PacketType::Response),
            3 => Ok(PacketType::Fault),
            11 => Ok(PacketType::Bind),
            12 => Ok(PacketType::BindAck),
            13 => Ok(PacketType::BindNak),
            14 => Ok(PacketType::AlterContext),
            15 => Ok(PacketType::AlterContextResp),
            16 => Ok(PacketType::Auth3),
            17 => Ok(PacketType::Shutdown),
            18 => Ok(PacketType::CancelRequest),
            19 => Ok(PacketType::Orphaned),
            other => Err(Error::UnknownPacketType(other)),
        }
    }
}

bitflags! {
    /// DCE/RPC packet flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const FIRST_FRAG      = 0x01;
        const LAST_FRAG       = 0x02;
        const PENDING_CANCEL  = 0x04;
        const RESERVED        = 0x08;
        const CONC_MPX        = 0x10;
        const DID_NOT_EXECUTE = 0x20;
        const MAYBE           = 0x40;
        const OBJECT_UUID     = 0x80;
    }
}

impl PacketFlags {
    /// Flags of a PDU that is both first and last fragment
    pub fn complete() -> Self {
        PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG
    }

    pub fn is_first_frag(&self) -> bool {
        self.contains(PacketFlags::FIRST_FRAG)
    }

    pub fn is_last_frag(&self) -> bool {
        self.contains(PacketFlags::LAST_FRAG)
    }
}

/// Interface or transfer syntax identifier: a UUID plus a 32-bit version.
///
/// On the wire the version is the interface's major version in the low
/// 16 bits and the minor version in the high 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32,
}

impl SyntaxId {
    /// Wire length of a syntax id
    pub const LENGTH: usize = 20;

    /// The all-zero syntax carried by rejected results
    pub const NIL: SyntaxId = SyntaxId {
        uuid: Uuid::nil(),
        version: 0,
    };

    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major_version(&self) -> u16 {
        (self.version & 0xFFFF) as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    /// Whether this is the bind-time feature negotiation pseudo syntax.
    /// The trailing eight bytes of that UUID carry the feature bitmask.
    pub fn is_bind_time_feature_negotiation(&self) -> bool {
        self.uuid.as_bytes()[..8] == BIND_TIME_FEATURE_NEGOTIATION.uuid.as_bytes()[..8]
    }
}

/// NDR transfer syntax, version 1
pub const NDR_TRANSFER_SYNTAX_V1: SyntaxId = SyntaxId {
    uuid: Uuid::from_u128(0x8a885d04_1ceb_11c9_9fe8_08002b104860),
    version: 1,
};

/// NDR transfer syntax, version 2
pub const NDR_TRANSFER_SYNTAX_V2: SyntaxId = SyntaxId {
    uuid: Uuid::from_u128(0x8a885d04_1ceb_11c9_9fe8_08002b104860),
    version: 2,
};

/// Bind-time feature negotiation (MS-RPCE 3.3.1.5.3)
pub const BIND_TIME_FEATURE_NEGOTIATION: SyntaxId = SyntaxId {
    uuid: Uuid::from_u128(0x6cb71c2c_9812_4540_0300_000000000000),
    version: 1,
};

/// Transfer syntaxes every service accepts unless it says otherwise
pub const SUPPORTED_TRANSFER_SYNTAXES: [SyntaxId; 2] =
    [NDR_TRANSFER_SYNTAX_V2, NDR_TRANSFER_SYNTAX_V1];

/// Outcome of negotiating one presentation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NegotiationResult {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
    NegotiateAck = 3,
}

impl TryFrom<u16> for NegotiationResult {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(NegotiationResult::Acceptance),
            1 => Ok(NegotiationResult::UserRejection),
            2 => Ok(NegotiationResult::ProviderRejection),
            3 => Ok(NegotiationResult::NegotiateAck),
            other => Err(other),
        }
    }
}

/// Reason accompanying a non-accepted presentation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RejectionReason {
    NotSpecified = 0,
    AbstractSyntaxNotSupported = 1,
    ProposedTransferSyntaxesNotSupported = 2,
    LocalLimitExceeded = 3,
}

impl TryFrom<u16> for RejectionReason {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(RejectionReason::NotSpecified),
            1 => Ok(RejectionReason::AbstractSyntaxNotSupported),
            2 => Ok(RejectionReason::ProposedTransferSyntaxesNotSupported),
            3 => Ok(RejectionReason::LocalLimitExceeded),
            other => Err(other),
        }
    }
}

/// Reason carried by a bind_nak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BindNakReason {
    NotSpecified = 0,
    TemporaryCongestion = 1,
    LocalLimitExceeded = 2,
    ProtocolVersionNotSupported = 4,
}

/// Status codes carried by fault PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultStatus {
    /// nca_s_op_rng_error: operation number out of range
    OpRangeError = 0x1c01_0002,
    /// nca_s_unk_if: unknown interface or presentation context
    UnknownInterface = 0x1c01_0003,
    /// nca_s_proto_error
    ProtocolError = 0x1c01_000b,
    /// nca_s_fault_ndr: stub data could not be unmarshalled
    NdrFault = 0x0000_06f7,
}

impl FaultStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x1c01_0002 => Some(FaultStatus::OpRangeError),
            0x1c01_0003 => Some(FaultStatus::UnknownInterface),
            0x1c01_000b => Some(FaultStatus::ProtocolError),
            0x0000_06f7 => Some(FaultStatus::NdrFault),
            _ => None,
        }
    }
}

/// DCE/RPC interface definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcInterface {
    pub uuid: Uuid,
    pub version_major: u16,
    pub version_minor: u16,
    pub name: String,
}

impl RpcInterface {
    /// Abstract syntax a client binds with
    pub fn syntax_id(&self) -> SyntaxId {
        SyntaxId::new(self.uuid, self.version_major, self.version_minor)
    }
}

/// Well-known RPC interfaces served over SMB named pipes
pub mod interfaces {
    use super::*;
    use uuid::uuid;

    /// Server Service - for share enumeration and server info
    pub fn srvsvc() -> RpcInterface {
        RpcInterface {
            uuid: uuid!("4B324FC8-1670-01D3-1278-5A47BF6EE188"),
            version_major: 3,
            version_minor: 0,
            name: "SRVSVC".to_string(),
        }
    }

    /// Workstation Service - for workstation identity queries
    pub fn wkssvc() -> RpcInterface {
        RpcInterface {
            uuid: uuid!("6BFFD098-A112-3610-9833-46C3F87E345A"),
            version_major: 1,
            version_minor: 0,
            name: "WKSSVC".to_string(),
        }
    }
}
