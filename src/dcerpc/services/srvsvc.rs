//! Server Service (SRVSVC) RPC implementation
//! Provides share enumeration, share lookup and server info

use crate::dcerpc::ndr::{
    NdrDecode, NdrDecoder, NdrEncode, NdrEncoder, NdrMessage, NdrPtr, NdrString, ReferentArena,
};
use crate::dcerpc::services::{decode_unknown_arm, HostIdentity, OperationTable, RpcService};
use crate::dcerpc::{interfaces, RpcInterface};
use crate::error::{Result, WError};
use std::sync::Arc;
use tracing::debug;

/// SRVSVC operation numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SrvSvcOpnum {
    NetrShareEnum = 15,
    NetrShareGetInfo = 16,
    NetrServerGetInfo = 21,
}

/// Share type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ShareType {
    DiskTree = 0,
    PrintQueue = 1,
    Device = 2,
    Ipc = 3,
}

/// STYPE_SPECIAL: administrative share bit
pub const STYPE_SPECIAL: u32 = 0x8000_0000;

/// Server platform ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PlatformId {
    DOS = 300,
    OS2 = 400,
    NT = 500,
    OSF = 600,
    VMS = 700,
}

/// SV_TYPE_WORKSTATION | SV_TYPE_SERVER | SV_TYPE_NT
pub const DEFAULT_SERVER_TYPE: u32 = 0x0000_1003;

/// A share published by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareEntry {
    pub name: String,
    pub share_type: ShareType,
    pub special: bool,
    pub comment: String,
    pub path: String,
}

impl ShareEntry {
    /// A disk share
    pub fn disk(name: impl Into<String>, path: impl Into<String>, comment: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            special: name.ends_with('$'),
            name,
            share_type: ShareType::DiskTree,
            comment: comment.into(),
            path: path.into(),
        }
    }

    /// The IPC$ share every server carries
    pub fn ipc() -> Self {
        Self {
            name: "IPC$".to_string(),
            share_type: ShareType::Ipc,
            special: true,
            comment: "Remote IPC".to_string(),
            path: String::new(),
        }
    }

    /// Share type as sent on the wire
    pub fn type_bits(&self) -> u32 {
        let bits = self.share_type as u32;
        if self.special {
            bits | STYPE_SPECIAL
        } else {
            bits
        }
    }

    fn info0(&self) -> ShareInfo0 {
        ShareInfo0 {
            netname: NdrPtr::new(NdrString::new(self.name.clone())),
        }
    }

    fn info1(&self) -> ShareInfo1 {
        ShareInfo1 {
            netname: NdrPtr::new(NdrString::new(self.name.clone())),
            share_type: self.type_bits(),
            remark: NdrPtr::new(NdrString::new(self.comment.clone())),
        }
    }
}

/// SHARE_INFO_0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo0 {
    pub netname: NdrPtr<NdrString>,
}

impl NdrEncode for ShareInfo0 {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        self.netname.encode(encoder)
    }
}

impl NdrDecode for ShareInfo0 {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            netname: decoder.decode_pointer()?,
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        self.netname.bind(arena)
    }
}

/// SHARE_INFO_1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo1 {
    pub netname: NdrPtr<NdrString>,
    pub share_type: u32,
    pub remark: NdrPtr<NdrString>,
}

impl NdrEncode for ShareInfo1 {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        self.netname.encode(encoder)?;
        encoder.encode_u32(self.share_type)?;
        self.remark.encode(encoder)
    }
}

impl NdrDecode for ShareInfo1 {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            netname: decoder.decode_pointer()?,
            share_type: decoder.decode_u32()?,
            remark: decoder.decode_pointer()?,
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        self.netname.bind(arena)?;
        self.remark.bind(arena)
    }
}

/// SHARE_INFO_x_CONTAINER: entry count plus a pointer to the entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfoContainer<T> {
    pub entries_read: u32,
    pub buffer: NdrPtr<Vec<T>>,
}

impl<T> ShareInfoContainer<T> {
    pub fn new(entries: Vec<T>) -> Self {
        Self {
            entries_read: entries.len() as u32,
            buffer: NdrPtr::new(entries),
        }
    }

    /// The container a client sends: no entries and a null buffer
    pub fn empty() -> Self {
        Self {
            entries_read: 0,
            buffer: NdrPtr::null(),
        }
    }

    pub fn entries(&self) -> &[T] {
        self.buffer.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

impl<T: NdrEncode> NdrEncode for ShareInfoContainer<T> {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.entries_read)?;
        self.buffer.encode(encoder)
    }
}

impl<T: NdrDecode> NdrDecode for ShareInfoContainer<T> {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            entries_read: decoder.decode_u32()?,
            buffer: decoder.decode_pointer()?,
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        self.buffer.bind(arena)
    }
}

/// SHARE_ENUM_UNION, keyed by info level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEnumUnion {
    Level0(NdrPtr<ShareInfoContainer<ShareInfo0>>),
    Level1(NdrPtr<ShareInfoContainer<ShareInfo1>>),
    /// A level without a known layout; its arm is never followed
    Unknown(u32),
}

/// SHARE_ENUM_STRUCT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareEnumStruct {
    pub info: ShareEnumUnion,
}

impl ShareEnumStruct {
    /// The request form for `level`, carrying an empty container
    pub fn request(level: u32) -> Self {
        let info = match level {
            0 => ShareEnumUnion::Level0(NdrPtr::new(ShareInfoContainer::empty())),
            1 => ShareEnumUnion::Level1(NdrPtr::new(ShareInfoContainer::empty())),
            other => ShareEnumUnion::Unknown(other),
        };
        Self { info }
    }

    pub fn level(&self) -> u32 {
        match &self.info {
            ShareEnumUnion::Level0(_) => 0,
            ShareEnumUnion::Level1(_) => 1,
            ShareEnumUnion::Unknown(level) => *level,
        }
    }
}

impl NdrEncode for ShareEnumStruct {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        let level = self.level();
        encoder.encode_u32(level)?; // Level
        encoder.encode_u32(level)?; // Union switch
        match &self.info {
            ShareEnumUnion::Level0(container) => container.encode(encoder),
            ShareEnumUnion::Level1(container) => container.encode(encoder),
            ShareEnumUnion::Unknown(_) => encoder.encode_u32(0),
        }
    }
}

impl NdrDecode for ShareEnumStruct {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        let _level = decoder.decode_u32()?;
        let switch = decoder.decode_u32()?;
        let info = match switch {
            0 => ShareEnumUnion::Level0(decoder.decode_pointer()?),
            1 => ShareEnumUnion::Level1(decoder.decode_pointer()?),
            other => {
                // The container layout is unknown, so only its id can be read
                decoder.decode_u32()?;
                ShareEnumUnion::Unknown(other)
            }
        };
        Ok(Self { info })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        match &mut self.info {
            ShareEnumUnion::Level0(container) => container.bind(arena),
            ShareEnumUnion::Level1(container) => container.bind(arena),
            ShareEnumUnion::Unknown(_) => Ok(()),
        }
    }
}

/// LPSHARE_INFO union returned by NetrShareGetInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareInfo {
    Level0(NdrPtr<ShareInfo0>),
    Level1(NdrPtr<ShareInfo1>),
    Unknown(u32),
}

impl ShareInfo {
    pub fn level(&self) -> u32 {
        match self {
            ShareInfo::Level0(_) => 0,
            ShareInfo::Level1(_) => 1,
            ShareInfo::Unknown(level) => *level,
        }
    }

    /// The union for `level` with a null arm
    fn empty(level: u32) -> Self {
        match level {
            0 => ShareInfo::Level0(NdrPtr::null()),
            1 => ShareInfo::Level1(NdrPtr::null()),
            other => ShareInfo::Unknown(other),
        }
    }
}

impl NdrEncode for ShareInfo {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.level())?;
        match self {
            ShareInfo::Level0(info) => info.encode(encoder),
            ShareInfo::Level1(info) => info.encode(encoder),
            ShareInfo::Unknown(_) => encoder.encode_u32(0),
        }
    }
}

impl NdrDecode for ShareInfo {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(match decoder.decode_u32()? {
            0 => ShareInfo::Level0(decoder.decode_pointer()?),
            1 => ShareInfo::Level1(decoder.decode_pointer()?),
            other => ShareInfo::Unknown(decode_unknown_arm(decoder, other)?),
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        match self {
            ShareInfo::Level0(info) => info.bind(arena),
            ShareInfo::Level1(info) => info.bind(arena),
            ShareInfo::Unknown(_) => Ok(()),
        }
    }
}

/// SERVER_INFO_100
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo100 {
    pub platform_id: u32,
    pub name: NdrPtr<NdrString>,
}

impl NdrEncode for ServerInfo100 {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.platform_id)?;
        self.name.encode(encoder)
    }
}

impl NdrDecode for ServerInfo100 {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            platform_id: decoder.decode_u32()?,
            name: decoder.decode_pointer()?,
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        self.name.bind(arena)
    }
}

/// SERVER_INFO_101
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo101 {
    pub platform_id: u32,
    pub name: NdrPtr<NdrString>,
    pub version_major: u32,
    pub version_minor: u32,
    pub server_type: u32,
    pub comment: NdrPtr<NdrString>,
}

impl NdrEncode for ServerInfo101 {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.platform_id)?;
        self.name.encode(encoder)?;
        encoder.encode_u32(self.version_major)?;
        encoder.encode_u32(self.version_minor)?;
        encoder.encode_u32(self.server_type)?;
        self.comment.encode(encoder)
    }
}

impl NdrDecode for ServerInfo101 {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            platform_id: decoder.decode_u32()?,
            name: decoder.decode_pointer()?,
            version_major: decoder.decode_u32()?,
            version_minor: decoder.decode_u32()?,
            server_type: decoder.decode_u32()?,
            comment: decoder.decode_pointer()?,
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        self.name.bind(arena)?;
        self.comment.bind(arena)
    }
}

/// LPSERVER_INFO union returned by NetrServerGetInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInfo {
    Level100(NdrPtr<ServerInfo100>),
    Level101(NdrPtr<ServerInfo101>),
    Unknown(u32),
}

impl ServerInfo {
    pub fn level(&self) -> u32 {
        match self {
            ServerInfo::Level100(_) => 100,
            ServerInfo::Level101(_) => 101,
            ServerInfo::Unknown(level) => *level,
        }
    }
}

impl NdrEncode for ServerInfo {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.level())?;
        match self {
            ServerInfo::Level100(info) => info.encode(encoder),
            ServerInfo::Level101(info) => info.encode(encoder),
            ServerInfo::Unknown(_) => encoder.encode_u32(0),
        }
    }
}

impl NdrDecode for ServerInfo {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(match decoder.decode_u32()? {
            100 => ServerInfo::Level100(decoder.decode_pointer()?),
            101 => ServerInfo::Level101(decoder.decode_pointer()?),
            other => ServerInfo::Unknown(decode_unknown_arm(decoder, other)?),
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        match self {
            ServerInfo::Level100(info) => info.bind(arena),
            ServerInfo::Level101(info) => info.bind(arena),
            ServerInfo::Unknown(_) => Ok(()),
        }
    }
}

/// NetrShareEnum [in] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrShareEnumRequest {
    pub server_name: Option<NdrString>,
    pub info_struct: ShareEnumStruct,
    pub prefered_maximum_length: u32,
    pub resume_handle: Option<u32>,
}

impl NetrShareEnumRequest {
    pub fn new(server_name: &str, level: u32) -> Self {
        Self {
            server_name: Some(NdrString::new(server_name)),
            info_struct: ShareEnumStruct::request(level),
            prefered_maximum_length: u32::MAX,
            resume_handle: Some(0),
        }
    }
}

impl NdrMessage for NetrShareEnumRequest {
    fn encode_params<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_unique_pointer(self.server_name.as_ref())?;
        encoder.encode_top_level(&self.info_struct)?;
        encoder.encode_u32(self.prefered_maximum_length)?;
        encoder.encode_unique_pointer(self.resume_handle.as_ref())
    }

    fn decode_params(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        let server_name = decoder.decode_unique_pointer()?;
        let info_struct: ShareEnumStruct = decoder.decode_top_level()?;
        if let ShareEnumUnion::Unknown(_) = info_struct.info {
            // The rest of the stub follows a container of unknown size
            return Ok(Self {
                server_name,
                info_struct,
                prefered_maximum_length: 0,
                resume_handle: None,
            });
        }
        Ok(Self {
            server_name,
            info_struct,
            prefered_maximum_length: decoder.decode_u32()?,
            resume_handle: decoder.decode_unique_pointer()?,
        })
    }
}

/// NetrShareEnum [out] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrShareEnumResponse {
    pub info_struct: ShareEnumStruct,
    pub total_entries: u32,
    pub resume_handle: Option<u32>,
    pub status: u32,
}

impl NetrShareEnumResponse {
    /// Share names in the returned container
    pub fn share_names(&self) -> Vec<String> {
        match &self.info_struct.info {
            ShareEnumUnion::Level0(container) => container
                .get()
                .map(|c| {
                    c.entries()
                        .iter()
                        .filter_map(|e| e.netname.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            ShareEnumUnion::Level1(container) => container
                .get()
                .map(|c| {
                    c.entries()
                        .iter()
                        .filter_map(|e| e.netname.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            ShareEnumUnion::Unknown(_) => Vec::new(),
        }
    }
}

impl NdrMessage for NetrShareEnumResponse {
    fn encode_params<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_top_level(&self.info_struct)?;
        encoder.encode_u32(self.total_entries)?;
        encoder.encode_unique_pointer(self.resume_handle.as_ref())?;
        encoder.encode_u32(self.status)
    }

    fn decode_params(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            info_struct: decoder.decode_top_level()?,
            total_entries: decoder.decode_u32()?,
            resume_handle: decoder.decode_unique_pointer()?,
            status: decoder.decode_u32()?,
        })
    }
}

/// NetrShareGetInfo [in] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrShareGetInfoRequest {
    pub server_name: Option<NdrString>,
    pub net_name: NdrString,
    pub level: u32,
}

impl NetrShareGetInfoRequest {
    pub fn new(server_name: &str, net_name: &str, level: u32) -> Self {
        Self {
            server_name: Some(NdrString::new(server_name)),
            net_name: NdrString::new(net_name),
            level,
        }
    }
}

impl NdrMessage for NetrShareGetInfoRequest {
    fn encode_params<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_unique_pointer(self.server_name.as_ref())?;
        encoder.encode_top_level(&self.net_name)?;
        encoder.encode_u32(self.level)
    }

    fn decode_params(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            server_name: decoder.decode_unique_pointer()?,
            net_name: decoder.decode_top_level()?,
            level: decoder.decode_u32()?,
        })
    }
}

/// NetrShareGetInfo [out] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrShareGetInfoResponse {
    pub info: ShareInfo,
    pub status: u32,
}

impl NdrMessage for NetrShareGetInfoResponse {
    fn encode_params<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_top_level(&self.info)?;
        encoder.encode_u32(self.status)
    }

    fn decode_params(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            info: decoder.decode_top_level()?,
            status: decoder.decode_u32()?,
        })
    }
}

/// NetrServerGetInfo [in] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrServerGetInfoRequest {
    pub server_name: Option<NdrString>,
    pub level: u32,
}

impl NetrServerGetInfoRequest {
    pub fn new(server_name: &str, level: u32) -> Self {
        Self {
            server_name: Some(NdrString::new(server_name)),
            level,
        }
    }
}

impl NdrMessage for NetrServerGetInfoRequest {
    fn encode_params<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_unique_pointer(self.server_name.as_ref())?;
        encoder.encode_u32(self.level)
    }

    fn decode_params(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            server_name: decoder.decode_unique_pointer()?,
            level: decoder.decode_u32()?,
        })
    }
}

/// NetrServerGetInfo [out] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrServerGetInfoResponse {
    pub info: ServerInfo,
    pub status: u32,
}

impl NdrMessage for NetrServerGetInfoResponse {
    fn encode_params<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_top_level(&self.info)?;
        encoder.encode_u32(self.status)
    }

    fn decode_params(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            info: decoder.decode_top_level()?,
            status: decoder.decode_u32()?,
        })
    }
}

/// State the SRVSVC handlers answer from
#[derive(Debug)]
struct SrvSvcState {
    identity: HostIdentity,
    shares: Vec<ShareEntry>,
}

impl SrvSvcState {
    fn find_share(&self, name: &str) -> Option<&ShareEntry> {
        self.shares
            .iter()
            .find(|share| share.name.eq_ignore_ascii_case(name))
    }

    fn share_enum(&self, request: &NetrShareEnumRequest) -> NetrShareEnumResponse {
        let start = request.resume_handle.unwrap_or(0) as usize;
        let selected = self.shares.iter().skip(start);

        let info = match request.info_struct.info {
            ShareEnumUnion::Level0(_) => ShareEnumUnion::Level0(NdrPtr::new(
                ShareInfoContainer::new(selected.map(ShareEntry::info0).collect()),
            )),
            ShareEnumUnion::Level1(_) => ShareEnumUnion::Level1(NdrPtr::new(
                ShareInfoContainer::new(selected.map(ShareEntry::info1).collect()),
            )),
            ShareEnumUnion::Unknown(level) => {
                debug!("NetrShareEnum: unsupported level {}", level);
                return NetrShareEnumResponse {
                    info_struct: ShareEnumStruct {
                        info: ShareEnumUnion::Unknown(level),
                    },
                    total_entries: 0,
                    resume_handle: None,
                    status: WError::InvalidLevel as u32,
                };
            }
        };

        NetrShareEnumResponse {
            info_struct: ShareEnumStruct { info },
            total_entries: self.shares.len() as u32,
            // Everything past the resume point is returned at once
            resume_handle: request.resume_handle.map(|_| 0),
            status: WError::Success as u32,
        }
    }

    fn share_get_info(&self, request: &NetrShareGetInfoRequest) -> NetrShareGetInfoResponse {
        if request.level > 1 {
            return NetrShareGetInfoResponse {
                info: ShareInfo::Unknown(request.level),
                status: WError::InvalidLevel as u32,
            };
        }

        let share = match self.find_share(&request.net_name.value) {
            Some(share) => share,
            None => {
                debug!("NetrShareGetInfo: no share named {}", request.net_name.value);
                return NetrShareGetInfoResponse {
                    info: ShareInfo::empty(request.level),
                    status: WError::NetNameNotFound as u32,
                };
            }
        };

        let info = if request.level == 0 {
            ShareInfo::Level0(NdrPtr::new(share.info0()))
        } else {
            ShareInfo::Level1(NdrPtr::new(share.info1()))
        };
        NetrShareGetInfoResponse {
            info,
            status: WError::Success as u32,
        }
    }

    fn server_get_info(&self, request: &NetrServerGetInfoRequest) -> NetrServerGetInfoResponse {
        let name = NdrPtr::new(NdrString::new(self.identity.server_name.clone()));
        let info = match request.level {
            100 => ServerInfo::Level100(NdrPtr::new(ServerInfo100 {
                platform_id: PlatformId::NT as u32,
                name,
            })),
            101 => ServerInfo::Level101(NdrPtr::new(ServerInfo101 {
                platform_id: PlatformId::NT as u32,
                name,
                version_major: self.identity.version_major,
                version_minor: self.identity.version_minor,
                server_type: DEFAULT_SERVER_TYPE,
                comment: NdrPtr::new(NdrString::new(self.identity.comment.clone())),
            })),
            other => {
                return NetrServerGetInfoResponse {
                    info: ServerInfo::Unknown(other),
                    status: WError::InvalidLevel as u32,
                }
            }
        };
        NetrServerGetInfoResponse {
            info,
            status: WError::Success as u32,
        }
    }
}

/// SRVSVC service implementation
pub struct SrvSvcService {
    interface: RpcInterface,
    operations: OperationTable,
    state: Arc<SrvSvcState>,
}

impl SrvSvcService {
    /// Create the service. IPC$ is always published first, followed by
    /// `shares` in order.
    pub fn new(identity: HostIdentity, shares: Vec<ShareEntry>) -> Self {
        let mut all_shares = vec![ShareEntry::ipc()];
        all_shares.extend(
            shares
                .into_iter()
                .filter(|share| !share.name.eq_ignore_ascii_case("IPC$")),
        );
        let state = Arc::new(SrvSvcState {
            identity,
            shares: all_shares,
        });

        let mut operations = OperationTable::new();

        let share_enum_state = Arc::clone(&state);
        operations.register(SrvSvcOpnum::NetrShareEnum as u16, move |input| {
            let request = NetrShareEnumRequest::from_bytes(input)?;
            debug!(
                "SRVSVC: NetrShareEnum level {}",
                request.info_struct.level()
            );
            share_enum_state.share_enum(&request).to_bytes()
        });

        let share_info_state = Arc::clone(&state);
        operations.register(SrvSvcOpnum::NetrShareGetInfo as u16, move |input| {
            let request = NetrShareGetInfoRequest::from_bytes(input)?;
            debug!(
                "SRVSVC: NetrShareGetInfo {} level {}",
                request.net_name.value, request.level
            );
            share_info_state.share_get_info(&request).to_bytes()
        });

        let server_info_state = Arc::clone(&state);
        operations.register(SrvSvcOpnum::NetrServerGetInfo as u16, move |input| {
            let request = NetrServerGetInfoRequest::from_bytes(input)?;
            debug!("SRVSVC: NetrServerGetInfo level {}", request.level);
            server_info_state.server_get_info(&request).to_bytes()
        });

        Self {
            interface: interfaces::srvsvc(),
            operations,
            state,
        }
    }

    /// Published shares, IPC$ first
    pub fn shares(&self) -> &[ShareEntry] {
        &self.state.shares
    }
}

impl RpcService for SrvSvcService {
    fn interface(&self) -> &RpcInterface {
        &self.interface
    }

    fn pipe_name(&self) -> &str {
        "srvsvc"
    }

    fn operations(&self) -> &OperationTable {
        &self.operations
    }
}
