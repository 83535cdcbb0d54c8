//! Workstation Service (WKSSVC) RPC implementation

use crate::dcerpc::ndr::{
    NdrDecode, NdrDecoder, NdrEncode, NdrEncoder, NdrMessage, NdrPtr, NdrString, ReferentArena,
};
use crate::dcerpc::services::srvsvc::PlatformId;
use crate::dcerpc::services::{decode_unknown_arm, HostIdentity, OperationTable, RpcService};
use crate::dcerpc::{interfaces, RpcInterface};
use crate::error::{Result, WError};
use std::sync::Arc;
use tracing::debug;

/// WKSSVC operation numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WksSvcOpnum {
    NetrWkstaGetInfo = 0,
}

/// WKSTA_INFO_100
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WkstaInfo100 {
    pub platform_id: u32,
    pub computer_name: NdrPtr<NdrString>,
    pub lan_group: NdrPtr<NdrString>,
    pub version_major: u32,
    pub version_minor: u32,
}

impl NdrEncode for WkstaInfo100 {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.platform_id)?;
        self.computer_name.encode(encoder)?;
        self.lan_group.encode(encoder)?;
        encoder.encode_u32(self.version_major)?;
        encoder.encode_u32(self.version_minor)
    }
}

impl NdrDecode for WkstaInfo100 {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            platform_id: decoder.decode_u32()?,
            computer_name: decoder.decode_pointer()?,
            lan_group: decoder.decode_pointer()?,
            version_major: decoder.decode_u32()?,
            version_minor: decoder.decode_u32()?,
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        self.computer_name.bind(arena)?;
        self.lan_group.bind(arena)
    }
}

/// WKSTA_INFO_101: level 100 plus the LAN root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WkstaInfo101 {
    pub platform_id: u32,
    pub computer_name: NdrPtr<NdrString>,
    pub lan_group: NdrPtr<NdrString>,
    pub version_major: u32,
    pub version_minor: u32,
    pub lan_root: NdrPtr<NdrString>,
}

impl NdrEncode for WkstaInfo101 {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.platform_id)?;
        self.computer_name.encode(encoder)?;
        self.lan_group.encode(encoder)?;
        encoder.encode_u32(self.version_major)?;
        encoder.encode_u32(self.version_minor)?;
        self.lan_root.encode(encoder)
    }
}

impl NdrDecode for WkstaInfo101 {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(Self {
            platform_id: decoder.decode_u32()?,
            computer_name: decoder.decode_pointer()?,
            lan_group: decoder.decode_pointer()?,
            version_major: decoder.decode_u32()?,
            version_minor: decoder.decode_u32()?,
            lan_root: decoder.decode_pointer()?,
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        self.computer_name.bind(arena)?;
        self.lan_group.bind(arena)?;
        self.lan_root.bind(arena)
    }
}

/// LPWKSTA_INFO union, keyed by info level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WkstaInfo {
    Level100(NdrPtr<WkstaInfo100>),
    Level101(NdrPtr<WkstaInfo101>),
    Unknown(u32),
}

impl WkstaInfo {
    pub fn level(&self) -> u32 {
        match self {
            WkstaInfo::Level100(_) => 100,
            WkstaInfo::Level101(_) => 101,
            WkstaInfo::Unknown(level) => *level,
        }
    }

    /// Computer name carried by either level
    pub fn computer_name(&self) -> Option<&str> {
        match self {
            WkstaInfo::Level100(info) => info.get().and_then(|i| i.computer_name.as_str()),
            WkstaInfo::Level101(info) => info.get().and_then(|i| i.computer_name.as_str()),
            WkstaInfo::Unknown(_) => None,
        }
    }

    /// Domain or workgroup carried by either level
    pub fn lan_group(&self) -> Option<&str> {
        match self {
            WkstaInfo::Level100(info) => info.get().and_then(|i| i.lan_group.as_str()),
            WkstaInfo::Level101(info) => info.get().and_then(|i| i.lan_group.as_str()),
            WkstaInfo::Unknown(_) => None,
        }
    }
}

impl NdrEncode for WkstaInfo {
    fn encode<'a>(&'a self, encoder: &mut NdrEncoder<'a>) -> Result<()> {
        encoder.encode_u32(self.level())?;
        match self {
            WkstaInfo::Level100(info) => info.encode(encoder),
            WkstaInfo::Level101(info) => info.encode(encoder),
            WkstaInfo::Unknown(_) => encoder.encode_u32(0),
        }
    }
}

impl NdrDecode for WkstaInfo {
    fn decode(decoder: &mut NdrDecoder<'_>) -> Result<Self> {
        Ok(match decoder.decode_u32()? {
            100 => WkstaInfo::Level100(decoder.decode_pointer()?),
            101 => WkstaInfo::Level101(decoder.decode_pointer()?),
            other => WkstaInfo::Unknown(decode_unknown_arm(decoder, other)?),
        })
    }

    fn bind_referents(&mut self, arena: &mut ReferentArena) -> Result<()> {
        match self {
            WkstaInfo::Level100(info) => info.bind(arena),
            WkstaInfo::Level101(info) => info.bind(arena),
            WkstaInfo::Unknown(_) => Ok(()),
        }
    }
}

/// NetrWkstaGetInfo [in] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrWkstaGetInfoRequest {
    pub server_name: Option<NdrString>,
    pub level: u32,
}

impl NetrWkstaGetInfoRequest {
    pub fn new(server_name: &str, level: u32) -> Self {
        Self {
            server_name: Some(NdrString::new(server_name)),
            level,
        }
    }
}

impl NdrMessage for NetrWkstaGetInfoRequest {
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

/// NetrWkstaGetInfo [out] parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrWkstaGetInfoResponse {
    pub info: WkstaInfo,
    pub status: u32,
}

impl NdrMessage for NetrWkstaGetInfoResponse {
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

fn wksta_get_info(identity: &HostIdentity, level: u32) -> NetrWkstaGetInfoResponse {
    let computer_name = NdrPtr::new(NdrString::new(identity.server_name.clone()));
    let lan_group = NdrPtr::new(NdrString::new(identity.domain.clone()));
    let info = match level {
        100 => WkstaInfo::Level100(NdrPtr::new(WkstaInfo100 {
            platform_id: PlatformId::NT as u32,
            computer_name,
            lan_group,
            version_major: identity.version_major,
            version_minor: identity.version_minor,
        })),
        101 => WkstaInfo::Level101(NdrPtr::new(WkstaInfo101 {
            platform_id: PlatformId::NT as u32,
            computer_name,
            lan_group,
            version_major: identity.version_major,
            version_minor: identity.version_minor,
            lan_root: NdrPtr::null(),
        })),
        other => {
            return NetrWkstaGetInfoResponse {
                info: WkstaInfo::Unknown(other),
                status: WError::InvalidLevel as u32,
            }
        }
    };
    NetrWkstaGetInfoResponse {
        info,
        status: WError::Success as u32,
    }
}

/// WKSSVC service implementation
pub struct WksSvcService {
    interface: RpcInterface,
    operations: OperationTable,
}

impl WksSvcService {
    pub fn new(identity: HostIdentity) -> Self {
        let identity = Arc::new(identity);
        let mut operations = OperationTable::new();

        operations.register(WksSvcOpnum::NetrWkstaGetInfo as u16, move |input| {
            let request = NetrWkstaGetInfoRequest::from_bytes(input)?;
            debug!("WKSSVC: NetrWkstaGetInfo level {}", request.level);
            wksta_get_info(&identity, request.level).to_bytes()
        });

        Self {
            interface: interfaces::wkssvc(),
            operations,
        }
    }
}

impl RpcService for WksSvcService {
    fn interface(&self) -> &RpcInterface {
        &self.interface
    }

    fn pipe_name(&self) -> &str {
        "wkssvc"
    }

    fn operations(&self) -> &OperationTable {
        &self.operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_info(level: u32) -> NetrWkstaGetInfoResponse {
        let service = WksSvcService::new(HostIdentity {
            server_name: "WKS01".to_string(),
            domain: "CORP".to_string(),
            ..HostIdentity::default()
        });
        let handler = service.operations().get(0).unwrap();
        let stub = NetrWkstaGetInfoRequest::new("\\\\WKS01", level)
            .to_bytes()
            .unwrap();
        NetrWkstaGetInfoResponse::from_bytes(&handler(&stub).unwrap()).unwrap()
    }

    #[test]
    fn test_wksta_info_100() {
        let response = get_info(100);
        assert_eq!(response.status, 0);
        assert_eq!(response.info.level(), 100);
        assert_eq!(response.info.computer_name(), Some("WKS01"));
        assert_eq!(response.info.lan_group(), Some("CORP"));
    }

    #[test]
    fn test_wksta_info_101_has_null_lan_root() {
        let response = get_info(101);
        match response.info {
            WkstaInfo::Level101(info) => {
                let info = info.into_option().unwrap();
                assert!(info.lan_root.is_null());
                assert_eq!(info.platform_id, 500);
                assert_eq!(info.version_major, 10);
            }
            other => panic!("expected level 101, got {:?}", other),
        }
    }

    #[test]
    fn test_wksta_info_invalid_level() {
        let response = get_info(102);
        assert_eq!(response.status, WError::InvalidLevel as u32);
        assert_eq!(response.info, WkstaInfo::Unknown(102));
    }

    #[test]
    fn test_wksta_info_layout() {
        let response = wksta_get_info(&HostIdentity::default(), 100);
        let bytes = response.to_bytes().unwrap();
        // level, pointer, then the structure with two string pointers
        assert_eq!(&bytes[0..4], &100u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &500u32.to_le_bytes());
        assert_eq!(&bytes[bytes.len() - 4..], &0u32.to_le_bytes());
    }
}
