//! OpenFlow header, protocol versions and message types.
//!
//! Every OpenFlow message starts with the same 8-byte header:
//!
//! ```text
//! ┌─────────┬─────────┬───────────────────┬───────────────────────────────┐
//! │ version │  type   │      length       │              xid              │
//! │  (u8)   │  (u8)   │   (u16, BE, ≥ 8)  │           (u32, BE)           │
//! └─────────┴─────────┴───────────────────┴───────────────────────────────┘
//! ```
//!
//! Type codes differ between 1.0 and 1.3, so [`MessageType`] is version
//! neutral and mapped to and from the wire per version.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::{OfError, Result};

/// Header size in bytes
pub const OFP_HEADER_LEN: usize = 8;

/// Largest message the 16-bit length field can describe
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Supported OpenFlow protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OfVersion {
    /// OpenFlow 1.0 (wire 0x01)
    Of10,
    /// OpenFlow 1.3 (wire 0x04)
    Of13,
}

impl OfVersion {
    /// Wire value of this version.
    pub const fn wire(self) -> u8 {
        match self {
            OfVersion::Of10 => 0x01,
            OfVersion::Of13 => 0x04,
        }
    }

    /// Exact wire match.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(OfVersion::Of10),
            0x04 => Some(OfVersion::Of13),
            _ => None,
        }
    }

    /// Pick the version to speak given a device's HELLO.
    ///
    /// A version bitmap, when present, wins over the header version.
    pub fn negotiate(hello_version: u8, bitmap: Option<u32>) -> Option<Self> {
        if let Some(bitmap) = bitmap {
            if bitmap & (1 << 4) != 0 {
                return Some(OfVersion::Of13);
            }
            if bitmap & (1 << 1) != 0 {
                return Some(OfVersion::Of10);
            }
            return None;
        }
        if hello_version >= OfVersion::Of13.wire() {
            Some(OfVersion::Of13)
        } else if hello_version >= OfVersion::Of10.wire() {
            Some(OfVersion::Of10)
        } else {
            None
        }
    }

    /// Body layouts for wire versions in between follow the 1.0 structures.
    pub(crate) fn layout_for(wire: u8) -> Self {
        if wire >= OfVersion::Of13.wire() {
            OfVersion::Of13
        } else {
            OfVersion::Of10
        }
    }
}

impl fmt::Display for OfVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfVersion::Of10 => write!(f, "OF1.0"),
            OfVersion::Of13 => write!(f, "OF1.3"),
        }
    }
}

/// Version neutral OpenFlow message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// OFPT_HELLO
    Hello,
    /// OFPT_ERROR
    Error,
    /// OFPT_ECHO_REQUEST
    EchoRequest,
    /// OFPT_ECHO_REPLY
    EchoReply,
    /// OFPT_EXPERIMENTER (OFPT_VENDOR in 1.0)
    Experimenter,
    /// OFPT_FEATURES_REQUEST
    FeaturesRequest,
    /// OFPT_FEATURES_REPLY
    FeaturesReply,
    /// OFPT_GET_CONFIG_REQUEST
    GetConfigRequest,
    /// OFPT_GET_CONFIG_REPLY
    GetConfigReply,
    /// OFPT_SET_CONFIG
    SetConfig,
    /// OFPT_PACKET_IN
    PacketIn,
    /// OFPT_FLOW_REMOVED
    FlowRemoved,
    /// OFPT_PORT_STATUS
    PortStatus,
    /// OFPT_PACKET_OUT
    PacketOut,
    /// OFPT_FLOW_MOD
    FlowMod,
    /// OFPT_GROUP_MOD (1.3)
    GroupMod,
    /// OFPT_PORT_MOD
    PortMod,
    /// OFPT_TABLE_MOD (1.3)
    TableMod,
    /// OFPT_STATS_REQUEST / OFPT_MULTIPART_REQUEST
    StatsRequest,
    /// OFPT_STATS_REPLY / OFPT_MULTIPART_REPLY
    StatsReply,
    /// OFPT_BARRIER_REQUEST
    BarrierRequest,
    /// OFPT_BARRIER_REPLY
    BarrierReply,
    /// OFPT_QUEUE_GET_CONFIG_REQUEST
    QueueGetConfigRequest,
    /// OFPT_QUEUE_GET_CONFIG_REPLY
    QueueGetConfigReply,
    /// OFPT_ROLE_REQUEST (1.3)
    RoleRequest,
    /// OFPT_ROLE_REPLY (1.3)
    RoleReply,
    /// OFPT_GET_ASYNC_REQUEST (1.3)
    GetAsyncRequest,
    /// OFPT_GET_ASYNC_REPLY (1.3)
    GetAsyncReply,
    /// OFPT_SET_ASYNC (1.3)
    SetAsync,
    /// OFPT_METER_MOD (1.3)
    MeterMod,
}

const OF10_TYPES: [MessageType; 22] = [
    MessageType::Hello,
    MessageType::Error,
    MessageType::EchoRequest,
    MessageType::EchoReply,
    MessageType::Experimenter,
    MessageType::FeaturesRequest,
    MessageType::FeaturesReply,
    MessageType::GetConfigRequest,
    MessageType::GetConfigReply,
    MessageType::SetConfig,
    MessageType::PacketIn,
    MessageType::FlowRemoved,
    MessageType::PortStatus,
    MessageType::PacketOut,
    MessageType::FlowMod,
    MessageType::PortMod,
    MessageType::StatsRequest,
    MessageType::StatsReply,
    MessageType::BarrierRequest,
    MessageType::BarrierReply,
    MessageType::QueueGetConfigRequest,
    MessageType::QueueGetConfigReply,
];

const OF13_TYPES: [MessageType; 30] = [
    MessageType::Hello,
    MessageType::Error,
    MessageType::EchoRequest,
    MessageType::EchoReply,
    MessageType::Experimenter,
    MessageType::FeaturesRequest,
    MessageType::FeaturesReply,
    MessageType::GetConfigRequest,
    MessageType::GetConfigReply,
    MessageType::SetConfig,
    MessageType::PacketIn,
    MessageType::FlowRemoved,
    MessageType::PortStatus,
    MessageType::PacketOut,
    MessageType::FlowMod,
    MessageType::GroupMod,
    MessageType::PortMod,
    MessageType::TableMod,
    MessageType::StatsRequest,
    MessageType::StatsReply,
    MessageType::BarrierRequest,
    MessageType::BarrierReply,
    MessageType::QueueGetConfigRequest,
    MessageType::QueueGetConfigReply,
    MessageType::RoleRequest,
    MessageType::RoleReply,
    MessageType::GetAsyncRequest,
    MessageType::GetAsyncReply,
    MessageType::SetAsync,
    MessageType::MeterMod,
];

impl MessageType {
    fn table(version: OfVersion) -> &'static [MessageType] {
        match version {
            OfVersion::Of10 => &OF10_TYPES,
            OfVersion::Of13 => &OF13_TYPES,
        }
    }

    /// Map a wire type code for the given wire version.
    pub fn from_wire(version: u8, code: u8) -> Option<Self> {
        Self::table(OfVersion::layout_for(version))
            .get(code as usize)
            .copied()
    }

    /// Wire type code, or `None` when the version has no such message.
    pub fn to_wire(self, version: u8) -> Option<u8> {
        Self::table(OfVersion::layout_for(version))
            .iter()
            .position(|t| *t == self)
            .map(|p| p as u8)
    }

    /// Messages only a controller may send.
    ///
    /// A device sending any of these is always in violation.
    pub fn is_controller_to_switch(self) -> bool {
        matches!(
            self,
            MessageType::FeaturesRequest
                | MessageType::GetConfigRequest
                | MessageType::SetConfig
                | MessageType::PacketOut
                | MessageType::FlowMod
                | MessageType::GroupMod
                | MessageType::PortMod
                | MessageType::TableMod
                | MessageType::StatsRequest
                | MessageType::BarrierRequest
                | MessageType::QueueGetConfigRequest
                | MessageType::RoleRequest
                | MessageType::GetAsyncRequest
                | MessageType::SetAsync
                | MessageType::MeterMod
        )
    }

    /// Every variant, in 1.3 wire order.
    pub fn all() -> &'static [MessageType] {
        &OF13_TYPES
    }
}

/// Raw OpenFlow header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfHeader {
    /// Wire version
    pub version: u8,
    /// Wire type code
    pub msg_type: u8,
    /// Total message length including the header
    pub length: u16,
    /// Transaction id
    pub xid: u32,
}

impl OfHeader {
    /// Parse a header from the front of `buf` without consuming it.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < OFP_HEADER_LEN {
            return None;
        }
        let mut b = &buf[..OFP_HEADER_LEN];
        Some(Self {
            version: b.get_u8(),
            msg_type: b.get_u8(),
            length: b.get_u16(),
            xid: b.get_u32(),
        })
    }

    /// Validate the length field.
    pub fn validate(&self) -> Result<()> {
        if (self.length as usize) < OFP_HEADER_LEN {
            return Err(OfError::ProtocolParse(format!(
                "header length {} below minimum {}",
                self.length, OFP_HEADER_LEN
            )));
        }
        Ok(())
    }

    /// Write the header.
    pub fn write(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.version);
        dst.put_u8(self.msg_type);
        dst.put_u16(self.length);
        dst.put_u32(self.xid);
    }
}
