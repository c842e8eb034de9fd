//! OpenFlow message model.
//!
//! An [`OfMessage`] is a header (version, xid) plus a typed [`Body`]. Bodies
//! the control channel inspects are decoded; everything else stays an
//! opaque payload that round-trips byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::header::{MessageType, OfHeader, OfVersion, OFP_HEADER_LEN, MAX_MESSAGE_LEN};
use super::stats::{StatsReply, StatsRequest, StatsType};
use crate::error::{OfError, Result};

/// Nicira vendor / experimenter id
pub const NICIRA_EXPERIMENTER: u32 = 0x2320;

/// Miss send length asking for full packets
pub const MISS_SEND_LEN_FULL: u16 = 0xffff;

const HELLO_ELEM_VERSIONBITMAP: u16 = 1;

// Error types and codes used by the channel.
const ET_HELLO_FAILED: u16 = 0;
const ET_BAD_REQUEST: u16 = 1;
const ET_FLOW_MOD_FAILED_10: u16 = 3;
const ET_FLOW_MOD_FAILED_13: u16 = 5;
const ET_ROLE_REQUEST_FAILED_13: u16 = 11;
const BRC_BAD_TYPE: u16 = 1;
const BRC_EPERM: u16 = 5;
const BRC_IS_SLAVE_13: u16 = 10;
const FMFC_ALL_TABLES_FULL_10: u16 = 0;
const FMFC_TABLE_FULL_13: u16 = 1;

pub(crate) fn ensure(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(OfError::ProtocolParse(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn read_fixed_str(buf: &mut Bytes, width: usize) -> String {
    let raw = buf.split_to(width);
    let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub(crate) fn write_fixed_str(dst: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width - 1);
    dst.extend_from_slice(&bytes[..n]);
    dst.put_bytes(0, width - n);
}

/// HELLO body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hello {
    /// Version bitmap element (bit n set means wire version n supported)
    pub bitmap: Option<u32>,
}

/// Reason a role request failed (1.3 `OFPET_ROLE_REQUEST_FAILED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRequestFailure {
    /// Stale generation id
    Stale,
    /// Controller role change unsupported
    Unsupported,
    /// Invalid role
    BadRole,
}

/// ERROR body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    /// Error type (wire value)
    pub err_type: u16,
    /// Error code (wire value)
    pub code: u16,
    /// Offending request, usually truncated
    pub data: Bytes,
}

impl ErrorMsg {
    /// OFPET_HELLO_FAILED
    pub fn is_hello_failed(&self) -> bool {
        self.err_type == ET_HELLO_FAILED
    }

    /// OFPET_BAD_REQUEST of any code
    pub fn is_bad_request(&self) -> bool {
        self.err_type == ET_BAD_REQUEST
    }

    /// OFPET_BAD_REQUEST / OFPBRC_BAD_TYPE
    pub fn is_bad_type(&self) -> bool {
        self.is_bad_request() && self.code == BRC_BAD_TYPE
    }

    /// Permission errors that suggest the device thinks we are slave.
    pub fn is_permission_denied(&self, version: OfVersion) -> bool {
        self.is_bad_request()
            && (self.code == BRC_EPERM
                || (version == OfVersion::Of13 && self.code == BRC_IS_SLAVE_13))
    }

    /// Flow table exhausted.
    pub fn is_table_full(&self, version: OfVersion) -> bool {
        match version {
            OfVersion::Of10 => {
                self.err_type == ET_FLOW_MOD_FAILED_10 && self.code == FMFC_ALL_TABLES_FULL_10
            }
            OfVersion::Of13 => {
                self.err_type == ET_FLOW_MOD_FAILED_13 && self.code == FMFC_TABLE_FULL_13
            }
        }
    }

    /// Whether this is OFPET_ROLE_REQUEST_FAILED of any code.
    pub fn is_role_request_failed(&self, version: OfVersion) -> bool {
        version == OfVersion::Of13 && self.err_type == ET_ROLE_REQUEST_FAILED_13
    }

    /// Decoded role-request failure code, if this is one.
    pub fn role_request_failure(&self, version: OfVersion) -> Option<RoleRequestFailure> {
        if !self.is_role_request_failed(version) {
            return None;
        }
        match self.code {
            0 => Some(RoleRequestFailure::Stale),
            1 => Some(RoleRequestFailure::Unsupported),
            2 => Some(RoleRequestFailure::BadRole),
            _ => None,
        }
    }
}

/// EXPERIMENTER (1.3) / VENDOR (1.0) body.
///
/// Both layouts start with the experimenter id followed by a 32-bit
/// subtype (`exp_type` in 1.3, the vendor subtype in 1.0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experimenter {
    /// Experimenter / vendor id
    pub experimenter: u32,
    /// Experimenter subtype
    pub exp_type: u32,
    /// Remaining payload
    pub data: Bytes,
}

/// Port description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDesc {
    /// Port number; 1.0 reserved ports are widened into the 1.3 range.
    pub port_no: u32,
    /// Hardware address
    pub hw_addr: [u8; 6],
    /// Interface name
    pub name: String,
    /// OFPPC_* config bits
    pub config: u32,
    /// OFPPS_* state bits
    pub state: u32,
    /// Current features
    pub curr: u32,
    /// Advertised features
    pub advertised: u32,
    /// Supported features
    pub supported: u32,
    /// Peer advertised features
    pub peer: u32,
    /// Current speed in kbps (1.3)
    pub curr_speed: u32,
    /// Max speed in kbps (1.3)
    pub max_speed: u32,
}

impl PortDesc {
    /// Encoded size per version.
    pub const fn len(version: OfVersion) -> usize {
        match version {
            OfVersion::Of10 => 48,
            OfVersion::Of13 => 64,
        }
    }

    pub(crate) fn parse(version: OfVersion, buf: &mut Bytes) -> Result<Self> {
        ensure(buf, Self::len(version), "port desc")?;
        let mut port = PortDesc::default();
        match version {
            OfVersion::Of10 => {
                let p = buf.get_u16();
                port.port_no = if p >= 0xff00 {
                    0xffff_0000 | u32::from(p)
                } else {
                    u32::from(p)
                };
                buf.copy_to_slice(&mut port.hw_addr);
                port.name = read_fixed_str(buf, 16);
            }
            OfVersion::Of13 => {
                port.port_no = buf.get_u32();
                buf.advance(4);
                buf.copy_to_slice(&mut port.hw_addr);
                buf.advance(2);
                port.name = read_fixed_str(buf, 16);
            }
        }
        port.config = buf.get_u32();
        port.state = buf.get_u32();
        port.curr = buf.get_u32();
        port.advertised = buf.get_u32();
        port.supported = buf.get_u32();
        port.peer = buf.get_u32();
        if version == OfVersion::Of13 {
            port.curr_speed = buf.get_u32();
            port.max_speed = buf.get_u32();
        }
        Ok(port)
    }

    pub(crate) fn write(&self, version: OfVersion, dst: &mut BytesMut) {
        match version {
            OfVersion::Of10 => {
                dst.put_u16(self.port_no as u16);
                dst.put_slice(&self.hw_addr);
                write_fixed_str(dst, &self.name, 16);
            }
            OfVersion::Of13 => {
                dst.put_u32(self.port_no);
                dst.put_bytes(0, 4);
                dst.put_slice(&self.hw_addr);
                dst.put_bytes(0, 2);
                write_fixed_str(dst, &self.name, 16);
            }
        }
        dst.put_u32(self.config);
        dst.put_u32(self.state);
        dst.put_u32(self.curr);
        dst.put_u32(self.advertised);
        dst.put_u32(self.supported);
        dst.put_u32(self.peer);
        if version == OfVersion::Of13 {
            dst.put_u32(self.curr_speed);
            dst.put_u32(self.max_speed);
        }
    }
}

/// FEATURES_REPLY body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeaturesReply {
    /// Datapath id
    pub datapath_id: u64,
    /// Packets the switch can buffer
    pub n_buffers: u32,
    /// Number of flow tables
    pub n_tables: u8,
    /// Auxiliary connection id (1.3)
    pub auxiliary_id: u8,
    /// OFPC_* capability bits
    pub capabilities: u32,
    /// Supported actions (1.0) or reserved (1.3)
    pub reserved: u32,
    /// Physical ports (1.0 only; 1.3 uses the port-desc multipart)
    pub ports: Vec<PortDesc>,
}

/// GET_CONFIG_REPLY / SET_CONFIG body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchConfig {
    /// OFPC_FRAG_* flags
    pub flags: u16,
    /// Bytes of a table-miss packet to send to the controller
    pub miss_send_len: u16,
}

/// Why a port status was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReason {
    /// Port added
    Add,
    /// Port removed
    Delete,
    /// Port attribute changed
    Modify,
}

/// PORT_STATUS body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    /// Reason
    pub reason: PortReason,
    /// Port description
    pub desc: PortDesc,
}

/// Controller role carried by 1.3 ROLE_REQUEST / ROLE_REPLY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRole {
    /// Query only, do not change the role
    NoChange,
    /// Equal
    Equal,
    /// Master
    Master,
    /// Slave
    Slave,
}

impl ControllerRole {
    fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(ControllerRole::NoChange),
            1 => Some(ControllerRole::Equal),
            2 => Some(ControllerRole::Master),
            3 => Some(ControllerRole::Slave),
            _ => None,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            ControllerRole::NoChange => 0,
            ControllerRole::Equal => 1,
            ControllerRole::Master => 2,
            ControllerRole::Slave => 3,
        }
    }
}

/// ROLE_REQUEST / ROLE_REPLY body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleMessage {
    /// Role
    pub role: ControllerRole,
    /// Master election generation id
    pub generation_id: u64,
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// HELLO
    Hello(Hello),
    /// ERROR
    Error(ErrorMsg),
    /// ECHO_REQUEST with payload
    EchoRequest(Bytes),
    /// ECHO_REPLY with payload
    EchoReply(Bytes),
    /// EXPERIMENTER / VENDOR
    Experimenter(Experimenter),
    /// FEATURES_REQUEST
    FeaturesRequest,
    /// FEATURES_REPLY
    FeaturesReply(FeaturesReply),
    /// GET_CONFIG_REQUEST
    GetConfigRequest,
    /// GET_CONFIG_REPLY
    GetConfigReply(SwitchConfig),
    /// SET_CONFIG
    SetConfig(SwitchConfig),
    /// PORT_STATUS
    PortStatus(PortStatus),
    /// STATS / MULTIPART request
    StatsRequest(StatsRequest),
    /// STATS / MULTIPART reply
    StatsReply(StatsReply),
    /// BARRIER_REQUEST
    BarrierRequest,
    /// BARRIER_REPLY
    BarrierReply,
    /// ROLE_REQUEST
    RoleRequest(RoleMessage),
    /// ROLE_REPLY
    RoleReply(RoleMessage),
    /// Any other message, payload kept verbatim
    Opaque {
        /// Message type
        msg_type: MessageType,
        /// Body bytes after the header
        payload: Bytes,
    },
}

impl Body {
    /// Version neutral type of this body.
    pub fn msg_type(&self) -> MessageType {
        match self {
            Body::Hello(_) => MessageType::Hello,
            Body::Error(_) => MessageType::Error,
            Body::EchoRequest(_) => MessageType::EchoRequest,
            Body::EchoReply(_) => MessageType::EchoReply,
            Body::Experimenter(_) => MessageType::Experimenter,
            Body::FeaturesRequest => MessageType::FeaturesRequest,
            Body::FeaturesReply(_) => MessageType::FeaturesReply,
            Body::GetConfigRequest => MessageType::GetConfigRequest,
            Body::GetConfigReply(_) => MessageType::GetConfigReply,
            Body::SetConfig(_) => MessageType::SetConfig,
            Body::PortStatus(_) => MessageType::PortStatus,
            Body::StatsRequest(_) => MessageType::StatsRequest,
            Body::StatsReply(_) => MessageType::StatsReply,
            Body::BarrierRequest => MessageType::BarrierRequest,
            Body::BarrierReply => MessageType::BarrierReply,
            Body::RoleRequest(_) => MessageType::RoleRequest,
            Body::RoleReply(_) => MessageType::RoleReply,
            Body::Opaque { msg_type, .. } => *msg_type,
        }
    }
}

/// A single OpenFlow message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfMessage {
    /// Wire version from the header
    pub version: u8,
    /// Transaction id
    pub xid: u32,
    /// Body
    pub body: Body,
}

impl OfMessage {
    /// Build a message for a negotiated version.
    pub fn new(version: OfVersion, xid: u32, body: Body) -> Self {
        Self {
            version: version.wire(),
            xid,
            body,
        }
    }

    /// Message type.
    pub fn msg_type(&self) -> MessageType {
        self.body.msg_type()
    }

    /// Body layout this message uses.
    pub fn layout(&self) -> OfVersion {
        OfVersion::layout_for(self.version)
    }

    /// HELLO for the negotiated version; 1.3 advertises its bitmap.
    pub fn hello(version: OfVersion, xid: u32) -> Self {
        let bitmap = match version {
            OfVersion::Of10 => None,
            OfVersion::Of13 => Some((1 << OfVersion::Of10.wire()) | (1 << OfVersion::Of13.wire())),
        };
        Self::new(version, xid, Body::Hello(Hello { bitmap }))
    }

    /// Echo reply mirroring a request's xid and payload.
    pub fn echo_reply_to(request: &OfMessage) -> Option<Self> {
        match &request.body {
            Body::EchoRequest(data) => Some(Self {
                version: request.version,
                xid: request.xid,
                body: Body::EchoReply(data.clone()),
            }),
            _ => None,
        }
    }

    /// Stats request with an empty body.
    pub fn stats_request(version: OfVersion, xid: u32, stats_type: StatsType) -> Self {
        Self::new(version, xid, Body::StatsRequest(StatsRequest::simple(stats_type)))
    }

    /// The stats reply body, if this is one.
    pub fn as_stats_reply(&self) -> Option<&StatsReply> {
        match &self.body {
            Body::StatsReply(r) => Some(r),
            _ => None,
        }
    }

    /// The error body, if this is one.
    pub fn as_error(&self) -> Option<&ErrorMsg> {
        match &self.body {
            Body::Error(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn parse(header: OfHeader, mut payload: Bytes) -> Result<Self> {
        let msg_type = MessageType::from_wire(header.version, header.msg_type).ok_or_else(|| {
            OfError::ProtocolParse(format!(
                "unknown message type {} for version {}",
                header.msg_type, header.version
            ))
        })?;
        let layout = OfVersion::layout_for(header.version);
        let buf = &mut payload;

        let body = match msg_type {
            MessageType::Hello => Body::Hello(parse_hello(header.version, buf)),
            MessageType::Error => {
                ensure(buf, 4, "error")?;
                Body::Error(ErrorMsg {
                    err_type: buf.get_u16(),
                    code: buf.get_u16(),
                    data: buf.split_to(buf.len()),
                })
            }
            MessageType::EchoRequest => Body::EchoRequest(buf.split_to(buf.len())),
            MessageType::EchoReply => Body::EchoReply(buf.split_to(buf.len())),
            MessageType::Experimenter => {
                ensure(buf, 8, "experimenter")?;
                Body::Experimenter(Experimenter {
                    experimenter: buf.get_u32(),
                    exp_type: buf.get_u32(),
                    data: buf.split_to(buf.len()),
                })
            }
            MessageType::FeaturesRequest => Body::FeaturesRequest,
            MessageType::FeaturesReply => Body::FeaturesReply(parse_features(layout, buf)?),
            MessageType::GetConfigRequest => Body::GetConfigRequest,
            MessageType::GetConfigReply => Body::GetConfigReply(parse_config(buf)?),
            MessageType::SetConfig => Body::SetConfig(parse_config(buf)?),
            MessageType::PortStatus => {
                ensure(buf, 8, "port status")?;
                let reason = match buf.get_u8() {
                    0 => PortReason::Add,
                    1 => PortReason::Delete,
                    2 => PortReason::Modify,
                    other => {
                        return Err(OfError::ProtocolParse(format!(
                            "unknown port status reason {other}"
                        )))
                    }
                };
                buf.advance(7);
                Body::PortStatus(PortStatus {
                    reason,
                    desc: PortDesc::parse(layout, buf)?,
                })
            }
            MessageType::StatsRequest => Body::StatsRequest(StatsRequest::parse(layout, buf)?),
            MessageType::StatsReply => Body::StatsReply(StatsReply::parse(layout, buf)?),
            MessageType::BarrierRequest => Body::BarrierRequest,
            MessageType::BarrierReply => Body::BarrierReply,
            MessageType::RoleRequest => Body::RoleRequest(parse_role(buf)?),
            MessageType::RoleReply => Body::RoleReply(parse_role(buf)?),
            other => Body::Opaque {
                msg_type: other,
                payload: buf.split_to(buf.len()),
            },
        };

        Ok(Self {
            version: header.version,
            xid: header.xid,
            body,
        })
    }

    pub(crate) fn write(&self, dst: &mut BytesMut) -> Result<()> {
        let msg_type = self.msg_type();
        let code = msg_type.to_wire(self.version).ok_or_else(|| {
            OfError::ProtocolParse(format!(
                "{msg_type:?} is not defined for version {}",
                self.version
            ))
        })?;
        let layout = self.layout();
        let start = dst.len();
        OfHeader {
            version: self.version,
            msg_type: code,
            length: 0,
            xid: self.xid,
        }
        .write(dst);

        match &self.body {
            Body::Hello(hello) => {
                if let (Some(bitmap), OfVersion::Of13) = (hello.bitmap, layout) {
                    dst.put_u16(HELLO_ELEM_VERSIONBITMAP);
                    dst.put_u16(8);
                    dst.put_u32(bitmap);
                }
            }
            Body::Error(e) => {
                dst.put_u16(e.err_type);
                dst.put_u16(e.code);
                dst.extend_from_slice(&e.data);
            }
            Body::EchoRequest(data) | Body::EchoReply(data) => dst.extend_from_slice(data),
            Body::Experimenter(e) => {
                dst.put_u32(e.experimenter);
                dst.put_u32(e.exp_type);
                dst.extend_from_slice(&e.data);
            }
            Body::FeaturesRequest
            | Body::GetConfigRequest
            | Body::BarrierRequest
            | Body::BarrierReply => {}
            Body::FeaturesReply(f) => write_features(layout, f, dst),
            Body::GetConfigReply(c) | Body::SetConfig(c) => {
                dst.put_u16(c.flags);
                dst.put_u16(c.miss_send_len);
            }
            Body::PortStatus(ps) => {
                dst.put_u8(match ps.reason {
                    PortReason::Add => 0,
                    PortReason::Delete => 1,
                    PortReason::Modify => 2,
                });
                dst.put_bytes(0, 7);
                ps.desc.write(layout, dst);
            }
            Body::StatsRequest(r) => r.write(layout, dst),
            Body::StatsReply(r) => r.write(layout, dst),
            Body::RoleRequest(r) | Body::RoleReply(r) => {
                dst.put_u32(r.role.to_wire());
                dst.put_bytes(0, 4);
                dst.put_u64(r.generation_id);
            }
            Body::Opaque { payload, .. } => dst.extend_from_slice(payload),
        }

        let len = dst.len() - start;
        if len > MAX_MESSAGE_LEN {
            dst.truncate(start);
            return Err(OfError::ProtocolParse(format!(
                "{msg_type:?} of {len} bytes exceeds maximum message length"
            )));
        }
        dst[start + 2..start + 4].copy_from_slice(&(len as u16).to_be_bytes());
        debug_assert!(len >= OFP_HEADER_LEN);
        Ok(())
    }
}

fn parse_hello(version: u8, buf: &mut Bytes) -> Hello {
    if version < OfVersion::Of13.wire() {
        return Hello::default();
    }
    // Elements are best effort: a malformed list is treated as absent.
    while buf.remaining() >= 4 {
        let elem_type = buf.get_u16();
        let elem_len = buf.get_u16() as usize;
        if elem_len < 4 || buf.remaining() < elem_len - 4 {
            break;
        }
        let mut elem = buf.split_to(elem_len - 4);
        if elem_type == HELLO_ELEM_VERSIONBITMAP && elem.remaining() >= 4 {
            return Hello {
                bitmap: Some(elem.get_u32()),
            };
        }
        // Elements are padded to 8-byte multiples.
        let pad = (8 - elem_len % 8) % 8;
        if buf.remaining() < pad {
            break;
        }
        buf.advance(pad);
    }
    Hello::default()
}

fn parse_features(version: OfVersion, buf: &mut Bytes) -> Result<FeaturesReply> {
    ensure(buf, 24, "features reply")?;
    let mut f = FeaturesReply {
        datapath_id: buf.get_u64(),
        n_buffers: buf.get_u32(),
        n_tables: buf.get_u8(),
        ..FeaturesReply::default()
    };
    match version {
        OfVersion::Of10 => {
            buf.advance(3);
            f.capabilities = buf.get_u32();
            f.reserved = buf.get_u32();
            let entry = PortDesc::len(version);
            if buf.len() % entry != 0 {
                return Err(OfError::ProtocolParse(format!(
                    "features port list length {} not a multiple of {entry}",
                    buf.len()
                )));
            }
            while buf.has_remaining() {
                f.ports.push(PortDesc::parse(version, buf)?);
            }
        }
        OfVersion::Of13 => {
            f.auxiliary_id = buf.get_u8();
            buf.advance(2);
            f.capabilities = buf.get_u32();
            f.reserved = buf.get_u32();
        }
    }
    Ok(f)
}

fn write_features(version: OfVersion, f: &FeaturesReply, dst: &mut BytesMut) {
    dst.put_u64(f.datapath_id);
    dst.put_u32(f.n_buffers);
    dst.put_u8(f.n_tables);
    match version {
        OfVersion::Of10 => {
            dst.put_bytes(0, 3);
            dst.put_u32(f.capabilities);
            dst.put_u32(f.reserved);
            for port in &f.ports {
                port.write(version, dst);
            }
        }
        OfVersion::Of13 => {
            dst.put_u8(f.auxiliary_id);
            dst.put_bytes(0, 2);
            dst.put_u32(f.capabilities);
            dst.put_u32(f.reserved);
        }
    }
}

fn parse_config(buf: &mut Bytes) -> Result<SwitchConfig> {
    ensure(buf, 4, "switch config")?;
    Ok(SwitchConfig {
        flags: buf.get_u16(),
        miss_send_len: buf.get_u16(),
    })
}

fn parse_role(buf: &mut Bytes) -> Result<RoleMessage> {
    ensure(buf, 16, "role message")?;
    let raw = buf.get_u32();
    buf.advance(4);
    let generation_id = buf.get_u64();
    let role = ControllerRole::from_wire(raw)
        .ok_or_else(|| OfError::ProtocolParse(format!("unknown controller role {raw}")))?;
    Ok(RoleMessage {
        role,
        generation_id,
    })
}
