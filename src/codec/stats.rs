//! Statistics (multipart) request and reply bodies.
//!
//! Only the bodies the channel acts on during the handshake are decoded
//! (description, port description, meter features). Every other kind is
//! an array of entries and is carried as raw bytes, which makes fragment
//! assembly a plain concatenation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::header::OfVersion;
use super::message::{ensure, read_fixed_str, write_fixed_str, PortDesc};
use crate::error::{OfError, Result};

/// "More fragments follow" flag on a stats reply
pub const REPLY_MORE: u16 = 0x0001;

const DESC_STR_LEN: usize = 256;
const SERIAL_NUM_LEN: usize = 32;
const DESC_STATS_LEN: usize = 4 * DESC_STR_LEN + SERIAL_NUM_LEN;
const METER_FEATURES_LEN: usize = 16;

/// Statistics kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsType {
    /// Switch description
    Desc,
    /// Individual flow statistics
    Flow,
    /// Aggregate flow statistics
    Aggregate,
    /// Flow table statistics
    Table,
    /// Port statistics
    Port,
    /// Queue statistics
    Queue,
    /// Group counters (1.3)
    Group,
    /// Group descriptions (1.3)
    GroupDesc,
    /// Group features (1.3)
    GroupFeatures,
    /// Meter statistics (1.3)
    Meter,
    /// Meter configuration (1.3)
    MeterConfig,
    /// Meter features (1.3)
    MeterFeatures,
    /// Table features (1.3)
    TableFeatures,
    /// Port descriptions (1.3)
    PortDesc,
    /// Flow statistics without instructions (1.3 extension)
    FlowLightweight,
    /// Experimenter / vendor statistics
    Experimenter,
}

impl StatsType {
    /// Decode a wire stats type for the given version layout.
    pub fn from_wire(version: OfVersion, code: u16) -> Option<Self> {
        let kind = match code {
            0 => StatsType::Desc,
            1 => StatsType::Flow,
            2 => StatsType::Aggregate,
            3 => StatsType::Table,
            4 => StatsType::Port,
            5 => StatsType::Queue,
            0xffff => StatsType::Experimenter,
            _ if version == OfVersion::Of10 => return None,
            6 => StatsType::Group,
            7 => StatsType::GroupDesc,
            8 => StatsType::GroupFeatures,
            9 => StatsType::Meter,
            10 => StatsType::MeterConfig,
            11 => StatsType::MeterFeatures,
            12 => StatsType::TableFeatures,
            13 => StatsType::PortDesc,
            17 => StatsType::FlowLightweight,
            _ => return None,
        };
        Some(kind)
    }

    /// Wire code.
    pub fn to_wire(self) -> u16 {
        match self {
            StatsType::Desc => 0,
            StatsType::Flow => 1,
            StatsType::Aggregate => 2,
            StatsType::Table => 3,
            StatsType::Port => 4,
            StatsType::Queue => 5,
            StatsType::Group => 6,
            StatsType::GroupDesc => 7,
            StatsType::GroupFeatures => 8,
            StatsType::Meter => 9,
            StatsType::MeterConfig => 10,
            StatsType::MeterFeatures => 11,
            StatsType::TableFeatures => 12,
            StatsType::PortDesc => 13,
            StatsType::FlowLightweight => 17,
            StatsType::Experimenter => 0xffff,
        }
    }
}

/// Switch description (OFPST_DESC body).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescStats {
    /// Manufacturer
    pub mfr_desc: String,
    /// Hardware revision
    pub hw_desc: String,
    /// Software revision
    pub sw_desc: String,
    /// Serial number
    pub serial_num: String,
    /// Human readable datapath description
    pub dp_desc: String,
}

impl DescStats {
    fn parse(buf: &mut Bytes) -> Result<Self> {
        ensure(buf, DESC_STATS_LEN, "desc stats")?;
        Ok(Self {
            mfr_desc: read_fixed_str(buf, DESC_STR_LEN),
            hw_desc: read_fixed_str(buf, DESC_STR_LEN),
            sw_desc: read_fixed_str(buf, DESC_STR_LEN),
            serial_num: read_fixed_str(buf, SERIAL_NUM_LEN),
            dp_desc: read_fixed_str(buf, DESC_STR_LEN),
        })
    }

    fn write(&self, dst: &mut BytesMut) {
        write_fixed_str(dst, &self.mfr_desc, DESC_STR_LEN);
        write_fixed_str(dst, &self.hw_desc, DESC_STR_LEN);
        write_fixed_str(dst, &self.sw_desc, DESC_STR_LEN);
        write_fixed_str(dst, &self.serial_num, SERIAL_NUM_LEN);
        write_fixed_str(dst, &self.dp_desc, DESC_STR_LEN);
    }
}

/// Meter features (OFPMP_METER_FEATURES body).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterFeatures {
    /// Maximum number of meters
    pub max_meter: u32,
    /// Bitmap of supported band types
    pub band_types: u32,
    /// Bitmap of meter flags
    pub capabilities: u32,
    /// Maximum bands per meter
    pub max_bands: u8,
    /// Maximum color value
    pub max_color: u8,
}

/// Decoded stats reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsBody {
    /// Description
    Desc(DescStats),
    /// Port descriptions
    PortDesc(Vec<PortDesc>),
    /// Meter features
    MeterFeatures(MeterFeatures),
    /// Entry array of any other kind
    Entries(Bytes),
}

/// Stats (multipart) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReply {
    /// Kind of statistics
    pub stats_type: StatsType,
    /// Reply flags
    pub flags: u16,
    /// Body
    pub body: StatsBody,
}

impl StatsReply {
    /// Whether more fragments follow.
    pub fn is_reply_more(&self) -> bool {
        self.flags & REPLY_MORE != 0
    }

    /// Approximate payload size, used for accumulator bounds.
    pub fn payload_len(&self) -> usize {
        match &self.body {
            StatsBody::Desc(_) => DESC_STATS_LEN,
            StatsBody::PortDesc(ports) => ports.len() * PortDesc::len(OfVersion::Of13),
            StatsBody::MeterFeatures(_) => METER_FEATURES_LEN,
            StatsBody::Entries(b) => b.len(),
        }
    }

    /// Fold a following fragment into this reply.
    ///
    /// Array bodies are concatenated; single-struct bodies take the newest
    /// value. Flags are taken from the later fragment.
    pub fn absorb(&mut self, next: StatsReply) {
        self.flags = next.flags;
        match (&mut self.body, next.body) {
            (StatsBody::PortDesc(ports), StatsBody::PortDesc(more)) => ports.extend(more),
            (StatsBody::Entries(bytes), StatsBody::Entries(more)) => {
                let mut joined = BytesMut::with_capacity(bytes.len() + more.len());
                joined.extend_from_slice(bytes);
                joined.extend_from_slice(&more);
                *bytes = joined.freeze();
            }
            (body, other) => *body = other,
        }
    }

    pub(crate) fn parse(version: OfVersion, buf: &mut Bytes) -> Result<Self> {
        let (stats_type, flags) = parse_stats_prefix(version, buf)?;
        let body = match stats_type {
            StatsType::Desc => StatsBody::Desc(DescStats::parse(buf)?),
            StatsType::PortDesc => {
                let entry = PortDesc::len(version);
                if buf.len() % entry != 0 {
                    return Err(OfError::ProtocolParse(format!(
                        "port desc body length {} not a multiple of {}",
                        buf.len(),
                        entry
                    )));
                }
                let mut ports = Vec::with_capacity(buf.len() / entry);
                while buf.has_remaining() {
                    ports.push(PortDesc::parse(version, buf)?);
                }
                StatsBody::PortDesc(ports)
            }
            StatsType::MeterFeatures => {
                ensure(buf, METER_FEATURES_LEN, "meter features")?;
                let features = MeterFeatures {
                    max_meter: buf.get_u32(),
                    band_types: buf.get_u32(),
                    capabilities: buf.get_u32(),
                    max_bands: buf.get_u8(),
                    max_color: buf.get_u8(),
                };
                buf.advance(2);
                StatsBody::MeterFeatures(features)
            }
            _ => StatsBody::Entries(buf.split_to(buf.len())),
        };
        Ok(Self {
            stats_type,
            flags,
            body,
        })
    }

    pub(crate) fn write(&self, version: OfVersion, dst: &mut BytesMut) {
        write_stats_prefix(version, self.stats_type, self.flags, dst);
        match &self.body {
            StatsBody::Desc(desc) => desc.write(dst),
            StatsBody::PortDesc(ports) => {
                for port in ports {
                    port.write(version, dst);
                }
            }
            StatsBody::MeterFeatures(f) => {
                dst.put_u32(f.max_meter);
                dst.put_u32(f.band_types);
                dst.put_u32(f.capabilities);
                dst.put_u8(f.max_bands);
                dst.put_u8(f.max_color);
                dst.put_bytes(0, 2);
            }
            StatsBody::Entries(bytes) => dst.extend_from_slice(bytes),
        }
    }
}

/// Stats (multipart) request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRequest {
    /// Kind of statistics requested
    pub stats_type: StatsType,
    /// Request flags
    pub flags: u16,
    /// Request body (empty for desc, port desc and meter features)
    pub body: Bytes,
}

impl StatsRequest {
    /// Request with an empty body.
    pub fn simple(stats_type: StatsType) -> Self {
        Self {
            stats_type,
            flags: 0,
            body: Bytes::new(),
        }
    }

    pub(crate) fn parse(version: OfVersion, buf: &mut Bytes) -> Result<Self> {
        let (stats_type, flags) = parse_stats_prefix(version, buf)?;
        Ok(Self {
            stats_type,
            flags,
            body: buf.split_to(buf.len()),
        })
    }

    pub(crate) fn write(&self, version: OfVersion, dst: &mut BytesMut) {
        write_stats_prefix(version, self.stats_type, self.flags, dst);
        dst.extend_from_slice(&self.body);
    }
}

fn parse_stats_prefix(version: OfVersion, buf: &mut Bytes) -> Result<(StatsType, u16)> {
    let prefix = match version {
        OfVersion::Of10 => 4,
        OfVersion::Of13 => 8,
    };
    ensure(buf, prefix, "stats header")?;
    let code = buf.get_u16();
    let flags = buf.get_u16();
    if version == OfVersion::Of13 {
        buf.advance(4);
    }
    let stats_type = StatsType::from_wire(version, code)
        .ok_or_else(|| OfError::ProtocolParse(format!("unknown stats type {code}")))?;
    Ok((stats_type, flags))
}

fn write_stats_prefix(version: OfVersion, stats_type: StatsType, flags: u16, dst: &mut BytesMut) {
    dst.put_u16(stats_type.to_wire());
    dst.put_u16(flags);
    if version == OfVersion::Of13 {
        dst.put_bytes(0, 4);
    }
}
