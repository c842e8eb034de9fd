//! OpenFlow wire codec.
//!
//! Turns a byte stream into discrete [`OfMessage`]s and back. The codec is
//! stateless per message; the only state is the caller's read buffer, which
//! keeps partial frames until the rest arrives.
//!
//! ```text
//!   socket bytes ──► BytesMut ──► OfCodec::decode ──► Some(OfMessage)
//!                        ▲                        └─► None (need more bytes)
//!                        └─ partial tail stays buffered
//! ```
//!
//! Malformed input is reported as [`OfError::ProtocolParse`], which the
//! connection treats as fatal.

mod header;
mod message;
mod packet;
mod stats;

pub use header::{MessageType, OfHeader, OfVersion, MAX_MESSAGE_LEN, OFP_HEADER_LEN};
pub use message::{
    Body, ControllerRole, ErrorMsg, Experimenter, FeaturesReply, Hello, OfMessage, PortDesc,
    PortReason, PortStatus, RoleMessage, RoleRequestFailure, SwitchConfig, MISS_SEND_LEN_FULL,
    NICIRA_EXPERIMENTER,
};
pub use packet::{
    frame_ethertype, packet_in_ethertype, packet_in_frame, ETH_TYPE_BDDP, ETH_TYPE_LLDP,
};
pub use stats::{
    DescStats, MeterFeatures, StatsBody, StatsReply, StatsRequest, StatsType, REPLY_MORE,
};

use bytes::BytesMut;

use crate::error::Result;

/// Stateless OpenFlow frame codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfCodec;

impl OfCodec {
    /// Create a codec.
    pub fn new() -> Self {
        Self
    }

    /// Decode at most one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` holds less than one full frame; the
    /// bytes stay in `src` for the next call.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OfMessage>> {
        let Some(header) = OfHeader::peek(src) else {
            return Ok(None);
        };
        header.validate()?;

        let len = header.length as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len).freeze();
        OfMessage::parse(header, frame.slice(OFP_HEADER_LEN..)).map(Some)
    }

    /// Encode one message onto `dst`.
    pub fn encode(&mut self, msg: &OfMessage, dst: &mut BytesMut) -> Result<()> {
        msg.write(dst)
    }

    /// Encode a batch in order.
    pub fn encode_batch(&mut self, msgs: &[OfMessage], dst: &mut BytesMut) -> Result<()> {
        for msg in msgs {
            msg.write(dst)?;
        }
        Ok(())
    }
}
