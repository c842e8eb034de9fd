//! Packet-in payload inspection.
//!
//! Only as much of the PACKET_IN body is read as classification needs: the
//! offset of the embedded frame and that frame's ethertype.
//!
//! | Version | Frame offset in body                                   |
//! |---------|--------------------------------------------------------|
//! | 1.0     | 10 (buffer_id, total_len, in_port, reason, pad)         |
//! | 1.3     | 16 + match length rounded up to 8 + 2 bytes of padding  |

use super::{Body, MessageType, OfMessage, OfVersion};

/// Link Layer Discovery Protocol
pub const ETH_TYPE_LLDP: u16 = 0x88cc;

/// Broadcast discovery (BDDP)
pub const ETH_TYPE_BDDP: u16 = 0x8942;

const ETH_TYPE_VLAN: u16 = 0x8100;
const ETH_TYPE_QINQ: u16 = 0x88a8;
const ETH_TYPE_OFFSET: usize = 12;
const VLAN_TAG_LEN: usize = 4;

const OF10_DATA_OFFSET: usize = 10;
const OF13_MATCH_OFFSET: usize = 16;
const OF13_MATCH_HEADER_LEN: usize = 4;
const OF13_DATA_PAD: usize = 2;

/// Ethernet frame carried by a packet-in body.
pub fn packet_in_frame(version: OfVersion, body: &[u8]) -> Option<&[u8]> {
    match version {
        OfVersion::Of10 => body.get(OF10_DATA_OFFSET..),
        OfVersion::Of13 => {
            let len = body.get(OF13_MATCH_OFFSET + 2..OF13_MATCH_OFFSET + 4)?;
            let match_len = u16::from_be_bytes([len[0], len[1]]) as usize;
            if match_len < OF13_MATCH_HEADER_LEN {
                return None;
            }
            let padded = match_len.div_ceil(8) * 8;
            body.get(OF13_MATCH_OFFSET + padded + OF13_DATA_PAD..)
        }
    }
}

/// Ethertype of a frame, looking through VLAN tags.
pub fn frame_ethertype(frame: &[u8]) -> Option<u16> {
    let mut offset = ETH_TYPE_OFFSET;
    loop {
        let raw = frame.get(offset..offset + 2)?;
        let ethertype = u16::from_be_bytes([raw[0], raw[1]]);
        if ethertype != ETH_TYPE_VLAN && ethertype != ETH_TYPE_QINQ {
            return Some(ethertype);
        }
        offset += VLAN_TAG_LEN;
    }
}

/// Ethertype of the frame in a PACKET_IN, if `msg` is one and is readable.
pub fn packet_in_ethertype(msg: &OfMessage) -> Option<u16> {
    if msg.msg_type() != MessageType::PacketIn {
        return None;
    }
    let Body::Opaque { payload, .. } = &msg.body else {
        return None;
    };
    packet_in_frame(msg.layout(), payload).and_then(frame_ethertype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(tags: &[u16], ethertype: u16) -> Vec<u8> {
        let mut out = vec![0xff; 12];
        for tag in tags {
            out.extend_from_slice(&tag.to_be_bytes());
            out.extend_from_slice(&[0x00, 0x0a]);
        }
        out.extend_from_slice(&ethertype.to_be_bytes());
        out.extend_from_slice(b"payload");
        out
    }

    fn packet_in(version: OfVersion, body: Vec<u8>) -> OfMessage {
        OfMessage::new(
            version,
            1,
            Body::Opaque {
                msg_type: MessageType::PacketIn,
                payload: Bytes::from(body),
            },
        )
    }

    fn of10_body(frame: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; OF10_DATA_OFFSET];
        body.extend_from_slice(frame);
        body
    }

    fn of13_body(frame: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; OF13_MATCH_OFFSET];
        // OXM match with one 8-byte in_port field: length 12, padded to 16.
        body.extend_from_slice(&[0x00, 0x01, 0x00, 0x0c]);
        body.extend_from_slice(&[0x80, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01]);
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&[0u8; OF13_DATA_PAD]);
        body.extend_from_slice(frame);
        body
    }

    #[test]
    fn test_of10_lldp() {
        let msg = packet_in(OfVersion::Of10, of10_body(&frame(&[], ETH_TYPE_LLDP)));
        assert_eq!(packet_in_ethertype(&msg), Some(ETH_TYPE_LLDP));
    }

    #[test]
    fn test_of13_skips_padded_match() {
        let msg = packet_in(OfVersion::Of13, of13_body(&frame(&[], 0x0800)));
        assert_eq!(packet_in_ethertype(&msg), Some(0x0800));
    }

    #[test]
    fn test_vlan_tags_are_skipped() {
        let tagged = frame(&[ETH_TYPE_QINQ, ETH_TYPE_VLAN], ETH_TYPE_BDDP);
        assert_eq!(frame_ethertype(&tagged), Some(ETH_TYPE_BDDP));
        let msg = packet_in(OfVersion::Of13, of13_body(&tagged));
        assert_eq!(packet_in_ethertype(&msg), Some(ETH_TYPE_BDDP));
    }

    #[test]
    fn test_truncated_or_other_messages() {
        assert_eq!(packet_in_ethertype(&packet_in(OfVersion::Of10, vec![0; 12])), None);
        assert_eq!(packet_in_ethertype(&packet_in(OfVersion::Of13, vec![0; 18])), None);

        let mut bad_match = vec![0u8; OF13_MATCH_OFFSET];
        bad_match.extend_from_slice(&[0x00, 0x01, 0x00, 0x02]);
        assert_eq!(packet_in_frame(OfVersion::Of13, &bad_match), None);

        let barrier = OfMessage::new(OfVersion::Of13, 1, Body::BarrierReply);
        assert_eq!(packet_in_ethertype(&barrier), None);
    }
}
