// aether/frame.rs — wire format.
//
// Ethernet II encapsulation, then the Aether header, payload, and a
// trailing HMAC-SHA256 digest over header + payload. Ethernet fields keep
// network byte order; every Aether field is little-endian. Offsets ride
// in 48 bits.

use alloc::vec::Vec;

use crate::crypto::{hmac_sha256, DIGEST_LEN};

pub const AETHER_MAGIC: u32 = 0x4854_4541;
pub const AETHER_VERSION: u8 = 1;
/// Implementation-selected EtherType for Aether frames.
pub const AETHER_ETHERTYPE: u16 = 0xA37A;

pub const ETH_HEADER_LEN: usize = 14;
pub const AETHER_HEADER_LEN: usize = 40;
pub const MAX_OFFSET: u64 = (1 << 48) - 1;
pub const MAX_PAYLOAD: usize = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    PageRequest = 1,
    PageResponse = 2,
    Invalidate = 3,
    Generation = 4,
    Revoke = 5,
    Ack = 6,
}

impl MsgType {
    pub fn from_wire(raw: u8) -> Option<MsgType> {
        match raw {
            1 => Some(MsgType::PageRequest),
            2 => Some(MsgType::PageResponse),
            3 => Some(MsgType::Invalidate),
            4 => Some(MsgType::Generation),
            5 => Some(MsgType::Revoke),
            6 => Some(MsgType::Ack),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u16 {
        /// PAGE_REQUEST wants write access.
        const WRITE = 1 << 0;
        /// PAGE_RESPONSE carries a zero page elided from the payload.
        const ZERO_PAGE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MsgType,
    pub flags: FrameFlags,
    pub seq: u64,
    pub src_node: u16,
    pub dst_node: u16,
    pub offset: u64,
    pub data_len: u16,
    pub generation: u64,
}

impl FrameHeader {
    /// Serialize the 40 wire bytes.
    pub fn to_wire(&self) -> [u8; AETHER_HEADER_LEN] {
        let mut out = [0u8; AETHER_HEADER_LEN];
        out[0..4].copy_from_slice(&AETHER_MAGIC.to_le_bytes());
        out[4] = AETHER_VERSION;
        out[5] = self.msg_type as u8;
        out[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..16].copy_from_slice(&self.seq.to_le_bytes());
        out[16..18].copy_from_slice(&self.src_node.to_le_bytes());
        out[18..20].copy_from_slice(&self.dst_node.to_le_bytes());
        out[20..28].copy_from_slice(&self.offset.to_le_bytes());
        out[28..30].copy_from_slice(&self.data_len.to_le_bytes());
        // 30..32 reserved
        out[32..40].copy_from_slice(&self.generation.to_le_bytes());
        out
    }

    /// Field extraction only; structural policy lives in the security
    /// pipeline.
    pub fn from_wire(raw: &[u8]) -> Option<FrameHeader> {
        if raw.len() < AETHER_HEADER_LEN {
            return None;
        }
        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != AETHER_MAGIC || raw[4] != AETHER_VERSION {
            return None;
        }
        let msg_type = MsgType::from_wire(raw[5])?;
        Some(FrameHeader {
            msg_type,
            flags: FrameFlags::from_bits_truncate(u16::from_le_bytes([raw[6], raw[7]])),
            seq: u64::from_le_bytes(raw[8..16].try_into().ok()?),
            src_node: u16::from_le_bytes([raw[16], raw[17]]),
            dst_node: u16::from_le_bytes([raw[18], raw[19]]),
            offset: u64::from_le_bytes(raw[20..28].try_into().ok()?),
            data_len: u16::from_le_bytes([raw[28], raw[29]]),
            generation: u64::from_le_bytes(raw[32..40].try_into().ok()?),
        })
    }
}

/// Build a complete frame: ethernet header, Aether header, payload, MAC.
pub fn encode_frame(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    header: &FrameHeader,
    payload: &[u8],
    key: &[u8; 32],
) -> Vec<u8> {
    let wire = header.to_wire();
    let mut out = Vec::with_capacity(ETH_HEADER_LEN + AETHER_HEADER_LEN + payload.len() + DIGEST_LEN);
    out.extend_from_slice(&dst_mac);
    out.extend_from_slice(&src_mac);
    out.extend_from_slice(&AETHER_ETHERTYPE.to_be_bytes());
    out.extend_from_slice(&wire);
    out.extend_from_slice(payload);
    let digest = hmac_sha256(key, &[&wire, payload]);
    out.extend_from_slice(&digest);
    out
}

/// Strip the ethernet encapsulation, returning the Aether region.
pub fn strip_ethernet(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != AETHER_ETHERTYPE {
        return None;
    }
    Some(&frame[ETH_HEADER_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            msg_type: MsgType::PageRequest,
            flags: FrameFlags::WRITE,
            seq: 7,
            src_node: 2,
            dst_node: 0,
            offset: 0x1234_5000,
            data_len: 4,
            generation: 9,
        }
    }

    #[test]
    fn header_roundtrip_is_little_endian() {
        let header = sample_header();
        let wire = header.to_wire();
        assert_eq!(&wire[0..4], &[0x41, 0x45, 0x54, 0x48]); // "AETH"
        assert_eq!(wire[4], AETHER_VERSION);
        assert_eq!(wire[5], 1);
        assert_eq!(wire[8], 7); // seq low byte first
        let parsed = FrameHeader::from_wire(&wire).expect("parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn bad_magic_or_version_refused() {
        let mut wire = sample_header().to_wire();
        wire[0] ^= 1;
        assert!(FrameHeader::from_wire(&wire).is_none());
        let mut wire = sample_header().to_wire();
        wire[4] = 9;
        assert!(FrameHeader::from_wire(&wire).is_none());
        let mut wire = sample_header().to_wire();
        wire[5] = 0;
        assert!(FrameHeader::from_wire(&wire).is_none());
        wire[5] = 7;
        assert!(FrameHeader::from_wire(&wire).is_none());
    }

    #[test]
    fn encode_wraps_ethernet_and_signs() {
        let key = [0x11u8; 32];
        let frame = encode_frame(
            [0xFF; 6],
            [0x02, 0, 0, 0, 0, 1],
            &sample_header(),
            b"page",
            &key,
        );
        assert_eq!(
            frame.len(),
            ETH_HEADER_LEN + AETHER_HEADER_LEN + 4 + DIGEST_LEN
        );
        let aether = strip_ethernet(&frame).expect("strip");
        let parsed = FrameHeader::from_wire(aether).expect("parse");
        assert_eq!(parsed.data_len, 4);

        // digest covers header + payload
        let expected = crate::crypto::hmac_sha256(
            &key,
            &[&aether[..AETHER_HEADER_LEN], b"page"],
        );
        assert_eq!(&aether[aether.len() - DIGEST_LEN..], &expected);
    }

    #[test]
    fn strip_requires_the_ethertype() {
        let mut frame = encode_frame([0; 6], [0; 6], &sample_header(), b"", &[0; 32]);
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert!(strip_ethernet(&frame).is_none());
        assert!(strip_ethernet(&frame[..10]).is_none());
    }
}
