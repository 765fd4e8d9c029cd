use std::time::Duration;

use super::{BTU, HDR_LEN, PKT_LEN, seq::PktSeq};

mod flag {
    /// Start-of-message bit of header byte 3.
    pub(super) const SOM: u8 = 1 << 7;
    /// End-of-message bit of header byte 3.
    pub(super) const EOM: u8 = 1 << 6;
    /// Tag-owner bit of header byte 3.
    pub(super) const TO: u8 = 1 << 3;
    /// Shift of the 2-bit packet sequence within header byte 3.
    pub(super) const SEQ_SHIFT: u32 = 4;
    /// Mask of the 3-bit message tag within header byte 3.
    pub(super) const TAG_MASK: u8 = 0b111;
    /// Mask of the 4-bit header version within header byte 0.
    pub(super) const VER_MASK: u8 = 0x0F;
}

/// MCTP transport header (DSP0236 table 1).
///
/// Serialized as 4 bytes on the wire:
///
/// ```text
///  byte 0          byte 1        byte 2        byte 3
/// +------+------+ +-----------+ +-----------+ +-+-+----+--+-----+
/// | rsvd | ver  | | dest EID  | | src  EID  | |S|E|seq |TO| tag |
/// +------+------+ +-----------+ +-----------+ +-+-+----+--+-----+
///   7..4   3..0                                 7 6 5..4 3  2..0
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Header version. Always 1 on transmit; anything else is dropped on
    /// receive.
    pub version: u8,
    /// Destination endpoint ID.
    pub dest: u8,
    /// Source endpoint ID.
    pub src: u8,
    /// Start-of-message flag: this packet opens a message and carries the
    /// message-type byte as its first payload byte.
    pub som: bool,
    /// End-of-message flag: this packet closes the message.
    pub eom: bool,
    /// Packet sequence number, modulo 4.
    pub seq: PktSeq,
    /// Tag-owner flag: the source originated the tag (request) rather than
    /// responding to it.
    pub owner: bool,
    /// 3-bit message tag correlating requests and responses.
    pub tag: u8,
}

impl Header {
    /// Serializes the header into its 4-byte wire form.
    pub fn encode(&self) -> [u8; HDR_LEN] {
        let mut byte3 = (self.seq.get() << flag::SEQ_SHIFT) | (self.tag & flag::TAG_MASK);
        if self.som {
            byte3 |= flag::SOM;
        }
        if self.eom {
            byte3 |= flag::EOM;
        }
        if self.owner {
            byte3 |= flag::TO;
        }
        [self.version & flag::VER_MASK, self.dest, self.src, byte3]
    }

    /// Deserializes a header from its 4-byte wire form.
    ///
    /// No validation happens here; the reassembler checks the version field
    /// and drops unsupported packets.
    pub fn decode(bytes: &[u8; HDR_LEN]) -> Self {
        let byte3 = bytes[3];
        Header {
            version: bytes[0] & flag::VER_MASK,
            dest: bytes[1],
            src: bytes[2],
            som: byte3 & flag::SOM != 0,
            eom: byte3 & flag::EOM != 0,
            seq: PktSeq::new(byte3 >> flag::SEQ_SHIFT),
            owner: byte3 & flag::TO != 0,
            tag: byte3 & flag::TAG_MASK,
        }
    }
}

/// One MCTP packet: a transport header followed by a fixed 64-byte BTU
/// payload. Serialized as exactly 68 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet {
    pub hdr: Header,
    pub payload: [u8; BTU],
}

impl Packet {
    pub(crate) const fn zeroed() -> Self {
        Packet {
            hdr: Header {
                version: 0,
                dest: 0,
                src: 0,
                som: false,
                eom: false,
                seq: PktSeq::new(0),
                owner: false,
                tag: 0,
            },
            payload: [0u8; BTU],
        }
    }

    /// Serializes the packet into a 68-byte wire record.
    pub fn to_wire(&self) -> [u8; PKT_LEN] {
        let mut wire = [0u8; PKT_LEN];
        wire[..HDR_LEN].copy_from_slice(&self.hdr.encode());
        wire[HDR_LEN..].copy_from_slice(&self.payload);
        wire
    }

    /// Deserializes a packet from a 68-byte wire record.
    pub fn from_wire(wire: &[u8; PKT_LEN]) -> Self {
        let mut hdr_bytes = [0u8; HDR_LEN];
        hdr_bytes.copy_from_slice(&wire[..HDR_LEN]);
        let mut payload = [0u8; BTU];
        payload.copy_from_slice(&wire[HDR_LEN..]);
        Packet {
            hdr: Header::decode(&hdr_bytes),
            payload,
        }
    }
}

/// A pooled packet plus its bookkeeping: arrival timestamp and the forward
/// link used to chain the packets of one outbound action in transmit order.
#[derive(Debug)]
pub(crate) struct PacketSlot {
    /// Monotonic arrival time, relative to the pipeline epoch.
    pub(crate) ts: Duration,
    /// Next packet of the same outbound action.
    pub(crate) next: Option<Box<PacketSlot>>,
    pub(crate) pkt: Packet,
}

impl PacketSlot {
    pub(crate) fn new() -> Self {
        PacketSlot {
            ts: Duration::ZERO,
            next: None,
            pkt: Packet::zeroed(),
        }
    }

    /// Resets the slot for return to the pool.
    pub(crate) fn recycle(&mut self) {
        self.ts = Duration::ZERO;
        self.next = None;
        self.pkt = Packet::zeroed();
    }
}

/// Number of packets chained from `head`.
#[cfg(test)]
pub(crate) fn chain_len(head: &Option<Box<PacketSlot>>) -> usize {
    let mut n = 0;
    let mut cur = head.as_deref();
    while let Some(slot) = cur {
        n += 1;
        cur = slot.next.as_deref();
    }
    n
}
