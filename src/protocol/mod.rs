pub(crate) mod message;
pub(crate) mod packet;
pub(crate) mod seq;

pub use message::{MessageBuf, PayloadOverflow};
pub use packet::{Header, Packet};
pub use seq::PktSeq;

pub(crate) use packet::PacketSlot;

/// Serialized length of the MCTP transport header.
pub const HDR_LEN: usize = 4;

/// Baseline Transmission Unit: payload bytes carried by every packet.
pub const BTU: usize = 64;

/// Serialized length of one packet on the wire.
pub const PKT_LEN: usize = HDR_LEN + BTU;

/// Maximum payload length of a reassembled message.
pub const MAX_PAYLOAD: usize = 8192;

/// Number of message tags (3-bit tag space).
pub const NUM_TAGS: usize = 8;

/// The MCTP header version this library speaks.
pub const MCTP_VERSION: u8 = 1;

/// Mask of the 7-bit message-type code within the SOM packet's first payload
/// byte. The remaining high bit is the integrity-check indicator, which is
/// transmitted as 0 and ignored on receive.
pub const TYPE_MASK: u8 = 0x7F;

/// Special endpoint ID values (DSP0236 table 2).
pub mod eid {
    /// The null EID: an endpoint that has not been assigned an identity.
    pub const NULL: u8 = 0x00;
    /// The broadcast EID.
    pub const BROADCAST: u8 = 0xFF;
}

/// MCTP message-type codes (DSP0239 table 1).
pub mod msg_type {
    pub const CONTROL: u8 = 0x00;
    pub const PLDM: u8 = 0x01;
    pub const NCSI: u8 = 0x02;
    pub const ETHERNET: u8 = 0x03;
    pub const NVME_MI: u8 = 0x04;
    pub const SPDM: u8 = 0x05;
    pub const SECURE: u8 = 0x06;
    pub const CXL_FMAPI: u8 = 0x07;
    pub const CXL_CCI: u8 = 0x08;
    pub const VDM_PCI: u8 = 0x7E;
    pub const VDM_IANA: u8 = 0x7F;
    /// Version-support query code for the MCTP base protocol (DSP0236)
    /// itself.
    pub const BASE: u8 = 0xFF;
}
