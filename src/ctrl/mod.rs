//! MCTP Control message support (DSP0236 chapter 10).
//!
//! The control protocol rides on message type 0x00. This module carries the
//! wire layouts of the commands this endpoint implements (Set/Get Endpoint
//! ID, Get Endpoint UUID, Get Version Support, Get Message Type Support)
//! and [`CtrlHandler`], the handler the endpoint installs for the control
//! type by default. Request builders and response parsers for the client
//! side live here too.

pub(crate) mod versions;

pub use versions::{Version, VersionTable, bcd_cmp};

use tracing::debug;

use crate::{
    handler::{Handler, HandlerCx, Reply},
    protocol::{MessageBuf, eid},
};

/// Serialized length of the control message header.
pub const CTRL_HDR_LEN: usize = 2;

/// Most version entries that fit a Get Version Support response.
pub const MAX_VERSION_ENTRIES: usize = 14;

/// Control command codes (DSP0236 table 12).
pub mod command {
    pub const RESERVED: u8 = 0x00;
    pub const SET_ENDPOINT_ID: u8 = 0x01;
    pub const GET_ENDPOINT_ID: u8 = 0x02;
    pub const GET_ENDPOINT_UUID: u8 = 0x03;
    pub const GET_VERSION_SUPPORT: u8 = 0x04;
    pub const GET_MESSAGE_TYPE_SUPPORT: u8 = 0x05;
}

/// Control completion codes (DSP0236 table 13).
pub mod cc {
    pub const SUCCESS: u8 = 0x00;
    pub const ERROR: u8 = 0x01;
    pub const ERROR_INVALID_DATA: u8 = 0x02;
    pub const ERROR_INVALID_LENGTH: u8 = 0x03;
    pub const ERROR_NOT_READY: u8 = 0x04;
    pub const ERROR_UNSUPPORTED_CMD: u8 = 0x05;
    /// Command-specific: the queried message type is unsupported.
    pub const UNSUPPORTED_TYPE: u8 = 0x80;
}

/// Set Endpoint ID operations (DSP0236 table 14).
pub mod set_eid_op {
    pub const SET: u8 = 0;
    pub const FORCE: u8 = 1;
    pub const RESET: u8 = 2;
    pub const DISCOVER: u8 = 3;
}

/// Set Endpoint ID assignment status.
pub mod assignment {
    pub const ACCEPTED: u8 = 0;
    pub const REJECTED: u8 = 1;
}

/// Endpoint types reported by Get Endpoint ID (DSP0236 table 15).
pub mod endpoint_type {
    pub const SIMPLE: u8 = 0;
    pub const BRIDGE: u8 = 1;
}

/// EID types reported by Get Endpoint ID (DSP0236 table 15).
pub mod id_type {
    pub const DYNAMIC: u8 = 0;
    pub const STATIC: u8 = 1;
    pub const STATIC_CURRENT: u8 = 2;
    pub const STATIC_DIFFERENT: u8 = 3;
}

/// Control message header: request/datagram bits, instance ID, command.
///
/// ```text
///  byte 0: |R|D|x| instance | (request bit 7, datagram bit 6, instance 4..0)
///  byte 1: command code
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CtrlHeader {
    pub request: bool,
    pub datagram: bool,
    pub instance: u8,
    pub command: u8,
}

impl CtrlHeader {
    const REQ: u8 = 1 << 7;
    const DATAGRAM: u8 = 1 << 6;
    const INSTANCE_MASK: u8 = 0x1F;

    /// Header of a fresh request for `command`.
    pub fn request(command: u8) -> Self {
        CtrlHeader {
            request: true,
            datagram: false,
            instance: 0,
            command,
        }
    }

    /// The matching response header: same instance and command, request bit
    /// cleared.
    pub fn response(&self) -> Self {
        CtrlHeader {
            request: false,
            ..*self
        }
    }

    pub fn encode(&self) -> [u8; CTRL_HDR_LEN] {
        let mut byte0 = self.instance & Self::INSTANCE_MASK;
        if self.datagram {
            byte0 |= Self::DATAGRAM;
        }
        if self.request {
            byte0 |= Self::REQ;
        }
        [byte0, self.command]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let byte0 = *bytes.first()?;
        let command = *bytes.get(1)?;
        Some(CtrlHeader {
            request: byte0 & Self::REQ != 0,
            datagram: byte0 & Self::DATAGRAM != 0,
            instance: byte0 & Self::INSTANCE_MASK,
            command,
        })
    }
}

/// Set Endpoint ID response body (DSP0236 table 14).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetEidResponse {
    pub completion_code: u8,
    pub assignment: u8,
    pub allocation: u8,
    pub eid: u8,
    pub pool_size: u8,
}

impl SetEidResponse {
    pub fn encode(&self) -> [u8; 4] {
        [
            self.completion_code,
            (self.allocation & 0b11) | ((self.assignment & 0b11) << 4),
            self.eid,
            self.pool_size,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        Some(SetEidResponse {
            completion_code: bytes[0],
            allocation: bytes[1] & 0b11,
            assignment: (bytes[1] >> 4) & 0b11,
            eid: bytes[2],
            pool_size: bytes[3],
        })
    }
}

/// Get Endpoint ID response body (DSP0236 table 15).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetEidResponse {
    pub completion_code: u8,
    pub eid: u8,
    pub id_type: u8,
    pub endpoint_type: u8,
    pub medium_specific: u8,
}

impl GetEidResponse {
    pub fn encode(&self) -> [u8; 4] {
        [
            self.completion_code,
            self.eid,
            (self.id_type & 0b11) | ((self.endpoint_type & 0b11) << 4),
            self.medium_specific,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        Some(GetEidResponse {
            completion_code: bytes[0],
            eid: bytes[1],
            id_type: bytes[2] & 0b11,
            endpoint_type: (bytes[2] >> 4) & 0b11,
            medium_specific: bytes[3],
        })
    }
}

// Request builders for the client side. Each returns the full control
// payload: header plus command body.

pub fn set_eid_request(new_eid: u8) -> Vec<u8> {
    let mut payload = CtrlHeader::request(command::SET_ENDPOINT_ID).encode().to_vec();
    payload.extend_from_slice(&[set_eid_op::SET, new_eid]);
    payload
}

pub fn get_eid_request() -> Vec<u8> {
    CtrlHeader::request(command::GET_ENDPOINT_ID).encode().to_vec()
}

pub fn get_uuid_request() -> Vec<u8> {
    CtrlHeader::request(command::GET_ENDPOINT_UUID).encode().to_vec()
}

pub fn get_version_request(msg_type: u8) -> Vec<u8> {
    let mut payload = CtrlHeader::request(command::GET_VERSION_SUPPORT).encode().to_vec();
    payload.push(msg_type);
    payload
}

pub fn get_message_types_request() -> Vec<u8> {
    CtrlHeader::request(command::GET_MESSAGE_TYPE_SUPPORT).encode().to_vec()
}

/// Splits a control payload into its header and command body.
pub fn split_payload(payload: &[u8]) -> Option<(CtrlHeader, &[u8])> {
    let hdr = CtrlHeader::decode(payload)?;
    Some((hdr, &payload[CTRL_HDR_LEN..]))
}

/// Parses a Get Endpoint UUID response body into the 16 UUID bytes.
pub fn parse_uuid_response(body: &[u8]) -> Option<(u8, [u8; 16])> {
    if body.len() < 17 {
        return None;
    }
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&body[1..17]);
    Some((body[0], uuid))
}

/// Parses a Get Version Support response body.
pub fn parse_version_response(body: &[u8]) -> Option<(u8, Vec<Version>)> {
    let code = *body.first()?;
    let count = *body.get(1)? as usize;
    let entries = body.get(2..2 + count * 4)?;
    let versions = entries
        .chunks_exact(4)
        .map(|v| Version::new(v[0], v[1], v[2], v[3]))
        .collect();
    Some((code, versions))
}

/// Parses a Get Message Type Support response body.
pub fn parse_message_types_response(body: &[u8]) -> Option<(u8, Vec<u8>)> {
    let code = *body.first()?;
    let count = *body.get(1)? as usize;
    Some((code, body.get(2..2 + count)?.to_vec()))
}

/// The control-protocol handler installed for message type 0x00.
pub struct CtrlHandler;

impl Handler for CtrlHandler {
    fn handle(&self, cx: &HandlerCx<'_>, request: &MessageBuf, reply: &mut MessageBuf) -> Reply {
        // Only tag owners issue control requests
        if !request.owner {
            return Reply::Drop;
        }
        let Some((hdr, body)) = split_payload(request.payload()) else {
            return Reply::Drop;
        };
        if !hdr.request {
            return Reply::Drop;
        }

        // EID gate: the request must be addressed to us, be a broadcast, or
        // arrive while our EID is still unassigned.
        {
            let state = cx.state();
            let addressed = request.dst == eid::NULL
                || request.dst == eid::BROADCAST
                || request.dst == state.eid
                || state.eid == eid::NULL;
            if !addressed {
                debug!(dst = request.dst, eid = state.eid, "Control request for another endpoint");
                return Reply::Drop;
            }
        }

        match hdr.command {
            command::SET_ENDPOINT_ID => set_eid(cx, &hdr, body, request, reply),
            command::GET_ENDPOINT_ID => get_eid(cx, &hdr, reply),
            command::GET_ENDPOINT_UUID => get_uuid(cx, &hdr, reply),
            command::GET_VERSION_SUPPORT => get_version_support(cx, &hdr, body, reply),
            command::GET_MESSAGE_TYPE_SUPPORT => get_message_type_support(cx, &hdr, reply),
            other => {
                debug!(command = other, "Unimplemented control command");
                Reply::Drop
            }
        }
    }
}

fn respond(reply: &mut MessageBuf, hdr: &CtrlHeader, body: &[u8]) -> Reply {
    let mut payload = hdr.response().encode().to_vec();
    payload.extend_from_slice(body);
    match reply.set_payload(&payload) {
        Ok(()) => Reply::Send,
        Err(_) => Reply::Drop,
    }
}

fn set_eid(
    cx: &HandlerCx<'_>,
    hdr: &CtrlHeader,
    body: &[u8],
    request: &MessageBuf,
    reply: &mut MessageBuf,
) -> Reply {
    let (Some(&operation), Some(&new_eid)) = (body.first(), body.get(1)) else {
        return Reply::Drop;
    };
    let operation = operation & 0b11;

    // Static EIDs and discovery are unsupported; assigning a reserved EID is
    // invalid. As with any rejected assignment, no response goes out and the
    // requester's retries run their course.
    if operation == set_eid_op::RESET
        || operation == set_eid_op::DISCOVER
        || new_eid == eid::NULL
        || new_eid == eid::BROADCAST
    {
        debug!(operation, new_eid, "Rejected Set Endpoint ID");
        return Reply::Drop;
    }

    let assigned = {
        let mut state = cx.state();
        state.eid = new_eid;
        state.bus_owner_eid = request.src;
        state.eid
    };

    let body = SetEidResponse {
        completion_code: cc::SUCCESS,
        assignment: assignment::ACCEPTED,
        allocation: 0,
        eid: assigned,
        pool_size: 0,
    };
    respond(reply, hdr, &body.encode())
}

fn get_eid(cx: &HandlerCx<'_>, hdr: &CtrlHeader, reply: &mut MessageBuf) -> Reply {
    let body = GetEidResponse {
        completion_code: cc::SUCCESS,
        eid: cx.state().eid,
        id_type: id_type::DYNAMIC,
        endpoint_type: endpoint_type::SIMPLE,
        medium_specific: 0,
    };
    respond(reply, hdr, &body.encode())
}

fn get_uuid(cx: &HandlerCx<'_>, hdr: &CtrlHeader, reply: &mut MessageBuf) -> Reply {
    let mut body = [0u8; 17];
    body[0] = cc::SUCCESS;
    body[1..].copy_from_slice(cx.state().uuid.as_bytes());
    respond(reply, hdr, &body)
}

fn get_version_support(cx: &HandlerCx<'_>, hdr: &CtrlHeader, body: &[u8], reply: &mut MessageBuf) -> Reply {
    let Some(&queried) = body.first() else {
        return Reply::Drop;
    };

    let mut out = vec![0u8, 0u8];
    match cx.versions().supported(queried) {
        Some(list) if !list.is_empty() => {
            let count = list.len().min(MAX_VERSION_ENTRIES);
            out[0] = cc::SUCCESS;
            out[1] = count as u8;
            for version in &list[..count] {
                out.extend_from_slice(&version.encode());
            }
        }
        _ => {
            out[0] = cc::UNSUPPORTED_TYPE;
        }
    }
    respond(reply, hdr, &out)
}

fn get_message_type_support(cx: &HandlerCx<'_>, hdr: &CtrlHeader, reply: &mut MessageBuf) -> Reply {
    let types = cx.supported_types();
    let mut out = vec![cc::SUCCESS, types.len() as u8];
    out.extend_from_slice(types);
    respond(reply, hdr, &out)
}
