//! Overlay wire format
//!
//! Every datagram exchanged through the transport:
//!
//! ```text
//! [Type: 1 byte][Length: 2 bytes BE][Payload: length bytes]
//! ```
//!
//! `IpPacket` payloads carry the 32-byte sender node ID followed by the raw
//! IP packet. Address fields inside control payloads are network byte order;
//! the two millisecond timestamp fields are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::NODE_ID_SIZE;
use crate::error::{ProtoError, ProtoResult};
use crate::node_id::{NodeId, PeerId};

/// Frame header size: type tag + 16-bit payload length
pub const HEADER_SIZE: usize = 3;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Encapsulated IP packet (sender node ID + packet bytes)
    IpPacket = 1,

    /// Route table export: repeated 12-byte peer/address tuples
    RouteUpdate = 3,

    /// Claim probe for a candidate address
    ProbeRequest = 10,

    /// Conflict response to a probe
    ProbeResponse = 11,

    /// Successful claim announcement
    AddressAnnounce = 12,

    /// Order a lower-priority holder to relinquish an address
    ForcedRelease = 13,

    /// Periodic lease renewal
    Heartbeat = 14,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        match value {
            1 => Ok(Self::IpPacket),
            3 => Ok(Self::RouteUpdate),
            10 => Ok(Self::ProbeRequest),
            11 => Ok(Self::ProbeResponse),
            12 => Ok(Self::AddressAnnounce),
            13 => Ok(Self::ForcedRelease),
            14 => Ok(Self::Heartbeat),
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

/// Probe for a candidate address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Requested address (host order)
    pub ip: u32,
    /// Requester's node ID
    pub node_id: NodeId,
}

/// Conflict response: the responder claims or contests the address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    /// Contested address (host order)
    pub ip: u32,
    /// Responder's node ID
    pub node_id: NodeId,
    /// Responder's last heartbeat, wall-clock milliseconds
    pub last_heartbeat_ms: i64,
}

/// Announcement of a successfully claimed address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressAnnounce {
    /// Claimed address (host order)
    pub ip: u32,
    /// Claimant's node ID
    pub node_id: NodeId,
}

/// Instruction to relinquish an address and renegotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedRelease {
    /// Address to release (host order)
    pub ip: u32,
    /// Winner's node ID
    pub winner: NodeId,
}

/// Lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Held address (host order)
    pub ip: u32,
    /// Sender's node ID
    pub node_id: NodeId,
    /// Send time, wall-clock milliseconds
    pub timestamp_ms: i64,
}

/// One entry of a `RouteUpdate` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTuple {
    /// Owning peer
    pub peer: PeerId,
    /// Owned address (host order)
    pub ip: u32,
}

/// Size of one serialized route tuple
pub const ROUTE_TUPLE_SIZE: usize = 12;

/// A decoded control-plane message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    ProbeRequest(ProbeRequest),
    ProbeResponse(ProbeResponse),
    AddressAnnounce(AddressAnnounce),
    ForcedRelease(ForcedRelease),
    Heartbeat(Heartbeat),
}

impl ControlMessage {
    /// The wire tag for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ProbeRequest(_) => MessageType::ProbeRequest,
            Self::ProbeResponse(_) => MessageType::ProbeResponse,
            Self::AddressAnnounce(_) => MessageType::AddressAnnounce,
            Self::ForcedRelease(_) => MessageType::ForcedRelease,
            Self::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    /// Append the payload bytes (without the frame header)
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::ProbeRequest(m) => {
                buf.put_u32(m.ip);
                buf.put_slice(m.node_id.as_bytes());
            }
            Self::ProbeResponse(m) => {
                buf.put_u32(m.ip);
                buf.put_slice(m.node_id.as_bytes());
                buf.put_i64_le(m.last_heartbeat_ms);
            }
            Self::AddressAnnounce(m) => {
                buf.put_u32(m.ip);
                buf.put_slice(m.node_id.as_bytes());
            }
            Self::ForcedRelease(m) => {
                buf.put_u32(m.ip);
                buf.put_slice(m.winner.as_bytes());
            }
            Self::Heartbeat(m) => {
                buf.put_u32(m.ip);
                buf.put_slice(m.node_id.as_bytes());
                buf.put_i64_le(m.timestamp_ms);
            }
        }
    }

    /// Decode a control payload of the given type
    pub fn decode(ty: MessageType, payload: &[u8]) -> ProtoResult<Self> {
        match ty {
            MessageType::ProbeRequest => {
                let mut buf = check_len(payload, 4 + NODE_ID_SIZE)?;
                Ok(Self::ProbeRequest(ProbeRequest {
                    ip: buf.get_u32(),
                    node_id: get_node_id(&mut buf),
                }))
            }
            MessageType::ProbeResponse => {
                let mut buf = check_len(payload, 4 + NODE_ID_SIZE + 8)?;
                Ok(Self::ProbeResponse(ProbeResponse {
                    ip: buf.get_u32(),
                    node_id: get_node_id(&mut buf),
                    last_heartbeat_ms: buf.get_i64_le(),
                }))
            }
            MessageType::AddressAnnounce => {
                let mut buf = check_len(payload, 4 + NODE_ID_SIZE)?;
                Ok(Self::AddressAnnounce(AddressAnnounce {
                    ip: buf.get_u32(),
                    node_id: get_node_id(&mut buf),
                }))
            }
            MessageType::ForcedRelease => {
                let mut buf = check_len(payload, 4 + NODE_ID_SIZE)?;
                Ok(Self::ForcedRelease(ForcedRelease {
                    ip: buf.get_u32(),
                    winner: get_node_id(&mut buf),
                }))
            }
            MessageType::Heartbeat => {
                let mut buf = check_len(payload, 4 + NODE_ID_SIZE + 8)?;
                Ok(Self::Heartbeat(Heartbeat {
                    ip: buf.get_u32(),
                    node_id: get_node_id(&mut buf),
                    timestamp_ms: buf.get_i64_le(),
                }))
            }
            MessageType::IpPacket | MessageType::RouteUpdate => {
                Err(ProtoError::UnknownType(ty as u8))
            }
        }
    }

    /// Serialize as a complete frame (header + payload)
    pub fn encode_frame(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(4 + NODE_ID_SIZE + 8);
        self.encode_payload(&mut payload);
        encode_frame(self.message_type(), &payload)
    }
}

/// Wrap a payload in a frame header
pub fn encode_frame(ty: MessageType, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(ty as u8);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Frame an outgoing IP packet into `scratch` and split it off.
///
/// `scratch` keeps its capacity between calls, so the per-packet cost on
/// the data plane is a copy, not an allocation.
pub fn frame_ip_packet(scratch: &mut BytesMut, sender: &NodeId, packet: &[u8]) -> ProtoResult<Bytes> {
    let payload_len = NODE_ID_SIZE + packet.len();
    if payload_len > MAX_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge(payload_len));
    }

    scratch.clear();
    scratch.reserve(HEADER_SIZE + payload_len);
    scratch.put_u8(MessageType::IpPacket as u8);
    scratch.put_u16(payload_len as u16);
    scratch.put_slice(sender.as_bytes());
    scratch.put_slice(packet);
    Ok(scratch.split().freeze())
}

/// Split a datagram into its type tag and declared payload.
///
/// Bytes beyond the declared length are ignored; a declared length past the
/// end of the buffer is an error.
pub fn decode_frame(data: &[u8]) -> ProtoResult<(MessageType, &[u8])> {
    if data.len() < HEADER_SIZE {
        return Err(ProtoError::Truncated {
            needed: HEADER_SIZE,
            actual: data.len(),
        });
    }

    let ty = MessageType::try_from(data[0])?;
    let declared = usize::from(u16::from_be_bytes([data[1], data[2]]));

    if data.len() < HEADER_SIZE + declared {
        return Err(ProtoError::Truncated {
            needed: HEADER_SIZE + declared,
            actual: data.len(),
        });
    }

    Ok((ty, &data[HEADER_SIZE..HEADER_SIZE + declared]))
}

/// Append one route tuple: 8-byte little-endian peer, 4-byte network-order IP.
pub fn encode_route_tuple(buf: &mut BytesMut, peer: PeerId, ip: u32) {
    buf.put_slice(&peer.to_le_bytes());
    buf.put_u32(ip);
}

/// Decode a `RouteUpdate` payload into tuples.
pub fn decode_route_tuples(payload: &[u8]) -> ProtoResult<Vec<RouteTuple>> {
    if payload.len() % ROUTE_TUPLE_SIZE != 0 {
        return Err(ProtoError::UnevenRoutePayload(payload.len()));
    }

    let mut buf = payload;
    let mut tuples = Vec::with_capacity(payload.len() / ROUTE_TUPLE_SIZE);
    while buf.has_remaining() {
        let peer = PeerId(buf.get_u64_le());
        let ip = buf.get_u32();
        tuples.push(RouteTuple { peer, ip });
    }
    Ok(tuples)
}

fn check_len(payload: &[u8], needed: usize) -> ProtoResult<&[u8]> {
    if payload.len() < needed {
        Err(ProtoError::Truncated {
            needed,
            actual: payload.len(),
        })
    } else {
        Ok(payload)
    }
}

fn get_node_id(buf: &mut &[u8]) -> NodeId {
    let mut bytes = [0u8; NODE_ID_SIZE];
    buf.copy_to_slice(&mut bytes);
    NodeId::from_bytes(bytes)
}
