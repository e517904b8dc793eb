//! # Overlay Packets
//!
//! This module defines every packet exchanged by the overlay substrate. The set
//! of message types is closed: [`Payload`] is a tagged union and [`PacketType`]
//! its fieldless discriminant, used as the key of the router's dispatch table.
//!
//! ## Packet Kinds
//!
//! A packet carries zero or more *kinds*, each with its own hop metadata. Which
//! kinds a type may carry is fixed per type (see [`PacketType::kinds`]):
//!
//! | Type | Respondable | Response | Broadcastable |
//! |------|:-----------:|:--------:|:-------------:|
//! | `ConnectionRequest` | ✓ | | |
//! | `ConnectionResponse` | | ✓ | |
//! | `Disconnect` | | | |
//! | `DiscoveryBroadcast` | | | ✓ |
//! | `Ping` | ✓ | | |
//! | `Pong` | | ✓ | |
//! | `SubscriptionRequest` | ✓ | | |
//! | `SubscriptionResponse` | | ✓ | |
//! | `Application` | ✓ | | ✓ |
//! | `ApplicationReply` | | ✓ | |
//!
//! ## Header
//!
//! The [`PacketHeader`] is stamped by the router on every send (fresh unique id,
//! sender, dense type id, send time). Relays re-stamp it, which is why the
//! broadcaster clones packets before fanning them out.
//!
//! ## Framing
//!
//! When packets cross a channel as bytes they are bincode-encoded with fixed
//! integer widths. Decoding enforces [`MAX_FRAME_SIZE`].

use std::time::Duration;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::{Address, Contact, NodeId};

/// Largest frame accepted by [`decode_packet`].
pub const MAX_FRAME_SIZE: u64 = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(packet)
}

/// Decode a frame, rejecting anything larger than [`MAX_FRAME_SIZE`].
pub fn decode_packet(frame: &[u8]) -> Result<Packet, bincode::Error> {
    bincode_options().deserialize(frame)
}

/// Fieldless discriminant of [`Payload`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    ConnectionRequest,
    ConnectionResponse,
    Disconnect,
    DiscoveryBroadcast,
    Ping,
    Pong,
    SubscriptionRequest,
    SubscriptionResponse,
    Application,
    ApplicationReply,
}

/// Capabilities a packet type is allowed to carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketKinds {
    pub respondable: bool,
    pub response: bool,
    pub broadcastable: bool,
}

impl PacketType {
    pub const ALL: [PacketType; 10] = [
        PacketType::ConnectionRequest,
        PacketType::ConnectionResponse,
        PacketType::Disconnect,
        PacketType::DiscoveryBroadcast,
        PacketType::Ping,
        PacketType::Pong,
        PacketType::SubscriptionRequest,
        PacketType::SubscriptionResponse,
        PacketType::Application,
        PacketType::ApplicationReply,
    ];

    pub fn kinds(self) -> PacketKinds {
        const PLAIN: PacketKinds = PacketKinds { respondable: false, response: false, broadcastable: false };
        match self {
            PacketType::ConnectionRequest | PacketType::Ping | PacketType::SubscriptionRequest => {
                PacketKinds { respondable: true, ..PLAIN }
            }
            PacketType::ConnectionResponse
            | PacketType::Pong
            | PacketType::SubscriptionResponse
            | PacketType::ApplicationReply => PacketKinds { response: true, ..PLAIN },
            PacketType::DiscoveryBroadcast => PacketKinds { broadcastable: true, ..PLAIN },
            PacketType::Application => PacketKinds { respondable: true, broadcastable: true, ..PLAIN },
            PacketType::Disconnect => PLAIN,
        }
    }
}

/// Message bodies. One variant per concrete packet type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Ask a peer to admit us into its connection table.
    ConnectionRequest {
        connection_count: usize,
    },
    ConnectionResponse {
        accepted: bool,
        connection_count: usize,
        responder: Contact,
    },
    /// Best-effort, unacknowledged teardown notice.
    Disconnect,
    /// Epidemic advertisement that `origin` is looking for connections.
    DiscoveryBroadcast {
        origin: Contact,
        originated_at: Duration,
        connection_count: usize,
    },
    /// Handshake and heartbeat ping.
    Ping,
    Pong {
        connection_count: usize,
    },
    SubscriptionRequest,
    SubscriptionResponse {
        candidates: Vec<Contact>,
    },
    /// Opaque message for protocols layered on top of the overlay.
    Application {
        channel: String,
        data: Vec<u8>,
    },
    ApplicationReply {
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::ConnectionRequest { .. } => PacketType::ConnectionRequest,
            Payload::ConnectionResponse { .. } => PacketType::ConnectionResponse,
            Payload::Disconnect => PacketType::Disconnect,
            Payload::DiscoveryBroadcast { .. } => PacketType::DiscoveryBroadcast,
            Payload::Ping => PacketType::Ping,
            Payload::Pong { .. } => PacketType::Pong,
            Payload::SubscriptionRequest => PacketType::SubscriptionRequest,
            Payload::SubscriptionResponse { .. } => PacketType::SubscriptionResponse,
            Payload::Application { .. } => PacketType::Application,
            Payload::ApplicationReply { .. } => PacketType::ApplicationReply,
        }
    }
}

/// Hop-local metadata, re-stamped by the router on every send.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub unique_id: u64,
    pub sender_id: Option<NodeId>,
    pub type_id: u16,
    pub sent_at: Duration,
}

/// Where to send the response to a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespondableInfo {
    pub sender_address: Address,
}

/// Correlation of a response with the request it answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// `unique_id` of the request packet.
    pub caller_id: u64,
    /// Filled in by the receiving router when the pending request resolves.
    pub round_trip: Duration,
}

/// Identity of a broadcast, constant across all of its relays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastInfo {
    pub broadcaster_id: NodeId,
    pub broadcast_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub header: PacketHeader,
    pub respondable: Option<RespondableInfo>,
    pub response: Option<ResponseInfo>,
    pub broadcast: Option<BroadcastInfo>,
    pub payload: Payload,
}

impl Packet {
    pub fn new(payload: Payload) -> Self {
        Self {
            header: PacketHeader::default(),
            respondable: None,
            response: None,
            broadcast: None,
            payload,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }

    pub fn kinds(&self) -> PacketKinds {
        self.packet_type().kinds()
    }

    /// True if this packet answers an earlier request.
    pub fn is_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn sender(&self) -> Option<NodeId> {
        self.header.sender_id
    }

    /// Where a reply to this packet should go, if it was sent as a request.
    pub fn reply_address(&self) -> Option<Address> {
        self.respondable.map(|r| r.sender_address)
    }

    pub fn round_trip(&self) -> Option<Duration> {
        self.response.map(|r| r.round_trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(kind: PacketType) -> Payload {
        let contact = Contact::new(NodeId(1), Address(1));
        match kind {
            PacketType::ConnectionRequest => Payload::ConnectionRequest { connection_count: 1 },
            PacketType::ConnectionResponse => Payload::ConnectionResponse {
                accepted: true,
                connection_count: 2,
                responder: contact,
            },
            PacketType::Disconnect => Payload::Disconnect,
            PacketType::DiscoveryBroadcast => Payload::DiscoveryBroadcast {
                origin: contact,
                originated_at: Duration::ZERO,
                connection_count: 0,
            },
            PacketType::Ping => Payload::Ping,
            PacketType::Pong => Payload::Pong { connection_count: 0 },
            PacketType::SubscriptionRequest => Payload::SubscriptionRequest,
            PacketType::SubscriptionResponse => Payload::SubscriptionResponse { candidates: vec![contact] },
            PacketType::Application => Payload::Application { channel: "c".into(), data: vec![1] },
            PacketType::ApplicationReply => Payload::ApplicationReply { data: vec![] },
        }
    }

    #[test]
    fn payload_discriminant_matches_every_type() {
        for kind in PacketType::ALL {
            assert_eq!(sample_payload(kind).packet_type(), kind);
        }
    }

    #[test]
    fn response_types_are_never_requests() {
        for kind in PacketType::ALL {
            let kinds = kind.kinds();
            assert!(!(kinds.response && kinds.respondable), "{kind:?} is both request and response");
            assert!(!(kinds.response && kinds.broadcastable), "{kind:?} is a broadcast response");
        }
    }

    #[test]
    fn application_is_respondable_and_broadcastable() {
        let kinds = PacketType::Application.kinds();
        assert!(kinds.respondable);
        assert!(kinds.broadcastable);
        assert!(!kinds.response);
    }

    #[test]
    fn frame_preserves_header_and_payload() {
        let mut packet = Packet::new(sample_payload(PacketType::DiscoveryBroadcast));
        packet.header = PacketHeader {
            unique_id: 42,
            sender_id: Some(NodeId(3)),
            type_id: 3,
            sent_at: Duration::from_millis(250),
        };
        packet.broadcast = Some(BroadcastInfo { broadcaster_id: NodeId(1), broadcast_id: 9 });

        let decoded = decode_packet(&encode_packet(&packet).unwrap()).unwrap();
        assert_eq!(decoded.header.type_id, 3);
        assert_eq!(decoded.sender(), Some(NodeId(3)));
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn oversized_and_truncated_frames_are_rejected() {
        let big = Packet::new(Payload::Application {
            channel: "bulk".into(),
            data: vec![0u8; MAX_FRAME_SIZE as usize],
        });
        assert!(encode_packet(&big).is_err());

        let frame = encode_packet(&Packet::new(Payload::Ping)).unwrap();
        assert!(decode_packet(&frame[..frame.len() / 2]).is_err());
    }

    #[test]
    fn new_packet_carries_no_kinds() {
        let packet = Packet::new(Payload::Ping);
        assert!(!packet.is_response());
        assert!(packet.reply_address().is_none());
        assert!(packet.broadcast.is_none());
        assert_eq!(packet.sender(), None);
    }
}
