//! Wire message shapes for the signaling channel (spec §4.2), bincode-coded
//! per the workspace's choice of a single deterministic structured encoding
//! (`SPEC_FULL.md` §6), grounded in MirrorX's request/response envelope
//! shape (`examples/other_examples/..._message.rs.rs`) but redefined around
//! this spec's own operation set.

use serde::{Deserialize, Serialize};

/// One outbound request, tagged with the sequence id its response will
/// carry back.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub seq: u16,
    pub body: RequestBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RequestBody {
    Register {
        device_id: Option<i64>,
        fingerprint: Vec<u8>,
    },
    Subscribe {
        device_id: i64,
        fingerprint: Vec<u8>,
        config_path: String,
    },
    Heartbeat {
        device_id: i64,
        timestamp: i64,
    },
    Visit {
        domain: String,
        local_id: i64,
        remote_id: i64,
        resource_type: u8,
    },
    VisitReply {
        domain: String,
        active_id: i64,
        passive_id: i64,
        allow: bool,
    },
    KeyExchangeInit {
        domain: String,
        local_id: i64,
        remote_id: i64,
        fingerprint: Vec<u8>,
        public_key: [u8; 32],
    },
    KeyExchangeReply {
        domain: String,
        active_id: i64,
        passive_id: i64,
        fingerprint: Vec<u8>,
        public_key: [u8; 32],
        confirmation_tag: [u8; 32],
    },
    /// Active side's half of mutual confirmation, sent once it has derived
    /// its secrets and verified the passive's tag; relayed to the passive
    /// side as a [`crate::PushEvent::KeyExchangeConfirm`].
    KeyExchangeConfirm {
        domain: String,
        active_id: i64,
        passive_id: i64,
        confirmation_tag: [u8; 32],
    },
}

/// One inbound response frame, correlated to a `Request` by `seq`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u16,
    pub response: Response,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Error(ServerError),
    Registered {
        device_id: i64,
        expiry_timestamp: i64,
    },
    Subscribed,
    HeartbeatAck,
    VisitResult {
        allow: bool,
    },
    VisitReplyAck,
    KeyExchangeResult {
        visit_credentials: Vec<u8>,
        endpoint_addr: String,
        peer_public_key: [u8; 32],
        peer_fingerprint: Vec<u8>,
        peer_confirmation_tag: [u8; 32],
    },
    KeyExchangeReplyAck {
        visit_credentials: Vec<u8>,
    },
    KeyExchangeConfirmAck,
}

/// Server-reported failures (spec §4.2); distinct from transport/protocol
/// failures, which surface as `SignalingError` variants instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerError {
    UnknownDevice,
    DeviceExpired,
    DomainNotFound,
    VisitDenied,
    PeerUnreachable,
    RateLimited,
    Internal(String),
}
