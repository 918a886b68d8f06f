//! Signaling Client (spec §4.2): request/response multiplexing over one
//! [`duallink_wire`] transport to the rendezvous service, plus the
//! server-push channel carrying inbound visit requests.
//!
//! Request/response multiplexing is grounded in MirrorX's `EndPoint::call`
//! / `call_reply_tx_map: DashMap<u16, Sender<...>>` pattern
//! (`examples/other_examples/..._endpoint.rs.rs`), adapted here for
//! rendezvous signaling rather than the endpoint channel: a monotonic
//! `AtomicU16` sequence id keys a `DashMap<u16, oneshot::Sender<Response>>`,
//! and a 10 s per-request timeout is enforced with `tokio::time::timeout`
//! (spec §5).

mod messages;
mod state;

pub use messages::*;
pub use state::SignalingState;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use duallink_core::{AeadKeyPair, VisitCredentials};
use duallink_crypto::{KeyExchange, Role, SessionSecrets};
use duallink_wire::{FrameKind, FrameReader, FrameWriter, WireError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, instrument, warn};

/// Per-request timeout (spec §5).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeat cadence and miss deadline (spec §5).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const HEARTBEAT_MISSES_BEFORE_RESET: u32 = 3;

/// The `Signaling` error category (spec §7): transport, protocol, and
/// server-reported failures. Transport/protocol errors tear the session
/// down; server-reported errors (`Server(..)`) are returned to the caller
/// without tearing anything down.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("rendezvous unreachable")]
    Unreachable,
    #[error("request timed out")]
    Timeout,
    #[error("server error: {0:?}")]
    Server(ServerError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("signaling session closed")]
    SessionClosed,
    #[error("transport: {0}")]
    Wire(#[from] WireError),
    #[error("heartbeat lost after {HEARTBEAT_MISSES_BEFORE_RESET} consecutive misses")]
    HeartbeatLost,
}

/// One inbound server-push event (spec §4.2's `VisitRequest` / the
/// key-exchange mirroring step a passive peer must perform when the server
/// relays an active peer's exchange attempt).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PushEvent {
    VisitRequest { domain: String, active_id: i64, resource_type: u8 },
    KeyExchangeRequest {
        domain: String,
        active_id: i64,
        passive_id: i64,
        fingerprint: Vec<u8>,
        public_key: [u8; 32],
    },
    /// Relayed half of mutual confirmation: the active side's HMAC tag,
    /// routed to the waiting [`SignalingClient::respond_key_exchange`] call
    /// rather than the general push queue (see `confirm_pending`).
    KeyExchangeConfirm {
        domain: String,
        active_id: i64,
        passive_id: i64,
        confirmation_tag: [u8; 32],
    },
}

/// Outcome of a completed, mutually confirmed key exchange (spec §4.2).
pub struct KeyExchangeOutcome {
    pub visit_credentials: VisitCredentials,
    pub endpoint_addr: String,
    pub aead: AeadKeyPair,
}

type PendingMap = DashMap<u16, oneshot::Sender<Response>>;
/// Passive-side waiters for a relayed [`PushEvent::KeyExchangeConfirm`],
/// keyed by `(active_id, passive_id)` so the confirm tag reaches the one
/// `respond_key_exchange` call waiting on it instead of the general push
/// queue `next_push()` drains.
type ConfirmMap = DashMap<(i64, i64), oneshot::Sender<[u8; 32]>>;

/// A signaling connection to one rendezvous realm (spec §3
/// `SignalingSession`). Single-owner; opened by [`SignalingClient::dial`],
/// closed by [`SignalingClient::disconnect`] or a transport error.
pub struct SignalingClient {
    writer: Mutex<FrameWriter>,
    pending: Arc<PendingMap>,
    confirm_pending: Arc<ConfirmMap>,
    push_rx: Mutex<mpsc::Receiver<PushEvent>>,
    seq: AtomicU16,
    state: Mutex<SignalingState>,
    heartbeat_misses: std::sync::atomic::AtomicU32,
}

impl SignalingClient {
    /// Dials `uri` (`tcp://host:port` plain, `tcps://host:port` TLS) and
    /// spawns the reader task that demultiplexes responses/pushes.
    #[instrument(skip_all, fields(uri))]
    pub async fn dial(uri: &str) -> Result<Self, SignalingError> {
        let (scheme, authority) = uri
            .split_once("://")
            .ok_or_else(|| SignalingError::DialFailed(format!("malformed uri: {uri}")))?;

        let tcp = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(authority))
            .await
            .map_err(|_| SignalingError::Unreachable)?
            .map_err(|e| SignalingError::DialFailed(e.to_string()))?;
        tcp.set_nodelay(true).ok();

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let confirm_pending: Arc<ConfirmMap> = Arc::new(DashMap::new());
        let (push_tx, push_rx) = mpsc::channel(64);

        match scheme {
            "tcp" => {
                let (reader, writer) = duallink_wire::split(tcp);
                spawn_reader(reader, pending.clone(), confirm_pending.clone(), push_tx);
                Ok(Self {
                    writer: Mutex::new(writer),
                    pending,
                    confirm_pending,
                    push_rx: Mutex::new(push_rx),
                    seq: AtomicU16::new(0),
                    state: Mutex::new(SignalingState::Connected),
                    heartbeat_misses: std::sync::atomic::AtomicU32::new(0),
                })
            }
            "tcps" => {
                let connector = tls::client_connector();
                let domain = rustls::pki_types::ServerName::try_from(
                    authority.split(':').next().unwrap_or(authority).to_string(),
                )
                .map_err(|_| SignalingError::DialFailed("invalid TLS server name".into()))?;
                let tls_stream = connector
                    .connect(domain, tcp)
                    .await
                    .map_err(|e| SignalingError::DialFailed(e.to_string()))?;
                let (reader, writer) = duallink_wire::split(tls_stream);
                spawn_reader(reader, pending.clone(), confirm_pending.clone(), push_tx);
                Ok(Self {
                    writer: Mutex::new(writer),
                    pending,
                    confirm_pending,
                    push_rx: Mutex::new(push_rx),
                    seq: AtomicU16::new(0),
                    state: Mutex::new(SignalingState::Connected),
                    heartbeat_misses: std::sync::atomic::AtomicU32::new(0),
                })
            }
            other => Err(SignalingError::DialFailed(format!("unsupported scheme: {other}"))),
        }
    }

    pub async fn disconnect(&self) {
        *self.state.lock().await = SignalingState::Closing;
        self.pending.clear();
        self.confirm_pending.clear();
    }

    /// Receives the next server-push event (spec §4.2 `subscribe`'s
    /// installed channel).
    pub async fn next_push(&self) -> Option<PushEvent> {
        self.push_rx.lock().await.recv().await
    }

    async fn call(&self, body: RequestBody) -> Result<Response, SignalingError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        let payload = bincode::serialize(&Request { seq, body })
            .expect("Request is always serializable");

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(FrameKind::SignalingRequest, Bytes::from(payload)) {
                self.pending.remove(&seq);
                return Err(e.into());
            }
        }

        let result = tokio::time::timeout(REQUEST_TIMEOUT, rx).await;
        match result {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(SignalingError::SessionClosed),
            Err(_) => {
                self.pending.remove(&seq);
                Err(SignalingError::Timeout)
            }
        }
    }

    fn expect<T>(resp: Response, extract: impl FnOnce(Response) -> Option<T>) -> Result<T, SignalingError> {
        match resp {
            Response::Error(e) => Err(SignalingError::Server(e)),
            other => extract(other).ok_or_else(|| {
                SignalingError::Protocol("unexpected response variant".into())
            }),
        }
    }

    pub async fn register(
        &self,
        device_id: Option<i64>,
        fingerprint: Vec<u8>,
    ) -> Result<(i64, i64), SignalingError> {
        let resp = self.call(RequestBody::Register { device_id, fingerprint }).await?;
        Self::expect(resp, |r| match r {
            Response::Registered { device_id, expiry_timestamp } => Some((device_id, expiry_timestamp)),
            _ => None,
        })
    }

    pub async fn subscribe(
        &self,
        device_id: i64,
        fingerprint: Vec<u8>,
        config_path: String,
    ) -> Result<(), SignalingError> {
        let resp = self
            .call(RequestBody::Subscribe { device_id, fingerprint, config_path })
            .await?;
        Self::expect(resp, |r| matches!(r, Response::Subscribed).then_some(()))?;
        *self.state.lock().await = SignalingState::Subscribed;
        Ok(())
    }

    /// Sends one heartbeat; call every [`HEARTBEAT_INTERVAL`]. Three
    /// consecutive failures surface [`SignalingError::HeartbeatLost`] and
    /// the caller is responsible for resetting the session (spec §4.2,
    /// §5 — reconnect is never automatic).
    pub async fn heartbeat(&self, device_id: i64, timestamp: i64) -> Result<(), SignalingError> {
        match self.call(RequestBody::Heartbeat { device_id, timestamp }).await {
            Ok(resp) => {
                Self::expect(resp, |r| matches!(r, Response::HeartbeatAck).then_some(()))?;
                self.heartbeat_misses.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let misses = self.heartbeat_misses.fetch_add(1, Ordering::Relaxed) + 1;
                if misses >= HEARTBEAT_MISSES_BEFORE_RESET {
                    Err(SignalingError::HeartbeatLost)
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn visit(
        &self,
        domain: &str,
        local_id: i64,
        remote_id: i64,
        resource_type: u8,
    ) -> Result<bool, SignalingError> {
        let resp = self
            .call(RequestBody::Visit {
                domain: domain.to_string(),
                local_id,
                remote_id,
                resource_type,
            })
            .await?;
        Self::expect(resp, |r| match r {
            Response::VisitResult { allow } => Some(allow),
            _ => None,
        })
    }

    pub async fn visit_reply(
        &self,
        domain: &str,
        active_id: i64,
        passive_id: i64,
        allow: bool,
    ) -> Result<(), SignalingError> {
        let resp = self
            .call(RequestBody::VisitReply {
                domain: domain.to_string(),
                active_id,
                passive_id,
                allow,
            })
            .await?;
        Self::expect(resp, |r| matches!(r, Response::VisitReplyAck).then_some(()))
    }

    /// Active-side key exchange (spec §4.2): runs the augmented-ECDH PAKE
    /// of `duallink-crypto`, mutually confirmed via HMAC tags relayed
    /// through the rendezvous server, and returns the derived `AeadKeyPair`
    /// plus the `visit_credentials`/`endpoint_addr` needed for
    /// `endpoint_connect` + `endpoint_handshake`.
    pub async fn key_exchange(
        &self,
        domain: &str,
        local_id: i64,
        remote_id: i64,
        password: &str,
        local_fingerprint: &[u8],
    ) -> Result<KeyExchangeOutcome, SignalingError> {
        let kx = KeyExchange::generate();
        let public_key = kx.public_key;

        let resp = self
            .call(RequestBody::KeyExchangeInit {
                domain: domain.to_string(),
                local_id,
                remote_id,
                fingerprint: local_fingerprint.to_vec(),
                public_key,
            })
            .await?;

        let (visit_credentials, endpoint_addr, peer_public_key, peer_fingerprint, peer_tag) =
            Self::expect(resp, |r| match r {
                Response::KeyExchangeResult {
                    visit_credentials,
                    endpoint_addr,
                    peer_public_key,
                    peer_fingerprint,
                    peer_confirmation_tag,
                } => Some((visit_credentials, endpoint_addr, peer_public_key, peer_fingerprint, peer_confirmation_tag)),
                _ => None,
            })?;

        let secrets: SessionSecrets = kx
            .derive(peer_public_key, password, local_fingerprint, &peer_fingerprint)
            .map_err(|e| SignalingError::Protocol(e.to_string()))?;
        secrets
            .verify_confirmation(Role::Passive, &peer_tag)
            .map_err(|e| SignalingError::Protocol(e.to_string()))?;

        // Mutual confirmation (spec §6): the passive side must not trust
        // these keys until it has seen our own tag too, so relay it through
        // the server before returning to the caller.
        let own_tag = secrets.confirmation_tag(Role::Active);
        let confirm_resp = self
            .call(RequestBody::KeyExchangeConfirm {
                domain: domain.to_string(),
                active_id: local_id,
                passive_id: remote_id,
                confirmation_tag: own_tag,
            })
            .await?;
        Self::expect(confirm_resp, |r| matches!(r, Response::KeyExchangeConfirmAck).then_some(()))?;

        Ok(KeyExchangeOutcome {
            visit_credentials: VisitCredentials(visit_credentials.to_vec()),
            endpoint_addr,
            aead: secrets.into_aead_keys(Role::Active),
        })
    }

    /// Passive-side mirror of [`Self::key_exchange`]: called after
    /// receiving a [`PushEvent::KeyExchangeRequest`]. Sends its own
    /// confirmation tag in the `KeyExchangeReply`, then waits for the
    /// active side's relayed tag (a [`PushEvent::KeyExchangeConfirm`]) and
    /// verifies it before trusting the derived keys.
    pub async fn respond_key_exchange(
        &self,
        req: &PushEvent,
        password: &str,
        local_fingerprint: &[u8],
    ) -> Result<KeyExchangeOutcome, SignalingError> {
        let PushEvent::KeyExchangeRequest { domain, active_id, passive_id, fingerprint, public_key } =
            req
        else {
            return Err(SignalingError::Protocol("not a KeyExchangeRequest push".into()));
        };

        let kx = KeyExchange::generate();
        let own_public_key = kx.public_key;
        let secrets = kx
            .derive(*public_key, password, fingerprint, local_fingerprint)
            .map_err(|e| SignalingError::Protocol(e.to_string()))?;
        let own_tag = secrets.confirmation_tag(Role::Passive);

        // Register the confirm waiter before sending the reply so the
        // active side's relayed tag can't arrive and be dropped before
        // we're listening for it.
        let (confirm_tx, confirm_rx) = oneshot::channel();
        self.confirm_pending.insert((*active_id, *passive_id), confirm_tx);

        let resp = self
            .call(RequestBody::KeyExchangeReply {
                domain: domain.clone(),
                active_id: *active_id,
                passive_id: *passive_id,
                fingerprint: local_fingerprint.to_vec(),
                public_key: own_public_key,
                confirmation_tag: own_tag,
            })
            .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                self.confirm_pending.remove(&(*active_id, *passive_id));
                return Err(e);
            }
        };

        let visit_credentials = match Self::expect(resp, |r| match r {
            Response::KeyExchangeReplyAck { visit_credentials } => Some(visit_credentials),
            _ => None,
        }) {
            Ok(v) => v,
            Err(e) => {
                self.confirm_pending.remove(&(*active_id, *passive_id));
                return Err(e);
            }
        };

        // Mutual confirmation (spec §6): don't trust the derived keys until
        // the active side's own tag has been seen and verified, rather than
        // relying on implicit AEAD-decrypt failure to catch an impostor.
        let peer_tag = match tokio::time::timeout(REQUEST_TIMEOUT, confirm_rx).await {
            Ok(Ok(tag)) => tag,
            Ok(Err(_)) => return Err(SignalingError::SessionClosed),
            Err(_) => {
                self.confirm_pending.remove(&(*active_id, *passive_id));
                return Err(SignalingError::Timeout);
            }
        };
        secrets
            .verify_confirmation(Role::Active, &peer_tag)
            .map_err(|e| SignalingError::Protocol(e.to_string()))?;

        Ok(KeyExchangeOutcome {
            visit_credentials: VisitCredentials(visit_credentials.to_vec()),
            endpoint_addr: String::new(),
            aead: secrets.into_aead_keys(Role::Passive),
        })
    }
}

fn spawn_reader<T>(
    mut reader: FrameReader<T>,
    pending: Arc<PendingMap>,
    confirm_pending: Arc<ConfirmMap>,
    push_tx: mpsc::Sender<PushEvent>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok((FrameKind::SignalingResponse, payload)) => {
                    match bincode::deserialize::<ResponseFrame>(&payload) {
                        Ok(frame) => {
                            if let Some((_, tx)) = pending.remove(&frame.seq) {
                                let _ = tx.send(frame.response);
                            } else {
                                warn!(seq = frame.seq, "orphan signaling response dropped");
                            }
                        }
                        Err(e) => warn!(err = %e, "malformed signaling response"),
                    }
                }
                Ok((FrameKind::SignalingPush, payload)) => {
                    match bincode::deserialize::<PushEvent>(&payload) {
                        Ok(PushEvent::KeyExchangeConfirm { active_id, passive_id, confirmation_tag, .. }) => {
                            if let Some((_, tx)) = confirm_pending.remove(&(active_id, passive_id)) {
                                let _ = tx.send(confirmation_tag);
                            } else {
                                warn!(active_id, passive_id, "orphan key-exchange confirm dropped");
                            }
                        }
                        Ok(event) => {
                            if push_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(err = %e, "malformed signaling push"),
                    }
                }
                Ok((other, _)) => {
                    warn!(kind = ?other, "unexpected frame kind on signaling transport");
                }
                Err(e) => {
                    debug!(err = %e, "signaling reader exiting");
                    break;
                }
            }
        }
    });
}

mod tls {
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// TOFU client connector: the rendezvous service's certificate is not
    /// validated against a CA chain, matching the teacher's own
    /// ephemeral-self-signed-cert + fingerprint-display trust model
    /// (`duallink-wire`'s `generate_tls_identity`/pairing-PIN approach on
    /// the server side); a production deployment would pin the rendezvous
    /// fingerprint the way the teacher's client is meant to. Documented
    /// limitation — see `DESIGN.md`.
    pub fn client_connector() -> TlsConnector {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    #[derive(Debug)]
    struct NoVerify;

    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn orphan_response_is_dropped_not_panicking() {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let frame = ResponseFrame { seq: 999, response: Response::Subscribed };
        // No pending entry for seq 999 — the reader's `remove` returns None
        // and it should just warn, matching spec §8 #3.
        assert!(pending.remove(&frame.seq).is_none());
    }
}
