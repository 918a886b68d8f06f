//! Endpoint Connection (spec §4.3): the point-to-point direct channel that
//! replaces the signaling session once a `key_exchange` has produced
//! `(visit_credentials, endpoint_addr, AeadKeyPair)`.
//!
//! `connect`/`listen` open the raw TCP socket; `handshake_active` /
//! `handshake_passive` install the AEAD keys and exchange the `Handshake`
//! control frame before either side trusts the channel. Once the handshake
//! completes, a reader task demultiplexes inbound frames by kind onto
//! per-kind bounded channels (video/audio depth 64 drop-oldest, control/
//! input depth 256 backpressure) and a writer task drains one outbound mpsc
//! — the single owner of the sealing nonce — grounded in MirrorX's
//! `endpoint.rs` reader/writer task split and per-kind demux
//! (`examples/other_examples/..._endpoint.rs.rs`), generalized to this
//! spec's specific channel depths and overflow policies (spec §5).

mod channel;

pub use channel::{DropOldestReceiver, DropOldestSender};

use std::time::Duration;

use bytes::Bytes;
use duallink_core::{AeadKeyPair, VisitCredentials};
use duallink_wire::{install_aead, split, FrameKind, FrameReader, FrameWriter, WireError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONTROL_CHANNEL_DEPTH: usize = 256;
pub const INPUT_CHANNEL_DEPTH: usize = 256;
pub const VIDEO_CHANNEL_DEPTH: usize = 64;
pub const AUDIO_CHANNEL_DEPTH: usize = 64;
const OUTBOUND_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("listen failed: {0}")]
    ListenFailed(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("visit credentials did not match the expected handle")]
    CredentialMismatch,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("endpoint transport error: {0}")]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeFrame {
    Handshake { visit_credentials: VisitCredentials },
    Ack,
    Reject { reason: String },
}

/// Active side: dials `addr` (spec.md §6 `endpoint_connect`). Keys are not
/// installed yet — call [`handshake_active`] next.
#[instrument(skip_all, fields(addr))]
pub async fn connect(addr: &str) -> Result<(FrameReader<TcpStream>, FrameWriter), EndpointError> {
    let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| EndpointError::DialFailed(format!("timed out dialing {addr}")))?
        .map_err(|e| EndpointError::DialFailed(e.to_string()))?;
    stream.set_nodelay(true).ok();
    Ok(split(stream))
}

/// Passive side: a bound listener accepting inbound endpoint connections.
pub struct EndpointListener {
    listener: TcpListener,
}

impl EndpointListener {
    pub async fn bind(addr: &str) -> Result<Self, EndpointError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EndpointError::ListenFailed(e.to_string()))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, EndpointError> {
        self.listener
            .local_addr()
            .map_err(|e| EndpointError::ListenFailed(e.to_string()))
    }

    pub async fn accept(&self) -> Result<(FrameReader<TcpStream>, FrameWriter), EndpointError> {
        let (stream, _peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| EndpointError::ListenFailed(e.to_string()))?;
        stream.set_nodelay(true).ok();
        Ok(split(stream))
    }
}

/// Active side (spec.md §6 `endpoint_handshake`): installs the AEAD keys
/// derived by `signaling_key_exchange`, sends `Handshake{visit_credentials}`,
/// and waits up to [`HANDSHAKE_TIMEOUT`] for `Ack`.
#[instrument(skip_all, fields(local_id, remote_id))]
pub async fn handshake_active(
    mut reader: FrameReader<TcpStream>,
    mut writer: FrameWriter,
    local_id: i64,
    remote_id: i64,
    visit_credentials: VisitCredentials,
    keys: AeadKeyPair,
) -> Result<EndpointSession, EndpointError> {
    install_aead(&mut reader, &mut writer, &keys);

    let frame = HandshakeFrame::Handshake { visit_credentials };
    let payload = bincode::serialize(&frame).expect("HandshakeFrame is always serializable");
    writer.send(FrameKind::EndpointControl, Bytes::from(payload))?;

    let (kind, payload) = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.recv())
        .await
        .map_err(|_| EndpointError::Timeout)??;
    if kind != FrameKind::EndpointControl {
        return Err(EndpointError::Protocol(format!(
            "expected handshake ack on control channel, got {kind:?}"
        )));
    }
    match bincode::deserialize::<HandshakeFrame>(&payload)
        .map_err(|e| EndpointError::Protocol(e.to_string()))?
    {
        HandshakeFrame::Ack => {}
        HandshakeFrame::Reject { reason } => return Err(EndpointError::HandshakeRejected(reason)),
        HandshakeFrame::Handshake { .. } => {
            return Err(EndpointError::Protocol("peer resent Handshake instead of Ack".into()))
        }
    }

    Ok(spawn_session(reader, writer, local_id, remote_id, Role::Active))
}

/// Passive side (spec.md §6 `endpoint_handshake`): validates the inbound
/// `Handshake` against `expected_credentials` (the rendezvous-issued handle
/// for this visit), rejecting on mismatch rather than installing keys for
/// an unauthenticated peer.
#[instrument(skip_all, fields(local_id, remote_id))]
pub async fn handshake_passive(
    mut reader: FrameReader<TcpStream>,
    mut writer: FrameWriter,
    local_id: i64,
    remote_id: i64,
    expected_credentials: &VisitCredentials,
    keys: AeadKeyPair,
) -> Result<EndpointSession, EndpointError> {
    install_aead(&mut reader, &mut writer, &keys);

    let (kind, payload) = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.recv())
        .await
        .map_err(|_| EndpointError::Timeout)??;
    if kind != FrameKind::EndpointControl {
        return Err(EndpointError::Protocol(format!(
            "expected Handshake on control channel, got {kind:?}"
        )));
    }
    let visit_credentials = match bincode::deserialize::<HandshakeFrame>(&payload)
        .map_err(|e| EndpointError::Protocol(e.to_string()))?
    {
        HandshakeFrame::Handshake { visit_credentials } => visit_credentials,
        other => {
            return Err(EndpointError::Protocol(format!(
                "expected Handshake, got {other:?}"
            )))
        }
    };

    if &visit_credentials != expected_credentials {
        let reject = HandshakeFrame::Reject { reason: "visit credentials mismatch".into() };
        let payload = bincode::serialize(&reject).expect("HandshakeFrame is always serializable");
        let _ = writer.send(FrameKind::EndpointControl, Bytes::from(payload));
        return Err(EndpointError::CredentialMismatch);
    }

    let ack = HandshakeFrame::Ack;
    let payload = bincode::serialize(&ack).expect("HandshakeFrame is always serializable");
    writer.send(FrameKind::EndpointControl, Bytes::from(payload))?;

    Ok(spawn_session(reader, writer, local_id, remote_id, Role::Passive))
}

/// Cheap-to-clone handle any task can use to enqueue an outbound frame; the
/// writer task is the sole consumer of the channel behind it, so it remains
/// the single owner of the sealing nonce even with many producers (spec §5).
#[derive(Clone)]
pub struct EndpointHandle {
    pub local_id: i64,
    pub remote_id: i64,
    pub role: Role,
    outbound_tx: mpsc::Sender<(FrameKind, Bytes)>,
    cancel: CancellationToken,
}

impl EndpointHandle {
    pub fn send_control(&self, payload: Bytes) -> Result<(), EndpointError> {
        self.try_send(FrameKind::EndpointControl, payload)
    }

    pub fn send_video(&self, payload: Bytes) -> Result<(), EndpointError> {
        self.try_send(FrameKind::EndpointVideo, payload)
    }

    pub fn send_audio(&self, payload: Bytes) -> Result<(), EndpointError> {
        self.try_send(FrameKind::EndpointAudio, payload)
    }

    pub fn send_input(&self, payload: Bytes) -> Result<(), EndpointError> {
        self.try_send(FrameKind::EndpointInput, payload)
    }

    fn try_send(&self, kind: FrameKind, payload: Bytes) -> Result<(), EndpointError> {
        self.outbound_tx
            .try_send((kind, payload))
            .map_err(|_| EndpointError::Wire(WireError::BackpressureExceeded))
    }

    /// Stops the reader/writer tasks at their next suspension point and
    /// closes the transport (spec §5 "Cancellation").
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// The per-kind receivers produced by a successful handshake; each is meant
/// to move into its own consumer task (negotiator, video sink, input
/// injector).
pub struct EndpointChannels {
    pub control_rx: mpsc::Receiver<Bytes>,
    pub video_rx: DropOldestReceiver<Bytes>,
    pub audio_rx: DropOldestReceiver<Bytes>,
    pub input_rx: mpsc::Receiver<Bytes>,
}

pub struct EndpointSession {
    pub handle: EndpointHandle,
    pub channels: EndpointChannels,
}

fn spawn_session(
    reader: FrameReader<TcpStream>,
    writer: FrameWriter,
    local_id: i64,
    remote_id: i64,
    role: Role,
) -> EndpointSession {
    let cancel = CancellationToken::new();

    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_DEPTH);
    let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);
    let (video_tx, video_rx) = channel::drop_oldest_channel(VIDEO_CHANNEL_DEPTH);
    let (audio_tx, audio_rx) = channel::drop_oldest_channel(AUDIO_CHANNEL_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_DEPTH);

    spawn_reader(reader, control_tx, video_tx, audio_tx, input_tx, cancel.clone());
    spawn_writer(writer, outbound_rx, cancel.clone());

    EndpointSession {
        handle: EndpointHandle { local_id, remote_id, role, outbound_tx, cancel },
        channels: EndpointChannels { control_rx, video_rx, audio_rx, input_rx },
    }
}

fn spawn_reader(
    mut reader: FrameReader<TcpStream>,
    control_tx: mpsc::Sender<Bytes>,
    video_tx: DropOldestSender<Bytes>,
    audio_tx: DropOldestSender<Bytes>,
    input_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = reader.recv() => match frame {
                    Ok((FrameKind::EndpointControl, payload)) => {
                        if control_tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Ok((FrameKind::EndpointVideo, payload)) => video_tx.push(payload),
                    Ok((FrameKind::EndpointAudio, payload)) => audio_tx.push(payload),
                    Ok((FrameKind::EndpointInput, payload)) => {
                        if input_tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Ok((other, _)) => {
                        warn!(kind = ?other, "frame kind illegal on an established endpoint session");
                        break;
                    }
                    Err(e) => {
                        debug!(err = %e, "endpoint reader exiting");
                        break;
                    }
                },
            }
        }
        video_tx.close();
        audio_tx.close();
        cancel.cancel();
    });
}

fn spawn_writer(
    mut writer: FrameWriter,
    mut outbound_rx: mpsc::Receiver<(FrameKind, Bytes)>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = outbound_rx.recv() => match msg {
                    Some((kind, payload)) => {
                        if let Err(e) = writer.send(kind, payload) {
                            warn!(err = %e, "endpoint writer exiting");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn active_and_passive_handshake_then_exchange_video() {
        let listener = EndpointListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let credentials = VisitCredentials(vec![1u8; 16]);
        let keys_active = AeadKeyPair {
            sealing_key: [1u8; 32],
            sealing_nonce: 0,
            opening_key: [2u8; 32],
            opening_nonce: 0,
        };
        let keys_passive = AeadKeyPair {
            sealing_key: keys_active.opening_key,
            sealing_nonce: keys_active.opening_nonce,
            opening_key: keys_active.sealing_key,
            opening_nonce: keys_active.sealing_nonce,
        };

        let accept_fut = listener.accept();
        let connect_fut = connect(&addr);
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        let (passive_reader, passive_writer) = accepted.unwrap();
        let (active_reader, active_writer) = connected.unwrap();

        let credentials_for_active = credentials.clone();
        let active_fut = handshake_active(
            active_reader,
            active_writer,
            1,
            2,
            credentials_for_active,
            keys_active,
        );
        let passive_fut =
            handshake_passive(passive_reader, passive_writer, 2, 1, &credentials, keys_passive);

        let (active_session, passive_session) = tokio::join!(active_fut, passive_fut);
        let active_session = active_session.unwrap();
        let mut passive_session = passive_session.unwrap();

        active_session
            .handle
            .send_video(Bytes::from_static(b"nv12-bytes"))
            .unwrap();
        let received = passive_session.channels.video_rx.recv().await.unwrap();
        assert_eq!(&received[..], b"nv12-bytes");
    }

    #[tokio::test]
    async fn mismatched_credentials_are_rejected() {
        let listener = EndpointListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let keys = AeadKeyPair {
            sealing_key: [3u8; 32],
            sealing_nonce: 0,
            opening_key: [4u8; 32],
            opening_nonce: 0,
        };
        let peer_keys = AeadKeyPair {
            sealing_key: keys.opening_key,
            sealing_nonce: keys.opening_nonce,
            opening_key: keys.sealing_key,
            opening_nonce: keys.sealing_nonce,
        };

        let accept_fut = listener.accept();
        let connect_fut = connect(&addr);
        let (accepted, connected) = tokio::join!(accept_fut, connect_fut);
        let (passive_reader, passive_writer) = accepted.unwrap();
        let (active_reader, active_writer) = connected.unwrap();

        let active_fut = handshake_active(
            active_reader,
            active_writer,
            1,
            2,
            VisitCredentials(vec![9u8; 16]),
            keys,
        );
        let passive_fut = handshake_passive(
            passive_reader,
            passive_writer,
            2,
            1,
            &VisitCredentials(vec![8u8; 16]),
            peer_keys,
        );

        let (active_result, passive_result) = tokio::join!(active_fut, passive_fut);
        assert!(matches!(active_result, Err(EndpointError::HandshakeRejected(_))));
        assert!(matches!(passive_result, Err(EndpointError::CredentialMismatch)));
    }
}
