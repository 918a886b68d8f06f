//! Framed Transport (spec §4.1): turns a duplex byte stream into an ordered
//! sequence of typed, authenticated messages.
//!
//! Wire frame: `[u32 BE length][u8 kind][payload bytes]`, `length` covering
//! `kind + payload`. Framing itself is `tokio_util::codec::LengthDelimitedCodec`
//! configured big-endian with a 16 MiB frame cap (grounded in MirrorX's
//! `endpoint.rs`, which wraps a TCP stream in exactly this codec); the kind
//! byte and AEAD sealing are layered on top since the codec's own length
//! field can't carry a message kind.
//!
//! Post-handshake, every endpoint frame's payload is AEAD-sealed:
//! `ciphertext = Seal(sealing_key, nonce = starting_nonce XOR counter, aad =
//! kind || length_be)`. `counter` starts at 0 and increments once per sent
//! frame; reuse or wraparound never happens because the writer is the single
//! mutator of the sealing key (spec §4.1 "Ordering").

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use duallink_core::AeadKeyPair;
use futures::{SinkExt, StreamExt};
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{instrument, warn};

/// Max frame length, spec §4.1: frames larger than this close the connection.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Outbound queue depth at which `send` reports backpressure (spec §4.1).
pub const OUTBOUND_QUEUE_DEPTH: usize = 128;

const TAG_LEN: usize = 16; // AES-256-GCM tag

/// Distinguishes the payload categories multiplexed onto one transport
/// (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    SignalingRequest = 0,
    SignalingResponse = 1,
    SignalingPush = 2,
    EndpointControl = 3,
    EndpointVideo = 4,
    EndpointAudio = 5,
    EndpointInput = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FrameKind::SignalingRequest,
            1 => FrameKind::SignalingResponse,
            2 => FrameKind::SignalingPush,
            3 => FrameKind::EndpointControl,
            4 => FrameKind::EndpointVideo,
            5 => FrameKind::EndpointAudio,
            6 => FrameKind::EndpointInput,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("transport closed")]
    TransportClosed,
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,
    #[error("outbound queue exceeded {OUTBOUND_QUEUE_DEPTH} frames")]
    BackpressureExceeded,
    #[error("AEAD integrity check failed")]
    Integrity,
    #[error("unknown frame kind byte: {0}")]
    UnknownKind(u8),
    #[error("nonce counter exhausted")]
    NonceExhausted,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A nonce sequence per spec §4.1: `starting_nonce XOR counter`, counter
/// strictly increasing from zero, never wrapping (a wraparound is treated
/// as a fatal integrity fault rather than silently reusing a nonce).
struct NonceCounter {
    base: u64,
    counter: u64,
    exhausted: bool,
}

impl NonceCounter {
    fn new(base: u64) -> Self {
        Self { base, counter: 0, exhausted: false }
    }
}

impl NonceSequence for NonceCounter {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        if self.exhausted {
            return Err(ring::error::Unspecified);
        }
        // Spec §8: the frame sealed while `counter == 0` must use
        // `starting_nonce XOR 0`, so the nonce is derived from the current
        // counter *before* it advances.
        let value = self.base ^ self.counter;
        match self.counter.checked_add(1) {
            Some(next) => self.counter = next,
            None => self.exhausted = true,
        }
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&value.to_be_bytes());
        Nonce::try_assume_unique_for_key(&bytes)
    }
}

fn unbound_key(raw: &[u8; 32]) -> UnboundKey {
    UnboundKey::new(&aead::AES_256_GCM, raw).expect("32-byte key always valid for AES-256-GCM")
}

/// AAD binding frame metadata to the ciphertext: `kind || length_be`, where
/// `length` is the on-wire frame length (kind byte + ciphertext + tag).
fn frame_aad(kind: FrameKind, length: u32) -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[0] = kind as u8;
    aad[1..].copy_from_slice(&length.to_be_bytes());
    aad
}

fn build_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Splits a duplex stream into an encrypting/backpressure-aware writer and a
/// decrypting reader (spec §5: "one reader task... one writer task, single
/// owner of sealing_nonce").
pub fn split<T>(io: T) -> (FrameReader<T>, FrameWriter)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(io, build_codec());
    let (sink, stream) = framed.split();

    let (queue_tx, queue_rx) = mpsc::channel::<(FrameKind, Bytes)>(OUTBOUND_QUEUE_DEPTH);
    spawn_writer(sink, queue_rx);
    let writer = FrameWriter { queue_tx, sealing: None, sent: AtomicU64::new(0) };

    let reader = FrameReader { stream, opening: None };
    (reader, writer)
}

/// Drains the outbound queue and writes to the socket. Sealing already
/// happened in [`FrameWriter::send`] before the frame reached the queue, so
/// this loop only owns the socket half — it never touches key material.
fn spawn_writer<T>(
    mut sink: futures::stream::SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>,
    mut queue_rx: mpsc::Receiver<(FrameKind, Bytes)>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some((kind, body)) = queue_rx.recv().await {
            if let Err(err) = sink.send(body).await {
                warn!(err = %err, kind = ?kind, "framed writer: socket closed");
                break;
            }
        }
    });
}

/// Read half of a split [`FramedTransport`] (spec §4.1 `recv`).
pub struct FrameReader<T> {
    stream: futures::stream::SplitStream<Framed<T, LengthDelimitedCodec>>,
    opening: Option<OpeningKey<NonceCounter>>,
}

impl<T> FrameReader<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Installs AEAD opening material (post-handshake).
    pub fn install_opening(&mut self, key: &[u8; 32], starting_nonce: u64) {
        self.opening = Some(OpeningKey::new(unbound_key(key), NonceCounter::new(starting_nonce)));
    }

    #[instrument(skip(self))]
    pub async fn recv(&mut self) -> Result<(FrameKind, Bytes), WireError> {
        let raw = self
            .stream
            .next()
            .await
            .ok_or(WireError::TransportClosed)?
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => WireError::FrameTooLarge,
                _ => WireError::Io(e),
            })?;

        if raw.is_empty() {
            return Err(WireError::TransportClosed);
        }

        let length = raw.len() as u32;
        let kind = FrameKind::try_from(raw[0])?;
        let mut body = BytesMut::from(&raw[1..]);

        let payload = if let Some(opening) = &mut self.opening {
            let aad = frame_aad(kind, length);
            let plain = opening
                .open_in_place(Aad::from(aad), &mut body)
                .map_err(|_| WireError::Integrity)?;
            Bytes::copy_from_slice(plain)
        } else {
            body.freeze()
        };

        Ok((kind, payload))
    }
}

/// Write half of a split [`FramedTransport`] (spec §4.1 `send`).
pub struct FrameWriter {
    queue_tx: mpsc::Sender<(FrameKind, Bytes)>,
    sealing: Option<SealingKey<NonceCounter>>,
    sent: AtomicU64,
}

impl FrameWriter {
    /// Installs AEAD sealing material (post-handshake).
    pub fn install_sealing(&mut self, key: &[u8; 32], starting_nonce: u64) {
        self.sealing = Some(SealingKey::new(unbound_key(key), NonceCounter::new(starting_nonce)));
    }

    /// Number of frames successfully queued so far; exposed for the nonce
    /// monotonicity property test (spec §8 #1).
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[instrument(skip(self, payload))]
    pub fn send(&mut self, kind: FrameKind, payload: Bytes) -> Result<(), WireError> {
        if payload.len() + TAG_LEN + 1 > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge);
        }

        let body = if let Some(sealing) = &mut self.sealing {
            let length = (1 + payload.len() + TAG_LEN) as u32;
            let aad = frame_aad(kind, length);
            let mut buf = payload.to_vec();
            sealing
                .seal_in_place_append_tag(Aad::from(aad), &mut buf)
                .map_err(|_| WireError::NonceExhausted)?;
            let mut out = BytesMut::with_capacity(1 + buf.len());
            out.put_u8(kind as u8);
            out.extend_from_slice(&buf);
            out.freeze()
        } else {
            let mut out = BytesMut::with_capacity(1 + payload.len());
            out.put_u8(kind as u8);
            out.extend_from_slice(&payload);
            out.freeze()
        };

        self.queue_tx
            .try_send((kind, body))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WireError::BackpressureExceeded,
                mpsc::error::TrySendError::Closed(_) => WireError::TransportClosed,
            })?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Installs both directions' AEAD material at once (used right after
/// `endpoint_handshake`, spec §6).
pub fn install_aead<T>(reader: &mut FrameReader<T>, writer: &mut FrameWriter, keys: &AeadKeyPair)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    reader.install_opening(&keys.opening_key, keys.opening_nonce);
    writer.install_sealing(&keys.sealing_key, keys.sealing_nonce);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn keys() -> AeadKeyPair {
        AeadKeyPair {
            sealing_key: [7u8; 32],
            sealing_nonce: 1,
            opening_key: [9u8; 32],
            opening_nonce: 1,
        }
    }

    fn peer_keys(k: &AeadKeyPair) -> AeadKeyPair {
        // what the peer must install so its opening matches our sealing
        // and vice versa.
        AeadKeyPair {
            sealing_key: k.opening_key,
            sealing_nonce: k.opening_nonce,
            opening_key: k.sealing_key,
            opening_nonce: k.sealing_nonce,
        }
    }

    #[tokio::test]
    async fn round_trips_plain_frame() {
        let (a, b) = duplex(64 * 1024);
        let (mut reader_a, mut writer_a) = split(a);
        let (mut reader_b, mut writer_b) = split(b);
        let _ = &mut reader_a;

        writer_a
            .send(FrameKind::SignalingRequest, Bytes::from_static(b"hello"))
            .unwrap();

        let (kind, payload) = reader_b.recv().await.unwrap();
        assert_eq!(kind, FrameKind::SignalingRequest);
        assert_eq!(&payload[..], b"hello");
        let _ = &mut writer_b;
    }

    #[tokio::test]
    async fn round_trips_encrypted_frame() {
        let (a, b) = duplex(64 * 1024);
        let (mut reader_a, mut writer_a) = split(a);
        let (mut reader_b, mut writer_b) = split(b);

        let k_a = keys();
        let k_b = peer_keys(&k_a);
        install_aead(&mut reader_a, &mut writer_a, &k_a);
        install_aead(&mut reader_b, &mut writer_b, &k_b);

        writer_a
            .send(FrameKind::EndpointVideo, Bytes::from_static(b"nv12-frame"))
            .unwrap();
        let (kind, payload) = reader_b.recv().await.unwrap();
        assert_eq!(kind, FrameKind::EndpointVideo);
        assert_eq!(&payload[..], b"nv12-frame");

        // Nonce strictly increases: a second frame must decrypt too.
        writer_a
            .send(FrameKind::EndpointVideo, Bytes::from_static(b"frame-2"))
            .unwrap();
        let (_, payload2) = reader_b.recv().await.unwrap();
        assert_eq!(&payload2[..], b"frame-2");
        assert_eq!(writer_a.frames_sent(), 2);
    }

    /// Spec §8 #1: replaying a previously sent ciphertext is rejected
    /// because the receiver's opening nonce counter has already moved past
    /// it — it never re-derives the nonce that decrypted it the first time.
    #[test]
    fn replayed_ciphertext_fails_integrity() {
        let base = 42u64;
        let mut sealing = SealingKey::new(unbound_key(&[1u8; 32]), NonceCounter::new(base));
        let mut opening = OpeningKey::new(unbound_key(&[1u8; 32]), NonceCounter::new(base));

        let kind = FrameKind::EndpointVideo;
        let length = (1 + 5 + TAG_LEN) as u32;
        let aad = frame_aad(kind, length);

        let mut ciphertext = b"hello".to_vec();
        sealing.seal_in_place_append_tag(Aad::from(aad), &mut ciphertext).unwrap();

        let mut first_copy = ciphertext.clone();
        let plain = opening.open_in_place(Aad::from(aad), &mut first_copy).unwrap();
        assert_eq!(plain, b"hello");

        // Replay: same ciphertext bytes again, but the opening key's nonce
        // counter has already advanced past the one that produced it.
        let mut replay_copy = ciphertext;
        assert!(opening.open_in_place(Aad::from(aad), &mut replay_copy).is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, _b) = duplex(64 * 1024);
        let (_reader, mut writer) = split(a);
        let huge = Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]);
        assert!(matches!(
            writer.send(FrameKind::EndpointVideo, huge),
            Err(WireError::FrameTooLarge)
        ));
    }
}
