use serde::{Deserialize, Serialize};

// MARK: - VideoCodec

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

// MARK: - PixelFormat / ColorRange

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
}

/// Studio (limited, 16-235) vs. full (0-255) range, per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorRange {
    Studio,
    Full,
}

// MARK: - DeviceIdentity / Domain

/// A device's identity within one rendezvous realm.
///
/// `device_id` is assigned by the rendezvous on first `register`; the
/// fingerprint is the device's long-term public key and is unique within
/// the domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub domain: String,
    pub device_id: i64,
    #[serde(with = "serde_bytes")]
    pub fingerprint: Vec<u8>,
    pub saved_password: Option<String>,
}

/// A named rendezvous realm: where to dial, and this device's identity
/// within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub uri: String,
    pub identity: DeviceIdentity,
}

// MARK: - VisitCredentials

/// Opaque token issued by the rendezvous on a successful key exchange,
/// valid for exactly one endpoint handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitCredentials(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl VisitCredentials {
    pub const LEN: usize = 16;
}

// MARK: - MonitorDescriptor

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorDescriptor {
    pub id: String,
    pub name: String,
    pub refresh_rate: u8,
    pub width: u16,
    pub height: u16,
    pub is_primary: bool,
    /// PNG-encoded thumbnail, empty if unavailable.
    #[serde(with = "serde_bytes")]
    pub screenshot: Vec<u8>,
}

// MARK: - VideoFrame (NV12, uncompressed)

/// An NV12 frame: one Y plane, one interleaved UV plane, each with its own
/// stride. `uv_height` is always `y_height / 2` (4:2:0).
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub y_plane: bytes::Bytes,
    pub y_stride: u32,
    pub uv_plane: bytes::Bytes,
    pub uv_stride: u32,
    pub width: u32,
    pub height: u32,
    pub color_range: ColorRange,
    /// Decode/presentation timestamp in `timebase` units.
    pub dts: i64,
    pub pts: i64,
    /// Timebase as a (numerator, denominator) rational, e.g. (1, 90_000).
    pub timebase: (u32, u32),
}

impl VideoFrame {
    /// `false` if stride/plane-height invariants required by spec §3 are
    /// violated.
    pub fn is_well_formed(&self) -> bool {
        self.y_stride >= self.width && self.uv_stride >= self.width
    }
}

// MARK: - VideoPacket (Annex-B, compressed)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoPacket {
    pub data: bytes::Bytes,
    pub dts: i64,
    pub pts: i64,
    pub timebase: (u32, u32),
    pub codec: VideoCodec,
    /// Set on the first packet after the encoder has been reinitialized
    /// with different parameters (spec §3, §4.5).
    pub parameters_changed: bool,
    pub is_keyframe: bool,
}

// MARK: - AeadKeyPair

/// Two independent AEAD keys + starting nonces, one pair per direction,
/// derived once at key-exchange and installed on the endpoint connection at
/// handshake. Survives for the lifetime of the `EndpointSession`.
#[derive(Clone)]
pub struct AeadKeyPair {
    pub sealing_key: [u8; 32],
    pub sealing_nonce: u64,
    pub opening_key: [u8; 32],
    pub opening_nonce: u64,
}

impl std::fmt::Debug for AeadKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKeyPair").finish_non_exhaustive()
    }
}

// MARK: - InputEvent

/// Stable platform-neutral keycode numbering (spec §4.8); translated to the
/// local OS's synthetic-input API at the passive side.
pub type KeyCode = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Closed tagged variants per spec §9's design note — the C union of mouse
/// and keyboard events becomes two plain enums rather than one flat sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MouseEvent {
    Move { x: f32, y: f32 },
    Down { x: f32, y: f32, button: MouseButton },
    Up { x: f32, y: f32, button: MouseButton },
    ScrollWheel { x: f32, y: f32, delta_x: f32, delta_y: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyboardEvent {
    Down { keycode: KeyCode },
    Up { keycode: KeyCode },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InputEvent {
    Mouse(MouseEvent),
    Keyboard(KeyboardEvent),
}
