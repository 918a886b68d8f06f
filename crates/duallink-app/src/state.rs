//! Process-wide singletons (spec §9: "global current signaling session"
//! becomes a mutex-guarded singleton with explicit init/disconnect
//! lifecycle, never held across a suspension point).
//!
//! Grounded in the teacher's `duallink-linux-sender/input_inject.rs`
//! `static INJECTOR: OnceLock<Mutex<Option<Injector>>>` convention, reused
//! here for every process-wide piece of state this shell owns: the config
//! path, the signaling client, the session registry, and the per-endpoint
//! negotiation/channel state that the stepwise FFI calls need to resume
//! across separate invocations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use duallink_core::MonitorDescriptor;
use duallink_endpoint::EndpointHandle;
use duallink_registry::SessionRegistry;
use duallink_signaling::SignalingClient;
use duallink_wire::{FrameReader, FrameWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::errors::AppError;

static CONFIG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();
static SIGNALING: OnceLock<AsyncMutex<Option<SignalingClient>>> = OnceLock::new();
static REGISTRY: OnceLock<SessionRegistry> = OnceLock::new();
static ENDPOINTS: OnceLock<Mutex<HashMap<(i64, i64), Arc<EndpointState>>>> = OnceLock::new();
/// Holds the raw reader/writer produced by `endpoint_connect` (spec §6)
/// until the matching `endpoint_handshake` call installs the AEAD keys —
/// the two are separate FFI entry points because `key_exchange`'s derived
/// keys may arrive from a different call than the one that dialed the TCP
/// socket.
#[allow(clippy::type_complexity)]
static PENDING_CONNECTIONS: OnceLock<Mutex<HashMap<(i64, i64), (FrameReader<TcpStream>, FrameWriter)>>> =
    OnceLock::new();

/// Per-endpoint-session state the FFI-style `endpoint_negotiate_*` calls
/// need to carry across separate invocations: the control channel a single
/// stepwise call borrows for the duration of its `await`, and the monitor
/// list from the last `request_display_info` so `select_monitor` can be
/// validated client-side before round-tripping.
pub struct EndpointState {
    pub handle: EndpointHandle,
    pub control_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    pub video_rx: AsyncMutex<duallink_endpoint::DropOldestReceiver<Bytes>>,
    pub audio_rx: AsyncMutex<duallink_endpoint::DropOldestReceiver<Bytes>>,
    pub input_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    pub last_monitors: Mutex<Vec<MonitorDescriptor>>,
}

fn config_path_cell() -> &'static Mutex<Option<PathBuf>> {
    CONFIG_PATH.get_or_init(|| Mutex::new(None))
}

fn signaling_cell() -> &'static AsyncMutex<Option<SignalingClient>> {
    SIGNALING.get_or_init(|| AsyncMutex::new(None))
}

pub fn registry() -> &'static SessionRegistry {
    REGISTRY.get_or_init(SessionRegistry::new)
}

fn endpoints_cell() -> &'static Mutex<HashMap<(i64, i64), Arc<EndpointState>>> {
    ENDPOINTS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn set_config_path(path: PathBuf) {
    *config_path_cell().lock().expect("config path mutex poisoned") = Some(path);
}

pub fn config_path() -> Result<PathBuf, AppError> {
    config_path_cell()
        .lock()
        .expect("config path mutex poisoned")
        .clone()
        .ok_or(AppError::NotInitialized)
}

pub async fn set_signaling(client: SignalingClient) {
    *signaling_cell().lock().await = Some(client);
}

pub async fn take_signaling() -> Option<SignalingClient> {
    signaling_cell().lock().await.take()
}

/// Locks the signaling-client cell for the duration of one call. Callers
/// deref the guard, check for `None` (`AppError::NoSignalingSession`), and
/// `.await` their request directly against the borrowed client — the guard
/// is a local variable with a concrete (`'static`-backed) lifetime, so the
/// request/response round trip the caller awaits is never laundered through
/// a generic higher-order closure.
pub async fn signaling_guard() -> AsyncMutexGuard<'static, Option<SignalingClient>> {
    signaling_cell().lock().await
}

pub fn insert_endpoint(active_id: i64, passive_id: i64, state: EndpointState) {
    endpoints_cell()
        .lock()
        .expect("endpoints mutex poisoned")
        .insert((active_id, passive_id), Arc::new(state));
}

pub fn remove_endpoint(active_id: i64, passive_id: i64) {
    endpoints_cell()
        .lock()
        .expect("endpoints mutex poisoned")
        .remove(&(active_id, passive_id));
    registry().remove(active_id, passive_id);
}

/// Clones out the `Arc<EndpointState>` for `(active_id, passive_id)`,
/// releasing the map's `std::sync::Mutex` immediately — callers then lock
/// the per-session `AsyncMutex` fields on the owned `Arc` and may suspend
/// freely, since nothing here is held across an `.await`.
pub fn get_endpoint(active_id: i64, passive_id: i64) -> Result<Arc<EndpointState>, AppError> {
    endpoints_cell()
        .lock()
        .expect("endpoints mutex poisoned")
        .get(&(active_id, passive_id))
        .cloned()
        .ok_or(AppError::NoEndpointSession { active_id, passive_id })
}

fn pending_cell() -> &'static Mutex<HashMap<(i64, i64), (FrameReader<TcpStream>, FrameWriter)>> {
    PENDING_CONNECTIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn insert_pending_connection(
    active_id: i64,
    passive_id: i64,
    reader: FrameReader<TcpStream>,
    writer: FrameWriter,
) {
    pending_cell()
        .lock()
        .expect("pending connections mutex poisoned")
        .insert((active_id, passive_id), (reader, writer));
}

pub fn take_pending_connection(
    active_id: i64,
    passive_id: i64,
) -> Result<(FrameReader<TcpStream>, FrameWriter), AppError> {
    pending_cell()
        .lock()
        .expect("pending connections mutex poisoned")
        .remove(&(active_id, passive_id))
        .ok_or(AppError::NoEndpointSession { active_id, passive_id })
}
