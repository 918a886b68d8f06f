//! External-interface functions (spec §6): the language-neutral entry
//! points a UI layer or FFI binding calls into. Each function is a thin
//! wrapper over the process-wide singletons in [`crate::state`] — the
//! actual protocol/pipeline logic lives in the crates this shell wires
//! together, per spec §9's "thin shell around the global session" note.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use duallink_capture::{Capturer, FrameSink as CaptureFrameSink};
use duallink_codec::{probe_best_decoder, probe_best_encoder, EncoderOptions, VideoDecoder, VideoEncoder};
use duallink_core::store::{self, DomainConfig};
use duallink_core::{AeadKeyPair, ColorRange, InputEvent, MonitorDescriptor, VideoCodec, VideoFrame, VideoPacket};
use duallink_endpoint::EndpointListener;
use duallink_input::InputInjector;
use duallink_signaling::SignalingClient;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::errors::AppError;
use crate::state::{self, EndpointState};

/// Invoked from the decoder's consumer task with a freshly decoded NV12
/// frame (spec §6 "Frame sink" collaborator: `update_frame`). The callee
/// must copy or mark-dirty synchronously and return promptly.
pub type FrameSink = std::sync::Arc<dyn Fn(VideoFrame) + Send + Sync>;

// ---------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------

/// Installs a `tracing-subscriber` `fmt` layer honoring `RUST_LOG` (spec §6
/// `init_logger`) — the ambient logging transport the rest of the workspace
/// already emits through via `tracing`, not a bespoke log-sink callback.
pub fn init_logger() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .try_init();
}

/// Records the host platform and pins the config file's path under
/// `config_dir` (spec §6 `init`). Must be called once before any
/// config/signaling/endpoint call.
pub fn init(os_name: &str, os_version: &str, config_dir: &str) {
    info!(os_name, os_version, config_dir, "duallink core initialized");
    state::set_config_path(PathBuf::from(config_dir).join("duallink.json"));
}

// ---------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------

pub fn read_primary_domain() -> Result<Option<String>, AppError> {
    Ok(store::read_primary_domain(&state::config_path()?)?)
}

pub fn save_primary_domain(name: &str) -> Result<(), AppError> {
    Ok(store::save_primary_domain(&state::config_path()?, name)?)
}

pub fn read_domain_config(domain: &str) -> Result<Option<DomainConfig>, AppError> {
    Ok(store::read_domain_config(&state::config_path()?, domain)?)
}

pub fn save_domain_config(domain: &str, config: DomainConfig) -> Result<(), AppError> {
    Ok(store::save_domain_config(&state::config_path()?, domain, config)?)
}

// ---------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn signaling_dial(uri: &str) -> Result<(), AppError> {
    let client = SignalingClient::dial(uri).await?;
    state::set_signaling(client).await;
    Ok(())
}

pub async fn signaling_disconnect() {
    if let Some(client) = state::take_signaling().await {
        client.disconnect().await;
    }
}

pub async fn signaling_register(device_id: Option<i64>, fingerprint: Vec<u8>) -> Result<(i64, i64), AppError> {
    let guard = state::signaling_guard().await;
    let client = guard.as_ref().ok_or(AppError::NoSignalingSession)?;
    Ok(client.register(device_id, fingerprint).await?)
}

pub async fn signaling_subscribe(device_id: i64, fingerprint: Vec<u8>, config_path: String) -> Result<(), AppError> {
    let guard = state::signaling_guard().await;
    let client = guard.as_ref().ok_or(AppError::NoSignalingSession)?;
    Ok(client.subscribe(device_id, fingerprint, config_path).await?)
}

pub async fn signaling_heartbeat(device_id: i64, timestamp: i64) -> Result<(), AppError> {
    let guard = state::signaling_guard().await;
    let client = guard.as_ref().ok_or(AppError::NoSignalingSession)?;
    Ok(client.heartbeat(device_id, timestamp).await?)
}

pub async fn signaling_visit(domain: &str, local_id: i64, remote_id: i64, resource_type: u8) -> Result<bool, AppError> {
    let guard = state::signaling_guard().await;
    let client = guard.as_ref().ok_or(AppError::NoSignalingSession)?;
    Ok(client.visit(domain, local_id, remote_id, resource_type).await?)
}

pub async fn signaling_visit_reply(domain: &str, active_id: i64, passive_id: i64, allow: bool) -> Result<(), AppError> {
    let guard = state::signaling_guard().await;
    let client = guard.as_ref().ok_or(AppError::NoSignalingSession)?;
    Ok(client.visit_reply(domain, active_id, passive_id, allow).await?)
}

/// Outcome of `signaling_key_exchange`: everything `endpoint_connect` +
/// `endpoint_handshake` need next (spec §6).
pub struct KeyExchangeResult {
    pub visit_credentials: duallink_core::VisitCredentials,
    pub endpoint_addr: String,
    pub aead: AeadKeyPair,
}

pub async fn signaling_key_exchange(
    domain: &str,
    local_id: i64,
    remote_id: i64,
    password: &str,
    local_fingerprint: &[u8],
) -> Result<KeyExchangeResult, AppError> {
    let outcome = {
        let guard = state::signaling_guard().await;
        let client = guard.as_ref().ok_or(AppError::NoSignalingSession)?;
        client.key_exchange(domain, local_id, remote_id, password, local_fingerprint).await?
    };
    Ok(KeyExchangeResult {
        visit_credentials: outcome.visit_credentials,
        endpoint_addr: outcome.endpoint_addr,
        aead: outcome.aead,
    })
}

// ---------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------

/// Active side (spec §6): dials `addr`, parking the raw reader/writer until
/// the matching `endpoint_handshake` call supplies the AEAD keys.
#[instrument(skip_all, fields(active_id, passive_id, addr))]
pub async fn endpoint_connect(active_id: i64, passive_id: i64, addr: &str) -> Result<(), AppError> {
    let (reader, writer) = duallink_endpoint::connect(addr).await?;
    state::insert_pending_connection(active_id, passive_id, reader, writer);
    Ok(())
}

/// Completes the handshake the matching `endpoint_connect` started, installs
/// the AEAD keys derived by `signaling_key_exchange`, registers the
/// resulting session, and returns once it is live (spec §6).
#[instrument(skip_all, fields(active_id, passive_id))]
pub async fn endpoint_handshake(
    active_id: i64,
    passive_id: i64,
    visit_credentials: duallink_core::VisitCredentials,
    opening_key: [u8; 32],
    opening_nonce: u64,
    sealing_key: [u8; 32],
    sealing_nonce: u64,
) -> Result<(), AppError> {
    let (reader, writer) = state::take_pending_connection(active_id, passive_id)?;
    let keys = AeadKeyPair { sealing_key, sealing_nonce, opening_key, opening_nonce };
    let session =
        duallink_endpoint::handshake_active(reader, writer, active_id, passive_id, visit_credentials, keys)
            .await?;

    state::registry().insert(active_id, passive_id, session.handle.clone())?;
    state::insert_endpoint(
        active_id,
        passive_id,
        EndpointState {
            handle: session.handle,
            control_rx: AsyncMutex::new(session.channels.control_rx),
            video_rx: AsyncMutex::new(session.channels.video_rx),
            audio_rx: AsyncMutex::new(session.channels.audio_rx),
            input_rx: AsyncMutex::new(session.channels.input_rx),
            last_monitors: StdMutex::new(Vec::new()),
        },
    );
    Ok(())
}

/// Passive-side counterpart of `endpoint_connect`/`endpoint_handshake`:
/// binds `addr`, accepts one inbound connection, and drives it all the way
/// to streaming — negotiation, then capture+encode feeding the endpoint's
/// video channel, then input injection (spec §4.3 "passive side ... has
/// been listening"; spec §4.7 "passive side mirrors ... on SelectMonitor it
/// (re)starts its Capturer+Encoder"). Not itself one of spec §6's named
/// entry points: the passive process calls this once at startup instead of
/// driving `endpoint_connect`/`endpoint_handshake`/`endpoint_negotiate_*`
/// manually, since the FFI surface as written assumes a UI-driven active
/// side and an autonomous passive side.
#[instrument(skip_all, fields(addr))]
pub async fn endpoint_listen(
    addr: &str,
    expected_credentials: duallink_core::VisitCredentials,
    keys: AeadKeyPair,
    local_id: i64,
    remote_id: i64,
    mut capturer: Box<dyn Capturer>,
    mut injector: Box<dyn InputInjector>,
) -> Result<(), AppError> {
    let listener = EndpointListener::bind(addr).await?;
    let (reader, writer) = listener.accept().await?;
    let session =
        duallink_endpoint::handshake_passive(reader, writer, local_id, remote_id, &expected_credentials, keys)
            .await?;

    state::registry().insert(local_id, remote_id, session.handle.clone())?;

    let monitors = capturer.list_monitors().await?;
    let handle = session.handle.clone();
    let mut control_rx = session.channels.control_rx;
    let mut input_rx = session.channels.input_rx;

    tokio::spawn(async move {
        let monitors_for_closure = monitors.clone();
        let selection =
            duallink_negotiate::run_passive(&handle, &mut control_rx, move || monitors_for_closure).await;

        let selection = match selection {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "negotiation failed on passive side, closing session");
                handle.close();
                return;
            }
        };

        let Some(monitor) = monitors.iter().find(|m| m.id == selection.monitor_id) else {
            warn!("selected monitor vanished between negotiation and capture start");
            handle.close();
            return;
        };

        if let Err(e) = injector.set_monitor_bounds(monitor.width as u32, monitor.height as u32) {
            warn!(err = %e, "failed to set monitor bounds on injector");
        }

        let codec = VideoCodec::H264;
        let Some(encoder_name) = probe_best_encoder(codec) else {
            warn!("no usable encoder for this platform, passive session idles without video");
            let _ = run_input_loop(&mut input_rx, injector.as_mut()).await;
            handle.close();
            return;
        };

        let video_handle = handle.clone();
        let packet_sink: duallink_codec::PacketSink = std::sync::Arc::new(move |packet: VideoPacket| {
            let payload = bincode::serialize(&packet).expect("VideoPacket is always serializable");
            let _ = video_handle.send_video(Bytes::from(payload));
        });

        let encoder = match VideoEncoder::open(
            encoder_name,
            codec,
            monitor.width as u32,
            monitor.height as u32,
            selection.expect_fps as u32,
            ColorRange::Full,
            EncoderOptions::default(),
            packet_sink,
        ) {
            Ok(e) => e,
            Err(e) => {
                warn!(err = %e, "encoder failed to open, passive session idles without video");
                let _ = run_input_loop(&mut input_rx, injector.as_mut()).await;
                handle.close();
                return;
            }
        };
        let encoder = std::sync::Arc::new(StdMutex::new(encoder));

        let capture_sink: CaptureFrameSink = {
            let encoder = encoder.clone();
            std::sync::Arc::new(move |frame: VideoFrame| {
                if let Err(e) = encoder.lock().expect("encoder mutex poisoned").encode(&frame) {
                    warn!(err = %e, "encode failed for captured frame");
                }
            })
        };

        if let Err(e) = capturer.start(&selection.monitor_id, selection.expect_fps as u32, capture_sink) {
            warn!(err = %e, "capturer failed to start after negotiation");
        }

        run_input_loop(&mut input_rx, injector.as_mut()).await;

        capturer.stop();
    });

    Ok(())
}

async fn run_input_loop(input_rx: &mut tokio::sync::mpsc::Receiver<Bytes>, injector: &mut dyn InputInjector) {
    while let Some(payload) = input_rx.recv().await {
        match duallink_input::decode(&payload) {
            Ok(event) => {
                if let Err(e) = injector.inject(event) {
                    warn!(err = %e, "input injection failed");
                }
            }
            Err(e) => warn!(err = %e, "malformed input event dropped"),
        }
    }
}

#[instrument(skip_all, fields(active_id, passive_id))]
pub async fn endpoint_negotiate_visit_desktop_params(
    active_id: i64,
    passive_id: i64,
) -> Result<Vec<MonitorDescriptor>, AppError> {
    let state = state::get_endpoint(active_id, passive_id)?;
    let mut control_rx = state.control_rx.lock().await;
    let monitors = duallink_negotiate::request_display_info(&state.handle, &mut control_rx).await?;
    *state.last_monitors.lock().expect("monitors mutex poisoned") = monitors.clone();
    Ok(monitors)
}

#[instrument(skip_all, fields(active_id, passive_id, monitor_id, expect_fps))]
pub async fn endpoint_negotiate_select_monitor(
    active_id: i64,
    passive_id: i64,
    monitor_id: &str,
    expect_fps: u8,
) -> Result<bool, AppError> {
    let state = state::get_endpoint(active_id, passive_id)?;
    let mut control_rx = state.control_rx.lock().await;
    Ok(duallink_negotiate::request_select_monitor(&state.handle, &mut control_rx, monitor_id, expect_fps).await?)
}

#[instrument(skip_all, fields(active_id, passive_id, selected_monitor_id, expect_frame_rate))]
pub async fn endpoint_negotiate_finished(
    active_id: i64,
    passive_id: i64,
    selected_monitor_id: &str,
    expect_frame_rate: u8,
) -> Result<(), AppError> {
    let state = state::get_endpoint(active_id, passive_id)?;
    let mut control_rx = state.control_rx.lock().await;
    duallink_negotiate::request_finished(&state.handle, &mut control_rx, selected_monitor_id, expect_frame_rate)
        .await?;
    Ok(())
}

/// Active side (spec §6 `endpoint_input`): serializes and sends one input
/// event toward the passive side.
#[instrument(skip_all, fields(active_id, passive_id))]
pub fn endpoint_input(active_id: i64, passive_id: i64, event: InputEvent) -> Result<(), AppError> {
    let state = state::get_endpoint(active_id, passive_id)?;
    let payload = duallink_input::encode(&event);
    state.handle.send_input(Bytes::from(payload))?;
    Ok(())
}

/// Closes an endpoint session (spec §6 `endpoint_close` / §8 S6): signals
/// the reader/writer tasks to stop and deregisters it.
pub fn endpoint_close(active_id: i64, passive_id: i64) {
    if let Ok(state) = state::get_endpoint(active_id, passive_id) {
        state.handle.close();
    }
    state::remove_endpoint(active_id, passive_id);
}

/// Spawns a consumer task decoding every video packet arriving on the
/// `(active_id, passive_id)` endpoint session and delivering frames to
/// `sink` (spec §6's Frame Sink collaborator). Call once
/// `endpoint_negotiate_finished` has returned (active side, spec §4.7
/// `Streaming`). `codec`/`width`/`height` are the values negotiated via
/// `endpoint_negotiate_select_monitor`.
pub fn spawn_video_decoder(
    active_id: i64,
    passive_id: i64,
    codec: VideoCodec,
    width: u32,
    height: u32,
    sink: FrameSink,
) -> Result<(), AppError> {
    let state = state::get_endpoint(active_id, passive_id)?;
    let decoder_name = probe_best_decoder(codec).ok_or_else(|| {
        AppError::Codec(duallink_codec::CodecError::InitFailed("no usable decoder for this platform".into()))
    })?;
    let decoder = VideoDecoder::new(decoder_name, codec, width, height)?;

    tokio::spawn(async move {
        let mut video_rx = state.video_rx.lock().await;
        while let Some(payload) = video_rx.recv().await {
            let packet = match bincode::deserialize::<VideoPacket>(&payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!(err = %e, "malformed video packet dropped");
                    continue;
                }
            };
            if let Err(e) = decoder.decode(&packet, &sink) {
                warn!(err = %e, "decode failed, decoder thread exiting");
                break;
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_calls_round_trip_through_the_state_singleton() {
        let dir = tempfile::tempdir().unwrap();
        state::set_config_path(dir.path().join("duallink.json"));

        assert_eq!(read_primary_domain().unwrap(), None);
        save_primary_domain("default").unwrap();
        assert_eq!(read_primary_domain().unwrap().as_deref(), Some("default"));

        let cfg = DomainConfig {
            uri: "tcp://rv.local:28000".into(),
            device_id: 100,
            fingerprint: vec![1u8; 32],
            password: "hunter2".into(),
        };
        save_domain_config("default", cfg.clone()).unwrap();
        assert_eq!(read_domain_config("default").unwrap(), Some(cfg));
        assert_eq!(read_domain_config("other").unwrap(), None);
    }
}
