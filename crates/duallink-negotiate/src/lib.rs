//! Negotiation FSM (spec §4.7): runs once per endpoint session, directly
//! after handshake, over the session's control channel; finishes before
//! `Streaming` so it never multiplexes with video/audio/input traffic.
//!
//! Message shapes are grounded in MirrorX's `EndPointNegotiateVisitDesktopParamsRequest/Response`,
//! `MonitorDescription`, `EndPointNegotiateSelectMonitorResponse`,
//! `EndPointNegotiateFinishedRequest` (`examples/other_examples/..._message.rs.rs`),
//! collapsed to the three-round-trip shape spec.md §4.7 actually specifies:
//! display info → select monitor → finished.

use std::time::Duration;

use bytes::Bytes;
use duallink_core::MonitorDescriptor;
use duallink_endpoint::EndpointHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

/// Budget per negotiation round trip (spec §5).
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
enum NegotiateMessage {
    GetDisplayInfoRequest,
    DisplayInfoReply { monitors: Vec<MonitorDescriptor> },
    SelectMonitorRequest { monitor_id: String, expect_fps: u8 },
    SelectMonitorAck,
    MonitorNotFound,
    FinishedRequest { monitor_id: String, expect_fps: u8 },
    FinishedAck,
}

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("negotiation step timed out")]
    Timeout,
    #[error("control channel closed mid-negotiation")]
    ChannelClosed,
    #[error("negotiation protocol violation: {0}")]
    Protocol(String),
    #[error("failed to send on control channel: {0}")]
    Endpoint(#[from] duallink_endpoint::EndpointError),
}

/// Outcome of a successful negotiation: the parameters the passive side's
/// Capturer+Encoder must now be (re)started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedStream {
    pub monitor_id: String,
    pub expect_fps: u8,
}

/// The active side's state machine (spec §4.7, steps 1-3), driven to
/// completion by one call. `select` is given the advertised monitor list
/// and the ids rejected so far (`MonitorNotFound`, non-fatal) and must
/// return a monitor id, still present in the list, to try next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveNegotiationState {
    SendGetDisplayInfo,
    AwaitDisplayInfo,
    SelectMonitor,
    AwaitSelectAck,
    Finalize,
    AwaitFinishedAck,
    Streaming,
}

/// Stepwise active-side calls, one per spec §6 FFI entry point
/// (`endpoint_negotiate_visit_desktop_params`, `endpoint_negotiate_select_monitor`,
/// `endpoint_negotiate_finished`) — an alternative to [`run_active`] for a
/// caller (e.g. `duallink-app`'s external interface) that drives the FSM
/// across separate calls instead of supplying a `select` closure upfront,
/// because a real caller shows the user a monitor-picker dialog between
/// `GetDisplayInfo` and `SelectMonitor` rather than deciding synchronously.
#[instrument(skip_all)]
pub async fn request_display_info(
    handle: &EndpointHandle,
    control_rx: &mut mpsc::Receiver<Bytes>,
) -> Result<Vec<MonitorDescriptor>, NegotiateError> {
    send(handle, &NegotiateMessage::GetDisplayInfoRequest)?;
    match recv(control_rx).await? {
        NegotiateMessage::DisplayInfoReply { monitors } => Ok(monitors),
        other => Err(illegal(ActiveNegotiationState::AwaitDisplayInfo, &other)),
    }
}

/// Returns `Ok(true)` on `Ack`, `Ok(false)` on the non-fatal `MonitorNotFound`
/// (spec §4.7 — the caller may retry with another id without tearing down
/// the session).
#[instrument(skip_all)]
pub async fn request_select_monitor(
    handle: &EndpointHandle,
    control_rx: &mut mpsc::Receiver<Bytes>,
    monitor_id: &str,
    expect_fps: u8,
) -> Result<bool, NegotiateError> {
    let fps = expect_fps.clamp(1, 120);
    send(
        handle,
        &NegotiateMessage::SelectMonitorRequest { monitor_id: monitor_id.to_string(), expect_fps: fps },
    )?;
    match recv(control_rx).await? {
        NegotiateMessage::SelectMonitorAck => Ok(true),
        NegotiateMessage::MonitorNotFound => Ok(false),
        other => Err(illegal(ActiveNegotiationState::AwaitSelectAck, &other)),
    }
}

#[instrument(skip_all)]
pub async fn request_finished(
    handle: &EndpointHandle,
    control_rx: &mut mpsc::Receiver<Bytes>,
    monitor_id: &str,
    expect_fps: u8,
) -> Result<(), NegotiateError> {
    send(
        handle,
        &NegotiateMessage::FinishedRequest {
            monitor_id: monitor_id.to_string(),
            expect_fps: expect_fps.clamp(1, 120),
        },
    )?;
    match recv(control_rx).await? {
        NegotiateMessage::FinishedAck => Ok(()),
        other => Err(illegal(ActiveNegotiationState::AwaitFinishedAck, &other)),
    }
}

#[instrument(skip_all)]
pub async fn run_active(
    handle: &EndpointHandle,
    control_rx: &mut mpsc::Receiver<Bytes>,
    mut select: impl FnMut(&[MonitorDescriptor], &[String]) -> (String, u8),
) -> Result<SelectedStream, NegotiateError> {
    let mut state = ActiveNegotiationState::SendGetDisplayInfo;

    send(handle, &NegotiateMessage::GetDisplayInfoRequest)?;
    state = ActiveNegotiationState::AwaitDisplayInfo;
    let monitors = match recv(control_rx).await? {
        NegotiateMessage::DisplayInfoReply { monitors } => monitors,
        other => return Err(illegal(state, &other)),
    };
    state = ActiveNegotiationState::SelectMonitor;

    let mut rejected = Vec::new();
    let (monitor_id, fps) = loop {
        let (id, requested_fps) = select(&monitors, &rejected);
        let fps = requested_fps.clamp(1, 120);
        send(
            handle,
            &NegotiateMessage::SelectMonitorRequest { monitor_id: id.clone(), expect_fps: fps },
        )?;
        state = ActiveNegotiationState::AwaitSelectAck;
        match recv(control_rx).await? {
            NegotiateMessage::SelectMonitorAck => break (id, fps),
            NegotiateMessage::MonitorNotFound => {
                rejected.push(id);
                state = ActiveNegotiationState::SelectMonitor;
                continue;
            }
            other => return Err(illegal(state, &other)),
        }
    };

    state = ActiveNegotiationState::Finalize;
    send(
        handle,
        &NegotiateMessage::FinishedRequest { monitor_id: monitor_id.clone(), expect_fps: fps },
    )?;
    state = ActiveNegotiationState::AwaitFinishedAck;
    match recv(control_rx).await? {
        NegotiateMessage::FinishedAck => {}
        other => return Err(illegal(state, &other)),
    }

    Ok(SelectedStream { monitor_id, expect_fps: fps })
}

/// The passive side's mirror (spec §4.7): answers `GetDisplayInfoRequest`
/// with the live monitor list, validates `SelectMonitorRequest` against it
/// (`MonitorNotFound` is non-fatal — the loop keeps listening for another
/// attempt), and confirms `FinishedRequest` only if it names the already
/// selected monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveNegotiationState {
    AwaitGetDisplayInfo,
    AwaitSelectMonitor,
    AwaitFinished,
    Streaming,
}

#[instrument(skip_all)]
pub async fn run_passive(
    handle: &EndpointHandle,
    control_rx: &mut mpsc::Receiver<Bytes>,
    list_monitors: impl FnOnce() -> Vec<MonitorDescriptor>,
) -> Result<SelectedStream, NegotiateError> {
    let mut state = PassiveNegotiationState::AwaitGetDisplayInfo;

    match recv(control_rx).await? {
        NegotiateMessage::GetDisplayInfoRequest => {}
        other => return Err(illegal(state, &other)),
    }

    let monitors = list_monitors();
    send(handle, &NegotiateMessage::DisplayInfoReply { monitors: monitors.clone() })?;
    state = PassiveNegotiationState::AwaitSelectMonitor;

    let (monitor_id, fps) = loop {
        match recv(control_rx).await? {
            NegotiateMessage::SelectMonitorRequest { monitor_id, expect_fps } => {
                let fps = expect_fps.clamp(1, 120);
                if monitors.iter().any(|m| m.id == monitor_id) {
                    send(handle, &NegotiateMessage::SelectMonitorAck)?;
                    break (monitor_id, fps);
                }
                send(handle, &NegotiateMessage::MonitorNotFound)?;
            }
            other => return Err(illegal(state, &other)),
        }
    };

    state = PassiveNegotiationState::AwaitFinished;
    match recv(control_rx).await? {
        NegotiateMessage::FinishedRequest { monitor_id: finished_id, expect_fps: _ }
            if finished_id == monitor_id =>
        {
            send(handle, &NegotiateMessage::FinishedAck)?;
        }
        other => return Err(illegal(state, &other)),
    }

    Ok(SelectedStream { monitor_id, expect_fps: fps })
}

fn send(handle: &EndpointHandle, message: &NegotiateMessage) -> Result<(), NegotiateError> {
    let payload = bincode::serialize(message).expect("NegotiateMessage is always serializable");
    handle.send_control(Bytes::from(payload))?;
    Ok(())
}

async fn recv(control_rx: &mut mpsc::Receiver<Bytes>) -> Result<NegotiateMessage, NegotiateError> {
    let payload = tokio::time::timeout(STEP_TIMEOUT, control_rx.recv())
        .await
        .map_err(|_| NegotiateError::Timeout)?
        .ok_or(NegotiateError::ChannelClosed)?;
    bincode::deserialize(&payload).map_err(|e| NegotiateError::Protocol(e.to_string()))
}

fn illegal<S: std::fmt::Debug>(state: S, message: &NegotiateMessage) -> NegotiateError {
    NegotiateError::Protocol(format!("{message:?} illegal in state {state:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: &str) -> MonitorDescriptor {
        MonitorDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            refresh_rate: 60,
            width: 1920,
            height: 1080,
            is_primary: true,
            screenshot: Vec::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_streaming_on_both_sides() {
        let (active_session, passive_session) = duallink_endpoint_test_support::paired_sessions().await;

        let active_handle = active_session.handle.clone();
        let mut active_control_rx = active_session.channels.control_rx;
        let passive_handle = passive_session.handle.clone();
        let mut passive_control_rx = passive_session.channels.control_rx;

        let monitors = vec![monitor("m1"), monitor("m2")];
        let monitors_for_passive = monitors.clone();

        let active_fut = run_active(&active_handle, &mut active_control_rx, |list, rejected| {
            let pick = list.iter().find(|m| !rejected.contains(&m.id)).unwrap();
            (pick.id.clone(), 60)
        });
        let passive_fut =
            run_passive(&passive_handle, &mut passive_control_rx, || monitors_for_passive);

        let (active_result, passive_result) = tokio::join!(active_fut, passive_fut);
        let active_result = active_result.unwrap();
        let passive_result = passive_result.unwrap();
        assert_eq!(active_result, passive_result);
        assert_eq!(active_result.expect_fps, 60);
    }

    #[tokio::test]
    async fn unknown_monitor_is_retried_not_fatal() {
        let (active_session, passive_session) = duallink_endpoint_test_support::paired_sessions().await;

        let active_handle = active_session.handle.clone();
        let mut active_control_rx = active_session.channels.control_rx;
        let passive_handle = passive_session.handle.clone();
        let mut passive_control_rx = passive_session.channels.control_rx;

        let monitors = vec![monitor("only-valid")];
        let monitors_for_passive = monitors.clone();

        let mut first_try = true;
        let active_fut = run_active(&active_handle, &mut active_control_rx, move |_list, _rejected| {
            if first_try {
                first_try = false;
                ("does-not-exist".to_string(), 30)
            } else {
                ("only-valid".to_string(), 30)
            }
        });
        let passive_fut =
            run_passive(&passive_handle, &mut passive_control_rx, || monitors_for_passive);

        let (active_result, passive_result) = tokio::join!(active_fut, passive_fut);
        assert_eq!(active_result.unwrap().monitor_id, "only-valid");
        assert_eq!(passive_result.unwrap().monitor_id, "only-valid");
    }

    #[tokio::test]
    async fn stepwise_active_calls_match_bulk_run_active() {
        let (active_session, passive_session) = duallink_endpoint_test_support::paired_sessions().await;

        let active_handle = active_session.handle.clone();
        let mut active_control_rx = active_session.channels.control_rx;
        let passive_handle = passive_session.handle.clone();
        let mut passive_control_rx = passive_session.channels.control_rx;

        let monitors = vec![monitor("m1")];
        let monitors_for_passive = monitors.clone();
        let passive_fut = run_passive(&passive_handle, &mut passive_control_rx, || monitors_for_passive);

        let active_fut = async {
            let received = request_display_info(&active_handle, &mut active_control_rx).await.unwrap();
            assert_eq!(received, monitors);
            let ok = request_select_monitor(&active_handle, &mut active_control_rx, "m1", 60)
                .await
                .unwrap();
            assert!(ok);
            request_finished(&active_handle, &mut active_control_rx, "m1", 60).await
        };

        let (active_result, passive_result) = tokio::join!(active_fut, passive_fut);
        active_result.unwrap();
        assert_eq!(passive_result.unwrap().monitor_id, "m1");
    }
}

#[cfg(test)]
mod duallink_endpoint_test_support {
    use duallink_core::{AeadKeyPair, VisitCredentials};
    use duallink_endpoint::{connect, handshake_active, handshake_passive, EndpointListener, EndpointSession};

    pub async fn paired_sessions() -> (EndpointSession, EndpointSession) {
        let listener = EndpointListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let credentials = VisitCredentials(vec![1u8; 16]);
        let keys_active = AeadKeyPair {
            sealing_key: [5u8; 32],
            sealing_nonce: 0,
            opening_key: [6u8; 32],
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

        let active_fut =
            handshake_active(active_reader, active_writer, 1, 2, credentials.clone(), keys_active);
        let passive_fut =
            handshake_passive(passive_reader, passive_writer, 2, 1, &credentials, keys_passive);

        let (active_session, passive_session) = tokio::join!(active_fut, passive_fut);
        (active_session.unwrap(), passive_session.unwrap())
    }
}
