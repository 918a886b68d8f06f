//! Capturer (spec §4.4): a platform screen grabber producing NV12 frames at
//! a target FPS from a chosen monitor, behind a `list_monitors` / `start` /
//! `stop` contract.
//!
//! Grounded in the teacher's `duallink-capture-linux` (ashpd portal
//! negotiation feeding a GStreamer `pipewiresrc` pipeline), generalized in
//! three ways the spec requires that the teacher's sender-only crate didn't:
//! the teacher emits BGRx through a pull-style `next_frame()` consumer API;
//! this crate instead emits NV12 (spec's fixed pixel format, extracted via
//! `gstreamer_video`'s plane-aware `VideoFrameRef` rather than a raw byte
//! copy) and pushes frames through a caller-supplied `sink` callback from a
//! `start`/`stop` lifecycle with a guaranteed-quiescent stop.

use std::sync::Arc;

use async_trait::async_trait;
use duallink_core::{MonitorDescriptor, VideoFrame};
use thiserror::Error;

/// The `Capture` error category (spec §7): device enumeration, permission,
/// unexpected stream end. All variants are fatal to the passive-side session
/// that owns this capturer.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no monitor with id {0}")]
    MonitorNotFound(String),
    #[error("device enumeration failed: {0}")]
    EnumerationFailed(String),
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture stream ended unexpectedly: {0}")]
    StreamEnded(String),
    #[error("capture pipeline error: {0}")]
    Pipeline(String),
}

/// Invoked once per captured frame (spec §4.4 `start`). Called from the
/// capturer's own pipeline thread, never from the async executor — spec §5
/// requires capture threads never suspend.
pub type FrameSink = Arc<dyn Fn(VideoFrame) + Send + Sync>;

/// Spec §4.4's contract: enumerate monitors, start delivering frames from
/// one of them at approximately `target_fps`, and stop with no further
/// callbacks once `stop` returns.
#[async_trait]
pub trait Capturer: Send {
    async fn list_monitors(&mut self) -> Result<Vec<MonitorDescriptor>, CaptureError>;

    fn start(&mut self, monitor_id: &str, target_fps: u32, sink: FrameSink) -> Result<(), CaptureError>;

    /// Guaranteed-quiescent on return: no callbacks fire after this returns
    /// (spec §4.4).
    fn stop(&mut self);
}

#[cfg(target_os = "linux")]
pub use linux::PipewireCapturer;

#[cfg(target_os = "linux")]
mod linux {
    use super::{CaptureError, Capturer, FrameSink};
    use duallink_core::{ColorRange, MonitorDescriptor, VideoFrame};

    use std::os::fd::{AsRawFd, OwnedFd};

    use ashpd::desktop::screencast::{CaptureType, Persist, ScreenCast, SourceType, Stream};
    use gstreamer::prelude::*;
    use gstreamer_app::{AppSink, AppSinkCallbacks};
    use gstreamer_video::VideoFrameExt;
    use tracing::{debug, warn};

    /// One portal-negotiated candidate output, cached by [`PipewireCapturer::list_monitors`]
    /// so `start` doesn't have to re-run the portal dialog.
    struct NegotiatedStream {
        node_id: u32,
        width: u32,
        height: u32,
    }

    /// Linux realization of [`Capturer`]: negotiates a PipeWire screen-cast
    /// session via the XDG desktop portal (`ashpd`), then pipes the chosen
    /// node through GStreamer (`pipewiresrc ! videoconvert ! video/x-raw,format=NV12`)
    /// into an `appsink` that hands NV12 planes to the caller's `sink`.
    pub struct PipewireCapturer {
        /// Kept alive so the PipeWire remote fd stays valid for the duration
        /// of every pipeline built from it; closed automatically on drop.
        session_fd: Option<OwnedFd>,
        streams: Vec<NegotiatedStream>,
        pipeline: Option<gstreamer::Pipeline>,
    }

    impl Default for PipewireCapturer {
        fn default() -> Self {
            Self { session_fd: None, streams: Vec::new(), pipeline: None }
        }
    }

    impl PipewireCapturer {
        pub fn new() -> Self {
            Self::default()
        }

        async fn negotiate(&mut self) -> Result<(), CaptureError> {
            let proxy = ScreenCast::new()
                .await
                .map_err(|e| CaptureError::EnumerationFailed(e.to_string()))?;

            let session = proxy
                .create_session()
                .await
                .map_err(|e| CaptureError::EnumerationFailed(e.to_string()))?;

            proxy
                .select_sources(
                    &session,
                    CaptureType::SCREEN,
                    SourceType::MONITOR,
                    true, // multiple: enumerate every output, not just one
                    None,
                    Persist::DoNot,
                )
                .await
                .map_err(|e| CaptureError::EnumerationFailed(e.to_string()))?;

            let response = proxy
                .start(&session, &ashpd::WindowIdentifier::default())
                .await
                .map_err(|e| CaptureError::EnumerationFailed(e.to_string()))?
                .response()
                .map_err(|_| CaptureError::PermissionDenied)?;

            let streams: Vec<Stream> = response.streams().to_vec();
            if streams.is_empty() {
                return Err(CaptureError::EnumerationFailed("portal returned no streams".into()));
            }

            let fd: OwnedFd = proxy
                .open_pipe_wire_remote(&session)
                .await
                .map_err(|e| CaptureError::EnumerationFailed(e.to_string()))?
                .into();

            self.session_fd = Some(fd);
            self.streams = streams
                .iter()
                .map(|s| {
                    let (width, height) = s.size().unwrap_or((1920, 1080));
                    NegotiatedStream { node_id: s.pipe_wire_node_id(), width: width as u32, height: height as u32 }
                })
                .collect();

            // `session` is intentionally allowed to drop here: ashpd keeps the
            // portal-side session alive for the lifetime of the PipeWire fd we
            // already extracted; this capturer tracks the fd, not the session
            // handle, matching the teacher's `negotiate_portal` shape.
            let _ = session;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Capturer for PipewireCapturer {
        async fn list_monitors(&mut self) -> Result<Vec<MonitorDescriptor>, CaptureError> {
            if self.streams.is_empty() {
                self.negotiate().await?;
            }
            Ok(self
                .streams
                .iter()
                .enumerate()
                .map(|(i, s)| MonitorDescriptor {
                    id: s.node_id.to_string(),
                    name: format!("display-{i}"),
                    refresh_rate: 60,
                    width: s.width.min(u16::MAX as u32) as u16,
                    height: s.height.min(u16::MAX as u32) as u16,
                    is_primary: i == 0,
                    screenshot: Vec::new(),
                })
                .collect())
        }

        fn start(&mut self, monitor_id: &str, target_fps: u32, sink: FrameSink) -> Result<(), CaptureError> {
            let Some(fd) = self.session_fd.as_ref().map(|fd| fd.as_raw_fd()) else {
                return Err(CaptureError::EnumerationFailed(
                    "list_monitors must be called before start".into(),
                ));
            };
            let stream = self
                .streams
                .iter()
                .find(|s| s.node_id.to_string() == monitor_id)
                .ok_or_else(|| CaptureError::MonitorNotFound(monitor_id.to_string()))?;

            gstreamer::init().map_err(|e| CaptureError::Pipeline(e.to_string()))?;

            let desc = format!(
                "pipewiresrc fd={fd} path={node_id} do-timestamp=true \
                 ! videoconvert \
                 ! video/x-raw,format=NV12,framerate={target_fps}/1,colorimetry=bt709 \
                 ! appsink name=sink max-buffers=2 drop=true sync=false emit-signals=false",
                node_id = stream.node_id,
            );
            debug!(pipeline = %desc, "capture pipeline");

            let pipeline = gstreamer::parse::launch(&desc)
                .map_err(|e| CaptureError::Pipeline(e.to_string()))?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| CaptureError::Pipeline("expected a Pipeline element".into()))?;

            let appsink: AppSink = pipeline
                .by_name("sink")
                .ok_or_else(|| CaptureError::Pipeline("no appsink named 'sink'".into()))?
                .downcast::<AppSink>()
                .map_err(|_| CaptureError::Pipeline("expected AppSink".into()))?;

            appsink.set_callbacks(
                AppSinkCallbacks::builder()
                    .new_sample(move |appsink| {
                        let sample = appsink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                        let caps = sample.caps().ok_or(gstreamer::FlowError::Error)?;
                        let info = gstreamer_video::VideoInfo::from_caps(caps)
                            .map_err(|_| gstreamer::FlowError::Error)?;
                        let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;
                        let frame = gstreamer_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
                            .map_err(|_| gstreamer::FlowError::Error)?;

                        let pts = buffer.pts().map(|t| t.useconds() as i64).unwrap_or(0);
                        let y_stride = frame.plane_stride()[0] as u32;
                        let uv_stride = frame.plane_stride()[1] as u32;
                        let y_plane = bytes::Bytes::copy_from_slice(frame.plane_data(0).unwrap_or(&[]));
                        let uv_plane = bytes::Bytes::copy_from_slice(frame.plane_data(1).unwrap_or(&[]));

                        let video_frame = VideoFrame {
                            y_plane,
                            y_stride,
                            uv_plane,
                            uv_stride,
                            width: info.width(),
                            height: info.height(),
                            color_range: ColorRange::Full,
                            dts: pts,
                            pts,
                            timebase: (1, 1_000_000),
                        };
                        sink(video_frame);
                        Ok(gstreamer::FlowSuccess::Ok)
                    })
                    .build(),
            );

            pipeline
                .set_state(gstreamer::State::Playing)
                .map_err(|e| CaptureError::Pipeline(e.to_string()))?;
            self.pipeline = Some(pipeline);
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(pipeline) = self.pipeline.take() {
                // `set_state(Null)` blocks until the transition completes, so
                // no appsink callback can fire after this call returns (spec
                // §4.4's "guaranteed-quiescent on return").
                if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                    warn!(err = %e, "capture pipeline failed to reach Null state cleanly");
                }
            }
        }
    }

    impl Drop for PipewireCapturer {
        fn drop(&mut self) {
            self.stop();
            // `session_fd` (an `OwnedFd`) closes itself when dropped here.
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::PipewireCapturer;

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::{CaptureError, Capturer, FrameSink};
    use duallink_core::MonitorDescriptor;

    /// Non-Linux platforms (spec §4.4 describes AVFoundation/DXGI
    /// realizations for Mac/Windows) are out of this workspace's buildable
    /// scope — see `DESIGN.md`.
    #[derive(Default)]
    pub struct PipewireCapturer;

    #[async_trait::async_trait]
    impl Capturer for PipewireCapturer {
        async fn list_monitors(&mut self) -> Result<Vec<MonitorDescriptor>, CaptureError> {
            Err(CaptureError::EnumerationFailed(
                "capture is only implemented for Linux in this workspace".into(),
            ))
        }

        fn start(&mut self, _monitor_id: &str, _target_fps: u32, _sink: FrameSink) -> Result<(), CaptureError> {
            Err(CaptureError::EnumerationFailed(
                "capture is only implemented for Linux in this workspace".into(),
            ))
        }

        fn stop(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_not_found_is_reported_not_panicking() {
        let err = CaptureError::MonitorNotFound("99".into());
        assert_eq!(err.to_string(), "no monitor with id 99");
    }
}
