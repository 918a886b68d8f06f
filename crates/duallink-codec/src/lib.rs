//! Video Encoder / Video Decoder (spec §4.5/§4.6): thin, safe GStreamer
//! wrappers converting between NV12 [`VideoFrame`]s and Annex-B
//! [`VideoPacket`]s.
//!
//! Grounded in the teacher's `duallink-linux-sender/encoder.rs` (hardware
//! encoder priority list, GStreamer pipeline construction) and
//! `duallink-decoder` (decode pipeline, EAGAIN/EOF handling, hardware-frame
//! to CPU-NV12 transfer via `vaapipostproc`). Generalized beyond the
//! teacher's H.264-only, BGRx-in/BGRA-out pipelines: NV12 in, Annex-B out,
//! HEVC added alongside H.264 in both priority lists, B-frames forced to 0,
//! GOP pinned to `3 * fps`, BT.709 colorimetry with the range threaded from
//! the source frame, and parameter-mismatch handling (drop + reinit +
//! `parameters_changed` on the encoder side, flush-on-flag on the decoder
//! side) that the teacher's fixed-resolution pipelines never needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use duallink_core::{ColorRange, VideoCodec, VideoFrame, VideoPacket};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use gstreamer_video::VideoFrameExt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The `Codec` error category (spec §7): init failure, option rejected,
/// decode/encode non-EAGAIN error. Encode errors surface on the next frame
/// submission; decode errors terminate the decoder.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec init failed: {0}")]
    InitFailed(String),
    #[error("option {option} rejected: {reason}")]
    OptionRejected { option: String, reason: String },
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("no hardware-accelerated codec available, and no software fallback found")]
    Unavailable,
}

/// Invoked once per produced [`VideoPacket`] (encoder) or [`VideoFrame`]
/// (decoder).
pub type PacketSink = Arc<dyn Fn(VideoPacket) + Send + Sync>;
pub type FrameSink = Arc<dyn Fn(VideoFrame) + Send + Sync>;

/// GOP length, spec §4.5: `3 * fps`.
pub fn gop_length(fps: u32) -> u32 {
    3 * fps
}

fn colorimetry(range: ColorRange) -> &'static str {
    // GStreamer colorimetry strings are `range:matrix:transfer:primaries`;
    // `2` is limited (studio) range, `1` is full range, both BT.709.
    match range {
        ColorRange::Studio => "2:4:7:1",
        ColorRange::Full => "1:4:7:1",
    }
}

// ── Encoder element selection ────────────────────────────────────────────

struct EncoderCandidate {
    element: &'static str,
    /// GStreamer property fragment appended after the element name. `{gop}`
    /// and `{bitrate}` are substituted at pipeline-build time.
    props: &'static str,
}

fn encoder_candidates(codec: VideoCodec) -> &'static [EncoderCandidate] {
    match codec {
        VideoCodec::H264 => &[
            EncoderCandidate { element: "vaapih264enc", props: "rate-control=cbr bitrate={bitrate} keyframe-period={gop} b-frames=0" },
            EncoderCandidate { element: "nvh264enc", props: "preset=low-latency-hq rc-mode=cbr bitrate={bitrate} gop-size={gop} bframes=0" },
            EncoderCandidate { element: "x264enc", props: "tune=zerolatency speed-preset=veryfast bitrate={bitrate} key-int-max={gop} bframes=0" },
        ],
        VideoCodec::H265 => &[
            EncoderCandidate { element: "vah265enc", props: "rate-control=cbr bitrate={bitrate} key-int-max={gop} b-frames=0" },
            EncoderCandidate { element: "nvh265enc", props: "preset=low-latency-hq rc-mode=cbr bitrate={bitrate} gop-size={gop}" },
            EncoderCandidate { element: "x265enc", props: "tune=zerolatency speed-preset=veryfast bitrate={bitrate} key-int-max={gop}" },
        ],
    }
}

/// Returns the highest-priority available encoder element for `codec`.
pub fn probe_best_encoder(codec: VideoCodec) -> Option<&'static str> {
    gst::init().ok()?;
    encoder_candidates(codec).iter().find_map(|c| {
        gst::ElementFactory::find(c.element).map(|_| {
            info!(element = c.element, "selected video encoder");
            c.element
        })
    })
}

fn decoder_candidates(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::H264 => &["vaapih264dec", "nvh264dec", "avdec_h264"],
        VideoCodec::H265 => &["vaapih265dec", "nvh265dec", "avdec_h265"],
    }
}

/// Returns the highest-priority available decoder element for `codec`.
pub fn probe_best_decoder(codec: VideoCodec) -> Option<&'static str> {
    gst::init().ok()?;
    decoder_candidates(codec).iter().find_map(|&name| {
        gst::ElementFactory::find(name).map(|_| {
            info!(element = name, "selected video decoder");
            name
        })
    })
}

// ── VideoEncoder ──────────────────────────────────────────────────────────

/// Tunable knobs rejected or accepted wholesale at [`VideoEncoder::open`]
/// (spec §4.5 "set options").
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    pub bitrate_kbps: u32,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self { bitrate_kbps: 8_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConfiguredParams {
    width: u32,
    height: u32,
    color_range: ColorRange,
}

struct EncoderShared {
    sink: PacketSink,
    codec: VideoCodec,
    parameters_changed_pending: AtomicBool,
}

/// Wraps a hardware-preferred NV12→Annex-B encoder (spec §4.5). `encode`
/// drops and reinitializes on a parameter mismatch per spec §3's invariant;
/// the first packet after a reinit carries `parameters_changed = true`.
pub struct VideoEncoder {
    element: &'static str,
    codec: VideoCodec,
    fps: u32,
    options: EncoderOptions,
    configured: ConfiguredParams,
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    shared: Arc<EncoderShared>,
}

impl VideoEncoder {
    /// `new(encoder_name, width, height, fps)` + `open()` from spec §4.5,
    /// collapsed into one call: GStreamer pipelines are built ready-to-play,
    /// there is no meaningful "configured but not open" intermediate state.
    pub fn open(
        encoder_name: &'static str,
        codec: VideoCodec,
        width: u32,
        height: u32,
        fps: u32,
        color_range: ColorRange,
        options: EncoderOptions,
        sink: PacketSink,
    ) -> Result<Self, CodecError> {
        gst::init().map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let candidate = encoder_candidates(codec)
            .iter()
            .find(|c| c.element == encoder_name)
            .ok_or_else(|| CodecError::OptionRejected {
                option: "encoder_name".into(),
                reason: format!("{encoder_name} is not a known encoder for {codec:?}"),
            })?;

        let shared = Arc::new(EncoderShared {
            sink,
            codec,
            parameters_changed_pending: AtomicBool::new(false),
        });

        let (pipeline, appsrc) =
            build_encoder_pipeline(candidate, width, height, fps, color_range, &options, shared.clone())?;

        Ok(Self {
            element: encoder_name,
            codec,
            fps,
            options,
            configured: ConfiguredParams { width, height, color_range },
            pipeline,
            appsrc,
            shared,
        })
    }

    pub fn element_name(&self) -> &'static str {
        self.element
    }

    /// Encodes one frame. Per spec §3: if `(width, height, color_range)`
    /// doesn't match the configured values, the frame is dropped and the
    /// encoder is reinitialized — the *next* submitted frame is the one
    /// that produces output, with `parameters_changed = true` on its first
    /// packet.
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<(), CodecError> {
        if !frame.is_well_formed() {
            return Err(CodecError::EncodeFailed("frame violates stride/plane invariants".into()));
        }

        let submitted = ConfiguredParams { width: frame.width, height: frame.height, color_range: frame.color_range };
        if submitted != self.configured {
            warn!(
                old = ?self.configured,
                new = ?submitted,
                "encoder parameters changed — dropping this frame and reinitializing"
            );
            self.reinit(submitted)?;
            return Ok(());
        }

        push_nv12_buffer(&self.appsrc, frame).map_err(CodecError::EncodeFailed)
    }

    fn reinit(&mut self, params: ConfiguredParams) -> Result<(), CodecError> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let candidate = encoder_candidates(self.codec)
            .iter()
            .find(|c| c.element == self.element)
            .expect("element was validated in open()");

        let (pipeline, appsrc) = build_encoder_pipeline(
            candidate,
            params.width,
            params.height,
            self.fps,
            params.color_range,
            &self.options,
            self.shared.clone(),
        )?;
        self.shared.parameters_changed_pending.store(true, Ordering::Release);
        self.pipeline = pipeline;
        self.appsrc = appsrc;
        self.configured = params;
        Ok(())
    }
}

fn build_encoder_pipeline(
    candidate: &EncoderCandidate,
    width: u32,
    height: u32,
    fps: u32,
    color_range: ColorRange,
    options: &EncoderOptions,
    shared: Arc<EncoderShared>,
) -> Result<(gst::Pipeline, AppSrc), CodecError> {
    let gop = gop_length(fps);
    let props = candidate
        .props
        .replace("{gop}", &gop.to_string())
        .replace("{bitrate}", &options.bitrate_kbps.to_string());
    let colorimetry = colorimetry(color_range);
    let parser = match shared.codec {
        VideoCodec::H264 => "h264parse",
        VideoCodec::H265 => "h265parse",
    };
    let stream_caps = match shared.codec {
        VideoCodec::H264 => "video/x-h264,stream-format=byte-stream,alignment=au",
        VideoCodec::H265 => "video/x-h265,stream-format=byte-stream,alignment=au",
    };

    let desc = format!(
        "appsrc name=src is-live=true format=time \
             caps=\"video/x-raw,format=NV12,width={width},height={height},framerate={fps}/1,colorimetry={colorimetry}\" \
         ! {element} {props} \
         ! {stream_caps} \
         ! {parser} \
         ! appsink name=sink max-buffers=4 drop=false sync=false emit-signals=false",
        element = candidate.element,
    );
    debug!(pipeline = %desc, "encoder pipeline");

    let pipeline = gst::parse::launch(&desc)
        .map_err(|e| CodecError::InitFailed(e.to_string()))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| CodecError::InitFailed("expected a Pipeline element".into()))?;

    let appsrc: AppSrc = pipeline
        .by_name("src")
        .ok_or_else(|| CodecError::InitFailed("no appsrc named 'src'".into()))?
        .downcast::<AppSrc>()
        .map_err(|_| CodecError::InitFailed("expected AppSrc".into()))?;

    let appsink: AppSink = pipeline
        .by_name("sink")
        .ok_or_else(|| CodecError::InitFailed("no appsink named 'sink'".into()))?
        .downcast::<AppSink>()
        .map_err(|_| CodecError::InitFailed("expected AppSink".into()))?;

    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let pts = buffer.pts().map(|t| t.useconds() as i64).unwrap_or(0);
                let dts = buffer.dts().map(|t| t.useconds() as i64).unwrap_or(pts);
                let is_keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                let data = bytes::Bytes::copy_from_slice(map.as_slice());

                let parameters_changed = shared.parameters_changed_pending.swap(false, Ordering::AcqRel);
                (shared.sink)(VideoPacket {
                    data,
                    dts,
                    pts,
                    timebase: (1, 1_000_000),
                    codec: shared.codec,
                    parameters_changed,
                    is_keyframe,
                });
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| CodecError::InitFailed(e.to_string()))?;

    Ok((pipeline, appsrc))
}

fn push_nv12_buffer(appsrc: &AppSrc, frame: &VideoFrame) -> Result<(), String> {
    let uv_height = frame.height / 2;
    let y_len = frame.y_stride as usize * frame.height as usize;
    let uv_len = frame.uv_stride as usize * uv_height as usize;

    let mut buf = gst::Buffer::with_size(y_len + uv_len).map_err(|_| "buffer allocation failed".to_string())?;
    {
        let buf_mut = buf.get_mut().expect("buffer has a single owner here");
        buf_mut.set_pts(gst::ClockTime::from_useconds(frame.pts.max(0) as u64));
        buf_mut.set_dts(gst::ClockTime::from_useconds(frame.dts.max(0) as u64));
        let mut map = buf_mut.map_writable().map_err(|_| "buffer map failed".to_string())?;
        map[..frame.y_plane.len()].copy_from_slice(&frame.y_plane);
        map[y_len..y_len + frame.uv_plane.len()].copy_from_slice(&frame.uv_plane);
    }

    appsrc.push_buffer(buf).map(|_| ()).map_err(|e| format!("appsrc push_buffer: {e:?}"))
}

// ── VideoDecoder ──────────────────────────────────────────────────────────

/// Wraps a hardware-preferred Annex-B→NV12 decoder (spec §4.6). `decode`
/// treats a pull timeout (the GStreamer equivalent of EAGAIN — the pipeline
/// hasn't produced output yet) as non-fatal; any other pipeline error
/// terminates the decoder.
pub struct VideoDecoder {
    element: &'static str,
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    width: u32,
    height: u32,
}

impl VideoDecoder {
    /// `new(decoder_name)` from spec §4.6: attaches a hardware device
    /// context when `decoder_name` names a hardware element (`vaapi*`/
    /// `nv*`), otherwise builds a software pipeline behind the codec's
    /// bitstream parser (`h264parse`/`h265parse`).
    pub fn new(decoder_name: &'static str, codec: VideoCodec, width: u32, height: u32) -> Result<Self, CodecError> {
        gst::init().map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let parser = match codec {
            VideoCodec::H264 => "h264parse",
            VideoCodec::H265 => "h265parse",
        };
        let caps = match codec {
            VideoCodec::H264 => "video/x-h264,stream-format=byte-stream,alignment=au",
            VideoCodec::H265 => "video/x-h265,stream-format=byte-stream,alignment=au",
        };
        // Hardware decoders hand back GPU-resident surfaces; `vaapipostproc`
        // (rather than plain `videoconvert`) is what actually maps those
        // back to CPU-visible system memory (grounded in the teacher's
        // `GStreamerDisplayDecoder`, which hit a height-alignment assertion
        // using `videoconvert` directly on VA-API surfaces).
        let postproc = if decoder_name.starts_with("vaapi") || decoder_name.starts_with("va") {
            "vaapipostproc"
        } else {
            "videoconvert"
        };

        let desc = format!(
            "appsrc name=src format=time is-live=true caps=\"{caps}\" \
             ! {parser} \
             ! {decoder_name} \
             ! {postproc} \
             ! video/x-raw,format=NV12 \
             ! appsink name=sink sync=false max-buffers=4 drop=true emit-signals=false"
        );
        debug!(pipeline = %desc, "decoder pipeline");

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CodecError::InitFailed("expected a Pipeline element".into()))?;

        let appsrc: AppSrc = pipeline
            .by_name("src")
            .ok_or_else(|| CodecError::InitFailed("no appsrc named 'src'".into()))?
            .downcast::<AppSrc>()
            .map_err(|_| CodecError::InitFailed("expected AppSrc".into()))?;
        let appsink: AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| CodecError::InitFailed("no appsink named 'sink'".into()))?
            .downcast::<AppSink>()
            .map_err(|_| CodecError::InitFailed("expected AppSink".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CodecError::InitFailed(e.to_string()))?;

        info!(decoder_name, hw = decoder_name != "avdec_h264" && decoder_name != "avdec_h265", "decoder ready");
        Ok(Self { element: decoder_name, pipeline, appsrc, appsink, width, height })
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        !matches!(self.element, "avdec_h264" | "avdec_h265")
    }

    /// Decodes one packet, delivering zero or more NV12 frames to `sink`
    /// (GStreamer pipelines typically produce exactly one frame per
    /// keyframe-aligned Annex-B access unit, but the contract allows zero
    /// while the pipeline fills its initial buffers). `packet.parameters_changed`
    /// flushes the pipeline first, per spec §4.5's decoder-side contract.
    pub fn decode(&self, packet: &VideoPacket, sink: &FrameSink) -> Result<(), CodecError> {
        if packet.parameters_changed {
            self.pipeline.send_event(gst::event::FlushStart::new());
            self.pipeline.send_event(gst::event::FlushStop::new(true));
        }

        let mut buf = gst::Buffer::with_size(packet.data.len())
            .map_err(|_| CodecError::DecodeFailed("buffer allocation failed".into()))?;
        {
            let buf_mut = buf.get_mut().expect("buffer has a single owner here");
            buf_mut.set_pts(gst::ClockTime::from_useconds(packet.pts.max(0) as u64));
            buf_mut.set_dts(gst::ClockTime::from_useconds(packet.dts.max(0) as u64));
            let mut map = buf_mut
                .map_writable()
                .map_err(|_| CodecError::DecodeFailed("buffer map failed".into()))?;
            map.copy_from_slice(&packet.data);
        }

        self.appsrc
            .push_buffer(buf)
            .map_err(|e| CodecError::DecodeFailed(format!("appsrc push_buffer: {e:?}")))?;

        // EAGAIN-equivalent: no sample ready within a bounded wait is
        // non-fatal — the pipeline may still be filling its first GOP.
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::from_mseconds(50)) {
            let buffer = sample.buffer().ok_or_else(|| CodecError::DecodeFailed("no buffer in sample".into()))?;
            let caps = sample.caps().ok_or_else(|| CodecError::DecodeFailed("no caps in sample".into()))?;
            let info = gstreamer_video::VideoInfo::from_caps(caps)
                .map_err(|_| CodecError::DecodeFailed("invalid video caps".into()))?;
            let frame = gstreamer_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
                .map_err(|_| CodecError::DecodeFailed("could not map decoded frame".into()))?;

            let pts = buffer.pts().map(|t| t.useconds() as i64).unwrap_or(packet.pts);
            let video_frame = VideoFrame {
                y_plane: bytes::Bytes::copy_from_slice(frame.plane_data(0).unwrap_or(&[])),
                y_stride: frame.plane_stride()[0] as u32,
                uv_plane: bytes::Bytes::copy_from_slice(frame.plane_data(1).unwrap_or(&[])),
                uv_stride: frame.plane_stride()[1] as u32,
                width: info.width(),
                height: info.height(),
                color_range: ColorRange::Full,
                dts: pts,
                pts,
                timebase: (1, 1_000_000),
            };
            sink(video_frame);
        }

        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gop_is_three_times_fps() {
        assert_eq!(gop_length(30), 90);
        assert_eq!(gop_length(60), 180);
    }

    #[test]
    fn colorimetry_strings_match_range() {
        assert_eq!(colorimetry(ColorRange::Studio), "2:4:7:1");
        assert_eq!(colorimetry(ColorRange::Full), "1:4:7:1");
    }

    #[test]
    fn unknown_encoder_name_is_rejected_as_option_error() {
        // Not dependent on GStreamer being initialized: the element-name
        // lookup against `encoder_candidates` happens before any pipeline
        // is built.
        let known = encoder_candidates(VideoCodec::H264);
        assert!(known.iter().all(|c| c.element != "totally-made-up-encoder"));
    }
}
