use crate::device::{CaptureFormat, PixelFormat, RawFrame};
use crate::h264;
use bytes::Bytes;
use camrelay_protocol::EncoderConfig;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::{AppSink, AppSrc};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// RTP clock for video payloads.
pub const RTP_CLOCK_RATE: u32 = 90_000;

/// RTP timestamp advance for a frame shown for `interval`.
pub fn rtp_timestamp_increment(interval: Duration) -> u32 {
    let ticks = (interval.as_secs_f64() * RTP_CLOCK_RATE as f64).round();
    ticks.clamp(1.0, u32::MAX as f64) as u32
}

/// One encoded access unit (H.264 Annex B).
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub rtp_timestamp_increment: u32,
    pub payload: Bytes,
    pub keyframe: bool,
}

impl EncodedSample {
    /// How long the sample is displayed, from its RTP increment.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(
            u64::from(self.rtp_timestamp_increment) * 1_000_000_000 / u64::from(RTP_CLOCK_RATE),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder used after dispose")]
    Disposed,
    #[error("encoder backend: {0}")]
    Backend(String),
}

/// Capabilities of an opaque video encoder.
pub trait VideoEncoder: Send {
    fn supported_formats(&self) -> &[PixelFormat];

    /// Encode one frame. `Ok(None)` means no output this call.
    fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedSample>, EncoderError>;

    fn force_keyframe(&mut self) -> Result<(), EncoderError>;

    /// Release native resources. Called at most once by the adapter.
    fn dispose(&mut self);
}

/// Owns an encoder's lifecycle and serializes every call into it.
pub struct VideoEncoderAdapter {
    inner: Mutex<Option<Box<dyn VideoEncoder>>>,
}

impl VideoEncoderAdapter {
    pub fn new(encoder: Box<dyn VideoEncoder>) -> Self {
        Self {
            inner: Mutex::new(Some(encoder)),
        }
    }

    pub fn encode(&self, frame: &RawFrame) -> Result<Option<EncodedSample>, EncoderError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let encoder = guard.as_mut().ok_or(EncoderError::Disposed)?;
        if !encoder.supported_formats().contains(&frame.pixel_format) {
            return Err(EncoderError::Backend(format!(
                "{} input is not supported",
                frame.pixel_format
            )));
        }
        encoder.encode(frame)
    }

    pub fn force_keyframe(&self) -> Result<(), EncoderError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_mut()
            .ok_or(EncoderError::Disposed)?
            .force_keyframe()
    }

    pub fn supported_formats(&self) -> Result<Vec<PixelFormat>, EncoderError> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard
            .as_ref()
            .ok_or(EncoderError::Disposed)?
            .supported_formats()
            .to_vec())
    }

    /// Shut the encoder down. Waits for an in-flight encode; later calls are no-ops.
    pub fn dispose(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut encoder) = guard.take() {
            encoder.dispose();
            debug!("Encoder disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl Drop for VideoEncoderAdapter {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Detected encoder backend, in auto-detect preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderBackend {
    Nvidia,
    VaApi,
    Software,
}

impl EncoderBackend {
    pub fn element_name(self) -> &'static str {
        match self {
            Self::Nvidia => "nvh264enc",
            Self::VaApi => "vah264enc",
            Self::Software => "x264enc",
        }
    }
}

/// Encoder parameters from `[encoder]`.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub preferred: Option<String>,
    pub bitrate_kbps: u32,
    pub keyframe_interval: u32,
    pub encode_timeout: Duration,
}

impl From<&EncoderConfig> for EncoderSettings {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            preferred: config.encoder.clone(),
            bitrate_kbps: config.bitrate,
            keyframe_interval: config.keyframe_interval.max(1),
            encode_timeout: Duration::from_millis(config.encode_timeout_ms),
        }
    }
}

fn backend_err(what: &str, e: impl std::fmt::Display) -> EncoderError {
    EncoderError::Backend(format!("{what}: {e}"))
}

/// H.264 encoder on a GStreamer pipeline:
/// `appsrc ! videoconvert ! <h264 encoder> ! h264parse ! appsink`.
pub struct GstH264Encoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    format: CaptureFormat,
    formats: [PixelFormat; 1],
    timeout: Duration,
    pts: Duration,
    disposed: bool,
}

impl GstH264Encoder {
    pub fn new(settings: &EncoderSettings, format: &CaptureFormat) -> Result<Self, EncoderError> {
        let backend = detect_encoder(settings.preferred.as_deref())?;
        info!(
            ?backend,
            %format,
            bitrate = settings.bitrate_kbps,
            gop = settings.keyframe_interval,
            "Creating H.264 encoder pipeline"
        );

        let appsrc = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .map_err(|e| backend_err("failed to create appsrc", e))?
            .dynamic_cast::<AppSrc>()
            .map_err(|_| EncoderError::Backend("failed to cast to AppSrc".to_string()))?;
        appsrc.set_caps(Some(&input_caps(format)));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        appsrc.set_property("block", false);
        appsrc.set_property("min-latency", 0i64);
        appsrc.set_property("max-latency", 0i64);

        let convert = ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| backend_err("failed to create videoconvert", e))?;
        let encoder = build_encoder_element(backend, settings)?;

        // h264parse inlines SPS/PPS with every IDR
        let parser = ElementFactory::make("h264parse")
            .property_from_str("config-interval", "-1")
            .build()
            .map_err(|e| backend_err("failed to create h264parse", e))?;

        // Annex B with complete access units, as TrackLocalStaticSample expects
        let parse_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &parse_caps)
            .build()
            .map_err(|e| backend_err("failed to create h264parse capsfilter", e))?;

        let appsink = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", false)
            .property("max-buffers", 1u32)
            .property("drop", true)
            .build()
            .map_err(|e| backend_err("failed to create appsink", e))?
            .dynamic_cast::<AppSink>()
            .map_err(|_| EncoderError::Backend("failed to cast to AppSink".to_string()))?;

        let mut chain: Vec<&gst::Element> = vec![appsrc.upcast_ref(), &convert, &encoder];
        // nvh264enc emits Main profile; the others are pinned to what the SDP advertises
        let profile_capsfilter = match backend {
            EncoderBackend::Nvidia => None,
            _ => {
                let profile_caps = gst::Caps::builder("video/x-h264")
                    .field("profile", "constrained-baseline")
                    .build();
                Some(
                    ElementFactory::make("capsfilter")
                        .property("caps", &profile_caps)
                        .build()
                        .map_err(|e| backend_err("failed to create profile capsfilter", e))?,
                )
            }
        };
        if let Some(ref capsfilter) = profile_capsfilter {
            chain.push(capsfilter);
        }
        chain.extend([&parser, &parse_capsfilter, appsink.upcast_ref()]);

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many(chain.iter().copied())
            .map_err(|e| backend_err("failed to add encoder elements", e))?;
        gst::Element::link_many(chain.iter().copied())
            .map_err(|e| backend_err("failed to link encoder pipeline", e))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| backend_err("failed to set encoder pipeline to Playing", e))?;
        info!(encoder = backend.element_name(), "Encoder pipeline started");

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            format: *format,
            formats: [format.pixel_format],
            timeout: settings.encode_timeout,
            pts: Duration::ZERO,
            disposed: false,
        })
    }

    fn pipeline_error(&self) -> Option<EncoderError> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(EncoderError::Backend(format!(
                "pipeline error from {}: {}",
                err.src()
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                err.error()
            ))),
            _ => None,
        }
    }
}

impl VideoEncoder for GstH264Encoder {
    fn supported_formats(&self) -> &[PixelFormat] {
        &self.formats
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedSample>, EncoderError> {
        if frame.width != self.format.width || frame.height != self.format.height {
            return Err(EncoderError::Backend(format!(
                "frame is {}x{}, encoder was built for {}x{}",
                frame.width, frame.height, self.format.width, self.format.height
            )));
        }

        let mut buffer = gst::Buffer::from_slice(frame.pixels.clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(ClockTime::from_nseconds(self.pts.as_nanos() as u64));
            buffer.set_duration(ClockTime::from_nseconds(
                frame.timestamp_delta.as_nanos() as u64,
            ));
        }
        self.pts += frame.timestamp_delta;
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| backend_err("failed to push buffer to appsrc", e))?;

        let timeout = ClockTime::from_nseconds(self.timeout.as_nanos() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if let Some(err) = self.pipeline_error() {
                return Err(err);
            }
            return Ok(None);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| EncoderError::Backend("encoded sample has no buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| backend_err("failed to map encoded buffer", e))?;
        let payload = Bytes::copy_from_slice(map.as_slice());

        Ok(Some(EncodedSample {
            rtp_timestamp_increment: rtp_timestamp_increment(frame.timestamp_delta),
            keyframe: h264::contains_idr(&payload),
            payload,
        }))
    }

    fn force_keyframe(&mut self) -> Result<(), EncoderError> {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if self.appsink.send_event(event) {
            debug!("Requested IDR keyframe from encoder");
            Ok(())
        } else {
            Err(EncoderError::Backend(
                "encoder did not accept force-key-unit event".to_string(),
            ))
        }
    }

    fn dispose(&mut self) {
        if std::mem::replace(&mut self.disposed, true) {
            return;
        }
        let _ = self.appsrc.end_of_stream();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop encoder pipeline: {e}");
        }
        info!("Encoder pipeline stopped");
    }
}

impl Drop for GstH264Encoder {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Raw input caps. Colorimetry is deliberately absent: it ends up as VUI
/// parameters in the SPS, which some browser decoders reject.
fn input_caps(format: &CaptureFormat) -> gst::Caps {
    gst::Caps::builder("video/x-raw")
        .field("format", format.pixel_format.as_str())
        .field("width", format.width as i32)
        .field("height", format.height as i32)
        .field(
            "framerate",
            gst::Fraction::new(format.framerate_num as i32, format.framerate_den.max(1) as i32),
        )
        .build()
}

/// `ElementFactory::find` only proves the plugin is registered; the element
/// can still fail to instantiate when the hardware driver is missing.
fn can_instantiate(name: &str) -> bool {
    match ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

/// The preferred encoder if it instantiates, otherwise the first working one.
pub fn detect_encoder(preferred: Option<&str>) -> Result<EncoderBackend, EncoderError> {
    const CANDIDATES: [EncoderBackend; 3] = [
        EncoderBackend::Nvidia,
        EncoderBackend::VaApi,
        EncoderBackend::Software,
    ];

    if let Some(pref) = preferred {
        let backend = CANDIDATES
            .into_iter()
            .find(|b| b.element_name() == pref)
            .ok_or_else(|| {
                EncoderError::Backend(format!(
                    "unknown encoder {pref}, use nvh264enc, vah264enc or x264enc"
                ))
            })?;
        if can_instantiate(pref) {
            info!(encoder = pref, "Using preferred encoder from config");
            return Ok(backend);
        }
        warn!(
            encoder = pref,
            "Preferred encoder not available, falling back to auto-detect"
        );
    }

    for backend in CANDIDATES {
        if can_instantiate(backend.element_name()) {
            info!(encoder = backend.element_name(), "Found working encoder");
            return Ok(backend);
        }
        debug!(
            encoder = backend.element_name(),
            "Encoder not available, trying next"
        );
    }

    Err(EncoderError::Backend(
        "no H.264 encoder found, install the GStreamer good/bad/ugly plugins".to_string(),
    ))
}

fn build_encoder_element(
    backend: EncoderBackend,
    settings: &EncoderSettings,
) -> Result<gst::Element, EncoderError> {
    let name = backend.element_name();
    let gop = settings.keyframe_interval;
    let bitrate = settings.bitrate_kbps;
    let builder = match backend {
        EncoderBackend::Nvidia => ElementFactory::make(name)
            .property_from_str("preset", "low-latency-hq")
            .property_from_str("rc-mode", "cbr-ld-hq")
            .property("bitrate", bitrate)
            .property("gop-size", gop as i32)
            .property("zerolatency", true)
            .property("rc-lookahead", 0u32)
            .property("bframes", 0u32),
        EncoderBackend::VaApi => ElementFactory::make(name)
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate)
            .property("key-int-max", gop),
        EncoderBackend::Software => ElementFactory::make(name)
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("bitrate", bitrate)
            .property("key-int-max", gop)
            .property("bframes", 0u32),
    };
    builder
        .build()
        .map_err(|e| backend_err(&format!("failed to create {name}"), e))
}
