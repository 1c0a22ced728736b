use crate::capture::CaptureError;
use bytes::Bytes;
use camrelay_protocol::CaptureConfig;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory};
use gstreamer_app::AppSink;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pixel layouts the capture path knows how to pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Nv12,
    I420,
    Yuy2,
    Bgra,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 4] = [Self::Nv12, Self::I420, Self::Yuy2, Self::Bgra];

    /// Match a subtype name ("NV12", "yuy2", ...) case-insensitively.
    pub fn from_subtype(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(name))
    }

    /// GStreamer / FourCC name of the format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nv12 => "NV12",
            Self::I420 => "I420",
            Self::Yuy2 => "YUY2",
            Self::Bgra => "BGRA",
        }
    }

    /// `(row_bytes, rows)` of every plane for a tightly packed frame.
    pub fn plane_dims(self, width: u32, height: u32) -> Vec<(usize, usize)> {
        let w = width as usize;
        let h = height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        match self {
            Self::Nv12 => vec![(w, h), (cw * 2, ch)],
            Self::I420 => vec![(w, h), (cw, ch), (cw, ch)],
            Self::Yuy2 => vec![(cw * 4, h)],
            Self::Bgra => vec![(w * 4, h)],
        }
    }

    /// Size in bytes of a tightly packed frame.
    pub fn packed_len(self, width: u32, height: u32) -> usize {
        self.plane_dims(width, height)
            .iter()
            .map(|(row, rows)| row * rows)
            .sum()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mode a capture device can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub framerate_num: u32,
    pub framerate_den: u32,
    pub pixel_format: PixelFormat,
}

impl CaptureFormat {
    pub fn new(width: u32, height: u32, fps: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            framerate_num: fps,
            framerate_den: 1,
            pixel_format,
        }
    }

    pub fn fps(&self) -> f64 {
        if self.framerate_den == 0 {
            return 0.0;
        }
        self.framerate_num as f64 / self.framerate_den as f64
    }

    /// True if this mode delivers at least `fps` frames per second.
    pub fn reaches_fps(&self, fps: u32) -> bool {
        self.framerate_den != 0
            && u64::from(self.framerate_num) >= u64::from(fps) * u64::from(self.framerate_den)
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} @ {}/{}",
            self.width, self.height, self.pixel_format, self.framerate_num, self.framerate_den
        )
    }
}

/// A tightly packed raw frame, owned by the capture pipeline.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Time since the previous frame from the same source
    pub timestamp_delta: Duration,
    /// Monotonic per-source frame number
    pub sequence: u64,
    pub pixels: Bytes,
}

/// Where a plane starts in a device buffer and how far apart its rows are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
}

/// A frame as handed over by the device, possibly with row padding.
///
/// Holds the device's buffer reference until it is packed or dropped.
pub struct DeviceFrame {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub planes: Vec<PlaneLayout>,
    data: Box<dyn AsRef<[u8]> + Send>,
}

impl DeviceFrame {
    pub fn new(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        planes: Vec<PlaneLayout>,
        data: impl AsRef<[u8]> + Send + 'static,
    ) -> Self {
        Self {
            width,
            height,
            pixel_format,
            planes,
            data: Box::new(data),
        }
    }

    /// A frame whose planes follow each other with no row padding.
    pub fn tightly_packed(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        data: impl AsRef<[u8]> + Send + 'static,
    ) -> Self {
        let mut offset = 0;
        let planes = pixel_format
            .plane_dims(width, height)
            .into_iter()
            .map(|(row, rows)| {
                let plane = PlaneLayout {
                    offset,
                    stride: row,
                };
                offset += row * rows;
                plane
            })
            .collect();
        Self::new(width, height, pixel_format, planes, data)
    }

    pub fn data(&self) -> &[u8] {
        (*self.data).as_ref()
    }

    /// Copy the visible rows of every plane into one contiguous buffer,
    /// releasing the device buffer.
    pub fn pack(self, timestamp_delta: Duration, sequence: u64) -> Result<RawFrame, CaptureError> {
        let dims = self.pixel_format.plane_dims(self.width, self.height);
        if dims.len() != self.planes.len() {
            return Err(CaptureError::Device(format!(
                "{} frame has {} planes, expected {}",
                self.pixel_format,
                self.planes.len(),
                dims.len()
            )));
        }

        let src = self.data();
        let mut pixels = Vec::with_capacity(self.pixel_format.packed_len(self.width, self.height));
        for (plane, &(row_bytes, rows)) in self.planes.iter().zip(&dims) {
            if rows == 0 {
                continue;
            }
            if plane.stride < row_bytes {
                return Err(CaptureError::Device(format!(
                    "stride {} shorter than row of {row_bytes} bytes",
                    plane.stride
                )));
            }
            let end = plane.offset + plane.stride * (rows - 1) + row_bytes;
            if end > src.len() {
                return Err(CaptureError::Device(format!(
                    "frame buffer of {} bytes too short for {}x{} {}",
                    src.len(),
                    self.width,
                    self.height,
                    self.pixel_format
                )));
            }
            for row in 0..rows {
                let start = plane.offset + row * plane.stride;
                pixels.extend_from_slice(&src[start..start + row_bytes]);
            }
        }

        Ok(RawFrame {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            timestamp_delta,
            sequence,
            pixels: Bytes::from(pixels),
        })
    }
}

impl fmt::Debug for DeviceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("planes", &self.planes)
            .field("len", &self.data().len())
            .finish()
    }
}

/// A source of raw video frames driven by frame-arrival waits.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Every mode the device can be opened in.
    fn supported_formats(&self) -> Vec<CaptureFormat>;

    fn open(&mut self, format: &CaptureFormat) -> Result<(), CaptureError>;

    /// Block until a frame arrives or `timeout` passes. `Ok(false)` on timeout.
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<bool, CaptureError>;

    /// Newest frame available, discarding any older ones the device still holds.
    fn try_acquire_latest_frame(&mut self) -> Option<DeviceFrame>;

    fn close(&mut self);
}

/// Build the device named by `[capture] device`.
pub fn open_configured(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    match config.device.as_str() {
        "test" => Ok(Box::new(TestPatternDevice::new(
            config.width,
            config.height,
            config.framerate,
        ))),
        selector => Ok(Box::new(GstCameraDevice::find(selector)?)),
    }
}

/// Camera discovered through the GStreamer device monitor.
pub struct GstCameraDevice {
    device: gst::Device,
    name: String,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<AppSink>,
    pending: Option<gst::Sample>,
}

impl GstCameraDevice {
    /// Pick the first `Video/Source` whose name contains `selector`,
    /// or the first one at all for "auto".
    pub fn find(selector: &str) -> Result<Self, CaptureError> {
        let monitor = gst::DeviceMonitor::new();
        monitor.add_filter(Some("Video/Source"), None);
        monitor.start().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("device monitor failed to start: {e}"))
        })?;
        let devices: Vec<gst::Device> = monitor.devices().into_iter().collect();
        monitor.stop();

        let wanted = selector.to_lowercase();
        let device = devices
            .into_iter()
            .find(|d| {
                selector == "auto" || d.display_name().to_lowercase().contains(&wanted)
            })
            .ok_or_else(|| {
                CaptureError::DeviceUnavailable(format!("no video source matches '{selector}'"))
            })?;

        let name = device.display_name().to_string();
        info!(device = %name, "Selected capture device");
        Ok(Self {
            device,
            name,
            pipeline: None,
            appsink: None,
            pending: None,
        })
    }

    fn build_pipeline(&self, format: &CaptureFormat) -> Result<(gst::Pipeline, AppSink), CaptureError> {
        let backend = |what: &str, e: &dyn fmt::Display| CaptureError::Device(format!("{what}: {e}"));

        let source = self
            .device
            .create_element(None)
            .map_err(|e| backend("failed to create device source", &e))?;
        let convert = ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| backend("failed to create videoconvert", &e))?;
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", format.pixel_format.as_str())
            .field("width", format.width as i32)
            .field("height", format.height as i32)
            .field(
                "framerate",
                gst::Fraction::new(format.framerate_num as i32, format.framerate_den as i32),
            )
            .build();
        let capsfilter = ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| backend("failed to create capsfilter", &e))?;
        // Only the newest frame is kept; older ones are dropped inside the sink.
        let appsink = ElementFactory::make("appsink")
            .name("camera-sink")
            .property("sync", false)
            .property("emit-signals", false)
            .property("max-buffers", 1u32)
            .property("drop", true)
            .build()
            .map_err(|e| backend("failed to create appsink", &e))?
            .dynamic_cast::<AppSink>()
            .map_err(|_| CaptureError::Device("failed to cast to AppSink".to_string()))?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([&source, &convert, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| backend("failed to add camera elements", &e))?;
        gst::Element::link_many([&source, &convert, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| backend("failed to link camera pipeline", &e))?;
        Ok((pipeline, appsink))
    }

    fn mapped_frame(sample: gst::Sample) -> Option<DeviceFrame> {
        let info = sample
            .caps()
            .and_then(|caps| gstreamer_video::VideoInfo::from_caps(caps).ok())?;
        let pixel_format = PixelFormat::from_subtype(info.format().to_str())?;
        let planes = info
            .offset()
            .iter()
            .zip(info.stride())
            .map(|(&offset, &stride)| PlaneLayout {
                offset,
                stride: stride.max(0) as usize,
            })
            .collect();
        let mapped = sample.buffer_owned()?.into_mapped_buffer_readable().ok()?;
        Some(DeviceFrame::new(
            info.width(),
            info.height(),
            pixel_format,
            planes,
            mapped,
        ))
    }
}

impl CaptureDevice for GstCameraDevice {
    fn name(&self) -> &str {
        &self.name
    }

    /// Native caps of the device. Each size/rate is offered in every packable
    /// pixel format because the pipeline converts with `videoconvert`.
    fn supported_formats(&self) -> Vec<CaptureFormat> {
        let Some(caps) = self.device.caps() else {
            return Vec::new();
        };
        let mut formats = Vec::new();
        for s in caps.iter() {
            if !s.has_name("video/x-raw") {
                continue;
            }
            let (Ok(width), Ok(height)) = (s.get::<i32>("width"), s.get::<i32>("height")) else {
                continue;
            };
            let rates: Vec<gst::Fraction> = match s.get::<gst::Fraction>("framerate") {
                Ok(rate) => vec![rate],
                Err(_) => s
                    .get::<gst::List>("framerate")
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v.get::<gst::Fraction>().ok())
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            for rate in rates {
                if rate.numer() <= 0 || rate.denom() <= 0 {
                    continue;
                }
                for pixel_format in PixelFormat::ALL {
                    let format = CaptureFormat {
                        width: width as u32,
                        height: height as u32,
                        framerate_num: rate.numer() as u32,
                        framerate_den: rate.denom() as u32,
                        pixel_format,
                    };
                    if !formats.contains(&format) {
                        formats.push(format);
                    }
                }
            }
        }
        debug!(device = %self.name, count = formats.len(), "Enumerated capture formats");
        formats
    }

    fn open(&mut self, format: &CaptureFormat) -> Result<(), CaptureError> {
        let (pipeline, appsink) = self.build_pipeline(format)?;
        pipeline.set_state(gst::State::Playing).map_err(|e| {
            let _ = pipeline.set_state(gst::State::Null);
            CaptureError::DeviceUnavailable(format!("failed to start {}: {e}", self.name))
        })?;
        info!(device = %self.name, %format, "Camera pipeline started");
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<bool, CaptureError> {
        let Some(appsink) = &self.appsink else {
            return Err(CaptureError::Device("device is not open".to_string()));
        };
        if self.pending.is_some() {
            return Ok(true);
        }
        match appsink.try_pull_sample(ClockTime::from_nseconds(timeout.as_nanos() as u64)) {
            Some(sample) => {
                self.pending = Some(sample);
                Ok(true)
            }
            None if appsink.is_eos() => Err(CaptureError::Device(format!(
                "{} reached end of stream",
                self.name
            ))),
            None => Ok(false),
        }
    }

    fn try_acquire_latest_frame(&mut self) -> Option<DeviceFrame> {
        let appsink = self.appsink.as_ref()?;
        let mut latest = self.pending.take();
        while let Some(newer) = appsink.try_pull_sample(ClockTime::ZERO) {
            latest = Some(newer);
        }
        Self::mapped_frame(latest?)
    }

    fn close(&mut self) {
        self.pending = None;
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!(device = %self.name, "Failed to stop camera pipeline: {e}");
            }
            info!(device = %self.name, "Camera pipeline stopped");
        }
    }
}

impl Drop for GstCameraDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Synthetic moving-gradient source running at a fixed rate.
pub struct TestPatternDevice {
    width: u32,
    height: u32,
    fps: u32,
    row_padding: usize,
    format: Option<CaptureFormat>,
    started: Instant,
    produced: u64,
    ready: bool,
}

impl TestPatternDevice {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            row_padding: 0,
            format: None,
            started: Instant::now(),
            produced: 0,
            ready: false,
        }
    }

    /// Pad every row with `bytes` of garbage, like devices with aligned strides.
    pub fn with_row_padding(mut self, bytes: usize) -> Self {
        self.row_padding = bytes;
        self
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }

    fn render(&self, format: &CaptureFormat, t: u64) -> DeviceFrame {
        let (w, h) = (format.width as usize, format.height as usize);
        let t = t as usize;
        let dims = format.pixel_format.plane_dims(format.width, format.height);
        let mut planes = Vec::with_capacity(dims.len());
        let mut data = Vec::new();
        for (index, &(row_bytes, rows)) in dims.iter().enumerate() {
            let stride = row_bytes + self.row_padding;
            planes.push(PlaneLayout {
                offset: data.len(),
                stride,
            });
            for y in 0..rows {
                for x in 0..row_bytes {
                    let value = match (format.pixel_format, index) {
                        (PixelFormat::Bgra, _) => match x % 4 {
                            0 => (x / 4 + t) as u8,
                            1 => (y + t) as u8,
                            2 => (t * 2) as u8,
                            _ => 0xFF,
                        },
                        (PixelFormat::Yuy2, _) if x % 2 == 1 => 128,
                        (_, 0) => ((x + y) * 255 / (w + h).max(1) + t) as u8,
                        _ => 128,
                    };
                    data.push(value);
                }
                data.extend(std::iter::repeat_n(0xAB, self.row_padding));
            }
        }
        DeviceFrame::new(format.width, format.height, format.pixel_format, planes, data)
    }
}

impl CaptureDevice for TestPatternDevice {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn supported_formats(&self) -> Vec<CaptureFormat> {
        PixelFormat::ALL
            .into_iter()
            .map(|pf| CaptureFormat::new(self.width, self.height, self.fps, pf))
            .collect()
    }

    fn open(&mut self, format: &CaptureFormat) -> Result<(), CaptureError> {
        self.format = Some(*format);
        self.started = Instant::now();
        self.produced = 0;
        self.ready = false;
        info!(%format, "Test pattern started");
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<bool, CaptureError> {
        if self.format.is_none() {
            return Err(CaptureError::Device("device is not open".to_string()));
        }
        if self.ready {
            return Ok(true);
        }
        let due = self.started + self.interval() * (self.produced as u32 + 1);
        let now = Instant::now();
        if due > now + timeout {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        std::thread::sleep(due.saturating_duration_since(now));
        self.ready = true;
        Ok(true)
    }

    fn try_acquire_latest_frame(&mut self) -> Option<DeviceFrame> {
        let format = self.format?;
        if !std::mem::take(&mut self.ready) {
            return None;
        }
        // Skip ahead over frames that were due while nobody was asking.
        let elapsed = self.started.elapsed().as_nanos() / self.interval().as_nanos().max(1);
        self.produced = (elapsed as u64).max(self.produced + 1);
        Some(self.render(&format, self.produced))
    }

    fn close(&mut self) {
        if self.format.take().is_some() {
            info!(frames = self.produced, "Test pattern stopped");
        }
    }
}
