use crate::device::{CaptureDevice, CaptureFormat, RawFrame};
use crate::encoder::{EncodedSample, EncoderError, VideoEncoder, VideoEncoderAdapter};
use crate::gate::{EncodeGate, EncodePermit};
use crate::negotiation::MediaPipeline;
use crate::pacer::FrameRatePacer;
use crate::slot::FrameBufferSlot;
use arc_swap::ArcSwapOption;
use camrelay_protocol::CaptureConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How long the capture thread waits for a frame before rechecking shutdown.
const FRAME_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("no device format matches {width}x{height} {pixel_format} at {framerate} fps or more")]
    FormatUnavailable {
        width: u32,
        height: u32,
        framerate: u32,
        pixel_format: String,
    },
    #[error("capture source is still stopping")]
    AlreadyStopping,
    #[error("capture device error: {0}")]
    Device(String),
}

/// What the capture source asks of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub pixel_format: String,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            framerate: config.framerate,
            pixel_format: config.pixel_format.clone(),
        }
    }
}

/// First format with the exact size, the same pixel subtype (any case) and
/// at least the requested frame rate.
pub fn negotiate_format(
    formats: &[CaptureFormat],
    settings: &CaptureSettings,
) -> Result<CaptureFormat, CaptureError> {
    formats
        .iter()
        .find(|f| {
            f.width == settings.width
                && f.height == settings.height
                && f.pixel_format
                    .as_str()
                    .eq_ignore_ascii_case(&settings.pixel_format)
                && f.reaches_fps(settings.framerate)
        })
        .copied()
        .ok_or_else(|| CaptureError::FormatUnavailable {
            width: settings.width,
            height: settings.height,
            framerate: settings.framerate,
            pixel_format: settings.pixel_format.clone(),
        })
}

pub type DeviceFactory =
    Box<dyn Fn() -> Result<Box<dyn CaptureDevice>, CaptureError> + Send + Sync>;
pub type EncoderFactory =
    Box<dyn Fn(&CaptureFormat) -> Result<Box<dyn VideoEncoder>, EncoderError> + Send + Sync>;

/// Counters for the capture heartbeat and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureStats {
    pub captured: u64,
    /// Frames dropped unread because nobody was subscribed
    pub idle_discarded: u64,
    pub superseded: u64,
    pub encode_admitted: u64,
    /// Frames dropped because an encode was still in flight
    pub encode_dropped: u64,
    pub encoded: u64,
    pub encode_failures: u64,
    /// Encoded samples dropped because the sink was full
    pub sink_dropped: u64,
    pub fps: f64,
}

/// State shared between the capture source, its threads and subscribers.
struct Shared {
    slot: FrameBufferSlot,
    gate: Arc<EncodeGate>,
    raw_notify: watch::Sender<u64>,
    encoded_sink: ArcSwapOption<mpsc::Sender<EncodedSample>>,
    keyframe_requested: AtomicBool,
    /// Last frame sequence handed out; survives restarts so subscribers
    /// never see sequences go backwards
    sequence: AtomicU64,
    captured: AtomicU64,
    idle_discarded: AtomicU64,
    encoded: AtomicU64,
    encode_failures: AtomicU64,
    sink_dropped: AtomicU64,
    fps_millis: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            slot: FrameBufferSlot::new(),
            gate: EncodeGate::new(),
            raw_notify: watch::Sender::new(0),
            encoded_sink: ArcSwapOption::empty(),
            keyframe_requested: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            captured: AtomicU64::new(0),
            idle_discarded: AtomicU64::new(0),
            encoded: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
            fps_millis: AtomicU64::new(0),
        }
    }

    fn wants_encoded(&self) -> bool {
        self.encoded_sink
            .load_full()
            .is_some_and(|sink| !sink.is_closed())
    }

    fn deliver(&self, sample: EncodedSample) {
        let Some(sink) = self.encoded_sink.load_full() else {
            return;
        };
        match sink.try_send(sample) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.sink_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped.is_multiple_of(300) {
                    debug!(dropped, "Dropping encoded sample (sink full, prioritizing latency)");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Encoded sample sink closed");
            }
        }
    }
}

/// A frame handed to the encode thread together with the gate it holds.
struct EncodeJob {
    frame: Arc<RawFrame>,
    _permit: EncodePermit,
}

/// Outcome of one frame-arrival event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    NoFrame,
    /// Nobody subscribed; the device frame was released unread
    Discarded,
    Published { encode_admitted: bool },
    Failed,
}

/// Per-frame work on the capture thread. Never blocks on the encoder.
pub(crate) struct FrameDispatcher {
    shared: Arc<Shared>,
    jobs: std_mpsc::SyncSender<EncodeJob>,
    pacer: FrameRatePacer,
}

impl FrameDispatcher {
    fn new(shared: Arc<Shared>, jobs: std_mpsc::SyncSender<EncodeJob>, nominal_fps: u32) -> Self {
        Self {
            shared,
            jobs,
            pacer: FrameRatePacer::new(nominal_fps),
        }
    }

    pub(crate) fn on_frame_arrived(&mut self, device: &mut dyn CaptureDevice) -> Dispatch {
        let Some(device_frame) = device.try_acquire_latest_frame() else {
            return Dispatch::NoFrame;
        };
        let interval = self.pacer.tick();
        self.shared.captured.fetch_add(1, Ordering::Relaxed);

        let wants_raw = self.shared.raw_notify.receiver_count() > 0;
        let wants_encoded = self.shared.wants_encoded();
        if !wants_raw && !wants_encoded {
            drop(device_frame);
            self.shared.idle_discarded.fetch_add(1, Ordering::Relaxed);
            return Dispatch::Discarded;
        }

        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = match device_frame.pack(interval, sequence) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!("Failed to pack captured frame: {e}");
                return Dispatch::Failed;
            }
        };

        self.shared.slot.publish(Arc::clone(&frame));
        if wants_raw {
            self.shared.raw_notify.send_replace(frame.sequence);
        }

        let mut encode_admitted = false;
        if wants_encoded {
            match self.shared.gate.try_acquire() {
                Some(permit) => {
                    encode_admitted = self
                        .jobs
                        .try_send(EncodeJob {
                            frame,
                            _permit: permit,
                        })
                        .is_ok();
                }
                None => {
                    let dropped = self.shared.gate.dropped();
                    if dropped == 1 || dropped.is_multiple_of(300) {
                        debug!(dropped, "Dropping frame (encoder busy)");
                    }
                }
            }
        }

        let now = Instant::now();
        self.shared
            .fps_millis
            .store((self.pacer.fps() * 1000.0) as u64, Ordering::Relaxed);
        if self.pacer.heartbeat_due(now) {
            info!(
                captured = self.shared.captured.load(Ordering::Relaxed),
                encoded = self.shared.encoded.load(Ordering::Relaxed),
                dropped = self.shared.gate.dropped(),
                superseded = self.shared.slot.superseded(),
                fps = format!("{:.1}", self.pacer.fps()),
                "Capture heartbeat"
            );
        }

        Dispatch::Published { encode_admitted }
    }
}

fn run_encode_loop(
    jobs: std_mpsc::Receiver<EncodeJob>,
    adapter: Arc<VideoEncoderAdapter>,
    shared: Arc<Shared>,
) {
    let mut first_output_logged = false;
    while let Ok(job) = jobs.recv() {
        if shared.keyframe_requested.swap(false, Ordering::Relaxed)
            && let Err(e) = adapter.force_keyframe()
        {
            warn!("Failed to force keyframe: {e}");
        }

        match adapter.encode(&job.frame) {
            Ok(Some(sample)) => {
                shared.encoded.fetch_add(1, Ordering::Relaxed);
                if !first_output_logged {
                    info!(
                        size = sample.payload.len(),
                        keyframe = sample.keyframe,
                        "First H.264 sample from encoder"
                    );
                    first_output_logged = true;
                }
                shared.deliver(sample);
            }
            Ok(None) => {}
            Err(EncoderError::Disposed) => {
                error!("Encoder used after dispose, stopping encode thread");
                break;
            }
            Err(e) => {
                let failures = shared.encode_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures <= 3 || failures.is_multiple_of(100) {
                    warn!(failures, "Encode failed: {e}");
                }
            }
        }
        // Dropping the job releases the gate
    }
    debug!("Encode thread exiting");
}

fn run_capture_loop(
    mut device: Box<dyn CaptureDevice>,
    mut dispatcher: FrameDispatcher,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match device.wait_for_frame(FRAME_WAIT) {
            Ok(true) => {
                dispatcher.on_frame_arrived(device.as_mut());
            }
            Ok(false) => {}
            Err(e) => {
                error!(device = device.name(), "Capture device failed: {e}");
                break;
            }
        }
    }
    device.close();
    info!(device = device.name(), "Capture thread shutting down");
}

struct Running {
    shutdown: Arc<AtomicBool>,
    capture_thread: JoinHandle<()>,
    encode_thread: JoinHandle<()>,
    adapter: Arc<VideoEncoderAdapter>,
}

impl Running {
    fn is_alive(&self) -> bool {
        !self.capture_thread.is_finished()
    }
}

enum Lifecycle {
    Stopped,
    Running(Running),
    Stopping,
}

/// Owns the capture device and drives per-frame dispatch to raw
/// subscribers and the encode path.
pub struct CaptureSource {
    settings: CaptureSettings,
    device_factory: DeviceFactory,
    encoder_factory: EncoderFactory,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl CaptureSource {
    pub fn new(
        settings: CaptureSettings,
        device_factory: DeviceFactory,
        encoder_factory: EncoderFactory,
    ) -> Self {
        Self {
            settings,
            device_factory,
            encoder_factory,
            shared: Arc::new(Shared::new()),
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Open the device and start the capture and encode threads.
    /// A no-op if already running.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if let Lifecycle::Running(running) = &*lifecycle
            && running.is_alive()
        {
            debug!("Capture already running");
            return Ok(());
        }
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(dead) => {
                warn!("Capture thread exited on its own, rebuilding the pipeline");
                self.release(dead);
            }
            Lifecycle::Stopping => {
                *lifecycle = Lifecycle::Stopping;
                return Err(CaptureError::AlreadyStopping);
            }
            Lifecycle::Stopped => {}
        }

        let mut device = (self.device_factory)()?;
        let format = negotiate_format(&device.supported_formats(), &self.settings)?;
        device.open(&format)?;
        let encoder = match (self.encoder_factory)(&format) {
            Ok(encoder) => encoder,
            Err(e) => {
                device.close();
                return Err(CaptureError::Device(format!("encoder unavailable: {e}")));
            }
        };
        let adapter = Arc::new(VideoEncoderAdapter::new(encoder));

        // Capacity 1: the gate guarantees at most one job exists at a time
        let (job_tx, job_rx) = std_mpsc::sync_channel::<EncodeJob>(1);
        let encode_thread = {
            let adapter = Arc::clone(&adapter);
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name("encode".into())
                .spawn(move || run_encode_loop(job_rx, adapter, shared))
                .map_err(|e| CaptureError::Device(format!("failed to spawn encode thread: {e}")))?
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatcher = FrameDispatcher::new(Arc::clone(&self.shared), job_tx, self.settings.framerate);
        let device_name = device.name().to_string();
        let capture_thread = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("capture-events".into())
                .spawn(move || run_capture_loop(device, dispatcher, shutdown))
        };
        let capture_thread = match capture_thread {
            Ok(handle) => handle,
            Err(e) => {
                // The job sender went down with the closure, so the encode thread exits
                adapter.dispose();
                let _ = encode_thread.join();
                return Err(CaptureError::Device(format!(
                    "failed to spawn capture thread: {e}"
                )));
            }
        };

        info!(device = %device_name, %format, "Capture started");
        *lifecycle = Lifecycle::Running(Running {
            shutdown,
            capture_thread,
            encode_thread,
            adapter,
        });
        Ok(())
    }

    /// Stop both threads, dispose the encoder and close the device.
    /// Safe before `start` and when already stopped.
    pub fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        self.release(running);
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Lifecycle::Stopped;
        info!(stats = ?self.stats(), "Capture stopped");
    }

    /// Join both threads of a run, then dispose its encoder.
    fn release(&self, running: Running) {
        running.shutdown.store(true, Ordering::Relaxed);
        if running.capture_thread.join().is_err() {
            warn!("Capture thread panicked");
        }
        // The job sender died with the capture thread; the encode thread
        // finishes any in-flight encode and then exits.
        if running.encode_thread.join().is_err() {
            warn!("Encode thread panicked");
        }
        running.adapter.dispose();
        self.shared.slot.clear();
    }

    /// False once stopped, and also once the capture thread died on a
    /// device error.
    pub fn is_running(&self) -> bool {
        matches!(
            &*self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()),
            Lifecycle::Running(running) if running.is_alive()
        )
    }

    /// Route encoded samples to `sink`. A full sink drops the sample.
    pub fn set_encoded_sink(&self, sink: mpsc::Sender<EncodedSample>) {
        self.shared.encoded_sink.store(Some(Arc::new(sink)));
    }

    /// Subscribe to raw frames. Every subscriber sees every frame it is
    /// awake for; frames that arrive while it is busy are skipped.
    pub fn subscribe_raw(&self) -> RawFrameSubscriber {
        RawFrameSubscriber::new(Arc::clone(&self.shared))
    }

    /// Ask the encoder for an IDR before its next frame.
    pub fn request_keyframe(&self) {
        self.shared.keyframe_requested.store(true, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CaptureStats {
        let s = &self.shared;
        CaptureStats {
            captured: s.captured.load(Ordering::Relaxed),
            idle_discarded: s.idle_discarded.load(Ordering::Relaxed),
            superseded: s.slot.superseded(),
            encode_admitted: s.gate.admitted(),
            encode_dropped: s.gate.dropped(),
            encoded: s.encoded.load(Ordering::Relaxed),
            encode_failures: s.encode_failures.load(Ordering::Relaxed),
            sink_dropped: s.sink_dropped.load(Ordering::Relaxed),
            fps: s.fps_millis.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

impl MediaPipeline for CaptureSource {
    fn start(&self) -> Result<(), CaptureError> {
        CaptureSource::start(self)
    }

    fn stop(&self) {
        CaptureSource::stop(self)
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receives the newest raw frame after each arrival. Frames published while
/// the subscriber was not looking are skipped, never queued, and no frame is
/// returned twice.
pub struct RawFrameSubscriber {
    notify: watch::Receiver<u64>,
    shared: Arc<Shared>,
    seen: u64,
}

impl RawFrameSubscriber {
    fn new(shared: Arc<Shared>) -> Self {
        let notify = shared.raw_notify.subscribe();
        let seen = *notify.borrow();
        Self {
            notify,
            shared,
            seen,
        }
    }

    /// Wait for a frame newer than the last one returned.
    pub async fn next(&mut self) -> Option<Arc<RawFrame>> {
        loop {
            if let Some(frame) = self.shared.slot.read_newer(self.seen) {
                self.seen = frame.sequence;
                return Some(frame);
            }
            self.notify.changed().await.ok()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceFrame, PixelFormat, TestPatternDevice};
    use crate::encoder::rtp_timestamp_increment;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn settings(width: u32, height: u32, framerate: u32) -> CaptureSettings {
        CaptureSettings {
            width,
            height,
            framerate,
            pixel_format: "NV12".to_string(),
        }
    }

    // --- Format negotiation ---

    #[test]
    fn negotiate_picks_first_exact_match() {
        let formats = [
            CaptureFormat::new(1280, 720, 30, PixelFormat::Nv12),
            CaptureFormat::new(640, 480, 15, PixelFormat::Nv12),
            CaptureFormat::new(640, 480, 30, PixelFormat::Yuy2),
            CaptureFormat::new(640, 480, 60, PixelFormat::Nv12),
            CaptureFormat::new(640, 480, 30, PixelFormat::Nv12),
        ];
        let chosen = negotiate_format(&formats, &settings(640, 480, 30)).unwrap();
        assert_eq!(chosen, formats[3]);
    }

    #[test]
    fn negotiate_matches_subtype_case_insensitively() {
        let formats = [CaptureFormat::new(640, 480, 30, PixelFormat::Nv12)];
        let mut wanted = settings(640, 480, 30);
        wanted.pixel_format = "nv12".to_string();
        assert!(negotiate_format(&formats, &wanted).is_ok());
    }

    #[test]
    fn negotiate_without_match_is_format_unavailable() {
        let formats = [
            CaptureFormat::new(640, 480, 15, PixelFormat::Nv12),
            CaptureFormat::new(320, 240, 30, PixelFormat::Nv12),
        ];
        match negotiate_format(&formats, &settings(640, 480, 30)) {
            Err(CaptureError::FormatUnavailable {
                width,
                height,
                framerate,
                ..
            }) => assert_eq!((width, height, framerate), (640, 480, 30)),
            other => panic!("Expected FormatUnavailable, got {other:?}"),
        }
        assert!(negotiate_format(&[], &settings(640, 480, 30)).is_err());
    }

    // --- Dispatcher ---

    /// Device that always has one more frame ready.
    struct ManualDevice {
        acquired: Arc<AtomicUsize>,
    }

    impl CaptureDevice for ManualDevice {
        fn name(&self) -> &str {
            "manual"
        }
        fn supported_formats(&self) -> Vec<CaptureFormat> {
            vec![CaptureFormat::new(4, 2, 30, PixelFormat::Nv12)]
        }
        fn open(&mut self, _format: &CaptureFormat) -> Result<(), CaptureError> {
            Ok(())
        }
        fn wait_for_frame(&mut self, _timeout: Duration) -> Result<bool, CaptureError> {
            Ok(true)
        }
        fn try_acquire_latest_frame(&mut self) -> Option<DeviceFrame> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Some(DeviceFrame::tightly_packed(
                4,
                2,
                PixelFormat::Nv12,
                vec![7u8; 12],
            ))
        }
        fn close(&mut self) {}
    }

    fn dispatcher() -> (FrameDispatcher, std_mpsc::Receiver<EncodeJob>, Arc<Shared>) {
        let shared = Arc::new(Shared::new());
        let (tx, rx) = std_mpsc::sync_channel(1);
        (FrameDispatcher::new(Arc::clone(&shared), tx, 30), rx, shared)
    }

    fn manual_device() -> ManualDevice {
        ManualDevice {
            acquired: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn frames_without_subscribers_are_discarded() {
        let (mut dispatcher, jobs, shared) = dispatcher();
        let mut device = manual_device();

        assert_eq!(dispatcher.on_frame_arrived(&mut device), Dispatch::Discarded);
        assert!(shared.slot.peek().is_none());
        assert!(jobs.try_recv().is_err());
        assert_eq!(shared.idle_discarded.load(Ordering::Relaxed), 1);
        assert_eq!(device.acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raw_subscriber_gets_packed_frame_without_encoding() {
        let (mut dispatcher, jobs, shared) = dispatcher();
        let mut notify = shared.raw_notify.subscribe();
        let mut device = manual_device();

        assert_eq!(
            dispatcher.on_frame_arrived(&mut device),
            Dispatch::Published {
                encode_admitted: false
            }
        );
        assert!(notify.has_changed().unwrap());
        assert_eq!(*notify.borrow_and_update(), 1);
        let frame = shared.slot.take().expect("published frame");
        assert_eq!(&frame.pixels[..], &[7u8; 12]);
        assert!(jobs.try_recv().is_err(), "no encoded consumer, no encode");
    }

    #[test]
    fn frames_arriving_while_encoding_are_dropped() {
        let (mut dispatcher, jobs, shared) = dispatcher();
        let (sink_tx, _sink_rx) = mpsc::channel(2);
        shared.encoded_sink.store(Some(Arc::new(sink_tx)));
        let mut device = manual_device();

        // First frame is admitted and its job (holding the gate) stays unprocessed,
        // as if the encoder never returned.
        assert_eq!(
            dispatcher.on_frame_arrived(&mut device),
            Dispatch::Published {
                encode_admitted: true
            }
        );
        for _ in 0..10 {
            assert_eq!(
                dispatcher.on_frame_arrived(&mut device),
                Dispatch::Published {
                    encode_admitted: false
                }
            );
        }
        assert_eq!(shared.gate.admitted(), 1);
        assert_eq!(shared.gate.dropped(), 10);

        // Finishing the in-flight encode reopens the gate
        let job = jobs.try_recv().expect("one job in flight");
        assert_eq!(job.frame.sequence, 1);
        drop(job);
        assert_eq!(
            dispatcher.on_frame_arrived(&mut device),
            Dispatch::Published {
                encode_admitted: true
            }
        );
    }

    #[test]
    fn closed_sink_counts_as_no_subscriber() {
        let (mut dispatcher, _jobs, shared) = dispatcher();
        let (sink_tx, sink_rx) = mpsc::channel(2);
        shared.encoded_sink.store(Some(Arc::new(sink_tx)));
        drop(sink_rx);
        assert_eq!(
            dispatcher.on_frame_arrived(&mut manual_device()),
            Dispatch::Discarded
        );
    }

    #[tokio::test]
    async fn every_raw_subscriber_sees_each_frame_once() {
        let (mut dispatcher, _jobs, shared) = dispatcher();
        let mut first = RawFrameSubscriber::new(Arc::clone(&shared));
        let mut second = RawFrameSubscriber::new(Arc::clone(&shared));
        let mut device = manual_device();
        let quiet = Duration::from_millis(20);

        dispatcher.on_frame_arrived(&mut device);
        assert_eq!(first.next().await.map(|f| f.sequence), Some(1));
        assert_eq!(second.next().await.map(|f| f.sequence), Some(1));
        assert!(tokio::time::timeout(quiet, first.next()).await.is_err());

        dispatcher.on_frame_arrived(&mut device);
        assert_eq!(second.next().await.map(|f| f.sequence), Some(2));
        assert_eq!(first.next().await.map(|f| f.sequence), Some(2));
        assert_eq!(shared.slot.superseded(), 0);

        // A busy subscriber skips straight to the newest frame
        dispatcher.on_frame_arrived(&mut device);
        dispatcher.on_frame_arrived(&mut device);
        assert_eq!(first.next().await.map(|f| f.sequence), Some(4));
        assert_eq!(second.next().await.map(|f| f.sequence), Some(4));
        assert_eq!(shared.slot.superseded(), 1);
        assert!(tokio::time::timeout(quiet, second.next()).await.is_err());
    }

    // --- Full source with threads ---

    /// Encoder that can be made to block until released.
    struct GatedEncoder {
        release: Arc<(Mutex<bool>, std::sync::Condvar)>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        keyframes: Arc<AtomicUsize>,
        disposals: Arc<AtomicUsize>,
    }

    impl VideoEncoder for GatedEncoder {
        fn supported_formats(&self) -> &[PixelFormat] {
            &PixelFormat::ALL
        }

        fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedSample>, EncoderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let (lock, cvar) = &*self.release;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cvar.wait(released).unwrap();
            }
            drop(released);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(EncodedSample {
                rtp_timestamp_increment: rtp_timestamp_increment(frame.timestamp_delta),
                payload: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
                keyframe: true,
            }))
        }

        fn force_keyframe(&mut self) -> Result<(), EncoderError> {
            self.keyframes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn dispose(&mut self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct EncoderControls {
        release: Arc<(Mutex<bool>, std::sync::Condvar)>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        keyframes: Arc<AtomicUsize>,
        disposals: Arc<AtomicUsize>,
        created: Arc<AtomicUsize>,
    }

    impl EncoderControls {
        fn released() -> Self {
            let controls = Self::default();
            controls.set_released(true);
            controls
        }

        fn set_released(&self, released: bool) {
            let (lock, cvar) = &*self.release;
            *lock.lock().unwrap() = released;
            cvar.notify_all();
        }

        fn factory(&self) -> EncoderFactory {
            let controls = self.clone();
            Box::new(move |_format: &CaptureFormat| {
                controls.created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(GatedEncoder {
                    release: Arc::clone(&controls.release),
                    in_flight: Arc::clone(&controls.in_flight),
                    max_in_flight: Arc::clone(&controls.max_in_flight),
                    keyframes: Arc::clone(&controls.keyframes),
                    disposals: Arc::clone(&controls.disposals),
                }) as Box<dyn VideoEncoder>)
            })
        }
    }

    fn test_pattern_factory(width: u32, height: u32, fps: u32) -> DeviceFactory {
        Box::new(move || {
            Ok(Box::new(TestPatternDevice::new(width, height, fps)) as Box<dyn CaptureDevice>)
        })
    }

    fn source(controls: &EncoderControls) -> CaptureSource {
        CaptureSource::new(
            settings(16, 8, 120),
            test_pattern_factory(16, 8, 120),
            controls.factory(),
        )
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let controls = EncoderControls::released();
        let source = source(&controls);
        source.stop();
        source.stop();
        assert!(!source.is_running());
        assert_eq!(controls.disposals.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_is_idempotent_and_stop_disposes_once() {
        let controls = EncoderControls::released();
        let source = source(&controls);

        source.start().unwrap();
        source.start().unwrap();
        assert!(source.is_running());
        assert_eq!(controls.created.load(Ordering::SeqCst), 1);

        source.stop();
        source.stop();
        assert!(!source.is_running());
        assert_eq!(controls.disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restart_after_stop_builds_a_new_encoder() {
        let controls = EncoderControls::released();
        let source = source(&controls);
        source.start().unwrap();
        source.stop();
        source.start().unwrap();
        source.stop();
        assert_eq!(controls.created.load(Ordering::SeqCst), 2);
        assert_eq!(controls.disposals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mismatched_format_fails_and_stays_stopped() {
        let controls = EncoderControls::released();
        let source = CaptureSource::new(
            settings(640, 480, 30),
            test_pattern_factory(320, 240, 30),
            controls.factory(),
        );
        assert!(matches!(
            source.start(),
            Err(CaptureError::FormatUnavailable { .. })
        ));
        assert!(!source.is_running());
        assert_eq!(controls.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_device_is_device_unavailable() {
        let controls = EncoderControls::released();
        let source = CaptureSource::new(
            settings(640, 480, 30),
            Box::new(|| Err(CaptureError::DeviceUnavailable("no camera".to_string()))),
            controls.factory(),
        );
        assert!(matches!(
            source.start(),
            Err(CaptureError::DeviceUnavailable(_))
        ));
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn encoded_samples_reach_the_sink() {
        let controls = EncoderControls::released();
        let source = source(&controls);
        let (tx, mut rx) = mpsc::channel(4);
        source.set_encoded_sink(tx);
        source.request_keyframe();

        source.start().unwrap();
        let sample = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sample within timeout")
            .expect("sink open");
        assert!(sample.keyframe);
        assert!(sample.rtp_timestamp_increment > 0);
        tokio::task::spawn_blocking(move || {
            source.stop();
            source
        })
        .await
        .unwrap();
        assert_eq!(controls.keyframes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn raw_subscriber_receives_frames() {
        let controls = EncoderControls::released();
        let source = source(&controls);
        let mut subscriber = source.subscribe_raw();
        source.start().unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), subscriber.next())
            .await
            .expect("frame within timeout")
            .expect("source alive");
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.pixels.len(), PixelFormat::Nv12.packed_len(16, 8));
        tokio::task::spawn_blocking(move || source.stop())
            .await
            .unwrap();
    }

    /// Device whose first wait reports a failure, like an unplugged camera.
    struct UnpluggedDevice;

    impl CaptureDevice for UnpluggedDevice {
        fn name(&self) -> &str {
            "unplugged"
        }
        fn supported_formats(&self) -> Vec<CaptureFormat> {
            vec![CaptureFormat::new(16, 8, 120, PixelFormat::Nv12)]
        }
        fn open(&mut self, _format: &CaptureFormat) -> Result<(), CaptureError> {
            Ok(())
        }
        fn wait_for_frame(&mut self, _timeout: Duration) -> Result<bool, CaptureError> {
            Err(CaptureError::Device("device removed".to_string()))
        }
        fn try_acquire_latest_frame(&mut self) -> Option<DeviceFrame> {
            None
        }
        fn close(&mut self) {}
    }

    #[test]
    fn device_failure_stops_running_and_start_rebuilds() {
        let controls = EncoderControls::released();
        let opened = Arc::new(AtomicUsize::new(0));
        let factory: DeviceFactory = {
            let opened = Arc::clone(&opened);
            Box::new(move || {
                opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(UnpluggedDevice) as Box<dyn CaptureDevice>)
            })
        };
        let source = CaptureSource::new(settings(16, 8, 120), factory, controls.factory());

        source.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!source.is_running(), "dead capture thread still reported running");

        source.start().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(controls.created.load(Ordering::SeqCst), 2);
        assert_eq!(controls.disposals.load(Ordering::SeqCst), 1, "dead run was released");

        source.stop();
        assert_eq!(controls.disposals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stalled_encoder_drops_frames_and_stop_waits_for_it() {
        let controls = EncoderControls::default();
        let source = Arc::new(source(&controls));
        let (tx, _rx) = mpsc::channel(4);
        source.set_encoded_sink(tx);
        source.start().unwrap();

        // Let frames pile up against the stuck encode
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.stats().encode_dropped < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = source.stats();
        assert!(stats.encode_dropped >= 5, "stats: {stats:?}");
        assert_eq!(stats.encode_admitted, 1);
        assert_eq!(controls.max_in_flight.load(Ordering::SeqCst), 1);

        // stop() blocks on the in-flight encode until it returns
        let stopper = {
            let source = Arc::clone(&source);
            std::thread::spawn(move || source.stop())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(controls.disposals.load(Ordering::SeqCst), 0);
        controls.set_released(true);
        stopper.join().unwrap();

        assert!(!source.is_running());
        assert_eq!(controls.disposals.load(Ordering::SeqCst), 1);
        assert_eq!(controls.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
