use std::time::{Duration, Instant};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Weight of the newest interval in the smoothed average.
const SMOOTHING: f64 = 0.1;

/// Measures inter-frame intervals. Diagnostics only; nothing is throttled.
#[derive(Debug)]
pub struct FrameRatePacer {
    nominal: Duration,
    last_tick: Option<Instant>,
    smoothed_secs: Option<f64>,
    frames: u64,
    last_heartbeat: Instant,
}

impl FrameRatePacer {
    pub fn new(nominal_fps: u32) -> Self {
        Self {
            nominal: Duration::from_secs(1) / nominal_fps.max(1),
            last_tick: None,
            smoothed_secs: None,
            frames: 0,
            last_heartbeat: Instant::now(),
        }
    }

    /// Record a frame now. Returns the interval since the previous one.
    pub fn tick(&mut self) -> Duration {
        self.tick_at(Instant::now())
    }

    /// Record a frame at `now`. The first frame reports the nominal interval.
    pub fn tick_at(&mut self, now: Instant) -> Duration {
        let interval = match self.last_tick {
            Some(prev) => now.saturating_duration_since(prev),
            None => self.nominal,
        };
        let secs = interval.as_secs_f64();
        self.smoothed_secs = Some(match self.smoothed_secs {
            Some(avg) => avg + SMOOTHING * (secs - avg),
            None => secs,
        });
        self.last_tick = Some(now);
        self.frames += 1;
        interval
    }

    /// Smoothed frames per second, 0 before the first frame.
    pub fn fps(&self) -> f64 {
        match self.smoothed_secs {
            Some(avg) if avg > 0.0 => 1.0 / avg,
            _ => 0.0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// True at most once per heartbeat interval.
    pub fn heartbeat_due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_heartbeat) >= HEARTBEAT_INTERVAL {
            self.last_heartbeat = now;
            true
        } else {
            false
        }
    }
}
