use crate::device::RawFrame;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Single-slot "latest frame" exchange between the capture thread and its
/// consumers. Publishing and taking are one atomic swap each, so neither
/// side ever waits on the other.
///
/// Frame sequences must increase. Readers that follow the slot with
/// [`read_newer`](Self::read_newer) each keep their own last-seen sequence,
/// so any number of them see the same frame.
#[derive(Default)]
pub struct FrameBufferSlot {
    slot: ArcSwapOption<RawFrame>,
    /// Highest sequence any reader has been handed
    read_through: AtomicU64,
    superseded: AtomicU64,
}

impl FrameBufferSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` as the latest. A frame nobody read is released here.
    pub fn publish(&self, frame: Arc<RawFrame>) {
        if let Some(displaced) = self.slot.swap(Some(frame))
            && displaced.sequence > self.read_through.load(Ordering::Relaxed)
        {
            self.superseded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove and return the latest frame.
    pub fn take(&self) -> Option<Arc<RawFrame>> {
        self.slot.swap(None)
    }

    /// Latest frame if its sequence is past `seen`. Leaves it in place for
    /// other readers.
    pub fn read_newer(&self, seen: u64) -> Option<Arc<RawFrame>> {
        let frame = self.peek().filter(|f| f.sequence > seen)?;
        self.read_through.fetch_max(frame.sequence, Ordering::Relaxed);
        Some(frame)
    }

    /// Latest frame without consuming it.
    pub fn peek(&self) -> Option<Arc<RawFrame>> {
        self.slot.load_full()
    }

    pub fn clear(&self) {
        self.take();
    }

    /// Frames replaced before any consumer read them.
    pub fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }
}
