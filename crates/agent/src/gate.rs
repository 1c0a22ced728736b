use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Admits at most one encode at a time. A frame that finds the gate held is
/// dropped by the caller instead of waiting.
#[derive(Debug, Default)]
pub struct EncodeGate {
    busy: AtomicBool,
    admitted: AtomicU64,
    dropped: AtomicU64,
}

impl EncodeGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the gate without blocking. `None` means an encode is in flight
    /// and the frame should be dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<EncodePermit> {
        match self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                Some(EncodePermit {
                    gate: Arc::clone(self),
                })
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Held for the duration of one encode. Dropping it reopens the gate,
/// including when the encode panics.
#[derive(Debug)]
pub struct EncodePermit {
    gate: Arc<EncodeGate>,
}

impl Drop for EncodePermit {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}
