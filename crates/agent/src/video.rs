use crate::encoder::EncodedSample;
use crate::peer::WebRtcPeer;

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long to wait for an IDR before asking again.
const IDR_WAIT: Duration = Duration::from_millis(500);
/// Requests before giving up and sending P-frames anyway.
const MAX_IDR_REQUESTS: u32 = 5;

/// Where encoded samples go once the peer is connected.
#[async_trait]
pub(crate) trait VideoSink: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn write_sample(&self, sample: &EncodedSample) -> anyhow::Result<()>;
}

#[async_trait]
impl VideoSink for WebRtcPeer {
    fn is_connected(&self) -> bool {
        WebRtcPeer::is_connected(self)
    }

    async fn write_sample(&self, sample: &EncodedSample) -> anyhow::Result<()> {
        self.write_video_sample(sample).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdrDecision {
    Send,
    Skip { request_keyframe: bool },
}

/// Holds back P-frames after (re)connect until the decoder has an IDR.
#[derive(Debug)]
struct IdrWait {
    since: Instant,
    requests: u32,
}

impl IdrWait {
    fn new(now: Instant) -> Self {
        Self {
            since: now,
            requests: 1,
        }
    }

    fn on_sample(&mut self, keyframe: bool, now: Instant) -> IdrDecision {
        if keyframe {
            return IdrDecision::Send;
        }
        if now.duration_since(self.since) <= IDR_WAIT {
            return IdrDecision::Skip {
                request_keyframe: false,
            };
        }
        if self.requests >= MAX_IDR_REQUESTS {
            error!(
                requests = self.requests,
                "No IDR from encoder, proceeding with P-frames"
            );
            return IdrDecision::Send;
        }
        self.requests += 1;
        self.since = now;
        info!(attempt = self.requests, "IDR wait timeout, forcing another keyframe");
        IdrDecision::Skip {
            request_keyframe: true,
        }
    }
}

/// Write encoded samples to the peer while it is connected. After every
/// connect a keyframe is requested and nothing is sent until it arrives.
pub(crate) async fn run_video_send_loop(
    encoded_rx: &mut mpsc::Receiver<EncodedSample>,
    sink: &dyn VideoSink,
    request_keyframe: &(dyn Fn() + Send + Sync),
) {
    let mut written: u64 = 0;
    let mut dropped: u64 = 0;
    let mut errors: u64 = 0;
    let mut was_connected = false;
    let mut idr_wait: Option<IdrWait> = None;

    while let Some(sample) = encoded_rx.recv().await {
        if !sink.is_connected() {
            dropped += 1;
            was_connected = false;
            if dropped == 1 || dropped.is_multiple_of(300) {
                debug!(dropped, "Dropping video sample (not connected)");
            }
            continue;
        }

        if !was_connected {
            info!(dropped_before_connect = dropped, "Peer connected, forcing IDR keyframe");
            request_keyframe();
            was_connected = true;
            idr_wait = Some(IdrWait::new(Instant::now()));
        }

        if let Some(wait) = idr_wait.as_mut() {
            match wait.on_sample(sample.keyframe, Instant::now()) {
                IdrDecision::Send => {
                    info!(
                        size = sample.payload.len(),
                        waited_ms = wait.since.elapsed().as_millis() as u64,
                        keyframe = sample.keyframe,
                        "First frame after connect"
                    );
                    idr_wait = None;
                }
                IdrDecision::Skip {
                    request_keyframe: again,
                } => {
                    if again {
                        request_keyframe();
                    }
                    continue;
                }
            }
        }

        match sink.write_sample(&sample).await {
            Ok(()) => {
                written += 1;
                if written <= 5 {
                    info!(
                        size = sample.payload.len(),
                        keyframe = sample.keyframe,
                        frame = written,
                        "Video sample written"
                    );
                }
                if written.is_multiple_of(300) {
                    info!(written, "Video samples written");
                }
            }
            Err(e) => {
                errors += 1;
                if errors <= 3 || errors.is_multiple_of(100) {
                    warn!(errors, "Write video sample: {e:#}");
                }
            }
        }
    }
    info!(written, dropped, "Encoded sample channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sink whose connectivity follows a script, one entry per sample.
    #[derive(Default)]
    struct StubSink {
        connectivity: Mutex<VecDeque<bool>>,
        written: Mutex<Vec<u8>>,
    }

    impl StubSink {
        fn scripted(connectivity: &[bool]) -> Self {
            Self {
                connectivity: Mutex::new(connectivity.iter().copied().collect()),
                written: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl VideoSink for StubSink {
        fn is_connected(&self) -> bool {
            self.connectivity.lock().unwrap().pop_front().unwrap_or(true)
        }

        async fn write_sample(&self, sample: &EncodedSample) -> anyhow::Result<()> {
            self.written.lock().unwrap().push(sample.payload[0]);
            Ok(())
        }
    }

    fn sample(tag: u8, keyframe: bool) -> EncodedSample {
        EncodedSample {
            rtp_timestamp_increment: 3000,
            payload: Bytes::from(vec![tag]),
            keyframe,
        }
    }

    async fn run(sink: &StubSink, samples: Vec<EncodedSample>) -> usize {
        let requests = AtomicUsize::new(0);
        let (tx, mut rx) = mpsc::channel(samples.len().max(1));
        for s in samples {
            tx.send(s).await.unwrap();
        }
        drop(tx);
        let request = || {
            requests.fetch_add(1, Ordering::SeqCst);
        };
        run_video_send_loop(&mut rx, sink, &request).await;
        requests.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn waits_for_keyframe_after_connect() {
        let sink = StubSink::scripted(&[false, true, true, true]);
        let requests = run(
            &sink,
            vec![
                sample(1, true),
                sample(2, false),
                sample(3, true),
                sample(4, false),
            ],
        )
        .await;

        assert_eq!(*sink.written.lock().unwrap(), vec![3, 4]);
        assert_eq!(requests, 1);
    }

    #[tokio::test]
    async fn reconnect_requests_a_fresh_keyframe() {
        let sink = StubSink::scripted(&[true, true, false, true, true]);
        let requests = run(
            &sink,
            vec![
                sample(1, true),
                sample(2, false),
                sample(3, true),
                sample(4, false),
                sample(5, true),
            ],
        )
        .await;

        assert_eq!(*sink.written.lock().unwrap(), vec![1, 2, 5]);
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn nothing_written_while_disconnected() {
        let sink = StubSink::scripted(&[false; 4]);
        let requests = run(&sink, (0..4).map(|n| sample(n, true)).collect()).await;
        assert!(sink.written.lock().unwrap().is_empty());
        assert_eq!(requests, 0);
    }

    #[test]
    fn idr_wait_rerequests_then_gives_up() {
        let start = Instant::now();
        let mut wait = IdrWait::new(start);

        assert_eq!(
            wait.on_sample(false, start + Duration::from_millis(100)),
            IdrDecision::Skip {
                request_keyframe: false
            }
        );
        let mut now = start;
        for _ in 1..MAX_IDR_REQUESTS {
            now += IDR_WAIT + Duration::from_millis(1);
            assert_eq!(
                wait.on_sample(false, now),
                IdrDecision::Skip {
                    request_keyframe: true
                }
            );
        }
        now += IDR_WAIT + Duration::from_millis(1);
        assert_eq!(wait.on_sample(false, now), IdrDecision::Send);
    }

    #[test]
    fn idr_wait_sends_keyframe_immediately() {
        let start = Instant::now();
        let mut wait = IdrWait::new(start);
        assert_eq!(wait.on_sample(true, start), IdrDecision::Send);
    }
}
