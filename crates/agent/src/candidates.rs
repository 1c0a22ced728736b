use crate::negotiation::ConnectionState;
use camrelay_protocol::{IceCandidate, SignalingMessage};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What happened to a locally generated candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Sent, together with this many previously queued candidates
    Sent(usize),
    Queued,
    /// Generated after the connection failed or closed
    Discarded,
}

struct Inner {
    connection: ConnectionState,
    pending: Vec<IceCandidate>,
}

/// Holds local ICE candidates until connectivity starts.
///
/// A candidate generated while the connection is neither connecting nor
/// connected is queued; from then on every candidate is sent immediately.
/// Append and drain-and-send happen under one lock, so a flush can never miss
/// a concurrently appended candidate and nothing is sent twice.
pub struct PendingCandidateQueue {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    inner: Mutex<Inner>,
}

impl PendingCandidateQueue {
    pub fn new(outbound: mpsc::UnboundedSender<SignalingMessage>) -> Self {
        Self {
            outbound,
            inner: Mutex::new(Inner {
                connection: ConnectionState::New,
                pending: Vec::new(),
            }),
        }
    }

    /// Classify a candidate from the peer connection by the current
    /// connection state.
    pub fn on_local_candidate(&self, candidate: IceCandidate) -> CandidateDisposition {
        let mut inner = self.lock();
        match inner.connection {
            ConnectionState::Connecting | ConnectionState::Connected => {
                let earlier = inner.pending.len();
                inner.pending.push(candidate);
                self.drain(&mut inner);
                CandidateDisposition::Sent(earlier)
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                debug!(
                    state = ?inner.connection,
                    "Discarding local ICE candidate generated after shutdown"
                );
                CandidateDisposition::Discarded
            }
            _ => {
                inner.pending.push(candidate);
                debug!(
                    pending = inner.pending.len(),
                    state = ?inner.connection,
                    "Queued local ICE candidate"
                );
                CandidateDisposition::Queued
            }
        }
    }

    /// Record a connection state change. Returns how many queued candidates
    /// were sent as a result.
    pub fn observe_state(&self, state: ConnectionState) -> usize {
        let mut inner = self.lock();
        inner.connection = state;
        match state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                let sent = self.drain(&mut inner);
                if sent > 0 {
                    info!(sent, ?state, "Flushed queued ICE candidates");
                }
                sent
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                if !inner.pending.is_empty() {
                    debug!(
                        dropped = inner.pending.len(),
                        ?state,
                        "Dropping queued ICE candidates"
                    );
                    inner.pending.clear();
                }
                0
            }
            ConnectionState::New | ConnectionState::Disconnected => 0,
        }
    }

    /// Send everything queued, in generation order.
    pub fn flush(&self) -> usize {
        let mut inner = self.lock();
        let sent = self.drain(&mut inner);
        if sent > 0 {
            info!(sent, "Flushed queued ICE candidates");
        }
        sent
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Sender for other outbound signaling messages. Messages sent here are
    /// ordered with the candidates this queue sends.
    pub fn outbound(&self) -> &mpsc::UnboundedSender<SignalingMessage> {
        &self.outbound
    }

    fn drain(&self, inner: &mut Inner) -> usize {
        let mut sent = 0;
        for candidate in inner.pending.drain(..) {
            debug!(candidate = %candidate.candidate, "Sending local ICE candidate");
            if self
                .outbound
                .send(SignalingMessage::Candidate { candidate })
                .is_err()
            {
                warn!("Signaling channel closed, local ICE candidate lost");
                continue;
            }
            sent += 1;
        }
        sent
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
