use crate::candidates::{CandidateDisposition, PendingCandidateQueue};
use crate::capture::CaptureError;
use async_trait::async_trait;
use camrelay_protocol::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Connection state as reported by the peer connection. Only observed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// The peer connection as seen by negotiation. This side always answers.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, offer: SessionDescription) -> anyhow::Result<()>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, answer: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self, reason: &str) -> anyhow::Result<()>;
}

/// Whatever produces media once connected. `start` and `stop` may block.
pub trait MediaPipeline: Send + Sync {
    fn start(&self) -> Result<(), CaptureError>;
    fn stop(&self);
}

#[derive(Debug)]
pub enum NegotiationEvent {
    /// Raw inbound signaling payload, parsed by the state machine
    SignalingText(String),
    Signal(SignalingMessage),
    ConnectionStateChanged(ConnectionState),
    /// The signaling transport is gone for good
    SignalingLost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveRemoteOffer,
    HaveLocalAnswer,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Past the SDP exchange; a new offer here is a renegotiation.
    fn is_connectivity(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnected)
    }
}

/// Cloneable entry point for the peer connection callbacks and the
/// signaling adapter.
#[derive(Clone)]
pub struct NegotiationHandle {
    events: mpsc::UnboundedSender<NegotiationEvent>,
    candidates: Arc<PendingCandidateQueue>,
}

impl NegotiationHandle {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<NegotiationEvent>,
        candidates: Arc<PendingCandidateQueue>,
    ) -> Self {
        Self { events, candidates }
    }

    /// A locally gathered candidate. Classified on the calling thread.
    pub fn local_candidate(&self, candidate: IceCandidate) -> CandidateDisposition {
        self.candidates.on_local_candidate(candidate)
    }

    pub fn connection_state_changed(&self, state: ConnectionState) {
        // The queue must see the new state before any later candidate does
        self.candidates.observe_state(state);
        self.send(NegotiationEvent::ConnectionStateChanged(state));
    }

    pub fn signaling_text(&self, text: String) {
        self.send(NegotiationEvent::SignalingText(text));
    }

    pub fn signal(&self, message: SignalingMessage) {
        self.send(NegotiationEvent::Signal(message));
    }

    pub fn signaling_lost(&self, reason: impl Into<String>) {
        self.send(NegotiationEvent::SignalingLost(reason.into()));
    }

    fn send(&self, event: NegotiationEvent) {
        if let Err(e) = self.events.send(event) {
            debug!(event = ?e.0, "Negotiation finished, dropping event");
        }
    }
}

/// Single dispatcher for everything that can change the negotiation.
///
/// Events from independent producers (signaling, peer connection callbacks)
/// are handled one at a time in arrival order.
pub struct NegotiationStateMachine {
    peer: Arc<dyn PeerConnection>,
    pipeline: Arc<dyn MediaPipeline>,
    candidates: Arc<PendingCandidateQueue>,
    state: NegotiationState,
    pipeline_started: bool,
    events_tx: mpsc::UnboundedSender<NegotiationEvent>,
    events_rx: mpsc::UnboundedReceiver<NegotiationEvent>,
}

impl NegotiationStateMachine {
    pub fn new(
        peer: Arc<dyn PeerConnection>,
        pipeline: Arc<dyn MediaPipeline>,
        candidates: Arc<PendingCandidateQueue>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            peer,
            pipeline,
            candidates,
            state: NegotiationState::Idle,
            pipeline_started: false,
            events_tx,
            events_rx,
        }
    }

    pub fn handle(&self) -> NegotiationHandle {
        NegotiationHandle::new(self.events_tx.clone(), Arc::clone(&self.candidates))
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Process events until the negotiation reaches a terminal state.
    pub async fn run(mut self) -> NegotiationState {
        while let Some(event) = self.events_rx.recv().await {
            if self.handle_event(event).await.is_break() {
                break;
            }
        }
        info!(state = ?self.state, "Negotiation finished");
        self.state
    }

    /// Apply one event. `Break` means the negotiation is over.
    pub async fn handle_event(&mut self, event: NegotiationEvent) -> ControlFlow<()> {
        if self.state.is_terminal() {
            debug!(state = ?self.state, ?event, "Ignoring event after negotiation ended");
            return ControlFlow::Break(());
        }

        match event {
            NegotiationEvent::SignalingText(text) => {
                match SignalingMessage::parse(&text) {
                    Ok(Some(message)) => self.on_signal(message).await,
                    Ok(None) => debug!("Ignoring signaling message of unknown type"),
                    Err(e) => warn!("Ignoring signaling message: {e}"),
                }
                ControlFlow::Continue(())
            }
            NegotiationEvent::Signal(message) => {
                self.on_signal(message).await;
                ControlFlow::Continue(())
            }
            NegotiationEvent::ConnectionStateChanged(state) => {
                self.on_connection_state(state).await
            }
            NegotiationEvent::SignalingLost(reason) => {
                warn!(%reason, "Signaling lost, closing peer connection");
                self.transition(NegotiationState::Closed);
                self.close_peer(&format!("signaling lost: {reason}")).await;
                self.stop_pipeline().await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer { offer } => self.on_offer(offer).await,
            SignalingMessage::Answer { .. } => {
                warn!("Ignoring SDP answer: this peer only answers offers");
            }
            SignalingMessage::Candidate { candidate } => {
                debug!(candidate = %candidate.candidate, "Adding remote ICE candidate");
                if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                    warn!("Failed to add remote ICE candidate: {e:#}");
                }
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        if offer.sdp_type != SdpType::Offer {
            warn!(sdp_type = ?offer.sdp_type, "Ignoring offer message carrying a non-offer description");
            return;
        }
        let renegotiation = self.state.is_connectivity();
        info!(sdp_len = offer.sdp.len(), renegotiation, "Received SDP offer");

        if let Err(e) = self.peer.set_remote_description(offer).await {
            warn!("Failed to apply remote offer: {e:#}");
            return;
        }
        if !renegotiation {
            self.transition(NegotiationState::HaveRemoteOffer);
        }

        let answer = match self.peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to create answer: {e:#}");
                return;
            }
        };
        if let Err(e) = self.peer.set_local_description(answer.clone()).await {
            warn!("Failed to apply local answer: {e:#}");
            return;
        }
        if self
            .candidates
            .outbound()
            .send(SignalingMessage::Answer { answer })
            .is_err()
        {
            warn!("Signaling channel closed, SDP answer not sent");
            return;
        }
        info!("Sent SDP answer");
        if !renegotiation {
            self.transition(NegotiationState::HaveLocalAnswer);
        }

        self.candidates.flush();
    }

    async fn on_connection_state(&mut self, state: ConnectionState) -> ControlFlow<()> {
        info!(?state, "Peer connection state changed");
        match state {
            ConnectionState::New => {}
            ConnectionState::Connecting => self.transition(NegotiationState::Connecting),
            ConnectionState::Connected => {
                self.transition(NegotiationState::Connected);
                self.start_pipeline().await;
            }
            ConnectionState::Disconnected => self.transition(NegotiationState::Disconnected),
            ConnectionState::Failed => {
                self.transition(NegotiationState::Failed);
                self.close_peer("ice connection failed").await;
                self.stop_pipeline().await;
                return ControlFlow::Break(());
            }
            ConnectionState::Closed => {
                self.transition(NegotiationState::Closed);
                self.stop_pipeline().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start_pipeline(&mut self) {
        if self.pipeline_started {
            return;
        }
        let pipeline = Arc::clone(&self.pipeline);
        match tokio::task::spawn_blocking(move || pipeline.start()).await {
            Ok(Ok(())) => {
                info!("Media pipeline started");
                self.pipeline_started = true;
            }
            Ok(Err(e)) => error!("Failed to start media pipeline: {e}"),
            Err(e) => error!("Media pipeline start task failed: {e}"),
        }
    }

    async fn stop_pipeline(&mut self) {
        let pipeline = Arc::clone(&self.pipeline);
        if let Err(e) = tokio::task::spawn_blocking(move || pipeline.stop()).await {
            error!("Media pipeline stop task failed: {e}");
        }
        self.pipeline_started = false;
    }

    async fn close_peer(&self, reason: &str) {
        if let Err(e) = self.peer.close(reason).await {
            warn!("Failed to close peer connection: {e:#}");
        }
    }

    fn transition(&mut self, to: NegotiationState) {
        if self.state != to {
            info!(from = ?self.state, to = ?to, "Negotiation state");
            self.state = to;
        }
        // Local candidates gathered from here on are discarded
        match to {
            NegotiationState::Failed => {
                self.candidates.observe_state(ConnectionState::Failed);
            }
            NegotiationState::Closed => {
                self.candidates.observe_state(ConnectionState::Closed);
            }
            _ => {}
        }
    }
}
