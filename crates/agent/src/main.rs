mod candidates;
mod capture;
mod cli;
mod device;
mod encoder;
mod gate;
mod h264;
mod negotiation;
mod pacer;
mod peer;
mod signaling;
mod slot;
mod video;

use anyhow::Context;
use camrelay_protocol::RelayConfig;
use candidates::PendingCandidateQueue;
use capture::{CaptureSettings, CaptureSource, DeviceFactory, EncoderFactory};
use device::CaptureFormat;
use encoder::{EncoderSettings, GstH264Encoder, VideoEncoder};
use negotiation::{MediaPipeline, NegotiationStateMachine, PeerConnection};
use peer::WebRtcPeer;
use signaling::SignalingCtx;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Load the config file (or defaults), apply command line overrides and
/// validate. Warnings are logged; any error aborts startup.
fn load_config(args: &cli::Args) -> anyhow::Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    args.apply(&mut config);

    if let Err(issues) = config.validate() {
        let mut fatal = false;
        for issue in &issues {
            if issue.starts_with("ERROR") {
                error!("{issue}");
                fatal = true;
            } else {
                warn!("{issue}");
            }
        }
        if fatal {
            anyhow::bail!("Invalid configuration ({} issue(s))", issues.len());
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Needed for wss:// signaling
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match cli::parse_args()? {
        cli::Command::Run(args) => args,
        cli::Command::Help => {
            println!("{}", cli::HELP);
            return Ok(());
        }
        cli::Command::Version => {
            println!("camrelay-agent {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };
    let config = load_config(&args)?;
    info!(
        signaling_url = %config.signaling.url,
        device = %config.capture.device,
        width = config.capture.width,
        height = config.capture.height,
        framerate = config.capture.framerate,
        "Starting camrelay-agent"
    );

    gstreamer::init().context("Failed to initialize GStreamer")?;

    // Pick the encoder up front: the SDP has to advertise the profile it emits
    let mut encoder_settings = EncoderSettings::from(&config.encoder);
    let backend = encoder::detect_encoder(encoder_settings.preferred.as_deref())
        .context("No usable H.264 encoder")?;
    encoder_settings.preferred = Some(backend.element_name().to_string());

    let capture_config = config.capture.clone();
    let device_factory: DeviceFactory = Box::new(move || device::open_configured(&capture_config));
    let encoder_factory: EncoderFactory = Box::new(move |format: &CaptureFormat| {
        Ok(Box::new(GstH264Encoder::new(&encoder_settings, format)?) as Box<dyn VideoEncoder>)
    });
    let capture = Arc::new(CaptureSource::new(
        CaptureSettings::from(&config.capture),
        device_factory,
        encoder_factory,
    ));
    // Two slots: one sample being written, one waiting
    let (encoded_tx, mut encoded_rx) = mpsc::channel(2);
    capture.set_encoded_sink(encoded_tx);

    let peer = Arc::new(
        WebRtcPeer::new(&config.ice, backend)
            .await
            .context("Failed to create WebRTC peer")?,
    );

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let candidates = Arc::new(PendingCandidateQueue::new(outbound_tx));
    let machine = NegotiationStateMachine::new(
        Arc::clone(&peer) as Arc<dyn PeerConnection>,
        Arc::clone(&capture) as Arc<dyn MediaPipeline>,
        candidates,
    );
    let handle = machine.handle();
    peer.on_local_candidate(handle.clone());
    peer.on_connection_state(handle.clone());
    {
        let capture = Arc::clone(&capture);
        peer.start_rtcp_reader(move || capture.request_keyframe());
    }

    let signaling_task = tokio::spawn(signaling::run_signaling(
        SignalingCtx {
            url: config.signaling.url.clone(),
            tls_cert_path: config.signaling.tls_cert.clone(),
            max_message_size: config.signaling.max_message_size,
            handle,
        },
        outbound_rx,
    ));
    let mut machine_task = tokio::spawn(machine.run());

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let request_keyframe = {
        let capture = Arc::clone(&capture);
        move || capture.request_keyframe()
    };

    tokio::select! {
        result = &mut machine_task => {
            match result {
                Ok(state) => info!(?state, "Negotiation ended, shutting down"),
                Err(e) => error!("Negotiation task failed: {e}"),
            }
        }
        _ = video::run_video_send_loop(&mut encoded_rx, peer.as_ref(), &request_keyframe) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    signaling_task.abort();
    machine_task.abort();
    if let Err(e) = peer.close("agent shutdown").await {
        warn!("{e:#}");
    }
    let stopping = Arc::clone(&capture);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        warn!("Capture stop task failed: {e}");
    }

    info!("Agent shutdown complete");
    Ok(())
}
