use crate::negotiation::NegotiationHandle;

use std::sync::Arc;

use anyhow::Context;
use camrelay_protocol::SignalingMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

/// Everything the signaling task needs, owned so it can be spawned.
pub(crate) struct SignalingCtx {
    pub url: String,
    pub tls_cert_path: Option<String>,
    pub max_message_size: usize,
    pub handle: NegotiationHandle,
}

/// Connect once and shuttle messages until the transport ends. Losing the
/// transport is reported to negotiation; reconnecting is left to whoever
/// restarts the agent.
pub(crate) async fn run_signaling(
    ctx: SignalingCtx,
    mut outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
) {
    info!(url = %ctx.url, "Connecting to signaling server");
    match connect_and_handle(&ctx, &mut outbound_rx).await {
        Ok(()) => {
            info!("Signaling connection closed");
            ctx.handle.signaling_lost("closed by peer");
        }
        Err(e) => {
            warn!("Signaling connection error: {e:#}");
            ctx.handle.signaling_lost(format!("{e:#}"));
        }
    }
}

/// Build a TLS connector from the system roots, plus a pinned certificate
/// when a path is given.
fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned server certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to read TLS cert from {cert_path}: {e}, falling back to system roots"
                );
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

async fn connect_and_handle(
    ctx: &SignalingCtx,
    outbound_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
) -> anyhow::Result<()> {
    let connector = ctx
        .url
        .starts_with("wss://")
        .then(|| build_tls_connector(ctx.tls_cert_path.as_deref()));
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(ctx.max_message_size);
    ws_config.max_frame_size = Some(ctx.max_message_size);

    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        ctx.url.as_str(),
        Some(ws_config),
        false,
        connector,
    )
    .await
    .context("WebSocket connection failed")?;

    info!("Connected to signaling server");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(len = text.len(), "Inbound signaling message");
                        ctx.handle.signaling_text(text.to_string());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => ctx.handle.signaling_text(text),
                            Err(_) => warn!(len = data.len(), "Ignoring non-UTF-8 binary signaling message"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Signaling server sent close");
                        return Ok(());
                    }
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e).context("WebSocket receive failed"),
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                }
            }
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else {
                    info!("Outbound signaling closed, disconnecting");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                };
                let text = msg.to_json().context("Failed to serialize signaling message")?;
                debug!(kind = msg.kind(), "Outbound signaling message");
                ws_tx
                    .send(Message::Text(text.into()))
                    .await
                    .context("WebSocket send failed")?;
            }
        }
    }
}
