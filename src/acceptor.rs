// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Viewer connection acceptor
//!
//! Viewers open a WebSocket and name the channel they want in the handshake
//! (`/?channel=channel3`). A listener bound to a stream's dedicated port
//! implies that stream's channel instead. Once subscribed, the connection
//! task drains its chunk queue into binary frames until either side closes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::record_rejected_connection;
use crate::registry::ChannelRegistry;

/// A single frame write may not take longer than this
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake parameters
#[derive(Debug, Deserialize)]
pub struct ViewerParams {
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Clone)]
struct AcceptorState {
    registry: Arc<ChannelRegistry>,
    fixed_channel: Option<String>,
}

/// Router for a viewer listener; `fixed_channel` is set for dedicated ports
pub fn viewer_router(registry: Arc<ChannelRegistry>, fixed_channel: Option<String>) -> Router {
    Router::new()
        .route("/", get(viewer_handler))
        .with_state(AcceptorState {
            registry,
            fixed_channel,
        })
}

/// Serve viewers on `listener` until `shutdown` fires
pub async fn serve_viewers(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn viewer_handler(
    ws: WebSocketUpgrade,
    State(state): State<AcceptorState>,
    Query(params): Query<ViewerParams>,
) -> Response {
    let requested = params.channel.filter(|c| !c.trim().is_empty());
    let Some(channel) = state.fixed_channel.clone().or(requested) else {
        warn!("Viewer connection without channel, closing");
        record_rejected_connection();
        return (StatusCode::BAD_REQUEST, "missing channel parameter").into_response();
    };

    ws.on_upgrade(move |socket| serve_viewer(socket, state.registry, channel))
}

/// Connection lifetime: subscribe, forward until close/error, unsubscribe
async fn serve_viewer(socket: WebSocket, registry: Arc<ChannelRegistry>, channel: String) {
    let mut subscription = registry.subscribe(&channel).await;
    let id = subscription.id;
    let (mut sink, mut incoming) = socket.split();

    info!(channel = %channel, connection = id, "New WebSocket connection established");

    loop {
        tokio::select! {
            chunk = subscription.recv() => match chunk {
                Some(chunk) => {
                    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Binary(chunk))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(channel = %channel, connection = id, "WebSocket write failed: {}", e);
                            break;
                        }
                        Err(_) => {
                            warn!(channel = %channel, connection = id, "WebSocket write timed out");
                            break;
                        }
                    }
                }
                // Dropped by the registry (shutdown)
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(channel = %channel, connection = id, "WebSocket error: {}", e);
                    break;
                }
                // Viewers have nothing to say
                Some(Ok(_)) => {}
            },
        }
    }

    registry.unsubscribe(&channel, id).await;
    info!(channel = %channel, connection = id, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio_tungstenite::{connect_async, tungstenite::Message as ClientMessage};

    async fn spawn_acceptor(
        registry: Arc<ChannelRegistry>,
        fixed_channel: Option<String>,
    ) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_viewers(
            listener,
            viewer_router(registry, fixed_channel),
            shutdown.clone(),
        ));
        (addr, shutdown)
    }

    async fn wait_for_subscribers(registry: &ChannelRegistry, channel: &str, n: usize) {
        for _ in 0..100 {
            if registry.subscriber_count(channel).await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{channel} never reached {n} subscribers");
    }

    #[tokio::test]
    async fn test_viewer_receives_channel_bytes() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let (addr, shutdown) = spawn_acceptor(Arc::clone(&registry), None).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/?channel=channel3"))
            .await
            .unwrap();
        wait_for_subscribers(&registry, "channel3", 1).await;

        registry
            .broadcast("channel4", Bytes::from_static(b"wrong"))
            .await;
        registry
            .broadcast("channel3", Bytes::from_static(b"frame"))
            .await;

        let msg = client.next().await.unwrap().unwrap();
        assert!(msg.is_binary());
        assert_eq!(&msg.into_data()[..], b"frame");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_missing_channel_is_rejected() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let (addr, shutdown) = spawn_acceptor(Arc::clone(&registry), None).await;

        assert!(connect_async(format!("ws://{addr}/")).await.is_err());
        assert!(connect_async(format!("ws://{addr}/?channel=")).await.is_err());
        assert!(registry.channels().await.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_client_close_unsubscribes() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let (addr, shutdown) = spawn_acceptor(Arc::clone(&registry), None).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/?channel=lobby"))
            .await
            .unwrap();
        wait_for_subscribers(&registry, "lobby", 1).await;

        client.close(None).await.unwrap();
        wait_for_subscribers(&registry, "lobby", 0).await;

        let report = registry.broadcast("lobby", Bytes::from_static(b"x")).await;
        assert_eq!(report.delivered, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dedicated_port_implies_channel() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let (addr, shutdown) =
            spawn_acceptor(Arc::clone(&registry), Some("channel9".to_string())).await;

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        wait_for_subscribers(&registry, "channel9", 1).await;

        registry
            .broadcast("channel9", Bytes::from_static(b"ts"))
            .await;
        let msg = client.next().await.unwrap().unwrap();
        assert_eq!(&msg.into_data()[..], b"ts");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_close_all_hangs_up_viewer() {
        let registry = Arc::new(ChannelRegistry::new(16));
        let (addr, shutdown) = spawn_acceptor(Arc::clone(&registry), None).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/?channel=channel1"))
            .await
            .unwrap();
        wait_for_subscribers(&registry, "channel1", 1).await;

        registry.close_all().await;
        match client.next().await {
            Some(Ok(ClientMessage::Close(_))) | None | Some(Err(_)) => {}
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
        shutdown.cancel();
    }
}
