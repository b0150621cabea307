use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use duet_core::ConnectionId;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::router::MessageRouter;

/// Drive one WebSocket: a writer draining the outbound queue with periodic
/// pings, and a reader handing each text frame to the router in arrival order.
pub async fn handle_ws_connection(
    socket: WebSocket,
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    router: Arc<MessageRouter>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let span = tracing::info_span!("connection", connection_id = %conn_id);

    let writer_shutdown = shutdown.clone();
    let mut writer = tokio::spawn(
        async move {
            let mut ping_interval = tokio::time::interval(heartbeat);
            ping_interval.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ping_interval.tick() => {
                        if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                        tracing::trace!("sent ping");
                    }
                    _ = writer_shutdown.cancelled() => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
        .instrument(span.clone()),
    );

    let reader_id = conn_id.clone();
    let reader_router = Arc::clone(&router);
    let mut reader = tokio::spawn(
        async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                reader_router.registry().record_activity(&reader_id);
                match msg {
                    WsMessage::Text(text) => {
                        reader_router.handle_frame(&reader_id, text.as_str()).await;
                    }
                    WsMessage::Close(_) => break,
                    // Pongs only refresh liveness; axum answers pings itself.
                    _ => {}
                }
            }
        }
        .instrument(span),
    );

    // Wait for the aborted side too, so no event handling outlives the
    // unregister below.
    tokio::select! {
        _ = &mut writer => {
            reader.abort();
            let _ = reader.await;
        }
        _ = &mut reader => {
            writer.abort();
            let _ = writer.await;
        }
    }

    router.registry().unregister(&conn_id);
    tracing::info!(connection_id = %conn_id, "connection closed");
}

/// Periodically sweep silent connections and idle session state.
pub fn start_cleanup_task(
    router: Arc<MessageRouter>,
    interval: Duration,
    client_timeout: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let removed = router.registry().cleanup_dead_connections(client_timeout);
            let pruned = router.prune_idle_sessions();
            if removed > 0 || pruned > 0 {
                tracing::info!(removed, pruned, "connection sweep");
            }
        }
    })
}
