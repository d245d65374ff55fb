// Client-facing WebSocket endpoint: subscriptions, snapshot requests and
// bot command forwarding
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tickerflow_common::{Granularity, ServerFrame};

use crate::hub::{ClientHandle, ClientQueue, OutboundFrame};
use crate::state::AppState;
use crate::upstream::{Channel, UpstreamCommand};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let queue = Arc::new(ClientQueue::new(state.config.server.client_queue_size));
    let (close_tx, mut close_rx) = watch::channel::<Option<u16>>(None);

    state.hub.add_client(
        &client_id,
        ClientHandle {
            queue: queue.clone(),
            close: close_tx,
        },
    );

    // Greeting plus any cached book snapshot for immediate hydration.
    let greeting = serde_json::to_string(&ServerFrame::Connected {
        message: "connected to tickerflow feed".to_string(),
    })
    .unwrap_or_default();
    queue.push(OutboundFrame { text: greeting, droppable: false });
    for snapshot in state.hub.cached_snapshots() {
        if let Ok(text) = serde_json::to_string(&ServerFrame::Level2 { data: snapshot }) {
            queue.push(OutboundFrame { text, droppable: false });
        }
    }

    // Single-writer send loop; the close watch always has room.
    let writer_queue = queue.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = writer_queue.pop() => {
                    if sender.send(Message::Text(frame.text)).await.is_err() {
                        return;
                    }
                }
                changed = close_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let code = *close_rx.borrow();
                    if let Some(code) = code {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: "closing".into(),
                            })))
                            .await;
                        return;
                    }
                }
            }
        }
    });

    // Read loop.
    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, &client_id, &queue, &text).await;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The protocol layer answers pings automatically.
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Client {} socket error: {}", client_id, e);
                        break;
                    }
                }
            }
            _ = &mut write_task => break,
        }
    }

    // Disconnect cleanup: subscriptions, throttle state and any upstream
    // channels this client solely held.
    state.hub.remove_client(&client_id);
    for product in state.registry.drop_client(&client_id) {
        request_unsubscribe(&state, &product).await;
    }
    write_task.abort();
    info!("Client {} cleaned up", client_id);
}

async fn handle_client_frame(
    state: &AppState,
    client_id: &str,
    queue: &ClientQueue,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Client {} sent invalid JSON: {}", client_id, e);
            return;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("subscribe") => {
            let Some((pair, label, granularity)) = parse_subscription(&value) else {
                send_error(queue, "subscribe requires pair and a known granularity");
                return;
            };
            let outcome = state
                .registry
                .add(client_id, &pair, &label, granularity.seconds());
            if outcome.first_for_product {
                request_subscribe(state, &pair).await;
            }
            send_frame(
                queue,
                &ServerFrame::Subscribed { pair, granularity: label },
            );
        }
        Some("unsubscribe") => {
            let Some((pair, label, _)) = parse_subscription(&value) else {
                send_error(queue, "unsubscribe requires pair and a known granularity");
                return;
            };
            let outcome = state.registry.remove(client_id, &pair, &label);
            if outcome.last_for_product {
                request_unsubscribe(state, &pair).await;
            }
            send_frame(
                queue,
                &ServerFrame::Unsubscribed { pair, granularity: label },
            );
        }
        Some("requestLevel2Snapshot") => {
            for product in &state.config.upstream.products {
                match state.book.get_full(product).await {
                    Ok(book) => {
                        let data = json!({
                            "type": "snapshot",
                            "product_id": product,
                            "bids": book.bids,
                            "asks": book.asks,
                        });
                        send_frame(queue, &ServerFrame::Level2 { data });
                    }
                    Err(e) => {
                        warn!("Snapshot request failed for {}: {}", product, e);
                    }
                }
            }
        }
        Some(_) => {
            // Opaque bot command; forwarded unchanged.
            state.bot.forward(text);
        }
        None => {
            debug!("Client {} frame without type field", client_id);
        }
    }
}

fn parse_subscription(value: &serde_json::Value) -> Option<(String, String, Granularity)> {
    let pair = value.get("pair")?.as_str()?.to_string();
    let label = value.get("granularity")?.as_str()?.to_string();
    let granularity = Granularity::from_label(&label)?;
    Some((pair, label, granularity))
}

async fn request_subscribe(state: &AppState, product: &str) {
    for cmd in [
        UpstreamCommand::SubscribeTrades(product.to_string()),
        UpstreamCommand::SubscribeTicker(product.to_string()),
    ] {
        if state.upstream_tx.send(cmd).await.is_err() {
            warn!("Upstream command channel closed");
            return;
        }
    }
}

async fn request_unsubscribe(state: &AppState, product: &str) {
    for channel in [Channel::MarketTrades, Channel::Ticker] {
        if state
            .upstream_tx
            .send(UpstreamCommand::Unsubscribe(product.to_string(), channel))
            .await
            .is_err()
        {
            warn!("Upstream command channel closed");
            return;
        }
    }
}

fn send_frame(queue: &ClientQueue, frame: &ServerFrame) {
    if let Ok(text) = serde_json::to_string(frame) {
        queue.push(OutboundFrame { text, droppable: false });
    }
}

fn send_error(queue: &ClientQueue, message: &str) {
    send_frame(
        queue,
        &ServerFrame::Error {
            message: message.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_subscription() {
        let value = json!({"type": "subscribe", "pair": "BTC-USD", "granularity": "5m"});
        let (pair, label, granularity) = parse_subscription(&value).unwrap();
        assert_eq!(pair, "BTC-USD");
        assert_eq!(label, "5m");
        assert_eq!(granularity, Granularity::FiveMinutes);
    }

    #[test]
    fn rejects_unknown_granularity() {
        let value = json!({"type": "subscribe", "pair": "BTC-USD", "granularity": "7m"});
        assert!(parse_subscription(&value).is_none());
        let value = json!({"type": "subscribe", "pair": "BTC-USD"});
        assert!(parse_subscription(&value).is_none());
    }
}
