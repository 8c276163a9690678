//! WebSocket connection lifecycle
//!
//! `GET /ws?token=<jwt>` upgrades into a session that receives targeted
//! portfolio updates immediately and market events for every market the
//! client subscribes to. Subscribing answers with the current orderbook
//! snapshot before live updates start flowing.

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::messages::{encode, encode_market_event, encode_portfolio, ClientMessage, WsMessage};
use crate::auth::verify_token;
use crate::bus::{MarketEvent, SubId};
use crate::core_types::{MarketId, UserId};
use crate::gateway::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match verify_token(&params.token, &state.config.auth.jwt_secret) {
        Ok(user_id) => ws.on_upgrade(move |socket| handle_socket(socket, user_id, state)),
        Err(_) => axum::response::IntoResponse::into_response((
            axum::http::StatusCode::UNAUTHORIZED,
            "invalid token",
        )),
    }
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let _ = out_tx.send(encode(&WsMessage::Connected { user_id }));

    // Targeted portfolio updates flow for the whole session
    let (portfolio_sub, mut portfolio_rx) = state.bus.subscribe_user(user_id);
    let portfolio_tx = out_tx.clone();
    let portfolio_task = tokio::spawn(async move {
        while let Some(delta) = portfolio_rx.recv().await {
            if portfolio_tx.send(encode_portfolio(&delta)).is_err() {
                break;
            }
        }
    });

    // Frames out of the channel onto the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(json) = out_rx.recv().await {
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // market_id -> bus subscription of this session
    let mut subscriptions: HashMap<MarketId, SubId> = HashMap::new();

    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = &mut send_task => break,
        };
        let Some(Ok(msg)) = msg else { break };
        match msg {
            Message::Text(text) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        let _ = out_tx.send(encode(&WsMessage::Pong));
                    }
                    Ok(ClientMessage::SubscribeMarket { market_id }) => {
                        subscribe_market(&state, &mut subscriptions, &out_tx, market_id).await;
                    }
                    Ok(ClientMessage::UnsubscribeMarket { market_id }) => {
                        if let Some(sub_id) = subscriptions.remove(&market_id) {
                            state.bus.unsubscribe_market(market_id, sub_id);
                        }
                        let _ = out_tx.send(encode(&WsMessage::Unsubscribed { market_id }));
                    }
                    Err(_) => {
                        let _ = out_tx.send(encode(&WsMessage::Error {
                            message: "unrecognised message".to_string(),
                        }));
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Lazy disconnect cleanup
    for (market_id, sub_id) in subscriptions {
        state.bus.unsubscribe_market(market_id, sub_id);
    }
    state.bus.unsubscribe_user(user_id, portfolio_sub);
    portfolio_task.abort();
    send_task.abort();
    tracing::debug!(user_id, "websocket session closed");
}

async fn subscribe_market(
    state: &Arc<AppState>,
    subscriptions: &mut HashMap<MarketId, SubId>,
    out_tx: &mpsc::UnboundedSender<String>,
    market_id: MarketId,
) {
    if subscriptions.contains_key(&market_id) {
        let _ = out_tx.send(encode(&WsMessage::Subscribed { market_id }));
        return;
    }
    let handle = match state.market_handle(market_id) {
        Ok(handle) => handle,
        Err(err) => {
            let _ = out_tx.send(encode(&WsMessage::Error {
                message: format!("cannot subscribe to market {market_id}: {}", err.code()),
            }));
            return;
        }
    };

    let (sub_id, mut rx) = state.bus.subscribe_market(market_id);
    subscriptions.insert(market_id, sub_id);

    let forward_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if forward_tx.send(encode_market_event(&event)).is_err() {
                break;
            }
        }
    });

    let _ = out_tx.send(encode(&WsMessage::Subscribed { market_id }));

    // Snapshot-on-subscribe so the client renders immediately, in the
    // same frame shape as live updates
    if let Ok((_, snapshot)) = handle.snapshot(state.command_deadline()).await {
        let event = MarketEvent::OrderbookUpdate {
            market_id,
            snapshot,
        };
        let _ = out_tx.send(encode_market_event(&event));
    }
}
