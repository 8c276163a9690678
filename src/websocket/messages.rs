//! WebSocket wire messages
//!
//! Server-to-client control frames plus the serialisation helpers for
//! bus events. Market events ([`crate::bus::MarketEvent`]) already carry
//! their own `type` tags (`orderbook_update`, `trade_executed`,
//! `market_resolved`, `market_deleted`) and are sent as-is.

use serde::{Deserialize, Serialize};

use crate::bus::{MarketEvent, PortfolioDelta};
use crate::core_types::{MarketId, UserId};

/// Control frames the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Connected { user_id: UserId },
    Pong,
    Subscribed { market_id: MarketId },
    Unsubscribed { market_id: MarketId },
    Error { message: String },
}

/// Frames the client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    SubscribeMarket { market_id: MarketId },
    UnsubscribeMarket { market_id: MarketId },
}

#[derive(Serialize)]
struct PortfolioFrame<'a> {
    r#type: &'static str,
    #[serde(flatten)]
    delta: &'a PortfolioDelta,
}

/// Serialise a frame, falling back to an empty object on failure (the
/// types above cannot actually fail to serialise).
pub fn encode<T: Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string())
}

pub fn encode_market_event(event: &MarketEvent) -> String {
    encode(event)
}

pub fn encode_portfolio(delta: &PortfolioDelta) -> String {
    encode(&PortfolioFrame {
        r#type: "portfolio_update",
        delta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_are_tagged() {
        let json = encode(&WsMessage::Subscribed { market_id: 7 });
        assert!(json.contains("\"type\":\"subscribed\""));
        assert!(json.contains("\"market_id\":7"));
    }

    #[test]
    fn client_frames_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_market","market_id":3}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SubscribeMarket { market_id: 3 }));
    }

    #[test]
    fn portfolio_frame_carries_type_tag() {
        let delta = PortfolioDelta {
            user_id: 1,
            market_id: 2,
            balance_avail: 40_000,
            balance_frozen: 0,
            yes_shares: 10,
            no_shares: 0,
        };
        let json = encode_portfolio(&delta);
        assert!(json.contains("\"type\":\"portfolio_update\""));
        assert!(json.contains("\"yes_shares\":10"));
    }

    #[test]
    fn market_events_carry_their_own_tags() {
        let event = MarketEvent::MarketDeleted { market_id: 9 };
        let json = encode_market_event(&event);
        assert!(json.contains("\"type\":\"market_deleted\""));
    }
}
