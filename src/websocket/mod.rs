//! WebSocket push
//!
//! Realtime channel for orderbook updates, executed trades and targeted
//! portfolio deltas. Clients subscribe per market and get an immediate
//! snapshot; portfolio updates follow the authenticated user.

pub mod handler;
pub mod messages;

pub use handler::ws_handler;
pub use messages::{ClientMessage, WsMessage};
