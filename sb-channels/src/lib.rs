//! Channel adapters for Switchboard.
//!
//! Adapters are pure I/O: they turn platform payloads into
//! `sb_core::InboundEvent` and deliver `OutboundMessage`s to addresses the
//! core has already resolved. Reconnects are driven from outside through
//! [`AdapterConnection`].

mod connection;
mod signal;
mod telegram;
mod traits;
mod types;

pub use connection::AdapterConnection;
pub use signal::{SignalAdapter, SignalContactDirectory};
pub use telegram::{TelegramAdapter, TelegramBotProfile};
pub use traits::ChannelAdapter;
pub use types::{DeliveryId, OutboundMessage};
