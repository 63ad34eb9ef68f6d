//! Live rate feed
//!
//! Features:
//! - Push channel (WebSocket) with polling fallback
//! - Explicit connection state machine
//! - Rate store with change detection and staleness tracking
//! - Out-of-order snapshot rejection
//! - Optional carat ladder derivation

pub mod feeds;
pub mod parse;
pub mod purity;
pub mod state;
pub mod transport;

pub use feeds::{FeedConnector, FeedEvent, MessageStream, PushChannel, RateSource};
pub use parse::{parse_push_message, parse_rate_table, PushMessage, RateTable};
pub use purity::PurityLadder;
pub use state::{ChangeResult, RateStore, RateStoreStats};
pub use transport::{HttpRateSource, WsPushChannel};
