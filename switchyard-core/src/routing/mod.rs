//! Request routing: per-request context and channel selection

mod context;
mod selector;

pub use context::{normalize_model, resolve_model, RelayContext};
pub use selector::ChannelSelector;
