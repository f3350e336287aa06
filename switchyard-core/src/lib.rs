//! Switchyard Core Library
//!
//! Request relay between canonical chat requests and multiple upstream model
//! providers: channel registry, health probes, circuit breakers, channel
//! selection, protocol translation and the fail-over orchestrator.
//!
//! ```no_run
//! use switchyard_core::channel::ChannelConfig;
//! use switchyard_core::config::RelaySettings;
//! use switchyard_core::protocol::{ChatRequest, Message};
//! use switchyard_core::relay::Relay;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let relay = Relay::builder(RelaySettings::default()).build()?;
//! relay.load_channels(vec![ChannelConfig::new("primary", "openai")
//!     .with_key("sk-...")
//!     .with_models(["gpt-4o"])])?;
//!
//! let response = relay
//!     .complete(ChatRequest::new("gpt-4o", vec![Message::user("Hello")]))
//!     .await?;
//! println!("{}", response.content());
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod channel;
pub mod config;
pub mod events;
pub mod health;
pub mod http;
pub mod protocol;
pub mod providers;
pub mod relay;
pub mod routing;

/// Returns the version of the Switchyard Core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
