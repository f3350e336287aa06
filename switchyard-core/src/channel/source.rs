//! Channel set providers
//!
//! The registry does not care where channels live. A deployment backed by a
//! database or a file implements [`ChannelSource`] over its store; embedders
//! and tests use [`StaticChannelSource`].

use super::model::ChannelConfig;
use async_trait::async_trait;
use parking_lot::RwLock;

/// Something that can list the current channel set
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelConfig>>;
}

/// In-memory channel list
///
/// [`replace`](Self::replace) swaps the list; the next reload picks it up.
#[derive(Debug, Default)]
pub struct StaticChannelSource {
    channels: RwLock<Vec<ChannelConfig>>,
}

impl StaticChannelSource {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        Self {
            channels: RwLock::new(channels),
        }
    }

    pub fn replace(&self, channels: Vec<ChannelConfig>) {
        *self.channels.write() = channels;
    }
}

#[async_trait]
impl ChannelSource for StaticChannelSource {
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelConfig>> {
        Ok(self.channels.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replace_is_seen_by_next_listing() {
        let source = StaticChannelSource::new(vec![ChannelConfig::new("a", "ollama")]);
        assert_eq!(source.list_channels().await.unwrap()[0].id, "a");

        source.replace(vec![
            ChannelConfig::new("b", "ollama"),
            ChannelConfig::new("c", "ollama"),
        ]);
        let ids: Vec<String> = source
            .list_channels()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
