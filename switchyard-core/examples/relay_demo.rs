//! Relay Demo - Fail-over Between Channels
//!
//! Loads a channel file (or falls back to a local Ollama plus an OpenAI
//! channel), starts the health checker, then relays one streaming request
//! and prints the per-channel health snapshot.
//!
//! Run with: cargo run --example relay_demo -- [channels.yaml] [settings.yaml]
//!
//! Set `RUST_LOG=switchyard_core=debug` to watch channel selection.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use switchyard_core::channel::{ChannelConfig, ChannelSource, StaticChannelSource};
use switchyard_core::config::{self, RelaySettings};
use switchyard_core::protocol::{ChatRequest, Message};
use switchyard_core::relay::Relay;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct ChannelFile {
    channels: Vec<ChannelConfig>,
}

/// YAML channel file, re-read on every reload
struct ChannelFileSource(PathBuf);

#[async_trait]
impl ChannelSource for ChannelFileSource {
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelConfig>> {
        let content = tokio::fs::read_to_string(&self.0).await?;
        let content = config::env::interpolate_env_vars(&content)?;
        let file: ChannelFile = serde_yaml::from_str(&content)?;
        Ok(file.channels)
    }
}

fn fallback_channels() -> Vec<ChannelConfig> {
    let mut channels = vec![ChannelConfig::new("local-ollama", "ollama")
        .with_base_url("http://localhost:11434")
        .with_models(["llama3.2"])
        .with_priority(0)];

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        channels.push(
            ChannelConfig::new("openai-backup", "openai")
                .with_key(key)
                .with_models(["llama3.2"])
                .with_model_mapping("llama3.2", "gpt-4o-mini")
                .with_priority(1),
        );
    }
    channels
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let channel_file = args.next();
    let settings = match args.next() {
        Some(path) => config::load_from_yaml(path)?,
        None => RelaySettings::default(),
    };

    let source: Box<dyn ChannelSource> = match channel_file {
        Some(path) => Box::new(ChannelFileSource(path.into())),
        None => Box::new(StaticChannelSource::new(fallback_channels())),
    };

    let relay = Relay::builder(settings).build()?;
    let loaded = relay.reload_from(source.as_ref()).await?;
    println!("Loaded {} channel(s)", loaded);
    for channel in source.list_channels().await? {
        println!("  {} ({}) priority {}", channel.id, channel.provider, channel.priority);
    }

    let shutdown = CancellationToken::new();
    let health = relay.health_checker().spawn(shutdown.clone());

    let request = ChatRequest::new(
        "llama3.2",
        vec![
            Message::system("Answer in one sentence."),
            Message::user("What does a circuit breaker do in a network service?"),
        ],
    );

    println!();
    let mut stream = relay.stream(request);
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                print!("{}", chunk.text());
                std::io::stdout().flush()?;
            }
            Err(err) => {
                println!();
                println!("Relay failed ({}): {}", err.kind(), err);
            }
        }
    }
    println!();

    println!();
    println!("{}", serde_json::to_string_pretty(&relay.health_snapshot())?);

    shutdown.cancel();
    health.await?;
    Ok(())
}
