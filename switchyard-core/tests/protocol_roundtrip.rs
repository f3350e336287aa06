//! Canonical -> provider -> canonical translation through an echoing upstream
//!
//! The mock upstream answers with the concatenated text of every message it
//! received, in that provider's own response envelope. Whatever the canonical
//! request held must come back unchanged and in order.

use proptest::prelude::*;
use serde_json::{json, Value};
use switchyard_core::channel::{Channel, ChannelConfig};
use switchyard_core::protocol::{ChatRequest, Message};
use switchyard_core::providers::{ProtocolTransformer, ProviderType};

fn channel(provider: &str) -> Channel {
    ChannelConfig::new(format!("{}-echo", provider), provider)
        .with_key("sk-echo-0123456789")
        .with_models(["*"])
        .resolve()
        .unwrap()
}

fn texts(body: &Value, provider: ProviderType) -> String {
    match provider {
        ProviderType::Google => body["contents"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|content| content["parts"].as_array().into_iter().flatten())
            .filter_map(|part| part["text"].as_str())
            .collect(),
        _ => body["messages"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|message| message["content"].as_str())
            .collect(),
    }
}

/// The echo reply in each provider's response envelope
fn echo(provider: ProviderType, model: &str, text: &str) -> String {
    let body = match provider {
        ProviderType::OpenAI => json!({
            "id": "echo-1",
            "object": "chat.completion",
            "created": 1,
            "model": model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}, "finish_reason": "stop"}]
        }),
        ProviderType::Anthropic => json!({
            "id": "msg_echo",
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn"
        }),
        ProviderType::Google => json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}, "finishReason": "STOP"}],
            "modelVersion": model
        }),
        ProviderType::Ollama => json!({
            "model": model,
            "message": {"role": "assistant", "content": text},
            "done": true,
            "done_reason": "stop"
        }),
    };
    body.to_string()
}

fn round_trip(provider: &str, contents: &[String]) -> (String, String) {
    let channel = channel(provider);
    let messages = contents
        .iter()
        .enumerate()
        .map(|(i, content)| {
            if i % 2 == 0 {
                Message::user(content.clone())
            } else {
                Message::assistant(content.clone())
            }
        })
        .collect();
    let request = ChatRequest::new("echo-model", messages);

    let transformer = ProtocolTransformer::default();
    let built = transformer.to_provider_request(&channel, &request).unwrap();
    let sent = texts(built.body.as_ref().unwrap(), channel.provider);
    let raw = echo(channel.provider, "echo-model", &sent);
    let response = transformer
        .from_provider_response(channel.provider, &raw)
        .unwrap();

    (contents.concat(), response.content().to_string())
}

proptest! {
    #[test]
    fn prop_content_survives_every_provider(
        contents in prop::collection::vec("[a-zA-Z0-9][a-zA-Z0-9 ,.!?éü中文]{0,40}", 1..6),
    ) {
        for provider in ["openai", "anthropic", "google", "ollama"] {
            let (expected, echoed) = round_trip(provider, &contents);
            prop_assert_eq!(expected, echoed, "provider {}", provider);
        }
    }
}

#[test]
fn test_round_trip_keeps_message_order() {
    let contents = vec![
        "first".to_string(),
        "second".to_string(),
        "third".to_string(),
    ];
    for provider in ["openai", "anthropic", "google", "ollama"] {
        let (expected, echoed) = round_trip(provider, &contents);
        assert_eq!(echoed, "firstsecondthird", "provider {}", provider);
        assert_eq!(expected, echoed);
    }
}
