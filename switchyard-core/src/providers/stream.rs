//! Stream framing: split a raw upstream body into provider payloads
//!
//! SSE bodies are parsed with `eventsource-stream`; NDJSON bodies are split
//! on newlines. Either way the output is one payload string per event,
//! ready for [`ProviderAdapter::parse_stream_event`](super::ProviderAdapter::parse_stream_event).

use super::adapter::StreamFraming;
use crate::http::{ByteStream, UpstreamError};
use async_stream::try_stream;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::StreamExt;

/// Stream of framed payloads
pub type PayloadStream = BoxStream<'static, Result<String, UpstreamError>>;

/// Frame a raw body according to `framing`
pub fn decode_payloads(framing: StreamFraming, body: ByteStream) -> PayloadStream {
    match framing {
        StreamFraming::Sse => sse_payloads(body),
        StreamFraming::Ndjson => ndjson_payloads(body),
    }
}

fn sse_payloads(body: ByteStream) -> PayloadStream {
    body.eventsource()
        .filter_map(|result| async move {
            match result {
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(EventStreamError::Transport(e)) => Some(Err(e)),
                Err(e) => Some(Err(UpstreamError::transport(format!(
                    "invalid event stream: {}",
                    e
                )))),
            }
        })
        .boxed()
}

fn ndjson_payloads(mut body: ByteStream) -> PayloadStream {
    let stream = try_stream! {
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(bytes) = body.next().await {
            buffer.extend_from_slice(&bytes?);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(payload) = decode_line(&line)? {
                    yield payload;
                }
            }
        }

        // A final line without a trailing newline still counts
        if let Some(payload) = decode_line(&buffer)? {
            yield payload;
        }
    };

    stream.boxed()
}

fn decode_line(line: &[u8]) -> Result<Option<String>, UpstreamError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| UpstreamError::transport(format!("invalid UTF-8 in stream: {}", e)))?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}
