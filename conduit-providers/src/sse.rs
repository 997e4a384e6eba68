//! Wire framing decoders shared by the streaming clients: SSE `data:`
//! frames (OpenAI-style) and newline-delimited JSON (Ollama-style),
//! decoded incrementally from a reqwest byte stream.

use bytes::Bytes;
use conduit_core::{GatewayError, Result};
use futures::Stream;
use futures::stream::StreamExt;
use std::pin::Pin;

pub const SSE_DONE: &str = "[DONE]";

/// Incremental SSE decoder. Feed raw bytes, drain complete `data:`
/// payloads; a `data: [DONE]` sentinel is surfaced as-is.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        // Events are separated by a blank line.
        while let Some(boundary) = self.find_boundary() {
            let (frame, rest_start) = boundary;
            let raw: String = self.buffer[..frame].to_string();
            self.buffer.drain(..rest_start);

            let mut data_lines = Vec::new();
            for line in raw.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    data_lines.push(data.trim_start());
                }
            }
            if !data_lines.is_empty() {
                events.push(data_lines.join("\n"));
            }
        }
        events
    }

    fn find_boundary(&self) -> Option<(usize, usize)> {
        let lf = self.buffer.find("\n\n").map(|i| (i, i + 2));
        let crlf = self.buffer.find("\r\n\r\n").map(|i| (i, i + 4));
        match (lf, crlf) {
            (Some(a), Some(b)) if b.0 < a.0 => Some(b),
            (a, b) => a.or(b),
        }
    }
}

/// Incremental NDJSON decoder.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: String,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever remains when the stream closes without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        if rest.is_empty() { None } else { Some(rest) }
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Decode an HTTP byte stream into SSE data payloads, stopping at
/// `[DONE]`.
pub fn sse_data_stream(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> Pin<Box<dyn Stream<Item = Result<String>> + Send>> {
    Box::pin(async_stream::try_stream! {
        let mut decoder = SseDecoder::new();
        let mut bytes = std::pin::pin!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
            for event in decoder.feed(&chunk) {
                if event == SSE_DONE {
                    return;
                }
                yield event;
            }
        }
    })
}

/// Decode an HTTP byte stream into NDJSON lines.
pub fn ndjson_stream(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> Pin<Box<dyn Stream<Item = Result<String>> + Send>> {
    Box::pin(async_stream::try_stream! {
        let mut decoder = NdjsonDecoder::new();
        let mut bytes = std::pin::pin!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
            for line in decoder.feed(&chunk) {
                yield line;
            }
        }
        if let Some(rest) = decoder.finish() {
            yield rest;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":").is_empty());
        let events = decoder.feed(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(events, vec![r#"{"a":1}"#.to_string(), SSE_DONE.to_string()]);
    }

    #[test]
    fn sse_crlf_frames() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(events, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn sse_ignores_comments_and_event_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keepalive\nevent: message\ndata: payload\n\n");
        assert_eq!(events, vec!["payload".to_string()]);
    }

    #[test]
    fn ndjson_partial_lines() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.feed(b"{\"done\":fal").is_empty());
        assert_eq!(decoder.feed(b"se}\n"), vec![r#"{"done":false}"#.to_string()]);
        assert!(decoder.feed(b"{\"done\":true}").is_empty());
        assert_eq!(decoder.finish(), Some(r#"{"done":true}"#.to_string()));
    }
}
