//! Upstream event-stream relay.
//!
//! Splits the upstream body into lines, picks out `data:` frames, and
//! re-emits every non-empty content delta as its own [`StreamEvent`] in
//! arrival order. `data: [DONE]` ends the relay.

use std::fmt::Display;

use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use super::StreamEvent;

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Content(String),
    Done,
    Skip,
}

/// Accumulates raw bytes and hands back complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c| c == '\n' || c == '\r')
        .to_string()
}

fn parse_frame(line: &str) -> Frame {
    let Some(data) = line.strip_prefix("data:") else {
        return Frame::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Frame::Done;
    }
    match serde_json::from_str::<ChunkPayload>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())
            .map(Frame::Content)
            .unwrap_or(Frame::Skip),
        Err(err) => {
            debug!(%err, frame = data, "skipping malformed upstream frame");
            Frame::Skip
        }
    }
}

/// Relays an upstream byte stream as downstream events.
///
/// A transport error ends the relay with a single [`StreamEvent::Error`].
pub fn relay<S, B, E>(upstream: S) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut lines = LineBuffer::default();
        let mut upstream = Box::pin(upstream);

        while let Some(chunk) = upstream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    yield StreamEvent::Error(format!("Streaming error: {err}"));
                    return;
                }
            };
            for line in lines.push(bytes.as_ref()) {
                match parse_frame(&line) {
                    Frame::Content(content) => yield StreamEvent::Content(content),
                    Frame::Done => return,
                    Frame::Skip => {}
                }
            }
        }

        if let Some(line) = lines.finish() {
            if let Frame::Content(content) = parse_frame(&line) {
                yield StreamEvent::Content(content);
            }
        }
    }
}
