//! Streaming meter
//!
//! Tees an upstream SSE stream to the client while reconstructing the final
//! token accounting from in-band events. Forwarding is byte-identical at
//! event granularity: bytes accumulate only until the current event frame is
//! complete, then the frame is flushed unchanged. A separate state machine
//! consumes the `data:` payloads for accounting and never touches the
//! forwarded bytes.
//!
//! Terminal disposition (normal end, upstream error, client disconnect) is
//! signalled to the billing ledger exactly once, from whichever of the
//! stream-end path or the drop guard fires first.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::billing;
use crate::forward::client::{is_sse_done, parse_sse_data};
use crate::forward::context::{BillingContext, EndpointFamily, Usage};
use crate::server::AppState;

/// Multiplier applied to the whitespace word count when a stream ends
/// without an upstream usage block.
const ESTIMATE_TOKENS_PER_WORD: f64 = 1.3;

/// Assembles complete SSE event frames out of arbitrary byte chunks.
/// A frame ends at a blank line; `\r\n` line endings are tolerated and the
/// original bytes are preserved exactly.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = frame_end(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..end).collect();
            frames.push(Bytes::from(frame));
        }
        frames
    }

    /// Trailing bytes with no terminator at end of stream
    pub fn take_remainder(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut self.buf)))
        }
    }
}

/// Index one past the blank-line terminator of the first complete frame
fn frame_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some(i + 2),
                (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterState {
    AwaitingStart,
    InMessage,
    Complete,
    Failed,
}

/// Reconstructs usage accounting from SSE event payloads.
///
/// Anthropic streams report cumulative usage in `message_start` /
/// `message_delta`; OpenAI streams report usage only in a terminal block the
/// client may not have requested. When no authoritative block arrives the
/// word-count estimator kicks in at finalization and the result is flagged.
pub struct StreamMeter {
    family: EndpointFamily,
    state: MeterState,
    usage: Usage,
    authoritative: bool,
    delta_words: u64,
    events: u64,
    error_message: Option<String>,
}

impl StreamMeter {
    pub fn new(family: EndpointFamily) -> Self {
        StreamMeter {
            family,
            state: MeterState::AwaitingStart,
            usage: Usage::default(),
            authoritative: false,
            delta_words: 0,
            events: 0,
            error_message: None,
        }
    }

    pub fn state(&self) -> MeterState {
        self.state
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Observe one complete SSE frame. Malformed payloads are logged and
    /// skipped; the frame itself is always forwarded by the caller.
    pub fn observe(&mut self, frame: &[u8]) {
        self.events += 1;
        let text = String::from_utf8_lossy(frame);
        for line in text.lines() {
            let Some(data) = parse_sse_data(line) else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if is_sse_done(data) {
                self.state = MeterState::Complete;
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(json) => self.apply(&json),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed SSE data payload, forwarding anyway");
                }
            }
        }
    }

    fn apply(&mut self, event: &Value) {
        match self.family {
            EndpointFamily::AnthropicMessages => self.apply_anthropic(event),
            EndpointFamily::OpenAiChat => self.apply_openai_chat(event),
            EndpointFamily::OpenAiResponses => self.apply_openai_responses(event),
        }
    }

    fn apply_anthropic(&mut self, event: &Value) {
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                self.state = MeterState::InMessage;
                if let Some(usage) = event.get("message").and_then(|m| m.get("usage")) {
                    self.merge_anthropic_usage(usage);
                }
            }
            Some("message_delta") => {
                self.state = MeterState::InMessage;
                if let Some(usage) = event.get("usage") {
                    // Cumulative: later values replace earlier ones
                    self.merge_anthropic_usage(usage);
                }
            }
            Some("content_block_delta") => {
                if let Some(delta) = event.get("delta") {
                    for field in ["text", "thinking", "partial_json"] {
                        if let Some(text) = delta.get(field).and_then(|t| t.as_str()) {
                            self.delta_words += text.split_whitespace().count() as u64;
                        }
                    }
                }
            }
            Some("message_stop") => {
                self.state = MeterState::Complete;
            }
            Some("error") => {
                self.state = MeterState::Failed;
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream error event");
                self.error_message = Some(message.to_string());
            }
            _ => {}
        }
    }

    fn merge_anthropic_usage(&mut self, usage: &Value) {
        if let Some(v) = usage.get("input_tokens").and_then(|v| v.as_i64()) {
            self.usage.input_tokens = v;
            self.authoritative = true;
        }
        if let Some(v) = usage.get("output_tokens").and_then(|v| v.as_i64()) {
            self.usage.output_tokens = v;
            self.authoritative = true;
        }
        if let Some(v) = usage.get("cache_read_input_tokens").and_then(|v| v.as_i64()) {
            self.usage.cache_read_tokens = v;
        }
        if let Some(v) = usage.get("cache_creation_input_tokens").and_then(|v| v.as_i64()) {
            self.usage.cache_write_tokens = v;
        }
    }

    fn apply_openai_chat(&mut self, event: &Value) {
        if self.state == MeterState::AwaitingStart {
            self.state = MeterState::InMessage;
        }
        if let Some(error) = event.get("error") {
            self.state = MeterState::Failed;
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error event");
            self.error_message = Some(message.to_string());
            return;
        }
        if let Some(usage) = event.get("usage").filter(|u| u.is_object()) {
            if let Some(v) = usage.get("prompt_tokens").and_then(|v| v.as_i64()) {
                self.usage.input_tokens = v;
                self.authoritative = true;
            }
            if let Some(v) = usage.get("completion_tokens").and_then(|v| v.as_i64()) {
                self.usage.output_tokens = v;
                self.authoritative = true;
            }
            if let Some(v) = usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(|v| v.as_i64())
            {
                self.usage.cache_read_tokens = v;
            }
        }
        if let Some(text) = event
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(|content| content.as_str())
        {
            self.delta_words += text.split_whitespace().count() as u64;
        }
    }

    fn apply_openai_responses(&mut self, event: &Value) {
        if self.state == MeterState::AwaitingStart {
            self.state = MeterState::InMessage;
        }
        match event.get("type").and_then(|t| t.as_str()) {
            Some("response.output_text.delta") => {
                if let Some(text) = event.get("delta").and_then(|d| d.as_str()) {
                    self.delta_words += text.split_whitespace().count() as u64;
                }
            }
            Some("response.completed") => {
                self.state = MeterState::Complete;
                if let Some(usage) = event.get("response").and_then(|r| r.get("usage")) {
                    if let Some(v) = usage.get("input_tokens").and_then(|v| v.as_i64()) {
                        self.usage.input_tokens = v;
                        self.authoritative = true;
                    }
                    if let Some(v) = usage.get("output_tokens").and_then(|v| v.as_i64()) {
                        self.usage.output_tokens = v;
                        self.authoritative = true;
                    }
                    if let Some(v) = usage
                        .get("input_tokens_details")
                        .and_then(|d| d.get("cached_tokens"))
                        .and_then(|v| v.as_i64())
                    {
                        self.usage.cache_read_tokens = v;
                    }
                }
            }
            Some("response.failed") | Some("error") => {
                self.state = MeterState::Failed;
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream error event");
                self.error_message = Some(message.to_string());
            }
            _ => {}
        }
    }

    /// Final accounting. Falls back to the word-count estimate when the
    /// upstream never reported usage; the result is flagged so analytics can
    /// tell authoritative charges from estimated ones.
    pub fn finalize(&self) -> Usage {
        if self.authoritative {
            return self.usage.clone();
        }
        Usage {
            input_tokens: 0,
            output_tokens: (self.delta_words as f64 * ESTIMATE_TOKENS_PER_WORD).round() as i64,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            estimated: true,
        }
    }
}

struct SettleCtx {
    state: Arc<AppState>,
    ctx: BillingContext,
}

/// Forwarding body stream handed to the client. Owns the frame assembler,
/// the meter, and the settle-once obligation.
pub struct MeteredBody {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    frames: FrameBuffer,
    meter: StreamMeter,
    ready: VecDeque<Bytes>,
    settle: Option<SettleCtx>,
    finished: bool,
}

impl MeteredBody {
    pub fn new(
        upstream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        family: EndpointFamily,
        state: Arc<AppState>,
        ctx: BillingContext,
    ) -> Self {
        MeteredBody {
            inner: Box::pin(upstream),
            frames: FrameBuffer::default(),
            meter: StreamMeter::new(family),
            ready: VecDeque::new(),
            settle: Some(SettleCtx { state, ctx }),
            finished: false,
        }
    }

    fn settle(&mut self, transport_error: Option<String>) {
        let Some(SettleCtx { state, ctx }) = self.settle.take() else {
            return;
        };
        let usage = self.meter.finalize();
        let error_message =
            transport_error.or_else(|| self.meter.error_message().map(str::to_string));
        let snapshot = serde_json::json!({
            "streaming": true,
            "events": self.meter.events(),
            "estimated_usage": usage.estimated,
        });

        let task = billing::settle(state, ctx, usage, snapshot, error_message);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => {
                tracing::error!("no runtime available to settle streaming request");
            }
        }
    }
}

impl Stream for MeteredBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    let frames = self.frames.push(&chunk);
                    for frame in frames {
                        self.meter.observe(&frame);
                        self.ready.push_back(frame);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    self.settle(Some(format!("upstream stream error: {}", e)));
                    return Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if let Some(rest) = self.frames.take_remainder() {
                        self.meter.observe(&rest);
                        self.ready.push_back(rest);
                    }
                    self.settle(None);
                }
            }
        }
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        // Reached only when the client went away before the stream ended;
        // bill whatever usage was reconstructed up to this point.
        if self.settle.is_some() {
            self.settle(Some("client_disconnect".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter_feed(family: EndpointFamily, raw: &[u8]) -> StreamMeter {
        let mut frames = FrameBuffer::default();
        let mut meter = StreamMeter::new(family);
        for frame in frames.push(raw) {
            meter.observe(&frame);
        }
        if let Some(rest) = frames.take_remainder() {
            meter.observe(&rest);
        }
        meter
    }

    #[test]
    fn frame_assembly_preserves_bytes() {
        let mut frames = FrameBuffer::default();
        let mut out = Vec::new();
        // Split mid-line and mid-terminator to exercise buffering
        for chunk in [
            &b"event: message_start\ndata: {\"a\""[..],
            &b":1}\n\nda"[..],
            &b"ta: {\"b\":2}\r\n\r\ndata: tail"[..],
        ] {
            out.extend(frames.push(chunk));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], b"event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(&out[1][..], b"data: {\"b\":2}\r\n\r\n");
        assert_eq!(&frames.take_remainder().unwrap()[..], b"data: tail");

        let rejoined: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        assert!(rejoined.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn anthropic_usage_reconstruction() {
        let raw = b"event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"cache_read_input_tokens\":2,\"cache_creation_input_tokens\":1}}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hello world\"}}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":7}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

        let meter = meter_feed(EndpointFamily::AnthropicMessages, raw);
        assert_eq!(meter.state(), MeterState::Complete);
        let usage = meter.finalize();
        assert!(!usage.estimated);
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cache_read_tokens, 2);
        assert_eq!(usage.cache_write_tokens, 1);
    }

    #[test]
    fn anthropic_delta_replaces_prior_values() {
        let raw = b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}}\n\n\
data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}\n\n\
data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":9}}\n\n\
data: {\"type\":\"message_stop\"}\n\n";
        let meter = meter_feed(EndpointFamily::AnthropicMessages, raw);
        assert_eq!(meter.finalize().output_tokens, 9);
    }

    #[test]
    fn openai_terminal_usage_block() {
        let raw = b"data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"delta\":{\"content\":\"hi there\"}}]}\n\n\
data: {\"object\":\"chat.completion.chunk\",\"choices\":[],\"usage\":{\"prompt_tokens\":11,\"completion_tokens\":4,\"prompt_tokens_details\":{\"cached_tokens\":3}}}\n\n\
data: [DONE]\n\n";
        let meter = meter_feed(EndpointFamily::OpenAiChat, raw);
        assert_eq!(meter.state(), MeterState::Complete);
        let usage = meter.finalize();
        assert!(!usage.estimated);
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 4);
        assert_eq!(usage.cache_read_tokens, 3);
    }

    #[test]
    fn openai_missing_usage_falls_back_to_estimate() {
        let raw = b"data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"delta\":{\"content\":\"one two three four\"}}]}\n\n\
data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"delta\":{\"content\":\" five six\"}}]}\n\n\
data: [DONE]\n\n";
        let meter = meter_feed(EndpointFamily::OpenAiChat, raw);
        let usage = meter.finalize();
        assert!(usage.estimated);
        assert_eq!(usage.input_tokens, 0);
        // 6 words * 1.3 = 7.8 -> 8
        assert_eq!(usage.output_tokens, 8);
        assert!(!usage.is_cache_hit());
    }

    #[test]
    fn responses_completed_event_carries_usage() {
        let raw = b"data: {\"type\":\"response.output_text.delta\",\"delta\":\"partial text\"}\n\n\
data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":21,\"output_tokens\":13}}}\n\n";
        let meter = meter_feed(EndpointFamily::OpenAiResponses, raw);
        assert_eq!(meter.state(), MeterState::Complete);
        let usage = meter.finalize();
        assert_eq!(usage.input_tokens, 21);
        assert_eq!(usage.output_tokens, 13);
    }

    #[test]
    fn anthropic_error_event_marks_failed() {
        let raw = b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n\
data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let meter = meter_feed(EndpointFamily::AnthropicMessages, raw);
        assert_eq!(meter.state(), MeterState::Failed);
        assert_eq!(meter.error_message(), Some("Overloaded"));
        // Partial usage survives for partial billing
        assert_eq!(meter.finalize().input_tokens, 5);
    }

    #[test]
    fn replay_is_deterministic() {
        let raw = b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n\
data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n\n\
data: {\"type\":\"message_stop\"}\n\n";

        let forward_once = |raw: &[u8]| -> (Vec<u8>, Usage) {
            let mut frames = FrameBuffer::default();
            let mut meter = StreamMeter::new(EndpointFamily::AnthropicMessages);
            let mut bytes = Vec::new();
            for frame in frames.push(raw) {
                meter.observe(&frame);
                bytes.extend_from_slice(&frame);
            }
            (bytes, meter.finalize())
        };

        let (bytes_a, usage_a) = forward_once(raw);
        let (bytes_b, usage_b) = forward_once(raw);
        assert_eq!(bytes_a, raw.to_vec());
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(usage_a, usage_b);
    }

    #[test]
    fn malformed_payload_is_tolerated() {
        let raw = b"data: this is not json\n\ndata: {\"type\":\"message_stop\"}\n\n";
        let meter = meter_feed(EndpointFamily::AnthropicMessages, raw);
        assert_eq!(meter.state(), MeterState::Complete);
        assert_eq!(meter.events(), 2);
    }
}
