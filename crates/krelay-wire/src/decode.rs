//! Upstream event-stream decoding.
//!
//! The upstream replies with AWS event-stream framing: per message a 4-byte
//! big-endian total length, a 4-byte big-endian headers length, a 4-byte
//! prelude CRC, `headers_len` bytes of headers, a UTF-8 JSON payload, and a
//! 4-byte trailing CRC. Both CRCs are ignored; the headers are only scanned
//! for the event-type marker strings.
//!
//! Two entry points: `decode_all` for a complete buffer, `EventStreamParser`
//! for incremental feeding while relaying a live stream.

use serde_json::Value;

/// Prelude size: total length + headers length + prelude CRC.
const PRELUDE_LEN: usize = 12;
/// Trailing CRC size.
const TRAILER_LEN: usize = 4;

/// One reassembled tool invocation from the reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
        }
    }
}

/// Fully decoded upstream reply.
#[derive(Debug, Clone)]
pub struct DecodedReply {
    pub texts: Vec<String>,
    pub tool_uses: Vec<ToolUse>,
    pub stop_reason: StopReason,
}

impl DecodedReply {
    /// The assistant text as one string.
    pub fn text(&self) -> String {
        self.texts.concat()
    }
}

/// Accumulates tool-input fragments for one tool-use id.
#[derive(Debug, Default)]
struct ToolBuffer {
    name: String,
    input_parts: String,
}

/// Per-frame event classification, derived from the frame headers with a
/// payload-key fallback for frames whose headers carry no known marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    AssistantText,
    ToolUse,
    Unknown,
}

fn classify_headers(headers: &[u8]) -> FrameKind {
    let text = String::from_utf8_lossy(headers);
    if text.contains("toolUseEvent") {
        FrameKind::ToolUse
    } else if text.contains("assistantResponseEvent") {
        FrameKind::AssistantText
    } else {
        FrameKind::Unknown
    }
}

/// Pull the text content out of a payload, honoring both the nested
/// `assistantResponseEvent` wrapper and a bare top-level `content`.
fn payload_text(payload: &Value, kind: FrameKind) -> Option<String> {
    if let Some(event) = payload.get("assistantResponseEvent") {
        return event
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    if kind != FrameKind::ToolUse {
        return payload
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    None
}

/// Feed a payload's tool-use fields (if any) into the per-id buffers.
/// `buffers` keeps insertion order so reassembled tool uses come out in
/// the order the upstream introduced them.
fn accumulate_tool_use(payload: &Value, kind: FrameKind, buffers: &mut Vec<(String, ToolBuffer)>) {
    let has_id = payload.get("toolUseId").is_some();
    if kind != FrameKind::ToolUse && !has_id {
        return;
    }
    let id = payload
        .get("toolUseId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if id.is_empty() {
        return;
    }
    let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
    let input = payload.get("input").and_then(Value::as_str).unwrap_or_default();

    let buffer = match buffers.iter_mut().find(|(bid, _)| bid == id) {
        Some((_, b)) => b,
        None => {
            buffers.push((id.to_string(), ToolBuffer::default()));
            &mut buffers.last_mut().unwrap().1
        }
    };
    if buffer.name.is_empty() && !name.is_empty() {
        buffer.name = name.to_string();
    }
    buffer.input_parts.push_str(input);
}

/// Reassemble buffered fragments into tool uses. Unparseable input JSON
/// degrades to `{"raw": <string>}` rather than being dropped.
fn drain_tool_buffers(buffers: Vec<(String, ToolBuffer)>) -> Vec<ToolUse> {
    buffers
        .into_iter()
        .map(|(id, buf)| {
            let input = serde_json::from_str::<Value>(&buf.input_parts)
                .unwrap_or_else(|_| serde_json::json!({ "raw": buf.input_parts }));
            ToolUse {
                id,
                name: buf.name,
                input,
            }
        })
        .collect()
}

/// Parse the frame at `buf[pos..]`. Returns the consumed length and the
/// classified payload, or `None` when the frame is incomplete or malformed
/// (the caller stops or waits for more bytes).
fn parse_frame_at(buf: &[u8], pos: usize) -> Option<(usize, FrameKind, Option<Value>)> {
    if pos + PRELUDE_LEN > buf.len() {
        return None;
    }
    let total_len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
    let headers_len = u32::from_be_bytes(buf[pos + 4..pos + 8].try_into().unwrap()) as usize;
    if total_len == 0 || pos + total_len > buf.len() {
        return None;
    }

    let header_start = (pos + PRELUDE_LEN).min(pos + total_len);
    let header_end = (header_start + headers_len).min(pos + total_len);
    let kind = if header_start < header_end {
        classify_headers(&buf[header_start..header_end])
    } else {
        FrameKind::Unknown
    };

    let payload_start = pos + PRELUDE_LEN + headers_len;
    let payload_end = (pos + total_len).saturating_sub(TRAILER_LEN);
    let payload = if payload_start < payload_end && payload_end <= buf.len() {
        serde_json::from_slice::<Value>(&buf[payload_start..payload_end]).ok()
    } else {
        None
    };

    Some((total_len, kind, payload))
}

/// Decode a complete reply buffer.
///
/// Text fragments are collected in order; tool-use fragments sharing an id
/// concatenate their `input` slices, parsed once at the end. A zero-length
/// or truncated frame stops decoding at the current position.
pub fn decode_all(raw: &[u8]) -> DecodedReply {
    let mut texts = Vec::new();
    let mut buffers: Vec<(String, ToolBuffer)> = Vec::new();

    let mut pos = 0;
    while pos < raw.len() {
        let Some((consumed, kind, payload)) = parse_frame_at(raw, pos) else {
            break;
        };
        if let Some(payload) = payload {
            if let Some(text) = payload_text(&payload, kind) {
                texts.push(text);
            }
            accumulate_tool_use(&payload, kind, &mut buffers);
        }
        pos += consumed;
    }

    let tool_uses = drain_tool_buffers(buffers);
    let stop_reason = if tool_uses.is_empty() {
        StopReason::EndTurn
    } else {
        StopReason::ToolUse
    };
    DecodedReply {
        texts,
        tool_uses,
        stop_reason,
    }
}

/// Incremental decoder for live relaying.
///
/// Feed network chunks as they arrive; each call yields the text fragments
/// completed by that chunk. Partial trailing bytes stay buffered. Tool uses
/// are only reliable once the stream ends — call `finish` then.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
    processed: usize,
    tool_buffers: Vec<(String, ToolBuffer)>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns text fragments from frames completed by it.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        let mut texts = Vec::new();

        let mut pos = self.processed;
        while pos < self.buffer.len() {
            if pos + PRELUDE_LEN > self.buffer.len() {
                break;
            }
            let total_len =
                u32::from_be_bytes(self.buffer[pos..pos + 4].try_into().unwrap()) as usize;
            if total_len == 0 {
                // Zero-length frame: resync on the next word.
                pos += 4;
                continue;
            }
            let Some((consumed, kind, payload)) = parse_frame_at(&self.buffer, pos) else {
                break;
            };
            if let Some(payload) = payload {
                if let Some(text) = payload_text(&payload, kind) {
                    texts.push(text);
                }
                accumulate_tool_use(&payload, kind, &mut self.tool_buffers);
            }
            pos += consumed;
        }

        self.processed = pos;
        texts
    }

    /// How many fed bytes are still waiting for frame completion.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() - self.processed
    }

    /// Reassemble the accumulated tool uses. Call once at stream end.
    pub fn finish(self) -> Vec<ToolUse> {
        drain_tool_buffers(self.tool_buffers)
    }
}
