//! Messages-dialect adapter (`/v1/messages`).
//!
//! Inbound: messages with string-or-block content, a top-level system
//! prompt, tool schemas, and tool_use/tool_result blocks. Outbound: the
//! dialect's message object, or its fixed streaming event sequence.

use serde::Deserialize;
use serde_json::{json, Value};

use krelay_wire::decode::{DecodedReply, StopReason, ToolUse};
use krelay_wire::request::{
    AssistantToolUse, AssistantTurn, HistoryTurn, ToolResult, ToolSpec, UserTurn,
};

use crate::content::{tool_result_text, Block, Content};
use crate::error::{Result, TranslateError};
use crate::TranslatedRequest;

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub system: Option<Content>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: Content,
}

#[derive(Debug, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Collect tool_result blocks from one inbound message.
fn collect_tool_results(content: &Content) -> Vec<ToolResult> {
    let Content::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|b| match b {
            Block::ToolResult {
                tool_use_id,
                content,
            } => Some(ToolResult::success(tool_use_id, tool_result_text(content))),
            _ => None,
        })
        .collect()
}

/// Collect tool_use blocks from one inbound assistant message.
fn collect_tool_uses(content: &Content) -> Vec<AssistantToolUse> {
    let Content::Blocks(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|b| match b {
            Block::ToolUse { id, name, input } => Some(AssistantToolUse {
                tool_use_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Normalize an inbound messages request into upstream form.
pub fn to_upstream(req: &MessagesRequest, model: &str) -> Result<TranslatedRequest> {
    if req.messages.is_empty() {
        return Err(TranslateError::MessagesRequired);
    }

    let mut turns: Vec<HistoryTurn> = Vec::with_capacity(req.messages.len());
    for message in &req.messages {
        match message.role.as_str() {
            "user" => {
                let (text, images) = message.content.flatten();
                let mut turn = UserTurn::text(text)
                    .with_tool_results(collect_tool_results(&message.content));
                turn.model_id = Some(model.to_string());
                if !images.is_empty() {
                    turn.images = Some(images);
                }
                turns.push(HistoryTurn::User(turn));
            }
            "assistant" => {
                let uses = collect_tool_uses(&message.content);
                let mut turn = AssistantTurn::text(message.content.text());
                if !uses.is_empty() {
                    turn.tool_uses = Some(uses);
                }
                turns.push(HistoryTurn::Assistant(turn));
            }
            other => {
                return Err(TranslateError::Invalid(format!("unknown role: {other}")));
            }
        }
    }

    // The final user turn becomes the current message.
    let (mut user_content, images, tool_results) = match turns.pop() {
        Some(HistoryTurn::User(turn)) => {
            let results = turn.tool_results().to_vec();
            (turn.content, turn.images, results)
        }
        Some(last) => {
            // A trailing assistant turn has nothing to answer; ask the
            // model to continue from it.
            turns.push(last);
            ("Continue.".to_string(), None, Vec::new())
        }
        None => unreachable!("messages checked non-empty"),
    };

    // Fold the system prompt into the first user text.
    if let Some(system) = &req.system {
        let system_text = system.text();
        if !system_text.is_empty() {
            match turns.iter_mut().find(|t| t.is_user()) {
                Some(HistoryTurn::User(first)) => {
                    first.content = format!("{system_text}\n\n{}", first.content);
                }
                _ => {
                    user_content = format!("{system_text}\n\n{user_content}");
                }
            }
        }
    }

    let tools: Vec<ToolSpec> = req
        .tools
        .iter()
        .map(|t| ToolSpec::new(&t.name, &t.description, t.input_schema.clone()))
        .collect();

    Ok(TranslatedRequest {
        user_content,
        history: turns,
        tools: (!tools.is_empty()).then_some(tools),
        tool_results: (!tool_results.is_empty()).then_some(tool_results),
        images,
    })
}

// ── outbound ─────────────────────────────────────────────────────────────

/// Non-streaming response object.
pub fn messages_response(
    reply: &DecodedReply,
    model: &str,
    message_id: &str,
    input_chars: usize,
) -> Value {
    let text = reply.text();
    let mut content = Vec::new();
    if !text.is_empty() || reply.tool_uses.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    for tool in &reply.tool_uses {
        content.push(json!({
            "type": "tool_use",
            "id": tool.id,
            "name": tool.name,
            "input": tool.input,
        }));
    }

    json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": model,
        "stop_reason": reply.stop_reason.as_str(),
        "stop_sequence": null,
        "usage": {
            "input_tokens": estimate_tokens_from_chars(input_chars),
            "output_tokens": estimate_tokens_from_chars(text.len()),
        },
    })
}

/// Best-effort token estimate: one token per four characters.
pub fn estimate_tokens_from_chars(chars: usize) -> u64 {
    (chars as u64) / 4
}

/// `message_start` — opens the streaming sequence.
pub fn event_message_start(message_id: &str, model: &str) -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": message_id,
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": model,
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": 0, "output_tokens": 0},
        },
    })
}

pub fn event_content_block_start_text() -> Value {
    json!({
        "type": "content_block_start",
        "index": 0,
        "content_block": {"type": "text", "text": ""},
    })
}

pub fn event_text_delta(text: &str) -> Value {
    json!({
        "type": "content_block_delta",
        "index": 0,
        "delta": {"type": "text_delta", "text": text},
    })
}

pub fn event_content_block_stop(index: usize) -> Value {
    json!({"type": "content_block_stop", "index": index})
}

/// The three events carrying one complete tool use: block start, one
/// `input_json_delta` with the full JSON-encoded input, block stop.
pub fn events_tool_use(index: usize, tool: &ToolUse) -> Vec<Value> {
    vec![
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {"type": "tool_use", "id": tool.id, "name": tool.name, "input": {}},
        }),
        json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "input_json_delta", "partial_json": tool.input.to_string()},
        }),
        json!({"type": "content_block_stop", "index": index}),
    ]
}

pub fn event_message_delta(stop_reason: StopReason, output_chars: usize) -> Value {
    json!({
        "type": "message_delta",
        "delta": {"stop_reason": stop_reason.as_str(), "stop_sequence": null},
        "usage": {"output_tokens": estimate_tokens_from_chars(output_chars)},
    })
}

pub fn event_message_stop() -> Value {
    json!({"type": "message_stop"})
}

/// Terminal error event for streams whose headers are already sent.
pub fn event_error(error_type: &str, message: &str) -> Value {
    json!({"type": "error", "error": {"type": error_type, "message": message}})
}

/// Non-streaming error body.
pub fn error_body(error_type: &str, message: &str) -> Value {
    json!({"type": "error", "error": {"type": error_type, "message": message}})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: Value) -> MessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn simple_request_translates() {
        let req = parse(json!({
            "model": "claude-3-5-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let out = to_upstream(&req, "claude-sonnet-4").unwrap();
        assert_eq!(out.user_content, "hi");
        assert!(out.history.is_empty());
        assert!(out.tools.is_none());
    }

    #[test]
    fn system_prepends_to_first_user_turn() {
        let req = parse(json!({
            "model": "m",
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"},
            ],
        }));
        let out = to_upstream(&req, "claude-sonnet-4").unwrap();
        match &out.history[0] {
            HistoryTurn::User(u) => assert_eq!(u.content, "be terse\n\none"),
            _ => panic!(),
        }
        assert_eq!(out.user_content, "three");
    }

    #[test]
    fn system_lands_on_current_when_no_history() {
        let req = parse(json!({
            "model": "m",
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let out = to_upstream(&req, "claude-sonnet-4").unwrap();
        assert_eq!(out.user_content, "be terse\n\nhi");
    }

    #[test]
    fn tool_blocks_split_into_frames() {
        let req = parse(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "call f"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "calling"},
                    {"type": "tool_use", "id": "t1", "name": "f", "input": {"x": 1}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "42"},
                ]},
            ],
        }));
        let out = to_upstream(&req, "claude-sonnet-4").unwrap();
        assert_eq!(out.history.len(), 2);
        match &out.history[1] {
            HistoryTurn::Assistant(a) => {
                assert_eq!(a.tool_uses().len(), 1);
                assert_eq!(a.tool_uses()[0].tool_use_id, "t1");
            }
            _ => panic!(),
        }
        let results = out.tool_results.unwrap();
        assert_eq!(results[0].tool_use_id, "t1");
        assert_eq!(results[0].content[0].text, "42");
    }

    #[test]
    fn tool_schemas_wrap_for_upstream() {
        let req = parse(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "f", "description": "d", "input_schema": {"type": "object"}}],
        }));
        let out = to_upstream(&req, "claude-sonnet-4").unwrap();
        let tools = out.tools.unwrap();
        assert_eq!(tools[0].tool_specification.name, "f");
        assert_eq!(
            tools[0].tool_specification.input_schema.json,
            json!({"type": "object"})
        );
    }

    #[test]
    fn empty_messages_is_an_error() {
        let req = parse(json!({"model": "m", "messages": []}));
        assert!(matches!(
            to_upstream(&req, "m"),
            Err(TranslateError::MessagesRequired)
        ));
    }

    #[test]
    fn round_trip_text_concatenation() {
        // Translating in and out preserves the text concatenation.
        let req = parse(json!({
            "model": "claude-3-5-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let translated = to_upstream(&req, "claude-sonnet-4").unwrap();
        assert_eq!(translated.user_content, "hi");

        let reply = DecodedReply {
            texts: vec!["hel".into(), "lo".into()],
            tool_uses: Vec::new(),
            stop_reason: StopReason::EndTurn,
        };
        let resp = messages_response(&reply, "claude-sonnet-4", "msg_1", 2);
        assert_eq!(resp["content"][0]["text"], "hello");
        assert_eq!(resp["stop_reason"], "end_turn");
        assert_eq!(resp["model"], "claude-sonnet-4");
    }

    #[test]
    fn tool_reply_produces_tool_use_blocks() {
        let reply = DecodedReply {
            texts: Vec::new(),
            tool_uses: vec![ToolUse {
                id: "t1".into(),
                name: "f".into(),
                input: json!({"x": 1}),
            }],
            stop_reason: StopReason::ToolUse,
        };
        let resp = messages_response(&reply, "m", "msg_1", 0);
        assert_eq!(resp["content"][0]["type"], "tool_use");
        assert_eq!(resp["stop_reason"], "tool_use");
    }

    #[test]
    fn stream_event_sequence_shapes() {
        let start = event_message_start("msg_1", "m");
        assert_eq!(start["type"], "message_start");
        assert_eq!(start["message"]["id"], "msg_1");

        let delta = event_text_delta("chunk");
        assert_eq!(delta["delta"]["type"], "text_delta");
        assert_eq!(delta["delta"]["text"], "chunk");

        let tool = ToolUse {
            id: "t1".into(),
            name: "f".into(),
            input: json!({"x": 1}),
        };
        let events = events_tool_use(1, &tool);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["content_block"]["type"], "tool_use");
        assert_eq!(events[1]["delta"]["type"], "input_json_delta");
        assert_eq!(
            events[1]["delta"]["partial_json"],
            serde_json::json!({"x":1}).to_string()
        );
        assert_eq!(events[2]["type"], "content_block_stop");

        let end = event_message_delta(StopReason::ToolUse, 40);
        assert_eq!(end["delta"]["stop_reason"], "tool_use");
        assert_eq!(end["usage"]["output_tokens"], 10);
    }
}
