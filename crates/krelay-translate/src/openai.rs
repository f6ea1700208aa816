//! Chat-completions-dialect adapter (`/v1/chat/completions`) and the
//! responses variant (`/v1/responses`).
//!
//! Inbound: OpenAI-style messages with function tools; system role folds
//! into the first user turn, assistant `tool_calls` become tool-use frames,
//! `tool` role messages become tool-result turns. Outbound: completion
//! objects or `chat.completion.chunk` events ending with `[DONE]`.

use serde::Deserialize;
use serde_json::{json, Value};

use krelay_wire::decode::{DecodedReply, StopReason, ToolUse};
use krelay_wire::request::{
    AssistantToolUse, AssistantTurn, HistoryTurn, ToolResult, ToolSpec, UserTurn,
};

use crate::anthropic::estimate_tokens_from_chars;
use crate::content::Content;
use crate::error::{Result, TranslateError};
use crate::TranslatedRequest;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<FunctionTool>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub tool_calls: Option<Vec<InboundToolCall>>,
    /// Present on `tool` role messages.
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InboundToolCall {
    pub id: String,
    pub function: InboundFunction,
}

#[derive(Debug, Deserialize)]
pub struct InboundFunction {
    pub name: String,
    /// JSON-encoded arguments string, per the dialect.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    #[serde(default)]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Debug, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Parse a tool-call arguments string; malformed JSON is carried raw.
fn parse_arguments(arguments: &str) -> Value {
    if arguments.is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| json!({ "raw": arguments }))
}

/// A `tool_choice` naming a specific function, if any.
fn forced_tool(tool_choice: &Option<Value>) -> Option<String> {
    tool_choice
        .as_ref()?
        .get("function")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

/// Normalize an inbound chat-completions request into upstream form.
pub fn to_upstream(req: &ChatCompletionsRequest, model: &str) -> Result<TranslatedRequest> {
    if req.messages.is_empty() {
        return Err(TranslateError::MessagesRequired);
    }

    let mut system_text = String::new();
    let mut turns: Vec<HistoryTurn> = Vec::new();

    for message in &req.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = message.content.as_ref().map(Content::text).unwrap_or_default();
                if !text.is_empty() {
                    if !system_text.is_empty() {
                        system_text.push('\n');
                    }
                    system_text.push_str(&text);
                }
            }
            "user" => {
                let (text, images) = message
                    .content
                    .as_ref()
                    .map(Content::flatten)
                    .unwrap_or_default();
                let mut turn = UserTurn::text(text);
                turn.model_id = Some(model.to_string());
                if !images.is_empty() {
                    turn.images = Some(images);
                }
                turns.push(HistoryTurn::User(turn));
            }
            "assistant" => {
                let text = message.content.as_ref().map(Content::text).unwrap_or_default();
                let mut turn = AssistantTurn::text(text);
                if let Some(calls) = &message.tool_calls {
                    let uses: Vec<AssistantToolUse> = calls
                        .iter()
                        .map(|c| AssistantToolUse {
                            tool_use_id: c.id.clone(),
                            name: c.function.name.clone(),
                            input: parse_arguments(&c.function.arguments),
                        })
                        .collect();
                    if !uses.is_empty() {
                        turn.tool_uses = Some(uses);
                    }
                }
                turns.push(HistoryTurn::Assistant(turn));
            }
            "tool" => {
                let id = message
                    .tool_call_id
                    .clone()
                    .ok_or_else(|| TranslateError::Invalid("tool message without tool_call_id".into()))?;
                let text = message.content.as_ref().map(Content::text).unwrap_or_default();
                let result = ToolResult::success(id, text);
                // Tool results ride on a user turn for the upstream.
                turns.push(HistoryTurn::User(
                    UserTurn::text(String::new()).with_tool_results(vec![result]),
                ));
            }
            other => {
                return Err(TranslateError::Invalid(format!("unknown role: {other}")));
            }
        }
    }

    let (mut user_content, images, tool_results) = match turns.pop() {
        Some(HistoryTurn::User(turn)) => {
            let results = turn.tool_results().to_vec();
            (turn.content, turn.images, results)
        }
        Some(last) => {
            turns.push(last);
            ("Continue.".to_string(), None, Vec::new())
        }
        None => ("Continue.".to_string(), None, Vec::new()),
    };

    if user_content.is_empty() && !tool_results.is_empty() {
        // A bare tool round-trip still needs user text for the upstream.
        user_content = "Tool results attached.".to_string();
    }

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

    // An explicit tool_choice is passed down as a plain instruction; the
    // upstream request has no dedicated field for it.
    if let Some(name) = forced_tool(&req.tool_choice) {
        user_content = format!("{user_content}\n\nUse the `{name}` tool.");
    }

    let tools: Vec<ToolSpec> = req
        .tools
        .iter()
        .flatten()
        .map(|t| ToolSpec::new(&t.function.name, &t.function.description, t.function.parameters.clone()))
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

fn tool_calls_json(tool_uses: &[ToolUse]) -> Value {
    Value::Array(
        tool_uses
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "type": "function",
                    "function": {"name": t.name, "arguments": t.input.to_string()},
                })
            })
            .collect(),
    )
}

/// Non-streaming completion object.
pub fn chat_response(
    reply: &DecodedReply,
    model: &str,
    completion_id: &str,
    created: i64,
    input_chars: usize,
) -> Value {
    let text = reply.text();
    let mut message = json!({"role": "assistant", "content": text});
    let finish_reason = if reply.stop_reason == StopReason::ToolUse {
        message["tool_calls"] = tool_calls_json(&reply.tool_uses);
        "tool_calls"
    } else {
        "stop"
    };

    json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": estimate_tokens_from_chars(input_chars),
            "completion_tokens": estimate_tokens_from_chars(text.len()),
            "total_tokens": estimate_tokens_from_chars(input_chars + text.len()),
        },
    })
}

fn chunk(completion_id: &str, created: i64, model: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": completion_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

/// One text fragment.
pub fn chunk_text(completion_id: &str, created: i64, model: &str, text: &str) -> Value {
    chunk(completion_id, created, model, json!({"content": text}), None)
}

/// Trailing tool-calls chunk, emitted once the stream has ended.
pub fn chunk_tool_calls(completion_id: &str, created: i64, model: &str, tool_uses: &[ToolUse]) -> Value {
    chunk(
        completion_id,
        created,
        model,
        json!({"tool_calls": tool_calls_json(tool_uses)}),
        None,
    )
}

/// Final empty-delta chunk with the finish reason.
pub fn chunk_finish(completion_id: &str, created: i64, model: &str, finish_reason: &str) -> Value {
    chunk(completion_id, created, model, json!({}), Some(finish_reason))
}

/// Inline error chunk for streams already under way.
pub fn chunk_error(completion_id: &str, created: i64, model: &str, message: &str) -> Value {
    chunk(
        completion_id,
        created,
        model,
        json!({"content": format!("[Error]: {message}")}),
        Some("stop"),
    )
}

/// Non-streaming error body.
pub fn error_body(message: &str, error_type: &str) -> Value {
    json!({"error": {"message": message, "type": error_type}})
}

// ── responses variant ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: String,
    /// Either a plain string or an array of input messages.
    pub input: Value,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

/// Reduce a responses-API input to chat messages, then reuse the chat path.
pub fn responses_to_upstream(req: &ResponsesRequest, model: &str) -> Result<TranslatedRequest> {
    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(instructions) = &req.instructions {
        messages.push(ChatMessage {
            role: "system".into(),
            content: Some(Content::Text(instructions.clone())),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    match &req.input {
        Value::String(text) => messages.push(ChatMessage {
            role: "user".into(),
            content: Some(Content::Text(text.clone())),
            tool_calls: None,
            tool_call_id: None,
        }),
        Value::Array(items) => {
            for item in items {
                let role = item
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("user")
                    .to_string();
                let text = match item.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    _ => String::new(),
                };
                messages.push(ChatMessage {
                    role,
                    content: Some(Content::Text(text)),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }
        _ => return Err(TranslateError::Invalid("input must be a string or array".into())),
    }

    let chat = ChatCompletionsRequest {
        model: req.model.clone(),
        messages,
        stream: req.stream,
        tools: None,
        tool_choice: None,
    };
    to_upstream(&chat, model)
}

/// Completed response object for the responses variant.
pub fn responses_response(
    reply: &DecodedReply,
    model: &str,
    response_id: &str,
    created: i64,
    input_chars: usize,
) -> Value {
    let text = reply.text();
    json!({
        "id": response_id,
        "object": "response",
        "created_at": created,
        "status": "completed",
        "model": model,
        "output": [{
            "type": "message",
            "id": format!("{response_id}_msg_0"),
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}],
        }],
        "usage": {
            "input_tokens": estimate_tokens_from_chars(input_chars),
            "output_tokens": estimate_tokens_from_chars(text.len()),
            "total_tokens": estimate_tokens_from_chars(input_chars + text.len()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: Value) -> ChatCompletionsRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_role_absorbed_into_first_user_turn() {
        let req = parse(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        }));
        let out = to_upstream(&req, "claude-sonnet-4").unwrap();
        assert!(out.history.is_empty());
        assert_eq!(out.user_content, "be terse\n\nhi");
    }

    #[test]
    fn typed_content_parts_flatten() {
        let req = parse(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "part one"},
                    {"type": "text", "text": "part two"},
                ]},
            ],
        }));
        let out = to_upstream(&req, "m").unwrap();
        assert_eq!(out.user_content, "part one\npart two");
    }

    #[test]
    fn tool_calls_become_tool_use_frames() {
        let req = parse(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "call f"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "t1", "type": "function",
                     "function": {"name": "f", "arguments": "{\"x\":1}"}},
                ]},
                {"role": "tool", "tool_call_id": "t1", "content": "42"},
                {"role": "user", "content": "and now?"},
            ],
        }));
        let out = to_upstream(&req, "m").unwrap();
        assert_eq!(out.user_content, "and now?");
        let assistant = out
            .history
            .iter()
            .find_map(|t| match t {
                HistoryTurn::Assistant(a) if !a.tool_uses().is_empty() => Some(a),
                _ => None,
            })
            .unwrap();
        assert_eq!(assistant.tool_uses()[0].tool_use_id, "t1");
        assert_eq!(assistant.tool_uses()[0].input, json!({"x": 1}));
        let result_turn = out
            .history
            .iter()
            .find_map(|t| match t {
                HistoryTurn::User(u) if !u.tool_results().is_empty() => Some(u),
                _ => None,
            })
            .unwrap();
        assert_eq!(result_turn.tool_results()[0].tool_use_id, "t1");
    }

    #[test]
    fn trailing_tool_message_rides_on_current() {
        let req = parse(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "call f"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "t1", "type": "function", "function": {"name": "f", "arguments": "{}"}},
                ]},
                {"role": "tool", "tool_call_id": "t1", "content": "42"},
            ],
        }));
        let out = to_upstream(&req, "m").unwrap();
        let results = out.tool_results.unwrap();
        assert_eq!(results[0].tool_use_id, "t1");
        assert!(!out.user_content.is_empty());
    }

    #[test]
    fn malformed_arguments_carried_raw() {
        assert_eq!(parse_arguments("not json"), json!({"raw": "not json"}));
        assert_eq!(parse_arguments(""), json!({}));
    }

    #[test]
    fn function_tools_convert_to_upstream_schema() {
        let req = parse(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {
                "name": "f", "description": "d", "parameters": {"type": "object"},
            }}],
        }));
        let out = to_upstream(&req, "m").unwrap();
        let tools = out.tools.unwrap();
        assert_eq!(tools[0].tool_specification.name, "f");
    }

    #[test]
    fn forced_tool_choice_adds_hint() {
        let req = parse(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {}}}],
            "tool_choice": {"type": "function", "function": {"name": "f"}},
        }));
        let out = to_upstream(&req, "m").unwrap();
        assert!(out.user_content.contains("Use the `f` tool."));
    }

    #[test]
    fn tool_reply_sets_finish_reason_tool_calls() {
        let reply = DecodedReply {
            texts: Vec::new(),
            tool_uses: vec![ToolUse {
                id: "t1".into(),
                name: "f".into(),
                input: json!({"x": 1}),
            }],
            stop_reason: StopReason::ToolUse,
        };
        let resp = chat_response(&reply, "m", "chatcmpl-1", 0, 0);
        let choice = &resp["choices"][0];
        assert_eq!(choice["finish_reason"], "tool_calls");
        let call = &choice["message"]["tool_calls"][0];
        assert_eq!(call["id"], "t1");
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "f");
        assert_eq!(call["function"]["arguments"], json!({"x":1}).to_string());
    }

    #[test]
    fn chunk_sequence_shapes() {
        let text = chunk_text("c1", 7, "m", "hi");
        assert_eq!(text["object"], "chat.completion.chunk");
        assert_eq!(text["choices"][0]["delta"]["content"], "hi");
        assert!(text["choices"][0]["finish_reason"].is_null());

        let finish = chunk_finish("c1", 7, "m", "stop");
        assert_eq!(finish["choices"][0]["delta"], json!({}));
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn responses_string_input() {
        let req: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "input": "hello",
            "instructions": "be kind",
        }))
        .unwrap();
        let out = responses_to_upstream(&req, "claude-sonnet-4").unwrap();
        assert_eq!(out.user_content, "be kind\n\nhello");
    }

    #[test]
    fn responses_array_input() {
        let req: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "input": [
                {"role": "user", "content": [{"type": "input_text", "text": "question"}]},
            ],
        }))
        .unwrap();
        let out = responses_to_upstream(&req, "claude-sonnet-4").unwrap();
        assert_eq!(out.user_content, "question");
    }
}
