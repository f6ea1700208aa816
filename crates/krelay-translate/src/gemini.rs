//! generateContent-dialect adapter (`/v1/models/{model}:generateContent`).
//!
//! Inbound roles are `user` and `model`; text parts concatenate and a
//! top-level `systemInstruction` folds into the first user turn. Outbound
//! is the `candidates` shape with a `STOP` finish reason.

use serde::Deserialize;
use serde_json::{json, Value};

use krelay_wire::decode::DecodedReply;
use krelay_wire::request::{AssistantTurn, HistoryTurn, UserTurn};

use crate::anthropic::estimate_tokens_from_chars;
use crate::error::{Result, TranslateError};
use crate::TranslatedRequest;

#[derive(Debug, Deserialize)]
pub struct GenerateContentRequest {
    #[serde(default)]
    pub contents: Vec<GeminiContent>,
    #[serde(default, rename = "systemInstruction")]
    pub system_instruction: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiPart {
    #[serde(default)]
    pub text: Option<String>,
}

impl GeminiContent {
    fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Normalize an inbound generateContent request into upstream form.
pub fn to_upstream(req: &GenerateContentRequest, model: &str) -> Result<TranslatedRequest> {
    if req.contents.is_empty() {
        return Err(TranslateError::MessagesRequired);
    }

    let mut turns: Vec<HistoryTurn> = Vec::with_capacity(req.contents.len());
    for content in &req.contents {
        let text = content.text();
        match content.role.as_deref().unwrap_or("user") {
            "user" => {
                let mut turn = UserTurn::text(text);
                turn.model_id = Some(model.to_string());
                turns.push(HistoryTurn::User(turn));
            }
            "model" => turns.push(HistoryTurn::Assistant(AssistantTurn::text(text))),
            other => {
                return Err(TranslateError::Invalid(format!("unknown role: {other}")));
            }
        }
    }

    let mut user_content = match turns.pop() {
        Some(HistoryTurn::User(turn)) => turn.content,
        Some(last) => {
            turns.push(last);
            "Continue.".to_string()
        }
        None => unreachable!("contents checked non-empty"),
    };

    if let Some(instruction) = &req.system_instruction {
        let text = instruction.text();
        if !text.is_empty() {
            match turns.iter_mut().find(|t| t.is_user()) {
                Some(HistoryTurn::User(first)) => {
                    first.content = format!("{text}\n\n{}", first.content);
                }
                _ => {
                    user_content = format!("{text}\n\n{user_content}");
                }
            }
        }
    }

    Ok(TranslatedRequest {
        user_content,
        history: turns,
        ..Default::default()
    })
}

/// Non-streaming generateContent response.
pub fn generate_content_response(reply: &DecodedReply, input_chars: usize) -> Value {
    let text = reply.text();
    json!({
        "candidates": [{
            "content": {
                "parts": [{"text": text}],
                "role": "model",
            },
            "finishReason": "STOP",
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": estimate_tokens_from_chars(input_chars),
            "candidatesTokenCount": estimate_tokens_from_chars(text.len()),
            "totalTokenCount": estimate_tokens_from_chars(input_chars + text.len()),
        },
    })
}

/// Plain JSON error carried on the HTTP status.
pub fn error_body(code: u16, message: &str) -> Value {
    json!({"error": {"code": code, "message": message, "status": "FAILED_PRECONDITION"}})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: Value) -> GenerateContentRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn parts_concatenate_and_roles_map() {
        let req = parse(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "a"}, {"text": "b"}]},
                {"role": "model", "parts": [{"text": "reply"}]},
                {"role": "user", "parts": [{"text": "next"}]},
            ],
        }));
        let out = to_upstream(&req, "claude-sonnet-4").unwrap();
        assert_eq!(out.history.len(), 2);
        match &out.history[0] {
            HistoryTurn::User(u) => assert_eq!(u.content, "a\nb"),
            _ => panic!(),
        }
        assert!(out.history[1].is_assistant());
        assert_eq!(out.user_content, "next");
    }

    #[test]
    fn system_instruction_folds_into_first_user() {
        let req = parse(json!({
            "systemInstruction": {"parts": [{"text": "be terse"}]},
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
        }));
        let out = to_upstream(&req, "m").unwrap();
        assert_eq!(out.user_content, "be terse\n\nhi");
    }

    #[test]
    fn missing_role_defaults_to_user() {
        let req = parse(json!({
            "contents": [{"parts": [{"text": "hi"}]}],
        }));
        let out = to_upstream(&req, "m").unwrap();
        assert_eq!(out.user_content, "hi");
    }

    #[test]
    fn empty_contents_is_an_error() {
        let req = parse(json!({"contents": []}));
        assert!(to_upstream(&req, "m").is_err());
    }

    #[test]
    fn response_shape() {
        let reply = DecodedReply {
            texts: vec!["hello".into()],
            tool_uses: Vec::new(),
            stop_reason: krelay_wire::decode::StopReason::EndTurn,
        };
        let resp = generate_content_response(&reply, 8);
        let candidate = &resp["candidates"][0];
        assert_eq!(candidate["content"]["parts"][0]["text"], "hello");
        assert_eq!(candidate["content"]["role"], "model");
        assert_eq!(candidate["finishReason"], "STOP");
    }
}
