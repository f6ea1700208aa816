//! Upstream request body construction.
//!
//! The upstream consumes one nested `conversationState` document per call:
//! a fresh conversation id, the current user message (text, model, tools,
//! images, tool results), and an alternating user/assistant history.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const ORIGIN: &str = "AI_EDITOR";
const AGENT_TASK_TYPE: &str = "vibe";
const CHAT_TRIGGER_TYPE: &str = "MANUAL";

/// Tool schema in the upstream's wrapping: `{toolSpecification: {name,
/// description, inputSchema: {json}}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSchema {
    pub json: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            tool_specification: ToolSpecification {
                name: name.into(),
                description: description.into(),
                input_schema: InputSchema { json: schema },
            },
        }
    }
}

/// Result frame for a prior tool invocation, attached to a user turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContent>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultContent {
    pub text: String,
}

impl ToolResult {
    pub fn success(tool_use_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: vec![ToolResultContent { text: text.into() }],
            status: "success".to_string(),
        }
    }
}

/// Base64 image attachment. `format` is the bare tag (jpeg/png/gif/webp).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAttachment {
    pub format: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSource {
    pub bytes: String,
}

/// Tool invocation echoed back inside an assistant history turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantToolUse {
    pub tool_use_id: String,
    pub name: String,
    /// Reassembled tool input.
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
}

/// A user turn, either the current message or a history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTurn {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageAttachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserContext>,
}

impl UserTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model_id: None,
            origin: Some(ORIGIN.to_string()),
            images: None,
            user_input_message_context: None,
        }
    }

    pub fn with_tool_results(mut self, results: Vec<ToolResult>) -> Self {
        if !results.is_empty() {
            let ctx = self.user_input_message_context.get_or_insert_with(UserContext::default);
            ctx.tool_results = Some(results);
        }
        self
    }

    pub fn tool_results(&self) -> &[ToolResult] {
        self.user_input_message_context
            .as_ref()
            .and_then(|c| c.tool_results.as_deref())
            .unwrap_or(&[])
    }
}

/// An assistant turn in history; may embed the tool uses it emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantTurn {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_uses: Option<Vec<AssistantToolUse>>,
}

impl AssistantTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_uses: None,
        }
    }

    pub fn tool_uses(&self) -> &[AssistantToolUse] {
        self.tool_uses.as_deref().unwrap_or(&[])
    }
}

/// One history entry. Serialized as `{"userInputMessage": ...}` or
/// `{"assistantResponseMessage": ...}` per the upstream contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum HistoryTurn {
    #[serde(rename = "userInputMessage")]
    User(UserTurn),
    #[serde(rename = "assistantResponseMessage")]
    Assistant(AssistantTurn),
}

impl HistoryTurn {
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant(_))
    }

    /// Rough character weight for the compaction budget: visible text plus
    /// tool payloads.
    pub fn estimated_chars(&self) -> usize {
        match self {
            Self::User(u) => {
                let results: usize = u
                    .tool_results()
                    .iter()
                    .flat_map(|r| r.content.iter())
                    .map(|c| c.text.len())
                    .sum();
                u.content.len() + results
            }
            Self::Assistant(a) => {
                let uses: usize = a
                    .tool_uses()
                    .iter()
                    .map(|t| t.input.to_string().len() + t.name.len())
                    .sum();
                a.content.len() + uses
            }
        }
    }
}

/// Full upstream request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRequest {
    pub conversation_state: ConversationState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub agent_continuation_id: String,
    pub agent_task_type: String,
    pub chat_trigger_type: String,
    pub conversation_id: String,
    pub current_message: CurrentMessage,
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserTurn,
}

/// Assemble the upstream request. Conversation ids are fresh per call; the
/// upstream carries no cross-request identity.
pub fn build_request(
    user_content: String,
    model: &str,
    history: Vec<HistoryTurn>,
    tools: Option<Vec<ToolSpec>>,
    tool_results: Option<Vec<ToolResult>>,
    images: Option<Vec<ImageAttachment>>,
) -> UpstreamRequest {
    // The upstream expects the context object even when empty; it
    // serializes as `{}` with neither tools nor results.
    let context = UserContext {
        tools: tools.filter(|v| !v.is_empty()),
        tool_results: tool_results.filter(|v| !v.is_empty()),
    };
    let current = UserTurn {
        content: user_content,
        model_id: Some(model.to_string()),
        origin: Some(ORIGIN.to_string()),
        images: images.filter(|v| !v.is_empty()),
        user_input_message_context: Some(context),
    };

    UpstreamRequest {
        conversation_state: ConversationState {
            agent_continuation_id: Uuid::new_v4().to_string(),
            agent_task_type: AGENT_TASK_TYPE.to_string(),
            chat_trigger_type: CHAT_TRIGGER_TYPE.to_string(),
            conversation_id: Uuid::new_v4().to_string(),
            current_message: CurrentMessage {
                user_input_message: current,
            },
            history,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_turn_serializes_with_upstream_tags() {
        let user = HistoryTurn::User(UserTurn::text("hi"));
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("userInputMessage").is_some());
        assert_eq!(json["userInputMessage"]["content"], "hi");
        assert_eq!(json["userInputMessage"]["origin"], "AI_EDITOR");

        let asst = HistoryTurn::Assistant(AssistantTurn::text("hello"));
        let json = serde_json::to_value(&asst).unwrap();
        assert_eq!(json["assistantResponseMessage"]["content"], "hello");
    }

    #[test]
    fn request_shape_matches_upstream_contract() {
        let req = build_request(
            "question".into(),
            "claude-sonnet-4",
            vec![
                HistoryTurn::User(UserTurn::text("earlier")),
                HistoryTurn::Assistant(AssistantTurn::text("answer")),
            ],
            Some(vec![ToolSpec::new("f", "desc", serde_json::json!({"type": "object"}))]),
            None,
            None,
        );
        let json = serde_json::to_value(&req).unwrap();
        let state = &json["conversationState"];
        assert_eq!(state["agentTaskType"], "vibe");
        assert_eq!(state["chatTriggerType"], "MANUAL");
        assert_eq!(state["history"].as_array().unwrap().len(), 2);
        let current = &state["currentMessage"]["userInputMessage"];
        assert_eq!(current["content"], "question");
        assert_eq!(current["modelId"], "claude-sonnet-4");
        let tools = &current["userInputMessageContext"]["tools"];
        assert_eq!(tools[0]["toolSpecification"]["name"], "f");
        assert!(tools[0]["toolSpecification"]["inputSchema"].get("json").is_some());
    }

    #[test]
    fn fresh_conversation_id_per_call() {
        let a = build_request("x".into(), "auto", Vec::new(), None, None, None);
        let b = build_request("x".into(), "auto", Vec::new(), None, None, None);
        assert_ne!(
            a.conversation_state.conversation_id,
            b.conversation_state.conversation_id
        );
    }

    #[test]
    fn estimated_chars_counts_tool_payloads() {
        let turn = HistoryTurn::User(
            UserTurn::text("abc").with_tool_results(vec![ToolResult::success("t1", "0123456789")]),
        );
        assert_eq!(turn.estimated_chars(), 13);
    }
}
