pub mod anthropic;
pub mod content;
pub mod error;
pub mod gemini;
pub mod history;
pub mod openai;
pub mod session;

use krelay_wire::request::{HistoryTurn, ImageAttachment, ToolResult, ToolSpec};

/// The dialect-independent result of inbound translation: everything the
/// orchestrator needs to assemble one upstream request.
#[derive(Debug, Clone, Default)]
pub struct TranslatedRequest {
    /// Text of the current user message (system prompt already folded in
    /// when it lands on the first turn).
    pub user_content: String,
    /// Alternating user/assistant turns preceding the current message.
    pub history: Vec<HistoryTurn>,
    pub tools: Option<Vec<ToolSpec>>,
    /// Tool results attached to the current message.
    pub tool_results: Option<Vec<ToolResult>>,
    /// Images attached to the current message.
    pub images: Option<Vec<ImageAttachment>>,
}
