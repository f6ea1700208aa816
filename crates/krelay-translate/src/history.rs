//! History compaction and invariant repair.
//!
//! Upstream history must be an alternating user/assistant sequence where
//! every assistant tool use is answered by a tool result in the next user
//! turn (or by the current message for the final assistant turn). Repair
//! enforces that after translation, after compaction, and after tool-result
//! splicing; compaction keeps the payload under the configured budget.

use tracing::debug;

use krelay_core::config::{CompactionStrategy, HistorySettings};
use krelay_wire::request::{AssistantTurn, HistoryTurn, ToolResult, UserTurn};

/// Label prepended to a synthetic summary turn.
pub const SUMMARY_LABEL: &str = "[prior context summary]";

/// Merge two user turns: text concatenates, attachments union.
fn merge_user(mut a: UserTurn, b: UserTurn) -> UserTurn {
    let b_results = b.tool_results().to_vec();
    if !b.content.is_empty() {
        if a.content.is_empty() {
            a.content = b.content;
        } else {
            a.content = format!("{}\n\n{}", a.content, b.content);
        }
    }
    if !b_results.is_empty() {
        let mut merged = a.tool_results().to_vec();
        merged.extend(b_results);
        a = UserTurn {
            user_input_message_context: None,
            ..a
        }
        .with_tool_results(merged);
    }
    if let Some(images) = b.images {
        a.images = match a.images {
            Some(mut existing) => {
                existing.extend(images);
                Some(existing)
            }
            None => Some(images),
        };
    }
    a
}

fn merge_assistant(mut a: AssistantTurn, b: AssistantTurn) -> AssistantTurn {
    if !b.content.is_empty() {
        if a.content.is_empty() {
            a.content = b.content;
        } else {
            a.content = format!("{}\n\n{}", a.content, b.content);
        }
    }
    if let Some(uses) = b.tool_uses {
        a.tool_uses = match a.tool_uses {
            Some(mut existing) => {
                existing.extend(uses);
                Some(existing)
            }
            None => Some(uses),
        };
    }
    a
}

/// Enforce the history invariants. `trailing_results` are the tool results
/// attached to the current message; they satisfy tool uses on the final
/// assistant turn.
pub fn repair(turns: Vec<HistoryTurn>, trailing_results: &[ToolResult]) -> Vec<HistoryTurn> {
    // Merge runs of same-role turns.
    let mut merged: Vec<HistoryTurn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match (merged.pop(), turn) {
            (Some(HistoryTurn::User(a)), HistoryTurn::User(b)) => {
                merged.push(HistoryTurn::User(merge_user(a, b)));
            }
            (Some(HistoryTurn::Assistant(a)), HistoryTurn::Assistant(b)) => {
                merged.push(HistoryTurn::Assistant(merge_assistant(a, b)));
            }
            (Some(prev), turn) => {
                merged.push(prev);
                merged.push(turn);
            }
            (None, turn) => merged.push(turn),
        }
    }

    // History opens with a user turn.
    while merged.first().is_some_and(HistoryTurn::is_assistant) {
        debug!("dropping leading assistant turn");
        merged.remove(0);
    }

    // Tool pairing: both sides are checked against the pre-filter sets, so
    // matched pairs survive and orphans on either side are removed.
    let use_ids: Vec<Vec<String>> = merged
        .iter()
        .map(|t| match t {
            HistoryTurn::Assistant(a) => {
                a.tool_uses().iter().map(|u| u.tool_use_id.clone()).collect()
            }
            _ => Vec::new(),
        })
        .collect();
    let result_ids: Vec<Vec<String>> = merged
        .iter()
        .map(|t| match t {
            HistoryTurn::User(u) => u.tool_results().iter().map(|r| r.tool_use_id.clone()).collect(),
            _ => Vec::new(),
        })
        .collect();

    let last = merged.len().saturating_sub(1);
    for (i, turn) in merged.iter_mut().enumerate() {
        match turn {
            HistoryTurn::Assistant(a) => {
                if let Some(uses) = a.tool_uses.take() {
                    let answered: Vec<_> = uses
                        .into_iter()
                        .filter(|u| {
                            let next_has = result_ids.get(i + 1).is_some_and(|ids| ids.contains(&u.tool_use_id));
                            let trailing_has = i == last
                                && trailing_results.iter().any(|r| r.tool_use_id == u.tool_use_id);
                            next_has || trailing_has
                        })
                        .collect();
                    if !answered.is_empty() {
                        a.tool_uses = Some(answered);
                    }
                }
            }
            HistoryTurn::User(u) => {
                let results = u.tool_results().to_vec();
                if !results.is_empty() {
                    let empty: &[String] = &[];
                    let prior_uses = if i > 0 { use_ids[i - 1].as_slice() } else { empty };
                    let matched: Vec<_> = results
                        .into_iter()
                        .filter(|r| prior_uses.contains(&r.tool_use_id))
                        .collect();
                    let mut cleaned = UserTurn {
                        user_input_message_context: None,
                        ..u.clone()
                    };
                    cleaned = cleaned.with_tool_results(matched);
                    *u = cleaned;
                }
            }
        }
    }

    // History closes with an assistant turn; a dangling user turn has no
    // reply and cannot be sent.
    while merged.last().is_some_and(HistoryTurn::is_user) {
        debug!("dropping dangling trailing user turn");
        merged.pop();
    }

    merged
}

/// Build a role-labelled transcript of turns, for summarization prompts.
pub fn transcript(turns: &[HistoryTurn]) -> String {
    turns
        .iter()
        .map(|t| match t {
            HistoryTurn::User(u) => format!("USER: {}", u.content),
            HistoryTurn::Assistant(a) => format!("ASSISTANT: {}", a.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Synthetic user turn carrying a summary of dropped turns.
pub fn summary_turn(summary: &str) -> HistoryTurn {
    HistoryTurn::User(UserTurn::text(format!("{SUMMARY_LABEL} {summary}")))
}

pub struct HistoryManager {
    settings: HistorySettings,
    pub was_truncated: bool,
    pub truncate_info: String,
}

impl HistoryManager {
    pub fn new(settings: HistorySettings) -> Self {
        Self {
            settings,
            was_truncated: false,
            truncate_info: String::new(),
        }
    }

    pub fn strategy(&self) -> CompactionStrategy {
        self.settings.strategy
    }

    /// (history chars, current-message chars, total).
    pub fn estimate_request_chars(
        &self,
        history: &[HistoryTurn],
        current: &str,
    ) -> (usize, usize, usize) {
        let history_chars: usize = history.iter().map(HistoryTurn::estimated_chars).sum();
        (history_chars, current.len(), history_chars + current.len())
    }

    fn over_budget(&self, history: &[HistoryTurn], current: &str) -> bool {
        let (_, _, total) = self.estimate_request_chars(history, current);
        total > self.settings.max_chars || history.len() > self.settings.max_turns
    }

    /// Whether the summarize strategy wants a pre-dispatch summary pass.
    pub fn should_summarize(&self, history: &[HistoryTurn], current: &str) -> bool {
        self.settings.strategy == CompactionStrategy::SummarizeHead
            && self.over_budget(history, current)
    }

    /// Split into (head to summarize, tail kept verbatim). The tail begins
    /// on a user turn so the rebuilt history stays alternating.
    pub fn split_for_summary(&self, history: Vec<HistoryTurn>) -> (Vec<HistoryTurn>, Vec<HistoryTurn>) {
        let pairs = history.len() / 2;
        let drop_pairs = (pairs / 2).max(1);
        let cut = (drop_pairs * 2).min(history.len());
        let head = history[..cut].to_vec();
        let tail = history[cut..].to_vec();
        (head, tail)
    }

    /// Synchronous compaction: repair, then drop oldest pairs while over
    /// budget, then repair again. Never fails; worst case it returns an
    /// empty history.
    pub fn pre_process(
        &mut self,
        history: Vec<HistoryTurn>,
        current: &str,
        trailing_results: &[ToolResult],
    ) -> Vec<HistoryTurn> {
        let mut history = repair(history, trailing_results);
        let mut dropped = 0usize;
        while self.over_budget(&history, current) && !history.is_empty() {
            let n = 2.min(history.len());
            history.drain(..n);
            dropped += 1;
        }
        if dropped > 0 {
            self.was_truncated = true;
            self.truncate_info = format!("dropped {dropped} oldest turn pair(s) to fit budget");
            history = repair(history, trailing_results);
        }
        history
    }

    /// After an upstream content-length rejection: drop progressively more
    /// of the head. Returns the shortened history and whether a retry is
    /// worthwhile (false once nothing could be dropped).
    pub fn handle_length_error(
        &mut self,
        history: Vec<HistoryTurn>,
        retry_index: usize,
    ) -> (Vec<HistoryTurn>, bool) {
        if history.is_empty() {
            return (history, false);
        }
        let drop_pairs = retry_index + 1;
        let n = (drop_pairs * 2).min(history.len());
        let shortened = history[n..].to_vec();
        self.was_truncated = true;
        self.truncate_info = format!("dropped {drop_pairs} oldest turn pair(s) after length error");
        (shortened, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krelay_wire::request::AssistantToolUse;

    fn user(text: &str) -> HistoryTurn {
        HistoryTurn::User(UserTurn::text(text))
    }

    fn assistant(text: &str) -> HistoryTurn {
        HistoryTurn::Assistant(AssistantTurn::text(text))
    }

    fn assistant_with_tool(text: &str, id: &str) -> HistoryTurn {
        HistoryTurn::Assistant(AssistantTurn {
            content: text.to_string(),
            tool_uses: Some(vec![AssistantToolUse {
                tool_use_id: id.to_string(),
                name: "f".to_string(),
                input: serde_json::json!({}),
            }]),
        })
    }

    fn user_with_result(text: &str, id: &str) -> HistoryTurn {
        HistoryTurn::User(UserTurn::text(text).with_tool_results(vec![ToolResult::success(id, "ok")]))
    }

    fn settings(max_chars: usize, max_turns: usize) -> HistorySettings {
        HistorySettings {
            max_chars,
            max_turns,
            strategy: CompactionStrategy::TruncateHead,
        }
    }

    #[test]
    fn repair_merges_consecutive_same_role() {
        let turns = vec![user("a"), user("b"), assistant("x"), assistant("y")];
        let fixed = repair(turns, &[]);
        assert_eq!(fixed.len(), 2);
        match &fixed[0] {
            HistoryTurn::User(u) => assert_eq!(u.content, "a\n\nb"),
            _ => panic!("expected user"),
        }
        match &fixed[1] {
            HistoryTurn::Assistant(a) => assert_eq!(a.content, "x\n\ny"),
            _ => panic!("expected assistant"),
        }
    }

    #[test]
    fn repair_drops_leading_assistant_and_trailing_user() {
        let turns = vec![assistant("stray"), user("q"), assistant("a"), user("dangling")];
        let fixed = repair(turns, &[]);
        assert_eq!(fixed.len(), 2);
        assert!(fixed[0].is_user());
        assert!(fixed[1].is_assistant());
    }

    #[test]
    fn matched_tool_pair_survives_repair() {
        let turns = vec![
            user("q"),
            assistant_with_tool("calling", "t1"),
            user_with_result("", "t1"),
            assistant("done"),
        ];
        let fixed = repair(turns, &[]);
        assert_eq!(fixed.len(), 4);
        match &fixed[1] {
            HistoryTurn::Assistant(a) => assert_eq!(a.tool_uses().len(), 1),
            _ => panic!(),
        }
        match &fixed[2] {
            HistoryTurn::User(u) => assert_eq!(u.tool_results().len(), 1),
            _ => panic!(),
        }
    }

    #[test]
    fn orphan_tool_use_and_result_are_removed() {
        let turns = vec![
            user("q"),
            assistant_with_tool("calling", "t1"),
            user("no result here"),
            assistant("done"),
            user_with_result("orphan result", "t9"),
            assistant("end"),
        ];
        let fixed = repair(turns, &[]);
        match &fixed[1] {
            HistoryTurn::Assistant(a) => assert!(a.tool_uses().is_empty()),
            _ => panic!(),
        }
        match &fixed[4] {
            HistoryTurn::User(u) => assert!(u.tool_results().is_empty()),
            _ => panic!(),
        }
    }

    #[test]
    fn final_assistant_tool_use_pairs_with_current_message() {
        let turns = vec![user("q"), assistant_with_tool("calling", "t1")];
        let current = vec![ToolResult::success("t1", "42")];
        let fixed = repair(turns.clone(), &current);
        match &fixed[1] {
            HistoryTurn::Assistant(a) => assert_eq!(a.tool_uses().len(), 1),
            _ => panic!(),
        }
        // Without the trailing result the use is orphaned.
        let fixed = repair(turns, &[]);
        match &fixed[1] {
            HistoryTurn::Assistant(a) => assert!(a.tool_uses().is_empty()),
            _ => panic!(),
        }
    }

    #[test]
    fn pre_process_under_budget_is_identity() {
        let turns = vec![user("q"), assistant("a")];
        let mut mgr = HistoryManager::new(settings(10_000, 40));
        let out = mgr.pre_process(turns.clone(), "current", &[]);
        assert_eq!(out, turns);
        assert!(!mgr.was_truncated);
    }

    #[test]
    fn pre_process_drops_oldest_pairs_when_over_budget() {
        let turns = vec![
            user("aaaaaaaaaa"),
            assistant("bbbbbbbbbb"),
            user("cccccccccc"),
            assistant("dddddddddd"),
        ];
        let mut mgr = HistoryManager::new(settings(25, 40));
        let out = mgr.pre_process(turns, "x", &[]);
        assert!(mgr.was_truncated);
        assert!(out.len() < 4);
        assert!(out.first().map(HistoryTurn::is_user).unwrap_or(true));
    }

    #[test]
    fn turn_count_ceiling_triggers_compaction() {
        let mut turns = Vec::new();
        for i in 0..6 {
            turns.push(user(&format!("q{i}")));
            turns.push(assistant(&format!("a{i}")));
        }
        let mut mgr = HistoryManager::new(settings(1_000_000, 4));
        let out = mgr.pre_process(turns, "x", &[]);
        assert!(out.len() <= 4);
    }

    #[test]
    fn length_error_drops_one_pair_then_more() {
        let turns = vec![user("q1"), assistant("a1"), user("q2"), assistant("a2")];
        let mut mgr = HistoryManager::new(settings(1_000_000, 40));

        let (after_first, retry) = mgr.handle_length_error(turns, 0);
        assert!(retry);
        assert_eq!(after_first.len(), 2);
        match &after_first[0] {
            HistoryTurn::User(u) => assert_eq!(u.content, "q2"),
            _ => panic!(),
        }

        let (after_second, retry) = mgr.handle_length_error(after_first, 1);
        assert!(retry);
        assert!(after_second.is_empty());

        let (empty, retry) = mgr.handle_length_error(after_second, 2);
        assert!(empty.is_empty());
        assert!(!retry);
    }

    #[test]
    fn summary_split_keeps_tail_on_user_boundary() {
        let turns = vec![
            user("q1"), assistant("a1"),
            user("q2"), assistant("a2"),
            user("q3"), assistant("a3"),
            user("q4"), assistant("a4"),
        ];
        let mgr = HistoryManager::new(HistorySettings {
            max_chars: 10,
            max_turns: 2,
            strategy: CompactionStrategy::SummarizeHead,
        });
        assert!(mgr.should_summarize(&turns, "x"));
        let (head, tail) = mgr.split_for_summary(turns);
        assert!(!head.is_empty());
        assert!(tail.first().map(HistoryTurn::is_user).unwrap_or(false));
        assert_eq!(head.len() % 2, 0);
    }

    #[test]
    fn summary_turn_merges_into_following_user() {
        let tail = vec![user("q3"), assistant("a3")];
        let mut rebuilt = vec![summary_turn("earlier talk about rust")];
        rebuilt.extend(tail);
        let fixed = repair(rebuilt, &[]);
        assert_eq!(fixed.len(), 2);
        match &fixed[0] {
            HistoryTurn::User(u) => {
                assert!(u.content.starts_with(SUMMARY_LABEL));
                assert!(u.content.contains("q3"));
            }
            _ => panic!(),
        }
    }
}
