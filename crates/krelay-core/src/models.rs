//! Model name resolution.
//!
//! External clients send whatever identifier their tooling defaults to
//! (Claude dates, GPT names, Gemini names). The upstream accepts a small
//! fixed set, so everything funnels through `resolve`.

/// Model identifiers the upstream accepts verbatim.
pub const UPSTREAM_MODELS: &[&str] = &[
    "auto",
    "claude-sonnet-4.5",
    "claude-sonnet-4",
    "claude-haiku-4.5",
    "claude-opus-4.5",
];

/// Fast model used for history summarization.
pub const SUMMARY_MODEL: &str = "claude-haiku-4.5";

/// Default when the inbound name is empty or unrecognized.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

/// Canonical sentinel that forces buffered-then-chunked streaming.
pub const PSEUDO_STREAM_PREFIX: &str = "pseudo-stream/";
/// Short sentinel, accepted on input only.
const PSEUDO_STREAM_PREFIX_SHORT: &str = "pseudo/";

/// Exact-match alias table, applied before any fallback rule.
const ALIASES: &[(&str, &str)] = &[
    ("claude-3-5-sonnet-20241022", "claude-sonnet-4"),
    ("claude-3-5-sonnet-latest", "claude-sonnet-4"),
    ("claude-3-5-sonnet", "claude-sonnet-4"),
    ("claude-3-5-haiku-20241022", "claude-haiku-4.5"),
    ("claude-3-5-haiku-latest", "claude-haiku-4.5"),
    ("claude-3-opus-20240229", "claude-opus-4.5"),
    ("claude-3-opus-latest", "claude-opus-4.5"),
    ("claude-3-sonnet-20240229", "claude-sonnet-4"),
    ("claude-3-haiku-20240307", "claude-haiku-4.5"),
    ("claude-4-sonnet", "claude-sonnet-4"),
    ("claude-4-opus", "claude-opus-4.5"),
    ("gpt-4o", "claude-sonnet-4"),
    ("gpt-4o-mini", "claude-haiku-4.5"),
    ("gpt-4-turbo", "claude-sonnet-4"),
    ("gpt-4", "claude-sonnet-4"),
    ("gpt-3.5-turbo", "claude-haiku-4.5"),
    ("o1", "claude-opus-4.5"),
    ("o1-preview", "claude-opus-4.5"),
    ("o1-mini", "claude-sonnet-4"),
    ("gemini-2.0-flash", "claude-sonnet-4"),
    ("gemini-2.0-flash-thinking", "claude-opus-4.5"),
    ("gemini-1.5-pro", "claude-sonnet-4.5"),
    ("gemini-1.5-flash", "claude-sonnet-4"),
    ("sonnet", "claude-sonnet-4"),
    ("haiku", "claude-haiku-4.5"),
    ("opus", "claude-opus-4.5"),
];

/// Map an external model name to an upstream-accepted one.
pub fn resolve(model: &str) -> &'static str {
    if model.is_empty() {
        return DEFAULT_MODEL;
    }
    if let Some((_, mapped)) = ALIASES.iter().copied().find(|(alias, _)| *alias == model) {
        return mapped;
    }
    if let Some(known) = UPSTREAM_MODELS.iter().copied().find(|m| *m == model) {
        return known;
    }
    let lower = model.to_lowercase();
    if lower.contains("opus") {
        return "claude-opus-4.5";
    }
    if lower.contains("haiku") {
        return "claude-haiku-4.5";
    }
    if lower.contains("sonnet") {
        if lower.contains("4.5") {
            return "claude-sonnet-4.5";
        }
        return "claude-sonnet-4";
    }
    DEFAULT_MODEL
}

/// Strip the pseudo-stream sentinel, if present.
/// Returns the remaining model name and whether buffered-then-chunked
/// streaming was requested.
pub fn parse_stream_mode(model: &str) -> (&str, bool) {
    if let Some(rest) = model.strip_prefix(PSEUDO_STREAM_PREFIX) {
        return (rest, true);
    }
    if let Some(rest) = model.strip_prefix(PSEUDO_STREAM_PREFIX_SHORT) {
        return (rest, true);
    }
    (model, false)
}

/// Fallback model list for `GET /v1/models` when no credential can reach
/// the upstream.
pub fn fallback_model_ids() -> Vec<String> {
    UPSTREAM_MODELS.iter().map(|m| m.to_string()).collect()
}
