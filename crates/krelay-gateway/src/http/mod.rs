pub mod chat;
pub mod gemini;
pub mod messages;
pub mod models;
pub mod responses;

use std::convert::Infallible;

use axum::response::sse::Event;
use serde_json::Value;

/// Pseudo-stream chunking: characters per delta and the emission cadence.
pub const PSEUDO_CHUNK_CHARS: usize = 20;
pub const PSEUDO_CHUNK_DELAY_MS: u64 = 20;

/// Wrap a JSON value as one SSE data line.
pub fn sse_json(value: Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(value.to_string()))
}

/// Wrap a raw payload (e.g. the `[DONE]` sentinel) as one SSE data line.
pub fn sse_raw(data: &str) -> Result<Event, Infallible> {
    Ok(Event::default().data(data.to_string()))
}

/// Split on character boundaries into runs of at most `n` characters.
pub fn chunk_chars(text: &str, n: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if current.chars().count() >= n {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_char_boundaries() {
        let chunks = chunk_chars("héllo wörld!", 5);
        assert_eq!(chunks.concat(), "héllo wörld!");
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
    }

    #[test]
    fn empty_text_chunks_to_nothing() {
        assert!(chunk_chars("", 20).is_empty());
    }
}
