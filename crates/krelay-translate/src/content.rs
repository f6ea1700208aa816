//! Inbound message content model.
//!
//! Clients send `content` either as a plain string or as a heterogeneous
//! block array. Both deserialize into `Content`; the adapters pattern-match
//! once instead of sniffing JSON shapes at every use site.

use serde::Deserialize;
use serde_json::Value;

use krelay_wire::request::{ImageAttachment, ImageSource};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    /// Anthropic-style inline image: base64 with a declared media type.
    Image {
        source: ImageData,
    },
    /// OpenAI-style image reference; only data: URLs carry bytes.
    ImageUrl {
        image_url: ImageUrlData,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    /// Anything else (thinking blocks, unknown extensions) is carried but
    /// contributes nothing to the upstream request.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageData {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrlData {
    #[serde(default)]
    pub url: String,
}

/// Map a media type onto the upstream's bare format tag.
fn format_from_media_type(media_type: &str) -> &'static str {
    if media_type.contains("png") {
        "png"
    } else if media_type.contains("gif") {
        "gif"
    } else if media_type.contains("webp") {
        "webp"
    } else {
        "jpeg"
    }
}

/// Split a `data:image/<fmt>;base64,<data>` URL. Anything else is ignored
/// (remote URLs cannot be forwarded upstream).
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:image/")?;
    let (format, data) = rest.split_once(";base64,")?;
    if format.is_empty() || data.is_empty() {
        return None;
    }
    Some((format.to_string(), data.to_string()))
}

impl Content {
    /// Flatten to visible text plus extracted image attachments. Text parts
    /// join with newlines; tool blocks contribute nothing here.
    pub fn flatten(&self) -> (String, Vec<ImageAttachment>) {
        match self {
            Content::Text(text) => (text.clone(), Vec::new()),
            Content::Blocks(blocks) => {
                let mut parts = Vec::new();
                let mut images = Vec::new();
                for block in blocks {
                    match block {
                        Block::Text { text } => parts.push(text.clone()),
                        Block::Image { source } => {
                            images.push(ImageAttachment {
                                format: format_from_media_type(&source.media_type).to_string(),
                                source: ImageSource {
                                    bytes: source.data.clone(),
                                },
                            });
                        }
                        Block::ImageUrl { image_url } => {
                            if let Some((format, data)) = parse_data_url(&image_url.url) {
                                images.push(ImageAttachment {
                                    format,
                                    source: ImageSource { bytes: data },
                                });
                            }
                        }
                        Block::ToolUse { .. } | Block::ToolResult { .. } | Block::Unknown => {}
                    }
                }
                (parts.join("\n"), images)
            }
        }
    }

    /// Just the text, for call sites that cannot carry images.
    pub fn text(&self) -> String {
        self.flatten().0
    }
}

/// Flatten a tool-result `content` value (string, or array of text parts)
/// into plain text for the upstream result frame.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                if let Some(s) = item.as_str() {
                    s.to_string()
                } else {
                    item.get("text")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| item.to_string())
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_passes_through() {
        let content: Content = serde_json::from_str(r#""hello""#).unwrap();
        let (text, images) = content.flatten();
        assert_eq!(text, "hello");
        assert!(images.is_empty());
    }

    #[test]
    fn text_blocks_concatenate() {
        let content: Content = serde_json::from_str(
            r#"[{"type":"text","text":"a"},{"type":"text","text":"b"}]"#,
        )
        .unwrap();
        assert_eq!(content.text(), "a\nb");
    }

    #[test]
    fn anthropic_image_block_maps_media_type() {
        let content: Content = serde_json::from_str(
            r#"[{"type":"image","source":{"type":"base64","media_type":"image/png","data":"AAAA"}}]"#,
        )
        .unwrap();
        let (_, images) = content.flatten();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].format, "png");
        assert_eq!(images[0].source.bytes, "AAAA");
    }

    #[test]
    fn openai_data_url_is_parsed() {
        let content: Content = serde_json::from_str(
            r#"[{"type":"image_url","image_url":{"url":"data:image/webp;base64,QUJD"}}]"#,
        )
        .unwrap();
        let (_, images) = content.flatten();
        assert_eq!(images[0].format, "webp");
        assert_eq!(images[0].source.bytes, "QUJD");
    }

    #[test]
    fn remote_image_urls_are_dropped() {
        let content: Content = serde_json::from_str(
            r#"[{"type":"image_url","image_url":{"url":"https://example.com/x.png"}}]"#,
        )
        .unwrap();
        let (_, images) = content.flatten();
        assert!(images.is_empty());
    }

    #[test]
    fn unknown_blocks_are_tolerated() {
        let content: Content = serde_json::from_str(
            r#"[{"type":"thinking","thinking":"..."},{"type":"text","text":"kept"}]"#,
        )
        .unwrap();
        assert_eq!(content.text(), "kept");
    }

    #[test]
    fn tool_result_content_shapes() {
        assert_eq!(tool_result_text(&serde_json::json!("plain")), "plain");
        assert_eq!(
            tool_result_text(&serde_json::json!([{"type":"text","text":"a"},{"type":"text","text":"b"}])),
            "a\nb"
        );
        assert_eq!(tool_result_text(&Value::Null), "");
    }
}
