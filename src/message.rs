// message.rs - Message Decomposition and Command Argument Parsing
// Reconstitutes the full plain text and the ordered image locators from a
// Discord message, and isolates the user's question from the surrounding
// command syntax.
//
// Key Features:
// - Decodes a heterogeneous message once at the boundary into a closed set
//   of MessagePart variants (Text / Image / Other)
// - Order-preserving text concatenation and image locator collection
// - Marker-optional command parsing that tolerates extra whitespace and
//   newlines in the argument tail
//
// Used by: solve.rs (question assembly)

use regex::Regex;
use serenity::model::channel::{Attachment, Message};

/// One component of an incoming message, decoded once so the rest of the
/// pipeline never probes platform-specific attachment shapes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    /// A text-bearing component, in natural reading order.
    Text(String),
    /// An image locator (URL or path).
    Image(String),
    /// Anything else (non-image attachments, unsupported components).
    Other,
}

/// Decode a Discord message into ordered parts: the message body first,
/// then embed text, then attachments in upload order.
pub fn decode_message(msg: &Message) -> Vec<MessagePart> {
    let mut parts = Vec::new();

    if !msg.content.is_empty() {
        parts.push(MessagePart::Text(msg.content.clone()));
    }

    for embed in &msg.embeds {
        if let Some(title) = &embed.title {
            if !title.is_empty() {
                parts.push(MessagePart::Text(title.clone()));
            }
        }
        if let Some(description) = &embed.description {
            if !description.is_empty() {
                parts.push(MessagePart::Text(description.clone()));
            }
        }
    }

    for attachment in &msg.attachments {
        if is_image_attachment(attachment) {
            parts.push(MessagePart::Image(attachment.url.clone()));
        } else {
            parts.push(MessagePart::Other);
        }
    }

    parts
}

/// An attachment counts as an image when any of the fields Discord may or
/// may not populate says so: the declared content type, the filename
/// extension, or the URL extension.
fn is_image_attachment(attachment: &Attachment) -> bool {
    if let Some(content_type) = &attachment.content_type {
        if content_type.starts_with("image/") {
            return true;
        }
    }
    if mime_guess::from_path(&attachment.filename)
        .first()
        .map(|m| m.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(false)
    {
        return true;
    }
    // Strip query parameters before guessing from the URL path.
    let url_path = attachment.url.split('?').next().unwrap_or("");
    mime_guess::from_path(url_path)
        .first()
        .map(|m| m.type_() == mime_guess::mime::IMAGE)
        .unwrap_or(false)
}

/// Concatenate every text-bearing part in order, with no separators beyond
/// simple concatenation. Non-text parts are skipped.
pub fn collect_plain_text(parts: &[MessagePart]) -> String {
    let mut text = String::new();
    for part in parts {
        if let MessagePart::Text(t) = part {
            text.push_str(t);
        }
    }
    text
}

/// Collect every image locator in order.
pub fn collect_image_urls(parts: &[MessagePart]) -> Vec<String> {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Image(url) => Some(url.clone()),
            _ => None,
        })
        .collect()
}

/// Find the first occurrence of `cmd` (with or without a leading command
/// marker) bounded by a word boundary and preceded by whitespace or
/// start-of-string, and return everything after it, trimmed. The tail may
/// span multiple lines. Returns None when the command does not appear.
fn text_after_command(raw: &str, cmd: &str) -> Option<String> {
    let pattern = format!(r"(?s)(^|\s)[/\^!]?{}\b(.*)$", regex::escape(cmd));
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(raw)?;
    Some(caps.get(2).map(|m| m.as_str()).unwrap_or("").trim().to_string())
}

/// Extract the question text after a command keyword; when the command is
/// not found, the whole trimmed text is treated as the argument.
pub fn extract_text_after_command(raw: &str, cmd: &str) -> String {
    text_after_command(raw, cmd).unwrap_or_else(|| raw.trim().to_string())
}

/// Like extract_text_after_command but tries each command alias in order,
/// falling back to the trimmed input when none matches.
pub fn extract_command_argument(raw: &str, cmds: &[&str]) -> String {
    for cmd in cmds {
        if let Some(tail) = text_after_command(raw, cmd) {
            return tail;
        }
    }
    raw.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_plain_text_preserves_order() {
        let parts = vec![
            MessagePart::Text("first ".to_string()),
            MessagePart::Image("https://cdn.example/a.png".to_string()),
            MessagePart::Text("second".to_string()),
            MessagePart::Other,
            MessagePart::Text(" third".to_string()),
        ];
        assert_eq!(collect_plain_text(&parts), "first second third");
    }

    #[test]
    fn test_collect_plain_text_empty_when_no_text_parts() {
        let parts = vec![MessagePart::Other, MessagePart::Image("x.png".to_string())];
        assert_eq!(collect_plain_text(&parts), "");
    }

    #[test]
    fn test_collect_image_urls_in_order_and_skips_others() {
        let parts = vec![
            MessagePart::Image("https://cdn.example/a.png".to_string()),
            MessagePart::Text("between".to_string()),
            MessagePart::Other,
            MessagePart::Image("https://cdn.example/b.jpg".to_string()),
        ];
        assert_eq!(
            collect_image_urls(&parts),
            vec![
                "https://cdn.example/a.png".to_string(),
                "https://cdn.example/b.jpg".to_string()
            ]
        );
    }

    #[test]
    fn test_extract_with_slash_marker() {
        assert_eq!(
            extract_text_after_command("/g   solve x^2+1=0", "g"),
            "solve x^2+1=0"
        );
    }

    #[test]
    fn test_extract_marker_optional() {
        // With and without a marker must give identical results.
        assert_eq!(
            extract_text_after_command("g   solve x^2+1=0", "g"),
            "solve x^2+1=0"
        );
        assert_eq!(
            extract_text_after_command("^g solve x^2+1=0", "g"),
            "solve x^2+1=0"
        );
    }

    #[test]
    fn test_extract_tail_spans_multiple_lines() {
        let raw = "/solve find the roots\nof x^2 - 4 = 0\nand explain";
        assert_eq!(
            extract_text_after_command(raw, "solve"),
            "find the roots\nof x^2 - 4 = 0\nand explain"
        );
    }

    #[test]
    fn test_extract_mid_text_needs_word_boundary() {
        // "g" embedded in another word must not match; the whole text is the
        // argument then.
        assert_eq!(extract_text_after_command("bag of apples", "g"), "bag of apples");
    }

    #[test]
    fn test_extract_no_match_returns_trimmed_input() {
        assert_eq!(
            extract_text_after_command("  just a question  ", "solve"),
            "just a question"
        );
    }

    #[test]
    fn test_extract_command_argument_tries_aliases() {
        assert_eq!(
            extract_command_argument("^g integrate sin(x)", &["solve", "g"]),
            "integrate sin(x)"
        );
        assert_eq!(
            extract_command_argument("no keyword here", &["solve", "g"]),
            "no keyword here"
        );
    }
}
