//! Log field helpers for IM traffic. Message bodies go into `content=` fields truncated,
//! on a char boundary since most traffic is CJK.

use std::borrow::Cow;

const CONTENT_LOG_MAX_CHARS: usize = 120;

/// Truncate message content for logging (avoid huge dumps).
pub fn truncate_content(content: &str, max_chars: usize) -> Cow<'_, str> {
    match content.char_indices().nth(max_chars) {
        None => Cow::Borrowed(content),
        Some((cut, _)) => Cow::Owned(format!("{}... ({} bytes)", &content[..cut], content.len())),
    }
}

#[inline]
pub fn truncate_content_default(content: &str) -> Cow<'_, str> {
    truncate_content(content, CONTENT_LOG_MAX_CHARS)
}
