//! Output truncation helpers.
//!
//! Scheduled commands can print without bound, and every captured byte ends
//! up in the execution log. Two shapes are offered: [`truncate_middle`] keeps
//! both ends of the text (command output, where the tail holds the final
//! error), and [`truncate_head`] keeps only the beginning (HTTP bodies).
//! Both count characters, never bytes, so multi-byte text is never split.

/// Default maximum characters before truncation kicks in (30 000).
pub const DEFAULT_MAX_CHARS: usize = 30_000;

/// Keep the first and last `max_chars / 2` characters of `text`.
///
/// ```text
/// <head>
///
/// ... [OUTPUT TRUNCATED: N chars omitted] ...
///
/// <tail>
/// ```
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head}\n\n... [OUTPUT TRUNCATED: {omitted} chars omitted] ...\n\n{tail}")
}

/// Keep the first `max_chars` characters of `text`, noting how many were cut.
pub fn truncate_head(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... [truncated {} chars]", total - max_chars)
}
