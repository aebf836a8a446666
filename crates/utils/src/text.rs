//! Byte-window helpers for prompt sections and test-output excerpts.
//!
//! Every clipped string in the system is a byte window snapped to a UTF-8
//! boundary: head windows for plan/file/needle previews, tail windows for
//! test-output excerpts where the summary sits at the end.

use regex::Regex;

/// Largest char boundary in `content` that is `<= index`.
fn floor_char_boundary(content: &str, index: usize) -> usize {
    if index >= content.len() {
        return content.len();
    }
    let mut at = index;
    while !content.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Smallest char boundary in `content` that is `>= index`.
fn ceil_char_boundary(content: &str, index: usize) -> usize {
    let mut at = index;
    while at < content.len() && !content.is_char_boundary(at) {
        at += 1;
    }
    at
}

/// Clip to at most `max_len` bytes, never splitting a character. The window
/// shrinks rather than rounding up, so the result always fits the limit.
pub fn truncate_to_char_boundary(content: &str, max_len: usize) -> &str {
    &content[..floor_char_boundary(content, max_len)]
}

/// Keep at most the last `max_len` bytes, snapped to a char boundary. Test
/// excerpts use this shape: the failure summary lives at the tail.
pub fn tail_to_char_boundary(content: &str, max_len: usize) -> &str {
    let Some(start) = content.len().checked_sub(max_len) else {
        return content;
    };
    &content[ceil_char_boundary(content, start)..]
}

/// Reduce an arbitrary label to a short filesystem-safe slug.
pub fn file_slug(input: &str) -> String {
    let lower = input.to_lowercase();
    let re = Regex::new(r"[^a-z0-9]+").unwrap();
    let slug = re.replace_all(&lower, "-");
    let trimmed = slug.trim_matches('-');
    let cut: String = trimmed.chars().take(24).collect();
    cut.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needle_previews_clip_to_whole_chars() {
        let needle = "const naïve = doRound(value);";
        let clipped = truncate_to_char_boundary(needle, 12);
        assert!(needle.starts_with(clipped));
        assert!(clipped.len() <= 12);
        assert_eq!(truncate_to_char_boundary(needle, needle.len()), needle);
        assert_eq!(truncate_to_char_boundary("", 8), "");
    }

    #[test]
    fn head_window_shrinks_when_the_limit_lands_mid_char() {
        // "é" is two bytes; a one-byte window cannot hold half of it.
        assert_eq!(truncate_to_char_boundary("épreuve", 1), "");
        assert_eq!(truncate_to_char_boundary("épreuve", 2), "é");
    }

    #[test]
    fn excerpt_tail_keeps_the_summary_line() {
        let output = "long stack trace…\nTests: 1 failed, 2 passed\n";
        let tail = tail_to_char_boundary(output, 30);
        assert!(tail.ends_with("Tests: 1 failed, 2 passed\n"));
        assert!(tail.len() <= 30);
        assert_eq!(tail_to_char_boundary(output, output.len() + 10), output);
    }

    #[test]
    fn tail_window_shrinks_when_the_limit_lands_mid_char() {
        assert_eq!(tail_to_char_boundary("né", 1), "");
        assert_eq!(tail_to_char_boundary("né", 2), "é");
    }

    #[test]
    fn test_file_slug() {
        assert_eq!(file_slug("src/Formatter.js"), "src-formatter-js");
        assert_eq!(file_slug("--weird__label--"), "weird-label");
    }
}
