//! Helpers for keeping mesh-originated text safe and single-line in the logs.
//! Node names and message bodies come straight off the air, so they may carry
//! newlines or control characters.

use std::fmt::Write;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\xNN`
///
/// Output is capped at 300 characters with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escaped preview of at most `max_bytes` of `input`, cut on a char boundary.
pub fn preview(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// First `max` bytes of a buffer as lowercase hex, for trace logging of raw frames.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    hex::encode(&data[..data.len().min(max)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_controls() {
        let esc = escape_log("Line1\nLine2\r\tEnd\u{7}");
        assert_eq!(esc, "Line1\\nLine2\\r\\tEnd\\x07");
    }

    #[test]
    fn preview_never_splits_multibyte_chars() {
        let s = "héllo wörld ünïcode";
        let p = preview(s, 8);
        assert!(p.ends_with("..."));
        assert!(p.len() <= 8 + 2);
        assert_eq!(preview("short", 64), "short");
    }

    #[test]
    fn hex_snippet_truncates() {
        assert_eq!(hex_snippet(&[0x94, 0xc3, 0x00, 0x01], 2), "94c3");
    }
}
