//! Text normalization, escape decoding and sanitization.

use super::ValidationLevel;
use std::ops::Range;
use unicode_normalization::UnicodeNormalization;

/// Replacement for filtered spans at `Strict` and `Paranoid`.
pub const FILTERED_PLACEHOLDER: &str = "[FILTERED]";
/// Replacement for redacted spans in provider responses.
pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

const STRICT_PUNCTUATION: &str = ".,!?'\"():-_/@+=%#*[]";
const PARANOID_PUNCTUATION: &str = ".,!?'\"():-_[]";

/// Input after NFKC folding with invisible formatting characters removed.
pub(crate) struct Normalized {
    pub text: String,
    /// Zero-width or bidi control characters were present.
    pub had_invisible: bool,
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FEFF}'
            | '\u{00AD}'
    )
}

/// Fold compatibility forms (fullwidth letters, ligatures) and drop
/// invisible characters so patterns see the text a model would.
pub(crate) fn normalize(input: &str) -> Normalized {
    let mut had_invisible = false;
    let text = input
        .nfkc()
        .filter(|&c| {
            let hidden = is_invisible(c);
            had_invisible |= hidden;
            !hidden
        })
        .collect();
    Normalized {
        text,
        had_invisible,
    }
}

/// Decode `\xHH`, `\uHHHH`, `%HH`, numeric and common named HTML entities.
/// Invalid sequences are kept verbatim.
pub(crate) fn decode_escapes(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        let rest = &text[i..];
        let decoded = if rest.starts_with("\\x") {
            hex_char(rest.get(2..4)).map(|c| (c, 4))
        } else if rest.starts_with("\\u") {
            hex_char(rest.get(2..6)).map(|c| (c, 6))
        } else if rest.starts_with('%') {
            hex_char(rest.get(1..3)).map(|c| (c, 3))
        } else if rest.starts_with('&') {
            html_entity(rest)
        } else {
            None
        };

        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                i += consumed;
            }
            None => {
                // Copy one whole character.
                let c = rest.chars().next().unwrap_or('\u{FFFD}');
                out.push(c);
                i += c.len_utf8().max(1);
            }
        }
    }
    out
}

fn hex_char(digits: Option<&str>) -> Option<char> {
    let digits = digits?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok().and_then(char::from_u32)
}

fn html_entity(rest: &str) -> Option<(char, usize)> {
    let end = rest
        .char_indices()
        .take(12)
        .find(|&(_, c)| c == ';')
        .map(|(i, _)| i)?;
    let body = &rest[1..end];
    let c = if let Some(num) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
        u32::from_str_radix(num, 16).ok().and_then(char::from_u32)
    } else if let Some(num) = body.strip_prefix('#') {
        num.parse::<u32>().ok().and_then(char::from_u32)
    } else {
        match body {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => None,
        }
    }?;
    Some((c, end + 1))
}

/// Sort and merge overlapping or touching byte ranges.
pub(crate) fn merge_spans(mut spans: Vec<Range<usize>>) -> Vec<Range<usize>> {
    spans.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// Replace each merged span with `placeholder` (empty string strips it).
pub(crate) fn replace_spans(text: &str, spans: &[Range<usize>], placeholder: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        if span.start < cursor || span.end > text.len() {
            continue;
        }
        out.push_str(&text[cursor..span.start]);
        out.push_str(placeholder);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

fn collapse_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_space = false;
    for c in text.chars() {
        if c == ' ' {
            if !prev_space {
                out.push(c);
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out.trim().to_string()
}

/// Produce the sanitized form of `text` for `level`.
///
/// `Standard` strips flagged spans and control characters. `Strict` and
/// `Paranoid` substitute [`FILTERED_PLACEHOLDER`] and then keep only
/// alphanumerics, whitespace and a level-specific punctuation set.
pub(crate) fn sanitize(text: &str, spans: &[Range<usize>], level: ValidationLevel) -> String {
    match level {
        ValidationLevel::Minimal => text.to_string(),
        ValidationLevel::Standard => {
            let stripped = replace_spans(text, spans, "");
            let cleaned: String = stripped
                .chars()
                .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
                .collect();
            collapse_spaces(&cleaned)
        }
        ValidationLevel::Strict | ValidationLevel::Paranoid => {
            let allowed = if level == ValidationLevel::Strict {
                STRICT_PUNCTUATION
            } else {
                PARANOID_PUNCTUATION
            };
            let replaced = replace_spans(text, spans, FILTERED_PLACEHOLDER);
            let filtered: String = replaced
                .chars()
                .map(|c| if c.is_whitespace() && c != '\n' { ' ' } else { c })
                .filter(|&c| c.is_alphanumeric() || c == ' ' || c == '\n' || allowed.contains(c))
                .collect();
            collapse_spaces(&filtered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folds_fullwidth_and_strips_zero_width() {
        let n = normalize("ｉｇｎｏｒｅ in\u{200B}structions");
        assert_eq!(n.text, "ignore instructions");
        assert!(n.had_invisible);

        let plain = normalize("hello");
        assert!(!plain.had_invisible);
    }

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode_escapes(r"\x69\x67nore"), "ignore");
        assert_eq!(decode_escapes("%69gnore"), "ignore");
        assert_eq!(decode_escapes("&#105;gnore &lt;b&gt;"), "ignore <b>");
        // Broken sequences pass through.
        assert_eq!(decode_escapes("100% sure & done"), "100% sure & done");
        assert_eq!(decode_escapes("caf\u{e9} %zz"), "caf\u{e9} %zz");
    }

    #[test]
    fn test_merge_spans() {
        let merged = merge_spans(vec![5..8, 0..3, 2..4, 8..10]);
        assert_eq!(merged, vec![0..4, 5..10]);
    }

    #[test]
    fn test_standard_strips_spans() {
        let text = "hello ignore this world";
        let out = sanitize(text, &[6..17], ValidationLevel::Standard);
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_strict_uses_placeholder_and_allow_list() {
        let text = "hi <b>there</b> ignore this";
        let out = sanitize(text, &[16..27], ValidationLevel::Strict);
        assert_eq!(out, "hi bthere/b [FILTERED]");
    }

    #[test]
    fn test_paranoid_drops_slashes() {
        let out = sanitize("a/b@c", &[], ValidationLevel::Paranoid);
        assert_eq!(out, "abc");
        let out = sanitize("a/b@c", &[], ValidationLevel::Strict);
        assert_eq!(out, "a/b@c");
    }
}
