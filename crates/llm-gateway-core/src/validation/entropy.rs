//! Statistical checks: token entropy and periodic repetition.

use std::collections::HashMap;
use std::ops::Range;

/// Longest repeating unit considered by [`repeated_run`].
const MAX_REPEAT_UNIT: usize = 32;
/// Characters scanned for repetition; longer inputs are checked on a prefix.
const MAX_REPEAT_SCAN: usize = 8_192;
/// Shortest periodic run reported.
pub(crate) const MIN_REPEAT_SPAN: usize = 128;
/// Fewest full repetitions of the unit within the run.
pub(crate) const MIN_REPEAT_COUNT: usize = 8;

/// Shannon entropy of `s` in bits per character.
pub(crate) fn shannon_entropy(s: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in s.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Byte ranges of whitespace-separated tokens at least `min_chars` long whose
/// entropy reaches `threshold`.
pub(crate) fn high_entropy_tokens(text: &str, min_chars: usize, threshold: f64) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    let check = |from: usize, to: usize, spans: &mut Vec<Range<usize>>| {
        let token = &text[from..to];
        if token.chars().count() >= min_chars && shannon_entropy(token) >= threshold {
            spans.push(from..to);
        }
    };

    for (idx, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(from) = start.take() {
                check(from, idx, &mut spans);
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(from) = start {
        check(from, text.len(), &mut spans);
    }
    spans
}

/// First periodic run in `text` with a unit of at most 32 characters that
/// spans `min_span` characters and repeats the unit `min_repeats` times.
pub(crate) fn repeated_run(text: &str, min_span: usize, min_repeats: usize) -> Option<Range<usize>> {
    let chars: Vec<(usize, char)> = text.char_indices().take(MAX_REPEAT_SCAN).collect();
    let n = chars.len();
    if n < min_span {
        return None;
    }

    for unit in 1..=MAX_REPEAT_UNIT.min(n / 2) {
        let mut run = 0usize;
        let mut found: Option<usize> = None;

        for i in 0..n - unit {
            if chars[i].1 == chars[i + unit].1 {
                run += 1;
            } else {
                if let Some(start) = found {
                    // Run covered positions [start, i + unit).
                    let (last_idx, last_char) = chars[i + unit - 1];
                    return Some(chars[start].0..last_idx + last_char.len_utf8());
                }
                run = 0;
                continue;
            }

            // Positions i + 1 - run ..= i + unit share period `unit`.
            let len = run + unit;
            if found.is_none() && len >= min_span && len / unit >= min_repeats {
                found = Some(i + 1 - run);
            }
        }

        if let Some(start) = found {
            let (last_idx, last_char) = chars[n - 1];
            return Some(chars[start].0..last_idx + last_char.len_utf8());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_bounds() {
        assert_eq!(shannon_entropy(""), 0.0);
        assert_eq!(shannon_entropy("aaaa"), 0.0);
        assert!((shannon_entropy("ab") - 1.0).abs() < 1e-9);
        assert!((shannon_entropy("abcd") - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_random_token_is_flagged() {
        let text = "key Zq8xK2mP9vL4nR7tW1yB6cF3hJ5sD0gA9eU2iO8 done";
        let spans = high_entropy_tokens(text, 32, 4.5);
        assert_eq!(spans.len(), 1);
        assert!(text[spans[0].clone()].starts_with("Zq8x"));
    }

    #[test]
    fn test_prose_is_not_high_entropy() {
        let text = "The quick brown fox jumps over the lazy dog repeatedly today.";
        assert!(high_entropy_tokens(text, 32, 4.5).is_empty());
    }

    #[test]
    fn test_repetition_found_with_span() {
        let text = format!("start {} end", "ab".repeat(100));
        let span = repeated_run(&text, MIN_REPEAT_SPAN, MIN_REPEAT_COUNT).unwrap();
        assert!(text[span.clone()].starts_with("abab"));
        assert!(span.len() >= 200);
        assert!(!text[span].contains("end"));
    }

    #[test]
    fn test_short_or_varied_text_has_no_repetition() {
        assert!(repeated_run("hello world", MIN_REPEAT_SPAN, MIN_REPEAT_COUNT).is_none());
        let prose = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod \
                     tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam.";
        assert!(repeated_run(prose, MIN_REPEAT_SPAN, MIN_REPEAT_COUNT).is_none());
    }
}
