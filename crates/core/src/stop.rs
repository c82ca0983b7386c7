//! Stop-condition text scanning.
//!
//! Generated text accumulates token pieces that may split multi-byte UTF-8
//! characters and stop words across token boundaries. The helpers here
//! decide when text is safe to emit and where a stop word begins.

/// Whether the byte tail of `text` is a truncated multi-byte UTF-8 sequence.
///
/// Scans backwards over at most four bytes: continuation bytes are skipped
/// until a leading byte is found, then the declared sequence length is
/// compared against the bytes actually present.
pub fn ends_with_incomplete_utf8(text: &[u8]) -> bool {
    for i in 1..=4.min(text.len()) {
        let c = text[text.len() - i];
        if (c & 0xC0) == 0x80 {
            // continuation byte: 10xxxxxx
            continue;
        }
        if (c & 0xE0) == 0xC0 {
            // 2-byte lead: 110xxxxx
            return i < 2;
        } else if (c & 0xF0) == 0xE0 {
            // 3-byte lead: 1110xxxx
            return i < 3;
        } else if (c & 0xF8) == 0xF0 {
            // 4-byte lead: 11110xxx
            return i < 4;
        }
        // single-byte character or invalid byte
        return false;
    }
    false
}

/// Byte offset where a full stop word starts in `text`, if any.
///
/// Only the window that the last token could have completed is searched:
/// a stop word can begin at most `stop.len() + last_token_len` bytes from
/// the end.
pub fn find_full_stop<'a>(text: &str, last_token_len: usize, stops: &'a [String]) -> Option<(usize, &'a str)> {
    let mut best: Option<(usize, &str)> = None;
    for stop in stops {
        if stop.is_empty() {
            continue;
        }
        let from = text.len().saturating_sub(stop.len() + last_token_len);
        // walk forward from a char boundary at or before `from`
        let from = floor_char_boundary(text, from);
        if let Some(rel) = text[from..].find(stop.as_str()) {
            let pos = from + rel;
            if best.map_or(true, |(p, _)| pos < p) {
                best = Some((pos, stop.as_str()));
            }
        }
    }
    best
}

/// Byte offset where a partial stop word begins at the end of `text`.
///
/// A partial match means some non-empty proper prefix of a stop word is a
/// suffix of the text; the next token may complete it, so emission past the
/// match start must be withheld.
pub fn find_partial_stop(text: &str, stops: &[String]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for stop in stops {
        let max_len = stop.len().saturating_sub(1).min(text.len());
        for len in (1..=max_len).rev() {
            if !text.is_char_boundary(text.len() - len) {
                continue;
            }
            if text.ends_with(&stop[..prefix_len(stop, len)]) && prefix_len(stop, len) == len {
                let pos = text.len() - len;
                if best.map_or(true, |p| pos < p) {
                    best = Some(pos);
                }
                break;
            }
        }
    }
    best
}

/// Largest prefix of `s` with byte length at most `len` on a char boundary.
fn prefix_len(s: &str, len: usize) -> usize {
    floor_char_boundary(s, len)
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
