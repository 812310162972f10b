//! Block chunking: slices assistant text into transport-sized pieces.
//!
//! Mid-stream, a pending buffer that reaches `max_chars` is cut at the
//! best available break inside the window: a paragraph or newline
//! separator anywhere before `max_chars`, a sentence end or whitespace
//! past `min_chars`, or a hard split. At a forced flush (message end),
//! the buffer is split at every separator of the preferred tier so
//! paragraphs survive as natural delivery units.

use crate::config::{BreakPreference, ChunkingConfig};

/// Largest byte index `<= index` that lies on a char boundary.
pub(crate) fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn tiers(preference: BreakPreference) -> &'static [BreakPreference] {
    match preference {
        BreakPreference::Paragraph => &[
            BreakPreference::Paragraph,
            BreakPreference::Newline,
            BreakPreference::Sentence,
        ],
        BreakPreference::Newline => &[BreakPreference::Newline, BreakPreference::Sentence],
        BreakPreference::Sentence => &[BreakPreference::Sentence],
    }
}

/// Cut position after the last sentence end (`.`/`!`/`?` followed by
/// whitespace or the window edge) at or past `min`.
fn last_sentence_end(window: &str, min: usize) -> Option<usize> {
    let mut best = None;
    for (i, c) in window.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let cut = i + c.len_utf8();
            let next = window[cut..].chars().next();
            if (next.is_none() || next.is_some_and(char::is_whitespace)) && cut >= min {
                best = Some(cut);
            }
        }
    }
    best
}

/// Find the cut position for a buffer of at least `max_chars` bytes.
///
/// The returned index is in `[1, max_chars]` and on a char boundary;
/// `text[..cut]` is the chunk and `text[cut..]` the remainder. Paragraph
/// and newline separators are natural unit boundaries and are taken
/// anywhere in the window; sentence and whitespace cuts honor the
/// `min_chars` floor.
pub fn find_cut(text: &str, cfg: &ChunkingConfig) -> usize {
    let max = floor_char_boundary(text, cfg.max_chars.max(1));
    let min = floor_char_boundary(text, cfg.min_chars.min(max));
    let window = &text[..max];

    for tier in tiers(cfg.break_preference) {
        let cut = match tier {
            BreakPreference::Paragraph => window.rfind("\n\n").filter(|&p| p > 0),
            BreakPreference::Newline => window.rfind('\n').filter(|&p| p > 0),
            BreakPreference::Sentence => last_sentence_end(window, min.max(1)),
        };
        if let Some(cut) = cut {
            return cut;
        }
    }

    // Last whitespace past min, else a hard split at max.
    if let Some(p) = window
        .char_indices()
        .filter(|(p, c)| c.is_whitespace() && *p >= min && *p > 0)
        .map(|(p, _)| p)
        .next_back()
    {
        return p;
    }
    max
}

/// Split a force-flushed buffer into deliverable blocks.
///
/// The buffer is split at every separator of the preference tier, so a
/// paragraph-preference reply delivers one block per paragraph. Pieces
/// still over `max_chars` are window-sliced with [`find_cut`]. Empty
/// pieces are dropped and all blocks are whitespace-trimmed.
pub fn split_blocks(text: &str, cfg: &ChunkingConfig) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let parts: Vec<&str> = match cfg.break_preference {
        BreakPreference::Paragraph => trimmed.split("\n\n").collect(),
        BreakPreference::Newline => trimmed.lines().collect(),
        BreakPreference::Sentence => split_sentences(trimmed),
    };

    let mut out = Vec::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.len() <= cfg.max_chars {
            out.push(part.to_string());
            continue;
        }
        let mut rest = part;
        while rest.len() > cfg.max_chars {
            let cut = find_cut(rest, cfg);
            let (chunk, tail) = rest.split_at(cut);
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                out.push(chunk.to_string());
            }
            let tail = tail.trim_start();
            if tail.len() == rest.len() {
                // No progress possible; bail with the remainder as-is.
                break;
            }
            rest = tail;
        }
        let rest = rest.trim();
        if !rest.is_empty() {
            out.push(rest.to_string());
        }
    }
    out
}

/// Split on sentence ends, keeping the terminator with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            let next_ws = chars.peek().is_none_or(|(_, n)| n.is_whitespace());
            if next_ws {
                parts.push(&text[start..end]);
                start = end;
            }
        }
    }
    if start < text.len() {
        parts.push(&text[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min: usize, max: usize, pref: BreakPreference) -> ChunkingConfig {
        ChunkingConfig {
            min_chars: min,
            max_chars: max,
            break_preference: pref,
        }
    }

    #[test]
    fn cut_prefers_paragraph_break() {
        let text = "alpha beta.\n\ngamma delta epsilon zeta eta theta";
        let c = cfg(5, 30, BreakPreference::Paragraph);
        let cut = find_cut(text, &c);
        assert_eq!(&text[..cut], "alpha beta.");
    }

    #[test]
    fn cut_falls_back_to_newline() {
        let text = "alpha beta\ngamma delta epsilon zeta eta theta";
        let c = cfg(5, 30, BreakPreference::Paragraph);
        let cut = find_cut(text, &c);
        assert_eq!(&text[..cut], "alpha beta");
    }

    #[test]
    fn cut_falls_back_to_sentence() {
        let text = "alpha beta. gamma delta epsilon zeta eta theta";
        let c = cfg(5, 30, BreakPreference::Paragraph);
        let cut = find_cut(text, &c);
        assert_eq!(&text[..cut], "alpha beta.");
    }

    #[test]
    fn cut_falls_back_to_whitespace() {
        let text = "alphabetagamma deltaepsilonzetaetatheta";
        let c = cfg(5, 30, BreakPreference::Paragraph);
        let cut = find_cut(text, &c);
        assert_eq!(&text[..cut], "alphabetagamma");
    }

    #[test]
    fn cut_hard_splits_without_any_break() {
        let text = "abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyz";
        let c = cfg(5, 30, BreakPreference::Paragraph);
        assert_eq!(find_cut(text, &c), 30);
    }

    #[test]
    fn paragraph_break_taken_even_below_min() {
        // A short first paragraph is still a natural unit boundary.
        let text = "ab\n\ncdefghijklmnopqrstuvwxyz more words here";
        let c = cfg(10, 30, BreakPreference::Paragraph);
        let cut = find_cut(text, &c);
        assert_eq!(&text[..cut], "ab");
    }

    #[test]
    fn sentence_and_whitespace_cuts_respect_min_chars() {
        // The sentence end sits below min; fall through to whitespace
        // past the floor.
        let text = "Hi. abcdefghijklmnopqrstuvwxyz more words here";
        let c = cfg(10, 30, BreakPreference::Sentence);
        let cut = find_cut(text, &c);
        assert!(cut >= 10, "cut {cut} below min");
    }

    #[test]
    fn cut_lands_on_char_boundary_with_multibyte_text() {
        let text = "héllo wörld çafé ünïcode ẽverywhere indeed";
        let c = cfg(5, 20, BreakPreference::Sentence);
        let cut = find_cut(text, &c);
        assert!(text.is_char_boundary(cut));
    }

    #[test]
    fn split_delivers_one_block_per_paragraph() {
        let c = cfg(20, 400, BreakPreference::Paragraph);
        let blocks = split_blocks("One para.\n\nTwo para.", &c);
        assert_eq!(blocks, vec!["One para.".to_string(), "Two para.".to_string()]);
    }

    #[test]
    fn split_keeps_single_paragraph_whole() {
        let c = cfg(20, 400, BreakPreference::Paragraph);
        let blocks = split_blocks("Just one piece of text here.", &c);
        assert_eq!(blocks, vec!["Just one piece of text here.".to_string()]);
    }

    #[test]
    fn split_oversized_buffer_on_paragraphs() {
        let c = cfg(20, 40, BreakPreference::Paragraph);
        let text = "Line one is here.\n\nLine two follows here.\n\nLine three.";
        let blocks = split_blocks(text, &c);
        assert_eq!(
            blocks,
            vec![
                "Line one is here.".to_string(),
                "Line two follows here.".to_string(),
                "Line three.".to_string(),
            ]
        );
    }

    #[test]
    fn split_window_slices_oversized_paragraph() {
        let c = cfg(5, 20, BreakPreference::Paragraph);
        let text = "word word word word word word word word";
        let blocks = split_blocks(text, &c);
        assert!(blocks.len() > 1);
        for b in &blocks {
            assert!(b.len() <= 20, "block too long: {b:?}");
            assert!(!b.is_empty());
        }
        assert_eq!(blocks.join(" "), text);
    }

    #[test]
    fn split_sentence_preference() {
        let c = cfg(5, 20, BreakPreference::Sentence);
        let blocks = split_blocks("First one. Second two! Third three?", &c);
        assert_eq!(
            blocks,
            vec![
                "First one.".to_string(),
                "Second two!".to_string(),
                "Third three?".to_string(),
            ]
        );
    }

    #[test]
    fn split_drops_empty_pieces() {
        let c = cfg(5, 10, BreakPreference::Paragraph);
        let blocks = split_blocks("a\n\n\n\nb\n\n\n\nccccccccccccc", &c);
        assert!(blocks.iter().all(|b| !b.trim().is_empty()));
    }

    #[test]
    fn split_empty_input_yields_nothing() {
        let c = cfg(5, 10, BreakPreference::Paragraph);
        assert!(split_blocks("", &c).is_empty());
        assert!(split_blocks("   \n ", &c).is_empty());
    }

    #[test]
    fn floor_char_boundary_handles_multibyte() {
        let s = "aé"; // 'é' spans bytes 1..3
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 3), 3);
        assert_eq!(floor_char_boundary(s, 10), 3);
    }
}
