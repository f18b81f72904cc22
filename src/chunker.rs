// Markdown Chunker
//
// Splits note text into retrieval-sized chunks at markdown heading
// boundaries, falling back to blank-line paragraph boundaries, then greedily
// merges adjacent sections back together while they fit. Lengths are counted
// in characters, matching how note content is truncated elsewhere.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref HEADING_RE: Regex = Regex::new(r"(?m)^#{1,6}\s").expect("valid heading regex");
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Short texts (<= `max_chars`) are returned as a single trimmed chunk.
/// Longer texts are split at `#`-headings; tiny adjacent sections are merged
/// so that every chunk has a reasonable size. When no structural boundary
/// exists at all, the whole trimmed text is returned as one chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let mut sections = split_at_headings(text);
    if sections.len() <= 1 {
        // No headings, fall back to paragraph boundaries
        sections = text
            .split("\n\n")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if sections.len() <= 1 {
        return vec![text.to_string()];
    }

    // Merge small adjacent sections, joining with a blank line
    let mut chunks: Vec<String> = Vec::new();
    let mut current = sections[0].clone();
    let mut current_len = char_len(&current);
    for section in &sections[1..] {
        let section_len = char_len(section);
        if current_len + section_len + 2 <= max_chars {
            current.push_str("\n\n");
            current.push_str(section);
            current_len += section_len + 2;
        } else {
            chunks.push(std::mem::replace(&mut current, section.clone()));
            current_len = section_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    if chunks.is_empty() {
        vec![text.to_string()]
    } else {
        chunks
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split at the start of every markdown heading line, keeping the heading
/// with its section. Sections are trimmed; empty ones are discarded.
fn split_at_headings(text: &str) -> Vec<String> {
    let mut boundaries: Vec<usize> = HEADING_RE.find_iter(text).map(|m| m.start()).collect();
    if boundaries.first() != Some(&0) {
        boundaries.insert(0, 0);
    }
    boundaries.push(text.len());

    boundaries
        .windows(2)
        .map(|w| text[w[0]..w[1]].trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
