//! Boundary-aware, overlapping transcript chunker.
//!
//! Splits a transcript into [`TextChunk`]s sized for embedding and lexical
//! indexing. Splitting happens on conversational boundaries so a chunk
//! never ends mid-thought.
//!
//! # Algorithm
//!
//! 1. Every non-empty line is a speaker turn; within a turn, sentences end
//!    after `.`, `?` or `!` (plus trailing quotes or brackets) followed by
//!    whitespace. These sentence spans are the boundary units.
//! 2. In [`ChunkUnit::Sentences`] mode, greedily pack whole units into a
//!    window until the next one would exceed `max_len`, then close the
//!    chunk. The next window starts at the trailing units that fit in
//!    `overlap`, always at least one unit after the previous start.
//! 3. In [`ChunkUnit::Words`] mode, a window takes up to `max_len` words and
//!    ends at the last unit boundary inside it; a unit longer than the
//!    window is hard-split on word boundaries. The next window starts at the
//!    first unit boundary within the last `overlap` words, or exactly
//!    `overlap` words back when no boundary falls there.
//!
//! With `overlap > 0`, consecutive chunks always share text.
//!
//! Chunk text is the exact slice of the transcript between its first and
//! last unit, so every non-whitespace byte lands in at least one chunk.
//! The function is pure: the same text and configuration always yield the
//! same boundaries.
//!
//! # Example
//!
//! ```rust
//! use transcript_retrieval_core::chunk::{chunk_transcript, ChunkUnit, ChunkingConfig};
//!
//! let config = ChunkingConfig { unit: ChunkUnit::Sentences, max_len: 2, overlap: 1 };
//! let chunks = chunk_transcript("Rep: Hi. Buyer: Hello. Rep: Pricing?", &config);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].text, "Rep: Hi. Buyer: Hello.");
//! assert_eq!(chunks[1].text, "Buyer: Hello. Rep: Pricing?");
//! ```

use serde::{Deserialize, Serialize};

use crate::models::hash_text;

/// How window and overlap lengths are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkUnit {
    Sentences,
    Words,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub unit: ChunkUnit,
    /// Maximum window length, in `unit`s.
    pub max_len: usize,
    /// Length shared between consecutive windows, in `unit`s.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            unit: ChunkUnit::Sentences,
            max_len: 8,
            overlap: 1,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_len == 0 {
            anyhow::bail!("chunking.max_len must be > 0");
        }
        if self.overlap >= self.max_len {
            anyhow::bail!(
                "chunking.overlap ({}) must be shorter than chunking.max_len ({})",
                self.overlap,
                self.max_len
            );
        }
        Ok(())
    }
}

/// One chunk of transcript text, before it becomes a stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub chunk_index: i64,
    pub text: String,
    /// Byte offset of the first character in the transcript.
    pub start_offset: usize,
    /// Byte offset one past the last character.
    pub end_offset: usize,
    pub hash: String,
}

/// A boundary unit: a byte span plus its word count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    words: usize,
}

/// Split a transcript into ordered, overlapping chunks.
///
/// # Guarantees
///
/// - Empty or whitespace-only text yields no chunks.
/// - Text that fits one window yields exactly one chunk.
/// - Indices are contiguous: `0, 1, …, N-1`.
pub fn chunk_transcript(text: &str, config: &ChunkingConfig) -> Vec<TextChunk> {
    let max_len = config.max_len.max(1);
    let overlap = config.overlap.min(max_len - 1);

    let units = segment(text);
    if units.is_empty() {
        return Vec::new();
    }
    match config.unit {
        ChunkUnit::Sentences => chunk_sentences(text, &units, max_len, overlap),
        ChunkUnit::Words => chunk_words(text, &units, max_len, overlap),
    }
}

fn chunk_sentences(text: &str, units: &[Span], max_len: usize, overlap: usize) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + max_len).min(units.len());
        chunks.push(make_chunk(
            text,
            chunks.len() as i64,
            units[start].start,
            units[end - 1].end,
        ));
        if end >= units.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

fn chunk_words(text: &str, units: &[Span], max_len: usize, overlap: usize) -> Vec<TextChunk> {
    let words: Vec<(usize, usize)> = units
        .iter()
        .flat_map(|u| word_spans(text, u.start, u.end))
        .collect();

    // boundary[k]: a unit ends right before word k.
    let mut boundary = vec![false; words.len() + 1];
    let mut seen = 0usize;
    for unit in units {
        seen += unit.words;
        boundary[seen.min(words.len())] = true;
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    // First word the previous chunk did not cover.
    let mut fresh = 0usize;

    loop {
        let limit = (start + max_len).min(words.len());
        // Never end inside the shared words; with overlap, span two words or more.
        let mut lo = fresh + 1;
        if overlap > 0 {
            lo = lo.max(start + 2);
        }
        let end = (lo..=limit).rev().find(|&k| boundary[k]).unwrap_or(limit);
        chunks.push(make_chunk(
            text,
            chunks.len() as i64,
            words[start].0,
            words[end - 1].1,
        ));
        if end >= words.len() {
            break;
        }
        let floor = end.saturating_sub(overlap).max(start + 1);
        start = (floor..end).find(|&k| boundary[k]).unwrap_or(floor);
        fresh = end;
    }

    chunks
}

fn make_chunk(text: &str, index: i64, start: usize, end: usize) -> TextChunk {
    let slice = &text[start..end];
    TextChunk {
        chunk_index: index,
        text: slice.to_string(),
        start_offset: start,
        end_offset: end,
        hash: hash_text(slice),
    }
}

/// Split text into sentence spans, treating each line as a speaker turn.
fn segment(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut line_start = 0usize;

    for line in text.split_inclusive('\n') {
        segment_line(text, line_start, line_start + line.len(), &mut spans);
        line_start += line.len();
    }

    spans
}

fn segment_line(text: &str, from: usize, to: usize, spans: &mut Vec<Span>) {
    let line = &text[from..to];
    let mut sentence_start: Option<usize> = None;
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if sentence_start.is_none() {
            if c.is_whitespace() {
                continue;
            }
            sentence_start = Some(i);
        }

        if matches!(c, '.' | '?' | '!') {
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if matches!(next, '.' | '?' | '!' | '"' | '\'' | ')' | ']' | '”' | '’') {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let at_boundary = chars.peek().map_or(true, |&(_, next)| next.is_whitespace());
            if at_boundary {
                if let Some(s) = sentence_start.take() {
                    push_span(text, from + s, from + end, spans);
                }
            }
        }
    }

    if let Some(s) = sentence_start {
        let tail = line[s..].trim_end();
        if !tail.is_empty() {
            push_span(text, from + s, from + s + tail.len(), spans);
        }
    }
}

fn push_span(text: &str, start: usize, end: usize, spans: &mut Vec<Span>) {
    let words = text[start..end].split_whitespace().count();
    if words > 0 {
        spans.push(Span { start, end, words });
    }
}

fn word_spans(text: &str, from: usize, to: usize) -> Vec<(usize, usize)> {
    let mut words = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, c) in text[from..to].char_indices() {
        match (c.is_whitespace(), word_start) {
            (false, None) => word_start = Some(i),
            (true, Some(s)) => {
                words.push((from + s, from + i));
                word_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = word_start {
        words.push((from + s, to));
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(max_len: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            unit: ChunkUnit::Sentences,
            max_len,
            overlap,
        }
    }

    fn words(max_len: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            unit: ChunkUnit::Words,
            max_len,
            overlap,
        }
    }

    fn numbered_sentences(n: usize) -> String {
        (1..=n)
            .map(|i| format!("Sentence number {}.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Every non-whitespace byte must fall inside some chunk.
    fn assert_covers(text: &str, chunks: &[TextChunk]) {
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                continue;
            }
            assert!(
                chunks.iter().any(|ch| ch.start_offset <= i && i < ch.end_offset),
                "byte {} ({:?}) not covered",
                i,
                c
            );
        }
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_transcript("", &sentences(4, 1)).is_empty());
        assert!(chunk_transcript("  \n\t \n", &sentences(4, 1)).is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_transcript("Rep: Thanks for joining.", &sentences(4, 1));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Rep: Thanks for joining.");
    }

    #[test]
    fn test_twelve_sentences_window_four_overlap_one() {
        let text = numbered_sentences(12);
        let chunks = chunk_transcript(&text, &sentences(4, 1));
        assert_eq!(chunks.len(), 4);

        let expect = [(1, 4), (4, 7), (7, 10), (10, 12)];
        for (chunk, (first, last)) in chunks.iter().zip(expect) {
            assert!(
                chunk.text.starts_with(&format!("Sentence number {}.", first)),
                "chunk {} = {:?}",
                chunk.chunk_index,
                chunk.text
            );
            assert!(chunk.text.ends_with(&format!("Sentence number {}.", last)));
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn test_speaker_turns_are_boundaries() {
        let text = "Rep: So what is your budget\nBuyer: Around fifty thousand\nRep: Great";
        let chunks = chunk_transcript(text, &sentences(1, 0));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "Rep: So what is your budget");
        assert_eq!(chunks[1].text, "Buyer: Around fifty thousand");
        assert_eq!(chunks[2].text, "Rep: Great");
    }

    #[test]
    fn test_abbreviation_style_dots_do_not_split_inside_tokens() {
        let text = "We priced it at 4.5 per seat. That works.";
        let chunks = chunk_transcript(text, &sentences(1, 0));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "We priced it at 4.5 per seat.");
    }

    #[test]
    fn test_word_windows_with_overlap() {
        let text = "One two three. Four five six. Seven eight nine. Ten eleven twelve.";
        let chunks = chunk_transcript(text, &words(6, 3));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "One two three. Four five six.");
        assert_eq!(chunks[1].text, "Four five six. Seven eight nine.");
        assert_eq!(chunks[2].text, "Seven eight nine. Ten eleven twelve.");
    }

    #[test]
    fn test_word_overlap_inside_a_long_sentence() {
        let text = "One two three four five. Six seven eight nine ten. \
                    Eleven twelve thirteen fourteen fifteen.";
        let chunks = chunk_transcript(text, &words(10, 3));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "One two three four five. Six seven eight nine ten.");
        assert_eq!(
            chunks[1].text,
            "eight nine ten. Eleven twelve thirteen fourteen fifteen."
        );
    }

    #[test]
    fn test_positive_overlap_always_shares_text() {
        let text = (0..30)
            .map(|i| {
                let len = 1 + (i * 7) % 13;
                let body = vec!["word"; len].join(" ");
                format!("Speaker {}: {} {}.", i % 2, body, i)
            })
            .collect::<Vec<_>>()
            .join("\n");
        for config in [words(10, 3), words(6, 1), words(20, 5), sentences(3, 1), sentences(5, 4)] {
            let chunks = chunk_transcript(&text, &config);
            assert!(chunks.len() > 1, "{:?}", config);
            for pair in chunks.windows(2) {
                assert!(
                    pair[1].start_offset < pair[0].end_offset,
                    "{:?}: chunk {} does not overlap chunk {}",
                    config,
                    pair[1].chunk_index,
                    pair[0].chunk_index
                );
                assert!(pair[1].start_offset > pair[0].start_offset);
            }
        }
    }

    #[test]
    fn test_oversized_sentence_is_hard_split() {
        let text = "a b c d e f g h i j";
        let chunks = chunk_transcript(text, &words(4, 0));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "a b c d");
        assert_eq!(chunks[1].text, "e f g h");
        assert_eq!(chunks[2].text, "i j");
        assert_covers(text, &chunks);
    }

    #[test]
    fn test_coverage_and_contiguous_indices() {
        let text = (0..40)
            .map(|i| format!("Speaker {}: point {} about pricing! Really? Yes.", i % 2, i))
            .collect::<Vec<_>>()
            .join("\n");
        for config in [sentences(5, 2), sentences(3, 0), words(17, 4), words(9, 8)] {
            let chunks = chunk_transcript(&text, &config);
            assert!(!chunks.is_empty());
            assert_covers(&text, &chunks);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.chunk_index, i as i64);
                assert_eq!(&text[c.start_offset..c.end_offset], c.text);
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let text = numbered_sentences(25);
        let c1 = chunk_transcript(&text, &sentences(6, 2));
        let c2 = chunk_transcript(&text, &sentences(6, 2));
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_multibyte_text() {
        let text = "Käufer: Das kostet 5 €. Verkäufer: Verstanden… ok? ✓ done";
        let chunks = chunk_transcript(text, &words(3, 1));
        assert!(!chunks.is_empty());
        assert_covers(text, &chunks);
    }

    #[test]
    fn test_overlap_is_clamped_below_window() {
        let text = numbered_sentences(6);
        let chunks = chunk_transcript(&text, &sentences(2, 5));
        assert_eq!(chunks.len(), 5);
        assert_covers(&text, &chunks);
    }

    #[test]
    fn test_validate() {
        assert!(sentences(4, 1).validate().is_ok());
        assert!(sentences(0, 0).validate().is_err());
        assert!(sentences(4, 4).validate().is_err());
    }
}
