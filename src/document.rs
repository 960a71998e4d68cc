//! Document data model and text chunking.
//!
//! A [`Document`] is an immutable uploaded text; the [`Chunker`] splits it
//! into overlapping [`Chunk`]s by one of three strategies. Chunk offsets are
//! character offsets into the owning document's content (half-open), so
//! multi-byte UTF-8 content never splits mid-character.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// 16 lowercase hex characters, locally generated.
pub fn new_hex_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub file_name: String,
    pub content: String,
    pub char_count: usize,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: new_hex_id(),
            file_name: file_name.into(),
            char_count: content.chars().count(),
            content,
            uploaded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub document_name: String,
    pub content: String,
    pub start_index: usize,
    pub end_index: usize,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChunkingStrategy {
    #[serde(alias = "fixed_size")]
    FixedSize,
    Sentence,
    Paragraph,
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::FixedSize
    }
}

/// Splits a document into an ordered list of chunks.
///
/// `size` is the target chunk length in characters; `overlap` is the number
/// of characters (approximate for sentence/paragraph strategies) shared
/// between consecutive chunks.
pub struct Chunker {
    strategy: ChunkingStrategy,
    size: usize,
    overlap: usize,
}

/// A span of the source in character offsets, half-open.
#[derive(Debug, Clone)]
struct Piece {
    content: String,
    start: usize,
    end: usize,
}

fn sentence_delimiter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").unwrap())
}

fn paragraph_delimiter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

impl Chunker {
    pub fn new(strategy: ChunkingStrategy, size: usize, overlap: usize) -> Self {
        Self {
            strategy,
            size: size.max(1),
            overlap,
        }
    }

    /// Chunk a document. Returns an empty vec for empty content.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        if document.content.is_empty() {
            return Vec::new();
        }

        let pieces = match self.strategy {
            ChunkingStrategy::FixedSize => self.chunk_fixed(&document.content, 0),
            ChunkingStrategy::Sentence => self.chunk_sentences(&document.content),
            ChunkingStrategy::Paragraph => self.chunk_paragraphs(&document.content),
        };

        pieces
            .into_iter()
            .filter(|p| !p.content.is_empty())
            .enumerate()
            .map(|(i, p)| Chunk {
                id: format!("{}_chunk_{}", document.id, i),
                document_id: document.id.clone(),
                document_name: document.file_name.clone(),
                content: p.content,
                start_index: p.start,
                end_index: p.end,
                chunk_index: i,
            })
            .collect()
    }

    /// Fixed-size windows stepping by `size - overlap`.
    ///
    /// When windows overlap, a trailing runt (shorter than `size / 4`)
    /// is discarded unless it is the only chunk; its content already
    /// lives in the previous window's tail. A zero-overlap split keeps
    /// every window so the chunks reassemble to the source exactly.
    ///
    /// `base` shifts the reported offsets; used when re-chunking an
    /// oversized paragraph in place.
    fn chunk_fixed(&self, content: &str, base: usize) -> Vec<Piece> {
        let chars: Vec<(usize, char)> = content.char_indices().collect();
        let n = chars.len();
        if n == 0 {
            return Vec::new();
        }
        let byte_at = |char_idx: usize| -> usize {
            if char_idx >= n {
                content.len()
            } else {
                chars[char_idx].0
            }
        };

        let step = self.size.saturating_sub(self.overlap).max(1);
        let mut pieces = Vec::new();
        let mut i = 0;
        while i < n {
            let end = (i + self.size).min(n);
            pieces.push(Piece {
                content: content[byte_at(i)..byte_at(end)].to_string(),
                start: base + i,
                end: base + end,
            });
            i += step;
        }

        if self.overlap > 0 && pieces.len() > 1 {
            let last_len = pieces.last().map(|p| p.end - p.start).unwrap_or(0);
            if last_len * 4 < self.size {
                pieces.pop();
            }
        }
        pieces
    }

    /// Greedy sentence accumulation up to `size` characters, seeding each
    /// new chunk with a trailing-sentence overlap of roughly `overlap`
    /// characters.
    fn chunk_sentences(&self, content: &str) -> Vec<Piece> {
        let sentences = split_with_delimiter(content, sentence_delimiter());
        self.accumulate(sentences, " ")
    }

    /// Greedy paragraph accumulation joined by blank lines. A single
    /// paragraph longer than `2 * size` is flushed and re-chunked
    /// fixed-size in place, preserving overall ordering.
    fn chunk_paragraphs(&self, content: &str) -> Vec<Piece> {
        let paragraphs = split_with_delimiter(content, paragraph_delimiter());
        let mut pieces = Vec::new();
        let mut pending: Vec<Unit> = Vec::new();

        for para in paragraphs {
            if para.char_len > self.size * 2 {
                if !pending.is_empty() {
                    pieces.push(join_units(&pending, "\n\n"));
                    pending.clear();
                }
                for mut inner in self.chunk_fixed(&para.text, para.start) {
                    inner.content = inner.content.trim().to_string();
                    pieces.push(inner);
                }
                continue;
            }
            self.push_unit(&mut pieces, &mut pending, para, "\n\n");
        }
        if !pending.is_empty() {
            pieces.push(join_units(&pending, "\n\n"));
        }
        pieces
    }

    fn accumulate(&self, units: Vec<Unit>, joiner: &str) -> Vec<Piece> {
        let mut pieces = Vec::new();
        let mut pending: Vec<Unit> = Vec::new();
        for unit in units {
            self.push_unit(&mut pieces, &mut pending, unit, joiner);
        }
        if !pending.is_empty() {
            pieces.push(join_units(&pending, joiner));
        }
        pieces
    }

    /// Add one unit to the pending accumulator, flushing (and carrying an
    /// overlap suffix) when the accumulated length would exceed the target.
    fn push_unit(&self, pieces: &mut Vec<Piece>, pending: &mut Vec<Unit>, unit: Unit, joiner: &str) {
        let joiner_len = joiner.chars().count();
        let pending_len = |units: &[Unit]| -> usize {
            units.iter().map(|u| u.char_len).sum::<usize>()
                + joiner_len * units.len().saturating_sub(1)
        };

        let projected = if pending.is_empty() {
            unit.char_len
        } else {
            pending_len(pending) + joiner_len + unit.char_len
        };

        if !pending.is_empty() && projected > self.size {
            pieces.push(join_units(pending, joiner));

            // Carry a suffix of units totalling at most `overlap` chars.
            let mut seed: Vec<Unit> = Vec::new();
            if self.overlap > 0 {
                let mut seed_len = 0;
                for u in pending.iter().rev() {
                    let add = u.char_len + if seed.is_empty() { 0 } else { joiner_len };
                    if seed_len + add > self.overlap {
                        break;
                    }
                    seed_len += add;
                    seed.push(u.clone());
                }
                seed.reverse();
            }
            *pending = seed;
        }
        pending.push(unit);
    }
}

/// A trimmed source fragment with its character offsets in the original.
#[derive(Debug, Clone)]
struct Unit {
    text: String,
    char_len: usize,
    start: usize,
    end: usize,
}

fn join_units(units: &[Unit], joiner: &str) -> Piece {
    let content = units
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join(joiner);
    Piece {
        content,
        start: units.first().map(|u| u.start).unwrap_or(0),
        end: units.last().map(|u| u.end).unwrap_or(0),
    }
}

/// Split `content` on a delimiter regex, keeping each fragment's trimmed
/// text and character offsets. A fragment ending in sentence punctuation
/// keeps that punctuation (the delimiter match begins on it).
fn split_with_delimiter(content: &str, delimiter: &Regex) -> Vec<Unit> {
    // Map byte offsets to character offsets once.
    let mut char_of_byte = vec![0usize; content.len() + 1];
    for (char_idx, (byte_idx, _)) in content.char_indices().enumerate() {
        char_of_byte[byte_idx] = char_idx;
    }
    char_of_byte[content.len()] = content.chars().count();

    let mut units = Vec::new();
    let mut cursor = 0usize;
    for m in delimiter.find_iter(content) {
        // Sentence delimiters start on the punctuation character itself;
        // the fragment owns it, the whitespace run is consumed.
        let keep = m
            .as_str()
            .chars()
            .next()
            .map(|c| matches!(c, '.' | '!' | '?'))
            .unwrap_or(false);
        let frag_end = if keep {
            m.start() + m.as_str().chars().next().map(|c| c.len_utf8()).unwrap_or(0)
        } else {
            m.start()
        };
        push_fragment(content, &char_of_byte, cursor, frag_end, &mut units);
        cursor = m.end();
    }
    push_fragment(content, &char_of_byte, cursor, content.len(), &mut units);
    units
}

fn push_fragment(
    content: &str,
    char_of_byte: &[usize],
    start_byte: usize,
    end_byte: usize,
    units: &mut Vec<Unit>,
) {
    if start_byte >= end_byte {
        return;
    }
    let raw = &content[start_byte..end_byte];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = raw.len() - raw.trim_start().len();
    let trail = raw.len() - raw.trim_end().len();
    let ts = start_byte + lead;
    let te = end_byte - trail;
    units.push(Unit {
        text: trimmed.to_string(),
        char_len: trimmed.chars().count(),
        start: char_of_byte[ts],
        end: char_of_byte[te],
    });
}
