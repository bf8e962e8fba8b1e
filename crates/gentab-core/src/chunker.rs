//! Paragraph-first document splitter used by ingestion.
//!
//! The engine itself only consumes chunks; this lives here so the CLI can
//! turn raw text files into passage-sized chunks with title/page metadata.

use serde::{Deserialize, Serialize};

/// A passage produced by splitting, before it is embedded and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftChunk {
    pub title: String,
    pub text: String,
    /// Position of the chunk within its source document.
    pub page: i64,
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_percent: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_tokens: 500, overlap_percent: 0.2 }
    }
}

#[derive(Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Split a document into passage-like chunks. Paragraphs that fit the
    /// token budget become one chunk each; oversized paragraphs are split
    /// with word overlap.
    pub fn split(&self, title: &str, content: &str) -> Vec<DraftChunk> {
        let mut chunks = Vec::new();
        let mut page = 0i64;
        for paragraph in content.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if self.count_tokens(paragraph) <= self.config.max_tokens {
                chunks.push(DraftChunk { title: title.to_string(), text: paragraph.to_string(), page });
                page += 1;
            } else {
                for piece in self.split_with_overlap(paragraph) {
                    chunks.push(DraftChunk { title: title.to_string(), text: piece, page });
                    page += 1;
                }
            }
        }
        chunks
    }

    fn count_tokens(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f32 / 0.75) as usize
    }

    fn split_with_overlap(&self, paragraph: &str) -> Vec<String> {
        let words: Vec<&str> = paragraph.split_whitespace().collect();
        let words_per_chunk = 300;
        let overlap_words = (words_per_chunk as f32 * self.config.overlap_percent) as usize;
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < words.len() {
            let end = (start + words_per_chunk).min(words.len());
            chunks.push(words[start..end].join(" "));
            if end >= words.len() {
                break;
            }
            start = end - overlap_words;
        }
        chunks
    }
}
