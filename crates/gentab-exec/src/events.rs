//! Completion-chunk events at the engine boundary.
//!
//! Streamed generation is an ordered, finite sequence of these per
//! (row, column); mid-stream provider failures surface in-band as a final
//! chunk whose `finish_reason` is the error sentinel, so streaming clients
//! need no separate error channel.

use serde::Serialize;

use gentab_core::types::{ColumnId, References, RowId};
use gentab_providers::types::FinishReason;

pub const COMPLETION_CHUNK_OBJECT: &str = "gen_table.completion.chunk";
pub const REFERENCES_OBJECT: &str = "gen_table.references";
/// Terminal sentinel emitted by stream renderers after the last chunk.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Serialize)]
pub struct ChunkMessage {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub message: ChunkMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChunk {
    pub object: &'static str,
    pub row_id: RowId,
    pub output_column_name: ColumnId,
    pub choices: Vec<ChunkChoice>,
}

impl CompletionChunk {
    fn build(
        object: &'static str,
        row_id: &RowId,
        column: &ColumnId,
        content: String,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            object,
            row_id: row_id.clone(),
            output_column_name: column.clone(),
            choices: vec![ChunkChoice { message: ChunkMessage { content }, finish_reason }],
        }
    }

    pub fn delta(row_id: &RowId, column: &ColumnId, content: impl Into<String>) -> Self {
        Self::build(COMPLETION_CHUNK_OBJECT, row_id, column, content.into(), None)
    }

    pub fn finished(row_id: &RowId, column: &ColumnId, reason: FinishReason) -> Self {
        Self::build(
            COMPLETION_CHUNK_OBJECT,
            row_id,
            column,
            String::new(),
            Some(reason.as_str().to_string()),
        )
    }

    /// The one terminal error chunk: human-readable description in the
    /// content, error sentinel in `finish_reason`.
    pub fn error(row_id: &RowId, column: &ColumnId, message: impl Into<String>) -> Self {
        Self::build(
            COMPLETION_CHUNK_OBJECT,
            row_id,
            column,
            message.into(),
            Some(FinishReason::Error.as_str().to_string()),
        )
    }

    /// Provenance event carrying the serialized reference object, emitted
    /// before the answer deltas of a RAG generation.
    pub fn references(row_id: &RowId, column: &ColumnId, refs: &References) -> Self {
        let content = serde_json::to_string(refs).unwrap_or_default();
        Self::build(REFERENCES_OBJECT, row_id, column, content, None)
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }

    pub fn content(&self) -> &str {
        self.choices.first().map(|c| c.message.content.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_wire_shape() {
        let row = "t:0".to_string();
        let col = "answer".to_string();
        let chunk = CompletionChunk::delta(&row, &col, "hel");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "gen_table.completion.chunk");
        assert_eq!(json["row_id"], "t:0");
        assert_eq!(json["output_column_name"], "answer");
        assert_eq!(json["choices"][0]["message"]["content"], "hel");
        assert!(json["choices"][0].get("finish_reason").is_none());

        let err = CompletionChunk::error(&row, &col, "provider exploded");
        assert_eq!(err.finish_reason(), Some("error"));
        assert_eq!(err.content(), "provider exploded");
    }
}
