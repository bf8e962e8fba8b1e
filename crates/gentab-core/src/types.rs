//! Domain types shared by the store, index, retrieval and executor crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type TableId = String;
pub type ColumnId = String;
pub type RowId = String;

/// Column names every Knowledge Table carries. Additional structured columns
/// contributed by the source document sit alongside these.
pub const COL_TEXT: &str = "text";
pub const COL_TITLE: &str = "title";
pub const COL_PAGE: &str = "page";
pub const COL_VECTOR: &str = "vector";

/// Storage dtype of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Str,
    Int,
    Float,
    Bool,
    Image,
    Audio,
    File,
    Vector,
    Json,
}

/// Parameters for retrieval-augmented generation on an LLM column.
///
/// `table_ids` may only reference Knowledge Tables that exist when the
/// config is saved; the executor re-validates on every config update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagParams {
    pub table_ids: Vec<TableId>,
    #[serde(default = "RagParams::default_k")]
    pub k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranking_model: Option<String>,
    /// Template for the search query. When absent the rendered prompt is
    /// used as the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
    /// When set, the search query is first rewritten by this model under a
    /// token budget separate from the main completion budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_model: Option<String>,
}

impl RagParams {
    fn default_k() -> usize {
        5
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmGenConfig {
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Template referencing other column values as `${column-id}`.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_params: Option<RagParams>,
    /// Chat columns reconstruct message history from earlier rows.
    #[serde(default)]
    pub multi_turn: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeGenConfig {
    /// The single column whose value is executed.
    pub source_column: ColumnId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedGenConfig {
    pub embedding_model: String,
    pub source_column: ColumnId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageGenConfig {
    pub model: String,
    pub prompt: String,
}

/// Discriminated generation config attached to an output column. The
/// `object` tag is the wire discriminator; dispatch switches exhaustively
/// on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object")]
pub enum GenConfig {
    #[serde(rename = "gen_config.llm")]
    Llm(LlmGenConfig),
    #[serde(rename = "gen_config.code")]
    Code(CodeGenConfig),
    #[serde(rename = "gen_config.python")]
    Python(CodeGenConfig),
    #[serde(rename = "gen_config.embed")]
    Embed(EmbedGenConfig),
    #[serde(rename = "gen_config.image")]
    Image(ImageGenConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub dtype: DType,
    /// `None` marks a plain input column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_config: Option<GenConfig>,
    /// Vector dimensionality, required when `dtype` is `Vector`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<i32>,
}

impl Column {
    pub fn input(id: impl Into<ColumnId>, dtype: DType) -> Self {
        Self { id: id.into(), dtype, gen_config: None, dim: None }
    }

    pub fn output(id: impl Into<ColumnId>, dtype: DType, cfg: GenConfig) -> Self {
        Self { id: id.into(), dtype, gen_config: Some(cfg), dim: None }
    }

    pub fn vector(id: impl Into<ColumnId>, dim: i32) -> Self {
        Self { id: id.into(), dtype: DType::Vector, gen_config: None, dim: Some(dim) }
    }

    pub fn is_output(&self) -> bool {
        self.gen_config.is_some()
    }
}

/// Which of the three per-table indexes an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Fts,
    Vector,
    Scalar,
}

/// Persisted table schema and bookkeeping.
///
/// `lock_till` is a plain epoch-millisecond value so the exclusive
/// schema-mutation window survives process restarts; acquisition is a
/// compare-and-set against the current time, not an in-memory lock.
/// `indexed_at_*` record when each index build *started* so a build that
/// crashes midway stays detectably stale against `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub lock_till: i64,
    /// Last row-data modification, epoch ms. Compared against the
    /// `indexed_at_*` build-start stamps to decide staleness.
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub indexed_at_fts: Option<i64>,
    #[serde(default)]
    pub indexed_at_vec: Option<i64>,
    #[serde(default)]
    pub indexed_at_sca: Option<i64>,
    /// Set on tables spawned by duplication, e.g. a chat conversation
    /// created from a chat agent template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TableId>,
    /// Monotonic row sequence counter; assigns stable table order.
    #[serde(default)]
    pub next_seq: i64,
}

impl Table {
    pub fn new(id: impl Into<TableId>, columns: Vec<Column>) -> Self {
        Self {
            id: id.into(),
            columns,
            lock_till: 0,
            updated_at: 0,
            indexed_at_fts: None,
            indexed_at_vec: None,
            indexed_at_sca: None,
            parent_id: None,
            next_seq: 0,
        }
    }

    pub fn column(&self, id: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn output_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_output())
    }

    /// Knowledge Tables store chunked document content: they always carry a
    /// text column and a vector-bearing column.
    pub fn is_knowledge(&self) -> bool {
        self.column(COL_TEXT).is_some_and(|c| c.dtype == DType::Str)
            && self.column(COL_VECTOR).is_some_and(|c| c.dtype == DType::Vector)
    }

    pub fn indexed_at(&self, kind: IndexKind) -> Option<i64> {
        match kind {
            IndexKind::Fts => self.indexed_at_fts,
            IndexKind::Vector => self.indexed_at_vec,
            IndexKind::Scalar => self.indexed_at_sca,
        }
    }

    pub fn set_indexed_at(&mut self, kind: IndexKind, at: Option<i64>) {
        match kind {
            IndexKind::Fts => self.indexed_at_fts = at,
            IndexKind::Vector => self.indexed_at_vec = at,
            IndexKind::Scalar => self.indexed_at_sca = at,
        }
    }

    /// An index is stale when it has never been built or when its
    /// build-start stamp predates the last row mutation. Build success alone
    /// never implies freshness.
    pub fn is_index_stale(&self, kind: IndexKind) -> bool {
        match self.indexed_at(kind) {
            None => true,
            Some(ts) => ts < self.updated_at,
        }
    }
}

/// Generation status of a cell, distinct from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    Pending,
    Streaming,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Vector(Vec<f32>),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendering used for template substitution and prompt context.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Str(s) => Some(s.clone()),
            Self::Vector(_) => None,
            Self::Json(v) => Some(v.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub value: CellValue,
    pub state: CellState,
}

impl Cell {
    pub fn done(value: CellValue) -> Self {
        Self { value, state: CellState::Done }
    }

    /// Error cells hold the empty representation, never a partial value, so
    /// a truncated generation cannot be mistaken for a complete one.
    pub fn error() -> Self {
        Self { value: CellValue::Null, state: CellState::Error }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    /// Stable position within the table; chat history reconstruction orders
    /// and filters rows by this.
    pub seq: i64,
    pub cells: BTreeMap<ColumnId, Cell>,
}

impl Row {
    pub fn cell(&self, col: &str) -> Option<&Cell> {
        self.cells.get(col)
    }

    pub fn text(&self, col: &str) -> Option<String> {
        self.cells.get(col).and_then(|c| c.value.render())
    }
}

/// One retrievable unit of document content hydrated from a Knowledge
/// Table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub chunk_id: RowId,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    /// Additional structured columns contributed by the source document.
    #[serde(default)]
    pub context: BTreeMap<ColumnId, serde_json::Value>,
}

/// Per-source and fused scores plus provenance for one retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkScores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fts_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vec_score: Option<f32>,
    pub fused_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    pub table_id: TableId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Ephemeral search result wrapping a chunk with its scores. Persisted only
/// when attached to a generated answer as provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    #[serde(flatten)]
    pub chunk: KnowledgeChunk,
    pub metadata: ChunkScores,
}

/// Provenance object attached to generated chat answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct References {
    pub search_query: String,
    pub chunks: Vec<RetrievedChunk>,
}
