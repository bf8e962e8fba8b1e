//! The hybrid search engine: one lexical and one vector query per
//! Knowledge Table, RRF fusion, optional rerank, deduplicated output with
//! provenance.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use gentab_core::config::EngineTuning;
use gentab_core::types::{
    ChunkScores, ColumnId, DType, KnowledgeChunk, References, RetrievedChunk, Row, Table, TableId,
    COL_PAGE, COL_TEXT, COL_TITLE, COL_VECTOR,
};
use gentab_core::{Error, Result};
use gentab_index::IndexManager;
use gentab_providers::{EmbeddingProvider, RerankProvider};
use gentab_store::TableStore;

use crate::rrf::{fuse, FusedHit};

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub table_ids: Vec<TableId>,
    pub top_k: usize,
    /// When set (and a reranker is wired), the fused top candidates are
    /// re-scored and the reranker's order wins outright; RRF then only
    /// generates candidates.
    pub rerank_model: Option<String>,
    /// Restrict the `context` payload of each result to these columns.
    /// The lexical engine cannot restrict matching to columns, so the one
    /// cross-column query runs regardless and filtering happens here,
    /// downstream.
    pub column_filter: Option<Vec<ColumnId>>,
}

impl SearchParams {
    pub fn new(query: impl Into<String>, table_ids: Vec<TableId>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            table_ids,
            top_k,
            rerank_model: None,
            column_filter: None,
        }
    }
}

pub struct HybridSearchEngine {
    store: Arc<TableStore>,
    index: Arc<IndexManager>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn RerankProvider>>,
    rank_constant: f32,
    fusion_overfetch: usize,
}

impl HybridSearchEngine {
    pub fn new(
        store: Arc<TableStore>,
        index: Arc<IndexManager>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn RerankProvider>>,
        tuning: &EngineTuning,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            reranker,
            rank_constant: tuning.rank_constant,
            fusion_overfetch: tuning.fusion_overfetch.max(1),
        }
    }

    /// Answer one logical query across the given Knowledge Tables.
    ///
    /// A source that keeps failing after bounded retries degrades the
    /// response to partial results; only when every source of every table
    /// fails does the whole call surface a retrieval error.
    pub async fn search(&self, params: &SearchParams) -> Result<References> {
        if params.table_ids.is_empty() {
            return Err(Error::validation("search requires at least one knowledge table"));
        }
        if params.query.trim().is_empty() {
            return Err(Error::validation("search query is empty"));
        }
        let top_k = params.top_k.max(1);
        let overfetch = top_k * self.fusion_overfetch;

        let query_vec = self
            .embedder
            .embed_batch(std::slice::from_ref(&params.query))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider("embedder returned no vector"))?;

        let mut chunks: Vec<RetrievedChunk> = Vec::new();
        let mut sources_ok = 0usize;
        let mut last_err: Option<Error> = None;
        for table_id in &params.table_ids {
            let table = self.store.get_table(table_id).await?;
            if !table.is_knowledge() {
                return Err(Error::validation(format!(
                    "table '{table_id}' is not a knowledge table"
                )));
            }
            let (fts_res, vec_res) = tokio::join!(
                self.index.search_fts(table_id, &params.query, overfetch),
                self.index.search_vector(table_id, &query_vec, overfetch),
            );
            let fts = match fts_res {
                Ok(hits) => {
                    sources_ok += 1;
                    hits
                }
                Err(e) => {
                    warn!(table = %table_id, error = %e, "lexical source failed, degrading to partial");
                    last_err = Some(e);
                    Vec::new()
                }
            };
            let vec_hits = match vec_res {
                Ok(hits) => {
                    sources_ok += 1;
                    hits
                }
                Err(e) => {
                    warn!(table = %table_id, error = %e, "vector source failed, degrading to partial");
                    last_err = Some(e);
                    Vec::new()
                }
            };
            let fused = fuse(&fts, &vec_hits, self.rank_constant);
            chunks.extend(self.hydrate(&table, &fused, params.column_filter.as_deref()).await?);
        }
        if sources_ok == 0 {
            let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
            return Err(Error::retrieval(format!("all retrieval sources failed: {detail}")));
        }

        // Merge across tables on the shared fused scale; stable sort keeps
        // per-table tie-break order.
        chunks.sort_by(|a, b| b.metadata.fused_score.total_cmp(&a.metadata.fused_score));
        chunks.truncate(overfetch);

        if params.rerank_model.is_some() {
            if let Some(reranker) = &self.reranker {
                match self.rerank(reranker.as_ref(), &params.query, chunks.clone()).await {
                    Ok(reordered) => chunks = reordered,
                    Err(e) => {
                        warn!(error = %e, "reranker failed, keeping fused order");
                    }
                }
            }
        }
        chunks.truncate(top_k);
        Ok(References { search_query: params.query.clone(), chunks })
    }

    async fn rerank(
        &self,
        reranker: &dyn RerankProvider,
        query: &str,
        chunks: Vec<RetrievedChunk>,
    ) -> Result<Vec<RetrievedChunk>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.chunk.text.clone()).collect();
        let order = reranker.rerank(query, &texts).await?;
        let mut out = Vec::with_capacity(chunks.len());
        let mut taken = vec![false; chunks.len()];
        for (idx, score) in order {
            if let Some(c) = chunks.get(idx) {
                if !taken[idx] {
                    taken[idx] = true;
                    let mut c = c.clone();
                    c.metadata.rerank_score = Some(score);
                    out.push(c);
                }
            }
        }
        // Anything the reranker dropped keeps its fused position at the
        // tail.
        for (idx, c) in chunks.into_iter().enumerate() {
            if !taken[idx] {
                out.push(c);
            }
        }
        Ok(out)
    }

    async fn hydrate(
        &self,
        table: &Table,
        fused: &[FusedHit],
        column_filter: Option<&[ColumnId]>,
    ) -> Result<Vec<RetrievedChunk>> {
        if fused.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = fused.iter().map(|h| h.row_id.clone()).collect();
        let rows = self.store.get_rows(table, Some(&ids)).await?;
        let by_id: BTreeMap<&str, &Row> = rows.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut out = Vec::with_capacity(fused.len());
        for hit in fused {
            let Some(row) = by_id.get(hit.row_id.as_str()) else {
                // Row deleted between index build and hydration.
                continue;
            };
            let mut context = BTreeMap::new();
            for col in &table.columns {
                if matches!(col.id.as_str(), COL_TEXT | COL_TITLE | COL_PAGE | COL_VECTOR) {
                    continue;
                }
                if col.dtype == DType::Vector {
                    continue;
                }
                if let Some(filter) = column_filter {
                    if !filter.iter().any(|c| c == &col.id) {
                        continue;
                    }
                }
                if let Some(cell) = row.cell(&col.id) {
                    if !cell.value.is_null() {
                        let json = serde_json::to_value(&cell.value).map_err(Error::store)?;
                        context.insert(col.id.clone(), json);
                    }
                }
            }
            out.push(RetrievedChunk {
                chunk: KnowledgeChunk {
                    chunk_id: row.id.clone(),
                    title: row.text(COL_TITLE).unwrap_or_default(),
                    text: row.text(COL_TEXT).unwrap_or_default(),
                    page: row.cell(COL_PAGE).and_then(|c| match c.value {
                        gentab_core::types::CellValue::Int(p) => Some(p),
                        _ => None,
                    }),
                    context,
                },
                metadata: ChunkScores {
                    fts_score: hit.fts_score,
                    vec_score: hit.vec_score,
                    fused_score: hit.fused,
                    rerank_score: None,
                    table_id: table.id.clone(),
                    project_id: None,
                },
            });
        }
        Ok(out)
    }
}
