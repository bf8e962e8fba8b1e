//! Index lifecycle orchestration across the three per-table indexes.
//!
//! Build-start timestamps are recorded *before* any work happens: a build
//! that crashes midway stays detectably stale when compared against the
//! table's row-modification time, instead of being silently marked fresh.
//! A failed build leaves the index in "missing" state.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use gentab_core::config::EngineTuning;
use gentab_core::types::{IndexKind, Table, COL_VECTOR};
use gentab_core::{Error, Result};
use gentab_store::TableStore;

use crate::retry::with_retry;
use crate::{fts, scalar, vector, Hit};

pub struct IndexManager {
    store: Arc<TableStore>,
    index_root: PathBuf,
    retry_attempts: usize,
    retry_base_ms: u64,
    refine_factor: u32,
}

impl IndexManager {
    pub fn new(store: Arc<TableStore>, tuning: &EngineTuning) -> Self {
        Self {
            store,
            index_root: PathBuf::from(&tuning.index_dir),
            retry_attempts: tuning.retry_attempts,
            retry_base_ms: tuning.retry_base_ms,
            refine_factor: tuning.refine_factor,
        }
    }

    /// Build one index kind. The `indexed_at` stamp records build start;
    /// failure resets it to missing.
    pub async fn build_index(&self, table_id: &str, kind: IndexKind) -> Result<()> {
        let table = self.store.get_table(table_id).await?;
        if !table.is_knowledge() {
            return Err(Error::validation(format!(
                "table '{table_id}' is not a knowledge table"
            )));
        }
        let started = Utc::now().timestamp_millis();
        self.store.set_indexed_at(table_id, kind, Some(started)).await?;
        let outcome = self.run_build(&table, kind).await;
        match outcome {
            Ok(()) => {
                info!(table = table_id, ?kind, "index build finished");
                Ok(())
            }
            Err(e) => {
                warn!(table = table_id, ?kind, error = %e, "index build failed");
                self.store.set_indexed_at(table_id, kind, None).await?;
                Err(e)
            }
        }
    }

    async fn run_build(&self, table: &Table, kind: IndexKind) -> Result<()> {
        match kind {
            IndexKind::Fts => {
                let rows = self.store.get_rows(table, None).await?;
                let count = fts::build(&self.index_root, table, &rows)?;
                info!(table = %table.id, count, "fts index rebuilt");
                Ok(())
            }
            IndexKind::Vector => {
                let dim = table
                    .column(COL_VECTOR)
                    .and_then(|c| c.dim)
                    .ok_or_else(|| Error::validation("knowledge table has no vector column"))?;
                let trained =
                    vector::build(self.store.connection(), &table.id, dim as usize).await?;
                if !trained {
                    info!(table = %table.id, "corpus below ANN training size, staying flat");
                }
                Ok(())
            }
            IndexKind::Scalar => scalar::build(self.store.connection(), &table.id).await,
        }
    }

    /// Lexical query with the stale-index auto-heal: a missing or stale FTS
    /// index triggers exactly one synchronous forced rebuild before the
    /// query runs, and a query failure against a supposedly-fresh index
    /// gets one rebuild-then-retry.
    pub async fn search_fts(&self, table_id: &str, query: &str, k: usize) -> Result<Vec<Hit>> {
        let table = self.store.get_table(table_id).await?;
        let mut rebuilt = false;
        if table.is_index_stale(IndexKind::Fts) || !fts::exists(&self.index_root, table_id) {
            info!(table = table_id, "fts index stale or missing, forcing rebuild");
            self.build_index(table_id, IndexKind::Fts).await?;
            rebuilt = true;
        }
        let attempt = with_retry(self.retry_attempts, self.retry_base_ms, || async move {
            fts::search(&self.index_root, table_id, query, k)
        })
        .await;
        match attempt {
            Ok(hits) => Ok(hits),
            Err(e) if !rebuilt => {
                warn!(table = table_id, error = %e, "fts query failed, rebuilding once");
                self.build_index(table_id, IndexKind::Fts).await?;
                fts::search(&self.index_root, table_id, query, k)
            }
            Err(e) => Err(e),
        }
    }

    /// Incremental index maintenance after chunk rows are deleted. The
    /// Lance-side vector and scalar indexes track their table's deletions
    /// already; the FTS index gets the rows removed in place instead of a
    /// full rebuild. Call after `TableStore::delete_rows`.
    pub async fn remove_rows(&self, table_id: &str, row_ids: &[String]) -> Result<()> {
        let table = self.store.get_table(table_id).await?;
        let started = Utc::now().timestamp_millis();
        if table.indexed_at(IndexKind::Fts).is_some() && fts::exists(&self.index_root, table_id) {
            self.store.set_indexed_at(table_id, IndexKind::Fts, Some(started)).await?;
            if let Err(e) = fts::remove(&self.index_root, table_id, row_ids) {
                warn!(table = table_id, error = %e, "incremental fts delete failed");
                self.store.set_indexed_at(table_id, IndexKind::Fts, None).await?;
                return Err(e);
            }
        }
        for kind in [IndexKind::Vector, IndexKind::Scalar] {
            if table.indexed_at(kind).is_some() {
                self.store.set_indexed_at(table_id, kind, Some(started)).await?;
            }
        }
        Ok(())
    }

    /// ANN query with bounded retry. Vector search stays correct without a
    /// trained index (flat scan), so there is no heal path here.
    pub async fn search_vector(
        &self,
        table_id: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<Hit>> {
        with_retry(self.retry_attempts, self.retry_base_ms, || async move {
            vector::search(
                self.store.connection(),
                table_id,
                query_vec,
                k,
                self.refine_factor,
            )
            .await
        })
        .await
    }
}
