//! Lance-backed embedding cache keyed by `(content_hash, embedder_id)`.
//!
//! The cache is consulted prior to calling an embedding provider and
//! written through on misses, so re-ingesting unchanged documents costs no
//! provider calls.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{
    Array, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMillisecondArray,
};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::ExecutableQuery;
use lancedb::Connection;

use gentab_core::{Error, Result};

use crate::db::{ensure_table, table_exists};

pub const CACHE_TABLE: &str = "embedding_cache";

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub content_hash: String,
    pub embedder_id: String,
    pub vector: Vec<f32>,
}

pub fn hash_content(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}

fn build_cache_schema(dim: i32) -> Arc<arrow_schema::Schema> {
    Arc::new(arrow_schema::Schema::new(vec![
        arrow_schema::Field::new("content_hash", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new("embedder_id", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new(
            "created_at",
            arrow_schema::DataType::Timestamp(arrow_schema::TimeUnit::Millisecond, None),
            false,
        ),
        arrow_schema::Field::new(
            "vector",
            arrow_schema::DataType::FixedSizeList(
                Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true)),
                dim,
            ),
            true,
        ),
    ]))
}

pub async fn get_many(
    conn: &Connection,
    embedder_id: &str,
    dim: usize,
    hashes: &[String],
) -> Result<HashMap<String, Vec<f32>>> {
    if !table_exists(conn, CACHE_TABLE).await? {
        return Ok(HashMap::new());
    }
    let t = conn.open_table(CACHE_TABLE).execute().await.map_err(Error::store)?;
    let mut out = HashMap::new();
    let mut stream = t.query().execute().await.map_err(Error::store)?;
    while let Some(batch) = stream.try_next().await.map_err(Error::store)? {
        let hash_col = batch
            .column_by_name("content_hash")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| Error::store("cache content_hash column missing"))?;
        let eid_col = batch
            .column_by_name("embedder_id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| Error::store("cache embedder_id column missing"))?;
        let vec_col = batch
            .column_by_name("vector")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| Error::store("cache vector column missing"))?;
        for i in 0..batch.num_rows() {
            if eid_col.value(i) != embedder_id || vec_col.is_null(i) {
                continue;
            }
            let h = hash_col.value(i);
            if !hashes.iter().any(|x| x == h) {
                continue;
            }
            let list = vec_col.value(i);
            let vals = list
                .as_primitive::<arrow_array::types::Float32Type>()
                .values()
                .to_vec();
            if vals.len() == dim {
                out.insert(h.to_string(), vals);
            }
        }
    }
    Ok(out)
}

pub async fn put_many(conn: &Connection, dim: i32, entries: &[CacheEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let schema = build_cache_schema(dim);
    ensure_table(conn, CACHE_TABLE, schema.clone()).await?;
    let t = conn.open_table(CACHE_TABLE).execute().await.map_err(Error::store)?;
    let mut hashes = Vec::new();
    let mut eids = Vec::new();
    let mut created = Vec::new();
    let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::new();
    let now = Utc::now().timestamp_millis();
    for e in entries {
        hashes.push(e.content_hash.clone());
        eids.push(e.embedder_id.clone());
        created.push(now);
        vectors.push(Some(e.vector.iter().copied().map(Some).collect()));
    }
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(hashes)),
            Arc::new(StringArray::from(eids)),
            Arc::new(TimestampMillisecondArray::from(created)),
            Arc::new(FixedSizeListArray::from_iter_primitive::<
                arrow_array::types::Float32Type,
                _,
                _,
            >(vectors.into_iter(), dim)),
        ],
    )
    .map_err(Error::store)?;
    let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema));
    t.add(reader).execute().await.map_err(Error::store)?;
    Ok(())
}
