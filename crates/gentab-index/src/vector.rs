//! Lance ANN index build and query for a Knowledge Table's vector column.

use arrow_array::{Array, FixedSizeListArray, Float32Array, StringArray};
use futures::TryStreamExt;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType};

use gentab_core::types::COL_VECTOR;
use gentab_core::{Error, Result};
use gentab_store::schema::data_table_name;

use crate::Hit;

/// Below this many ready vectors an ANN index is not worth training; flat
/// scans stay exact and fast.
pub const MIN_ANN_ROWS: usize = 256;

pub struct IvfPqParams {
    pub nlist: usize,
    pub m: usize,
    pub nbits: usize,
}

pub fn compute_ivfpq_params(total_ready: usize, dim: usize) -> IvfPqParams {
    let sqrt_n = (total_ready as f64).sqrt() as usize;
    let mut nlist = std::cmp::max(2048, 2 * sqrt_n);
    nlist = std::cmp::min(nlist, 65536);
    // Clamp nlist to be less than total_ready for tiny datasets
    if total_ready > 1 {
        nlist = std::cmp::min(nlist, total_ready - 1);
    } else {
        nlist = 1;
    }
    let m = if dim >= 1024 { 32 } else { 16 };
    IvfPqParams { nlist, m, nbits: 8 }
}

pub async fn count_ready_vectors(conn: &Connection, table_id: &str) -> Result<usize> {
    let tbl = conn
        .open_table(data_table_name(table_id))
        .execute()
        .await
        .map_err(Error::retrieval)?;
    let mut cnt = 0usize;
    let mut stream = tbl
        .query()
        .select(Select::columns(&[COL_VECTOR]))
        .execute()
        .await
        .map_err(Error::retrieval)?;
    while let Some(batch) = stream.try_next().await.map_err(Error::retrieval)? {
        if let Some(arr) = batch.column_by_name(COL_VECTOR) {
            if let Some(fsl) = arr.as_any().downcast_ref::<FixedSizeListArray>() {
                for i in 0..batch.num_rows() {
                    if fsl.is_valid(i) {
                        cnt += 1;
                    }
                }
            }
        }
    }
    Ok(cnt)
}

/// Train and build an IVF_PQ index over the vector column. Returns false
/// when the corpus is too small to train and the table is left unindexed
/// (flat search remains correct).
pub async fn build(conn: &Connection, table_id: &str, dim: usize) -> Result<bool> {
    let ready = count_ready_vectors(conn, table_id).await?;
    if ready < MIN_ANN_ROWS {
        return Ok(false);
    }
    let params = compute_ivfpq_params(ready, dim);
    let table = conn
        .open_table(data_table_name(table_id))
        .execute()
        .await
        .map_err(Error::retrieval)?;
    table
        .create_index(
            &[COL_VECTOR],
            Index::IvfPq(
                IvfPqIndexBuilder::default()
                    .distance_type(DistanceType::Cosine)
                    .num_partitions(params.nlist as u32)
                    .num_sub_vectors(params.m as u32),
            ),
        )
        .execute()
        .await
        .map_err(Error::retrieval)?;
    Ok(true)
}

/// Approximate nearest-neighbor query, cosine metric. `refine_factor`
/// trades recall for latency; rank fusion downstream compensates for rank
/// noise, so it is kept low.
pub async fn search(
    conn: &Connection,
    table_id: &str,
    query_vec: &[f32],
    k: usize,
    refine_factor: u32,
) -> Result<Vec<Hit>> {
    let table = conn
        .open_table(data_table_name(table_id))
        .execute()
        .await
        .map_err(Error::retrieval)?;
    let mut stream = table
        .vector_search(query_vec.to_vec())
        .map_err(Error::retrieval)?
        .distance_type(DistanceType::Cosine)
        .refine_factor(refine_factor)
        .limit(k)
        .execute()
        .await
        .map_err(Error::retrieval)?;
    let mut hits = Vec::new();
    while let Some(batch) = stream.try_next().await.map_err(Error::retrieval)? {
        let ids = batch
            .column_by_name("id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| Error::retrieval("vector result missing id column"))?;
        for i in 0..batch.num_rows() {
            let score = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .map_or(0.5, |d| 1.0 - d.value(i));
            hits.push(Hit { row_id: ids.value(i).to_string(), score });
        }
    }
    Ok(hits)
}
