//! LanceDB connection and housekeeping helpers.
//!
//! Provides database open functions, ensure-* helpers for tables, and the
//! key/value registry table used to persist table schemas and lock state.

use std::sync::Arc;

use arrow_array::{RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection};

use gentab_core::{Error, Result};

pub async fn open_db(uri: &str) -> Result<Connection> {
    connect(uri).execute().await.map_err(Error::store)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let names = conn.table_names().execute().await.map_err(Error::store)?;
    Ok(names.contains(&name.to_string()))
}

pub async fn ensure_table(
    conn: &Connection,
    name: &str,
    schema: Arc<arrow_schema::Schema>,
) -> Result<()> {
    if table_exists(conn, name).await? {
        return Ok(());
    }
    // create empty table with 0 rows
    let iter = RecordBatchIterator::new(vec![].into_iter(), schema);
    conn.create_table(name, Box::new(iter))
        .execute()
        .await
        .map_err(Error::store)?;
    Ok(())
}

// Key/value registry schema shared by the table registry.
pub fn build_registry_schema() -> Arc<arrow_schema::Schema> {
    Arc::new(arrow_schema::Schema::new(vec![
        arrow_schema::Field::new("key", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new("value", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new(
            "updated_at",
            arrow_schema::DataType::Timestamp(arrow_schema::TimeUnit::Millisecond, None),
            false,
        ),
    ]))
}

pub async fn ensure_registry(conn: &Connection, name: &str) -> Result<()> {
    ensure_table(conn, name, build_registry_schema()).await
}

pub fn sql_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub async fn set_entry(conn: &Connection, table: &str, key: &str, value: &str) -> Result<()> {
    ensure_registry(conn, table).await?;
    let t = conn.open_table(table).execute().await.map_err(Error::store)?;
    let rb = RecordBatch::try_new(
        build_registry_schema(),
        vec![
            Arc::new(StringArray::from(vec![key.to_string()])),
            Arc::new(StringArray::from(vec![value.to_string()])),
            Arc::new(TimestampMillisecondArray::from(vec![Utc::now().timestamp_millis()])),
        ],
    )
    .map_err(Error::store)?;
    let reader = Box::new(RecordBatchIterator::new(vec![Ok(rb)].into_iter(), build_registry_schema()));
    // Upsert behavior via merge_insert: key is unique
    let mut mi = t.merge_insert(&["key"]);
    mi.when_matched_update_all(None).when_not_matched_insert_all();
    let _ = mi.execute(reader).await.map_err(Error::store)?;
    Ok(())
}

pub async fn get_entry(conn: &Connection, table: &str, key: &str) -> Result<Option<String>> {
    if !table_exists(conn, table).await? {
        return Ok(None);
    }
    let t = conn.open_table(table).execute().await.map_err(Error::store)?;
    let mut stream = t
        .query()
        .only_if(format!("key = {}", sql_quote(key)))
        .execute()
        .await
        .map_err(Error::store)?;
    while let Some(batch) = stream.try_next().await.map_err(Error::store)? {
        if batch.num_rows() == 0 {
            continue;
        }
        let val = batch
            .column_by_name("value")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| Error::store("registry value column missing"))?;
        return Ok(Some(val.value(0).to_string()));
    }
    Ok(None)
}

pub async fn delete_entry(conn: &Connection, table: &str, key: &str) -> Result<()> {
    if !table_exists(conn, table).await? {
        return Ok(());
    }
    let t = conn.open_table(table).execute().await.map_err(Error::store)?;
    t.delete(&format!("key = {}", sql_quote(key)))
        .await
        .map_err(Error::store)?;
    Ok(())
}

pub async fn list_keys(conn: &Connection, table: &str) -> Result<Vec<String>> {
    if !table_exists(conn, table).await? {
        return Ok(Vec::new());
    }
    let t = conn.open_table(table).execute().await.map_err(Error::store)?;
    let mut stream = t.query().execute().await.map_err(Error::store)?;
    let mut keys = Vec::new();
    while let Some(batch) = stream.try_next().await.map_err(Error::store)? {
        let col = batch
            .column_by_name("key")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| Error::store("registry key column missing"))?;
        for i in 0..batch.num_rows() {
            keys.push(col.value(i).to_string());
        }
    }
    keys.sort();
    Ok(keys)
}
