//! The table store: registry of table schemas plus per-table row storage.
//!
//! Registry mutations (including `lock_till` acquisition) are serialized
//! through an in-process mutex; the persisted value is what makes lock
//! state survive restarts.

use std::collections::BTreeMap;

use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::Connection;
use tracing::debug;

use gentab_core::types::{Cell, ColumnId, IndexKind, Row, RowId, Table, TableId};
use gentab_core::{Error, Result};

use crate::db;
use crate::rows::{batch_to_rows, cells_to_subset_batch, rows_to_batch};
use crate::schema::{build_row_schema, data_table_name, validate_column_id, validate_table_id};

const REGISTRY: &str = "tables";

pub struct TableStore {
    conn: Connection,
    registry_mu: tokio::sync::Mutex<()>,
}

impl TableStore {
    pub async fn connect(uri: &str) -> Result<Self> {
        let conn = db::open_db(uri).await?;
        Ok(Self { conn, registry_mu: tokio::sync::Mutex::new(()) })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    async fn load(&self, id: &str) -> Result<Option<Table>> {
        match db::get_entry(&self.conn, REGISTRY, id).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(Error::store)?)),
            None => Ok(None),
        }
    }

    pub async fn save_table(&self, table: &Table) -> Result<()> {
        let json = serde_json::to_string(table).map_err(Error::store)?;
        db::set_entry(&self.conn, REGISTRY, &table.id, &json).await
    }

    pub async fn try_get_table(&self, id: &str) -> Result<Option<Table>> {
        self.load(id).await
    }

    pub async fn get_table(&self, id: &str) -> Result<Table> {
        self.load(id)
            .await?
            .ok_or_else(|| Error::validation(format!("unknown table '{id}'")))
    }

    pub async fn list_tables(&self) -> Result<Vec<TableId>> {
        db::list_keys(&self.conn, REGISTRY).await
    }

    pub async fn create_table(&self, table: Table) -> Result<Table> {
        validate_table_id(&table.id)?;
        for col in &table.columns {
            validate_column_id(&col.id)?;
        }
        let _g = self.registry_mu.lock().await;
        if self.load(&table.id).await?.is_some() {
            return Err(Error::validation(format!("table '{}' already exists", table.id)));
        }
        let schema = build_row_schema(&table)?;
        db::ensure_table(&self.conn, &data_table_name(&table.id), schema).await?;
        self.save_table(&table).await?;
        debug!(table = %table.id, "created table");
        Ok(table)
    }

    pub async fn drop_table(&self, id: &str) -> Result<()> {
        let _g = self.registry_mu.lock().await;
        db::delete_entry(&self.conn, REGISTRY, id).await?;
        if db::table_exists(&self.conn, &data_table_name(id)).await? {
            self.conn.drop_table(&data_table_name(id), &[]).await.map_err(Error::store)?;
        }
        Ok(())
    }

    /// Load-mutate-save under the registry mutex.
    pub async fn update_table<F>(&self, id: &str, f: F) -> Result<Table>
    where
        F: FnOnce(&mut Table) -> Result<()>,
    {
        let _g = self.registry_mu.lock().await;
        let mut table = self
            .load(id)
            .await?
            .ok_or_else(|| Error::validation(format!("unknown table '{id}'")))?;
        f(&mut table)?;
        self.save_table(&table).await?;
        Ok(table)
    }

    /// Acquire the exclusive schema-mutation window. A compare-and-set
    /// against the current time: fails while another window is open.
    pub async fn acquire_lock(&self, id: &str, window_ms: i64) -> Result<i64> {
        let table = self
            .update_table(id, |t| {
                let now = Utc::now().timestamp_millis();
                if t.lock_till > now {
                    return Err(Error::concurrency(format!(
                        "table '{}' has a mutation window open until {}",
                        t.id, t.lock_till
                    )));
                }
                t.lock_till = now + window_ms;
                Ok(())
            })
            .await?;
        Ok(table.lock_till)
    }

    pub async fn release_lock(&self, id: &str) -> Result<()> {
        self.update_table(id, |t| {
            t.lock_till = 0;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_indexed_at(&self, id: &str, kind: IndexKind, at: Option<i64>) -> Result<()> {
        self.update_table(id, |t| {
            t.set_indexed_at(kind, at);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Append rows. Row ids and sequence numbers are assigned here, and the
    /// table's `updated_at` is bumped so indexes become detectably stale.
    pub async fn add_rows(
        &self,
        table_id: &str,
        cells_list: Vec<BTreeMap<ColumnId, Cell>>,
    ) -> Result<Vec<Row>> {
        if cells_list.is_empty() {
            return Ok(Vec::new());
        }
        let (table, rows) = {
            let _g = self.registry_mu.lock().await;
            let mut table = self
                .load(table_id)
                .await?
                .ok_or_else(|| Error::validation(format!("unknown table '{table_id}'")))?;
            for cells in &cells_list {
                for col_id in cells.keys() {
                    if table.column(col_id).is_none() {
                        return Err(Error::validation(format!(
                            "table '{table_id}' has no column '{col_id}'"
                        )));
                    }
                }
            }
            let mut rows = Vec::with_capacity(cells_list.len());
            for cells in cells_list {
                let seq = table.next_seq;
                table.next_seq += 1;
                rows.push(Row { id: format!("{table_id}:{seq}"), seq, cells });
            }
            table.updated_at = Utc::now().timestamp_millis();
            self.save_table(&table).await?;
            (table, rows)
        };
        self.insert_rows_raw(&table, &rows).await?;
        Ok(rows)
    }

    /// Append pre-built rows without assigning ids; used for table
    /// rewrites.
    pub async fn insert_rows_raw(&self, table: &Table, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let batch = rows_to_batch(table, rows)?;
        let schema = batch.schema();
        let reader = Box::new(arrow_array::RecordBatchIterator::new(
            vec![Ok(batch)].into_iter(),
            schema,
        ));
        let name = data_table_name(&table.id);
        if db::table_exists(&self.conn, &name).await? {
            let t = self.conn.open_table(&name).execute().await.map_err(Error::store)?;
            t.add(reader).execute().await.map_err(Error::store)?;
        } else {
            self.conn.create_table(&name, reader).execute().await.map_err(Error::store)?;
        }
        Ok(())
    }

    /// Drop and recreate the data table with the new schema, keeping rows.
    /// Callers hold the table's mutation window while doing this.
    pub async fn replace_data_table(&self, table: &Table, rows: &[Row]) -> Result<()> {
        let name = data_table_name(&table.id);
        if db::table_exists(&self.conn, &name).await? {
            self.conn.drop_table(&name, &[]).await.map_err(Error::store)?;
        }
        db::ensure_table(&self.conn, &name, build_row_schema(table)?).await?;
        self.insert_rows_raw(table, rows).await
    }

    pub async fn get_rows(&self, table: &Table, ids: Option<&[RowId]>) -> Result<Vec<Row>> {
        let name = data_table_name(&table.id);
        if !db::table_exists(&self.conn, &name).await? {
            return Ok(Vec::new());
        }
        let t = self.conn.open_table(&name).execute().await.map_err(Error::store)?;
        let mut query = t.query();
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let list = ids.iter().map(|id| db::sql_quote(id)).collect::<Vec<_>>().join(",");
            query = query.only_if(format!("id IN ({list})"));
        }
        let mut stream = query.execute().await.map_err(Error::store)?;
        let mut rows = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(Error::store)? {
            rows.extend(batch_to_rows(table, &batch)?);
        }
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    pub async fn get_row(&self, table: &Table, id: &RowId) -> Result<Row> {
        let rows = self.get_rows(table, Some(std::slice::from_ref(id))).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::validation(format!("table '{}' has no row '{id}'", table.id)))
    }

    /// Update cells of one row in place via `merge_insert` and bump
    /// `updated_at`.
    pub async fn update_cells(
        &self,
        table: &Table,
        row_id: &RowId,
        cells: &BTreeMap<ColumnId, Cell>,
    ) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }
        let batch = cells_to_subset_batch(table, row_id, cells)?;
        let schema = batch.schema();
        let reader = Box::new(arrow_array::RecordBatchIterator::new(
            vec![Ok(batch)].into_iter(),
            schema,
        ));
        let name = data_table_name(&table.id);
        let t = self.conn.open_table(&name).execute().await.map_err(Error::store)?;
        let mut mi = t.merge_insert(&["id"]);
        mi.when_matched_update_all(None);
        mi.execute(reader).await.map_err(Error::store)?;
        self.update_table(&table.id, |t| {
            t.updated_at = Utc::now().timestamp_millis();
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_rows(&self, table: &Table, ids: &[RowId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let name = data_table_name(&table.id);
        if !db::table_exists(&self.conn, &name).await? {
            return Ok(());
        }
        let t = self.conn.open_table(&name).execute().await.map_err(Error::store)?;
        let list = ids.iter().map(|id| db::sql_quote(id)).collect::<Vec<_>>().join(",");
        t.delete(&format!("id IN ({list})")).await.map_err(Error::store)?;
        self.update_table(&table.id, |t| {
            t.updated_at = Utc::now().timestamp_millis();
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn count_rows(&self, table: &Table) -> Result<usize> {
        let name = data_table_name(&table.id);
        if !db::table_exists(&self.conn, &name).await? {
            return Ok(0);
        }
        let t = self.conn.open_table(&name).execute().await.map_err(Error::store)?;
        t.count_rows(None).await.map_err(Error::store)
    }
}
