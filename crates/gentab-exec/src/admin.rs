//! Schema mutations: column create/alter/delete and gen_config updates.
//!
//! Every mutation runs inside the table's exclusive `lock_till` window so
//! concurrent generation requests never observe a half-migrated schema.

use std::sync::Arc;

use tracing::info;

use gentab_core::types::{
    Column, ColumnId, DType, GenConfig, Table, TableId, COL_PAGE, COL_TEXT, COL_TITLE, COL_VECTOR,
};
use gentab_core::{Error, Result};
use gentab_store::schema::validate_column_id;
use gentab_store::TableStore;

pub struct TableAdmin {
    store: Arc<TableStore>,
    lock_window_ms: i64,
}

impl TableAdmin {
    pub fn new(store: Arc<TableStore>, lock_window_ms: i64) -> Self {
        Self { store, lock_window_ms }
    }

    /// Validate and create a generative table.
    pub async fn create_table(&self, table: Table) -> Result<Table> {
        for col in table.columns.iter().filter(|c| c.is_output()) {
            self.validate_gen_config(col).await?;
        }
        self.store.create_table(table).await
    }

    /// A Knowledge Table: the standard chunk columns plus any extra
    /// structured columns contributed by the source documents.
    pub async fn create_knowledge_table(
        &self,
        id: impl Into<TableId>,
        dim: i32,
        extra_columns: Vec<Column>,
    ) -> Result<Table> {
        let mut columns = vec![
            Column::input(COL_TEXT, DType::Str),
            Column::input(COL_TITLE, DType::Str),
            Column::input(COL_PAGE, DType::Int),
            Column::vector(COL_VECTOR, dim),
        ];
        columns.extend(extra_columns);
        self.create_table(Table::new(id, columns)).await
    }

    /// Duplicate a table's schema into a new table (e.g. spawning a chat
    /// conversation from a chat agent template). Rows are not copied.
    pub async fn duplicate_table(&self, source_id: &str, new_id: impl Into<TableId>) -> Result<Table> {
        let source = self.store.get_table(source_id).await?;
        let mut table = Table::new(new_id, source.columns.clone());
        table.parent_id = Some(source.id.clone());
        self.store.create_table(table).await
    }

    pub async fn add_column(&self, table_id: &str, column: Column) -> Result<Table> {
        validate_column_id(&column.id)?;
        self.validate_gen_config(&column).await?;
        self.with_mutation_window(table_id, |mut table, store| async move {
            if table.column(&column.id).is_some() {
                return Err(Error::validation(format!(
                    "table '{}' already has column '{}'",
                    table.id, column.id
                )));
            }
            let rows = store.get_rows(&table, None).await?;
            table.columns.push(column);
            store.replace_data_table(&table, &rows).await?;
            Ok(table)
        })
        .await
    }

    pub async fn drop_column(&self, table_id: &str, column_id: &ColumnId) -> Result<Table> {
        let column_id = column_id.clone();
        self.with_mutation_window(table_id, |mut table, store| async move {
            if table.column(&column_id).is_none() {
                return Err(Error::validation(format!(
                    "table '{}' has no column '{column_id}'",
                    table.id
                )));
            }
            let mut rows = store.get_rows(&table, None).await?;
            table.columns.retain(|c| c.id != column_id);
            for row in &mut rows {
                row.cells.remove(&column_id);
            }
            store.replace_data_table(&table, &rows).await?;
            Ok(table)
        })
        .await
    }

    /// Create, replace or clear a column's gen_config. Validation is re-run
    /// on every update, not only at first save.
    pub async fn update_gen_config(
        &self,
        table_id: &str,
        column_id: &ColumnId,
        gen_config: Option<GenConfig>,
    ) -> Result<Table> {
        let column_id = column_id.clone();
        if gen_config.is_some() {
            let current = self.store.get_table(table_id).await?;
            let col = current.column(&column_id).ok_or_else(|| {
                Error::validation(format!("table '{table_id}' has no column '{column_id}'"))
            })?;
            let probe = Column {
                id: column_id.clone(),
                dtype: col.dtype,
                gen_config: gen_config.clone(),
                dim: col.dim,
            };
            self.validate_gen_config(&probe).await?;
        }
        self.with_mutation_window(table_id, |mut table, store| async move {
            let rows = store.get_rows(&table, None).await?;
            let col = table
                .columns
                .iter_mut()
                .find(|c| c.id == column_id)
                .ok_or_else(|| {
                    Error::validation(format!("table has no column '{column_id}'"))
                })?;
            col.gen_config = gen_config;
            // The shadow state column appears or disappears with the
            // config, so the data table is rewritten.
            store.replace_data_table(&table, &rows).await?;
            Ok(table)
        })
        .await
    }

    /// Run one schema mutation inside an acquired `lock_till` window,
    /// releasing it whatever the outcome.
    async fn with_mutation_window<F, Fut>(&self, table_id: &str, f: F) -> Result<Table>
    where
        F: FnOnce(Table, Arc<TableStore>) -> Fut,
        Fut: std::future::Future<Output = Result<Table>>,
    {
        self.store.acquire_lock(table_id, self.lock_window_ms).await?;
        let table = self.store.get_table(table_id).await?;
        let outcome = f(table, self.store.clone()).await;
        match outcome {
            Ok(table) => {
                let committed = self
                    .store
                    .update_table(table_id, |t| {
                        t.columns = table.columns.clone();
                        t.lock_till = 0;
                        Ok(())
                    })
                    .await?;
                info!(table = table_id, "schema mutation committed");
                Ok(committed)
            }
            Err(e) => {
                self.store.release_lock(table_id).await?;
                Err(e)
            }
        }
    }

    /// A gen_config may only reference Knowledge Tables that exist at
    /// config-save time. Code/python source columns are checked lazily at
    /// execution time instead (they fail closed per row).
    pub async fn validate_gen_config(&self, column: &Column) -> Result<()> {
        match &column.gen_config {
            Some(GenConfig::Llm(cfg)) => {
                if let Some(rag) = &cfg.rag_params {
                    if rag.table_ids.is_empty() {
                        return Err(Error::validation(format!(
                            "column '{}': rag_params names no knowledge tables",
                            column.id
                        )));
                    }
                    if rag.k == 0 {
                        return Err(Error::validation(format!(
                            "column '{}': rag_params k must be positive",
                            column.id
                        )));
                    }
                    for table_id in &rag.table_ids {
                        let table = self.store.try_get_table(table_id).await?.ok_or_else(|| {
                            Error::validation(format!(
                                "column '{}': rag_params references unknown table '{table_id}'",
                                column.id
                            ))
                        })?;
                        if !table.is_knowledge() {
                            return Err(Error::validation(format!(
                                "column '{}': rag_params table '{table_id}' is not a knowledge table",
                                column.id
                            )));
                        }
                    }
                }
                Ok(())
            }
            Some(GenConfig::Embed(cfg)) => {
                if column.dtype != DType::Vector || column.dim.is_none() {
                    return Err(Error::validation(format!(
                        "embed column '{}' must have vector dtype with a dimension",
                        column.id
                    )));
                }
                if cfg.source_column.is_empty() {
                    return Err(Error::validation(format!(
                        "embed column '{}' names no source column",
                        column.id
                    )));
                }
                Ok(())
            }
            Some(GenConfig::Code(_) | GenConfig::Python(_) | GenConfig::Image(_)) | None => Ok(()),
        }
    }
}
