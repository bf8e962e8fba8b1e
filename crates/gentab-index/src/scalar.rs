//! BTree scalar index over the row id column, used by structured filters.

use lancedb::index::scalar::BTreeIndexBuilder;
use lancedb::index::Index;
use lancedb::Connection;

use gentab_core::{Error, Result};
use gentab_store::schema::{data_table_name, COL_ID};

pub async fn build(conn: &Connection, table_id: &str) -> Result<()> {
    let table = conn
        .open_table(data_table_name(table_id))
        .execute()
        .await
        .map_err(Error::retrieval)?;
    table
        .create_index(&[COL_ID], Index::BTree(BTreeIndexBuilder::default()))
        .execute()
        .await
        .map_err(Error::retrieval)?;
    Ok(())
}
