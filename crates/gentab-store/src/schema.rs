//! Arrow schema derivation for per-table row storage.
//!
//! Every data table carries `id` and `seq` system columns, one Arrow column
//! per declared table column, and one nullable state column per output
//! column so a cell's generation status is persisted distinct from its
//! content.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, TimeUnit};

use gentab_core::types::{CellState, Column, DType, Table};
use gentab_core::{Error, Result};

pub const COL_ID: &str = "id";
pub const COL_SEQ: &str = "seq";

/// Name of the persisted generation-state column shadowing an output
/// column.
pub fn state_column(col_id: &str) -> String {
    format!("{col_id}__state")
}

pub fn state_to_str(state: CellState) -> &'static str {
    match state {
        CellState::Pending => "pending",
        CellState::Streaming => "streaming",
        CellState::Done => "done",
        CellState::Error => "error",
    }
}

pub fn state_from_str(s: &str) -> CellState {
    match s {
        "pending" => CellState::Pending,
        "streaming" => CellState::Streaming,
        "error" => CellState::Error,
        _ => CellState::Done,
    }
}

pub fn arrow_type(col: &Column) -> Result<DataType> {
    Ok(match col.dtype {
        DType::Str | DType::Image | DType::Audio | DType::File | DType::Json => DataType::Utf8,
        DType::Int => DataType::Int64,
        DType::Float => DataType::Float64,
        DType::Bool => DataType::Boolean,
        DType::Vector => {
            let dim = col.dim.ok_or_else(|| {
                Error::validation(format!("vector column '{}' has no dimension", col.id))
            })?;
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim)
        }
    })
}

pub fn build_row_schema(table: &Table) -> Result<Arc<Schema>> {
    let mut fields = vec![
        Field::new(COL_ID, DataType::Utf8, false),
        Field::new(COL_SEQ, DataType::Int64, false),
        Field::new("created_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
    ];
    for col in &table.columns {
        fields.push(Field::new(&col.id, arrow_type(col)?, true));
        if col.is_output() {
            fields.push(Field::new(state_column(&col.id), DataType::Utf8, true));
        }
    }
    Ok(Arc::new(Schema::new(fields)))
}

/// Name of the Lance data table backing a table's rows.
pub fn data_table_name(table_id: &str) -> String {
    format!("rows_{table_id}")
}

/// Table ids end up in Lance table names and SQL filters; keep them to a
/// safe character set.
pub fn validate_table_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid table id '{id}'")))
    }
}

/// Column ids become Arrow field names; forbid the system names and the
/// state-column suffix.
pub fn validate_column_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id != COL_ID
        && id != COL_SEQ
        && id != "created_at"
        && !id.ends_with("__state")
        && id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ');
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid column id '{id}'")))
    }
}
