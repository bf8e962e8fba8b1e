//! Conversions between domain rows and Arrow record batches.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{
    Array, ArrayRef, BooleanArray, FixedSizeListArray, Float64Array, Int64Array, RecordBatch,
    StringArray, TimestampMillisecondArray,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::Utc;

use gentab_core::types::{Cell, CellState, CellValue, Column, ColumnId, DType, Row, RowId, Table};
use gentab_core::{Error, Result};

use crate::schema::{build_row_schema, state_column, state_from_str, state_to_str, COL_ID, COL_SEQ};

fn as_text(col: &Column, v: &CellValue) -> Result<Option<String>> {
    match v {
        CellValue::Null => Ok(None),
        CellValue::Vector(_) => Err(Error::validation(format!(
            "column '{}' expects text-like value, got vector",
            col.id
        ))),
        other => Ok(other.render()),
    }
}

fn as_int(col: &Column, v: &CellValue) -> Result<Option<i64>> {
    match v {
        CellValue::Null => Ok(None),
        CellValue::Int(i) => Ok(Some(*i)),
        _ => Err(Error::validation(format!("column '{}' expects int", col.id))),
    }
}

fn as_float(col: &Column, v: &CellValue) -> Result<Option<f64>> {
    match v {
        CellValue::Null => Ok(None),
        CellValue::Float(f) => Ok(Some(*f)),
        CellValue::Int(i) => Ok(Some(*i as f64)),
        _ => Err(Error::validation(format!("column '{}' expects float", col.id))),
    }
}

fn as_bool(col: &Column, v: &CellValue) -> Result<Option<bool>> {
    match v {
        CellValue::Null => Ok(None),
        CellValue::Bool(b) => Ok(Some(*b)),
        _ => Err(Error::validation(format!("column '{}' expects bool", col.id))),
    }
}

fn as_vector(col: &Column, v: &CellValue, dim: i32) -> Result<Option<Vec<Option<f32>>>> {
    match v {
        CellValue::Null => Ok(None),
        CellValue::Vector(vals) => {
            if vals.len() != dim as usize {
                return Err(Error::validation(format!(
                    "column '{}' expects {}-dim vector, got {}",
                    col.id,
                    dim,
                    vals.len()
                )));
            }
            Ok(Some(vals.iter().copied().map(Some).collect()))
        }
        _ => Err(Error::validation(format!("column '{}' expects vector", col.id))),
    }
}

fn column_array(col: &Column, values: &[Option<&Cell>]) -> Result<ArrayRef> {
    let null = CellValue::Null;
    let vals: Vec<&CellValue> = values.iter().map(|c| c.map_or(&null, |c| &c.value)).collect();
    Ok(match col.dtype {
        DType::Str | DType::Image | DType::Audio | DType::File | DType::Json => {
            let out: Vec<Option<String>> =
                vals.iter().map(|v| as_text(col, v)).collect::<Result<_>>()?;
            Arc::new(StringArray::from(out))
        }
        DType::Int => {
            let out: Vec<Option<i64>> = vals.iter().map(|v| as_int(col, v)).collect::<Result<_>>()?;
            Arc::new(Int64Array::from(out))
        }
        DType::Float => {
            let out: Vec<Option<f64>> =
                vals.iter().map(|v| as_float(col, v)).collect::<Result<_>>()?;
            Arc::new(Float64Array::from(out))
        }
        DType::Bool => {
            let out: Vec<Option<bool>> =
                vals.iter().map(|v| as_bool(col, v)).collect::<Result<_>>()?;
            Arc::new(BooleanArray::from(out))
        }
        DType::Vector => {
            let dim = col.dim.ok_or_else(|| {
                Error::validation(format!("vector column '{}' has no dimension", col.id))
            })?;
            let out: Vec<Option<Vec<Option<f32>>>> =
                vals.iter().map(|v| as_vector(col, v, dim)).collect::<Result<_>>()?;
            Arc::new(FixedSizeListArray::from_iter_primitive::<
                arrow_array::types::Float32Type,
                _,
                _,
            >(out.into_iter(), dim))
        }
    })
}

fn state_array(col: &Column, values: &[Option<&Cell>]) -> ArrayRef {
    let out: Vec<Option<&str>> = values
        .iter()
        .map(|c| c.map(|c| state_to_str(c.state)))
        .collect();
    Arc::new(StringArray::from(out))
}

/// Full-width batch for inserting rows.
pub fn rows_to_batch(table: &Table, rows: &[Row]) -> Result<RecordBatch> {
    let schema = build_row_schema(table)?;
    let now = Utc::now().timestamp_millis();
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let seqs: Vec<i64> = rows.iter().map(|r| r.seq).collect();
    let created: Vec<i64> = vec![now; rows.len()];
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(Int64Array::from(seqs)),
        Arc::new(TimestampMillisecondArray::from(created)),
    ];
    for col in &table.columns {
        let per_row: Vec<Option<&Cell>> = rows.iter().map(|r| r.cells.get(&col.id)).collect();
        arrays.push(column_array(col, &per_row)?);
        if col.is_output() {
            arrays.push(state_array(col, &per_row));
        }
    }
    RecordBatch::try_new(schema, arrays).map_err(Error::store)
}

/// Single-row batch covering only `id` plus the given cells, used with
/// `merge_insert` to update cells in place.
pub fn cells_to_subset_batch(
    table: &Table,
    row_id: &RowId,
    cells: &BTreeMap<ColumnId, Cell>,
) -> Result<RecordBatch> {
    let mut fields = vec![Field::new(COL_ID, DataType::Utf8, false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from(vec![row_id.clone()]))];
    for (col_id, cell) in cells {
        let col = table
            .column(col_id)
            .ok_or_else(|| Error::validation(format!("unknown column '{col_id}'")))?;
        fields.push(Field::new(&col.id, crate::schema::arrow_type(col)?, true));
        arrays.push(column_array(col, &[Some(cell)])?);
        if col.is_output() {
            fields.push(Field::new(state_column(&col.id), DataType::Utf8, true));
            arrays.push(state_array(col, &[Some(cell)]));
        }
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(Error::store)
}

fn read_cell_value(col: &Column, array: &ArrayRef, i: usize) -> Result<CellValue> {
    if array.is_null(i) {
        return Ok(CellValue::Null);
    }
    Ok(match col.dtype {
        DType::Str | DType::Image | DType::Audio | DType::File => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Error::store(format!("column '{}' is not Utf8", col.id)))?;
            CellValue::Str(arr.value(i).to_string())
        }
        DType::Json => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Error::store(format!("column '{}' is not Utf8", col.id)))?;
            match serde_json::from_str(arr.value(i)) {
                Ok(v) => CellValue::Json(v),
                Err(_) => CellValue::Str(arr.value(i).to_string()),
            }
        }
        DType::Int => {
            let arr = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| Error::store(format!("column '{}' is not Int64", col.id)))?;
            CellValue::Int(arr.value(i))
        }
        DType::Float => {
            let arr = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| Error::store(format!("column '{}' is not Float64", col.id)))?;
            CellValue::Float(arr.value(i))
        }
        DType::Bool => {
            let arr = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| Error::store(format!("column '{}' is not Boolean", col.id)))?;
            CellValue::Bool(arr.value(i))
        }
        DType::Vector => {
            let arr = array
                .as_any()
                .downcast_ref::<FixedSizeListArray>()
                .ok_or_else(|| Error::store(format!("column '{}' is not a vector", col.id)))?;
            let inner = arr.value(i);
            let vals = inner.as_primitive::<arrow_array::types::Float32Type>();
            CellValue::Vector(vals.values().to_vec())
        }
    })
}

pub fn batch_to_rows(table: &Table, batch: &RecordBatch) -> Result<Vec<Row>> {
    let ids = batch
        .column_by_name(COL_ID)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::store("missing id column"))?;
    let seqs = batch
        .column_by_name(COL_SEQ)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| Error::store("missing seq column"))?;
    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let mut cells = BTreeMap::new();
        for col in &table.columns {
            let Some(array) = batch.column_by_name(&col.id) else {
                continue;
            };
            let value = read_cell_value(col, array, i)?;
            let state = if col.is_output() {
                batch
                    .column_by_name(&state_column(&col.id))
                    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                    .filter(|c| !c.is_null(i))
                    .map_or(CellState::Done, |c| state_from_str(c.value(i)))
            } else {
                CellState::Done
            };
            cells.insert(col.id.clone(), Cell { value, state });
        }
        rows.push(Row { id: ids.value(i).to_string(), seq: seqs.value(i), cells });
    }
    Ok(rows)
}
