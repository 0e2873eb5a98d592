use std::sync::Arc;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{Statement, params_from_iter};

use crate::results::ResultSet;
use crate::types::RowValues;

fn extract_value(value: ValueRef<'_>) -> RowValues {
    match value {
        ValueRef::Null => RowValues::Null,
        ValueRef::Integer(i) => RowValues::Int(i),
        ValueRef::Real(f) => RowValues::Float(f),
        ValueRef::Text(t) => RowValues::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => RowValues::Blob(b.to_vec()),
    }
}

/// Run a prepared statement and collect its rows, or its change count when it returns none.
///
/// # Errors
/// Returns the `rusqlite` error from binding, stepping or reading a column.
pub fn build_result_set(stmt: &mut Statement<'_>, params: &[Value]) -> rusqlite::Result<ResultSet> {
    if stmt.column_count() == 0 {
        let changed = stmt.execute(params_from_iter(params.iter()))?;
        return Ok(ResultSet::affected(changed));
    }

    let column_names: Arc<Vec<String>> = Arc::new(
        stmt.column_names()
            .iter()
            .map(std::string::ToString::to_string)
            .collect(),
    );
    let col_count = column_names.len();
    let mut result_set = ResultSet::with_capacity(10);
    result_set.set_column_names(column_names);

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        let mut row_values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            row_values.push(extract_value(row.get_ref(i)?));
        }
        result_set.add_row_values(row_values);
    }
    Ok(result_set)
}
