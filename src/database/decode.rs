use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use sqlx::mysql::types::MySqlTime;
use sqlx::mysql::{MySqlColumn, MySqlRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::Arc;

use super::types::{ResultColumn, ResultRow, Value};

/// Works for the columns of a fetched row and of a described statement.
pub(crate) fn column_metadata(columns: &[MySqlColumn]) -> Arc<[ResultColumn]> {
    columns
        .iter()
        .enumerate()
        .map(|(ordinal, col)| ResultColumn {
            name: col.name().to_string(),
            type_name: col.type_info().name().to_string(),
            ordinal,
        })
        .collect()
}

pub(crate) fn convert_rows(rows: &[MySqlRow]) -> Result<(Arc<[ResultColumn]>, Vec<ResultRow>)> {
    let Some(first) = rows.first() else {
        return Ok((Arc::from(Vec::new()), Vec::new()));
    };

    let columns = column_metadata(first.columns());
    let converted = rows
        .iter()
        .map(|row| convert_row(row, &columns))
        .collect::<Result<Vec<_>>>()?;
    Ok((columns, converted))
}

fn convert_row(row: &MySqlRow, columns: &Arc<[ResultColumn]>) -> Result<ResultRow> {
    let values = columns
        .iter()
        .map(|column| decode_cell(row, column))
        .collect::<Result<Vec<_>>>()?;
    Ok(ResultRow::new(columns.clone(), values))
}

fn decode_cell(row: &MySqlRow, column: &ResultColumn) -> Result<Value> {
    let index = column.ordinal;
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let typed = match column.type_name.as_str() {
        "BOOLEAN" => row.try_get::<bool, _>(index).map(Value::Bool),
        name if name.ends_with("UNSIGNED") => row.try_get::<u64, _>(index).map(Value::UInt),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(index).map(Value::Int)
        }
        "FLOAT" => row
            .try_get::<f32, _>(index)
            .map(|v| Value::Float(v.into())),
        "DOUBLE" => row.try_get::<f64, _>(index).map(Value::Float),
        "DECIMAL" => row.try_get::<Decimal, _>(index).map(Value::Decimal),
        "DATE" => row.try_get::<NaiveDate, _>(index).map(Value::Date),
        "TIME" => row.try_get::<NaiveTime, _>(index).map(Value::Time),
        "DATETIME" | "TIMESTAMP" => row.try_get::<NaiveDateTime, _>(index).map(Value::DateTime),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => row.try_get::<Vec<u8>, _>(index).map(Value::Bytes),
        _ => row.try_get::<String, _>(index).map(Value::Text),
    };

    if let Ok(value) = typed {
        return Ok(value);
    }

    // TIME spans -838:59:59..838:59:59, beyond what NaiveTime holds
    if column.type_name == "TIME" {
        if let Ok(time) = row.try_get::<MySqlTime, _>(index) {
            return Ok(Value::Text(time.to_string()));
        }
    }
    if let Some(value) = undecodable_temporal(&column.type_name) {
        tracing::debug!("Column `{}` holds a zero date, reading it as NULL", column.name);
        return Ok(value);
    }

    // Columns whose reported type doesn't match their encoding (YEAR, ENUM, ...)
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Ok(Value::Text(v));
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(Value::Int(v));
    }
    if let Ok(v) = row.try_get::<u64, _>(index) {
        return Ok(Value::UInt(v));
    }
    row.try_get::<Vec<u8>, _>(index)
        .map(Value::Bytes)
        .map_err(|e| {
            anyhow!(
                "Cannot decode column `{}` of type {}: {}",
                column.name,
                column.type_name,
                e
            )
        })
}

/// Zero dates (`0000-00-00`) are the only DATE/DATETIME values chrono rejects.
fn undecodable_temporal(type_name: &str) -> Option<Value> {
    match type_name {
        "DATE" | "DATETIME" | "TIMESTAMP" => Some(Value::Null),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_dates_read_as_null() {
        assert_eq!(undecodable_temporal("DATE"), Some(Value::Null));
        assert_eq!(undecodable_temporal("DATETIME"), Some(Value::Null));
        assert_eq!(undecodable_temporal("TIMESTAMP"), Some(Value::Null));
        assert_eq!(undecodable_temporal("TIME"), None);
        assert_eq!(undecodable_temporal("VARCHAR"), None);
    }
}
