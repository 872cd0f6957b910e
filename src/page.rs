//! The tabular page abstraction that models an untyped upstream
//! column-name → column-values response. A `Page` is the only shape the
//! Fetcher, Writer, and stage functions agree on.
//!
//! Version dependencies:
//! - rust_decimal = "1.30"
//! - serde_json = "1.0"
//! - thiserror = "1.0"

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

/// One column's worth of null-aware typed values.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Decimal(Vec<Option<Decimal>>),
    Str(Vec<Option<String>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Int(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Decimal(v) => v.len(),
            Column::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("column drift: upstream returned unexpected column {0:?} not declared in the schema")]
    UnknownColumn(String),
    #[error("column {0:?} missing from upstream response")]
    MissingColumn(String),
    #[error("columns have mismatched row counts: {0:?} has {1}, expected {2}")]
    RowCountMismatch(String, usize, usize),
    #[error("column {0:?}: cannot represent JSON value {1} as the declared type")]
    TypeMismatch(String, Value),
}

/// Declares the columns a [`Page`] is allowed to carry. `tolerate_extra`
/// lets an API Descriptor opt into ignoring unknown columns instead of
/// treating column drift as a fatal [`SchemaError::UnknownColumn`].
#[derive(Debug, Clone)]
pub struct PageSchema {
    pub columns: &'static [(&'static str, ColumnType)],
    pub tolerate_extra: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Float,
    Decimal,
    Str,
}

/// A column-oriented tabular page: one logical fetch's worth of rows,
/// keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    columns: HashMap<String, Column>,
    row_count: usize,
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a page from raw JSON rows (an upstream vendor response
    /// decoded as `Vec<serde_json::Map<String, Value>>`), validating
    /// against `schema`. This is the boundary where column-name drift is
    /// caught.
    pub fn from_json_rows(
        rows: &[serde_json::Map<String, Value>],
        schema: &PageSchema,
    ) -> Result<Self, SchemaError> {
        let mut page = Page {
            columns: HashMap::with_capacity(schema.columns.len()),
            row_count: rows.len(),
        };

        for (name, ty) in schema.columns {
            let mut column = match ty {
                ColumnType::Int => Column::Int(Vec::with_capacity(rows.len())),
                ColumnType::Float => Column::Float(Vec::with_capacity(rows.len())),
                ColumnType::Decimal => Column::Decimal(Vec::with_capacity(rows.len())),
                ColumnType::Str => Column::Str(Vec::with_capacity(rows.len())),
            };
            for row in rows {
                let value = row.get(*name).unwrap_or(&Value::Null);
                push_typed(&mut column, name, value)?;
            }
            page.columns.insert((*name).to_string(), column);
        }

        if !schema.tolerate_extra {
            let declared: std::collections::HashSet<&str> =
                schema.columns.iter().map(|(n, _)| *n).collect();
            for row in rows {
                for key in row.keys() {
                    if !declared.contains(key.as_str()) {
                        return Err(SchemaError::UnknownColumn(key.clone()));
                    }
                }
            }
        }

        Ok(page)
    }

    pub fn insert_column(&mut self, name: impl Into<String>, column: Column) {
        let name = name.into();
        if self.columns.is_empty() {
            self.row_count = column.len();
        }
        self.columns.insert(name, column);
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }
}

fn push_typed(column: &mut Column, name: &str, value: &Value) -> Result<(), SchemaError> {
    match (column, value) {
        (Column::Int(v), Value::Null) => v.push(None),
        (Column::Int(v), Value::Number(n)) => {
            v.push(Some(
                n.as_i64().ok_or_else(|| SchemaError::TypeMismatch(name.to_string(), value.clone()))?,
            ))
        }
        (Column::Float(v), Value::Null) => v.push(None),
        (Column::Float(v), Value::Number(n)) => v.push(Some(
            n.as_f64().ok_or_else(|| SchemaError::TypeMismatch(name.to_string(), value.clone()))?,
        )),
        (Column::Decimal(v), Value::Null) => v.push(None),
        (Column::Decimal(v), Value::Number(n)) => {
            let d = n
                .to_string()
                .parse::<Decimal>()
                .map_err(|_| SchemaError::TypeMismatch(name.to_string(), value.clone()))?;
            v.push(Some(d));
        }
        (Column::Decimal(v), Value::String(s)) => {
            let d = s
                .parse::<Decimal>()
                .map_err(|_| SchemaError::TypeMismatch(name.to_string(), value.clone()))?;
            v.push(Some(d));
        }
        (Column::Str(v), Value::Null) => v.push(None),
        (Column::Str(v), Value::String(s)) => v.push(Some(s.clone())),
        (Column::Str(v), Value::Number(n)) => v.push(Some(n.to_string())),
        (_, other) => {
            return Err(SchemaError::TypeMismatch(name.to_string(), other.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: PageSchema = PageSchema {
        columns: &[("trade_date", ColumnType::Int), ("close", ColumnType::Decimal)],
        tolerate_extra: false,
    };

    fn row(trade_date: i64, close: &str) -> serde_json::Map<String, Value> {
        let mut m = serde_json::Map::new();
        m.insert("trade_date".into(), json!(trade_date));
        m.insert("close".into(), json!(close));
        m
    }

    #[test]
    fn builds_page_from_well_formed_rows() {
        let rows = vec![row(20240111, "12.34"), row(20240112, "12.50")];
        let page = Page::from_json_rows(&rows, &SCHEMA).unwrap();
        assert_eq!(page.row_count(), 2);
        assert!(matches!(page.column("close"), Some(Column::Decimal(_))));
    }

    #[test]
    fn rejects_unknown_columns_as_schema_drift() {
        let mut bad_row = row(20240111, "12.34");
        bad_row.insert("surprise_column".into(), json!("oops"));
        let err = Page::from_json_rows(&[bad_row], &SCHEMA).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownColumn(_)));
    }

    #[test]
    fn tolerates_extra_columns_when_declared() {
        let schema = PageSchema {
            tolerate_extra: true,
            ..SCHEMA
        };
        let mut extra_row = row(20240111, "12.34");
        extra_row.insert("vendor_debug_flag".into(), json!(1));
        assert!(Page::from_json_rows(&[extra_row], &schema).is_ok());
    }

    #[test]
    fn missing_value_in_a_row_becomes_null() {
        let mut row = serde_json::Map::new();
        row.insert("trade_date".into(), json!(20240111));
        let page = Page::from_json_rows(&[row], &SCHEMA).unwrap();
        match page.column("close").unwrap() {
            Column::Decimal(v) => assert_eq!(v[0], None),
            _ => panic!("expected decimal column"),
        }
    }
}
