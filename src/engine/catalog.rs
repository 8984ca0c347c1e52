use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, str::FromStr};

use super::storage::BLOCK_SIZE;
use super::value::{format_double, Value};
use crate::error::{DbError, Result};

/// Row flag bit marking a slot as holding a live row.
pub const ROW_LIVE: u8 = 0x01;

/// Enumeration of supported column data types.
///
/// Every type has a fixed on-disk width so rows are fixed-length:
///
/// ## Type Mapping
/// - `Int` ↔ `Value::Long`, stored as 4 bytes
/// - `BigInt` ↔ `Value::Long`, stored as 8 bytes
/// - `Double` ↔ `Value::Double`, stored as 8 bytes
/// - `Varchar(n)` ↔ `Value::Text`, stored as a 2-byte length plus `n` bytes
/// - `Date` ↔ `Value::Date`, stored as 8 bytes of epoch millis
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    BigInt,
    Double,
    Varchar(u16),
    Date,
}

impl ColumnType {
    /// Bytes the column occupies in a row.
    pub fn width(&self) -> usize {
        match self {
            ColumnType::Int => 4,
            ColumnType::BigInt | ColumnType::Double | ColumnType::Date => 8,
            ColumnType::Varchar(n) => 2 + *n as usize,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int => write!(f, "INT"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Varchar(n) => write!(f, "VARCHAR({n})"),
            ColumnType::Date => write!(f, "DATE"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = DbError;

    /// Parses SQL type names such as `INT`, `BIGINT` or `VARCHAR(32)`.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "INT" | "INTEGER" => Ok(ColumnType::Int),
            "BIGINT" | "LONG" => Ok(ColumnType::BigInt),
            "DOUBLE" | "REAL" | "FLOAT" => Ok(ColumnType::Double),
            "DATE" | "TIMESTAMP" => Ok(ColumnType::Date),
            _ => {
                let len = upper
                    .strip_prefix("VARCHAR(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|n| n.trim().parse::<u16>().ok())
                    .ok_or_else(|| DbError::Schema(format!("unknown column type '{s}'")))?;
                Ok(ColumnType::Varchar(len))
            }
        }
    }
}

/// Definition of a single column within a table.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Column {
    /// Column name (must be unique within a table)
    pub name: String,
    pub col_type: ColumnType,
}

/// Schema definition for a table, persisted in the table header.
///
/// ## Column Ordering
/// The order of columns in `columns` determines:
/// - `SELECT *` projection order
/// - `INSERT` without a column list
/// - the row storage layout
///
/// ## Row Layout
/// ```text
/// [flags:1][null bitmap:ceil(n/8)][col 0][col 1]...[col n-1]
///     |            └─ bit i set when column i is NULL
///     └─ ROW_LIVE when the slot holds a row
/// ```
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct TableSchema {
    /// Table name (unique within the database)
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn bitmap_len(&self) -> usize {
        self.columns.len().div_ceil(8)
    }

    /// Total bytes per row slot, including the flag byte and null bitmap.
    pub fn row_size(&self) -> usize {
        1 + self.bitmap_len() + self.columns.iter().map(|c| c.col_type.width()).sum::<usize>()
    }

    /// Checks the schema can back a table: at least one column, unique
    /// column names, and a row that fits in a block.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DbError::Schema("table name is empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(DbError::Schema(format!("table '{}' has no columns", self.name)));
        }
        let mut seen = HashSet::new();
        for c in &self.columns {
            if !seen.insert(c.name.to_ascii_lowercase()) {
                return Err(DbError::Schema(format!(
                    "duplicate column '{}' in table '{}'",
                    c.name, self.name
                )));
            }
        }
        if self.row_size() > BLOCK_SIZE {
            return Err(DbError::Schema(format!(
                "row of table '{}' is {} bytes, larger than a block",
                self.name,
                self.row_size()
            )));
        }
        Ok(())
    }

    /// Encodes `values` into a row slot, coercing each to its column type.
    pub fn encode_row(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.columns.len() {
            return Err(DbError::Schema(format!(
                "table '{}' has {} columns but {} values were supplied",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }

        let mut buf = vec![0u8; self.row_size()];
        buf[0] = ROW_LIVE;
        let mut offset = 1 + self.bitmap_len();

        for (i, (col, value)) in self.columns.iter().zip(values).enumerate() {
            let width = col.col_type.width();
            let slot = &mut buf[offset..offset + width];
            offset += width;

            if value.is_null() {
                buf[1 + i / 8] |= 1 << (i % 8);
                continue;
            }
            encode_column(col, value, slot)?;
        }
        Ok(buf)
    }

    /// Decodes a row slot. The slot must be at least `row_size()` bytes.
    pub fn decode_row(&self, slot: &[u8]) -> Result<Vec<Value>> {
        if slot.len() < self.row_size() {
            return Err(DbError::Corrupt(self.name.clone(), "short row".to_string()));
        }
        let mut offset = 1 + self.bitmap_len();
        let mut out = Vec::with_capacity(self.columns.len());

        for (i, col) in self.columns.iter().enumerate() {
            let width = col.col_type.width();
            let bytes = &slot[offset..offset + width];
            offset += width;

            if slot[1 + i / 8] & (1 << (i % 8)) != 0 {
                out.push(Value::Null);
                continue;
            }
            out.push(decode_column(&self.name, col, bytes)?);
        }
        Ok(out)
    }
}

fn encode_column(col: &Column, value: &Value, slot: &mut [u8]) -> Result<()> {
    let conversion = |what: &str| {
        DbError::Conversion(format!("can't store {value} in {} column '{}'", what, col.name))
    };
    match col.col_type {
        ColumnType::Int => {
            let v = value.to_long()?.ok_or_else(|| conversion("INT"))?;
            let v = i32::try_from(v).map_err(|_| conversion("INT"))?;
            slot.copy_from_slice(&v.to_be_bytes());
        }
        ColumnType::BigInt => {
            let v = value.to_long()?.ok_or_else(|| conversion("BIGINT"))?;
            slot.copy_from_slice(&v.to_be_bytes());
        }
        ColumnType::Double => {
            let v = value.to_double()?.ok_or_else(|| conversion("DOUBLE"))?;
            slot.copy_from_slice(&v.to_be_bytes());
        }
        ColumnType::Date => {
            let v = value.to_date()?.ok_or_else(|| conversion("DATE"))?;
            slot.copy_from_slice(&v.to_be_bytes());
        }
        ColumnType::Varchar(max) => {
            let text = match value {
                Value::Double(d) => format_double(*d),
                other => other.to_text().ok_or_else(|| conversion("VARCHAR"))?,
            };
            if text.len() > max as usize {
                return Err(DbError::Schema(format!(
                    "value of {} bytes is too long for column '{}' {}",
                    text.len(),
                    col.name,
                    col.col_type
                )));
            }
            slot[..2].copy_from_slice(&(text.len() as u16).to_be_bytes());
            slot[2..2 + text.len()].copy_from_slice(text.as_bytes());
        }
    }
    Ok(())
}

fn decode_column(table: &str, col: &Column, bytes: &[u8]) -> Result<Value> {
    let corrupt = || DbError::Corrupt(table.to_string(), format!("bad value in column '{}'", col.name));
    let eight = |b: &[u8]| -> Result<[u8; 8]> { b.try_into().map_err(|_| corrupt()) };

    Ok(match col.col_type {
        ColumnType::Int => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| corrupt())?;
            Value::Long(i32::from_be_bytes(raw) as i64)
        }
        ColumnType::BigInt => Value::Long(i64::from_be_bytes(eight(bytes)?)),
        ColumnType::Double => Value::Double(f64::from_be_bytes(eight(bytes)?)),
        ColumnType::Date => Value::Date(i64::from_be_bytes(eight(bytes)?)),
        ColumnType::Varchar(_) => {
            let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            let text = bytes.get(2..2 + len).ok_or_else(corrupt)?;
            Value::Text(String::from_utf8(text.to_vec()).map_err(|_| corrupt())?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema {
            name: "users".to_string(),
            columns: vec![
                Column { name: "id".to_string(), col_type: ColumnType::Int },
                Column { name: "name".to_string(), col_type: ColumnType::Varchar(16) },
                Column { name: "score".to_string(), col_type: ColumnType::Double },
                Column { name: "born".to_string(), col_type: ColumnType::Date },
            ],
        }
    }

    #[test]
    fn parses_type_names() {
        assert_eq!("int".parse::<ColumnType>().unwrap(), ColumnType::Int);
        assert_eq!("VARCHAR(32)".parse::<ColumnType>().unwrap(), ColumnType::Varchar(32));
        assert_eq!("bigint".parse::<ColumnType>().unwrap(), ColumnType::BigInt);
        assert!("blob".parse::<ColumnType>().is_err());
    }

    #[test]
    fn row_layout_width() {
        // flag + 1 bitmap byte + 4 + (2 + 16) + 8 + 8
        assert_eq!(users().row_size(), 1 + 1 + 4 + 18 + 8 + 8);
    }

    #[test]
    fn encode_decode_with_nulls_and_coercion() {
        let schema = users();
        let row = schema
            .encode_row(&[
                Value::Text("7".into()),
                Value::Text("ada".into()),
                Value::Null,
                Value::Text("1970-01-02".into()),
            ])
            .unwrap();
        assert_eq!(row[0], ROW_LIVE);
        assert_eq!(
            schema.decode_row(&row).unwrap(),
            vec![
                Value::Long(7),
                Value::Text("ada".into()),
                Value::Null,
                Value::Date(86_400_000),
            ]
        );
    }

    #[test]
    fn rejects_bad_rows() {
        let schema = users();
        assert!(schema.encode_row(&[Value::Long(1)]).is_err());
        let long_name = Value::Text("x".repeat(17));
        assert!(matches!(
            schema.encode_row(&[Value::Long(1), long_name, Value::Null, Value::Null]),
            Err(DbError::Schema(_))
        ));
        assert!(schema
            .encode_row(&[Value::Long(1 << 40), Value::Null, Value::Null, Value::Null])
            .is_err());
    }

    #[test]
    fn validate_catches_duplicates_and_oversized_rows() {
        let mut schema = users();
        schema.columns.push(Column { name: "ID".to_string(), col_type: ColumnType::Int });
        assert!(schema.validate().is_err());

        let wide = TableSchema {
            name: "wide".to_string(),
            columns: vec![Column { name: "v".to_string(), col_type: ColumnType::Varchar(u16::MAX) }],
        };
        assert!(wide.validate().is_err());
        assert!(TableSchema::new("empty").validate().is_err());
        assert!(users().validate().is_ok());
    }
}
