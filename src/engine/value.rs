use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

use crate::error::{DbError, Result};

/// Result of a boolean evaluation under SQL three-valued logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    /// Filters treat UNKNOWN as "not satisfied".
    pub fn is_true(self) -> bool {
        self == Truth::True
    }

    pub fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    pub fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    pub fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

/// A single column value, as stored in a row or produced by evaluation.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    Text(String),
    /// Milliseconds since the Unix epoch, UTC
    Date(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// String form used by equality comparison and text columns.
    /// `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Long(v) => Some(v.to_string()),
            Value::Double(v) => Some(format_double(*v)),
            Value::Text(s) => Some(s.clone()),
            Value::Date(ms) => Some(format_date(*ms)),
        }
    }

    pub fn to_long(&self) -> Result<Option<i64>> {
        Ok(match self {
            Value::Null => None,
            Value::Boolean(b) => Some(*b as i64),
            Value::Long(v) => Some(*v),
            Value::Double(v) => Some(*v as i64),
            Value::Text(s) => Some(parse_long(s)?),
            Value::Date(ms) => Some(*ms),
        })
    }

    pub fn to_double(&self) -> Result<Option<f64>> {
        Ok(match self {
            Value::Null => None,
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Long(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Text(s) => Some(parse_double(s)?),
            Value::Date(ms) => Some(*ms as f64),
        })
    }

    pub fn to_truth(&self) -> Result<Truth> {
        match self {
            Value::Null => Ok(Truth::Unknown),
            Value::Boolean(b) => Ok(Truth::from_bool(*b)),
            Value::Long(v) => Ok(Truth::from_bool(*v != 0)),
            Value::Double(v) => Ok(Truth::from_bool(*v != 0.0)),
            Value::Text(s) => Err(DbError::Conversion(format!("'{s}' is not a boolean"))),
            Value::Date(_) => Err(DbError::Conversion("a date is not a boolean".to_string())),
        }
    }

    /// Milliseconds since the epoch; text is parsed as an ISO-8601 date.
    pub fn to_date(&self) -> Result<Option<i64>> {
        match self {
            Value::Null => Ok(None),
            Value::Date(ms) | Value::Long(ms) => Ok(Some(*ms)),
            Value::Text(s) => parse_date(s).map(Some),
            other => Err(DbError::Conversion(format!("{other} is not a date"))),
        }
    }

    /// JSON rendering for query output; dates print as ISO-8601 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Long(v) => serde_json::Value::from(*v),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Date(ms) => serde_json::Value::String(format_date(*ms)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            other => match other.to_text() {
                Some(s) => write!(f, "{s}"),
                None => write!(f, "NULL"),
            },
        }
    }
}

/// Orders two non-null values for MIN/MAX: numbers numerically, anything
/// else by its text form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Long(x), Value::Long(y)) | (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        _ => match (a.to_double(), b.to_double()) {
            (Ok(Some(x)), Ok(Some(y))) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_text().cmp(&b.to_text()),
        },
    }
}

/// Formats a double the way it prints in query results: integral values
/// keep a trailing `.0`.
pub fn format_double(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

pub fn format_date(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => ms.to_string(),
    }
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates.
pub fn parse_date(s: &str) -> Result<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| DbError::Conversion(format!("'{s}' is not a date")))
}

pub fn parse_long(s: &str) -> Result<i64> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| DbError::Conversion(format!("'{s}' is not a valid long")))
}

pub fn parse_double(s: &str) -> Result<f64> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| DbError::Conversion(format!("'{s}' is not a valid double")))
}
