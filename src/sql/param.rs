use parking_lot::Mutex;
use std::{fmt, io::Read, sync::Arc};

use crate::engine::value::{format_date, format_double, parse_double, parse_long, Truth, Value};
use crate::error::{DbError, Result};

/// A binary stream handed in as a parameter value, with its declared length.
#[derive(Clone)]
pub struct ParamStream {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    length: u64,
}

impl ParamStream {
    pub fn new(reader: impl Read + Send + 'static, length: u64) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Box::new(reader))),
            length,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads the stream to its end.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.length as usize);
        self.reader.lock().read_to_end(&mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for ParamStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParamStream({} bytes)", self.length)
    }
}

/// The single value a positional parameter holds. Setting a new value
/// replaces the previous one, tag included.
#[derive(Clone, Debug, Default)]
pub enum ParamValue {
    #[default]
    Null,
    Boolean(bool),
    Str(String),
    Long(i64),
    Double(f64),
    /// Milliseconds since the epoch
    Date(i64),
    Stream(ParamStream),
    Bytes(Vec<u8>),
}

impl ParamValue {
    fn tag(&self) -> &'static str {
        match self {
            ParamValue::Null => "NULL",
            ParamValue::Boolean(_) => "BOOLEAN",
            ParamValue::Str(_) => "STRING",
            ParamValue::Long(_) => "LONG",
            ParamValue::Double(_) => "DOUBLE",
            ParamValue::Date(_) => "DATE",
            ParamValue::Stream(_) => "BINARY-STREAM",
            ParamValue::Bytes(_) => "BYTES",
        }
    }
}

impl From<Value> for ParamValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => ParamValue::Null,
            Value::Boolean(b) => ParamValue::Boolean(b),
            Value::Long(v) => ParamValue::Long(v),
            Value::Double(v) => ParamValue::Double(v),
            Value::Text(s) => ParamValue::Str(s),
            Value::Date(ms) => ParamValue::Date(ms),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Boolean(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Long(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Double(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// A positional parameter slot.
///
/// ## Conversions
/// ```text
/// tag      | string       | long        | double    | boolean      | date
/// ---------+--------------+-------------+-----------+--------------+----------
/// NULL     | None         | 0           | 0.0       | UNKNOWN      | 0
/// BOOLEAN  | "1" / "0"    | 1 / 0       | 1.0 / 0.0 | TRUE / FALSE | error
/// LONG     | decimal      | as is       | widened   | nonzero      | epoch ms
/// DOUBLE   | text         | truncated   | as is     | nonzero      | truncated
/// STRING   | as is        | parsed      | parsed    | error        | error
/// DATE     | ISO-8601     | epoch ms    | error     | error        | as is
/// ```
///
/// Any other combination is a [`DbError::Conversion`], as is text that
/// does not parse as a number.
#[derive(Clone, Debug, Default)]
pub struct Param {
    value: ParamValue,
}

impl Param {
    /// The current value and its tag.
    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    /// Replaces the value, tag included.
    pub fn set(&mut self, value: ParamValue) {
        self.value = value;
    }

    pub fn set_null(&mut self) {
        self.value = ParamValue::Null;
    }

    pub fn set_boolean(&mut self, v: bool) {
        self.value = ParamValue::Boolean(v);
    }

    /// Stores text; numeric reads parse it on demand.
    pub fn set_string(&mut self, v: impl Into<String>) {
        self.value = ParamValue::Str(v.into());
    }

    pub fn set_long(&mut self, v: i64) {
        self.value = ParamValue::Long(v);
    }

    pub fn set_double(&mut self, v: f64) {
        self.value = ParamValue::Double(v);
    }

    /// Stores a date as milliseconds since the Unix epoch, UTC.
    pub fn set_date(&mut self, millis: i64) {
        self.value = ParamValue::Date(millis);
    }

    /// Stores a stream to be drained by [`Param::eval_bytes`]. The bytes
    /// are only readable as bytes or as the stream itself.
    pub fn set_binary_stream(&mut self, stream: ParamStream) {
        self.value = ParamValue::Stream(stream);
    }

    /// Stores raw bytes, readable only through [`Param::eval_bytes`].
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.value = ParamValue::Bytes(bytes);
    }

    /// Resets the slot to NULL.
    pub fn clear(&mut self) {
        self.value = ParamValue::Null;
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, ParamValue::Null)
    }

    fn incompatible(&self, wanted: &str) -> DbError {
        DbError::Conversion(format!(
            "{} parameter can't be read as {}",
            self.value.tag(),
            wanted
        ))
    }

    pub fn eval_string(&self) -> Result<Option<String>> {
        match &self.value {
            ParamValue::Null => Ok(None),
            ParamValue::Boolean(b) => Ok(Some(if *b { "1" } else { "0" }.to_string())),
            ParamValue::Str(s) => Ok(Some(s.clone())),
            ParamValue::Long(v) => Ok(Some(v.to_string())),
            ParamValue::Double(v) => Ok(Some(format_double(*v))),
            ParamValue::Date(ms) => Ok(Some(format_date(*ms))),
            ParamValue::Stream(_) | ParamValue::Bytes(_) => Err(self.incompatible("a string")),
        }
    }

    pub fn eval_long(&self) -> Result<i64> {
        match &self.value {
            ParamValue::Null => Ok(0),
            ParamValue::Boolean(b) => Ok(*b as i64),
            ParamValue::Str(s) => parse_long(s),
            ParamValue::Long(v) => Ok(*v),
            ParamValue::Double(v) => Ok(*v as i64),
            ParamValue::Date(ms) => Ok(*ms),
            ParamValue::Stream(_) | ParamValue::Bytes(_) => Err(self.incompatible("a long")),
        }
    }

    pub fn eval_double(&self) -> Result<f64> {
        match &self.value {
            ParamValue::Null => Ok(0.0),
            ParamValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            ParamValue::Str(s) => parse_double(s),
            ParamValue::Long(v) => Ok(*v as f64),
            ParamValue::Double(v) => Ok(*v),
            _ => Err(self.incompatible("a double")),
        }
    }

    pub fn eval_boolean(&self) -> Result<Truth> {
        match &self.value {
            ParamValue::Null => Ok(Truth::Unknown),
            ParamValue::Boolean(b) => Ok(Truth::from_bool(*b)),
            ParamValue::Long(v) => Ok(Truth::from_bool(*v != 0)),
            ParamValue::Double(v) => Ok(Truth::from_bool(*v != 0.0)),
            _ => Err(self.incompatible("a boolean")),
        }
    }

    /// The value as epoch milliseconds. LONG values are taken to be epoch
    /// milliseconds already.
    pub fn eval_date(&self) -> Result<i64> {
        match &self.value {
            ParamValue::Null => Ok(0),
            ParamValue::Long(v) | ParamValue::Date(v) => Ok(*v),
            ParamValue::Double(v) => Ok(*v as i64),
            _ => Err(self.incompatible("a date")),
        }
    }

    pub fn eval_bytes(&self) -> Result<Vec<u8>> {
        match &self.value {
            ParamValue::Bytes(b) => Ok(b.clone()),
            ParamValue::Stream(s) => s.read_all(),
            _ => Err(self.incompatible("bytes")),
        }
    }

    pub fn eval_stream(&self) -> Result<ParamStream> {
        match &self.value {
            ParamValue::Stream(s) => Ok(s.clone()),
            _ => Err(self.incompatible("a binary stream")),
        }
    }

    /// The parameter as a column value.
    pub fn to_value(&self) -> Result<Value> {
        match &self.value {
            ParamValue::Null => Ok(Value::Null),
            ParamValue::Boolean(b) => Ok(Value::Boolean(*b)),
            ParamValue::Str(s) => Ok(Value::Text(s.clone())),
            ParamValue::Long(v) => Ok(Value::Long(*v)),
            ParamValue::Double(v) => Ok(Value::Double(*v)),
            ParamValue::Date(ms) => Ok(Value::Date(*ms)),
            ParamValue::Stream(_) | ParamValue::Bytes(_) => Err(self.incompatible("a column value")),
        }
    }
}

/// Parameter slots for one execution of a query, indexed from 1.
///
/// Each execution owns its own `Params`, so a shared bound query never
/// sees another execution's values.
#[derive(Clone, Debug, Default)]
pub struct Params {
    slots: Vec<Param>,
}

impl Params {
    /// `count` NULL slots.
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![Param::default(); count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slot for `?` number `index`, counting from 1.
    pub fn get(&self, index: usize) -> Result<&Param> {
        index
            .checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .ok_or(DbError::ParamIndex(index))
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Param> {
        index
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i))
            .ok_or(DbError::ParamIndex(index))
    }

    pub fn set(&mut self, index: usize, value: ParamValue) -> Result<()> {
        self.get_mut(index)?.set(value);
        Ok(())
    }

    /// Fills slots 1..=values.len() in order.
    pub fn bind_all(&mut self, values: &[ParamValue]) -> Result<()> {
        if values.len() > self.slots.len() {
            return Err(DbError::ParamIndex(values.len()));
        }
        for (slot, v) in self.slots.iter_mut().zip(values) {
            slot.set(v.clone());
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(Param::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn long_round_trip() {
        let mut p = Param::default();
        p.set_long(42);
        assert_eq!(p.eval_string().unwrap().as_deref(), Some("42"));
        assert_eq!(p.eval_double().unwrap(), 42.0);
        assert_eq!(p.eval_boolean().unwrap(), Truth::True);
    }

    #[test]
    fn clear_resets_to_null() {
        let mut p = Param::default();
        p.set_boolean(true);
        p.clear();
        assert!(p.is_null());
        assert_eq!(p.eval_boolean().unwrap(), Truth::Unknown);
        assert_eq!(p.eval_long().unwrap(), 0);
        assert_eq!(p.eval_string().unwrap(), None);
    }

    #[test]
    fn setting_replaces_the_tag() {
        let mut p = Param::default();
        p.set_string("12");
        assert_eq!(p.eval_long().unwrap(), 12);
        p.set_double(2.75);
        assert_eq!(p.eval_long().unwrap(), 2);
        assert_eq!(p.eval_string().unwrap().as_deref(), Some("2.75"));
        assert!(matches!(p.value(), ParamValue::Double(_)));
    }

    #[test]
    fn booleans_and_dates() {
        let mut p = Param::default();
        p.set_boolean(false);
        assert_eq!(p.eval_string().unwrap().as_deref(), Some("0"));
        assert_eq!(p.eval_double().unwrap(), 0.0);

        p.set_date(1_000);
        assert_eq!(p.eval_long().unwrap(), 1_000);
        assert_eq!(p.eval_string().unwrap().as_deref(), Some("1970-01-01T00:00:01.000Z"));
        assert!(p.eval_double().is_err());
        assert!(p.eval_boolean().is_err());
    }

    #[test]
    fn date_reads() {
        let mut p = Param::default();
        assert_eq!(p.eval_date().unwrap(), 0);
        p.set_date(86_400_000);
        assert_eq!(p.eval_date().unwrap(), 86_400_000);
        p.set_long(1_000);
        assert_eq!(p.eval_date().unwrap(), 1_000);
        p.set_double(1_500.9);
        assert_eq!(p.eval_date().unwrap(), 1_500);

        p.set_string("1970-01-02");
        assert!(matches!(p.eval_date(), Err(DbError::Conversion(_))));
        p.set_boolean(true);
        assert!(matches!(p.eval_date(), Err(DbError::Conversion(_))));
        p.set_bytes(vec![1, 2]);
        assert!(matches!(p.eval_date(), Err(DbError::Conversion(_))));
    }

    #[test]
    fn incompatible_reads_fail() {
        let mut p = Param::default();
        p.set_long(7);
        assert!(matches!(p.eval_stream(), Err(DbError::Conversion(_))));

        p.set_string("seven");
        assert!(matches!(p.eval_long(), Err(DbError::Conversion(_))));
        assert!(p.eval_boolean().is_err());
    }

    #[test]
    fn streams_and_bytes() {
        let mut p = Param::default();
        p.set_binary_stream(ParamStream::new(Cursor::new(b"abc".to_vec()), 3));
        assert_eq!(p.eval_stream().unwrap().len(), 3);
        assert_eq!(p.eval_bytes().unwrap(), b"abc");
        assert!(p.eval_long().is_err());

        p.set_bytes(vec![1, 2]);
        assert_eq!(p.eval_bytes().unwrap(), vec![1, 2]);
        assert!(p.to_value().is_err());
    }

    #[test]
    fn params_are_one_based() {
        let mut params = Params::new(2);
        assert!(matches!(params.get(0), Err(DbError::ParamIndex(0))));
        assert!(matches!(params.get(3), Err(DbError::ParamIndex(3))));
        params.set(2, ParamValue::Long(5)).unwrap();
        assert_eq!(params.get(2).unwrap().eval_long().unwrap(), 5);
        assert!(params.get(1).unwrap().is_null());

        params.bind_all(&[ParamValue::Str("a".into())]).unwrap();
        assert_eq!(params.get(1).unwrap().eval_string().unwrap().as_deref(), Some("a"));
        assert!(params.bind_all(&vec![ParamValue::Null; 3]).is_err());
    }
}
