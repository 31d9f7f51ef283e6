//! Core types for AggDB

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a key column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// 64-bit signed integer (also used for timestamps and dates)
    Int,
    /// UTF-8 string
    String,
}

impl KeyType {
    /// Check whether a value has this type
    pub fn accepts(&self, value: &KeyValue) -> bool {
        matches!(
            (self, value),
            (KeyType::Int, KeyValue::Int(_)) | (KeyType::String, KeyValue::String(_))
        )
    }
}

/// Declared type of a measure column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureType {
    /// 64-bit signed integer
    Int,
    /// 64-bit float
    Float,
}

/// A single key column value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    /// 64-bit signed integer
    Int(i64),
    /// String
    String(String),
}

impl KeyValue {
    /// Get as i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KeyValue::Int(v) => Some(*v),
            KeyValue::String(_) => None,
        }
    }

    /// Get as str if possible
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyValue::String(s) => Some(s),
            KeyValue::Int(_) => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v as i64)
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::String(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::String(v.to_string())
    }
}

/// A measure column value (raw input or accumulator)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MeasureValue {
    /// No contribution yet
    Null,
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
}

impl MeasureValue {
    /// Get as f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MeasureValue::Float(v) => Some(*v),
            MeasureValue::Int(v) => Some(*v as f64),
            MeasureValue::Null => None,
        }
    }

    /// Get as i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MeasureValue::Int(v) => Some(*v),
            MeasureValue::Float(v) => Some(*v as i64),
            MeasureValue::Null => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, MeasureValue::Null)
    }

    /// Coerce to the declared measure type
    pub fn coerce(self, ty: MeasureType) -> Self {
        match (ty, self) {
            (_, MeasureValue::Null) => MeasureValue::Null,
            (MeasureType::Int, MeasureValue::Float(v)) => MeasureValue::Int(v as i64),
            (MeasureType::Float, MeasureValue::Int(v)) => MeasureValue::Float(v as f64),
            (_, v) => v,
        }
    }
}

impl From<f64> for MeasureValue {
    fn from(v: f64) -> Self {
        MeasureValue::Float(v)
    }
}

impl From<i64> for MeasureValue {
    fn from(v: i64) -> Self {
        MeasureValue::Int(v)
    }
}

impl From<i32> for MeasureValue {
    fn from(v: i32) -> Self {
        MeasureValue::Int(v as i64)
    }
}

/// Primary key: one value per declared key, in declared key order.
///
/// Ordered lexicographically. A prefix compares less than any of its
/// extensions, which is what range scans over key prefixes rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(Vec<KeyValue>);

impl PrimaryKey {
    /// Create a primary key from its values
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    /// The empty key (prefix of length zero)
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Key values in key order
    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    /// Get a single key column
    pub fn get(&self, index: usize) -> Option<&KeyValue> {
        self.0.get(index)
    }

    /// Number of key columns
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First `size` key columns
    pub fn prefix(&self, size: usize) -> PrimaryKey {
        PrimaryKey(self.0[..size.min(self.0.len())].to_vec())
    }

    /// Check whether both keys share the first `len` columns
    pub fn same_prefix(&self, other: &PrimaryKey, len: usize) -> bool {
        len == 0 || self.0.iter().take(len).eq(other.0.iter().take(len))
    }

    /// Consume into the underlying values
    pub fn into_values(self) -> Vec<KeyValue> {
        self.0
    }
}

impl From<Vec<KeyValue>> for PrimaryKey {
    fn from(values: Vec<KeyValue>) -> Self {
        Self(values)
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

/// A record laid out positionally according to a [`RecordSchema`](crate::schema::RecordSchema)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Key columns, in schema key order
    pub key: PrimaryKey,
    /// Measure columns, in schema measure order
    pub measures: Vec<MeasureValue>,
}

impl Record {
    /// Create a new record
    pub fn new(key: impl Into<PrimaryKey>, measures: Vec<MeasureValue>) -> Self {
        Self {
            key: key.into(),
            measures,
        }
    }

    /// Get a measure by position
    pub fn measure(&self, index: usize) -> MeasureValue {
        self.measures.get(index).copied().unwrap_or(MeasureValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_key_ordering() {
        let a = PrimaryKey::new(vec![1.into(), "b".into()]);
        let b = PrimaryKey::new(vec![1.into(), "c".into()]);
        let c = PrimaryKey::new(vec![2.into(), "a".into()]);

        assert!(a < b);
        assert!(b < c);
        assert!(a.prefix(1) < a);
        assert_eq!(a.prefix(1), b.prefix(1));
        assert_eq!(a.prefix(5), a);
        assert_eq!(a.to_string(), "[1, \"b\"]");
    }

    #[test]
    fn test_measure_value() {
        let f = MeasureValue::Float(3.5);
        assert_eq!(f.as_f64(), Some(3.5));
        assert_eq!(f.as_i64(), Some(3));
        assert_eq!(MeasureValue::Int(4).coerce(MeasureType::Float), MeasureValue::Float(4.0));
        assert!(MeasureValue::Null.coerce(MeasureType::Int).is_null());
    }
}
