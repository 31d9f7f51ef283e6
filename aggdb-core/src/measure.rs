//! Measure implementations
//!
//! A measure turns raw input values into accumulators and combines
//! accumulators. `combine` must be associative and commutative: the merge
//! engine combines duplicate keys from different chunks in whatever order
//! the streams deliver them.

use crate::types::{MeasureType, MeasureValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Aggregatable column capability
pub trait Measure: Send + Sync + fmt::Debug {
    /// Measure kind
    fn kind(&self) -> MeasureKind;

    /// Type of the accumulator stored in chunks
    fn value_type(&self) -> MeasureType;

    /// Create an accumulator from a single raw input value
    fn init_accumulator(&self, raw: MeasureValue) -> MeasureValue;

    /// Fold a raw input value into an accumulator
    fn accumulate(&self, acc: &mut MeasureValue, raw: MeasureValue);

    /// Combine another accumulator into this one
    fn combine(&self, acc: &mut MeasureValue, other: MeasureValue);
}

/// Built-in measure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureKind {
    Sum,
    Min,
    Max,
    Count,
}

impl MeasureKind {
    /// Parse from string
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Some(MeasureKind::Sum),
            "min" => Some(MeasureKind::Min),
            "max" => Some(MeasureKind::Max),
            "count" => Some(MeasureKind::Count),
            _ => None,
        }
    }

    /// Instantiate the measure over a value type
    pub fn create(self, value_type: MeasureType) -> Arc<dyn Measure> {
        match self {
            MeasureKind::Sum => Arc::new(Sum(value_type)),
            MeasureKind::Min => Arc::new(Min(value_type)),
            MeasureKind::Max => Arc::new(Max(value_type)),
            MeasureKind::Count => Arc::new(Count),
        }
    }
}

/// Sum measure
pub fn sum(value_type: MeasureType) -> Arc<dyn Measure> {
    MeasureKind::Sum.create(value_type)
}

/// Min measure
pub fn min(value_type: MeasureType) -> Arc<dyn Measure> {
    MeasureKind::Min.create(value_type)
}

/// Max measure
pub fn max(value_type: MeasureType) -> Arc<dyn Measure> {
    MeasureKind::Max.create(value_type)
}

/// Count measure (counts input records, ignores raw values)
pub fn count() -> Arc<dyn Measure> {
    MeasureKind::Count.create(MeasureType::Int)
}

fn add(ty: MeasureType, a: MeasureValue, b: MeasureValue) -> MeasureValue {
    match (a, b) {
        (MeasureValue::Null, v) | (v, MeasureValue::Null) => v.coerce(ty),
        (a, b) => match ty {
            MeasureType::Int => {
                MeasureValue::Int(a.as_i64().unwrap_or(0).wrapping_add(b.as_i64().unwrap_or(0)))
            }
            MeasureType::Float => {
                MeasureValue::Float(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
            }
        },
    }
}

/// Total order over accumulators of one measure.
///
/// Integers compare exactly. Mixed values compare as floats and an integer
/// sorts before an equal float, so distinct values never tie.
fn compare(a: MeasureValue, b: MeasureValue) -> Ordering {
    match (a, b) {
        (MeasureValue::Int(x), MeasureValue::Int(y)) => x.cmp(&y),
        (MeasureValue::Float(x), MeasureValue::Float(y)) => x.total_cmp(&y),
        (MeasureValue::Int(x), MeasureValue::Float(y)) => (x as f64).total_cmp(&y).then(Ordering::Less),
        (MeasureValue::Float(x), MeasureValue::Int(y)) => x.total_cmp(&(y as f64)).then(Ordering::Greater),
        (MeasureValue::Null, MeasureValue::Null) => Ordering::Equal,
        (MeasureValue::Null, _) => Ordering::Less,
        (_, MeasureValue::Null) => Ordering::Greater,
    }
}

/// Keep whichever of `a` and `b` lies toward `wanted`; nulls are ignored
fn pick(ty: MeasureType, a: MeasureValue, b: MeasureValue, wanted: Ordering) -> MeasureValue {
    match (a.coerce(ty), b.coerce(ty)) {
        (MeasureValue::Null, v) | (v, MeasureValue::Null) => v,
        (a, b) => {
            if compare(b, a) == wanted {
                b
            } else {
                a
            }
        }
    }
}

/// Sum of values
#[derive(Debug, Clone, Copy)]
pub struct Sum(pub MeasureType);

impl Measure for Sum {
    fn kind(&self) -> MeasureKind {
        MeasureKind::Sum
    }

    fn value_type(&self) -> MeasureType {
        self.0
    }

    fn init_accumulator(&self, raw: MeasureValue) -> MeasureValue {
        raw.coerce(self.0)
    }

    fn accumulate(&self, acc: &mut MeasureValue, raw: MeasureValue) {
        *acc = add(self.0, *acc, raw);
    }

    fn combine(&self, acc: &mut MeasureValue, other: MeasureValue) {
        *acc = add(self.0, *acc, other);
    }
}

/// Minimum value
#[derive(Debug, Clone, Copy)]
pub struct Min(pub MeasureType);

impl Measure for Min {
    fn kind(&self) -> MeasureKind {
        MeasureKind::Min
    }

    fn value_type(&self) -> MeasureType {
        self.0
    }

    fn init_accumulator(&self, raw: MeasureValue) -> MeasureValue {
        raw.coerce(self.0)
    }

    fn accumulate(&self, acc: &mut MeasureValue, raw: MeasureValue) {
        *acc = pick(self.0, *acc, raw, Ordering::Less);
    }

    fn combine(&self, acc: &mut MeasureValue, other: MeasureValue) {
        self.accumulate(acc, other);
    }
}

/// Maximum value
#[derive(Debug, Clone, Copy)]
pub struct Max(pub MeasureType);

impl Measure for Max {
    fn kind(&self) -> MeasureKind {
        MeasureKind::Max
    }

    fn value_type(&self) -> MeasureType {
        self.0
    }

    fn init_accumulator(&self, raw: MeasureValue) -> MeasureValue {
        raw.coerce(self.0)
    }

    fn accumulate(&self, acc: &mut MeasureValue, raw: MeasureValue) {
        *acc = pick(self.0, *acc, raw, Ordering::Greater);
    }

    fn combine(&self, acc: &mut MeasureValue, other: MeasureValue) {
        self.accumulate(acc, other);
    }
}

/// Number of input records
#[derive(Debug, Clone, Copy)]
pub struct Count;

impl Measure for Count {
    fn kind(&self) -> MeasureKind {
        MeasureKind::Count
    }

    fn value_type(&self) -> MeasureType {
        MeasureType::Int
    }

    fn init_accumulator(&self, _raw: MeasureValue) -> MeasureValue {
        MeasureValue::Int(1)
    }

    fn accumulate(&self, acc: &mut MeasureValue, _raw: MeasureValue) {
        *acc = add(MeasureType::Int, *acc, MeasureValue::Int(1));
    }

    fn combine(&self, acc: &mut MeasureValue, other: MeasureValue) {
        *acc = add(MeasureType::Int, *acc, other);
    }
}
