//! Restricted predicate algebra over key columns
//!
//! Predicates are used twice: the chunk index turns them into a primary-key
//! range scan to pick candidate chunks, and chunk readers evaluate them per
//! record through a compiled [`RecordFilter`].

use crate::schema::RecordSchema;
use crate::structure::AggregationStructure;
use crate::types::{KeyType, KeyValue, PrimaryKey, Record};
use crate::{AggregationError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Predicate over key columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationPredicate {
    AlwaysTrue,
    AlwaysFalse,
    Eq {
        key: String,
        value: KeyValue,
    },
    NotEq {
        key: String,
        value: KeyValue,
    },
    /// Inclusive range
    Between {
        key: String,
        from: KeyValue,
        to: KeyValue,
    },
    In {
        key: String,
        values: Vec<KeyValue>,
    },
    /// Regular expression search on a string key
    Regexp {
        key: String,
        pattern: String,
    },
    And {
        predicates: Vec<AggregationPredicate>,
    },
    Or {
        predicates: Vec<AggregationPredicate>,
    },
    Not {
        predicate: Box<AggregationPredicate>,
    },
}

impl Default for AggregationPredicate {
    fn default() -> Self {
        AggregationPredicate::AlwaysTrue
    }
}

impl AggregationPredicate {
    pub fn always_true() -> Self {
        AggregationPredicate::AlwaysTrue
    }

    pub fn always_false() -> Self {
        AggregationPredicate::AlwaysFalse
    }

    pub fn eq(key: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        AggregationPredicate::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn not_eq(key: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        AggregationPredicate::NotEq {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn between(key: impl Into<String>, from: impl Into<KeyValue>, to: impl Into<KeyValue>) -> Self {
        AggregationPredicate::Between {
            key: key.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn is_in<V: Into<KeyValue>>(key: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        AggregationPredicate::In {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn regexp(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        AggregationPredicate::Regexp {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    pub fn and(predicates: Vec<AggregationPredicate>) -> Self {
        AggregationPredicate::And { predicates }
    }

    pub fn or(predicates: Vec<AggregationPredicate>) -> Self {
        AggregationPredicate::Or { predicates }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(predicate: AggregationPredicate) -> Self {
        AggregationPredicate::Not {
            predicate: Box::new(predicate),
        }
    }

    /// Keys referenced by this predicate
    pub fn dimensions(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_dimensions(&mut out);
        out
    }

    fn collect_dimensions(&self, out: &mut BTreeSet<String>) {
        match self {
            AggregationPredicate::AlwaysTrue | AggregationPredicate::AlwaysFalse => {}
            AggregationPredicate::Eq { key, .. }
            | AggregationPredicate::NotEq { key, .. }
            | AggregationPredicate::Between { key, .. }
            | AggregationPredicate::In { key, .. }
            | AggregationPredicate::Regexp { key, .. } => {
                out.insert(key.clone());
            }
            AggregationPredicate::And { predicates } | AggregationPredicate::Or { predicates } => {
                for p in predicates {
                    p.collect_dimensions(out);
                }
            }
            AggregationPredicate::Not { predicate } => predicate.collect_dimensions(out),
        }
    }

    /// Check referenced keys, value types and patterns against a structure
    pub fn validate(&self, structure: &AggregationStructure) -> Result<()> {
        let check = |key: &str, value: &KeyValue| -> Result<()> {
            let ty = structure
                .key_type(key)
                .ok_or_else(|| AggregationError::UnknownKey(key.to_string()))?;
            if !ty.accepts(value) {
                return Err(AggregationError::Config(format!(
                    "Predicate value {} is not of type {:?} for key {}",
                    value, ty, key
                )));
            }
            Ok(())
        };

        match self {
            AggregationPredicate::AlwaysTrue | AggregationPredicate::AlwaysFalse => Ok(()),
            AggregationPredicate::Eq { key, value } | AggregationPredicate::NotEq { key, value } => {
                check(key, value)
            }
            AggregationPredicate::Between { key, from, to } => {
                check(key, from)?;
                check(key, to)
            }
            AggregationPredicate::In { key, values } => {
                if values.is_empty() {
                    structure.validate_keys(&[key])?;
                }
                values.iter().try_for_each(|v| check(key, v))
            }
            AggregationPredicate::Regexp { key, pattern } => {
                match structure.key_type(key) {
                    None => return Err(AggregationError::UnknownKey(key.clone())),
                    Some(KeyType::String) => {}
                    Some(ty) => {
                        return Err(AggregationError::Config(format!(
                            "Regexp requires a string key, {} is {:?}",
                            key, ty
                        )))
                    }
                }
                Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| AggregationError::Config(format!("Invalid pattern {}: {}", pattern, e)))
            }
            AggregationPredicate::And { predicates } | AggregationPredicate::Or { predicates } => {
                predicates.iter().try_for_each(|p| p.validate(structure))
            }
            AggregationPredicate::Not { predicate } => predicate.validate(structure),
        }
    }

    /// Normalize the predicate.
    ///
    /// Nested conjunctions and disjunctions are flattened, duplicate terms
    /// dropped, ranges on the same key intersected and contradictions turned
    /// into `AlwaysFalse`.
    pub fn simplify(&self) -> AggregationPredicate {
        match self {
            AggregationPredicate::Between { key, from, to } => {
                if from > to {
                    AggregationPredicate::AlwaysFalse
                } else if from == to {
                    AggregationPredicate::eq(key.clone(), from.clone())
                } else {
                    self.clone()
                }
            }
            AggregationPredicate::In { key, values } => match values.len() {
                0 => AggregationPredicate::AlwaysFalse,
                1 => AggregationPredicate::eq(key.clone(), values[0].clone()),
                _ => {
                    let set: BTreeSet<KeyValue> = values.iter().cloned().collect();
                    AggregationPredicate::In {
                        key: key.clone(),
                        values: set.into_iter().collect(),
                    }
                }
            },
            AggregationPredicate::Not { predicate } => match predicate.as_ref() {
                AggregationPredicate::Not { predicate: inner } => inner.simplify(),
                AggregationPredicate::AlwaysTrue => AggregationPredicate::AlwaysFalse,
                AggregationPredicate::AlwaysFalse => AggregationPredicate::AlwaysTrue,
                AggregationPredicate::Eq { key, value } => {
                    AggregationPredicate::not_eq(key.clone(), value.clone())
                }
                AggregationPredicate::NotEq { key, value } => {
                    AggregationPredicate::eq(key.clone(), value.clone())
                }
                other => AggregationPredicate::not(other.simplify()),
            },
            AggregationPredicate::And { predicates } => simplify_and(predicates),
            AggregationPredicate::Or { predicates } => simplify_or(predicates),
            _ => self.clone(),
        }
    }

    /// Primary-key range covering every record the predicate can match
    pub fn to_range_scan<S: AsRef<str>>(&self, keys: &[S]) -> RangeScan {
        let simplified = self.simplify();
        let mut conjunctions = match simplified {
            AggregationPredicate::AlwaysFalse => return RangeScan::NoScan,
            AggregationPredicate::And { predicates } => predicates,
            other => vec![other],
        };

        let mut from = Vec::new();
        let mut to = Vec::new();

        for key in keys {
            let key = key.as_ref();
            let found = conjunctions.iter().position(|c| match c {
                AggregationPredicate::Eq { key: k, .. } | AggregationPredicate::Between { key: k, .. } => {
                    k == key
                }
                _ => false,
            });
            match found.map(|j| conjunctions.remove(j)) {
                Some(AggregationPredicate::Eq { value, .. }) => {
                    from.push(value.clone());
                    to.push(value);
                }
                Some(AggregationPredicate::Between { from: lo, to: hi, .. }) => {
                    from.push(lo);
                    to.push(hi);
                    break;
                }
                _ => break,
            }
        }

        RangeScan::Range {
            from: PrimaryKey::new(from),
            to: PrimaryKey::new(to),
        }
    }
}

fn simplify_and(predicates: &[AggregationPredicate]) -> AggregationPredicate {
    let mut flat: Vec<AggregationPredicate> = Vec::new();
    for p in predicates {
        match p.simplify() {
            AggregationPredicate::And { predicates: inner } => flat.extend(inner),
            AggregationPredicate::AlwaysTrue => {}
            AggregationPredicate::AlwaysFalse => return AggregationPredicate::AlwaysFalse,
            other => flat.push(other),
        }
    }

    let mut terms: Vec<AggregationPredicate> = Vec::new();
    loop {
        let mut changed = false;
        terms.clear();
        'next: for p in flat.drain(..) {
            for i in 0..terms.len() {
                if let Some(merged) = simplify_pair(&terms[i], &p) {
                    if merged == AggregationPredicate::AlwaysFalse {
                        return AggregationPredicate::AlwaysFalse;
                    }
                    terms[i] = merged;
                    changed = true;
                    continue 'next;
                }
            }
            terms.push(p);
        }
        if !changed {
            break;
        }
        flat = std::mem::take(&mut terms);
    }

    match terms.len() {
        0 => AggregationPredicate::AlwaysTrue,
        1 => terms.remove(0),
        _ => AggregationPredicate::And { predicates: terms },
    }
}

fn simplify_or(predicates: &[AggregationPredicate]) -> AggregationPredicate {
    let mut terms: Vec<AggregationPredicate> = Vec::new();
    for p in predicates {
        match p.simplify() {
            AggregationPredicate::Or { predicates: inner } => {
                for q in inner {
                    if !terms.contains(&q) {
                        terms.push(q);
                    }
                }
            }
            AggregationPredicate::AlwaysTrue => return AggregationPredicate::AlwaysTrue,
            AggregationPredicate::AlwaysFalse => {}
            other => {
                if !terms.contains(&other) {
                    terms.push(other);
                }
            }
        }
    }

    match terms.len() {
        0 => AggregationPredicate::AlwaysFalse,
        1 => terms.remove(0),
        _ => AggregationPredicate::Or { predicates: terms },
    }
}

/// Conjunction of two simplified terms, if it reduces to one term
fn simplify_pair(a: &AggregationPredicate, b: &AggregationPredicate) -> Option<AggregationPredicate> {
    use AggregationPredicate::*;

    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (Not { predicate }, other) | (other, Not { predicate }) if predicate.as_ref() == other => {
            Some(AlwaysFalse)
        }
        (Eq { key: k1, .. }, Eq { key: k2, .. }) if k1 == k2 => Some(AlwaysFalse),
        (Eq { key: k1, value }, NotEq { key: k2, value: v2 })
        | (NotEq { key: k2, value: v2 }, Eq { key: k1, value })
            if k1 == k2 =>
        {
            Some(if value == v2 { AlwaysFalse } else { AggregationPredicate::eq(k1.clone(), value.clone()) })
        }
        (Eq { key: k1, value }, Between { key: k2, from, to })
        | (Between { key: k2, from, to }, Eq { key: k1, value })
            if k1 == k2 =>
        {
            Some(if from <= value && value <= to {
                AggregationPredicate::eq(k1.clone(), value.clone())
            } else {
                AlwaysFalse
            })
        }
        (Eq { key: k1, value }, In { key: k2, values }) | (In { key: k2, values }, Eq { key: k1, value })
            if k1 == k2 =>
        {
            Some(if values.contains(value) {
                AggregationPredicate::eq(k1.clone(), value.clone())
            } else {
                AlwaysFalse
            })
        }
        (Between { key: k1, from: f1, to: t1 }, Between { key: k2, from: f2, to: t2 }) if k1 == k2 => {
            let from = if f1 >= f2 { f1 } else { f2 };
            let to = if t1 <= t2 { t1 } else { t2 };
            Some(AggregationPredicate::between(k1.clone(), from.clone(), to.clone()).simplify())
        }
        _ => None,
    }
}

impl fmt::Display for AggregationPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, ps: &[AggregationPredicate], sep: &str| {
            write!(f, "(")?;
            for (i, p) in ps.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", sep)?;
                }
                write!(f, "{}", p)?;
            }
            write!(f, ")")
        };
        match self {
            AggregationPredicate::AlwaysTrue => write!(f, "TRUE"),
            AggregationPredicate::AlwaysFalse => write!(f, "FALSE"),
            AggregationPredicate::Eq { key, value } => write!(f, "{}={}", key, value),
            AggregationPredicate::NotEq { key, value } => write!(f, "{}!={}", key, value),
            AggregationPredicate::Between { key, from, to } => {
                write!(f, "{} BETWEEN {} AND {}", key, from, to)
            }
            AggregationPredicate::In { key, values } => {
                write!(f, "{} IN (", key)?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            AggregationPredicate::Regexp { key, pattern } => write!(f, "{} ~ {:?}", key, pattern),
            AggregationPredicate::And { predicates } => join(f, predicates, "AND"),
            AggregationPredicate::Or { predicates } => join(f, predicates, "OR"),
            AggregationPredicate::Not { predicate } => write!(f, "NOT {}", predicate),
        }
    }
}

/// Primary-key range derived from a predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeScan {
    /// Nothing can match
    NoScan,
    /// Inclusive prefix range; empty prefixes mean a full scan
    Range { from: PrimaryKey, to: PrimaryKey },
}

impl RangeScan {
    pub fn full() -> Self {
        RangeScan::Range {
            from: PrimaryKey::empty(),
            to: PrimaryKey::empty(),
        }
    }

    pub fn is_no_scan(&self) -> bool {
        matches!(self, RangeScan::NoScan)
    }

    pub fn is_full_scan(&self) -> bool {
        matches!(self, RangeScan::Range { from, .. } if from.is_empty())
    }
}

/// Predicate compiled against a record layout
#[derive(Debug, Clone)]
pub enum RecordFilter {
    True,
    False,
    Eq(usize, KeyValue),
    NotEq(usize, KeyValue),
    Between(usize, KeyValue, KeyValue),
    In(usize, BTreeSet<KeyValue>),
    Regexp(usize, Regex),
    And(Vec<RecordFilter>),
    Or(Vec<RecordFilter>),
    Not(Box<RecordFilter>),
}

impl RecordFilter {
    /// Resolve key positions and compile patterns
    pub fn compile(predicate: &AggregationPredicate, schema: &RecordSchema) -> Result<Self> {
        let position = |key: &str| {
            schema
                .key_index(key)
                .ok_or_else(|| AggregationError::UnknownKey(key.to_string()))
        };
        Ok(match predicate {
            AggregationPredicate::AlwaysTrue => RecordFilter::True,
            AggregationPredicate::AlwaysFalse => RecordFilter::False,
            AggregationPredicate::Eq { key, value } => RecordFilter::Eq(position(key)?, value.clone()),
            AggregationPredicate::NotEq { key, value } => {
                RecordFilter::NotEq(position(key)?, value.clone())
            }
            AggregationPredicate::Between { key, from, to } => {
                RecordFilter::Between(position(key)?, from.clone(), to.clone())
            }
            AggregationPredicate::In { key, values } => {
                RecordFilter::In(position(key)?, values.iter().cloned().collect())
            }
            AggregationPredicate::Regexp { key, pattern } => {
                let regex = Regex::new(pattern)
                    .map_err(|e| AggregationError::Config(format!("Invalid pattern {}: {}", pattern, e)))?;
                RecordFilter::Regexp(position(key)?, regex)
            }
            AggregationPredicate::And { predicates } => RecordFilter::And(
                predicates
                    .iter()
                    .map(|p| Self::compile(p, schema))
                    .collect::<Result<_>>()?,
            ),
            AggregationPredicate::Or { predicates } => RecordFilter::Or(
                predicates
                    .iter()
                    .map(|p| Self::compile(p, schema))
                    .collect::<Result<_>>()?,
            ),
            AggregationPredicate::Not { predicate } => {
                RecordFilter::Not(Box::new(Self::compile(predicate, schema)?))
            }
        })
    }

    /// Check whether the filter passes every record
    pub fn is_true(&self) -> bool {
        matches!(self, RecordFilter::True)
    }

    /// Evaluate against a record
    pub fn matches(&self, record: &Record) -> bool {
        let key = |i: &usize| record.key.get(*i);
        match self {
            RecordFilter::True => true,
            RecordFilter::False => false,
            RecordFilter::Eq(i, v) => key(i) == Some(v),
            RecordFilter::NotEq(i, v) => key(i).is_some_and(|k| k != v),
            RecordFilter::Between(i, from, to) => key(i).is_some_and(|k| from <= k && k <= to),
            RecordFilter::In(i, values) => key(i).is_some_and(|k| values.contains(k)),
            RecordFilter::Regexp(i, regex) => key(i)
                .and_then(KeyValue::as_str)
                .is_some_and(|s| regex.is_match(s)),
            RecordFilter::And(filters) => filters.iter().all(|f| f.matches(record)),
            RecordFilter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            RecordFilter::Not(filter) => !filter.matches(record),
        }
    }
}
