//! Record layouts
//!
//! A [`RecordSchema`] is the concrete shape of records for one `(keys,
//! measures)` pair. Records are positional: `key` holds the schema's keys
//! in order and `measures` holds the schema's measures in order. The
//! [`SchemaRegistry`] builds each distinct layout once and shares it.

use crate::measure::Measure;
use crate::structure::AggregationStructure;
use crate::types::{KeyType, KeyValue, MeasureValue, PrimaryKey, Record};
use crate::{AggregationError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Concrete record shape for a key set and a measure set
#[derive(Clone)]
pub struct RecordSchema {
    keys: Vec<String>,
    key_types: Vec<KeyType>,
    measures: Vec<String>,
    handles: Vec<Arc<dyn Measure>>,
}

impl fmt::Debug for RecordSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSchema")
            .field("keys", &self.keys)
            .field("measures", &self.measures)
            .finish()
    }
}

impl RecordSchema {
    /// Build a layout, validating names against the structure
    pub fn new<K, M>(structure: &AggregationStructure, keys: &[K], measures: &[M]) -> Result<Self>
    where
        K: AsRef<str>,
        M: AsRef<str>,
    {
        structure.validate_keys(keys)?;
        structure.validate_measures(measures)?;

        let mut key_types = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(ty) = structure.key_type(key.as_ref()) {
                key_types.push(ty);
            }
        }
        let mut handles = Vec::with_capacity(measures.len());
        for m in measures {
            if let Some(handle) = structure.measure(m.as_ref()) {
                handles.push(Arc::clone(handle));
            }
        }

        Ok(Self {
            keys: keys.iter().map(|k| k.as_ref().to_string()).collect(),
            key_types,
            measures: measures.iter().map(|m| m.as_ref().to_string()).collect(),
            handles,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn key_types(&self) -> &[KeyType] {
        &self.key_types
    }

    pub fn measures(&self) -> &[String] {
        &self.measures
    }

    /// Measure capability at a position
    pub fn handle(&self, index: usize) -> &Arc<dyn Measure> {
        &self.handles[index]
    }

    /// Position of a key in this layout
    pub fn key_index(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// Position of a measure in this layout
    pub fn measure_index(&self, measure: &str) -> Option<usize> {
        self.measures.iter().position(|m| m == measure)
    }

    /// Key value of a record laid out in this schema
    pub fn key_value<'a>(&self, record: &'a Record, key: &str) -> Option<&'a KeyValue> {
        self.key_index(key).and_then(|i| record.key.get(i))
    }

    /// Positions of `keys` in this layout, in the given order
    ///
    /// Every name must be one of this layout's keys.
    pub fn key_positions<S: AsRef<str>>(&self, keys: &[S]) -> Vec<usize> {
        keys.iter().filter_map(|k| self.key_index(k.as_ref())).collect()
    }

    /// Extract a sub-key by positions
    pub fn key_of(&self, record: &Record, positions: &[usize]) -> PrimaryKey {
        PrimaryKey::new(
            positions
                .iter()
                .filter_map(|&i| record.key.get(i).cloned())
                .collect(),
        )
    }

    /// Check a record's arity and key types against this layout
    pub fn check_record(&self, record: &Record) -> Result<()> {
        if record.key.len() != self.keys.len() || record.measures.len() != self.measures.len() {
            return Err(AggregationError::InvalidRecord(format!(
                "expected {} keys and {} measures, got {} and {}",
                self.keys.len(),
                self.measures.len(),
                record.key.len(),
                record.measures.len()
            )));
        }
        for ((name, ty), value) in self.keys.iter().zip(&self.key_types).zip(record.key.values()) {
            if !ty.accepts(value) {
                return Err(AggregationError::InvalidRecord(format!(
                    "key '{}' is not of type {:?}: {}",
                    name, ty, value
                )));
            }
        }
        Ok(())
    }

    /// Check whether `keys` is a leading prefix of this layout's keys
    pub fn is_key_prefix<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        keys.len() <= self.keys.len()
            && keys.iter().zip(self.keys.iter()).all(|(a, b)| a.as_ref() == b)
    }

    /// Copy a record from `source` layout into this one.
    ///
    /// Keys are copied by name; measures missing from the source become null.
    pub fn project(&self, record: &Record, source: &RecordSchema) -> Record {
        let key = self
            .keys
            .iter()
            .filter_map(|k| source.key_value(record, k).cloned())
            .collect::<Vec<_>>();
        let measures = self
            .measures
            .iter()
            .map(|m| match source.measure_index(m) {
                Some(i) => record.measure(i),
                None => MeasureValue::Null,
            })
            .collect();
        Record::new(key, measures)
    }

    /// Turn a raw input record into an accumulator record
    pub fn init_accumulator(&self, raw: &Record) -> Record {
        let measures = self
            .handles
            .iter()
            .enumerate()
            .map(|(i, h)| h.init_accumulator(raw.measure(i)))
            .collect();
        Record::new(raw.key.clone(), measures)
    }

    /// Fold a raw input record into an accumulator record
    pub fn accumulate(&self, acc: &mut Record, raw: &Record) {
        for (i, h) in self.handles.iter().enumerate() {
            h.accumulate(&mut acc.measures[i], raw.measure(i));
        }
    }

    /// Combine an accumulator record laid out in `source` into `acc`
    pub fn combine(&self, acc: &mut Record, other: &Record, source: &RecordSchema) {
        for (i, m) in self.measures.iter().enumerate() {
            if let Some(j) = source.measure_index(m) {
                self.handles[i].combine(&mut acc.measures[i], other.measure(j));
            }
        }
    }
}

/// Cache of record layouts keyed by `(keys, measures)`
pub struct SchemaRegistry {
    structure: Arc<AggregationStructure>,
    cache: RwLock<HashMap<(Vec<String>, Vec<String>), Arc<RecordSchema>>>,
}

impl SchemaRegistry {
    pub fn new(structure: Arc<AggregationStructure>) -> Self {
        Self {
            structure,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn structure(&self) -> &Arc<AggregationStructure> {
        &self.structure
    }

    /// Get or build the layout for a key set and measure set
    pub fn get<K, M>(&self, keys: &[K], measures: &[M]) -> Result<Arc<RecordSchema>>
    where
        K: AsRef<str>,
        M: AsRef<str>,
    {
        let cache_key = (
            keys.iter().map(|k| k.as_ref().to_string()).collect::<Vec<_>>(),
            measures.iter().map(|m| m.as_ref().to_string()).collect::<Vec<_>>(),
        );

        if let Some(schema) = self.cache.read().get(&cache_key) {
            return Ok(Arc::clone(schema));
        }

        let schema = Arc::new(RecordSchema::new(&self.structure, keys, measures)?);
        self.cache
            .write()
            .entry(cache_key)
            .or_insert_with(|| Arc::clone(&schema));
        Ok(schema)
    }

    /// Layout over all declared keys and the given measures
    pub fn chunk_schema<M: AsRef<str>>(&self, measures: &[M]) -> Result<Arc<RecordSchema>> {
        let keys = self.structure.keys().to_vec();
        self.get(&keys, measures)
    }

    /// Number of cached layouts
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure;
    use crate::types::MeasureType;

    fn registry() -> SchemaRegistry {
        let structure = AggregationStructure::new()
            .with_key("date", KeyType::Int)
            .with_key("site", KeyType::String)
            .with_measure("clicks", measure::sum(MeasureType::Int))
            .with_measure("cost", measure::sum(MeasureType::Float));
        SchemaRegistry::new(Arc::new(structure))
    }

    #[test]
    fn test_registry_caches_layouts() {
        let registry = registry();
        let a = registry.get(&["date"], &["clicks"]).unwrap();
        let b = registry.get(&["date"], &["clicks"]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        assert!(registry.get(&["nope"], &["clicks"]).is_err());
        assert!(registry.get(&["date"], &["nope"]).is_err());
    }

    #[test]
    fn test_project_by_name() {
        let registry = registry();
        let source = registry.chunk_schema(&["clicks"]).unwrap();
        let target = registry.get(&["site"], &["cost", "clicks"]).unwrap();

        let record = Record::new(vec![KeyValue::from(20), "a".into()], vec![5.into()]);
        let projected = target.project(&record, &source);
        assert_eq!(projected.key, PrimaryKey::new(vec!["a".into()]));
        assert_eq!(projected.measures, vec![MeasureValue::Null, MeasureValue::Int(5)]);
    }

    #[test]
    fn test_accumulate_and_combine() {
        let registry = registry();
        let schema = registry.chunk_schema(&["clicks", "cost"]).unwrap();
        let raw = Record::new(vec![KeyValue::from(1), "a".into()], vec![2.into(), 0.5.into()]);

        let mut acc = schema.init_accumulator(&raw);
        schema.accumulate(&mut acc, &raw);
        assert_eq!(acc.measures, vec![MeasureValue::Int(4), MeasureValue::Float(1.0)]);

        let clicks_only = registry.chunk_schema(&["clicks"]).unwrap();
        let other = Record::new(vec![KeyValue::from(1), "a".into()], vec![10.into()]);
        schema.combine(&mut acc, &other, &clicks_only);
        assert_eq!(acc.measures, vec![MeasureValue::Int(14), MeasureValue::Float(1.0)]);
    }

    #[test]
    fn test_check_record() {
        let schema = registry().chunk_schema(&["clicks"]).unwrap();
        let good = Record::new(vec![KeyValue::from(1), "a".into()], vec![3.into()]);
        assert!(schema.check_record(&good).is_ok());

        let short_key = Record::new(vec![KeyValue::from(1)], vec![3.into()]);
        let swapped = Record::new(vec![KeyValue::from("a"), 1.into()], vec![3.into()]);
        let extra_measure = Record::new(vec![KeyValue::from(1), "a".into()], vec![3.into(), 4.into()]);
        for bad in [short_key, swapped, extra_measure] {
            let err = schema.check_record(&bad).unwrap_err();
            assert!(matches!(err, AggregationError::InvalidRecord(_)));
            assert!(err.is_config());
        }
    }
}
