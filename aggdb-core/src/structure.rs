//! Aggregation structure: declared keys, measures and partitioning key

use crate::measure::{Measure, MeasureKind};
use crate::types::{KeyType, MeasureType};
use crate::{AggregationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Immutable description of an aggregation
#[derive(Debug, Clone, Default)]
pub struct AggregationStructure {
    keys: Vec<String>,
    key_types: Vec<KeyType>,
    measures: Vec<(String, Arc<dyn Measure>)>,
    partitioning_key: Vec<String>,
}

impl AggregationStructure {
    /// Create an empty structure
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a key column (keys are ordered by declaration)
    pub fn with_key(mut self, name: impl Into<String>, key_type: KeyType) -> Self {
        self.keys.push(name.into());
        self.key_types.push(key_type);
        self
    }

    /// Declare a measure column
    pub fn with_measure(mut self, name: impl Into<String>, measure: Arc<dyn Measure>) -> Self {
        self.measures.push((name.into(), measure));
        self
    }

    /// Declare the partitioning key; it must be a prefix of the declared keys
    pub fn with_partitioning_key<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitioning_key = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Check declarations for consistency
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(AggregationError::Config("At least one key is required".into()));
        }
        if self.measures.is_empty() {
            return Err(AggregationError::Config("At least one measure is required".into()));
        }

        let mut seen = HashSet::new();
        for name in self.keys.iter().chain(self.measures.iter().map(|(n, _)| n)) {
            if !seen.insert(name.as_str()) {
                return Err(AggregationError::Config(format!("Duplicate field: {}", name)));
            }
        }

        if self.partitioning_key.len() > self.keys.len()
            || self.partitioning_key[..] != self.keys[..self.partitioning_key.len()]
        {
            return Err(AggregationError::Config(format!(
                "Partitioning key {:?} must be a prefix of keys {:?}",
                self.partitioning_key, self.keys
            )));
        }
        Ok(())
    }

    /// Key names in declared order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Key types in declared order
    pub fn key_types(&self) -> &[KeyType] {
        &self.key_types
    }

    /// Position of a key
    pub fn key_index(&self, name: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == name)
    }

    /// Type of a key
    pub fn key_type(&self, name: &str) -> Option<KeyType> {
        self.key_index(name).map(|i| self.key_types[i])
    }

    /// Measure names in declared order
    pub fn measures(&self) -> Vec<String> {
        self.measures.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Measure capability by name
    pub fn measure(&self, name: &str) -> Option<&Arc<dyn Measure>> {
        self.measures.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    pub fn partitioning_key(&self) -> &[String] {
        &self.partitioning_key
    }

    /// Reject keys not declared in this structure
    pub fn validate_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        for key in keys {
            if self.key_index(key.as_ref()).is_none() {
                return Err(AggregationError::UnknownKey(key.as_ref().to_string()));
            }
        }
        Ok(())
    }

    /// Reject measures not declared in this structure
    pub fn validate_measures<S: AsRef<str>>(&self, measures: &[S]) -> Result<()> {
        for measure in measures {
            if self.measure(measure.as_ref()).is_none() {
                return Err(AggregationError::UnknownMeasure(measure.as_ref().to_string()));
            }
        }
        Ok(())
    }

    /// Order measure names by declaration order, dropping unknown names
    pub fn sorted_measures<S: AsRef<str>>(&self, measures: &[S]) -> Vec<String> {
        self.measures
            .iter()
            .filter(|(n, _)| measures.iter().any(|m| m.as_ref() == n))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Build from a declarative definition
    pub fn from_def(def: &StructureDef) -> Result<Self> {
        let mut structure = Self::new();
        for key in &def.keys {
            structure = structure.with_key(key.name.clone(), key.key_type);
        }
        for m in &def.measures {
            structure = structure.with_measure(m.name.clone(), m.measure.create(m.value_type));
        }
        structure = structure.with_partitioning_key(def.partitioning_key.iter().cloned());
        structure.validate()?;
        Ok(structure)
    }
}

/// Serializable structure declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureDef {
    pub keys: Vec<KeyDef>,
    pub measures: Vec<MeasureDef>,
    #[serde(default)]
    pub partitioning_key: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDef {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureDef {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: MeasureType,
    pub measure: MeasureKind,
}
