//! Query engine
//!
//! A query names the keys to group by, the measures to aggregate and a
//! predicate over keys. Execution runs in three stages:
//! - the chunk index finds candidate chunks
//! - the planner splits them into non-overlapping sequences
//! - the executor reads, merges and reduces the sequences

mod executor;
mod merge;
mod planner;
mod sorter;

pub use executor::QueryExecutor;
pub use merge::{project_stream, KWayMerge, StreamReducer};
pub use planner::{create_plan, QueryPlan, Sequence};
pub use sorter::ExternalSorter;

use crate::predicate::AggregationPredicate;
use crate::structure::AggregationStructure;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Keys, measures and predicate of one query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationQuery {
    /// Result keys, in result order
    pub keys: Vec<String>,
    /// Result measures, in result order
    pub measures: Vec<String>,
    #[serde(default)]
    pub predicate: AggregationPredicate,
}

impl AggregationQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_measures<I, S>(mut self, measures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.measures = measures.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_predicate(mut self, predicate: AggregationPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Check every referenced name against the structure
    pub fn validate(&self, structure: &AggregationStructure) -> Result<()> {
        structure.validate_keys(&self.keys[..])?;
        structure.validate_measures(&self.measures[..])?;
        self.predicate.validate(structure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure;
    use crate::types::{KeyType, MeasureType};
    use crate::AggregationError;

    #[test]
    fn test_query_validation() {
        let structure = AggregationStructure::new()
            .with_key("site", KeyType::String)
            .with_key("day", KeyType::Int)
            .with_measure("clicks", measure::sum(MeasureType::Int));

        let query = AggregationQuery::new()
            .with_keys(["site"])
            .with_measures(["clicks"])
            .with_predicate(AggregationPredicate::eq("day", 3));
        assert!(query.validate(&structure).is_ok());

        let bad_key = query.clone().with_keys(["country"]);
        assert!(matches!(bad_key.validate(&structure), Err(AggregationError::UnknownKey(_))));

        let bad_measure = query.clone().with_measures(["cost"]);
        assert!(matches!(
            bad_measure.validate(&structure),
            Err(AggregationError::UnknownMeasure(_))
        ));

        let bad_value = query.with_predicate(AggregationPredicate::eq("day", "monday"));
        assert!(matches!(bad_value.validate(&structure), Err(AggregationError::Config(_))));
    }

    #[test]
    fn test_query_from_json() {
        let query: AggregationQuery = serde_json::from_str(
            r#"{"keys": ["site"], "measures": ["clicks"],
                "predicate": {"type": "between", "key": "day", "from": {"Int": 1}, "to": {"Int": 7}}}"#,
        )
        .unwrap();
        assert_eq!(query.predicate, AggregationPredicate::between("day", 1, 7));

        let query: AggregationQuery =
            serde_json::from_str(r#"{"keys": [], "measures": ["clicks"]}"#).unwrap();
        assert_eq!(query.predicate, AggregationPredicate::AlwaysTrue);
    }
}
