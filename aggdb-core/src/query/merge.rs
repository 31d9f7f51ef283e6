//! Multi-way merge and reduce
//!
//! Every input is sorted by the merge keys. Records are pulled in key order
//! through a binary heap; records with equal keys are always combined with
//! the measure capabilities, so the result does not depend on which input
//! delivered a key first.

use crate::schema::RecordSchema;
use crate::stream::{RecordSender, RecordStream};
use crate::types::{PrimaryKey, Record};
use crate::{AggregationError, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::debug;

struct MergeInput {
    stream: RecordStream,
    schema: Arc<RecordSchema>,
    positions: Vec<usize>,
}

/// Ordered merge of sorted record streams
pub struct KWayMerge {
    keys: Vec<String>,
    inputs: Vec<MergeInput>,
    heads: Vec<Option<Record>>,
    heap: BinaryHeap<Reverse<(PrimaryKey, usize)>>,
    started: bool,
}

impl KWayMerge {
    /// Merge by `keys`, which every input layout must contain
    pub fn new<S: AsRef<str>>(keys: &[S]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.as_ref().to_string()).collect(),
            inputs: Vec::new(),
            heads: Vec::new(),
            heap: BinaryHeap::new(),
            started: false,
        }
    }

    /// Add an input sorted by the merge keys
    pub fn add_input(&mut self, stream: RecordStream, schema: Arc<RecordSchema>) {
        let positions = schema.key_positions(&self.keys[..]);
        self.inputs.push(MergeInput {
            stream,
            schema,
            positions,
        });
        self.heads.push(None);
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Layout of an input
    pub fn schema(&self, index: usize) -> &Arc<RecordSchema> {
        &self.inputs[index].schema
    }

    /// Next record as `(merge key, input index, record)`
    pub async fn next(&mut self) -> Result<Option<(PrimaryKey, usize, Record)>> {
        if !self.started {
            self.started = true;
            for index in 0..self.inputs.len() {
                self.advance(index).await?;
            }
        }

        let Some(Reverse((key, index))) = self.heap.pop() else {
            return Ok(None);
        };
        let record = self.heads[index]
            .take()
            .ok_or_else(|| AggregationError::Internal("merge input lost its head".into()))?;
        self.advance(index).await?;
        Ok(Some((key, index, record)))
    }

    async fn advance(&mut self, index: usize) -> Result<()> {
        let input = &mut self.inputs[index];
        if let Some(record) = input.stream.next().await.transpose()? {
            let key = input.schema.key_of(&record, &input.positions);
            self.heads[index] = Some(record);
            self.heap.push(Reverse((key, index)));
        }
        Ok(())
    }
}

/// Merges sorted inputs into one stream with a record per distinct key
pub struct StreamReducer {
    output: Arc<RecordSchema>,
    merge: KWayMerge,
}

impl StreamReducer {
    /// Reduce into the `output` layout, keyed by its keys
    pub fn new(output: Arc<RecordSchema>) -> Self {
        let merge = KWayMerge::new(output.keys());
        Self { output, merge }
    }

    /// Add an input sorted by the output keys
    pub fn add_input(&mut self, stream: RecordStream, schema: Arc<RecordSchema>) {
        self.merge.add_input(stream, schema);
    }

    /// Run the reduction, sending each combined record downstream
    pub async fn run(mut self, sender: &RecordSender) -> Result<()> {
        let mut current: Option<(PrimaryKey, Record)> = None;
        let mut records = 0u64;
        let mut reduced = 0u64;

        while let Some((key, index, record)) = self.merge.next().await? {
            records += 1;
            let source = self.merge.schema(index);
            if let Some((current_key, acc)) = current.as_mut() {
                if *current_key == key {
                    self.output.combine(acc, &record, source);
                    continue;
                }
            }
            let acc = self.output.project(&record, source);
            if let Some((_, done)) = current.replace((key, acc)) {
                sender.send(done).await?;
                reduced += 1;
            }
        }
        if let Some((_, done)) = current {
            sender.send(done).await?;
            reduced += 1;
        }

        debug!(
            inputs = self.merge.len(),
            records, reduced, "Stream reduction finished"
        );
        Ok(())
    }

    /// Run the reduction on a task and return its output stream
    pub fn into_stream(self, capacity: usize) -> RecordStream {
        let (sender, stream) = RecordStream::channel(capacity);
        tokio::spawn(async move {
            match self.run(&sender).await {
                Ok(()) | Err(AggregationError::Cancelled(_)) => {}
                Err(e) => sender.fail(e).await,
            }
        });
        stream
    }
}

/// Copy every record of `input` into the `output` layout
///
/// Used when a single sequence already holds one record per key.
pub fn project_stream(
    mut input: RecordStream,
    source: Arc<RecordSchema>,
    output: Arc<RecordSchema>,
    capacity: usize,
) -> RecordStream {
    let (sender, stream) = RecordStream::channel(capacity);
    tokio::spawn(async move {
        while let Some(next) = input.next().await {
            match next {
                Ok(record) => {
                    if sender.send(output.project(&record, &source)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    sender.fail(e).await;
                    return;
                }
            }
        }
    });
    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure;
    use crate::structure::AggregationStructure;
    use crate::types::{KeyType, KeyValue, MeasureType, MeasureValue};

    fn structure() -> AggregationStructure {
        AggregationStructure::new()
            .with_key("site", KeyType::String)
            .with_key("day", KeyType::Int)
            .with_measure("clicks", measure::sum(MeasureType::Int))
            .with_measure("peak", measure::max(MeasureType::Int))
    }

    fn schema(keys: &[&str], measures: &[&str]) -> Arc<RecordSchema> {
        Arc::new(RecordSchema::new(&structure(), keys, measures).unwrap())
    }

    fn rec(site: &str, day: i64, measures: Vec<i64>) -> Record {
        Record::new(
            vec![KeyValue::from(site), KeyValue::Int(day)],
            measures.into_iter().map(MeasureValue::Int).collect(),
        )
    }

    #[tokio::test]
    async fn test_merge_combines_equal_keys() {
        let full = schema(&["site", "day"], &["clicks", "peak"]);
        let clicks_only = schema(&["site", "day"], &["clicks"]);

        let mut reducer = StreamReducer::new(Arc::clone(&full));
        reducer.add_input(
            vec![rec("a", 1, vec![1, 5]), rec("a", 3, vec![2, 1])].into(),
            Arc::clone(&full),
        );
        reducer.add_input(
            vec![rec("a", 1, vec![10]), rec("a", 2, vec![4]), rec("b", 1, vec![7])].into(),
            clicks_only,
        );

        let records = reducer.into_stream(4).collect().await.unwrap();
        assert_eq!(
            records,
            vec![
                rec("a", 1, vec![11, 5]),
                Record::new(
                    vec![KeyValue::from("a"), KeyValue::Int(2)],
                    vec![MeasureValue::Int(4), MeasureValue::Null]
                ),
                rec("a", 3, vec![2, 1]),
                Record::new(
                    vec![KeyValue::from("b"), KeyValue::Int(1)],
                    vec![MeasureValue::Int(7), MeasureValue::Null]
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_reduce_onto_key_prefix() {
        let full = schema(&["site", "day"], &["clicks"]);
        let by_site = schema(&["site"], &["clicks"]);

        let mut reducer = StreamReducer::new(Arc::clone(&by_site));
        reducer.add_input(
            vec![rec("a", 1, vec![1]), rec("a", 2, vec![2]), rec("b", 1, vec![3])].into(),
            Arc::clone(&full),
        );
        reducer.add_input(vec![rec("a", 5, vec![10])].into(), full);

        let records = reducer.into_stream(4).collect().await.unwrap();
        assert_eq!(
            records,
            vec![
                Record::new(vec![KeyValue::from("a")], vec![MeasureValue::Int(13)]),
                Record::new(vec![KeyValue::from("b")], vec![MeasureValue::Int(3)]),
            ]
        );
    }

    #[tokio::test]
    async fn test_result_independent_of_input_order() {
        let full = schema(&["site", "day"], &["clicks", "peak"]);
        let inputs = vec![
            vec![rec("a", 1, vec![1, 9]), rec("b", 2, vec![3, 3])],
            vec![rec("a", 1, vec![2, 4]), rec("c", 1, vec![5, 5])],
            vec![rec("a", 1, vec![4, 6]), rec("b", 2, vec![1, 8])],
        ];

        let mut results = Vec::new();
        for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let mut reducer = StreamReducer::new(Arc::clone(&full));
            for i in order {
                reducer.add_input(inputs[i].clone().into(), Arc::clone(&full));
            }
            results.push(reducer.into_stream(2).collect().await.unwrap());
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
        assert_eq!(results[0][0], rec("a", 1, vec![7, 9]));
    }

    #[tokio::test]
    async fn test_input_error_fails_output() {
        let full = schema(&["site", "day"], &["clicks"]);
        let (tx, failing) = RecordStream::channel(4);
        tx.send(rec("a", 1, vec![1])).await.unwrap();
        tx.fail(AggregationError::Storage("read failed".into())).await;
        drop(tx);

        let mut reducer = StreamReducer::new(Arc::clone(&full));
        reducer.add_input(failing, Arc::clone(&full));
        reducer.add_input(vec![rec("a", 2, vec![1])].into(), full);
        let result = reducer.into_stream(4).collect().await;
        assert!(matches!(result, Err(AggregationError::Storage(_))));
    }

    #[tokio::test]
    async fn test_projection() {
        let full = schema(&["site", "day"], &["clicks", "peak"]);
        let output = schema(&["day", "site"], &["peak"]);
        let stream = project_stream(
            vec![rec("a", 1, vec![1, 2])].into(),
            full,
            output,
            4,
        );
        let records = stream.collect().await.unwrap();
        assert_eq!(
            records,
            vec![Record::new(
                vec![KeyValue::Int(1), KeyValue::from("a")],
                vec![MeasureValue::Int(2)]
            )]
        );
    }
}
