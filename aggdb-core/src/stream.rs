//! Record streams between pipeline stages
//!
//! Stages are connected by bounded channels, so a slow consumer suspends
//! its producer. A [`RecordStream`] is the reading end of a stage; a
//! [`RecordSink`] is the writing end handed out by chunk storage. A sink
//! that is dropped without [`RecordSink::close`] counts as aborted and the
//! storage discards whatever it had written.

use crate::types::Record;
use crate::{AggregationError, Result};
use tokio::sync::{mpsc, oneshot};

/// Ordered stream of records
pub struct RecordStream {
    inner: Inner,
}

enum Inner {
    Memory(std::vec::IntoIter<Record>),
    Channel(mpsc::Receiver<Result<Record>>),
}

impl RecordStream {
    /// Stream over records already in memory
    pub fn from_vec(records: Vec<Record>) -> Self {
        Self {
            inner: Inner::Memory(records.into_iter()),
        }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Bounded channel; the stream ends when every sender is dropped
    pub fn channel(capacity: usize) -> (RecordSender, RecordStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            RecordSender { tx },
            RecordStream {
                inner: Inner::Channel(rx),
            },
        )
    }

    /// Next record, `None` at end of stream
    pub async fn next(&mut self) -> Option<Result<Record>> {
        match &mut self.inner {
            Inner::Memory(iter) => iter.next().map(Ok),
            Inner::Channel(rx) => rx.recv().await,
        }
    }

    /// Drain the stream, stopping at the first error
    pub async fn collect(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }
}

impl From<Vec<Record>> for RecordStream {
    fn from(records: Vec<Record>) -> Self {
        Self::from_vec(records)
    }
}

/// Producing end of a [`RecordStream`]
#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Result<Record>>,
}

impl RecordSender {
    /// Send a record, failing with `Cancelled` once the stream is dropped
    pub async fn send(&self, record: Record) -> Result<()> {
        self.tx
            .send(Ok(record))
            .await
            .map_err(|_| AggregationError::Cancelled("record stream dropped".into()))
    }

    /// Terminate the stream with an error
    pub async fn fail(&self, error: AggregationError) {
        let _ = self.tx.send(Err(error)).await;
    }

    /// Check whether the consumer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum SinkMessage {
    Record(Record),
    Close,
}

/// Writing end of a chunk being stored
pub struct RecordSink {
    tx: mpsc::Sender<SinkMessage>,
    done: Option<oneshot::Receiver<Result<()>>>,
}

impl RecordSink {
    /// Sink paired with the receiver the storage drains
    pub fn channel(capacity: usize) -> (RecordSink, SinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        (
            RecordSink {
                tx,
                done: Some(done_rx),
            },
            SinkReceiver {
                rx,
                done: Some(done_tx),
            },
        )
    }

    /// Write one record
    pub async fn write(&mut self, record: Record) -> Result<()> {
        if self.tx.send(SinkMessage::Record(record)).await.is_err() {
            return Err(self.storage_error().await);
        }
        Ok(())
    }

    /// Flush and wait for the storage to accept the chunk
    pub async fn close(mut self) -> Result<()> {
        if self.tx.send(SinkMessage::Close).await.is_err() {
            return Err(self.storage_error().await);
        }
        match self.done.take() {
            Some(done) => done
                .await
                .unwrap_or_else(|_| Err(AggregationError::Storage("chunk writer stopped".into()))),
            None => Err(AggregationError::Storage("chunk writer stopped".into())),
        }
    }

    /// Error reported by the storage after it stopped reading
    async fn storage_error(&mut self) -> AggregationError {
        match self.done.take() {
            Some(done) => match done.await {
                Ok(Err(e)) => e,
                _ => AggregationError::Storage("chunk writer stopped".into()),
            },
            None => AggregationError::Storage("chunk writer stopped".into()),
        }
    }
}

/// What a storage writer sees next
pub enum SinkEvent {
    Record(Record),
    /// The producer finished and waits for confirmation
    Closed,
    /// The producer went away without closing
    Aborted,
}

/// Storage side of a [`RecordSink`]
pub struct SinkReceiver {
    rx: mpsc::Receiver<SinkMessage>,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl SinkReceiver {
    pub async fn recv(&mut self) -> SinkEvent {
        match self.rx.recv().await {
            Some(SinkMessage::Record(record)) => SinkEvent::Record(record),
            Some(SinkMessage::Close) => SinkEvent::Closed,
            None => SinkEvent::Aborted,
        }
    }

    /// Report the outcome to the producer
    ///
    /// Returns false when the producer stopped waiting for it.
    pub fn finish(mut self, result: Result<()>) -> bool {
        self.rx.close();
        match self.done.take() {
            Some(done) => done.send(result).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyValue, PrimaryKey};

    fn record(k: i64) -> Record {
        Record::new(PrimaryKey::new(vec![KeyValue::Int(k)]), vec![])
    }

    #[tokio::test]
    async fn test_channel_stream() {
        let (tx, stream) = RecordStream::channel(2);
        tokio::spawn(async move {
            for k in 0..5 {
                tx.send(record(k)).await.unwrap();
            }
        });
        let records = stream.collect().await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4], record(4));
    }

    #[tokio::test]
    async fn test_stream_error_stops_collect() {
        let (tx, stream) = RecordStream::channel(4);
        tx.send(record(1)).await.unwrap();
        tx.fail(AggregationError::Storage("boom".into())).await;
        drop(tx);
        assert!(matches!(stream.collect().await, Err(AggregationError::Storage(_))));
    }

    #[tokio::test]
    async fn test_dropped_stream_cancels_sender() {
        let (tx, stream) = RecordStream::channel(1);
        drop(stream);
        assert!(tx.is_closed());
        assert!(matches!(tx.send(record(1)).await, Err(AggregationError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_sink_close_and_abort() {
        let (mut sink, mut receiver) = RecordSink::channel(4);
        let writer = tokio::spawn(async move {
            let mut count = 0;
            loop {
                match receiver.recv().await {
                    SinkEvent::Record(_) => count += 1,
                    SinkEvent::Closed => {
                        receiver.finish(Ok(()));
                        return Some(count);
                    }
                    SinkEvent::Aborted => return None,
                }
            }
        });
        sink.write(record(1)).await.unwrap();
        sink.write(record(2)).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(writer.await.unwrap(), Some(2));

        let (mut sink, mut receiver) = RecordSink::channel(4);
        let writer = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    SinkEvent::Record(_) => {}
                    SinkEvent::Closed => return false,
                    SinkEvent::Aborted => return true,
                }
            }
        });
        sink.write(record(1)).await.unwrap();
        drop(sink);
        assert!(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_sink_reports_storage_error() {
        let (mut sink, mut receiver) = RecordSink::channel(1);
        tokio::spawn(async move {
            let _ = receiver.recv().await;
            receiver.finish(Err(AggregationError::Storage("disk full".into())));
        });
        sink.write(record(1)).await.unwrap();
        let mut result = Ok(());
        for k in 2..10 {
            result = sink.write(record(k)).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(AggregationError::Storage(_))));
    }
}
