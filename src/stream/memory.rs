//! In-process stream with blocking reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Fields, MetadataStream, StreamError, StreamId};

#[derive(Default)]
struct Inner {
    streams: Mutex<HashMap<String, Vec<(StreamId, Fields)>>>,
    appended: Notify,
    failing_reads: AtomicUsize,
}

/// Cheap to clone; clones share entries.
#[derive(Clone, Default)]
pub struct MemoryStream {
    inner: Arc<Inner>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reads fail with a backend error.
    pub fn fail_next_reads(&self, n: usize) {
        self.inner.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn len(&self, key: &str) -> usize {
        self.inner.streams.lock().get(key).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    fn next_id(last: Option<StreamId>) -> StreamId {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        match last {
            Some(last) if now <= last.millis => StreamId::new(last.millis, last.seq + 1),
            _ => StreamId::new(now, 0),
        }
    }

    fn entries_after(&self, key: &str, after: StreamId, count: usize) -> Vec<(StreamId, Fields)> {
        self.inner
            .streams
            .lock()
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(id, _)| *id > after)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetadataStream for MemoryStream {
    async fn append(&self, key: &str, fields: Fields) -> Result<StreamId, StreamError> {
        let id = {
            let mut streams = self.inner.streams.lock();
            let entries = streams.entry(key.to_string()).or_default();
            let id = Self::next_id(entries.last().map(|(id, _)| *id));
            entries.push((id, fields));
            id
        };
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn last_id(&self, key: &str) -> Result<StreamId, StreamError> {
        Ok(self
            .inner
            .streams
            .lock()
            .get(key)
            .and_then(|entries| entries.last().map(|(id, _)| *id))
            .unwrap_or(StreamId::ZERO))
    }

    async fn read(
        &self,
        key: &str,
        after: StreamId,
        block: Duration,
        count: usize,
    ) -> Result<Vec<(StreamId, Fields)>, StreamError> {
        let injected = self
            .inner
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StreamError::Backend("connection reset".to_string()));
        }

        let deadline = Instant::now() + block;
        loop {
            // register interest before checking, so an append in between is not missed
            let notified = self.inner.appended.notified();
            let entries = self.entries_after(key, after, count.max(1));
            if !entries.is_empty() {
                return Ok(entries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &str) -> Fields {
        let mut f = Fields::new();
        f.insert("v".into(), v.into());
        f
    }

    #[tokio::test]
    async fn test_ids_increase_and_reads_are_exclusive() {
        let stream = MemoryStream::new();
        let a = stream.append("k", fields("a")).await.unwrap();
        let b = stream.append("k", fields("b")).await.unwrap();
        assert!(b > a);
        assert_eq!(stream.last_id("k").await.unwrap(), b);
        assert_eq!(stream.last_id("other").await.unwrap(), StreamId::ZERO);

        let after_a = stream.read("k", a, Duration::ZERO, 10).await.unwrap();
        assert_eq!(after_a.len(), 1);
        assert_eq!(after_a[0].1["v"], "b");

        let capped = stream.read("k", StreamId::ZERO, Duration::ZERO, 1).await.unwrap();
        assert_eq!(capped[0].0, a);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let stream = MemoryStream::new();
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .read("k", StreamId::ZERO, Duration::from_secs(5), 10)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.append("k", fields("x")).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let stream = MemoryStream::new();
        let got = stream
            .read("k", StreamId::ZERO, Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let stream = MemoryStream::new();
        stream.fail_next_reads(1);
        assert!(stream.read("k", StreamId::ZERO, Duration::ZERO, 1).await.is_err());
        assert!(stream.read("k", StreamId::ZERO, Duration::ZERO, 1).await.is_ok());
    }
}
