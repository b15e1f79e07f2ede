// Copyright 2024-2025, The Weir Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The in-process pipe connecting a source to a sink.
//!
//! A pipe is a bounded, ordered record channel with per-record offsets and an
//! acknowledgement watermark. It stands in for the broker topic of the
//! original per-connector deployment: the source half publishes, the sink
//! half consumes and acknowledges once a batch is delivered.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    channel::{bounded, Receiver, Sender},
    record::{Record, Value},
};
use weir_common::time::nanotime;

#[derive(Debug)]
struct Shared {
    name: String,
    next_offset: AtomicU64,
    // stores `offset + 1` of the last acknowledged record, 0 if none yet
    acked: AtomicU64,
}

/// The publishing half of a pipe, owned by a source driver.
#[derive(Debug, Clone)]
pub struct Pipe {
    shared: Arc<Shared>,
    tx: Sender<Record>,
}

impl Pipe {
    /// name of this pipe
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Publish a payload, assigning it the next offset and an ingest
    /// timestamp. Blocks when the pipe is at capacity.
    ///
    /// # Errors
    /// if the consuming half is gone
    pub async fn publish(
        &self,
        payload: Value,
        key: Option<String>,
        stream: u64,
    ) -> anyhow::Result<u64> {
        let offset = self.shared.next_offset.fetch_add(1, Ordering::AcqRel);
        let record = Record {
            payload,
            key,
            offset,
            stream,
            ingest_ns: nanotime(),
        };
        self.tx
            .send(record)
            .await
            .map_err(|_| anyhow::anyhow!("pipe {} closed", self.shared.name))?;
        Ok(offset)
    }
}

/// The consuming half of a pipe, owned by a sink driver.
#[derive(Debug)]
pub struct PipeReceiver {
    shared: Arc<Shared>,
    rx: Receiver<Record>,
}

impl PipeReceiver {
    /// name of this pipe
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Receive the next record. `None` once the publishing half is dropped
    /// and the buffer is empty.
    pub async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    /// Advance the acknowledgement watermark. A record leaves the pipe for
    /// good only once its batch was delivered.
    pub fn ack(&self, offset: u64) {
        self.shared
            .acked
            .fetch_max(offset.saturating_add(1), Ordering::AcqRel);
    }

    /// offset of the last acknowledged record
    #[must_use]
    pub fn acked(&self) -> Option<u64> {
        self.shared.acked.load(Ordering::Acquire).checked_sub(1)
    }
}

/// Create a pipe with the given name and capacity.
#[must_use]
pub fn pipe(name: &str, capacity: usize) -> (Pipe, PipeReceiver) {
    let shared = Arc::new(Shared {
        name: name.to_string(),
        next_offset: AtomicU64::new(0),
        acked: AtomicU64::new(0),
    });
    let (tx, rx) = bounded(capacity);
    (
        Pipe {
            shared: shared.clone(),
            tx,
        },
        PipeReceiver { shared, rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::json;

    #[tokio::test(flavor = "multi_thread")]
    async fn offsets_are_monotonic() -> anyhow::Result<()> {
        let (tx, mut rx) = pipe("data", 8);
        assert_eq!(tx.publish(json!({"n": 0}), None, 0).await?, 0);
        assert_eq!(tx.publish(json!({"n": 1}), Some("k".to_string()), 0).await?, 1);

        let first = rx.recv().await.expect("record");
        assert_eq!(first.offset, 0);
        assert!(first.ingest_ns > 0);
        let second = rx.recv().await.expect("record");
        assert_eq!(second.offset, 1);
        assert_eq!(second.key.as_deref(), Some("k"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ack_watermark() -> anyhow::Result<()> {
        let (tx, mut rx) = pipe("data", 8);
        for n in 0..3 {
            tx.publish(json!({ "n": n }), None, 0).await?;
        }
        assert_eq!(rx.acked(), None);
        let _ = rx.recv().await;
        // not acked until the batch is delivered
        assert_eq!(rx.acked(), None);
        rx.ack(1);
        assert_eq!(rx.acked(), Some(1));
        // acks never move backwards
        rx.ack(0);
        assert_eq!(rx.acked(), Some(1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closes_when_publisher_dropped() -> anyhow::Result<()> {
        let (tx, mut rx) = pipe("data", 8);
        tx.publish(json!({}), None, 0).await?;
        drop(tx);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        Ok(())
    }
}
