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

//! The sink part of a connector: batches records off a pipe and drives them
//! through the write retry policy.

use std::fmt::Display;

use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::{
    channel::{bounded, Receiver, Sender},
    config::BatchingConfig,
    errors::Error,
    pipe::PipeReceiver,
    record::{Batch, Record},
    spawn_task,
    utils::{
        quiescence::QuiescenceBeacon,
        reconnect::{Attempt, ConnectionLostNotifier},
        retry::{self, Delivery, FailureKind, RetryConfig},
    },
    Context, ConnectorType, Msg,
};
use weir_common::alias;

/// Messages a sink driver understands
#[derive(Debug)]
pub enum SinkMsg {
    /// connect the external store
    Connect(Sender<anyhow::Result<bool>>, Attempt),
    /// the connector established its connection
    ConnectionEstablished,
    /// the connector lost its connection
    ConnectionLost,
    /// stop pulling records off the pipe
    Pause,
    /// pull records again
    Resume,
    /// flush everything still buffered, then report `Msg::SinkDrained`
    Drain(Sender<Msg>),
    /// stop the sink
    Stop(Sender<()>),
}

/// address of a sink driver task
#[derive(Clone, Debug)]
pub struct SinkAddr {
    pub(crate) addr: Sender<SinkMsg>,
}

impl SinkAddr {
    pub(crate) async fn send(&self, msg: SinkMsg) -> anyhow::Result<()> {
        self.addr.send(msg).await?;
        Ok(())
    }
}

/// context for a sink part of a connector
#[derive(Clone)]
pub struct SinkContext {
    pub(crate) alias: alias::Connector,
    pub(crate) connector_type: ConnectorType,
    pub(crate) quiescence_beacon: QuiescenceBeacon,
    pub(crate) notifier: ConnectionLostNotifier,
}

impl SinkContext {
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            alias: alias::Connector::new("test", "sink"),
            connector_type: "fake".into(),
            quiescence_beacon: QuiescenceBeacon::default(),
            notifier: ConnectionLostNotifier::new(tx),
        }
    }
}

impl Display for SinkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Sink::{}]", self.alias)
    }
}

impl Context for SinkContext {
    fn alias(&self) -> &alias::Connector {
        &self.alias
    }

    fn quiescence_beacon(&self) -> &QuiescenceBeacon {
        &self.quiescence_beacon
    }

    fn notifier(&self) -> &ConnectionLostNotifier {
        &self.notifier
    }

    fn connector_type(&self) -> &ConnectorType {
        &self.connector_type
    }
}

/// A sink that writes whole batches to an external store.
///
/// Implementations only provide the write and its failure taxonomy, the
/// driver owns batching, the retry policy and acknowledgements.
#[async_trait::async_trait]
pub trait BatchSink: Send {
    /// Connect to the external store. `Ok(false)` means not connected yet,
    /// no error, try again.
    ///
    /// # Errors
    /// if the connection attempt failed
    async fn connect(&mut self, _ctx: &SinkContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Write one batch, all or nothing as far as the implementation can
    /// manage. Must be safe to call again with the same batch.
    ///
    /// # Errors
    /// if the write failed
    async fn write_batch(&mut self, batch: &Batch, ctx: &SinkContext) -> anyhow::Result<()>;

    /// Map a write error onto the retry policy's failure taxonomy.
    /// The default matches against well-known message markers.
    fn classify(&self, error: &anyhow::Error) -> FailureKind {
        retry::classify(error)
    }

    /// re-establish the connection between retry attempts
    ///
    /// # Errors
    /// if the reconnection attempt failed
    async fn reconnect(&mut self, ctx: &SinkContext) -> anyhow::Result<bool> {
        self.connect(ctx, &Attempt::default()).await
    }

    /// clean up any held resources, the sink is going away
    ///
    /// # Errors
    /// if cleanup failed
    async fn on_stop(&mut self, _ctx: &SinkContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// builder for a sink driver
pub struct SinkManagerBuilder {
    qsize: usize,
    pipe: PipeReceiver,
    batching: BatchingConfig,
    retry: RetryConfig,
}

impl SinkManagerBuilder {
    /// spawn the driver task for the given sink
    pub fn spawn<S>(self, sink: S, ctx: SinkContext) -> SinkAddr
    where
        S: BatchSink + 'static,
    {
        let (tx, rx) = bounded(self.qsize);
        let manager = SinkManager {
            sink,
            ctx: ctx.clone(),
            rx,
            pipe: self.pipe,
            batching: self.batching,
            retry: self.retry,
        };
        spawn_task(ctx, manager.run());
        SinkAddr { addr: tx }
    }
}

/// create a builder for a sink driver reading off the given pipe
pub(crate) fn builder(
    pipe: PipeReceiver,
    batching: BatchingConfig,
    retry: RetryConfig,
) -> SinkManagerBuilder {
    SinkManagerBuilder {
        qsize: crate::channel::qsize(),
        pipe,
        batching,
        retry,
    }
}

struct SinkManager<S>
where
    S: BatchSink,
{
    sink: S,
    ctx: SinkContext,
    rx: Receiver<SinkMsg>,
    pipe: PipeReceiver,
    batching: BatchingConfig,
    retry: RetryConfig,
}

impl<S> SinkManager<S>
where
    S: BatchSink,
{
    async fn run(mut self) -> anyhow::Result<()> {
        let flush_interval = Duration::from_millis(self.batching.flush_interval_ms);
        let max_batch = self.batching.max_batch_size.max(1);
        let mut buffer: Vec<Record> = Vec::with_capacity(max_batch);
        let mut deadline = Instant::now() + flush_interval;
        let mut paused = false;
        let mut pipe_open = true;
        let mut drain_reply: Option<Sender<Msg>> = None;
        loop {
            tokio::select! {
                biased;
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        // connector is gone
                        break;
                    };
                    match msg {
                        SinkMsg::Connect(tx, attempt) => {
                            info!("{} Connecting... {attempt}", self.ctx);
                            let result = self.sink.connect(&self.ctx, &attempt).await;
                            if tx.send(result).await.is_err() {
                                error!("{} Error sending connect result.", self.ctx);
                            }
                        }
                        SinkMsg::ConnectionEstablished | SinkMsg::ConnectionLost => {
                            // the retry policy reconnects on its own behalf
                        }
                        SinkMsg::Pause => paused = true,
                        SinkMsg::Resume => paused = false,
                        SinkMsg::Drain(tx) => {
                            debug!("{} Draining...", self.ctx);
                            drain_reply = Some(tx);
                        }
                        SinkMsg::Stop(tx) => {
                            debug!("{} Stopping...", self.ctx);
                            let ctx = self.ctx.clone();
                            ctx.swallow_err(
                                self.sink.on_stop(&self.ctx).await,
                                "Error during on_stop",
                            );
                            if tx.send(()).await.is_err() {
                                error!("{} Error sending Stop reply.", self.ctx);
                            }
                            return Ok(());
                        }
                    }
                }
                record = self.pipe.recv(), if pipe_open && !paused => {
                    match record {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= max_batch {
                                self.flush(&mut buffer).await;
                                deadline = Instant::now() + flush_interval;
                            }
                        }
                        None => pipe_open = false,
                    }
                }
                () = sleep_until(deadline), if !paused => {
                    self.flush(&mut buffer).await;
                    deadline = Instant::now() + flush_interval;
                }
            }
            if drain_reply.is_some() && !pipe_open {
                // the source half is gone and everything it sent is buffered
                self.flush(&mut buffer).await;
                if let Some(tx) = drain_reply.take() {
                    debug!("{} Drained.", self.ctx);
                    if tx.send(Msg::SinkDrained).await.is_err() {
                        error!("{} Error sending SinkDrained message.", self.ctx);
                    }
                }
            }
        }
        Ok(())
    }

    /// Deliver the buffered records as one batch. Backpressure verdicts
    /// pause this driver and redeliver the same batch with a fresh attempt
    /// budget. Fatal errors drop the batch: exhausted retries additionally
    /// notify connection loss so the reconnect logic takes over.
    async fn flush(&mut self, buffer: &mut Vec<Record>) {
        if buffer.is_empty() {
            return;
        }
        let batch = Batch {
            pipe: self.pipe.name().to_string(),
            records: std::mem::take(buffer),
        };
        loop {
            match retry::deliver(&mut self.sink, &batch, &self.retry, &self.ctx).await {
                Ok(Delivery::Delivered) => {
                    if let Some(last) = batch.last_offset() {
                        self.pipe.ack(last);
                    }
                    return;
                }
                Ok(Delivery::Backpressure { retry_after }) => {
                    info!(
                        "{} Pausing deliveries for {retry_after:?} before redelivering {} records.",
                        self.ctx,
                        batch.len()
                    );
                    sleep(retry_after).await;
                }
                Err(e) => {
                    if matches!(
                        e.downcast_ref::<Error>(),
                        Some(Error::WriteExhausted(..))
                    ) {
                        error!("{} Dropping batch of {}: {e}", self.ctx, batch.len());
                        let ctx = self.ctx.clone();
                        ctx.swallow_err(
                            self.ctx.notifier().connection_lost().await,
                            "Error notifying connection loss",
                        );
                    } else {
                        error!(
                            "{} Dropping batch of {} on unrecoverable error: {e}",
                            self.ctx,
                            batch.len()
                        );
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use anyhow::anyhow;
    use simd_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;

    /// records every delivered batch, failing as scripted
    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<Vec<u64>>>>,
        fail_next: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RecordingSink {
        fn delivered(&self) -> Vec<Vec<u64>> {
            self.batches.lock().expect("poisoned").clone()
        }

        fn fail_once(&self, msg: &'static str) {
            self.fail_next.lock().expect("poisoned").push(msg);
        }
    }

    #[async_trait::async_trait]
    impl BatchSink for RecordingSink {
        async fn write_batch(&mut self, batch: &Batch, _ctx: &SinkContext) -> anyhow::Result<()> {
            if let Some(msg) = self.fail_next.lock().expect("poisoned").pop() {
                return Err(anyhow!("{msg}"));
            }
            self.batches
                .lock()
                .expect("poisoned")
                .push(batch.records.iter().map(|r| r.offset).collect());
            Ok(())
        }
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            backpressure_delay_ms: 50,
            ..Default::default()
        }
    }

    fn spawn_sink(
        sink: RecordingSink,
        batching: BatchingConfig,
    ) -> (crate::pipe::Pipe, SinkAddr) {
        let (publisher, receiver) = pipe("data", 64);
        let addr = builder(receiver, batching, retry_config()).spawn(sink, SinkContext::for_test());
        (publisher, addr)
    }

    async fn drain(addr: &SinkAddr) -> anyhow::Result<()> {
        let (tx, mut rx) = bounded(1);
        addr.send(SinkMsg::Drain(tx)).await?;
        let reply = timeout(Duration::from_secs(5), rx.recv())
            .await?
            .ok_or_else(|| anyhow!("sink gone"))?;
        assert!(matches!(reply, Msg::SinkDrained));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_by_size() -> anyhow::Result<()> {
        let sink = RecordingSink::default();
        let (publisher, addr) = spawn_sink(
            sink.clone(),
            BatchingConfig {
                max_batch_size: 2,
                flush_interval_ms: 10_000,
            },
        );
        for _ in 0..5 {
            publisher.publish(json!({"v": 1}), None, 0).await?;
        }
        drop(publisher);
        drain(&addr).await?;
        // two full batches, the drain flushes the remainder
        assert_eq!(vec![vec![0, 1], vec![2, 3], vec![4]], sink.delivered());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flushes_on_interval() -> anyhow::Result<()> {
        let sink = RecordingSink::default();
        let (publisher, _addr) = spawn_sink(
            sink.clone(),
            BatchingConfig {
                max_batch_size: 1000,
                flush_interval_ms: 20,
            },
        );
        publisher.publish(json!({"v": 1}), None, 0).await?;
        publisher.publish(json!({"v": 2}), None, 0).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(vec![vec![0, 1]], sink.delivered());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backpressure_pauses_and_redelivers() -> anyhow::Result<()> {
        let sink = RecordingSink::default();
        sink.fail_once("rate limit exceeded");
        let (publisher, addr) = spawn_sink(
            sink.clone(),
            BatchingConfig {
                max_batch_size: 2,
                flush_interval_ms: 10_000,
            },
        );
        let start = Instant::now();
        publisher.publish(json!({"v": 1}), None, 0).await?;
        publisher.publish(json!({"v": 2}), None, 0).await?;
        drop(publisher);
        drain(&addr).await?;
        // the same batch again after the backpressure delay
        assert_eq!(vec![vec![0, 1]], sink.delivered());
        assert!(start.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_failure_drops_batch() -> anyhow::Result<()> {
        let sink = RecordingSink::default();
        sink.fail_once("syntax error in insert");
        let (publisher, addr) = spawn_sink(
            sink.clone(),
            BatchingConfig {
                max_batch_size: 1,
                flush_interval_ms: 10_000,
            },
        );
        publisher.publish(json!({"v": 1}), None, 0).await?;
        publisher.publish(json!({"v": 2}), None, 0).await?;
        drop(publisher);
        drain(&addr).await?;
        // first batch dropped, second delivered
        assert_eq!(vec![vec![1]], sink.delivered());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_replies() -> anyhow::Result<()> {
        let sink = RecordingSink::default();
        let (_publisher, addr) = spawn_sink(
            sink,
            BatchingConfig {
                max_batch_size: 10,
                flush_interval_ms: 10_000,
            },
        );
        let (tx, mut rx) = bounded(1);
        addr.send(SinkMsg::Stop(tx)).await?;
        timeout(Duration::from_secs(5), rx.recv())
            .await?
            .ok_or_else(|| anyhow!("no stop reply"))?;
        Ok(())
    }
}
