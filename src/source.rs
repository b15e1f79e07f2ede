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

//! The source part of a connector: pulls raw payloads from the external
//! world, normalizes them and publishes them to the pipe.

use std::fmt::Display;

use tokio::time::{sleep_until, Duration, Instant};

use crate::{
    channel::{bounded, Receiver, Sender},
    config::StopAfter,
    pipe::Pipe,
    record::{normalize, RawValue},
    spawn_task,
    system::{KillSwitch, ShutdownMode},
    transform::Transform,
    utils::{
        quiescence::QuiescenceBeacon,
        reconnect::{Attempt, ConnectionLostNotifier},
    },
    Context, ConnectorType, Msg,
};
use weir_common::alias;

/// What a single pull produced.
#[derive(Debug)]
pub enum SourceReply {
    /// a raw payload, normalization happens in the driver
    Data {
        /// the payload as the source saw it
        payload: RawValue,
        /// optional partitioning key
        key: Option<String>,
        /// stream id, sources with one stream use `DEFAULT_STREAM`
        stream: u64,
    },
    /// nothing available right now, ask again in the given number of
    /// milliseconds
    Empty(u64),
    /// the source is exhausted and will never produce data again
    Finished,
}

/// stream id for sources that produce a single stream
pub const DEFAULT_STREAM: u64 = 0;

/// Messages a source driver understands
#[derive(Debug)]
pub enum SourceMsg {
    /// connect the external data provider
    Connect(Sender<anyhow::Result<bool>>, Attempt),
    /// the connector established its connection
    ConnectionEstablished,
    /// the connector lost its connection
    ConnectionLost,
    /// stop pulling
    Pause,
    /// pull again
    Resume,
    /// stop publishing, close the pipe, then report `Msg::SourceDrained`
    Drain(Sender<Msg>),
    /// stop the source
    Stop(Sender<()>),
}

/// address of a source driver task
#[derive(Clone, Debug)]
pub struct SourceAddr {
    pub(crate) addr: Sender<SourceMsg>,
}

impl SourceAddr {
    pub(crate) async fn send(&self, msg: SourceMsg) -> anyhow::Result<()> {
        self.addr.send(msg).await?;
        Ok(())
    }
}

/// context for a source part of a connector
#[derive(Clone)]
pub struct SourceContext {
    pub(crate) alias: alias::Connector,
    pub(crate) connector_type: ConnectorType,
    pub(crate) quiescence_beacon: QuiescenceBeacon,
    pub(crate) notifier: ConnectionLostNotifier,
    pub(crate) kill_switch: KillSwitch,
}

impl SourceContext {
    /// the kill switch of the runtime this source runs in
    #[must_use]
    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    #[cfg(test)]
    pub(crate) fn for_test(kill_switch: KillSwitch) -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            alias: alias::Connector::new("test", "source"),
            connector_type: "fake".into(),
            quiescence_beacon: QuiescenceBeacon::default(),
            notifier: ConnectionLostNotifier::new(tx),
            kill_switch,
        }
    }
}

impl Display for SourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Source::{}]", self.alias)
    }
}

impl Context for SourceContext {
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

/// A source that pulls data from the external world.
#[async_trait::async_trait]
pub trait Source: Send {
    /// Connect to the external data provider. `Ok(false)` means not
    /// connected yet, no error, try again.
    ///
    /// # Errors
    /// if the connection attempt failed
    async fn connect(&mut self, _ctx: &SourceContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Pull the next payload. `pull_id` counts pulls and may be adjusted by
    /// the implementation.
    ///
    /// # Errors
    /// if pulling failed in a way that warrants reconnection
    async fn pull_data(
        &mut self,
        pull_id: &mut u64,
        ctx: &SourceContext,
    ) -> anyhow::Result<SourceReply>;

    /// clean up any held resources, the source is going away
    ///
    /// # Errors
    /// if cleanup failed
    async fn on_stop(&mut self, _ctx: &SourceContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// builder for a source driver
pub struct SourceManagerBuilder {
    qsize: usize,
    pipe: Pipe,
    transforms: Vec<Box<dyn Transform>>,
    stop_after: StopAfter,
}

impl SourceManagerBuilder {
    /// spawn the driver task for the given source
    pub fn spawn<S>(self, source: S, ctx: SourceContext) -> SourceAddr
    where
        S: Source + 'static,
    {
        let (tx, rx) = bounded(self.qsize);
        let manager = SourceManager {
            source,
            ctx: ctx.clone(),
            rx,
            pipe: Some(self.pipe),
            transforms: self.transforms,
            stop_after: self.stop_after,
            connected: false,
            paused: false,
            finished: false,
            emitted: 0,
        };
        spawn_task(ctx, manager.run());
        SourceAddr { addr: tx }
    }
}

/// create a builder for a source driver publishing to the given pipe
pub(crate) fn builder(
    pipe: Pipe,
    transforms: Vec<Box<dyn Transform>>,
    stop_after: StopAfter,
) -> SourceManagerBuilder {
    SourceManagerBuilder {
        qsize: crate::channel::qsize(),
        pipe,
        transforms,
        stop_after,
    }
}

struct SourceManager<S>
where
    S: Source,
{
    source: S,
    ctx: SourceContext,
    rx: Receiver<SourceMsg>,
    pipe: Option<Pipe>,
    transforms: Vec<Box<dyn Transform>>,
    stop_after: StopAfter,
    connected: bool,
    paused: bool,
    finished: bool,
    emitted: u64,
}

impl<S> SourceManager<S>
where
    S: Source,
{
    async fn run(mut self) -> anyhow::Result<()> {
        let mut pull_id: u64 = 0;
        let mut wait_until = Instant::now();
        loop {
            let pulling =
                self.connected && !self.paused && !self.finished && self.pipe.is_some();
            tokio::select! {
                biased;
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    if self.handle_msg(msg).await {
                        return Ok(());
                    }
                }
                reply = async {
                    sleep_until(wait_until).await;
                    if !self.ctx.quiescence_beacon.continue_reading().await {
                        return None;
                    }
                    Some(self.source.pull_data(&mut pull_id, &self.ctx).await)
                }, if pulling => {
                    match reply {
                        Some(reply) => {
                            if let Some(wait_ms) = self.handle_reply(reply).await? {
                                wait_until = Instant::now() + Duration::from_millis(wait_ms);
                            }
                        }
                        // reading ended for good, drain or stop will follow
                        None => self.finished = true,
                    }
                }
            }
        }
        Ok(())
    }

    /// returns true when the driver should stop
    async fn handle_msg(&mut self, msg: SourceMsg) -> bool {
        match msg {
            SourceMsg::Connect(tx, attempt) => {
                info!("{} Connecting... {attempt}", self.ctx);
                let result = self.source.connect(&self.ctx, &attempt).await;
                self.connected = matches!(result, Ok(true));
                if tx.send(result).await.is_err() {
                    error!("{} Error sending connect result.", self.ctx);
                }
            }
            SourceMsg::ConnectionEstablished => self.connected = true,
            SourceMsg::ConnectionLost => self.connected = false,
            SourceMsg::Pause => self.paused = true,
            SourceMsg::Resume => self.paused = false,
            SourceMsg::Drain(tx) => {
                debug!("{} Draining...", self.ctx);
                // closing the pipe lets the sink see the end of the stream
                self.pipe = None;
                if tx.send(Msg::SourceDrained).await.is_err() {
                    error!("{} Error sending SourceDrained message.", self.ctx);
                }
            }
            SourceMsg::Stop(tx) => {
                debug!("{} Stopping...", self.ctx);
                let result = self.source.on_stop(&self.ctx).await;
                self.ctx.swallow_err(result, "Error during on_stop");
                if tx.send(()).await.is_err() {
                    error!("{} Error sending Stop reply.", self.ctx);
                }
                return true;
            }
        }
        false
    }

    /// handle one pull result, returning a wait hint in milliseconds
    async fn handle_reply(
        &mut self,
        reply: anyhow::Result<SourceReply>,
    ) -> anyhow::Result<Option<u64>> {
        match reply {
            Ok(SourceReply::Data {
                payload,
                key,
                stream,
            }) => {
                let value = match normalize(payload) {
                    Ok(value) => value,
                    Err(e) => {
                        // poison payloads are dropped, not fatal
                        warn!("{} Dropping undecodable payload: {e}", self.ctx);
                        return Ok(None);
                    }
                };
                let Some(value) = self.transform(value) else {
                    return Ok(None);
                };
                if let Some(pipe) = self.pipe.as_ref() {
                    pipe.publish(value, key, stream).await?;
                    self.emitted += 1;
                    if let Some(max) = self.stop_after.records {
                        if self.emitted >= max {
                            info!(
                                "{} Stopping: {max} records were published.",
                                self.ctx
                            );
                            self.finished = true;
                            let stopped =
                                self.ctx.kill_switch.stop(ShutdownMode::Graceful).await;
                            self.ctx.swallow_err(stopped, "Error stopping the runtime");
                        }
                    }
                }
                Ok(None)
            }
            Ok(SourceReply::Empty(wait_ms)) => Ok(Some(wait_ms)),
            Ok(SourceReply::Finished) => {
                info!("{} Source finished.", self.ctx);
                self.finished = true;
                let stopped = self.ctx.kill_switch.stop(ShutdownMode::Graceful).await;
                self.ctx.swallow_err(stopped, "Error stopping the runtime");
                Ok(None)
            }
            Err(e) => {
                error!("{} Error pulling data: {e}", self.ctx);
                self.connected = false;
                let notified = self.ctx.notifier().connection_lost().await;
                self.ctx
                    .swallow_err(notified, "Error notifying connection loss");
                Ok(None)
            }
        }
    }

    fn transform(&self, value: crate::record::Value) -> Option<crate::record::Value> {
        let mut value = value;
        for transform in &self.transforms {
            match transform.apply(value) {
                Ok(Some(transformed)) => value = transformed,
                Ok(None) => {
                    debug!(
                        "{} Record dropped by transform '{}'.",
                        self.ctx,
                        transform.name()
                    );
                    return None;
                }
                Err(e) => {
                    warn!(
                        "{} Error in transform '{}', dropping record: {e}",
                        self.ctx,
                        transform.name()
                    );
                    return None;
                }
            }
        }
        Some(value)
    }
}
