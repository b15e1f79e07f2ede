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

//! Weir runtime: backpressure-aware connectors for streaming sensor
//! pipelines.
//!
//! A flow wires one source connector through a pipe into one sink connector.
//! Connectors own their external connection and participate in the runtime's
//! reconnect and quiescence protocols; the sink driver owns batching and the
//! write retry policy.

#![deny(warnings)]
#![deny(missing_docs)]
#![recursion_limit = "1024"]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::unnecessary_unwrap,
    clippy::pedantic,
    clippy::mod_module_files
)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

/// channel plumbing
pub mod channel;
/// connector configuration
pub mod config;
/// errors
pub mod errors;
/// flow assembly
pub mod flow;
/// connector implementations
pub mod impls;
/// the pipe between source and sink
pub mod pipe;
/// records, batches and payload normalization
pub mod record;
/// sink parts
pub mod sink;
/// source parts
pub mod source;
/// the runtime and its kill switch
pub mod system;
/// record transforms
pub mod transform;
/// utilities shared by connectors
pub mod utils;

use std::fmt::Display;

use futures::Future;
use tokio::task::{self, JoinHandle};

use crate::{
    channel::{bounded, Sender},
    config::{ConnectorConfig, Reconnect},
    errors::Error,
    pipe::{Pipe, PipeReceiver},
    sink::{SinkAddr, SinkContext, SinkMsg},
    source::{SourceAddr, SourceContext, SourceMsg},
    system::KillSwitch,
    utils::{
        quiescence::QuiescenceBeacon,
        reconnect::{Attempt, ConnectionLostNotifier, ReconnectRuntime},
    },
};
use weir_common::alias;

/// Log an error result with context, evaluating to whether it was an error.
#[macro_export]
macro_rules! log_error {
    ($maybe_error:expr, $($args:tt)+) => (
        if let Err(e) = $maybe_error {
            error!($($args)+);
            true
        } else {
            false
        }
    );
}

/// Identifier for a connector implementation
#[derive(Debug, PartialEq, PartialOrd, Eq, Hash, Clone, Serialize, Deserialize, Default)]
pub struct ConnectorType(String);

impl From<ConnectorType> for String {
    fn from(ct: ConnectorType) -> Self {
        ct.0
    }
}

impl From<String> for ConnectorType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectorType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Display for ConnectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// connection state of a connector
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Connectivity {
    /// connected
    Connected,
    /// disconnected
    Disconnected,
}

/// state of a connector
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum State {
    Initializing,
    Running,
    Paused,
    Draining,
    Drained,
    Stopped,
}

/// Messages a connector task understands
#[derive(Debug)]
pub enum Msg {
    /// start the connector and attempt the first connection
    Start(Sender<anyhow::Result<()>>),
    /// pause both halves
    Pause,
    /// resume both halves
    Resume,
    /// the connector lost its connection
    ConnectionLost,
    /// attempt reconnecting, scheduled by the reconnect logic
    Reconnect,
    /// drain: stop reading, flush the sink, then reply
    Drain(Sender<()>),
    /// the source part finished draining
    SourceDrained,
    /// the sink part finished draining
    SinkDrained,
    /// stop everything and reply once both halves are gone
    Stop(Sender<()>),
}

/// address of a running connector
#[derive(Clone, Debug)]
pub struct Addr {
    /// the connector instance alias
    pub(crate) alias: alias::Connector,
    /// control-plane sender
    pub(crate) sender: Sender<Msg>,
    pub(crate) source: Option<SourceAddr>,
    pub(crate) sink: Option<SinkAddr>,
}

impl Addr {
    /// the connector instance alias
    #[must_use]
    pub fn alias(&self) -> &alias::Connector {
        &self.alias
    }

    /// send a message to the connector task
    ///
    /// # Errors
    /// if the connector is stopped
    pub async fn send(&self, msg: Msg) -> anyhow::Result<()> {
        self.sender.send(msg).await?;
        Ok(())
    }

    pub(crate) async fn send_source(&self, msg: SourceMsg) -> anyhow::Result<()> {
        if let Some(source) = self.source.as_ref() {
            source.send(msg).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_sink(&self, msg: SinkMsg) -> anyhow::Result<()> {
        if let Some(sink) = self.sink.as_ref() {
            sink.send(msg).await?;
        }
        Ok(())
    }

    pub(crate) fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub(crate) fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// start the connector, returning once the first connection attempt
    /// settled
    ///
    /// # Errors
    /// if the connector could not start
    pub async fn start(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = bounded(1);
        self.send(Msg::Start(tx)).await?;
        rx.recv()
            .await
            .ok_or(Error::ControlplaneReply(self.alias.clone()))?
    }

    /// drain the connector
    ///
    /// # Errors
    /// if the connector is stopped
    pub async fn drain(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = bounded(1);
        self.send(Msg::Drain(tx)).await?;
        rx.recv()
            .await
            .ok_or(Error::ControlplaneReply(self.alias.clone()))?;
        Ok(())
    }

    /// stop the connector
    ///
    /// # Errors
    /// if the connector is stopped already
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = bounded(1);
        self.send(Msg::Stop(tx)).await?;
        rx.recv()
            .await
            .ok_or(Error::ControlplaneReply(self.alias.clone()))?;
        Ok(())
    }
}

/// Keeps connector implementations aligned on how they log and handle
/// failures against their instance identity.
pub trait Context: Display + Clone {
    /// the connector instance alias
    fn alias(&self) -> &alias::Connector;

    /// the quiescence beacon of the connector
    fn quiescence_beacon(&self) -> &QuiescenceBeacon;

    /// the connection-lost notifier of the connector
    fn notifier(&self) -> &ConnectionLostNotifier;

    /// the type of the connector
    fn connector_type(&self) -> &ConnectorType;

    /// only log an error and swallow the result
    fn swallow_err<T, E, M>(&self, expr: Result<T, E>, msg: &M)
    where
        E: Display,
        M: Display + ?Sized,
    {
        if let Err(e) = expr {
            error!("{self} {msg}: {e}");
        }
    }

    /// log an error and return the result
    fn bail_err<T, E, M>(&self, expr: Result<T, E>, msg: &M) -> Result<T, E>
    where
        E: Display,
        M: Display + ?Sized,
    {
        if let Err(e) = &expr {
            error!("{self} {msg}: {e}");
        }
        expr
    }

    /// log an error, returning whether one occurred
    fn log_err<T, E, M>(&self, expr: Result<T, E>, msg: &M) -> bool
    where
        E: Display,
        M: Display + ?Sized,
    {
        if let Err(e) = expr {
            error!("{self} {msg}: {e}");
            true
        } else {
            false
        }
    }
}

/// connector context
#[derive(Clone)]
pub struct ConnectorContext {
    /// alias of the connector instance
    pub(crate) alias: alias::Connector,
    /// type of the connector
    pub(crate) connector_type: ConnectorType,
    /// the quiescence beacon
    pub(crate) quiescence_beacon: QuiescenceBeacon,
    /// the connection-lost notifier
    pub(crate) notifier: ConnectionLostNotifier,
}

impl Display for ConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Connector::{}]", self.alias)
    }
}

impl Context for ConnectorContext {
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

/// A connector: owns the external connection and hands out its source and/or
/// sink halves to the runtime.
#[async_trait::async_trait]
pub trait Connector: Send {
    /// Create the source part, if this connector has one.
    ///
    /// # Errors
    /// if the source could not be built
    async fn create_source(
        &mut self,
        _ctx: SourceContext,
        _builder: source::SourceManagerBuilder,
    ) -> anyhow::Result<Option<SourceAddr>> {
        Ok(None)
    }

    /// Create the sink part, if this connector has one.
    ///
    /// # Errors
    /// if the sink could not be built
    async fn create_sink(
        &mut self,
        _ctx: SinkContext,
        _builder: sink::SinkManagerBuilder,
    ) -> anyhow::Result<Option<SinkAddr>> {
        Ok(None)
    }

    /// Attempt to connect to the outside world. `Ok(false)` means not
    /// connected yet, no hard error, the reconnect logic decides on a retry.
    ///
    /// # Errors
    /// if the connection attempt failed
    async fn connect(&mut self, _ctx: &ConnectorContext, _attempt: &Attempt) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// called once when the connector starts
    ///
    /// # Errors
    /// if starting failed, the connector will not run
    async fn on_start(&mut self, _ctx: &ConnectorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// called when the connector pauses
    ///
    /// # Errors
    /// if pausing failed
    async fn on_pause(&mut self, _ctx: &ConnectorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// called when the connector resumes
    ///
    /// # Errors
    /// if resuming failed
    async fn on_resume(&mut self, _ctx: &ConnectorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// called when the connector drains
    ///
    /// # Errors
    /// if draining failed
    async fn on_drain(&mut self, _ctx: &ConnectorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// called when the connector stops
    ///
    /// # Errors
    /// if stopping failed
    async fn on_stop(&mut self, _ctx: &ConnectorContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds a connector implementation from its instance configuration.
#[async_trait::async_trait]
pub trait ConnectorBuilder: Sync + Send + std::fmt::Debug {
    /// the type of the connector
    fn connector_type(&self) -> ConnectorType;

    /// Build the connector, validating its configuration.
    ///
    /// # Errors
    /// if the configuration is invalid
    async fn build(
        &self,
        alias: &alias::Connector,
        config: &ConnectorConfig,
    ) -> anyhow::Result<Box<dyn Connector>> {
        let cc = config
            .config
            .as_ref()
            .ok_or_else(|| Error::MissingConfiguration(alias.clone()))?;
        self.build_cfg(alias, config, cc).await
    }

    /// Build the connector from its mandatory inner configuration.
    ///
    /// # Errors
    /// if the configuration is invalid
    async fn build_cfg(
        &self,
        alias: &alias::Connector,
        _config: &ConnectorConfig,
        _connector_config: &weir_config::Value,
    ) -> anyhow::Result<Box<dyn Connector>> {
        Err(Error::InvalidDefinition(alias.clone(), "build_cfg is unimplemented".to_string()).into())
    }
}

/// the parts a connector needs to assemble its source half
pub(crate) struct SourceSpec {
    pub(crate) pipe: Pipe,
    pub(crate) transforms: Vec<Box<dyn transform::Transform>>,
    pub(crate) stop_after: config::StopAfter,
    pub(crate) kill_switch: KillSwitch,
}

/// the parts a connector needs to assemble its sink half
pub(crate) struct SinkSpec {
    pub(crate) pipe: PipeReceiver,
    pub(crate) batching: config::BatchingConfig,
    pub(crate) retry: utils::retry::RetryConfig,
}

/// Spawn a connector with its source and/or sink halves and its control
/// task. The connector is not connected until `Addr::start` is called.
pub(crate) async fn spawn(
    alias: &alias::Connector,
    mut connector: Box<dyn Connector>,
    reconnect: &Reconnect,
    connector_type: ConnectorType,
    source_spec: Option<SourceSpec>,
    sink_spec: Option<SinkSpec>,
) -> anyhow::Result<Addr> {
    let qsize = channel::qsize();
    let (msg_tx, msg_rx) = bounded(qsize);
    let notifier = ConnectionLostNotifier::new(msg_tx.clone());
    let quiescence_beacon = QuiescenceBeacon::default();

    let source = if let Some(spec) = source_spec {
        let ctx = SourceContext {
            alias: alias.clone(),
            connector_type: connector_type.clone(),
            quiescence_beacon: quiescence_beacon.clone(),
            notifier: notifier.clone(),
            kill_switch: spec.kill_switch,
        };
        let builder = source::builder(spec.pipe, spec.transforms, spec.stop_after);
        connector
            .create_source(ctx, builder)
            .await
            .map_err(|e| Error::CreateSource(alias.clone(), e))?
    } else {
        None
    };

    let sink = if let Some(spec) = sink_spec {
        let ctx = SinkContext {
            alias: alias.clone(),
            connector_type: connector_type.clone(),
            quiescence_beacon: quiescence_beacon.clone(),
            notifier: notifier.clone(),
        };
        let builder = sink::builder(spec.pipe, spec.batching, spec.retry);
        connector
            .create_sink(ctx, builder)
            .await
            .map_err(|e| Error::CreateSink(alias.clone(), e))?
    } else {
        None
    };

    let addr = Addr {
        alias: alias.clone(),
        sender: msg_tx,
        source,
        sink,
    };

    let ctx = ConnectorContext {
        alias: alias.clone(),
        connector_type,
        quiescence_beacon: quiescence_beacon.clone(),
        notifier,
    };
    let reconnect_runtime = ReconnectRuntime::new(&addr, reconnect);

    let task = ConnectorTask {
        connector,
        ctx,
        addr: addr.clone(),
        rx: msg_rx,
        reconnect: reconnect_runtime,
        connectivity: Connectivity::Disconnected,
        state: State::Initializing,
        drainage: None,
    };
    task::spawn(task.run());

    Ok(addr)
}

struct Drainage {
    tx: Sender<()>,
    source_drained: bool,
    sink_drained: bool,
}

impl Drainage {
    fn new(addr: &Addr, tx: Sender<()>) -> Self {
        Self {
            tx,
            source_drained: !addr.has_source(),
            sink_drained: !addr.has_sink(),
        }
    }

    fn done(&self) -> bool {
        self.source_drained && self.sink_drained
    }

    async fn report(&self) -> anyhow::Result<()> {
        self.tx.send(()).await?;
        Ok(())
    }
}

struct ConnectorTask {
    connector: Box<dyn Connector>,
    ctx: ConnectorContext,
    addr: Addr,
    rx: channel::Receiver<Msg>,
    reconnect: ReconnectRuntime,
    connectivity: Connectivity,
    state: State,
    drainage: Option<Drainage>,
}

impl ConnectorTask {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match self.handle(msg).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    error!("{} Error handling control message: {e}", self.ctx);
                }
            }
        }
        debug!("{} Connector task stopped.", self.ctx);
    }

    /// returns true when the task should end
    async fn handle(&mut self, msg: Msg) -> anyhow::Result<bool> {
        match msg {
            Msg::Start(tx) if self.state == State::Initializing => {
                info!("{} Starting...", self.ctx);
                if let Err(e) = self.connector.on_start(&self.ctx).await {
                    error!("{} Error during on_start: {e}", self.ctx);
                    self.state = State::Stopped;
                    tx.send(Err(e)).await?;
                    return Ok(true);
                }
                self.state = State::Running;
                let (connectivity, will_retry) = self
                    .reconnect
                    .attempt(self.connector.as_mut(), &self.ctx)
                    .await?;
                self.change_connectivity(connectivity).await;
                if connectivity == Connectivity::Disconnected && !will_retry {
                    tx.send(Err(Error::ConnectionFailed(self.ctx.alias.clone()).into()))
                        .await?;
                    return Ok(true);
                }
                tx.send(Ok(())).await?;
            }
            Msg::Start(_) => {
                info!("{} Ignoring Start, not initializing.", self.ctx);
            }
            Msg::Pause if self.state == State::Running => {
                info!("{} Pausing...", self.ctx);
                self.ctx.quiescence_beacon.pause();
                let paused = self.connector.on_pause(&self.ctx).await;
                self.ctx.swallow_err(paused, "Error during on_pause");
                self.addr.send_source(SourceMsg::Pause).await?;
                self.addr.send_sink(SinkMsg::Pause).await?;
                self.state = State::Paused;
            }
            Msg::Pause => {
                info!("{} Ignoring Pause, not running.", self.ctx);
            }
            Msg::Resume if self.state == State::Paused => {
                info!("{} Resuming...", self.ctx);
                self.ctx.quiescence_beacon.resume();
                let resumed = self.connector.on_resume(&self.ctx).await;
                self.ctx.swallow_err(resumed, "Error during on_resume");
                self.addr.send_source(SourceMsg::Resume).await?;
                self.addr.send_sink(SinkMsg::Resume).await?;
                self.state = State::Running;
            }
            Msg::Resume => {
                info!("{} Ignoring Resume, not paused.", self.ctx);
            }
            Msg::ConnectionLost => {
                warn!("{} Connection lost.", self.ctx);
                self.change_connectivity(Connectivity::Disconnected).await;
                if self.state == State::Running {
                    self.reconnect.enqueue_retry();
                }
            }
            Msg::Reconnect if self.state == State::Running => {
                let (connectivity, _will_retry) = self
                    .reconnect
                    .attempt(self.connector.as_mut(), &self.ctx)
                    .await?;
                self.change_connectivity(connectivity).await;
            }
            Msg::Reconnect => {
                debug!("{} Ignoring Reconnect, not running.", self.ctx);
            }
            Msg::Drain(tx) => {
                info!("{} Draining...", self.ctx);
                self.state = State::Draining;
                // sources stop reading, sinks keep writing until drained
                self.ctx.quiescence_beacon.stop_reading();
                let drained = self.connector.on_drain(&self.ctx).await;
                self.ctx.swallow_err(drained, "Error during on_drain");
                let drainage = Drainage::new(&self.addr, tx);
                if drainage.done() {
                    // nothing to drain
                    drainage.report().await?;
                    self.state = State::Drained;
                } else {
                    self.addr
                        .send_source(SourceMsg::Drain(self.addr.sender.clone()))
                        .await?;
                    self.addr
                        .send_sink(SinkMsg::Drain(self.addr.sender.clone()))
                        .await?;
                    self.drainage = Some(drainage);
                }
            }
            Msg::SourceDrained => {
                debug!("{} Source drained.", self.ctx);
                if let Some(drainage) = self.drainage.as_mut() {
                    drainage.source_drained = true;
                    if drainage.done() {
                        drainage.report().await?;
                        self.state = State::Drained;
                    }
                }
            }
            Msg::SinkDrained => {
                debug!("{} Sink drained.", self.ctx);
                if let Some(drainage) = self.drainage.as_mut() {
                    drainage.sink_drained = true;
                    if drainage.done() {
                        drainage.report().await?;
                        self.state = State::Drained;
                    }
                }
            }
            Msg::Stop(tx) => {
                info!("{} Stopping...", self.ctx);
                self.state = State::Stopped;
                self.ctx.quiescence_beacon.full_stop();
                let stopped = self.connector.on_stop(&self.ctx).await;
                self.ctx.swallow_err(stopped, "Error during on_stop");
                if let Some(source) = self.addr.source.as_ref() {
                    let (stop_tx, mut stop_rx) = bounded(1);
                    if source.send(SourceMsg::Stop(stop_tx)).await.is_ok() {
                        let _ = stop_rx.recv().await;
                    }
                }
                if let Some(sink) = self.addr.sink.as_ref() {
                    let (stop_tx, mut stop_rx) = bounded(1);
                    if sink.send(SinkMsg::Stop(stop_tx)).await.is_ok() {
                        let _ = stop_rx.recv().await;
                    }
                }
                tx.send(()).await?;
                info!("{} Stopped.", self.ctx);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn change_connectivity(&mut self, connectivity: Connectivity) {
        if self.connectivity != connectivity {
            match connectivity {
                Connectivity::Connected => {
                    info!("{} Connected.", self.ctx);
                    let sent = self.addr.send_source(SourceMsg::ConnectionEstablished).await;
                    self.ctx
                        .swallow_err(sent, "Error sending ConnectionEstablished to source");
                    let sent = self.addr.send_sink(SinkMsg::ConnectionEstablished).await;
                    self.ctx
                        .swallow_err(sent, "Error sending ConnectionEstablished to sink");
                }
                Connectivity::Disconnected => {
                    let sent = self.addr.send_source(SourceMsg::ConnectionLost).await;
                    self.ctx
                        .swallow_err(sent, "Error sending ConnectionLost to source");
                    let sent = self.addr.send_sink(SinkMsg::ConnectionLost).await;
                    self.ctx
                        .swallow_err(sent, "Error sending ConnectionLost to sink");
                }
            }
        }
        self.connectivity = connectivity;
    }
}

/// Spawn a task driving a source or sink and, should it error, log it and
/// notify the connector of the lost connection.
pub(crate) fn spawn_task<C, F>(ctx: C, fut: F) -> JoinHandle<()>
where
    C: Context + Send + 'static,
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    task::spawn(async move {
        if let Err(e) = fut.await {
            error!("{ctx} Task failed: {e}");
            let notified = ctx.notifier().connection_lost().await;
            ctx.swallow_err(notified, "Error notifying connection loss");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_type_roundtrip() {
        let ct = ConnectorType::from("clickhouse");
        assert_eq!("clickhouse", ct.to_string());
        assert_eq!("clickhouse", String::from(ct));
    }

    #[test]
    fn log_error_evaluates() {
        let ok: Result<(), &str> = Ok(());
        assert!(!log_error!(ok, "should not log"));
        let err: Result<(), &str> = Err("boom");
        assert!(log_error!(err, "expected: {e}"));
    }
}
