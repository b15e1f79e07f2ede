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

//! The runtime: owns the running flows and the kill switch that shuts
//! them down.

use std::time::Duration;

use tokio::{task, time::sleep};

use crate::{
    channel::{bounded, Receiver, Sender},
    config::StopAfter,
    flow::{Flow, FlowConfig},
};

/// How to shut down
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ShutdownMode {
    /// stop reading, drain buffered batches, then stop
    Graceful,
    /// everything stops immediately, batches in flight are lost
    Forceful,
}

/// Messages the runtime understands
#[derive(Debug, PartialEq, Eq)]
pub enum Msg {
    /// shut the runtime down
    Stop(ShutdownMode),
}

/// Handle for requesting a runtime shutdown from anywhere: signal handlers,
/// sources that reached their `StopAfter` limit, tests.
#[derive(Debug, Clone)]
pub struct KillSwitch(Sender<Msg>);

impl KillSwitch {
    /// Request a shutdown.
    ///
    /// # Errors
    /// if the runtime is already gone
    pub async fn stop(&self, mode: ShutdownMode) -> anyhow::Result<()> {
        self.0.send(Msg::Stop(mode)).await?;
        Ok(())
    }

    /// A kill switch with nothing on the other end. Any `stop` on it
    /// errors, callers are expected to swallow that.
    #[must_use]
    pub fn dummy() -> Self {
        Self(bounded(1).0)
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> (Self, Receiver<Msg>) {
        let (tx, rx) = bounded(1);
        (Self(tx), rx)
    }
}

/// Owns the flows of this process and runs them until shutdown.
pub struct Runtime {
    flows: Vec<Flow>,
    rx: Receiver<Msg>,
    kill_switch: KillSwitch,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// constructor
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(crate::channel::qsize());
        Self {
            flows: Vec::new(),
            rx,
            kill_switch: KillSwitch(tx),
        }
    }

    /// the kill switch of this runtime
    #[must_use]
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill_switch.clone()
    }

    /// Start a flow and take ownership of it. A `stop_after.seconds` limit
    /// arms a timer that pulls the kill switch gracefully.
    ///
    /// # Errors
    /// if the flow fails to start
    pub async fn launch_flow(&mut self, config: FlowConfig) -> anyhow::Result<()> {
        let stop_after = config.stop_after;
        let flow = Flow::start(config, self.kill_switch.clone()).await?;
        info!("[Flow::{}] Launched.", flow.alias().as_str());
        self.arm_stop_after(stop_after);
        self.flows.push(flow);
        Ok(())
    }

    fn arm_stop_after(&self, stop_after: StopAfter) {
        if let Some(seconds) = stop_after.seconds {
            let kill_switch = self.kill_switch.clone();
            task::spawn(async move {
                sleep(Duration::from_secs(seconds)).await;
                info!("Stop-after timer of {seconds}s fired, shutting down.");
                if let Err(e) = kill_switch.stop(ShutdownMode::Graceful).await {
                    error!("Error stopping the runtime: {e}");
                }
            });
        }
    }

    /// Block until a shutdown is requested, then execute it. A graceful
    /// shutdown drains every flow first; a forceful request arriving while
    /// draining cuts the drain short.
    ///
    /// # Errors
    /// if stopping a flow failed
    pub async fn run_until_shutdown(mut self) -> anyhow::Result<()> {
        let mode = loop {
            match self.rx.recv().await {
                Some(Msg::Stop(mode)) => break mode,
                None => break ShutdownMode::Forceful,
            }
        };
        if mode == ShutdownMode::Graceful {
            info!("Shutting down gracefully...");
            let flows = &self.flows;
            let drain = async {
                for flow in flows {
                    if let Err(e) = flow.drain().await {
                        error!("[Flow::{}] Error draining: {e}", flow.alias().as_str());
                    }
                }
            };
            tokio::select! {
                () = drain => {}
                msg = self.rx.recv() => {
                    if matches!(msg, Some(Msg::Stop(ShutdownMode::Forceful))) {
                        warn!("Forceful shutdown requested, abandoning the drain.");
                    }
                }
            }
        } else {
            info!("Shutting down forcefully...");
        }
        for flow in &self.flows {
            flow.stop().await?;
        }
        info!("Shutdown complete.");
        Ok(())
    }
}
