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

//! Runs one flow, assembled from the process environment, until shutdown.
//!
//! The first Ctrl-C drains the flow and exits cleanly, a second one cuts
//! the drain short.

#[macro_use]
extern crate log;

use weir_runtime::{
    channel,
    flow::FlowConfig,
    system::{Runtime, ShutdownMode},
};

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    channel::init_qsize_from_env();
    let config = FlowConfig::from_env()?;

    let mut runtime = Runtime::new();
    let kill_switch = runtime.kill_switch();
    runtime.launch_flow(config).await?;

    tokio::task::spawn(async move {
        let mut mode = ShutdownMode::Graceful;
        while tokio::signal::ctrl_c().await.is_ok() {
            match mode {
                ShutdownMode::Graceful => info!("Interrupt received, draining. Hit Ctrl-C again to cut the drain short."),
                ShutdownMode::Forceful => info!("Second interrupt, shutting down now."),
            }
            if kill_switch.stop(mode).await.is_err() {
                // the runtime is already gone
                break;
            }
            mode = ShutdownMode::Forceful;
        }
    });

    runtime.run_until_shutdown().await
}
