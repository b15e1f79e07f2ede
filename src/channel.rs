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

//! Channel plumbing for the control and data planes.

use std::sync::atomic::{AtomicUsize, Ordering};

pub use tokio::sync::mpsc::error::{SendError, TryRecvError, TrySendError};
pub use tokio::sync::mpsc::{
    channel as bounded, unbounded_channel as unbounded, Receiver, Sender, UnboundedReceiver,
    UnboundedSender,
};

/// default queue size for control plane channels
pub const DEFAULT_QSIZE: usize = 128;

static QSIZE: AtomicUsize = AtomicUsize::new(DEFAULT_QSIZE);

/// Queue size for control plane channels, overridable via `WEIR_QSIZE`
pub fn qsize() -> usize {
    QSIZE.load(Ordering::Relaxed)
}

/// Initialize the queue size from the environment, once, at process start.
pub fn init_qsize_from_env() {
    if let Some(qsize) = std::env::var("WEIR_QSIZE")
        .ok()
        .and_then(|s| s.parse().ok())
    {
        QSIZE.store(qsize, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_qsize() {
        assert_eq!(DEFAULT_QSIZE, qsize());
    }
}
