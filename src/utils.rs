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

/// Google Cloud Storage client plumbing
#[cfg(feature = "gcs")]
pub(crate) mod gcs;
/// Quiescence support for the drain/stop protocol
pub(crate) mod quiescence;
/// Reconnection facilities
pub mod reconnect;
/// The batch write retry policy
pub mod retry;
/// TLS client configuration
#[cfg(feature = "tls")]
pub(crate) mod tls;
