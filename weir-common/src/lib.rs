// Copyright 2024, The Weir Team
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

//! Weir common utility functions
#![deny(missing_docs)]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::unnecessary_unwrap,
    clippy::pedantic,
    clippy::mod_module_files
)]

/// Aliases for naming weir elements
pub mod alias;

mod errors;

/// Time related functions
pub mod time;

/// URL with defaults
pub mod url;

pub use errors::Error;

/// function that always returns true
#[must_use]
pub fn default_true() -> bool {
    true
}
/// function that always returns false
#[must_use]
pub fn default_false() -> bool {
    false
}
