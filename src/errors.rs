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

use std::time::Duration;

use tokio::task::JoinError;
use weir_common::alias;

/// The error type for connectors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection failed
    #[error("{0} Connection failed")]
    ConnectionFailed(alias::Connector),
    /// Invalid configuration
    #[error("{0} Invalid configuration: {1}")]
    InvalidConfiguration(alias::Connector, &'static str),
    /// Invalid definition
    #[error("[{0}] Invalid definition: {1}")]
    InvalidDefinition(alias::Connector, String),
    /// Connector was already created
    #[error("{0} Connector was already created")]
    AlreadyCreated(alias::Connector),
    /// Missing configuration
    #[error("{0} Missing Configuration")]
    MissingConfiguration(alias::Connector),
    /// Unknown connector type
    #[error("{0} Unknown connector type '{1}'")]
    UnknownConnectorType(alias::Connector, String),
    /// Value error
    #[error("{0} Value error: {1}")]
    ValueError(alias::Connector, simd_json::Error),
    /// Connector implementation error
    #[error("{0} Connector implementation error: {1}")]
    ImplError(alias::Connector, anyhow::Error),
    /// Reconnect join error
    #[error("{0} reconnect join error: {1}")]
    ReconnectJoin(alias::Connector, JoinError),
    /// Creating the source half failed
    #[error("{0} Creating source failed: {1}")]
    CreateSource(alias::Connector, anyhow::Error),
    /// Creating the sink half failed
    #[error("{0} Creating sink failed: {1}")]
    CreateSink(alias::Connector, anyhow::Error),
    /// Channel empty
    #[error("{0} Channel empty")]
    ChannelEmpty(alias::Connector),
    /// Controlplane reply error
    #[error("{0} Controlplane reply error")]
    ControlplaneReply(alias::Connector),
    /// Connection lost notification failed
    #[error("{0} Connection lost notification failed")]
    ConnectionLostNotifier(alias::Connector),
    /// Write retries exhausted
    #[error("{0} Failed to write batch after {1} attempts: retries exhausted: {2}")]
    WriteExhausted(alias::Connector, u32, anyhow::Error),
}

impl Error {
    /// the alias of the connector
    #[must_use]
    pub fn alias(&self) -> &alias::Connector {
        match self {
            Self::ConnectionFailed(alias)
            | Self::InvalidConfiguration(alias, _)
            | Self::InvalidDefinition(alias, _)
            | Self::AlreadyCreated(alias)
            | Self::MissingConfiguration(alias)
            | Self::UnknownConnectorType(alias, _)
            | Self::ValueError(alias, _)
            | Self::ImplError(alias, _)
            | Self::ReconnectJoin(alias, _)
            | Self::CreateSource(alias, _)
            | Self::CreateSink(alias, _)
            | Self::ChannelEmpty(alias)
            | Self::ControlplaneReply(alias)
            | Self::ConnectionLostNotifier(alias)
            | Self::WriteExhausted(alias, _, _) => alias,
        }
    }
}

/// Generic errors for connector implementations
#[derive(Debug, thiserror::Error)]
pub enum GenericImplementationError {
    /// Client not available
    #[error("{0} client not available")]
    ClientNotAvailable(&'static str),
    /// A channel end was requested twice
    #[error("producer not available, already connected")]
    AlreadyConnected,
    /// Timeout expired
    #[error("Timeout reached: {0:?}")]
    Timeout(Duration),
    /// Channel empty
    #[error("Channel empty")]
    ChannelEmpty,
}

/// Utility function to create an invalid definition error
pub fn error_connector_def<E: ToString + ?Sized>(c: &alias::Connector, e: &E) -> Error {
    Error::InvalidDefinition(c.clone(), e.to_string())
}

#[allow(dead_code)]
pub(crate) fn error_impl_def<E: Into<anyhow::Error> + std::error::Error + Send + Sync>(
    c: &alias::Connector,
    e: E,
) -> Error {
    Error::ImplError(c.clone(), e.into())
}
