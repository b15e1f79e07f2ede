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

//! Google Cloud Storage JSON API plumbing shared by the bucket source and
//! the object writer sink.

use std::{sync::Arc, time::Duration};

#[cfg(not(test))]
use gouth::Token;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::utils::retry::FailureKind;

/// default API endpoint for object metadata and downloads
pub(crate) const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com/storage/v1";
/// default API endpoint for media uploads
pub(crate) const DEFAULT_UPLOAD_ENDPOINT: &str = "https://storage.googleapis.com/upload/storage/v1";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the storage API, typed so sinks can classify them without
/// string matching.
#[derive(Debug, thiserror::Error)]
pub enum GcsError {
    /// non-success response from the storage API
    #[error("google cloud storage replied {status} while {context}: {body}")]
    Status {
        /// http status of the reply
        status: StatusCode,
        /// what we were doing
        context: String,
        /// response body, for the logs
        body: String,
    },
    /// transport-level failure
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    /// the response body was not the JSON we expected
    #[error("invalid response while {0}: {1}")]
    InvalidResponse(String, simd_json::Error),
    /// token acquisition failed
    #[error("google authentication failed: {0}")]
    Token(String),
    /// a configured endpoint did not parse
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

impl GcsError {
    /// map onto the retry policy's failure taxonomy
    ///
    /// request timeouts (408), rate limiting (429) and server errors signal
    /// overload, transport failures are connection-level, everything else
    /// (auth, missing bucket, bad request) will not heal on its own
    pub(crate) fn kind(&self) -> FailureKind {
        match self {
            Self::Status { status, .. }
                if *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error() =>
            {
                FailureKind::ServerOverload
            }
            Self::Transport(e) if e.is_timeout() => FailureKind::ServerOverload,
            Self::Transport(e) if e.is_connect() || e.is_request() || e.is_body() => {
                FailureKind::TransientConnection
            }
            Self::Status { .. }
            | Self::Transport(_)
            | Self::InvalidResponse(..)
            | Self::Token(_)
            | Self::Endpoint(_) => FailureKind::Permanent,
        }
    }
}

/// Produces `Authorization` header values from the ambient service account
/// (`GOOGLE_APPLICATION_CREDENTIALS`), refreshing them as they expire.
pub(crate) struct TokenProvider {
    #[cfg(not(test))]
    token: Token,
}

impl TokenProvider {
    pub(crate) fn new() -> Result<Self, GcsError> {
        Ok(Self {
            #[cfg(not(test))]
            token: Token::new().map_err(|e| GcsError::Token(e.to_string()))?,
        })
    }

    #[cfg(not(test))]
    pub(crate) fn header_value(&self) -> Result<Arc<String>, GcsError> {
        self.token
            .header_value()
            .map_err(|e| GcsError::Token(e.to_string()))
    }

    #[cfg(test)]
    #[allow(clippy::unnecessary_wraps)]
    pub(crate) fn header_value(&self) -> Result<Arc<String>, GcsError> {
        Ok(Arc::new("Bearer <test-token>".to_string()))
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenProvider")
    }
}

/// metadata of one stored object, as returned by the list API
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectMeta {
    pub(crate) name: String,
    /// object size in bytes, the API serializes it as a string
    pub(crate) size: Option<String>,
    pub(crate) updated: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    items: Option<Vec<ObjectMeta>>,
    next_page_token: Option<String>,
}

/// one page of a bucket listing
#[derive(Debug)]
pub(crate) struct ObjectPage {
    pub(crate) objects: Vec<ObjectMeta>,
    pub(crate) next_page_token: Option<String>,
}

/// Thin client for the storage JSON API.
#[derive(Debug)]
pub(crate) struct ObjectClient {
    client: reqwest::Client,
    endpoint: url::Url,
    upload_endpoint: url::Url,
    token: TokenProvider,
}

impl ObjectClient {
    pub(crate) fn new(endpoint: &str, upload_endpoint: &str) -> Result<Self, GcsError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: parse_endpoint(endpoint)?,
            upload_endpoint: parse_endpoint(upload_endpoint)?,
            token: TokenProvider::new()?,
        })
    }

    /// check the bucket is there and we may see it
    pub(crate) async fn bucket_exists(&self, bucket: &str) -> Result<bool, GcsError> {
        let url = bucket_url(&self.endpoint, bucket);
        let response = self.get(url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        expect_success(response, format!("checking bucket {bucket}")).await?;
        Ok(true)
    }

    /// fetch one page of object metadata, filtered by `prefix`
    pub(crate) async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ObjectPage, GcsError> {
        let mut url = bucket_url(&self.endpoint, bucket);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("o");
        }
        if let Some(prefix) = prefix {
            url.query_pairs_mut().append_pair("prefix", prefix);
        }
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("pageToken", token);
        }
        let context = format!("listing bucket {bucket}");
        let response = self.get(url).await?;
        let response = expect_success(response, context.clone()).await?;
        let parsed: ListResponse = decode(response, context).await?;
        Ok(ObjectPage {
            objects: parsed.items.unwrap_or_default(),
            next_page_token: parsed.next_page_token,
        })
    }

    /// fetch the content of one object
    pub(crate) async fn download(&self, bucket: &str, object: &str) -> Result<Vec<u8>, GcsError> {
        let mut url = bucket_url(&self.endpoint, bucket);
        if let Ok(mut segments) = url.path_segments_mut() {
            // push percent-encodes the object name, slashes included
            segments.push("o").push(object);
        }
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self.get(url).await?;
        let response = expect_success(response, format!("downloading {bucket}/{object}")).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// store one object with a single media upload
    pub(crate) async fn upload_object(
        &self,
        bucket: &str,
        object: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), GcsError> {
        let mut url = bucket_url(&self.upload_endpoint, bucket);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("o");
        }
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", object);
        let token = self.token.header_value()?;
        let response = self
            .client
            .post(url)
            .header("Authorization", token.as_str())
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await?;
        expect_success(response, format!("uploading {bucket}/{object}")).await?;
        Ok(())
    }

    async fn get(&self, url: url::Url) -> Result<reqwest::Response, GcsError> {
        let token = self.token.header_value()?;
        Ok(self
            .client
            .get(url)
            .header("Authorization", token.as_str())
            .send()
            .await?)
    }
}

fn parse_endpoint(endpoint: &str) -> Result<url::Url, GcsError> {
    Ok(url::Url::parse(endpoint)?)
}

fn bucket_url(endpoint: &url::Url, bucket: &str) -> url::Url {
    let mut url = endpoint.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.push("b").push(bucket);
    }
    url
}

async fn expect_success(
    response: reqwest::Response,
    context: String,
) -> Result<reqwest::Response, GcsError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());
        Err(GcsError::Status {
            status,
            context,
            body,
        })
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    context: String,
) -> Result<T, GcsError> {
    let mut bytes = response.bytes().await?.to_vec();
    simd_json::serde::from_slice(&mut bytes).map_err(|e| GcsError::InvalidResponse(context, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: StatusCode) -> GcsError {
        GcsError::Status {
            status,
            context: "testing".to_string(),
            body: String::new(),
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS).kind(),
            FailureKind::ServerOverload
        );
        assert_eq!(
            status_error(StatusCode::REQUEST_TIMEOUT).kind(),
            FailureKind::ServerOverload
        );
        assert_eq!(
            status_error(StatusCode::SERVICE_UNAVAILABLE).kind(),
            FailureKind::ServerOverload
        );
        assert_eq!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR).kind(),
            FailureKind::ServerOverload
        );
        assert_eq!(
            status_error(StatusCode::FORBIDDEN).kind(),
            FailureKind::Permanent
        );
        assert_eq!(
            status_error(StatusCode::NOT_FOUND).kind(),
            FailureKind::Permanent
        );
    }

    #[test]
    fn object_urls() -> anyhow::Result<()> {
        let endpoint = parse_endpoint(DEFAULT_ENDPOINT)?;
        let mut url = bucket_url(&endpoint, "sensor-archive");
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("o").push("solar/2024/batch.json");
        }
        url.query_pairs_mut().append_pair("alt", "media");
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/sensor-archive/o/solar%2F2024%2Fbatch.json?alt=media"
        );
        Ok(())
    }

    #[test]
    fn list_response_decoding() -> anyhow::Result<()> {
        let mut raw = br#"{
            "kind": "storage#objects",
            "nextPageToken": "CaBs",
            "items": [
                {"name": "solar/a.json", "size": "123", "updated": "2024-05-01T12:00:00Z"},
                {"name": "solar/b.json"}
            ]
        }"#
        .to_vec();
        let parsed: ListResponse = simd_json::serde::from_slice(&mut raw)?;
        let items = parsed.items.unwrap_or_default();
        assert_eq!(2, items.len());
        assert_eq!("solar/a.json", items[0].name);
        assert_eq!(Some("123".to_string()), items[0].size);
        assert_eq!(Some("CaBs".to_string()), parsed.next_page_token);
        Ok(())
    }

    #[test]
    fn empty_list_response() -> anyhow::Result<()> {
        let mut raw = br#"{"kind": "storage#objects"}"#.to_vec();
        let parsed: ListResponse = simd_json::serde::from_slice(&mut raw)?;
        assert!(parsed.items.is_none());
        assert!(parsed.next_page_token.is_none());
        Ok(())
    }
}
