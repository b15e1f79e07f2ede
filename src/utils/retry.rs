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

//! The batch write retry policy.
//!
//! Implemented exactly once and parameterized over every sink through the
//! [`BatchSink`] trait: attempt the write, classify failures, and decide
//! between retry-with-delay, backpressure, and fatal propagation.
//!
//! Delivery is at-least-once. Duplicate writes on retry are possible and not
//! deduplicated; ordering within a batch follows the write function.

use std::time::Duration;

use serde::Deserialize;

use crate::{
    errors::Error,
    record::Batch,
    sink::{BatchSink, SinkContext},
    Context,
};

/// Configuration of the batch write retry policy
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// total write attempts for transient errors
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// first retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// how the delay grows between attempts
    #[serde(default)]
    pub backoff: Backoff,
    /// cap applied to the computed delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// `retry_after` carried by the backpressure verdict, in milliseconds
    #[serde(default = "default_backpressure_delay_ms")]
    pub backpressure_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    3_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backpressure_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff: Backoff::default(),
            max_delay_ms: default_max_delay_ms(),
            backpressure_delay_ms: default_backpressure_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// the delay to sleep before the retry following the given 0-based
    /// attempt index, clamped to `max_delay_ms`
    #[must_use]
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::None => self.base_delay_ms,
            Backoff::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(attempt_index) + 1),
            Backoff::Exponential => self
                .base_delay_ms
                .saturating_mul(2_u64.saturating_pow(attempt_index)),
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// the delay carried by a backpressure verdict
    #[must_use]
    pub fn backpressure_delay(&self) -> Duration {
        Duration::from_millis(self.backpressure_delay_ms)
    }
}

/// Growth mode for the retry delay
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// every delay is `base_delay_ms`
    #[default]
    None,
    /// `base_delay_ms * (attempt_index + 1)`
    Linear,
    /// `base_delay_ms * 2^attempt_index`
    Exponential,
}

impl std::str::FromStr for Backoff {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(anyhow::anyhow!("invalid backoff mode: {other}")),
        }
    }
}

/// The three-way failure classification driving the retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// network/connection-level failure, recovered by local retry with
    /// backoff and opportunistic reconnection
    TransientConnection,
    /// rate limiting or resource exhaustion signaled by the external store,
    /// recovered by delegating redelivery via a backpressure verdict
    ServerOverload,
    /// not recoverable, surfaced immediately
    Permanent,
}

// Overload markers are checked first: a "connection timed out" counts as
// overload, not as a plain connection failure.
const OVERLOAD_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline",
    "busy",
    "rate limit",
    "quota",
    "too many parts",
    "memory limit",
    "too many connections",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "connection",
    "network",
    "broken pipe",
    "reset by peer",
    "refused",
    "eof",
];

/// Classify an error chain by matching lowercase substrings against the
/// marker tables. Sinks refine this with their client's native error
/// taxonomy before falling back here.
#[must_use]
pub fn classify(error: &anyhow::Error) -> FailureKind {
    for cause in error.chain() {
        let msg = cause.to_string().to_lowercase();
        if OVERLOAD_MARKERS.iter().any(|m| msg.contains(m)) {
            return FailureKind::ServerOverload;
        }
        if TRANSIENT_MARKERS.iter().any(|m| msg.contains(m)) {
            return FailureKind::TransientConnection;
        }
    }
    FailureKind::Permanent
}

/// Verdict of one [`deliver`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// the batch was written, records count as delivered
    Delivered,
    /// the store is overloaded: pause and redeliver this same batch after
    /// `retry_after`. The caller owns rescheduling; no local retry happened.
    Backpressure {
        /// how long to wait before redelivering
        retry_after: Duration,
    },
}

/// Drive one batch through the retry policy.
///
/// An empty batch is a trivial success: the write is never attempted.
/// Transient failures are retried up to `max_attempts` with the configured
/// backoff, reconnecting opportunistically between attempts. Overload
/// failures return a [`Delivery::Backpressure`] verdict without sleeping or
/// consuming attempts. Permanent failures propagate unchanged.
///
/// # Errors
/// [`Error::WriteExhausted`] once transient retries are used up, or the
/// sink's own error for permanent failures
pub async fn deliver<S>(
    sink: &mut S,
    batch: &Batch,
    config: &RetryConfig,
    ctx: &SinkContext,
) -> anyhow::Result<Delivery>
where
    S: BatchSink + ?Sized,
{
    if batch.is_empty() {
        debug!("{ctx} Empty batch, skipping write.");
        return Ok(Delivery::Delivered);
    }
    let mut attempts_remaining = config.max_attempts;
    let mut attempt_index: u32 = 0;
    loop {
        let error = match sink.write_batch(batch, ctx).await {
            Ok(()) => return Ok(Delivery::Delivered),
            Err(e) => e,
        };
        match sink.classify(&error) {
            FailureKind::ServerOverload => {
                let retry_after = config.backpressure_delay();
                warn!(
                    "{ctx} Store overloaded on batch of {} (pipe {}, offsets {:?}..{:?}), requesting redelivery in {retry_after:?}: {error}",
                    batch.len(),
                    batch.pipe,
                    batch.first_offset(),
                    batch.last_offset(),
                );
                return Ok(Delivery::Backpressure { retry_after });
            }
            FailureKind::Permanent => {
                error!(
                    "{ctx} Permanent failure writing batch of {} (pipe {}): {error}",
                    batch.len(),
                    batch.pipe,
                );
                return Err(error);
            }
            FailureKind::TransientConnection => {
                attempts_remaining -= 1;
                if attempts_remaining == 0 {
                    return Err(Error::WriteExhausted(
                        ctx.alias().clone(),
                        config.max_attempts,
                        error,
                    )
                    .into());
                }
                let delay = config.delay_for(attempt_index);
                warn!(
                    "{ctx} Transient failure on attempt {} of {} writing batch of {}, retrying in {delay:?}: {error}",
                    attempt_index + 1,
                    config.max_attempts,
                    batch.len(),
                );
                tokio::time::sleep(delay).await;
                // reconnection is opportunistic, the next write attempt decides
                match sink.reconnect(ctx).await {
                    Ok(true) => {}
                    Ok(false) => info!("{ctx} Not reconnected yet, retrying the write anyway."),
                    Err(e) => warn!("{ctx} Reconnect before retry failed: {e}"),
                }
                attempt_index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use anyhow::anyhow;
    use std::time::Instant;
    use test_case::test_case;

    #[test_case("connection reset", FailureKind::TransientConnection; "connection")]
    #[test_case("Network is unreachable", FailureKind::TransientConnection; "network")]
    #[test_case("broken pipe while writing", FailureKind::TransientConnection; "broken pipe")]
    #[test_case("reset by peer", FailureKind::TransientConnection; "reset by peer")]
    #[test_case("connect refused", FailureKind::TransientConnection; "refused")]
    #[test_case("unexpected EOF", FailureKind::TransientConnection; "eof")]
    #[test_case("operation timeout", FailureKind::ServerOverload; "timeout")]
    #[test_case("request timed out", FailureKind::ServerOverload; "timed out")]
    #[test_case("deadline exceeded", FailureKind::ServerOverload; "deadline")]
    #[test_case("server busy", FailureKind::ServerOverload; "busy")]
    #[test_case("Rate Limit Exceeded", FailureKind::ServerOverload; "rate limit")]
    #[test_case("quota exhausted", FailureKind::ServerOverload; "quota")]
    #[test_case("DB::Exception: too many parts", FailureKind::ServerOverload; "too many parts")]
    #[test_case("Memory limit (total) exceeded", FailureKind::ServerOverload; "memory limit")]
    #[test_case("too many connections", FailureKind::ServerOverload; "too many connections")]
    #[test_case("syntax error at or near", FailureKind::Permanent; "unknown text")]
    #[test_case("password authentication failed", FailureKind::Permanent; "auth")]
    fn classification(msg: &str, expected: FailureKind) {
        assert_eq!(classify(&anyhow!("{msg}")), expected);
    }

    #[test]
    fn classification_walks_the_chain() {
        let root = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let wrapped = anyhow::Error::from(root).context("insert into solar_data failed");
        assert_eq!(classify(&wrapped), FailureKind::TransientConnection);
    }

    #[test]
    fn overload_wins_over_transient() {
        assert_eq!(
            classify(&anyhow!("connection timed out")),
            FailureKind::ServerOverload
        );
    }

    #[test]
    fn backoff_schedules() {
        let config = RetryConfig {
            base_delay_ms: 3_000,
            max_delay_ms: 60_000,
            ..Default::default()
        };
        let by = |backoff, i| RetryConfig { backoff, ..config }.delay_for(i);
        assert_eq!(by(Backoff::None, 0), Duration::from_secs(3));
        assert_eq!(by(Backoff::None, 5), Duration::from_secs(3));
        assert_eq!(by(Backoff::Linear, 0), Duration::from_secs(3));
        assert_eq!(by(Backoff::Linear, 2), Duration::from_secs(9));
        assert_eq!(by(Backoff::Exponential, 0), Duration::from_secs(3));
        assert_eq!(by(Backoff::Exponential, 1), Duration::from_secs(6));
        assert_eq!(by(Backoff::Exponential, 4), Duration::from_secs(48));
        // the cap holds for every mode
        assert_eq!(by(Backoff::Exponential, 10), Duration::from_secs(60));
        assert_eq!(by(Backoff::Linear, 1000), Duration::from_secs(60));
    }

    /// a scripted sink: one entry per expected write call, `None` is success
    struct FakeSink {
        script: Vec<Option<&'static str>>,
        writes: usize,
        reconnects: usize,
    }

    impl FakeSink {
        fn scripted(script: Vec<Option<&'static str>>) -> Self {
            Self {
                script,
                writes: 0,
                reconnects: 0,
            }
        }
    }

    #[async_trait::async_trait]
    impl BatchSink for FakeSink {
        async fn connect(
            &mut self,
            _ctx: &SinkContext,
            _attempt: &crate::utils::reconnect::Attempt,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn write_batch(&mut self, _batch: &Batch, _ctx: &SinkContext) -> anyhow::Result<()> {
            let step = self.script.get(self.writes).copied().flatten();
            self.writes += 1;
            match step {
                None => Ok(()),
                Some(msg) => Err(anyhow!("{msg}")),
            }
        }

        async fn reconnect(&mut self, _ctx: &SinkContext) -> anyhow::Result<bool> {
            self.reconnects += 1;
            Ok(true)
        }
    }

    fn batch(n: usize) -> Batch {
        Batch {
            pipe: "data".to_string(),
            records: (0..n as u64)
                .map(|offset| Record {
                    payload: simd_json::json!({"n": offset}),
                    key: None,
                    offset,
                    stream: 0,
                    ingest_ns: 0,
                })
                .collect(),
        }
    }

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 30,
            backoff: Backoff::Exponential,
            max_delay_ms: 60_000,
            backpressure_delay_ms: 120,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn success_short_circuits() -> anyhow::Result<()> {
        let ctx = SinkContext::for_test();
        let mut sink = FakeSink::scripted(vec![None]);
        let start = Instant::now();
        let verdict = deliver(&mut sink, &batch(2), &config(), &ctx).await?;
        assert_eq!(verdict, Delivery::Delivered);
        assert_eq!(sink.writes, 1);
        assert_eq!(sink.reconnects, 0);
        assert!(start.elapsed() < Duration::from_millis(25));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_exhausts_after_max_attempts() {
        let ctx = SinkContext::for_test();
        // always refused: 3 calls, sleeps of 30ms then 60ms, then exhausted
        let mut sink = FakeSink::scripted(vec![
            Some("connection refused"),
            Some("connection refused"),
            Some("connection refused"),
        ]);
        let start = Instant::now();
        let err = deliver(&mut sink, &batch(1), &config(), &ctx)
            .await
            .expect_err("retries must exhaust");
        assert_eq!(sink.writes, 3);
        assert_eq!(sink.reconnects, 2);
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert!(start.elapsed() < Duration::from_millis(600));
        let err = err.downcast::<Error>().expect("typed error");
        assert!(matches!(err, Error::WriteExhausted(_, 3, _)));
        assert!(err.to_string().contains("retries exhausted"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overload_short_circuits_to_backpressure() -> anyhow::Result<()> {
        let ctx = SinkContext::for_test();
        let mut sink = FakeSink::scripted(vec![Some("too many parts")]);
        let start = Instant::now();
        let verdict = deliver(&mut sink, &batch(4), &config(), &ctx).await?;
        assert_eq!(
            verdict,
            Delivery::Backpressure {
                retry_after: Duration::from_millis(120)
            }
        );
        // no local sleep, no second write, no reconnect
        assert_eq!(sink.writes, 1);
        assert_eq!(sink.reconnects, 0);
        assert!(start.elapsed() < Duration::from_millis(25));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_propagates_immediately() {
        let ctx = SinkContext::for_test();
        let mut sink = FakeSink::scripted(vec![Some("syntax error at or near")]);
        let start = Instant::now();
        let err = deliver(&mut sink, &batch(1), &config(), &ctx)
            .await
            .expect_err("permanent error");
        assert_eq!(sink.writes, 1);
        assert_eq!(sink.reconnects, 0);
        assert!(start.elapsed() < Duration::from_millis(25));
        assert_eq!(err.to_string(), "syntax error at or near");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_batch_is_a_noop_success() -> anyhow::Result<()> {
        let ctx = SinkContext::for_test();
        let mut sink = FakeSink::scripted(vec![]);
        let verdict = deliver(&mut sink, &batch(0), &config(), &ctx).await?;
        assert_eq!(verdict, Delivery::Delivered);
        assert_eq!(sink.writes, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recovery_mid_retry() -> anyhow::Result<()> {
        let ctx = SinkContext::for_test();
        let mut sink = FakeSink::scripted(vec![Some("connection refused"), None]);
        let start = Instant::now();
        let verdict = deliver(&mut sink, &batch(1), &config(), &ctx).await?;
        assert_eq!(verdict, Delivery::Delivered);
        assert_eq!(sink.writes, 2);
        assert_eq!(sink.reconnects, 1);
        // exactly one sleep of the base delay
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(start.elapsed() < Duration::from_millis(300));
        Ok(())
    }
}
