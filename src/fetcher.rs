//! Issues a single upstream request with retry/backoff and returns a
//! tabular [`Page`].
//!
//! Version dependencies:
//! - reqwest = "0.11"
//! - tokio = "1.28"
//! - thiserror = "1.0"
//! - tracing = "0.1"
//! - serde_json = "1.0"

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::{instrument, warn};

use crate::page::{Page, PageSchema, SchemaError};
use crate::rate_limiter::RateLimiterRegistry;
use crate::types::ApiDescriptor;

/// A concrete request parameter — a trade date or an entity code,
/// depending on the API's cursor kind.
#[derive(Debug, Clone)]
pub enum FetchParam {
    TradeDate(i32),
    EntityCode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Fatal,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{kind:?} fetch failure for {api} after {attempts} attempt(s): {last_cause}")]
    Failed {
        api: String,
        kind: FetchErrorKind,
        attempts: u32,
        last_cause: String,
    },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Failed { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with a cap, per attempt number (1-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
        exp.min(self.max_delay)
    }
}

/// Classifies an internal transport/HTTP outcome into transient vs. fatal
/// before it reaches the retry loop.
#[derive(Debug)]
enum AttemptOutcome {
    Success(Vec<serde_json::Map<String, serde_json::Value>>),
    Transient(String),
    Fatal(String),
}

pub struct Fetcher {
    client: reqwest::Client,
    limiter: RateLimiterRegistry,
    policy: RetryPolicy,
    bearer_token: Option<String>,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, limiter: RateLimiterRegistry, policy: RetryPolicy) -> Self {
        Self { client, limiter, policy, bearer_token: None }
    }

    /// Attaches `token` as a `Bearer` credential on every outbound request
    /// (`spec.md` §6, upstream auth). Staging/development upstreams that
    /// don't require auth simply never call this.
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    /// Fetches one page for `descriptor`/`param`, retrying transient
    /// failures up to `policy.max_attempts` times with exponential
    /// backoff, acquiring one rate-limit token before each attempt.
    #[instrument(skip(self, schema), fields(api = descriptor.name))]
    pub async fn fetch(
        &self,
        descriptor: &ApiDescriptor,
        param: FetchParam,
        base_url: &str,
        schema: &PageSchema,
        request_id: &str,
    ) -> Result<Page, FetchError> {
        let mut last_cause = String::new();
        let mut last_kind = FetchErrorKind::Transient;

        for attempt in 1..=self.policy.max_attempts {
            self.limiter.acquire(descriptor.rate_bucket, 1).await;

            let outcome = tokio::time::timeout(
                self.policy.attempt_timeout,
                self.issue_request(descriptor, &param, base_url, request_id),
            )
            .await
            .unwrap_or_else(|_| AttemptOutcome::Transient("attempt deadline exceeded".into()));

            match outcome {
                AttemptOutcome::Success(rows) => {
                    return Page::from_json_rows(&rows, schema).map_err(|e: SchemaError| FetchError::Failed {
                        api: descriptor.name.to_string(),
                        kind: FetchErrorKind::Fatal,
                        attempts: attempt,
                        last_cause: e.to_string(),
                    });
                }
                AttemptOutcome::Fatal(cause) => {
                    return Err(FetchError::Failed {
                        api: descriptor.name.to_string(),
                        kind: FetchErrorKind::Fatal,
                        attempts: attempt,
                        last_cause: cause,
                    });
                }
                AttemptOutcome::Transient(cause) => {
                    last_cause = cause;
                    last_kind = FetchErrorKind::Transient;
                    if attempt < self.policy.max_attempts {
                        let delay = self.policy.delay_for_attempt(attempt);
                        warn!(
                            api = descriptor.name,
                            attempt,
                            ?delay,
                            cause = %last_cause,
                            "transient fetch failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(FetchError::Failed {
            api: descriptor.name.to_string(),
            kind: last_kind,
            attempts: self.policy.max_attempts,
            last_cause,
        })
    }

    async fn issue_request(
        &self,
        descriptor: &ApiDescriptor,
        param: &FetchParam,
        base_url: &str,
        request_id: &str,
    ) -> AttemptOutcome {
        let mut query: HashMap<&str, String> = HashMap::new();
        match param {
            FetchParam::TradeDate(d) => {
                query.insert("trade_date", d.to_string());
            }
            FetchParam::EntityCode(code) => {
                query.insert("entity_code", code.clone());
            }
        }
        query.insert("page_size", descriptor.page_size.to_string());

        let url = format!("{}/{}", base_url.trim_end_matches('/'), descriptor.name);
        let mut builder = self
            .client
            .get(&url)
            .query(&query)
            .header("X-Request-Id", request_id);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return AttemptOutcome::Transient(format!("network error: {e}"))
            }
            Err(e) => return AttemptOutcome::Transient(format!("request error: {e}")),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return AttemptOutcome::Fatal(format!("authentication failed: HTTP {status}"));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return AttemptOutcome::Transient(format!("upstream returned HTTP {status}"));
        }
        if !status.is_success() {
            return AttemptOutcome::Fatal(format!("upstream returned HTTP {status}"));
        }

        match response.json::<Vec<serde_json::Map<String, serde_json::Value>>>().await {
            Ok(rows) => AttemptOutcome::Success(rows),
            Err(e) => AttemptOutcome::Fatal(format!("malformed response body: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        // capped, not 800ms
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }
}
