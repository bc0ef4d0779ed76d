//! Single "get configuration" calls and their retry across endpoints.
//!
//! A fetch is a pure read: it never touches the in-memory snapshot or the
//! local cache. The caller decides what to commit.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::http::{build_url, BackoffState, HttpClient, HttpError, HttpOutcome};
use crate::locator::{ServiceEndpoint, ServiceLocator};
use crate::notification::NotificationMessages;
use crate::rate_limit::RateLimiter;
use crate::snapshot::{ConfigEntries, Snapshot, SourceType};

/// Outcome of a fetch the server answered meaningfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A full snapshot (its release key may still equal the previous one).
    Updated(Snapshot),
    /// The server confirms nothing changed since the supplied release key.
    NotModified,
    /// The namespace does not exist server-side.
    NotFound,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no configuration service instance is known")]
    NoEndpoint,
    #[error("fetch failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: HttpError,
    },
}

impl FetchError {
    /// Short label grouping errors of the same family.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::NoEndpoint => "no-endpoint",
            FetchError::Exhausted { last, .. } => match last {
                HttpError::Timeout(_) => "timeout",
                HttpError::Retryable(_) => "server-error",
                HttpError::Transport(_) => "transport",
                HttpError::Unauthorized(_) => "unauthorized",
                HttpError::Client(_) => "client-error",
                HttpError::Decode(_) => "decode",
                HttpError::InvalidUrl(_) => "invalid-url",
            },
        }
    }
}

/// Body of a 200 answer from the fetch endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    #[serde(default)]
    configurations: ConfigEntries,
    release_key: String,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub app_id: String,
    pub cluster: String,
    pub data_center: Option<String>,
    pub label: Option<String>,
    pub client_ip: Option<String>,
    pub timeout: Duration,
    /// Attempt ceiling for one logical fetch, across endpoints.
    pub max_attempts: u32,
    /// Keep server-supplied entry order; otherwise entries are sorted by key.
    pub property_order: bool,
}

#[derive(Debug)]
pub struct RemoteFetcher {
    http: HttpClient,
    config: FetchConfig,
    limiter: RateLimiter,
}

impl RemoteFetcher {
    pub fn new(http: HttpClient, config: FetchConfig, limiter: RateLimiter) -> Self {
        Self {
            http,
            config,
            limiter,
        }
    }

    /// Performs one conditional fetch against `endpoint`.
    pub async fn fetch(
        &self,
        namespace: &str,
        endpoint: &ServiceEndpoint,
        previous_release_key: Option<&str>,
        messages: Option<&NotificationMessages>,
    ) -> Result<FetchOutcome, HttpError> {
        let mut url = build_url(
            &endpoint.base_url,
            &["configs", &self.config.app_id, &self.config.cluster, namespace],
        )?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(release_key) = previous_release_key {
                query.append_pair("releaseKey", release_key);
            }
            if let Some(ip) = &self.config.client_ip {
                query.append_pair("ip", ip);
            }
            if let Some(data_center) = &self.config.data_center {
                query.append_pair("dataCenter", data_center);
            }
            if let Some(label) = &self.config.label {
                query.append_pair("label", label);
            }
            if let Some(messages) = messages.filter(|m| !m.is_empty()) {
                query.append_pair("messages", &serde_json::to_string(messages)?);
            }
        }

        self.limiter.acquire().await;
        match self
            .http
            .get_json::<ConfigResponse>(url, self.config.timeout)
            .await?
        {
            HttpOutcome::Body(response) => {
                let mut entries = response.configurations;
                if !self.config.property_order {
                    entries.sort_keys();
                }
                Ok(FetchOutcome::Updated(Snapshot::new(
                    namespace,
                    response.release_key,
                    entries,
                    SourceType::Remote,
                )))
            }
            HttpOutcome::NotModified => Ok(FetchOutcome::NotModified),
            HttpOutcome::NotFound => Ok(FetchOutcome::NotFound),
        }
    }

    /// Fetches with endpoint rotation.
    ///
    /// Transient errors move on to another endpoint (up to the attempt ceiling)
    /// with the delay dictated by `backoff`. Any other error, `NotFound` and
    /// `NotModified` end the cycle immediately.
    pub async fn fetch_with_rotation(
        &self,
        locator: &ServiceLocator,
        namespace: &str,
        previous_release_key: Option<&str>,
        messages: Option<&NotificationMessages>,
        backoff: &mut BackoffState,
    ) -> Result<FetchOutcome, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut tried = HashSet::new();
        let mut last_error = None;
        let mut attempts = 0;

        while attempts < max_attempts {
            let Some(endpoint) = locator.pick_or_discover(&tried).await else {
                break;
            };
            attempts += 1;
            tried.insert(endpoint.instance_id.clone());

            match self
                .fetch(namespace, &endpoint, previous_release_key, messages)
                .await
            {
                Ok(outcome) => {
                    backoff.register_success();
                    return Ok(outcome);
                }
                Err(err) => {
                    debug!(
                        namespace,
                        attempt = attempts,
                        instance = %endpoint.instance_id,
                        %err,
                        "config-sync fetch attempt failed"
                    );
                    if !err.is_transient() {
                        return Err(FetchError::Exhausted { attempts, last: err });
                    }
                    let delay = backoff.register_error();
                    last_error = Some(err);
                    locator.refresh_on_failure().await;
                    if attempts < max_attempts {
                        sleep(delay).await;
                    }
                }
            }
        }

        match last_error {
            Some(last) => Err(FetchError::Exhausted { attempts, last }),
            None => Err(FetchError::NoEndpoint),
        }
    }
}
