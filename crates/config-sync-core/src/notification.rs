//! Shared long-poll loop delivering change notifications.
//!
//! One channel serves every subscribed namespace. Each poll carries the last
//! seen notification id per namespace; the server holds the request until one
//! of them moves or its hold time elapses. Namespaces subscribed while a poll
//! is in flight are picked up by the next poll.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{build_url, BackoffConfig, BackoffState, HttpClient, HttpError, HttpOutcome};
use crate::locator::{ServiceEndpoint, ServiceLocator};
use crate::rate_limit::RateLimiter;
use crate::service::SyncTelemetry;

/// Notification id sent for a namespace never notified before; the server
/// answers immediately with the current id.
pub const INITIAL_NOTIFICATION_ID: i64 = -1;

/// Per-release message ids attached to a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessages {
    #[serde(default)]
    pub details: BTreeMap<String, i64>,
}

impl NotificationMessages {
    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }

    /// Merges `other` in, keeping the highest id per key.
    pub fn merge(&mut self, other: &NotificationMessages) {
        for (key, id) in &other.details {
            self.details
                .entry(key.clone())
                .and_modify(|current| *current = (*current).max(*id))
                .or_insert(*id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub namespace_name: String,
    pub notification_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<NotificationMessages>,
}

impl Notification {
    pub fn new(namespace: impl Into<String>, notification_id: i64) -> Self {
        Self {
            namespace_name: namespace.into(),
            notification_id,
            messages: None,
        }
    }
}

/// Receiver of out-of-band refresh requests for one namespace.
///
/// Implementations must not block; the channel calls them from its poll loop.
pub trait RefreshTrigger: Send + Sync {
    fn trigger(&self, messages: Option<NotificationMessages>);
}

#[derive(Debug, Clone)]
pub struct LongPollConfig {
    pub app_id: String,
    pub cluster: String,
    pub data_center: Option<String>,
    pub client_ip: Option<String>,
    /// Client-side timeout; must exceed the server hold time.
    pub timeout: Duration,
    pub backoff: BackoffConfig,
}

struct Subscription {
    notification_id: i64,
    messages: Option<NotificationMessages>,
    trigger: Arc<dyn RefreshTrigger>,
}

pub struct NotificationChannel {
    http: HttpClient,
    locator: Arc<ServiceLocator>,
    limiter: RateLimiter,
    config: LongPollConfig,
    telemetry: Arc<dyn SyncTelemetry>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    subscribed: Notify,
}

impl fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("config", &self.config)
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

impl NotificationChannel {
    pub fn new(
        http: HttpClient,
        locator: Arc<ServiceLocator>,
        limiter: RateLimiter,
        config: LongPollConfig,
        telemetry: Arc<dyn SyncTelemetry>,
    ) -> Self {
        Self {
            http,
            locator,
            limiter,
            config,
            telemetry,
            subscriptions: Mutex::new(HashMap::new()),
            subscribed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `namespace`; a repeated subscription only swaps the trigger.
    pub fn subscribe(&self, namespace: &str, trigger: Arc<dyn RefreshTrigger>) {
        {
            let mut subscriptions = self.lock();
            match subscriptions.get_mut(namespace) {
                Some(existing) => existing.trigger = trigger,
                None => {
                    subscriptions.insert(
                        namespace.to_string(),
                        Subscription {
                            notification_id: INITIAL_NOTIFICATION_ID,
                            messages: None,
                            trigger,
                        },
                    );
                }
            }
        }
        self.subscribed.notify_one();
    }

    /// Last notification id recorded for `namespace`.
    pub fn notification_id(&self, namespace: &str) -> Option<i64> {
        self.lock().get(namespace).map(|sub| sub.notification_id)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Records `notifications` and fires the triggers of namespaces whose id
    /// strictly increased. Returns how many triggers fired.
    pub fn dispatch(&self, notifications: Vec<Notification>) -> usize {
        let mut fired = Vec::new();
        {
            let mut subscriptions = self.lock();
            for notification in notifications {
                let namespace = notification.namespace_name;
                let Some(sub) = subscriptions.get_mut(&namespace) else {
                    debug!(
                        namespace = %namespace,
                        "config-sync notification for unsubscribed namespace ignored"
                    );
                    continue;
                };
                if notification.notification_id <= sub.notification_id {
                    debug!(
                        namespace = %namespace,
                        notification_id = notification.notification_id,
                        last_seen = sub.notification_id,
                        "config-sync stale notification dropped"
                    );
                    self.telemetry
                        .on_stale_notification(&namespace, notification.notification_id);
                    continue;
                }
                sub.notification_id = notification.notification_id;
                if let Some(messages) = notification.messages {
                    sub.messages
                        .get_or_insert_with(NotificationMessages::default)
                        .merge(&messages);
                }
                self.telemetry
                    .on_notification(&namespace, notification.notification_id);
                fired.push((namespace, sub.trigger.clone(), sub.messages.clone()));
            }
        }

        let count = fired.len();
        for (namespace, trigger, messages) in fired {
            debug!(namespace = %namespace, "config-sync notification triggers refresh");
            trigger.trigger(messages);
        }
        count
    }

    fn notifications_param(&self) -> Result<Option<String>, HttpError> {
        let mut current: Vec<Notification> = self
            .lock()
            .iter()
            .map(|(namespace, sub)| Notification::new(namespace.clone(), sub.notification_id))
            .collect();
        if current.is_empty() {
            return Ok(None);
        }
        current.sort_by(|a, b| a.namespace_name.cmp(&b.namespace_name));
        Ok(Some(serde_json::to_string(&current)?))
    }

    /// Issues one long poll. `Ok(None)` means the hold time elapsed without changes.
    pub async fn poll_once(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> Result<Option<Vec<Notification>>, HttpError> {
        let Some(notifications) = self.notifications_param()? else {
            return Ok(None);
        };
        let mut url = build_url(&endpoint.base_url, &["notifications", "v2"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("appId", &self.config.app_id);
            query.append_pair("cluster", &self.config.cluster);
            query.append_pair("notifications", &notifications);
            if let Some(data_center) = &self.config.data_center {
                query.append_pair("dataCenter", data_center);
            }
            if let Some(ip) = &self.config.client_ip {
                query.append_pair("ip", ip);
            }
        }

        self.limiter.acquire().await;
        match self
            .http
            .get_json::<Vec<Notification>>(url, self.config.timeout)
            .await?
        {
            HttpOutcome::Body(list) => Ok(Some(list)),
            HttpOutcome::NotModified => Ok(None),
            HttpOutcome::NotFound => Err(HttpError::Client(404)),
        }
    }

    /// Long-poll loop; exits when `cancel` fires, abandoning any in-flight poll.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = BackoffState::new(self.config.backoff);
        let tried = HashSet::new();
        info!("config-sync notification loop started");

        loop {
            if self.lock().is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.subscribed.notified() => continue,
                }
            }

            let endpoint = tokio::select! {
                _ = cancel.cancelled() => break,
                endpoint = self.locator.pick_or_discover(&tried) => endpoint,
            };
            let Some(endpoint) = endpoint else {
                let delay = backoff.register_error();
                warn!(
                    retry_in_ms = delay.as_millis() as u64,
                    "config-sync long poll has no configuration service instance"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
                continue;
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once(&endpoint) => result,
            };

            match result {
                Ok(Some(notifications)) => {
                    backoff.register_success();
                    let fired = self.dispatch(notifications);
                    debug!(fired, "config-sync long poll returned notifications");
                }
                Ok(None) => backoff.register_success(),
                Err(err) => {
                    self.telemetry.on_long_poll_error(&err);
                    let delay = backoff.register_error();
                    warn!(
                        %err,
                        retry_in_ms = delay.as_millis() as u64,
                        failures = backoff.error_count(),
                        "config-sync long poll failed"
                    );
                    self.locator.refresh_on_failure().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        debug!("config-sync notification loop shutting down");
    }
}
