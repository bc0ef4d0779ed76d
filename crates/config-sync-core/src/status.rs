//! Per-namespace health tracking and its JSON rendering for embedders.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::service::ConfigContext;
use crate::snapshot::SourceType;

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u32,
    last_error: Option<String>,
    last_success: Option<Instant>,
}

/// Refresh health of one namespace.
#[derive(Debug, Default)]
pub struct SyncHealth {
    state: Mutex<HealthState>,
}

impl SyncHealth {
    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a refresh the server answered; returns the failure streak it ended.
    pub fn record_success(&self) -> u32 {
        let mut state = self.lock();
        let ended = state.consecutive_failures;
        state.consecutive_failures = 0;
        state.last_error = None;
        state.last_success = Some(Instant::now());
        ended
    }

    /// Records a failed refresh; returns the current failure streak.
    pub fn record_failure(&self, error: impl Into<String>) -> u32 {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.into());
        state.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn last_success_age(&self) -> Option<Duration> {
        self.lock().last_success.map(|at| at.elapsed())
    }
}

/// Point-in-time status of one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceStatus {
    pub namespace: String,
    pub release_key: Option<String>,
    pub source: SourceType,
    pub entries: usize,
    pub listeners: usize,
    /// Last notification id seen by the long-poll channel.
    pub notification_id: Option<i64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_age: Option<Duration>,
}

impl NamespaceStatus {
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            "releaseKey".into(),
            self.release_key.clone().map_or(Value::Null, Value::String),
        );
        map.insert("sourceType".into(), Value::String(self.source.to_string()));
        map.insert("entries".into(), Value::from(self.entries));
        map.insert("listeners".into(), Value::from(self.listeners));
        map.insert(
            "notificationId".into(),
            self.notification_id.map_or(Value::Null, Value::from),
        );
        map.insert(
            "consecutiveFailures".into(),
            Value::from(self.consecutive_failures),
        );
        map.insert(
            "lastError".into(),
            self.last_error.clone().map_or(Value::Null, Value::String),
        );
        map.insert(
            "lastSuccessAgeSecs".into(),
            self.last_success_age
                .map_or(Value::Null, |age| Value::from(age.as_secs())),
        );
        map
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.to_map())
    }
}

/// Renders every namespace of `context` as
/// `{"appId":..,"cluster":..,"namespaces":{"<ns>":{..}}}`.
pub fn status_json(context: &ConfigContext) -> Value {
    let namespaces: Map<String, Value> = context
        .status()
        .into_iter()
        .map(|status| (status.namespace.clone(), status.to_json()))
        .collect();
    let mut root = Map::new();
    root.insert("appId".into(), Value::String(context.config().app_id.clone()));
    root.insert(
        "cluster".into(),
        Value::String(context.config().cluster.clone()),
    );
    root.insert("namespaces".into(), Value::Object(namespaces));
    Value::Object(root)
}
