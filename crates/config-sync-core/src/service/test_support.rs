//! Shared fixtures for service tests: a scripted backend, a throwaway cache
//! directory and listeners that record what they saw.

#![cfg(test)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use httptest::Server;
use serde_json::{json, Value};
use tempfile::TempDir;

use super::view::ConfigChangeListener;
use super::{ConfigContext, SyncConfig};
use crate::http::BackoffConfig;
use crate::snapshot::{ChangeSet, Snapshot, SourceType};
use crate::store::LocalCacheStore;

pub(crate) const APP_ID: &str = "demo";
pub(crate) const CLUSTER: &str = "default";

/// Millisecond-scale backoff so retry paths finish quickly.
pub(crate) fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        factor: 2.0,
        recovery_interval: 0,
    }
}

/// Config pointing straight at `server` (no discovery) with a cache under `cache`.
pub(crate) fn test_config(server: &Server, cache: &TempDir) -> SyncConfig {
    SyncConfig {
        config_service_urls: vec![server.url_str("")],
        cache_dir: cache.path().to_path_buf(),
        fetch_timeout: Duration::from_millis(500),
        long_poll_hold: Duration::from_secs(1),
        long_poll_timeout: Duration::from_secs(2),
        fetch_backoff: fast_backoff(),
        long_poll_backoff: fast_backoff(),
        fetch_qps: 0.0,
        long_poll_qps: 0.0,
        shutdown_grace: Duration::from_secs(1),
        ..SyncConfig::new(APP_ID)
    }
}

pub(crate) fn test_context(config: SyncConfig) -> ConfigContext {
    ConfigContext::new(config).expect("context")
}

pub(crate) fn config_path(namespace: &str) -> String {
    format!("/configs/{APP_ID}/{CLUSTER}/{namespace}")
}

/// Body of a successful fetch.
pub(crate) fn config_body(namespace: &str, release_key: &str, pairs: &[(&str, &str)]) -> Value {
    let configurations: serde_json::Map<String, Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    json!({
        "appId": APP_ID,
        "cluster": CLUSTER,
        "namespaceName": namespace,
        "configurations": configurations,
        "releaseKey": release_key,
    })
}

/// Writes a cache file as a previous run would have left it.
pub(crate) fn seed_cache(cache: &TempDir, namespace: &str, release_key: &str, pairs: &[(&str, &str)]) {
    let store = LocalCacheStore::open(cache.path(), APP_ID, CLUSTER).expect("store");
    let snapshot = Snapshot::new(
        namespace,
        release_key,
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        SourceType::Remote,
    );
    store.save(namespace, &snapshot).expect("seed cache");
}

pub(crate) fn cached(cache: &TempDir, namespace: &str) -> Option<Snapshot> {
    LocalCacheStore::open(cache.path(), APP_ID, CLUSTER)
        .expect("store")
        .load(namespace)
}

/// Listener recording every change set it receives.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<ChangeSet>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<ChangeSet> {
        self.events.lock().expect("events").clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.events.lock().expect("events").len()
    }
}

impl ConfigChangeListener for RecordingListener {
    fn on_change(&self, changes: &ChangeSet) {
        self.events.lock().expect("events").push(changes.clone());
    }
}

pub(crate) fn recording_listener() -> Arc<RecordingListener> {
    Arc::new(RecordingListener::default())
}

/// Polls `condition` every 10ms until it holds or `limit` elapses.
pub(crate) async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
