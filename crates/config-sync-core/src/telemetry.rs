//! Telemetry helpers for configuration synchronisation.
//!
//! Drop-in implementations of [`SyncTelemetry`]: atomic counters callers can
//! export to their own metric backend, and a composite that fans events out
//! to several observers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fetcher::FetchError;
use crate::http::HttpError;
use crate::service::SyncTelemetry;

/// Event counters shared between a [`CountingTelemetry`] and its readers.
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    refresh_success: AtomicU64,
    refresh_changed_keys: AtomicU64,
    refresh_error: AtomicU64,
    not_found: AtomicU64,
    local_fallback: AtomicU64,
    fallback_expired: AtomicU64,
    notifications: AtomicU64,
    stale_notifications: AtomicU64,
    long_poll_error: AtomicU64,
    listener_panics: AtomicU64,
}

impl TelemetryCounters {
    /// Reads every counter; values are individually, not jointly, consistent.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            refresh_success: self.refresh_success.load(Ordering::Relaxed),
            refresh_changed_keys: self.refresh_changed_keys.load(Ordering::Relaxed),
            refresh_error: self.refresh_error.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            local_fallback: self.local_fallback.load(Ordering::Relaxed),
            fallback_expired: self.fallback_expired.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            stale_notifications: self.stale_notifications.load(Ordering::Relaxed),
            long_poll_error: self.long_poll_error.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
        }
    }
}

/// Copied-out counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Refreshes that reached the server.
    pub refresh_success: u64,
    /// Total keys changed across those refreshes.
    pub refresh_changed_keys: u64,
    /// Refresh cycles that exhausted their attempts.
    pub refresh_error: u64,
    pub not_found: u64,
    /// Namespaces that started from their on-disk cache.
    pub local_fallback: u64,
    pub fallback_expired: u64,
    /// Notifications that advanced a namespace's id.
    pub notifications: u64,
    /// Notifications dropped as stale.
    pub stale_notifications: u64,
    pub long_poll_error: u64,
    pub listener_panics: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refresh_success={}, refresh_changed_keys={}, refresh_error={}, not_found={}, local_fallback={}, fallback_expired={}, notifications={}, stale_notifications={}, long_poll_error={}, listener_panics={}",
            self.refresh_success,
            self.refresh_changed_keys,
            self.refresh_error,
            self.not_found,
            self.local_fallback,
            self.fallback_expired,
            self.notifications,
            self.stale_notifications,
            self.long_poll_error,
            self.listener_panics
        )
    }
}

/// Counts every sync event in a [`TelemetryCounters`].
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl SyncTelemetry for CountingTelemetry {
    fn on_refresh_success(&self, _namespace: &str, changed_keys: usize) {
        self.counters
            .refresh_success
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .refresh_changed_keys
            .fetch_add(changed_keys as u64, Ordering::Relaxed);
    }

    fn on_refresh_error(&self, _namespace: &str, _error: &FetchError) {
        self.counters.refresh_error.fetch_add(1, Ordering::Relaxed);
    }

    fn on_namespace_not_found(&self, _namespace: &str) {
        self.counters.not_found.fetch_add(1, Ordering::Relaxed);
    }

    fn on_local_fallback(&self, _namespace: &str) {
        self.counters.local_fallback.fetch_add(1, Ordering::Relaxed);
    }

    fn on_fallback_expired(&self, _namespace: &str) {
        self.counters
            .fallback_expired
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_notification(&self, _namespace: &str, _notification_id: i64) {
        self.counters.notifications.fetch_add(1, Ordering::Relaxed);
    }

    fn on_stale_notification(&self, _namespace: &str, _notification_id: i64) {
        self.counters
            .stale_notifications
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_long_poll_error(&self, _error: &HttpError) {
        self.counters.long_poll_error.fetch_add(1, Ordering::Relaxed);
    }

    fn on_listener_panic(&self, _namespace: &str) {
        self.counters.listener_panics.fetch_add(1, Ordering::Relaxed);
    }
}
