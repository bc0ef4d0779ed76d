//! Service-level telemetry abstractions.
//!
//! Embedders implement [`SyncTelemetry`] to observe refresh outcomes,
//! notifications and fallbacks without reaching into the service internals.

use crate::fetcher::FetchError;
use crate::http::HttpError;

/// Telemetry hook invoked on significant synchronisation events.
///
/// Every method has an empty default so implementors only override what they
/// export.
pub trait SyncTelemetry: Send + Sync {
    /// A refresh reached the server; `changed_keys` is zero for no-op refreshes.
    fn on_refresh_success(&self, _namespace: &str, _changed_keys: usize) {}
    /// A refresh cycle exhausted its attempts.
    fn on_refresh_error(&self, _namespace: &str, _error: &FetchError) {}
    /// The server reported the namespace as missing.
    fn on_namespace_not_found(&self, _namespace: &str) {}
    /// A namespace started serving its on-disk cache.
    fn on_local_fallback(&self, _namespace: &str) {}
    /// A stale fallback snapshot aged out and was replaced by an empty one.
    fn on_fallback_expired(&self, _namespace: &str) {}
    /// A notification advanced a namespace's notification id.
    fn on_notification(&self, _namespace: &str, _notification_id: i64) {}
    /// A notification carried an id not newer than the one already seen.
    fn on_stale_notification(&self, _namespace: &str, _notification_id: i64) {}
    /// A long-poll request failed.
    fn on_long_poll_error(&self, _error: &HttpError) {}
    /// A change listener panicked while being notified.
    fn on_listener_panic(&self, _namespace: &str) {}
}

/// Default telemetry implementation that performs no-ops.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl SyncTelemetry for NoopTelemetry {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        changed: AtomicUsize,
        errors: AtomicUsize,
    }

    impl SyncTelemetry for Recorder {
        fn on_refresh_success(&self, _namespace: &str, changed_keys: usize) {
            self.changed.fetch_add(changed_keys, Ordering::Relaxed);
        }

        fn on_refresh_error(&self, _namespace: &str, _error: &FetchError) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn partial_implementations_keep_default_hooks() {
        let telemetry = Recorder::default();
        telemetry.on_refresh_success("application", 3);
        telemetry.on_refresh_error("application", &FetchError::NoEndpoint);
        telemetry.on_local_fallback("application");
        telemetry.on_listener_panic("application");

        assert_eq!(telemetry.changed.load(Ordering::Relaxed), 3);
        assert_eq!(telemetry.errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn noop_telemetry_accepts_every_event() {
        let telemetry = NoopTelemetry;
        telemetry.on_refresh_success("a", 0);
        telemetry.on_namespace_not_found("a");
        telemetry.on_fallback_expired("a");
        telemetry.on_notification("a", 1);
        telemetry.on_stale_notification("a", 0);
        telemetry.on_long_poll_error(&HttpError::Timeout(std::time::Duration::from_secs(1)));
    }
}
