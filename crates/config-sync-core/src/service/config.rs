//! Runtime configuration for the synchronisation service.
//!
//! [`SyncConfig`] is the fully resolved form; [`crate::config::SyncSettings`]
//! is the layered, all-optional form loaded from files and the environment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::http::BackoffConfig;

/// Cluster used when none is configured.
pub const DEFAULT_CLUSTER: &str = "default";
pub const DEFAULT_META_SERVER: &str = "http://localhost:8080";
/// Safety-net refresh cadence per namespace.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Lower bound for any periodic interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DISCOVERY_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the server holds a long poll open.
pub const DEFAULT_LONG_POLL_HOLD: Duration = Duration::from_secs(60);
/// Client timeout for a long poll; must exceed the hold.
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(90);
/// Margin added above the hold when the configured long-poll timeout is too short.
const LONG_POLL_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FETCH_ATTEMPTS: u32 = 3;
pub const DEFAULT_FETCH_QPS: f64 = 2.0;
pub const DEFAULT_LONG_POLL_QPS: f64 = 2.0;
/// Smallest positive rate accepted; zero still means unlimited.
pub const MIN_QPS: f64 = 0.01;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;
pub const DEFAULT_FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What a namespace serves while the backend stays unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Keep serving the last good snapshot indefinitely.
    #[default]
    ServeStale,
    /// Replace the snapshot with an empty one once no remote confirmation
    /// happened for the given duration. The on-disk cache is left alone.
    ExpireAfter(Duration),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub app_id: String,
    pub cluster: String,
    pub data_center: Option<String>,
    /// Grey-release label forwarded with fetches.
    pub label: Option<String>,
    /// Client address reported to the backend.
    pub client_ip: Option<String>,
    /// Meta-discovery base URL.
    pub meta_server: String,
    /// Fixed configuration service URLs; non-empty disables discovery.
    pub config_service_urls: Vec<String>,
    /// Root of the on-disk cache.
    pub cache_dir: PathBuf,
    /// Preserve server-supplied entry order.
    pub property_order: bool,
    pub discovery_refresh_interval: Duration,
    pub discovery_timeout: Duration,
    pub fetch_timeout: Duration,
    pub long_poll_hold: Duration,
    pub long_poll_timeout: Duration,
    /// Attempt ceiling for one logical fetch, across endpoints.
    pub max_fetch_attempts: u32,
    pub fetch_backoff: BackoffConfig,
    pub long_poll_backoff: BackoffConfig,
    /// Scheduled refresh period per namespace.
    pub refresh_interval: Duration,
    /// Non-positive values disable the limiter.
    pub fetch_qps: f64,
    pub long_poll_qps: f64,
    /// Concurrent fetch/save operations across all namespaces.
    pub worker_pool_size: usize,
    /// Window within which repeated refresh failures log once at warn level.
    pub failure_log_interval: Duration,
    /// Bounded wait for background tasks on shutdown.
    pub shutdown_grace: Duration,
    pub fallback_policy: FallbackPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            cluster: DEFAULT_CLUSTER.to_string(),
            data_center: None,
            label: None,
            client_ip: None,
            meta_server: DEFAULT_META_SERVER.to_string(),
            config_service_urls: Vec::new(),
            cache_dir: std::env::temp_dir().join("config-sync"),
            property_order: false,
            discovery_refresh_interval: DEFAULT_DISCOVERY_REFRESH_INTERVAL,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            long_poll_hold: DEFAULT_LONG_POLL_HOLD,
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            max_fetch_attempts: DEFAULT_MAX_FETCH_ATTEMPTS,
            fetch_backoff: BackoffConfig::fetch_retry(),
            long_poll_backoff: BackoffConfig::long_poll(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            fetch_qps: DEFAULT_FETCH_QPS,
            long_poll_qps: DEFAULT_LONG_POLL_QPS,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            failure_log_interval: DEFAULT_FAILURE_LOG_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            fallback_policy: FallbackPolicy::ServeStale,
        }
    }
}

impl SyncConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    /// Clamps out-of-range values, logging each correction.
    pub fn sanitise(mut self) -> Self {
        if self.cluster.trim().is_empty() {
            warn!("empty cluster name; using {DEFAULT_CLUSTER}");
            self.cluster = DEFAULT_CLUSTER.to_string();
        }

        if self.refresh_interval < MIN_INTERVAL {
            warn!(
                "refresh interval {:?} is below the minimum {:?}; using {:?} instead",
                self.refresh_interval, MIN_INTERVAL, DEFAULT_REFRESH_INTERVAL
            );
            self.refresh_interval = DEFAULT_REFRESH_INTERVAL;
        }
        if self.discovery_refresh_interval < MIN_INTERVAL {
            warn!(
                "discovery refresh interval {:?} is below the minimum {:?}; using {:?} instead",
                self.discovery_refresh_interval, MIN_INTERVAL, DEFAULT_DISCOVERY_REFRESH_INTERVAL
            );
            self.discovery_refresh_interval = DEFAULT_DISCOVERY_REFRESH_INTERVAL;
        }

        for (name, value, default) in [
            ("discovery timeout", &mut self.discovery_timeout, DEFAULT_DISCOVERY_TIMEOUT),
            ("fetch timeout", &mut self.fetch_timeout, DEFAULT_FETCH_TIMEOUT),
            ("long poll hold", &mut self.long_poll_hold, DEFAULT_LONG_POLL_HOLD),
            ("shutdown grace", &mut self.shutdown_grace, DEFAULT_SHUTDOWN_GRACE),
        ] {
            if value.is_zero() {
                warn!("{name} must be positive; using {:?}", default);
                *value = default;
            }
        }

        if self.long_poll_timeout <= self.long_poll_hold {
            let adjusted = self.long_poll_hold + LONG_POLL_TIMEOUT_MARGIN;
            warn!(
                "long poll timeout {:?} does not exceed the server hold {:?}; using {:?}",
                self.long_poll_timeout, self.long_poll_hold, adjusted
            );
            self.long_poll_timeout = adjusted;
        }

        if self.max_fetch_attempts == 0 {
            warn!("fetch attempt ceiling must be at least 1; using 1");
            self.max_fetch_attempts = 1;
        }
        if self.worker_pool_size == 0 {
            warn!("worker pool size must be at least 1; using 1");
            self.worker_pool_size = 1;
        }

        for (name, backoff) in [
            ("fetch", &mut self.fetch_backoff),
            ("long poll", &mut self.long_poll_backoff),
        ] {
            if backoff.max_backoff < backoff.base {
                warn!(
                    "{name} backoff cap {:?} is below its base {:?}; raising the cap",
                    backoff.max_backoff, backoff.base
                );
                backoff.max_backoff = backoff.base;
            }
            if !(backoff.factor >= 1.0) {
                warn!("{name} backoff factor {} is invalid; using 2", backoff.factor);
                backoff.factor = 2.0;
            }
        }

        for (name, qps) in [
            ("fetch", &mut self.fetch_qps),
            ("long poll", &mut self.long_poll_qps),
        ] {
            if !qps.is_finite() || *qps < 0.0 {
                warn!("{name} qps {} is invalid; disabling the limit", qps);
                *qps = 0.0;
            } else if *qps > 0.0 && *qps < MIN_QPS {
                warn!("{name} qps {} is below the minimum {MIN_QPS}; using {MIN_QPS}", qps);
                *qps = MIN_QPS;
            }
        }

        if let FallbackPolicy::ExpireAfter(ttl) = self.fallback_policy {
            if ttl < self.refresh_interval {
                warn!(
                    "fallback expiry {:?} is shorter than the refresh interval {:?}; using the refresh interval",
                    ttl, self.refresh_interval
                );
                self.fallback_policy = FallbackPolicy::ExpireAfter(self.refresh_interval);
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.cluster, "default");
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.long_poll_timeout, Duration::from_secs(90));
        assert_eq!(config.max_fetch_attempts, 3);
        assert_eq!(config.fetch_backoff.max_backoff, Duration::from_secs(8));
        assert_eq!(config.long_poll_backoff.max_backoff, Duration::from_secs(120));
        assert_eq!(config.fallback_policy, FallbackPolicy::ServeStale);
    }

    #[test]
    fn sanitise_clamps_intervals_and_counts() {
        let config = SyncConfig {
            cluster: " ".into(),
            refresh_interval: Duration::from_millis(10),
            fetch_timeout: Duration::ZERO,
            max_fetch_attempts: 0,
            worker_pool_size: 0,
            ..SyncConfig::new("demo")
        }
        .sanitise();
        assert_eq!(config.cluster, DEFAULT_CLUSTER);
        assert_eq!(config.refresh_interval, DEFAULT_REFRESH_INTERVAL);
        assert_eq!(config.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
        assert_eq!(config.max_fetch_attempts, 1);
        assert_eq!(config.worker_pool_size, 1);
    }

    #[test]
    fn sanitise_raises_tiny_rates_and_drops_invalid_ones() {
        let config = SyncConfig {
            fetch_qps: 1e-20,
            long_poll_qps: f64::NAN,
            ..SyncConfig::new("demo")
        }
        .sanitise();
        assert_eq!(config.fetch_qps, MIN_QPS);
        assert_eq!(config.long_poll_qps, 0.0);
    }

    #[test]
    fn sanitise_keeps_long_poll_timeout_above_hold() {
        let config = SyncConfig {
            long_poll_hold: Duration::from_secs(60),
            long_poll_timeout: Duration::from_secs(30),
            ..SyncConfig::new("demo")
        }
        .sanitise();
        assert_eq!(config.long_poll_timeout, Duration::from_secs(90));
    }

    #[test]
    fn sanitise_fixes_backoff_and_fallback_expiry() {
        let config = SyncConfig {
            fetch_backoff: BackoffConfig {
                base: Duration::from_secs(4),
                max_backoff: Duration::from_secs(1),
                factor: 0.5,
                recovery_interval: 0,
            },
            refresh_interval: Duration::from_secs(60),
            fallback_policy: FallbackPolicy::ExpireAfter(Duration::from_secs(5)),
            ..SyncConfig::new("demo")
        }
        .sanitise();
        assert_eq!(config.fetch_backoff.max_backoff, Duration::from_secs(4));
        assert_eq!(config.fetch_backoff.factor, 2.0);
        assert_eq!(
            config.fallback_policy,
            FallbackPolicy::ExpireAfter(Duration::from_secs(60))
        );
    }
}
