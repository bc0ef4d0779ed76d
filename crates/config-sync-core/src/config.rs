//! Layered settings for bootstrapping a [`ConfigContext`](crate::ConfigContext).
//!
//! [`SyncSettings`] is a flat record of optional values. It can be read from
//! `CONFIG_SYNC_*` environment variables and from a YAML file; layers are
//! combined with [`SyncSettings::merge`] (the argument wins) and finally laid
//! over [`SyncConfig::default`] by [`SyncSettings::into_config`].

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::service::{FallbackPolicy, SyncConfig};

const ENV_PREFIX: &str = "CONFIG_SYNC_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file {0} does not exist")]
    MissingFile(PathBuf),
    #[error("failed to parse settings: {0}")]
    Parse(String),
    #[error("an application id is required")]
    MissingAppId,
}

/// Overwrites `$target.$field` when `$source.$field` is set.
macro_rules! overlay {
    ($target:expr, $source:expr, $($field:ident),+ $(,)?) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field;
            }
        )+
    };
}

/// Optional settings; unset values keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub app_id: Option<String>,
    pub cluster: Option<String>,
    pub data_center: Option<String>,
    pub label: Option<String>,
    pub client_ip: Option<String>,
    pub meta_server: Option<String>,
    pub config_service_urls: Option<Vec<String>>,
    pub cache_dir: Option<PathBuf>,
    pub property_order: Option<bool>,
    /// Namespaces to load eagerly.
    pub namespaces: Option<Vec<String>>,
    pub refresh_interval_secs: Option<u64>,
    pub discovery_refresh_interval_secs: Option<u64>,
    pub discovery_timeout_secs: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub long_poll_hold_secs: Option<u64>,
    pub long_poll_timeout_secs: Option<u64>,
    pub max_fetch_attempts: Option<u32>,
    pub fetch_backoff_base_ms: Option<u64>,
    pub fetch_backoff_cap_ms: Option<u64>,
    pub long_poll_backoff_base_ms: Option<u64>,
    pub long_poll_backoff_cap_ms: Option<u64>,
    pub fetch_qps: Option<f64>,
    pub long_poll_qps: Option<f64>,
    pub worker_pool_size: Option<usize>,
    pub failure_log_interval_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    /// Zero keeps serving stale configuration forever.
    pub fallback_expiry_secs: Option<u64>,
}

impl SyncSettings {
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Reads `CONFIG_SYNC_*` variables from `iter`; other keys are ignored.
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .filter_map(|(k, v)| {
                let key: String = k.into();
                key.strip_prefix(ENV_PREFIX)
                    .map(|name| (name.to_ascii_lowercase(), v.into()))
            })
            .collect();
        let text = |name: &str| map.get(name).and_then(|value| sanitize_non_empty(value));
        let list = |name: &str| text(name).map(|value| split_list(&value));

        Self {
            app_id: text("app_id"),
            cluster: text("cluster"),
            data_center: text("data_center"),
            label: text("label"),
            client_ip: text("client_ip"),
            meta_server: text("meta_server"),
            config_service_urls: list("config_service_urls"),
            cache_dir: text("cache_dir").map(PathBuf::from),
            property_order: parse_bool(map.get("property_order").map(String::as_str)),
            namespaces: list("namespaces"),
            refresh_interval_secs: parse_env(&map, "refresh_interval_secs"),
            discovery_refresh_interval_secs: parse_env(&map, "discovery_refresh_interval_secs"),
            discovery_timeout_secs: parse_env(&map, "discovery_timeout_secs"),
            fetch_timeout_secs: parse_env(&map, "fetch_timeout_secs"),
            long_poll_hold_secs: parse_env(&map, "long_poll_hold_secs"),
            long_poll_timeout_secs: parse_env(&map, "long_poll_timeout_secs"),
            max_fetch_attempts: parse_env(&map, "max_fetch_attempts"),
            fetch_backoff_base_ms: parse_env(&map, "fetch_backoff_base_ms"),
            fetch_backoff_cap_ms: parse_env(&map, "fetch_backoff_cap_ms"),
            long_poll_backoff_base_ms: parse_env(&map, "long_poll_backoff_base_ms"),
            long_poll_backoff_cap_ms: parse_env(&map, "long_poll_backoff_cap_ms"),
            fetch_qps: parse_env(&map, "fetch_qps"),
            long_poll_qps: parse_env(&map, "long_poll_qps"),
            worker_pool_size: parse_env(&map, "worker_pool_size"),
            failure_log_interval_secs: parse_env(&map, "failure_log_interval_secs"),
            shutdown_grace_secs: parse_env(&map, "shutdown_grace_secs"),
            fallback_expiry_secs: parse_env(&map, "fallback_expiry_secs"),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        Figment::new()
            .merge(Yaml::file(path))
            .extract()
            .map_err(|err| ConfigError::Parse(format!("{}: {err}", path.display())))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Layers `other` on top of `self`; values set in `other` win.
    pub fn merge(mut self, other: SyncSettings) -> Self {
        overlay!(
            self,
            other,
            app_id,
            cluster,
            data_center,
            label,
            client_ip,
            meta_server,
            config_service_urls,
            cache_dir,
            property_order,
            namespaces,
            refresh_interval_secs,
            discovery_refresh_interval_secs,
            discovery_timeout_secs,
            fetch_timeout_secs,
            long_poll_hold_secs,
            long_poll_timeout_secs,
            max_fetch_attempts,
            fetch_backoff_base_ms,
            fetch_backoff_cap_ms,
            long_poll_backoff_base_ms,
            long_poll_backoff_cap_ms,
            fetch_qps,
            long_poll_qps,
            worker_pool_size,
            failure_log_interval_secs,
            shutdown_grace_secs,
            fallback_expiry_secs,
        );
        self
    }

    /// Resolves the settings over the defaults; an app id is mandatory.
    pub fn into_config(self) -> Result<SyncConfig, ConfigError> {
        let app_id = self
            .app_id
            .and_then(|id| sanitize_non_empty(&id))
            .ok_or(ConfigError::MissingAppId)?;
        let mut config = SyncConfig::new(app_id);

        if let Some(cluster) = self.cluster {
            config.cluster = cluster;
        }
        config.data_center = self.data_center;
        config.label = self.label;
        config.client_ip = self.client_ip;
        if let Some(meta_server) = self.meta_server {
            config.meta_server = meta_server;
        }
        if let Some(urls) = self.config_service_urls {
            config.config_service_urls = urls;
        }
        if let Some(cache_dir) = self.cache_dir {
            config.cache_dir = cache_dir;
        }
        if let Some(property_order) = self.property_order {
            config.property_order = property_order;
        }

        let secs = Duration::from_secs;
        for (value, target) in [
            (self.refresh_interval_secs, &mut config.refresh_interval),
            (
                self.discovery_refresh_interval_secs,
                &mut config.discovery_refresh_interval,
            ),
            (self.discovery_timeout_secs, &mut config.discovery_timeout),
            (self.fetch_timeout_secs, &mut config.fetch_timeout),
            (self.long_poll_hold_secs, &mut config.long_poll_hold),
            (self.long_poll_timeout_secs, &mut config.long_poll_timeout),
            (self.failure_log_interval_secs, &mut config.failure_log_interval),
            (self.shutdown_grace_secs, &mut config.shutdown_grace),
        ] {
            if let Some(value) = value {
                *target = secs(value);
            }
        }

        if let Some(attempts) = self.max_fetch_attempts {
            config.max_fetch_attempts = attempts;
        }
        for (value, target) in [
            (self.fetch_backoff_base_ms, &mut config.fetch_backoff.base),
            (self.fetch_backoff_cap_ms, &mut config.fetch_backoff.max_backoff),
            (self.long_poll_backoff_base_ms, &mut config.long_poll_backoff.base),
            (self.long_poll_backoff_cap_ms, &mut config.long_poll_backoff.max_backoff),
        ] {
            if let Some(millis) = value {
                *target = Duration::from_millis(millis);
            }
        }
        if let Some(qps) = self.fetch_qps {
            config.fetch_qps = qps;
        }
        if let Some(qps) = self.long_poll_qps {
            config.long_poll_qps = qps;
        }
        if let Some(size) = self.worker_pool_size {
            config.worker_pool_size = size;
        }
        config.fallback_policy = match self.fallback_expiry_secs {
            None | Some(0) => FallbackPolicy::ServeStale,
            Some(ttl) => FallbackPolicy::ExpireAfter(secs(ttl)),
        };

        Ok(config.sanitise())
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(sanitize_non_empty)
        .collect()
}

fn parse_bool(value: Option<&str>) -> Option<bool> {
    let value = value?.trim().to_ascii_lowercase();
    match value.as_str() {
        "1" | "true" | "t" | "yes" | "y" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        "" => None,
        other => {
            warn!("ignoring unrecognised boolean setting value {other:?}");
            None
        }
    }
}

fn parse_env<T: FromStr>(map: &HashMap<String, String>, name: &str) -> Option<T> {
    let raw = map.get(name)?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring invalid value {raw:?} for {ENV_PREFIX}{}", name.to_ascii_uppercase());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn env_settings_are_read_with_prefix() {
        let settings = SyncSettings::from_env_iter([
            ("CONFIG_SYNC_APP_ID", " demo "),
            ("CONFIG_SYNC_CONFIG_SERVICE_URLS", "http://a:8080/, http://b:8080/,"),
            ("CONFIG_SYNC_PROPERTY_ORDER", "yes"),
            ("CONFIG_SYNC_REFRESH_INTERVAL_SECS", "30"),
            ("CONFIG_SYNC_FETCH_QPS", "not-a-number"),
            ("UNRELATED", "x"),
        ]);
        assert_eq!(settings.app_id.as_deref(), Some("demo"));
        assert_eq!(
            settings.config_service_urls,
            Some(vec!["http://a:8080/".to_string(), "http://b:8080/".to_string()])
        );
        assert_eq!(settings.property_order, Some(true));
        assert_eq!(settings.refresh_interval_secs, Some(30));
        assert_eq!(settings.fetch_qps, None);
    }

    #[test]
    fn later_layers_win() {
        let yaml = SyncSettings::from_yaml_str(
            "app_id: from-yaml\ncluster: sh\nnamespaces: [application, datasource.yml]\n",
        )
        .expect("yaml");
        let env = SyncSettings::from_env_iter([("CONFIG_SYNC_CLUSTER", "bj")]);
        let merged = yaml.merge(env);
        assert_eq!(merged.app_id.as_deref(), Some("from-yaml"));
        assert_eq!(merged.cluster.as_deref(), Some("bj"));
        assert_eq!(
            merged.namespaces,
            Some(vec!["application".to_string(), "datasource.yml".to_string()])
        );
    }

    #[test]
    fn into_config_applies_values_over_defaults() {
        let config = SyncSettings {
            app_id: Some("demo".into()),
            fetch_timeout_secs: Some(2),
            max_fetch_attempts: Some(5),
            fallback_expiry_secs: Some(3600),
            ..Default::default()
        }
        .into_config()
        .expect("config");
        assert_eq!(config.app_id, "demo");
        assert_eq!(config.cluster, "default");
        assert_eq!(config.fetch_timeout, Duration::from_secs(2));
        assert_eq!(config.max_fetch_attempts, 5);
        assert_eq!(
            config.fallback_policy,
            FallbackPolicy::ExpireAfter(Duration::from_secs(3600))
        );
    }

    #[test]
    fn backoff_bounds_come_from_env() {
        let config = SyncSettings::from_env_iter([
            ("CONFIG_SYNC_APP_ID", "demo"),
            ("CONFIG_SYNC_FETCH_BACKOFF_BASE_MS", "200"),
            ("CONFIG_SYNC_FETCH_BACKOFF_CAP_MS", "2000"),
            ("CONFIG_SYNC_LONG_POLL_BACKOFF_BASE_MS", "500"),
            ("CONFIG_SYNC_LONG_POLL_BACKOFF_CAP_MS", "100"),
        ])
        .into_config()
        .expect("config");
        assert_eq!(config.fetch_backoff.base, Duration::from_millis(200));
        assert_eq!(config.fetch_backoff.max_backoff, Duration::from_secs(2));
        assert_eq!(config.long_poll_backoff.base, Duration::from_millis(500));
        // A cap below the base is raised to it.
        assert_eq!(config.long_poll_backoff.max_backoff, Duration::from_millis(500));
    }

    #[test]
    fn app_id_is_required() {
        assert!(matches!(
            SyncSettings::default().into_config(),
            Err(ConfigError::MissingAppId)
        ));
        assert!(matches!(
            SyncSettings {
                app_id: Some("  ".into()),
                ..Default::default()
            }
            .into_config(),
            Err(ConfigError::MissingAppId)
        ));
    }

    #[test]
    fn yaml_file_is_loaded_and_missing_file_reported() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "app_id: demo\nfetch_qps: 0.5\ncache_dir: /var/cache/demo").expect("write");
        let settings = SyncSettings::from_yaml_file(file.path()).expect("yaml file");
        assert_eq!(settings.fetch_qps, Some(0.5));
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/var/cache/demo")));

        assert!(matches!(
            SyncSettings::from_yaml_file("/definitely/not/here.yaml"),
            Err(ConfigError::MissingFile(_))
        ));
        assert!(matches!(
            SyncSettings::from_yaml_str("fetch_qps: [1, 2]"),
            Err(ConfigError::Parse(_))
        ));
    }
}
