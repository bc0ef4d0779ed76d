//! Public entry points for the config-sync core crate.
//!
//! A [`ConfigContext`] keeps process-local snapshots of remote configuration
//! namespaces current: it discovers configuration service instances, long
//! polls for change notifications, fetches new releases, persists them to a
//! local cache and delivers change sets to registered listeners.

pub mod config;
pub mod fetcher;
pub mod format;
pub mod http;
pub mod locator;
pub mod notification;
pub mod rate_limit;
pub mod service;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod telemetry;

pub use config::{ConfigError, SyncSettings};
pub use fetcher::{FetchConfig, FetchError, FetchOutcome, RemoteFetcher};
pub use format::{ConfigFileFormat, FormatError};
pub use http::{BackoffConfig, HttpClient, HttpClientOptions, HttpError};
pub use locator::{EndpointSelector, RandomSelector, ServiceEndpoint, ServiceLocator};
pub use notification::{Notification, NotificationChannel, NotificationMessages};
pub use service::{
    normalize_namespace, ConfigChangeListener, ConfigContext, ConfigContextBuilder,
    FallbackPolicy, ListenerFilter, NamespaceSync, NoopTelemetry, RefreshOutcome, SnapshotView,
    SubscriptionHandle, SyncConfig, SyncError, SyncHandle, SyncTelemetry,
};
pub use snapshot::{ChangeSet, ChangeType, ConfigEntries, PropertyChange, Snapshot, SourceType};
pub use status::{status_json, NamespaceStatus, SyncHealth};
pub use store::{LocalCacheStore, StoreError};
pub use telemetry::{CountingTelemetry, TelemetryCounters, TelemetrySnapshot};
