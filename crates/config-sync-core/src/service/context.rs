//! Process-wide entry point tying discovery, notifications and namespaces together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::SyncConfig;
use super::namespace::{NamespaceSync, SyncShared};
use super::telemetry::{NoopTelemetry, SyncTelemetry};
use super::view::{ConfigChangeListener, ListenerFilter, SnapshotView};
use crate::config::ConfigError;
use crate::fetcher::{FetchConfig, RemoteFetcher};
use crate::http::{HttpClient, HttpClientOptions, HttpError};
use crate::locator::{EndpointSelector, LocatorConfig, RandomSelector, ServiceLocator};
use crate::notification::{LongPollConfig, NotificationChannel, RefreshTrigger};
use crate::rate_limit::RateLimiter;
use crate::snapshot::Snapshot;
use crate::status::NamespaceStatus;
use crate::store::{LocalCacheStore, StoreError};

/// Longest accepted namespace identifier.
pub const MAX_NAMESPACE_LEN: usize = 128;
const PROPERTIES_SUFFIX: &str = ".properties";

/// Errors surfaced to callers of the context.
///
/// Network and cache failures never show up here; they are absorbed by the
/// namespace workers.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid namespace {namespace:?}: {reason}")]
    InvalidNamespace {
        namespace: String,
        reason: &'static str,
    },
    /// The context was built outside a tokio runtime.
    #[error("no tokio runtime available to run background tasks")]
    NoRuntime,
    #[error("http client error: {0}")]
    Http(#[from] HttpError),
    #[error("local cache error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Validates a namespace identifier and strips the implicit `.properties` suffix.
pub fn normalize_namespace(namespace: &str) -> Result<String, SyncError> {
    let invalid = |reason| SyncError::InvalidNamespace {
        namespace: namespace.to_string(),
        reason,
    };

    let trimmed = namespace.trim();
    let name = match trimmed.len().checked_sub(PROPERTIES_SUFFIX.len()) {
        Some(split)
            if trimmed.is_char_boundary(split)
                && trimmed[split..].eq_ignore_ascii_case(PROPERTIES_SUFFIX) =>
        {
            &trimmed[..split]
        }
        _ => trimmed,
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAMESPACE_LEN {
        return Err(invalid("longer than 128 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid("only [A-Za-z0-9_.-] are allowed"));
    }
    Ok(name.to_string())
}

/// Identifies one listener registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    namespace: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct ConfigContextBuilder {
    config: SyncConfig,
    telemetry: Option<Arc<dyn SyncTelemetry>>,
    selector: Option<Arc<dyn EndpointSelector>>,
    http_options: HttpClientOptions,
}

impl ConfigContextBuilder {
    pub fn telemetry(mut self, telemetry: Arc<dyn SyncTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Replaces the default random endpoint selection.
    pub fn selector(mut self, selector: Arc<dyn EndpointSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn http_options(mut self, options: HttpClientOptions) -> Self {
        self.http_options = options;
        self
    }

    /// Wires every component. Must run inside a tokio runtime; no network
    /// call is made until a namespace is requested or [`ConfigContext::start`] runs.
    pub fn build(self) -> Result<ConfigContext, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let config = self.config.sanitise();
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(NoopTelemetry));
        let selector = self.selector.unwrap_or_else(|| Arc::new(RandomSelector));

        let http = HttpClient::new(self.http_options)?;
        let locator = Arc::new(ServiceLocator::new(
            http.clone(),
            LocatorConfig {
                meta_server: config.meta_server.clone(),
                app_id: config.app_id.clone(),
                client_ip: config.client_ip.clone(),
                static_endpoints: config.config_service_urls.clone(),
                refresh_interval: config.discovery_refresh_interval,
                timeout: config.discovery_timeout,
            },
            selector,
        ));
        let fetcher = RemoteFetcher::new(
            http.clone(),
            FetchConfig {
                app_id: config.app_id.clone(),
                cluster: config.cluster.clone(),
                data_center: config.data_center.clone(),
                label: config.label.clone(),
                client_ip: config.client_ip.clone(),
                timeout: config.fetch_timeout,
                max_attempts: config.max_fetch_attempts,
                property_order: config.property_order,
            },
            RateLimiter::new(config.fetch_qps),
        );
        let channel = Arc::new(NotificationChannel::new(
            http,
            locator.clone(),
            RateLimiter::new(config.long_poll_qps),
            LongPollConfig {
                app_id: config.app_id.clone(),
                cluster: config.cluster.clone(),
                data_center: config.data_center.clone(),
                client_ip: config.client_ip.clone(),
                timeout: config.long_poll_timeout,
                backoff: config.long_poll_backoff,
            },
            telemetry.clone(),
        ));

        let store = match LocalCacheStore::open(&config.cache_dir, &config.app_id, &config.cluster)
        {
            Ok(store) => {
                debug!(cache_dir = %store.dir().display(), "config-sync local cache opened");
                Some(store)
            }
            Err(err) => {
                warn!(
                    %err,
                    cache_dir = %config.cache_dir.display(),
                    "config-sync local cache unavailable; running without disk fallback"
                );
                None
            }
        };

        let pool = Semaphore::new(config.worker_pool_size);
        info!(
            app_id = %config.app_id,
            cluster = %config.cluster,
            static_endpoints = config.config_service_urls.len(),
            "config-sync context created"
        );

        Ok(ConfigContext {
            inner: Arc::new(ContextInner {
                shared: Arc::new(SyncShared {
                    config,
                    fetcher,
                    locator,
                    store,
                    pool,
                    telemetry,
                }),
                channel,
                namespaces: RwLock::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                runtime,
            }),
        })
    }
}

struct ContextInner {
    shared: Arc<SyncShared>,
    channel: Arc<NotificationChannel>,
    namespaces: RwLock<HashMap<String, Arc<NamespaceSync>>>,
    /// Namespace worker tasks, joined on shutdown.
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ContextInner {
    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle on every synchronised namespace of one application.
///
/// Cloning is cheap; all clones observe the same namespaces.
#[derive(Clone)]
pub struct ConfigContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ConfigContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigContext")
            .field("app_id", &self.inner.shared.config.app_id)
            .field("cluster", &self.inner.shared.config.cluster)
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

impl ConfigContext {
    pub fn builder(config: SyncConfig) -> ConfigContextBuilder {
        ConfigContextBuilder {
            config,
            telemetry: None,
            selector: None,
            http_options: HttpClientOptions::default(),
        }
    }

    /// Builds a context with default collaborators.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.shared.config
    }

    pub fn locator(&self) -> &Arc<ServiceLocator> {
        &self.inner.shared.locator
    }

    pub fn notifications(&self) -> &Arc<NotificationChannel> {
        &self.inner.channel
    }

    /// Spawns the discovery and long-poll loops.
    pub fn start(&self) -> SyncHandle {
        let locator = self.inner.shared.locator.clone();
        let channel = self.inner.channel.clone();
        let join_handles = vec![
            self.inner
                .runtime
                .spawn(locator.run(self.inner.cancel.child_token())),
            self.inner
                .runtime
                .spawn(channel.run(self.inner.cancel.child_token())),
        ];
        SyncHandle {
            context: self.clone(),
            join_handles,
        }
    }

    /// Returns the namespace worker, creating and spawning it on first use.
    ///
    /// Creation seeds the snapshot from the local cache; it never waits on
    /// the network.
    pub fn namespace_sync(&self, namespace: &str) -> Result<Arc<NamespaceSync>, SyncError> {
        let name = normalize_namespace(namespace)?;
        if let Some(sync) = self
            .inner
            .namespaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&name)
        {
            return Ok(sync.clone());
        }

        let mut namespaces = self
            .inner
            .namespaces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sync) = namespaces.get(&name) {
            return Ok(sync.clone());
        }

        let sync = NamespaceSync::new(&name, self.inner.shared.clone());
        self.inner
            .channel
            .subscribe(&name, sync.clone() as Arc<dyn RefreshTrigger>);
        let worker = sync.spawn(&self.inner.runtime, self.inner.cancel.child_token());
        self.inner.workers().push(worker);
        namespaces.insert(name.clone(), sync.clone());
        debug!(namespace = %name, "config-sync namespace registered");
        Ok(sync)
    }

    /// Current snapshot of `namespace`; never blocks on the network.
    pub fn get_snapshot(&self, namespace: &str) -> Result<Arc<Snapshot>, SyncError> {
        Ok(self.namespace_sync(namespace)?.view().snapshot())
    }

    pub fn view(&self, namespace: &str) -> Result<Arc<SnapshotView>, SyncError> {
        Ok(self.namespace_sync(namespace)?.view().clone())
    }

    /// Like [`Self::view`], but waits for the first refresh attempt to finish.
    pub async fn load(&self, namespace: &str) -> Result<Arc<SnapshotView>, SyncError> {
        let sync = self.namespace_sync(namespace)?;
        sync.wait_initialized().await;
        Ok(sync.view().clone())
    }

    /// Registers `listener` for changes of `namespace` touching any of
    /// `keys`, or any key starting with one of `prefixes`. Both empty means
    /// every change.
    pub fn subscribe<K, P>(
        &self,
        namespace: &str,
        listener: Arc<dyn ConfigChangeListener>,
        keys: K,
        prefixes: P,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        K: IntoIterator,
        K::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let sync = self.namespace_sync(namespace)?;
        let id = sync
            .view()
            .subscribe(listener, ListenerFilter::new(keys, prefixes));
        Ok(SubscriptionHandle {
            namespace: sync.namespace().to_string(),
            id,
        })
    }

    /// Removes a listener; returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner
            .namespaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&handle.namespace)
            .is_some_and(|sync| sync.view().unsubscribe(handle.id))
    }

    /// Registered namespaces, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .namespaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn status(&self) -> Vec<NamespaceStatus> {
        let syncs: Vec<Arc<NamespaceSync>> = self
            .inner
            .namespaces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut statuses: Vec<NamespaceStatus> = syncs
            .iter()
            .map(|sync| sync.status(self.inner.channel.notification_id(sync.namespace())))
            .collect();
        statuses.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        statuses
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

/// Handle returned by [`ConfigContext::start`] controlling background tasks.
pub struct SyncHandle {
    context: ConfigContext,
    join_handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("join_handles", &self.join_handles.len())
            .finish()
    }
}

impl SyncHandle {
    pub fn context(&self) -> &ConfigContext {
        &self.context
    }

    /// Cancels every loop and waits up to the configured grace period.
    ///
    /// In-flight long polls are dropped right away. Namespace workers finish
    /// the refresh they are in, including its cache write, unless the grace
    /// period runs out first; stragglers are aborted.
    pub async fn shutdown(self) {
        let SyncHandle {
            context,
            mut join_handles,
        } = self;
        context.inner.cancel.cancel();
        join_handles.extend(context.inner.workers().drain(..));

        let deadline = Instant::now() + context.config().shutdown_grace;
        let mut aborted = 0usize;
        for mut handle in join_handles {
            if timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "config-sync shutdown grace period elapsed; aborted remaining tasks");
        } else {
            info!("config-sync stopped");
        }
    }
}
