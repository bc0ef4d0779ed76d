//! Consumer-facing snapshot view with change-listener dispatch.
//!
//! Both the current snapshot and the listener registry live behind `ArcSwap`:
//! reads are lock-free and never observe a half-applied update, and
//! subscribing never blocks a dispatch in progress.

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexSet;
use tracing::{error, warn};

use super::telemetry::SyncTelemetry;
use crate::format::{ConfigFileFormat, FormatError};
use crate::snapshot::{ChangeSet, ConfigEntries, Snapshot, SourceType};

/// Callback invoked with each accepted change of a namespace.
///
/// Runs on the namespace's refresh task; long work should be handed off.
pub trait ConfigChangeListener: Send + Sync {
    fn on_change(&self, changes: &ChangeSet);
}

impl<F> ConfigChangeListener for F
where
    F: Fn(&ChangeSet) + Send + Sync,
{
    fn on_change(&self, changes: &ChangeSet) {
        self(changes)
    }
}

/// Restricts which change sets reach a listener.
///
/// An empty filter matches everything; otherwise a change set matches when any
/// changed key is listed in `keys` or starts with one of `prefixes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerFilter {
    keys: HashSet<String>,
    prefixes: Vec<String>,
}

impl ListenerFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<K, P>(keys: K, prefixes: P) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.prefixes.is_empty()
    }

    pub fn matches(&self, changes: &ChangeSet) -> bool {
        if self.is_empty() {
            return true;
        }
        changes.changed_keys().any(|key| {
            self.keys.contains(key) || self.prefixes.iter().any(|prefix| key.starts_with(prefix))
        })
    }
}

struct Registration {
    id: u64,
    listener: Arc<dyn ConfigChangeListener>,
    filter: ListenerFilter,
}

pub struct SnapshotView {
    namespace: String,
    format: ConfigFileFormat,
    current: ArcSwap<Snapshot>,
    listeners: ArcSwap<Vec<Arc<Registration>>>,
    next_listener_id: AtomicU64,
    telemetry: Arc<dyn SyncTelemetry>,
}

impl fmt::Debug for SnapshotView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.current.load();
        f.debug_struct("SnapshotView")
            .field("namespace", &self.namespace)
            .field("format", &self.format)
            .field("release_key", &snapshot.release_key)
            .field("source", &snapshot.source)
            .field("listeners", &self.listeners.load().len())
            .finish()
    }
}

impl SnapshotView {
    pub fn new(initial: Snapshot, telemetry: Arc<dyn SyncTelemetry>) -> Self {
        Self {
            namespace: initial.namespace.clone(),
            format: ConfigFileFormat::from_namespace(&initial.namespace),
            current: ArcSwap::from_pointee(initial),
            listeners: ArcSwap::from_pointee(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            telemetry,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn format(&self) -> ConfigFileFormat {
        self.format
    }

    /// The current snapshot; never blocks.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn release_key(&self) -> Option<String> {
        self.current.load().release_key.clone()
    }

    pub fn source_type(&self) -> SourceType {
        self.current.load().source
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.current.load().get(key).map(str::to_string)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Parses the value of `key`; unparseable values are logged and yield `None`.
    pub fn get_parsed<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.get(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    namespace = %self.namespace,
                    key,
                    value = %raw,
                    %err,
                    "config-sync could not parse configuration value"
                );
                None
            }
        }
    }

    pub fn get_parsed_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get_parsed(key).unwrap_or(default)
    }

    /// Splits the value of `key` on `delimiter`, trimming items and dropping empty ones.
    pub fn get_list(&self, key: &str, delimiter: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(delimiter)
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys of the current snapshot, in snapshot order.
    pub fn keys(&self) -> IndexSet<String> {
        self.current.load().keys().map(str::to_string).collect()
    }

    /// The namespace rendered as one document (see [`ConfigFileFormat::content`]).
    pub fn content(&self) -> Option<String> {
        self.format.content(&self.current.load().entries)
    }

    pub fn as_properties(&self) -> Result<ConfigEntries, FormatError> {
        self.format.as_properties(&self.current.load().entries)
    }

    /// Registers `listener`, returning the id used to unsubscribe.
    pub fn subscribe(&self, listener: Arc<dyn ConfigChangeListener>, filter: ListenerFilter) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            id,
            listener,
            filter,
        });
        self.listeners.rcu(|current| {
            let mut next = current.as_ref().clone();
            next.push(registration.clone());
            next
        });
        id
    }

    /// Removes the listener registered under `id`; false if unknown.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|registration| registration.id != id)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    /// Swaps in `snapshot`, returning the one it replaced.
    pub(crate) fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        self.current.swap(Arc::new(snapshot))
    }

    /// Delivers `changes` to every matching listener; returns how many ran to completion.
    ///
    /// A panicking listener is logged and skipped; the others still run.
    pub(crate) fn dispatch(&self, changes: &ChangeSet) -> usize {
        if changes.is_empty() {
            return 0;
        }
        let listeners = self.listeners.load_full();
        let mut delivered = 0;
        for registration in listeners.iter() {
            if !registration.filter.matches(changes) {
                continue;
            }
            let listener = &registration.listener;
            match catch_unwind(AssertUnwindSafe(|| listener.on_change(changes))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        namespace = %self.namespace,
                        listener_id = registration.id,
                        panic = panic_message(panic.as_ref()),
                        "config-sync change listener panicked"
                    );
                    self.telemetry.on_listener_panic(&self.namespace);
                }
            }
        }
        delivered
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::NoopTelemetry;
    use crate::snapshot::ChangeType;
    use crate::telemetry::CountingTelemetry;
    use std::sync::Mutex;

    fn snapshot(release: &str, pairs: &[(&str, &str)]) -> Snapshot {
        Snapshot::new(
            "application",
            release,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            SourceType::Remote,
        )
    }

    fn view(pairs: &[(&str, &str)]) -> SnapshotView {
        SnapshotView::new(snapshot("r1", pairs), Arc::new(NoopTelemetry))
    }

    #[test]
    fn typed_getters_parse_and_fall_back() {
        let view = view(&[
            ("port", " 8080 "),
            ("ratio", "abc"),
            ("hosts", "a, b,,c "),
            ("enabled", "true"),
        ]);
        assert_eq!(view.get_parsed::<u16>("port"), Some(8080));
        assert_eq!(view.get_parsed::<f64>("ratio"), None);
        assert_eq!(view.get_parsed_or("ratio", 0.5), 0.5);
        assert!(view.get_parsed_or("enabled", false));
        assert_eq!(view.get_or("missing", "fallback"), "fallback");
        assert_eq!(view.get_list("hosts", ","), vec!["a", "b", "c"]);
        assert!(view.get_list("missing", ",").is_empty());
        assert_eq!(
            view.keys().into_iter().collect::<Vec<_>>(),
            vec!["port", "ratio", "hosts", "enabled"]
        );
    }

    #[test]
    fn filters_select_listeners_by_key_or_prefix() {
        let view = view(&[]);
        let hits = Arc::new(Mutex::new(Vec::new()));
        for (label, filter) in [
            ("all", ListenerFilter::all()),
            ("key", ListenerFilter::new(["db.url"], Vec::<String>::new())),
            ("prefix", ListenerFilter::new(Vec::<String>::new(), ["cache."])),
        ] {
            let hits = hits.clone();
            view.subscribe(
                Arc::new(move |_: &ChangeSet| hits.lock().expect("lock").push(label)),
                filter,
            );
        }

        let previous = view.snapshot();
        let next = snapshot("r2", &[("cache.ttl", "5")]);
        let changes = ChangeSet::diff(&previous, &next);
        view.replace(next);
        assert_eq!(view.dispatch(&changes), 2);
        assert_eq!(*hits.lock().expect("lock"), vec!["all", "prefix"]);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let telemetry = CountingTelemetry::default();
        let view = SnapshotView::new(snapshot("r1", &[]), Arc::new(telemetry.clone()));
        let seen = Arc::new(Mutex::new(None));
        view.subscribe(
            Arc::new(|_: &ChangeSet| panic!("listener failure")),
            ListenerFilter::all(),
        );
        let seen_clone = seen.clone();
        view.subscribe(
            Arc::new(move |changes: &ChangeSet| {
                *seen_clone.lock().expect("lock") =
                    changes.get("k").map(|change| change.change_type);
            }),
            ListenerFilter::all(),
        );

        let changes = ChangeSet::diff(&view.snapshot(), &snapshot("r2", &[("k", "v")]));
        assert_eq!(view.dispatch(&changes), 1);
        assert_eq!(*seen.lock().expect("lock"), Some(ChangeType::Added));
        assert_eq!(telemetry.counters().snapshot().listener_panics, 1);
    }

    #[test]
    fn unsubscribe_removes_only_the_given_listener() {
        let view = view(&[]);
        let first = view.subscribe(Arc::new(|_: &ChangeSet| {}), ListenerFilter::all());
        let second = view.subscribe(Arc::new(|_: &ChangeSet| {}), ListenerFilter::all());
        assert_ne!(first, second);
        assert!(view.unsubscribe(first));
        assert!(!view.unsubscribe(first));
        assert_eq!(view.listener_count(), 1);
    }

    #[test]
    fn structured_namespaces_expose_content_and_properties() {
        let view = SnapshotView::new(
            Snapshot::new(
                "datasource.yml",
                "r1",
                [("content".to_string(), "db:\n  url: x\n".to_string())]
                    .into_iter()
                    .collect(),
                SourceType::Remote,
            ),
            Arc::new(NoopTelemetry),
        );
        assert_eq!(view.format(), ConfigFileFormat::Yml);
        assert_eq!(view.content().as_deref(), Some("db:\n  url: x\n"));
        let flat = view.as_properties().expect("yaml");
        assert_eq!(flat.get("db.url").map(String::as_str), Some("x"));
    }
}
