//! Synchronisation service facade.
//!
//! [`ConfigContext`] is the entry point; the submodules implement the
//! per-namespace worker, the listener-facing view and runtime settings.

pub(crate) mod config;
mod context;
pub(crate) mod namespace;
pub(crate) mod telemetry;
#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod view;

pub use config::{FallbackPolicy, SyncConfig};
pub use context::{
    normalize_namespace, ConfigContext, ConfigContextBuilder, SubscriptionHandle, SyncError,
    SyncHandle, MAX_NAMESPACE_LEN,
};
pub use namespace::{NamespaceSync, RefreshOutcome};
pub use telemetry::{NoopTelemetry, SyncTelemetry};
pub use view::{ConfigChangeListener, ListenerFilter, SnapshotView};
