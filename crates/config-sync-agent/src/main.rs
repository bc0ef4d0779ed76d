// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use config_sync_core::{
    status_json, ChangeSet, ConfigContext, CountingTelemetry, SyncSettings,
};

const DEFAULT_NAMESPACE: &str = "application";
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("CONFIG_SYNC_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let env_settings = SyncSettings::from_os_env();
    let settings = match env::var("CONFIG_SYNC_CONFIG_FILE") {
        Ok(path) => match SyncSettings::from_yaml_file(&path) {
            Ok(file_settings) => file_settings.merge(env_settings),
            Err(e) => {
                error!("Error loading config-sync configuration file {path}: {e}");
                return;
            }
        },
        Err(_) => env_settings,
    };

    let namespaces = settings
        .namespaces
        .clone()
        .filter(|namespaces| !namespaces.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_NAMESPACE.to_string()]);

    let config = match settings.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Error resolving config-sync configuration: {e}");
            return;
        }
    };

    let status_interval = env::var("CONFIG_SYNC_STATUS_INTERVAL_SECS")
        .ok()
        .and_then(|secs| secs.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS);

    let telemetry = CountingTelemetry::default();
    let context = match ConfigContext::builder(config)
        .telemetry(Arc::new(telemetry.clone()))
        .build()
    {
        Ok(context) => context,
        Err(e) => {
            error!("Error creating config-sync context: {e}");
            return;
        }
    };

    for namespace in &namespaces {
        let subscribed = context.subscribe(
            namespace,
            Arc::new(|changes: &ChangeSet| {
                let keys: Vec<&str> = changes.changed_keys().collect();
                info!(
                    namespace = changes.namespace(),
                    release_key = changes.release_key().unwrap_or_default(),
                    changed = ?keys,
                    "configuration changed"
                );
            }),
            Vec::<String>::new(),
            Vec::<String>::new(),
        );
        if let Err(e) = subscribed {
            error!("Skipping namespace {namespace}: {e}");
        }
    }

    let handle = context.start();
    info!(
        app_id = %context.config().app_id,
        namespaces = ?context.namespaces(),
        "config-sync agent started"
    );

    let mut status_ticker = interval(Duration::from_secs(status_interval));
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    status_ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Unable to listen for shutdown signal: {e}");
                }
                break;
            }
            _ = status_ticker.tick() => {
                info!(
                    status = %status_json(&context),
                    telemetry = %telemetry.counters().snapshot(),
                    "config-sync status"
                );
            }
        }
    }

    info!("Shutting down config-sync agent");
    handle.shutdown().await;
}
