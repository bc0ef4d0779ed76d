//! Discovery of configuration service instances.
//!
//! The locator keeps the list of reachable instances in an `ArcSwap`, so
//! readers never block while a refresh replaces it wholesale. A failed
//! discovery call keeps the previous list; only a successful response with an
//! empty list clears it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{build_url, HttpClient, HttpError, HttpOutcome};

/// Minimum spacing between failure-triggered discovery refreshes.
const MIN_ON_DEMAND_REFRESH_SPACING: Duration = Duration::from_secs(1);

/// One reachable configuration service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    pub instance_id: String,
    #[serde(alias = "homepageUrl")]
    pub base_url: String,
}

impl ServiceEndpoint {
    pub fn new(instance_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            base_url: base_url.into(),
        }
    }
}

/// Policy picking one endpoint among the known ones.
///
/// Implementations are not expected to track health; callers retry against
/// another endpoint when the chosen one fails.
pub trait EndpointSelector: Send + Sync + fmt::Debug {
    fn select<'a>(&self, candidates: &'a [ServiceEndpoint]) -> Option<&'a ServiceEndpoint>;
}

/// Uniform random selection.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl EndpointSelector for RandomSelector {
    fn select<'a>(&self, candidates: &'a [ServiceEndpoint]) -> Option<&'a ServiceEndpoint> {
        if candidates.is_empty() {
            None
        } else {
            candidates.get(fastrand::usize(..candidates.len()))
        }
    }
}

/// Settings consumed by the [`ServiceLocator`].
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Meta-discovery base URL.
    pub meta_server: String,
    pub app_id: String,
    pub client_ip: Option<String>,
    /// Fixed instance URLs; when non-empty, discovery is skipped entirely.
    pub static_endpoints: Vec<String>,
    pub refresh_interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct ServiceLocator {
    http: HttpClient,
    config: LocatorConfig,
    endpoints: ArcSwap<Vec<ServiceEndpoint>>,
    selector: Arc<dyn EndpointSelector>,
    last_refresh: Mutex<Option<Instant>>,
}

impl ServiceLocator {
    pub fn new(http: HttpClient, config: LocatorConfig, selector: Arc<dyn EndpointSelector>) -> Self {
        let initial: Vec<ServiceEndpoint> = config
            .static_endpoints
            .iter()
            .enumerate()
            .map(|(idx, url)| ServiceEndpoint::new(format!("static-{idx}"), url.clone()))
            .collect();
        Self {
            http,
            config,
            endpoints: ArcSwap::from_pointee(initial),
            selector,
            last_refresh: Mutex::new(None),
        }
    }

    fn is_static(&self) -> bool {
        !self.config.static_endpoints.is_empty()
    }

    /// Currently known endpoints; never blocks.
    pub fn list_endpoints(&self) -> Arc<Vec<ServiceEndpoint>> {
        self.endpoints.load_full()
    }

    /// Picks an endpoint, preferring ones not in `tried`.
    ///
    /// When every known endpoint has been tried, any of them may be returned
    /// again so that retries can continue against a single-instance fleet.
    pub fn pick(&self, tried: &HashSet<String>) -> Option<ServiceEndpoint> {
        let endpoints = self.endpoints.load();
        let untried: Vec<ServiceEndpoint> = endpoints
            .iter()
            .filter(|endpoint| !tried.contains(&endpoint.instance_id))
            .cloned()
            .collect();
        let pool: &[ServiceEndpoint] = if untried.is_empty() {
            &endpoints
        } else {
            &untried
        };
        self.selector.select(pool).cloned()
    }

    /// Picks an endpoint, running discovery first when none is known.
    pub async fn pick_or_discover(&self, tried: &HashSet<String>) -> Option<ServiceEndpoint> {
        if self.endpoints.load().is_empty() {
            if let Err(err) = self.refresh().await {
                debug!(%err, "config-sync discovery failed while no endpoint is known");
            }
        }
        self.pick(tried)
    }

    /// Queries the meta server and replaces the endpoint list.
    pub async fn refresh(&self) -> Result<Arc<Vec<ServiceEndpoint>>, HttpError> {
        if self.is_static() {
            return Ok(self.list_endpoints());
        }
        let mut last_refresh = self.last_refresh.lock().await;
        *last_refresh = Some(Instant::now());

        let mut url = build_url(&self.config.meta_server, &["services", "config"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("appId", &self.config.app_id);
            if let Some(ip) = &self.config.client_ip {
                query.append_pair("ip", ip);
            }
        }

        let outcome = self
            .http
            .get_json::<Vec<ServiceEndpoint>>(url, self.config.timeout)
            .await;
        match outcome {
            Ok(HttpOutcome::Body(list)) => {
                let previous = self.endpoints.load();
                if list.is_empty() && !previous.is_empty() {
                    warn!("config-sync discovery returned no instances; clearing endpoint list");
                } else if *previous.as_ref() != list {
                    info!(count = list.len(), "config-sync discovered configuration service instances");
                }
                let list = Arc::new(list);
                self.endpoints.store(list.clone());
                Ok(list)
            }
            Ok(HttpOutcome::NotModified) => Ok(self.list_endpoints()),
            Ok(HttpOutcome::NotFound) => {
                let err = HttpError::Client(404);
                warn!(%err, "config-sync discovery endpoint missing; keeping previous instances");
                Err(err)
            }
            Err(err) => {
                warn!(%err, "config-sync discovery failed; keeping previous instances");
                Err(err)
            }
        }
    }

    /// Refreshes after a fetch failure, unless a refresh ran very recently.
    pub async fn refresh_on_failure(&self) {
        if self.is_static() {
            return;
        }
        {
            let last = self.last_refresh.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < MIN_ON_DEMAND_REFRESH_SPACING {
                    return;
                }
            }
        }
        let _ = self.refresh().await;
    }

    /// Periodic discovery loop; exits when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.is_static() {
            debug!("config-sync using static configuration service endpoints");
            return;
        }
        loop {
            let _ = self.refresh().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("config-sync discovery loop shutting down");
                    break;
                }
                _ = sleep(self.config.refresh_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClientOptions;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn locator_for(server: &Server) -> ServiceLocator {
        ServiceLocator::new(
            HttpClient::new(HttpClientOptions::default()).expect("client"),
            LocatorConfig {
                meta_server: server.url_str(""),
                app_id: "demo".into(),
                client_ip: Some("10.0.0.1".into()),
                static_endpoints: Vec::new(),
                refresh_interval: Duration::from_secs(300),
                timeout: Duration::from_secs(1),
            },
            Arc::new(RandomSelector),
        )
    }

    #[tokio::test]
    async fn discovery_replaces_the_endpoint_list() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/services/config"),
                request::query(url_decoded(contains(("appId", "demo")))),
                request::query(url_decoded(contains(("ip", "10.0.0.1")))),
            ])
            .respond_with(json_encoded(json!([
                {"instanceId": "a", "homepageUrl": "http://a:8080/"},
                {"instanceId": "b", "baseUrl": "http://b:8080/"}
            ]))),
        );
        let locator = locator_for(&server);
        let endpoints = locator.refresh().await.expect("discovery");
        assert_eq!(
            endpoints.as_ref(),
            &vec![
                ServiceEndpoint::new("a", "http://a:8080/"),
                ServiceEndpoint::new("b", "http://b:8080/")
            ]
        );
    }

    #[tokio::test]
    async fn failed_discovery_keeps_previous_list_and_empty_list_clears_it() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/services/config"))
                .times(3)
                .respond_with(httptest::cycle![
                    json_encoded(json!([{"instanceId": "a", "baseUrl": "http://a/"}])),
                    status_code(500),
                    json_encoded(json!([])),
                ]),
        );
        let locator = locator_for(&server);
        locator.refresh().await.expect("first discovery");
        assert_eq!(locator.list_endpoints().len(), 1);

        assert!(matches!(
            locator.refresh().await,
            Err(HttpError::Retryable(500))
        ));
        assert_eq!(locator.list_endpoints().len(), 1);

        locator.refresh().await.expect("empty discovery");
        assert!(locator.list_endpoints().is_empty());
    }

    #[test]
    fn pick_prefers_untried_endpoints() {
        let locator = ServiceLocator::new(
            HttpClient::new(HttpClientOptions::default()).expect("client"),
            LocatorConfig {
                meta_server: "http://unused/".into(),
                app_id: "demo".into(),
                client_ip: None,
                static_endpoints: vec!["http://one/".into(), "http://two/".into()],
                refresh_interval: Duration::from_secs(300),
                timeout: Duration::from_secs(1),
            },
            Arc::new(RandomSelector),
        );
        let mut tried = HashSet::new();
        tried.insert("static-0".to_string());
        for _ in 0..20 {
            let picked = locator.pick(&tried).expect("endpoint");
            assert_eq!(picked.instance_id, "static-1");
        }
        tried.insert("static-1".to_string());
        assert!(locator.pick(&tried).is_some());
    }

    #[test]
    fn random_selector_handles_empty_candidates() {
        assert!(RandomSelector.select(&[]).is_none());
    }
}
