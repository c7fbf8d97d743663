//! The Pylon agent
//!
//! Runs next to a downstream cluster and relays its telemetry to the
//! gateway. Lifecycle: `Unbootstrapped -> Bootstrapping -> Ready ->
//! Shutdown`. On startup the agent loads its keyring from local storage; if
//! none exists it runs the configured bootstrapper and persists the result
//! with unbounded retry; losing a freshly minted keyring would brick this
//! agent forever, since the gateway already considers the cluster id
//! claimed.
//!
//! Once ready the agent serves `/healthz` and `/api/agent/push` (a
//! keyring-authenticated relay to the gateway) and streams rule-group
//! snapshots in the background.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use pylon_bootstrap::client::BootstrapError;
use pylon_bootstrap::Bootstrapper;
use pylon_common::config::{AgentConfig, AgentConfigSpec, StorageSpec, StorageType};
use pylon_common::core::Reference;
use pylon_common::ident::{get_provider, IdentError, IdentProvider};
use pylon_common::scope::RunScope;
use pylon_common::KEYRING_NAMESPACE_AGENT;
use pylon_keyring::Keyring;
use pylon_storage::crds::CrdStore;
use pylon_storage::etcd::EtcdBackend;
use pylon_storage::{KeyringStore, KeyringStoreBroker, StorageError};

pub mod client;
pub mod rules;

use client::GatewayHttpClient;
use rules::{RuleFinder, SyncConfig};

/// Header forwarded from remote-write pushes
const REMOTE_WRITE_VERSION: HeaderName =
    HeaderName::from_static("x-prometheus-remote-write-version");

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("error getting unique identifier: {0}")]
    Identity(#[from] IdentError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("error loading keyring: {0}")]
    Storage(#[from] StorageError),

    #[error("gateway client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("listen error: {0}")]
    Io(#[from] std::io::Error),
}

/// Agent lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Unbootstrapped,
    Bootstrapping,
    Ready,
    Shutdown,
}

/// Optional overrides applied at construction
#[derive(Default)]
pub struct AgentOptions {
    /// Bootstrapper used when no local keyring exists
    pub bootstrapper: Option<Arc<dyn Bootstrapper>>,
    /// Replaces the storage-backed keyring broker (tests)
    pub keyring_broker: Option<Arc<dyn KeyringStoreBroker>>,
    /// Replaces the identity provider from config (tests)
    pub ident_provider: Option<Arc<dyn IdentProvider>>,
    /// Replaces the Kubernetes rule finder (tests)
    pub rule_finder: Option<Arc<dyn RuleFinder>>,
    /// Sender-loop timing, defaulted for production
    pub sync_config: Option<SyncConfig>,
}

/// The agent process
pub struct Agent {
    spec: AgentConfigSpec,
    tenant_id: String,
    lifecycle: Arc<RwLock<LifecycleState>>,
    gateway_client: Arc<GatewayHttpClient>,
    rule_finder: Option<Arc<dyn RuleFinder>>,
    sync_config: SyncConfig,
    scope: RunScope,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl Agent {
    /// Construct the agent: resolve identity, load or bootstrap the
    /// keyring, and prepare the gateway client
    pub async fn new(config: AgentConfig, options: AgentOptions) -> Result<Self, AgentError> {
        let spec = config.spec;
        let lifecycle = Arc::new(RwLock::new(LifecycleState::Unbootstrapped));

        let ident: Arc<dyn IdentProvider> = match options.ident_provider {
            Some(provider) => provider,
            None => get_provider(&spec.identity_provider)
                .map_err(|e| AgentError::Config(e.to_string()))?
                .into(),
        };
        let tenant_id = ident.unique_identifier().await?;

        let broker = match options.keyring_broker {
            Some(broker) => broker,
            None => build_keyring_broker(&spec.storage).await?,
        };
        let keyring_store = broker
            .keyring_store(KEYRING_NAMESPACE_AGENT, &Reference::new(&tenant_id))
            .await?;

        *lifecycle.write().await = LifecycleState::Bootstrapping;
        let keyring = bootstrap_or_load(
            keyring_store.as_ref(),
            options.bootstrapper.as_deref(),
            ident.as_ref(),
        )
        .await?;
        *lifecycle.write().await = LifecycleState::Ready;

        if spec.gateway_address.is_empty() {
            return Err(AgentError::Config("gateway address not set".into()));
        }
        let gateway_client = Arc::new(GatewayHttpClient::new(
            &spec.gateway_address,
            &tenant_id,
            &keyring,
        )?);

        Ok(Self {
            spec,
            tenant_id,
            lifecycle,
            gateway_client,
            rule_finder: options.rule_finder,
            sync_config: options.sync_config.unwrap_or_default(),
            scope: RunScope::new(),
            shutdown_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.read().await
    }

    /// The agent's HTTP surface
    pub fn router(&self) -> Router {
        app_router(self.gateway_client.clone())
    }

    /// Serve the HTTP surface and run the rule streamer until shutdown
    pub async fn listen_and_serve(&self) -> Result<(), AgentError> {
        self.start_rule_streaming().await;

        let address = normalize_listen_address(&self.spec.listen_address);
        let listener = TcpListener::bind(&address).await?;
        info!(address = %address, cluster = %self.tenant_id, "agent listening");

        let cancel = self.scope.cancellation_token();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }

    async fn start_rule_streaming(&self) {
        let finder = match (&self.rule_finder, &self.spec.rules) {
            (Some(finder), _) => finder.clone(),
            (None, Some(rules_spec)) => {
                match build_rule_finder(rules_spec).await {
                    Ok(finder) => finder,
                    Err(e) => {
                        error!(error = %e, "failed to configure rule discovery");
                        return;
                    }
                }
            }
            (None, None) => {
                warn!("rule discovery is not configured, rule streaming disabled");
                return;
            }
        };

        let interval = self
            .spec
            .rules
            .as_ref()
            .map(|r| r.discovery.interval_or_default())
            .unwrap_or(Duration::from_secs(15 * 60));
        let cancel = self.scope.cancellation_token();
        let updates = rules::stream_rule_group_updates(cancel.clone(), finder, interval);
        self.scope.spawn(rules::stream_rules_to_gateway(
            cancel,
            self.gateway_client.clone(),
            updates,
            self.sync_config.clone(),
        ));
    }

    /// Stop serving and wait for background tasks; concurrent shutdowns are
    /// serialized
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        if self.scope.is_cancelled() {
            return;
        }
        *self.lifecycle.write().await = LifecycleState::Shutdown;
        self.scope.shutdown(Some(Duration::from_secs(10))).await;
        info!(cluster = %self.tenant_id, "agent stopped");
    }
}

/// Load the local keyring, bootstrapping first when none exists
///
/// A freshly bootstrapped keyring is persisted with unbounded retry at one
/// attempt per second: failing here would lose the only copy of the session
/// keys while the gateway already refuses the cluster id.
pub async fn bootstrap_or_load(
    store: &dyn KeyringStore,
    bootstrapper: Option<&dyn Bootstrapper>,
    ident: &dyn IdentProvider,
) -> Result<Keyring, AgentError> {
    let Some(bootstrapper) = bootstrapper else {
        info!("loading keyring");
        let keyring = store.get().await?;
        info!("keyring loaded successfully");
        return Ok(keyring);
    };

    match store.get().await {
        Err(StorageError::NotFound) => {
            info!("performing initial bootstrap");
            let new_keyring = bootstrapper.bootstrap(ident).await?;
            info!("bootstrap completed successfully");
            loop {
                // do not let this fail, or the keyring is lost forever
                match store.put(&new_keyring).await {
                    Ok(()) => break,
                    Err(e) => {
                        error!(error = %e, "failed to persist keyring (retry in 1 second)");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Err(e) => return Err(e.into()),
        Ok(_) => {
            warn!("this agent has already been bootstrapped but may have been interrupted - will use existing keyring");
        }
    }

    info!("running post-bootstrap finalization steps");
    if let Err(e) = bootstrapper.finalize().await {
        error!(error = %e, "error in post-bootstrap finalization");
    }

    let keyring = store.get().await?;
    info!("keyring loaded successfully");
    Ok(keyring)
}

/// Shared state behind the HTTP handlers
struct AppState {
    gateway_client: Arc<GatewayHttpClient>,
}

fn app_router(gateway_client: Arc<GatewayHttpClient>) -> Router {
    Router::new()
        .route("/healthz", any(|| async { StatusCode::OK }))
        .route("/api/agent/push", post(handle_push))
        // remote-write batches are routinely larger than the default limit
        .layer(axum::extract::DefaultBodyLimit::disable())
        .with_state(Arc::new(AppState { gateway_client }))
}

/// Relay a remote-write push to the gateway, mirroring its status code
async fn handle_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = state
        .gateway_client
        .post("/api/agent/push")
        .forward_header(header::CONTENT_TYPE, &headers)
        .forward_header(header::CONTENT_LENGTH, &headers)
        .forward_header(header::CONTENT_ENCODING, &headers)
        .forward_header(REMOTE_WRITE_VERSION, &headers)
        .body(body.to_vec())
        .send()
        .await;

    match result {
        Ok((status, body)) => {
            let status = StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, body).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to forward push to gateway");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Accept Go-style `:8080` listen addresses
fn normalize_listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

async fn build_keyring_broker(
    spec: &StorageSpec,
) -> Result<Arc<dyn KeyringStoreBroker>, AgentError> {
    match spec.storage_type {
        StorageType::Etcd => {
            let etcd_spec = spec
                .etcd
                .as_ref()
                .ok_or_else(|| AgentError::Config("etcd storage is not configured".into()))?;
            Ok(Arc::new(EtcdBackend::connect(etcd_spec).await?))
        }
        StorageType::CustomResources => {
            let cr_spec = spec.custom_resources.as_ref().ok_or_else(|| {
                AgentError::Config("custom resource storage is not configured".into())
            })?;
            Ok(Arc::new(CrdStore::new(&cr_spec.namespace).await?))
        }
    }
}

async fn build_rule_finder(
    rules_spec: &pylon_common::config::RulesSpec,
) -> Result<Arc<dyn RuleFinder>, AgentError> {
    let Some(prom) = &rules_spec.discovery.prometheus_rules else {
        return Err(AgentError::Config(
            "prometheusRules discovery is not configured".into(),
        ));
    };

    let client = match &prom.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .map_err(|e| AgentError::Config(format!("failed to read kubeconfig: {e}")))?;
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                .await
                .map_err(|e| AgentError::Config(format!("invalid kubeconfig: {e}")))?;
            kube::Client::try_from(config)
                .map_err(|e| AgentError::Config(format!("failed to create k8s client: {e}")))?
        }
        None => kube::Client::try_default()
            .await
            .map_err(|e| AgentError::Config(format!("failed to create k8s client: {e}")))?,
    };

    Ok(Arc::new(rules::PrometheusRuleFinder::new(
        client,
        prom.search_namespaces.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use pylon_keyring::keyring::{Key, SharedKeys};
    use pylon_storage::memory::InMemoryBackend;
    use pylon_storage::Result as StorageResult;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tower::ServiceExt;

    struct FixedIdent(&'static str);

    #[async_trait]
    impl IdentProvider for FixedIdent {
        async fn unique_identifier(&self) -> Result<String, IdentError> {
            Ok(self.0.to_string())
        }
    }

    fn test_keyring() -> Keyring {
        Keyring::new([Key::SharedKeys(SharedKeys {
            client_key: vec![1u8; 32],
            server_key: vec![2u8; 32],
        })])
    }

    struct CountingBootstrapper {
        calls: AtomicU32,
        finalized: AtomicU32,
    }

    impl CountingBootstrapper {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                finalized: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Bootstrapper for CountingBootstrapper {
        async fn bootstrap(&self, _ident: &dyn IdentProvider) -> Result<Keyring, BootstrapError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(test_keyring())
        }

        async fn finalize(&self) -> Result<(), BootstrapError> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Keyring store whose first `fail_puts` puts fail
    struct FlakyKeyringStore {
        inner: Arc<dyn KeyringStore>,
        remaining_failures: AtomicU32,
        puts: AtomicU32,
    }

    #[async_trait]
    impl KeyringStore for FlakyKeyringStore {
        async fn put(&self, keyring: &Keyring) -> StorageResult<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Unavailable("induced put failure".into()));
            }
            self.inner.put(keyring).await
        }

        async fn get(&self) -> StorageResult<Keyring> {
            self.inner.get().await
        }
    }

    async fn memory_keyring_store() -> Arc<dyn KeyringStore> {
        InMemoryBackend::new()
            .keyring_store(KEYRING_NAMESPACE_AGENT, &Reference::new("agent-1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_boot_bootstraps_and_persists() {
        let store = memory_keyring_store().await;
        let bootstrapper = CountingBootstrapper::new();

        let keyring = bootstrap_or_load(store.as_ref(), Some(&bootstrapper), &FixedIdent("agent-1"))
            .await
            .unwrap();
        assert!(keyring.shared_keys().is_some());
        assert_eq!(bootstrapper.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bootstrapper.finalized.load(Ordering::SeqCst), 1);

        // persisted: a later load without a bootstrapper succeeds
        let loaded = bootstrap_or_load(store.as_ref(), None, &FixedIdent("agent-1"))
            .await
            .unwrap();
        assert_eq!(loaded, keyring);
    }

    #[tokio::test]
    async fn existing_keyring_skips_the_exchange() {
        let store = memory_keyring_store().await;
        store.put(&test_keyring()).await.unwrap();

        let bootstrapper = CountingBootstrapper::new();
        let keyring = bootstrap_or_load(store.as_ref(), Some(&bootstrapper), &FixedIdent("agent-1"))
            .await
            .unwrap();
        assert_eq!(keyring, test_keyring());
        assert_eq!(
            bootstrapper.calls.load(Ordering::SeqCst),
            0,
            "interrupted-but-bootstrapped agents must not re-enroll"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keyring_persistence_retries_until_it_lands() {
        let store = memory_keyring_store().await;
        let flaky = FlakyKeyringStore {
            inner: store.clone(),
            remaining_failures: AtomicU32::new(2),
            puts: AtomicU32::new(0),
        };
        let bootstrapper = CountingBootstrapper::new();

        let keyring = bootstrap_or_load(&flaky, Some(&bootstrapper), &FixedIdent("agent-1"))
            .await
            .unwrap();
        assert!(keyring.shared_keys().is_some());
        assert_eq!(flaky.puts.load(Ordering::SeqCst), 3, "two failures, one success");
        // the keyring landed in the real store
        assert!(store.get().await.is_ok());
    }

    #[tokio::test]
    async fn missing_keyring_without_bootstrapper_is_an_error() {
        let store = memory_keyring_store().await;
        let result = bootstrap_or_load(store.as_ref(), None, &FixedIdent("agent-1")).await;
        assert!(matches!(
            result,
            Err(AgentError::Storage(StorageError::NotFound))
        ));
    }

    fn router_for_gateway(address: &str) -> Router {
        let client =
            Arc::new(GatewayHttpClient::new(address, "agent-1", &test_keyring()).unwrap());
        app_router(client)
    }

    #[tokio::test]
    async fn healthz_is_always_200() {
        let router = router_for_gateway("http://127.0.0.1:1");
        for method in ["GET", "POST", "HEAD"] {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri("/healthz")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "method {method}");
        }
    }

    #[tokio::test]
    async fn push_forwards_allowed_headers_and_mirrors_the_status() {
        use axum::routing::post;
        use std::sync::Mutex;

        #[derive(Default)]
        struct Captured {
            headers: Mutex<Option<HeaderMap>>,
            body: Mutex<Vec<u8>>,
        }

        let captured = Arc::new(Captured::default());
        let capture = captured.clone();
        let gateway = Router::new().route(
            "/api/agent/push",
            post(move |headers: HeaderMap, body: Bytes| {
                let capture = capture.clone();
                async move {
                    *capture.headers.lock().unwrap() = Some(headers);
                    *capture.body.lock().unwrap() = body.to_vec();
                    StatusCode::IM_A_TEAPOT
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, gateway).await.unwrap();
        });

        let router = router_for_gateway(&format!("http://{addr}"));
        let response = router
            .oneshot(
                Request::post("/api/agent/push")
                    .header("content-type", "application/x-protobuf")
                    .header("content-encoding", "snappy")
                    .header("x-prometheus-remote-write-version", "0.1.0")
                    .header("x-unrelated-header", "must-not-cross")
                    .body(Body::from("remote write payload"))
                    .unwrap(),
            )
            .await
            .unwrap();

        // the gateway's status is mirrored back
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

        let headers = captured.headers.lock().unwrap().clone().unwrap();
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/x-protobuf"
        );
        assert_eq!(headers.get("content-encoding").unwrap(), "snappy");
        assert_eq!(
            headers.get("x-prometheus-remote-write-version").unwrap(),
            "0.1.0"
        );
        assert!(headers.get("x-unrelated-header").is_none());
        // the MAC scheme authenticates every relayed call
        let auth = headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("MAC id=\"agent-1\""));

        assert_eq!(*captured.body.lock().unwrap(), b"remote write payload");
    }

    #[tokio::test]
    async fn agent_reaches_ready_and_serves_health() {
        let backend = InMemoryBackend::new();
        let config = AgentConfig {
            spec: AgentConfigSpec {
                listen_address: "127.0.0.1:0".into(),
                gateway_address: "http://127.0.0.1:1".into(),
                identity_provider: "hostname".into(),
                storage: Default::default(),
                rules: None,
            },
        };
        let agent = Agent::new(
            config,
            AgentOptions {
                bootstrapper: Some(Arc::new(CountingBootstrapper::new())),
                keyring_broker: Some(Arc::new(backend)),
                ident_provider: Some(Arc::new(FixedIdent("agent-1"))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(agent.lifecycle().await, LifecycleState::Ready);
        assert_eq!(agent.tenant_id(), "agent-1");

        let response = agent
            .router()
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        agent.shutdown().await;
        assert_eq!(agent.lifecycle().await, LifecycleState::Shutdown);
    }

    #[test]
    fn listen_addresses_accept_the_short_form() {
        assert_eq!(normalize_listen_address(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_listen_address("127.0.0.1:9090"), "127.0.0.1:9090");
    }
}
