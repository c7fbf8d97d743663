//! `pylon gateway`: run the central gateway
//!
//! Serves the bootstrap endpoints over TLS together with the agent-facing
//! collaborator routes (`/healthz`, `/api/agent/sync_rules`). The serving
//! certificate's Ed25519 key doubles as the token-signing key, so a client
//! that pins the certificate can verify token signatures with the same key.

use std::sync::Arc;
use std::time::Duration;

use aws_lc_rs::signature::Ed25519KeyPair;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{any, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tracing::{debug, info, warn};

use pylon_agent::rules::RuleGroup;
use pylon_bootstrap::BootstrapServer;
use pylon_common::config::{load_gateway_config, GatewayConfigSpec, StorageType};
use pylon_storage::crds::CrdStore;
use pylon_storage::etcd::EtcdBackend;
use pylon_storage::{ClusterStore, KeyringStoreBroker, LoggingClusterStore, TokenStore};

use crate::{CliError, GatewayArgs, Result};

pub async fn run(args: GatewayArgs) -> Result<()> {
    let config = load_gateway_config(&args.config)?;
    let spec = config.spec;

    let cert_pem = spec.certs.serving_cert_pem()?;
    let key_pem = spec.certs.serving_key_pem()?;
    let signing_key = signing_key_from_pem(&key_pem)?;

    match spec.storage.storage_type {
        StorageType::Etcd => {
            let etcd_spec = spec
                .storage
                .etcd
                .as_ref()
                .ok_or_else(|| CliError::Config("etcd storage is not configured".into()))?;
            let backend = Arc::new(EtcdBackend::connect(etcd_spec).await?);
            serve(&spec, cert_pem, key_pem, signing_key, backend).await
        }
        StorageType::CustomResources => {
            let cr_spec = spec.storage.custom_resources.as_ref().ok_or_else(|| {
                CliError::Config("custom resource storage is not configured".into())
            })?;
            let backend = Arc::new(CrdStore::new(&cr_spec.namespace).await?);
            serve(&spec, cert_pem, key_pem, signing_key, backend).await
        }
    }
}

/// Parse the Ed25519 signing key out of the serving key PEM
fn signing_key_from_pem(key_pem: &str) -> Result<Ed25519KeyPair> {
    let parsed = pem::parse(key_pem.as_bytes())
        .map_err(|e| CliError::Config(format!("invalid serving key PEM: {e}")))?;
    Ed25519KeyPair::from_pkcs8_maybe_unchecked(parsed.contents())
        .map_err(|_| CliError::Config("serving key is not an Ed25519 PKCS#8 key".into()))
}

async fn serve<B>(
    spec: &GatewayConfigSpec,
    cert_pem: String,
    key_pem: String,
    signing_key: Ed25519KeyPair,
    backend: Arc<B>,
) -> Result<()>
where
    B: TokenStore + ClusterStore + LoggingClusterStore + KeyringStoreBroker + Send + Sync + 'static,
{
    let bootstrap = Arc::new(BootstrapServer::new(
        signing_key,
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend,
    ));
    let app = gateway_router(bootstrap);

    let tls = RustlsConfig::from_pem(cert_pem.into_bytes(), key_pem.into_bytes())
        .await
        .map_err(|e| CliError::Config(format!("invalid serving certificate: {e}")))?;

    let address = normalize_listen_address(&spec.listen_address);
    let addr = address
        .parse()
        .map_err(|e| CliError::Config(format!("invalid listen address {address}: {e}")))?;

    let handle = Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down gateway");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });

    info!(address = %address, hostname = %spec.hostname, "gateway listening");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| CliError::Server(e.to_string()))
}

fn gateway_router(bootstrap: Arc<BootstrapServer>) -> Router {
    Router::new()
        .route("/healthz", any(|| async { StatusCode::OK }))
        .route("/api/agent/sync_rules", post(handle_sync_rules))
        .merge(bootstrap.router())
}

/// Collaborator endpoint: accept one rule-group YAML document per request
///
/// Ingestion into the metrics backend happens elsewhere; this surface only
/// validates and acknowledges so agents can stream.
async fn handle_sync_rules(headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    let yaml_content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/yaml"));
    if !yaml_content_type {
        return StatusCode::BAD_REQUEST;
    }

    match serde_yaml::from_slice::<RuleGroup>(&body) {
        Ok(group) => {
            debug!(group = %group.name, rules = group.rules.len(), "received rule group");
            StatusCode::ACCEPTED
        }
        Err(e) => {
            warn!(error = %e, "rejected malformed rule group");
            StatusCode::BAD_REQUEST
        }
    }
}

fn normalize_listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pylon_storage::memory::InMemoryBackend;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let rng = aws_lc_rs::rand::SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key = Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let bootstrap = Arc::new(BootstrapServer::new(
            key,
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend,
        ));
        gateway_router(bootstrap)
    }

    #[tokio::test]
    async fn healthz_returns_200() {
        let response = test_router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_rules_accepts_yaml_rule_groups() {
        let body = "name: api-alerts\nrules:\n- alert: High\n  expr: up == 0\n";
        let response = test_router()
            .oneshot(
                Request::post("/api/agent/sync_rules")
                    .header(header::CONTENT_TYPE, "application/yaml")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn sync_rules_rejects_wrong_content_type() {
        let response = test_router()
            .oneshot(
                Request::post("/api/agent/sync_rules")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_rules_rejects_malformed_yaml() {
        let response = test_router()
            .oneshot(
                Request::post("/api/agent/sync_rules")
                    .header(header::CONTENT_TYPE, "application/yaml")
                    .body(Body::from("rules: {not: [valid"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn signing_key_parses_from_pem() {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let parsed = signing_key_from_pem(&key.serialize_pem());
        assert!(parsed.is_ok());

        assert!(signing_key_from_pem("not a pem").is_err());
    }
}
