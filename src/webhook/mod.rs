//! Validating admission webhook for Synapse
//!
//! Rejects a `Synapse` unless exactly one of `spec.homeserver.configMap` and
//! `spec.homeserver.values` is set. Served over TLS because the API server
//! only calls webhooks over HTTPS.

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    DynamicObject,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::crd::Synapse;
use crate::error::{Error, Result};

/// Path registered in the ValidatingWebhookConfiguration.
pub const VALIDATE_PATH: &str = "/validate-synapse-opdev-io-v1alpha1-synapse";

pub fn router() -> Router {
    Router::new()
        .route(VALIDATE_PATH, post(validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
}

/// Serve the webhook until the process exits.
pub async fn run_server(config: WebhookConfig) -> Result<()> {
    let tls_config = RustlsConfig::from_pem_file(&config.webhook_cert, &config.webhook_key)
        .await
        .map_err(|e| {
            Error::ConfigError(format!(
                "cannot load webhook TLS material from {} and {}: {}",
                config.webhook_cert.display(),
                config.webhook_key.display(),
                e
            ))
        })?;

    serve(config.webhook_addr, tls_config).await
}

async fn serve(addr: SocketAddr, tls_config: RustlsConfig) -> Result<()> {
    info!(%addr, "Starting admission webhook server");
    axum_server::bind_rustls(addr, tls_config)
        .serve(router().into_make_service())
        .await
        .map_err(|e| Error::ConfigError(format!("webhook server error: {}", e)))
}

async fn validate_handler(
    Json(body): Json<AdmissionReview<Synapse>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Synapse> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(validate(&req).into_review())
}

/// Admission decision for a single request.
pub fn validate(req: &AdmissionRequest<Synapse>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let name = req.name.as_str();

    match req.operation {
        Operation::Create | Operation::Update => {}
        _ => return response,
    }

    let Some(synapse) = &req.object else {
        warn!(uid = %req.uid, "Admission request without an object");
        return response.deny("missing Synapse object in admission request");
    };

    match synapse.spec.validate() {
        Ok(()) => {
            debug!(%name, "Synapse admitted");
            response
        }
        Err(message) => {
            info!(%name, %message, "Synapse rejected");
            response.deny(message)
        }
    }
}
