//! Admission Webhook Server
//!
//! Serves the mutating and validating admission endpoints for AppService
//! resources, together with health and metrics endpoints.

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use opentelemetry::{global, propagation::Extractor};
use tracing::{error, info, instrument, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::mutation::apply_mutations;
use super::validation;
use crate::crd::AppService;
use crate::error::{Error, Result};

struct HeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v: &HeaderValue| v.to_str().ok())
    }
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k: &HeaderName| k.as_str()).collect()
    }
}

async fn extract_trace_context(request: Request, next: Next) -> Response {
    let parent_cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });
    tracing::Span::current().set_parent(parent_cx);
    next.run(request).await
}

/// TLS configuration for the webhook server
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Path to TLS certificate (PEM)
    pub cert_path: String,
    /// Path to TLS private key (PEM)
    pub key_path: String,
}

/// Admission webhook server
#[derive(Default)]
pub struct WebhookServer {
    tls_config: Option<TlsConfig>,
}

type ReviewResponse = (StatusCode, Json<AdmissionReview<DynamicObject>>);

impl WebhookServer {
    /// Create a new webhook server
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve over TLS using the given PEM files
    pub fn with_tls(mut self, cert_path: String, key_path: String) -> Self {
        self.tls_config = Some(TlsConfig {
            cert_path,
            key_path,
        });
        self
    }

    pub fn router() -> Router {
        let router = Router::new()
            .route("/healthz", get(health_handler))
            .route("/mutate", post(mutate_handler))
            .route("/validate", post(validate_handler));

        #[cfg(feature = "metrics")]
        let router = router.route("/metrics", get(metrics_handler));

        router
            .layer(middleware::from_fn(extract_trace_context))
            .layer(tower_http::trace::TraceLayer::new_for_http())
    }

    /// Start the webhook server
    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        let app = Self::router();

        match self.tls_config {
            Some(tls) => {
                info!("Starting webhook server on {} (TLS)", addr);
                let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    &tls.cert_path,
                    &tls.key_path,
                )
                .await
                .map_err(|e| Error::WebhookError(format!("Failed to load TLS config: {e}")))?;

                axum_server::bind_rustls(addr, config)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| Error::WebhookError(format!("Server error: {e}")))?;
            }
            None => {
                info!("Starting webhook server on {}", addr);
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::WebhookError(format!("Failed to bind to {addr}: {e}")))?;

                axum::serve(listener, app)
                    .await
                    .map_err(|e| Error::WebhookError(format!("Server error: {e}")))?;
            }
        }

        Ok(())
    }
}

// HTTP Handlers

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    crate::controller::metrics::render()
}

fn invalid_review(e: impl std::fmt::Display) -> ReviewResponse {
    error!("Failed to parse admission request: {}", e);
    (
        StatusCode::BAD_REQUEST,
        Json(AdmissionResponse::invalid(format!("Invalid admission request: {e}")).into_review()),
    )
}

#[instrument(skip(review))]
async fn mutate_handler(Json(review): Json<AdmissionReview<AppService>>) -> ReviewResponse {
    let req: AdmissionRequest<AppService> = match review.try_into() {
        Ok(req) => req,
        Err(e) => return invalid_review(e),
    };

    let response = match mutate(&req) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to apply mutations: {}", e);
            AdmissionResponse::from(&req).deny(format!("Mutation failed: {e}"))
        }
    };

    (StatusCode::OK, Json(response.into_review()))
}

fn mutate(req: &AdmissionRequest<AppService>) -> Result<AdmissionResponse> {
    let response = AdmissionResponse::from(req);
    let Some(ops) = apply_mutations(req)? else {
        return Ok(response);
    };

    let patch: json_patch::Patch = serde_json::from_value(ops)?;
    info!("Applied mutations to AppService {}", req.name);
    response
        .with_patch(patch)
        .map_err(|e| Error::WebhookError(format!("Failed to serialize patch: {e}")))
}

#[instrument(skip(review))]
async fn validate_handler(Json(review): Json<AdmissionReview<AppService>>) -> ReviewResponse {
    let req: AdmissionRequest<AppService> = match review.try_into() {
        Ok(req) => req,
        Err(e) => return invalid_review(e),
    };

    // Corrections only reach the stored object through /mutate
    let repairable = req
        .object
        .clone()
        .is_some_and(|mut app| validation::validate(&req.operation, &mut app));
    if repairable {
        warn!("Replica count of {} is unusable and was not defaulted", req.name);
    }

    let response = AdmissionResponse::from(&req);
    info!("Validation result for {}: allowed", req.name);
    (StatusCode::OK, Json(response.into_review()))
}
