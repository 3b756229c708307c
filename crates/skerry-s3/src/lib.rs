//! S3-compatible HTTP API for Skerry.
//!
//! Provides an [`S3Server`] exposing the bucket-level subset of the AWS
//! S3 protocol handled by the core:
//!
//! - `GET /` — ListBuckets (federated listing when DNS is configured)
//! - `PUT /{bucket}` — CreateBucket (`?object-lock`, `?tagging` variants)
//! - `GET /{bucket}` — `?location`, `?uploads`, `?policyStatus`,
//!   `?object-lock`, `?tagging`
//! - `HEAD /{bucket}` — HeadBucket (errors signaled via headers)
//! - `DELETE /{bucket}` — DeleteBucket (`?tagging` variant,
//!   `x-skerry-force-delete`)
//! - `POST /{bucket}?delete` — bulk delete
//! - `POST /{bucket}` — browser upload (policy form), including fan-out
//!   via the `x-skerry-fanout-list` form field
//!
//! Every handler runs the same five-phase envelope: request-scoped
//! context and deferred audit log, object-layer readiness gate, policy
//! authorization, body parse under size caps, then the XML response and
//! asynchronous domain events.

mod error;
mod fanout;
mod handlers;
mod post_policy;
mod xml;

#[cfg(test)]
mod tests;

use std::sync::{Arc, OnceLock};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, put};
use axum::Router;
use skerry_object::services::CoreServices;
use skerry_object::ObjectLayer;

pub use error::{to_api_error, ApiError, ERR_CODE_HEADER, ERR_DESC_HEADER};
pub use fanout::{FanOutEntry, FanOutResponse};

/// Maximum entries accepted by one multi-delete request.
pub const MAX_DELETE_LIST: usize = 1000;

/// Maximum multi-delete body: 100 000 keys of up to 1024 bytes plus XML
/// overhead.
pub const MAX_DELETE_BODY: u64 = 200_000 * 1024 * 2;

/// In-memory cap on the combined non-file fields of a policy form.
pub const MAX_FORM_MEMORY: u64 = 10 * 1024 * 1024;

/// Maximum parts in a policy form.
pub const MAX_FORM_PARTS: usize = 1000;

/// Shared state for all S3 handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    /// The object layer, set once startup completes. Requests arriving
    /// earlier fail with `ServerNotInitialized`.
    pub layer: Arc<OnceLock<Arc<dyn ObjectLayer>>>,
    /// External collaborators.
    pub services: CoreServices,
}

impl AppState {
    pub(crate) fn layer(&self) -> Result<Arc<dyn ObjectLayer>, ApiError> {
        self.layer
            .get()
            .cloned()
            .ok_or_else(ApiError::server_not_initialized)
    }
}

/// Configuration for creating an [`S3Server`].
pub struct S3ServerConfig {
    /// External collaborators.
    pub services: CoreServices,
}

/// The S3 API server. The object layer is attached separately once the
/// storage backend finishes initializing.
pub struct S3Server {
    router: Router,
    layer_slot: Arc<OnceLock<Arc<dyn ObjectLayer>>>,
}

impl S3Server {
    /// Create a server with an uninitialized object layer.
    pub fn new(config: S3ServerConfig) -> Self {
        let layer_slot: Arc<OnceLock<Arc<dyn ObjectLayer>>> = Arc::new(OnceLock::new());
        let state = AppState {
            layer: layer_slot.clone(),
            services: config.services,
        };
        Self {
            router: Self::build_router(state),
            layer_slot,
        }
    }

    /// Attach the object layer; requests start succeeding once this runs.
    pub fn set_object_layer(&self, layer: Arc<dyn ObjectLayer>) {
        // A second initialization is a startup bug.
        if self.layer_slot.set(layer).is_err() {
            tracing::error!("object layer initialized twice");
        }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/", get(handlers::list_buckets_handler))
            // GET also answers HEAD; the dispatcher inspects the method so
            // HEAD errors go out as headers instead of a body.
            .route(
                "/{bucket}",
                put(handlers::put_bucket_handler)
                    .get(handlers::bucket_get_dispatch)
                    .delete(handlers::delete_bucket_handler)
                    .post(handlers::bucket_post_dispatch),
            )
            // 5 GiB: the S3 single-POST plaintext cap.
            .layer(DefaultBodyLimit::max(5 * 1024 * 1024 * 1024))
            .with_state(state)
    }

    /// Return the inner router (for `tower::ServiceExt` tests).
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve on `addr` until `shutdown` completes.
    pub async fn serve_with_shutdown(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "s3 api listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
