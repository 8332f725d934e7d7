//! HTTP surface of the frontend.
//!
//! - [`tokens`]: probes, OpenID metadata and the certificate token exchange
//! - [`deltas`]: delta submission, commit and state history
//! - [`models`]: published models
//! - [`agents`]: endpoints polled and fed by the host agents
//!
//! Everything except the probes, the OpenID documents and the token
//! exchange sits behind [`middleware::require_token`].

pub mod agents;
pub mod deltas;
pub mod middleware;
pub mod models;
pub mod tokens;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use srm_common::{ConfigCache, FrontendConfig, SrmError, SrmResult};
use srm_policy::PolicyService;
use srm_store::Store;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::AuthService;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<ConfigCache<FrontendConfig>>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ConfigCache<FrontendConfig>>,
        auth: Arc<AuthService>,
    ) -> Self {
        Self { store, config, auth }
    }

    /// Fails with `NotFound` unless `site` is configured.
    pub fn check_site(&self, site: &str) -> Result<Arc<FrontendConfig>, ApiError> {
        let config = self.config.get();
        if config.sites.contains_key(site) {
            Ok(config)
        } else {
            Err(SrmError::not_found("site", site).into())
        }
    }

    /// The site the `/sitefe/v1` routes act on.
    pub fn primary_site(&self) -> Result<(Arc<FrontendConfig>, String), ApiError> {
        let config = self.config.get();
        let site = config.primary_site()?.0.to_string();
        Ok((config, site))
    }

    /// Policy service over the current configuration.
    pub fn policy(&self) -> Result<PolicyService, ApiError> {
        let (config, site) = self.primary_site()?;
        Ok(PolicyService::new(Arc::clone(&self.store), config, site))
    }
}

/// An [`SrmError`] rendered as `{errType, errNo, errMsg}`.
#[derive(Debug)]
pub struct ApiError(pub SrmError);

impl<E> From<E> for ApiError
where
    E: Into<SrmError>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %self.0, "Request rejected");
        }
        (status, Json(self.0.info())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The complete router.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/ready", get(tokens::ready))
        .route("/api/alive", get(tokens::alive))
        .route(
            "/.well-known/openid-configuration",
            get(tokens::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(tokens::jwks))
        .route("/m2m/token", post(tokens::token))
        .route("/m2m/token/refresh", post(tokens::refresh))
        .route("/m2m/token/{challenge_id}", post(tokens::answer));

    let protected = Router::new()
        .route("/sitefe/v1/deltas", get(deltas::list).post(deltas::submit))
        .route("/sitefe/v1/deltas/{id}", get(deltas::get_one))
        .route("/sitefe/v1/deltas/{id}/actions/{action}", put(deltas::action))
        .route("/sitefe/v1/deltastates/{id}", get(deltas::states))
        .route("/sitefe/v1/deltahoststates/{id}", get(deltas::host_states))
        .route(
            "/sitefe/v1/deltahoststateshistory/{id}",
            get(deltas::host_state_history),
        )
        .route(
            "/sitefe/v1/deltatimestates",
            get(deltas::time_states).post(deltas::record_time_state),
        )
        .route("/sitefe/v1/models", get(models::list))
        .route("/sitefe/v1/models/{id}", get(models::get_one))
        .route("/api/{site}/frontend/activedeltas", get(agents::active_deltas))
        .route("/api/{site}/frontend/qosdata", get(agents::qos_data))
        .route(
            "/api/{site}/hosts",
            get(agents::list_hosts)
                .post(agents::add_host)
                .put(agents::update_host),
        )
        .route(
            "/api/{site}/monitoring/stats",
            get(agents::list_stats).post(agents::record_stats),
        )
        .route(
            "/api/{site}/servicestates",
            get(agents::list_service_states).post(agents::record_service_state),
        )
        .route(
            "/api/{site}/serviceaction",
            get(agents::list_service_actions)
                .post(agents::record_service_action)
                .delete(agents::delete_service_actions),
        )
        .route(
            "/api/{site}/setinstancestartend",
            post(agents::set_instance_start_end),
        )
        .route_layer(from_fn_with_state(state.clone(), middleware::require_token));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the router until `shutdown` fires.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> SrmResult<()> {
    let bind = state.config.get().rest.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| SrmError::io(bind.clone(), e))?;
    info!(bind = %bind, "REST API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| SrmError::io(bind.clone(), e))?;
    info!("REST API stopped");
    Ok(())
}
