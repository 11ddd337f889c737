//! CI runner HTTP routes — hooks, build API, output streaming, updates.

pub mod api;
pub mod hooks;
pub mod stream;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::models::build::BuildId;
use crate::models::repository::NewRepository;
use crate::services::build_service::BuildService;
use crate::services::repository_service;

/// Shared state for CI route handlers.
#[derive(Clone)]
pub struct CiRouterState {
    pub service: Arc<BuildService>,
}

/// Build the CI runner's Axum router.
pub fn ci_router(state: CiRouterState) -> Router {
    Router::new()
        // Hooks
        .route("/hooks", post(hook_handler))
        // Build API
        .route("/api/builds", get(list_builds))
        .route("/api/builds/{repo}/{number}", get(get_build))
        .route("/api/builds/{repo}/{number}/output", get(build_output))
        .route("/api/builds/{repo}/{number}/cancel", post(cancel_build))
        // Repository API
        .route(
            "/api/repositories",
            get(list_repositories).post(create_repository),
        )
        // Live updates
        .route("/api/updates", get(updates))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Hooks ──

async fn hook_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    hooks::handle_hook(&state.service, &headers, body).await
}

// ── Build API ──

async fn list_builds(
    State(state): State<CiRouterState>,
) -> Result<Json<Vec<api::BuildJson>>, StatusCode> {
    state
        .service
        .list()
        .await
        .map(|builds| Json(builds.iter().map(api::BuildJson::from).collect()))
        .map_err(|e| {
            tracing::error!("List builds error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_build(
    State(state): State<CiRouterState>,
    Path((repo, number)): Path<(i64, i64)>,
) -> Result<Json<api::BuildJson>, StatusCode> {
    let record = state
        .service
        .find(BuildId::new(repo, number))
        .await
        .map_err(|e| {
            tracing::error!("Get build error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(api::BuildJson::from(&record)))
}

async fn build_output(
    State(state): State<CiRouterState>,
    Path((repo, number)): Path<(i64, i64)>,
) -> Result<Response, StatusCode> {
    let output = state
        .service
        .output(BuildId::new(repo, number))
        .await
        .map_err(|e| {
            tracing::error!("Build output error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(stream::output_response(output))
}

async fn cancel_build(
    State(state): State<CiRouterState>,
    Path((repo, number)): Path<(i64, i64)>,
) -> Result<StatusCode, StatusCode> {
    let id = BuildId::new(repo, number);
    if state.service.cancel(id).is_ok() {
        return Ok(StatusCode::ACCEPTED);
    }

    // Not cancellable: distinguish an unknown build from a finished one.
    match state.service.find(id).await {
        Ok(Some(_)) => Err(StatusCode::CONFLICT),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Cancel build error: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ── Repository API ──

async fn list_repositories(
    State(state): State<CiRouterState>,
) -> Result<Json<Vec<api::RepositoryJson>>, StatusCode> {
    repository_service::list_repositories(state.service.store())
        .await
        .map(|repos| Json(repos.into_iter().map(api::RepositoryJson::from).collect()))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn create_repository(
    State(state): State<CiRouterState>,
    Json(req): Json<NewRepository>,
) -> Result<(StatusCode, Json<api::RepositoryJson>), StatusCode> {
    let service = &state.service;
    repository_service::create_repository(service.store(), service.checkout(), req)
        .await
        .map(|repo| (StatusCode::CREATED, Json(repo.into())))
        .map_err(|e| match e {
            crate::error::CiError::InvalidRepository => StatusCode::BAD_REQUEST,
            e => {
                tracing::error!("Create repository error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
}

// ── Updates & health ──

async fn updates(State(state): State<CiRouterState>) -> impl IntoResponse {
    stream::updates_response(state.service.events().subscribe())
}

async fn health(State(state): State<CiRouterState>) -> Json<api::HealthResponse> {
    Json(api::HealthResponse {
        status: "ok".to_string(),
        running_builds: state.service.registry().len(),
    })
}
