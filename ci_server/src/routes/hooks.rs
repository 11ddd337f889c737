//! Hook handler — receives push notifications, starts builds.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use crate::error::CiError;
use crate::services::build_service::BuildService;
use crate::services::hook_service::{self, HookError, SIGNATURE_HEADER};

use super::api::HookResponse;

/// Handle an incoming hook payload.
///
/// Returns 201 with the build id, or 200 with no body for ignored ref
/// deletions.
pub async fn handle_hook(
    service: &Arc<BuildService>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let hook = match hook_service::parse_hook(&service.config().hook_secret, &body, signature) {
        Ok(hook) => hook,
        Err(HookError::BadSignature) => {
            tracing::warn!("Hook signature validation failed");
            crate::metrics::hook_received("unauthorized");
            return Err(StatusCode::UNAUTHORIZED);
        }
        Err(e) => {
            tracing::warn!("{e}");
            crate::metrics::hook_received("malformed");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    match service.handle_hook(hook).await {
        Ok(Some((id, _task))) => {
            crate::metrics::hook_received("accepted");
            Ok((StatusCode::CREATED, Json(HookResponse::from(id))).into_response())
        }
        Ok(None) => {
            crate::metrics::hook_received("ignored");
            Ok(StatusCode::OK.into_response())
        }
        Err(CiError::InvalidRevision(revision)) => {
            tracing::warn!(revision = %revision, "Hook rejected: bad revision");
            crate::metrics::hook_received("malformed");
            Err(StatusCode::BAD_REQUEST)
        }
        Err(CiError::UnknownRepository(path)) => {
            tracing::debug!(path = %path.display(), "No repository registered for hook");
            crate::metrics::hook_received("unknown_repository");
            Err(StatusCode::NOT_FOUND)
        }
        Err(CiError::Registry(e)) => {
            tracing::warn!("Hook rejected: {e}");
            crate::metrics::hook_received("rejected");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => {
            tracing::error!("Failed to create build: {e}");
            crate::metrics::hook_received("error");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
