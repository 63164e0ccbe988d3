//! Configuration API: user-facing and internal (peer) endpoints.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde_json::Value;

use crate::{db::AppState, error::ServerError};

/// Scheme of the shared-secret `Authorization` header.
pub const SECRET_SCHEME: &str = "Harbor-Secret";

fn require_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ServerError> {
    let Some(expected) = &state.internal_secret else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(SECRET_SCHEME))
        .map(str::trim);
    match presented {
        Some(secret) if secret == expected => Ok(()),
        _ => {
            tracing::warn!("rejected internal configuration request without a valid secret");
            Err(ServerError::Unauthorized)
        }
    }
}

/// `GET /api/configurations` — user-scope items, passwords excluded.
pub async fn get_configurations(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, Value>> {
    Json(state.config.user_json())
}

/// `PUT /api/configurations` — Body: `{ "<item>": <value>, ... }`.
///
/// Every entry is validated and the cross-field rules run on the merged
/// view before anything is persisted.
pub async fn put_configurations(
    State(state): State<Arc<AppState>>,
    Json(changes): Json<HashMap<String, Value>>,
) -> Result<StatusCode, ServerError> {
    state.config.update(changes).await?;
    Ok(StatusCode::OK)
}

/// `GET /api/internal/configurations` — every item, passwords included.
pub async fn get_internal_configurations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, Value>>, ServerError> {
    require_secret(&state, &headers)?;
    Ok(Json(state.config.all_json(true)))
}

/// `PUT /api/internal/configurations` — Write half used by peers
/// running the REST driver.
pub async fn put_internal_configurations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(changes): Json<HashMap<String, Value>>,
) -> Result<StatusCode, ServerError> {
    require_secret(&state, &headers)?;
    state.config.update(changes).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_is_checked_only_when_configured() {
        let open = AppState::in_memory();
        assert!(require_secret(&open, &HeaderMap::new()).is_ok());

        let locked = AppState::in_memory().with_internal_secret("s3cret");
        assert!(matches!(
            require_secret(&locked, &HeaderMap::new()),
            Err(ServerError::Unauthorized)
        ));
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Harbor-Secret wrong"));
        assert!(require_secret(&locked, &headers).is_err());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Harbor-Secret s3cret"));
        assert!(require_secret(&locked, &headers).is_ok());
    }
}
