//! Axum route handlers for the TUF surface under `/v2/*`.

use crate::{
    db::AppState,
    error::ServerError,
    models::{ChangeFeedQuery, ChangeFeedResponse},
    server::{PublishError, UploadPart},
    tuf::{Gun, RoleName},
};
use axum::{
    body::Body,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

const CACHE_CURRENT: &str = "public, max-age=300";
const CACHE_CONSISTENT: &str = "public, max-age=31536000";

// ── Health ────────────────────────────────────────────────────────────────────

/// `GET /health` — Health check, including a check of the metadata store.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    state.trust.check_health().await?;
    Ok(Json(json!({
        "status": "ok",
        "service": "trust-registry",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

// ── Path dispatch ─────────────────────────────────────────────────────────────

/// What a `/v2/<rest>` path addresses.
#[derive(Debug, PartialEq, Eq)]
enum Target {
    GlobalFeed,
    Feed(Gun),
    Repo(Gun),
    Key(Gun, RoleName),
    Current(Gun, RoleName),
    Version(Gun, RoleName, u64),
    Checksum(Gun, RoleName, String),
}

fn is_checksum(s: &str) -> bool {
    matches!(s.len(), 64 | 96 | 128) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_role(name: &str) -> Result<RoleName, ServerError> {
    RoleName::parse(name).map_err(|_| PublishError::InvalidRole(name.to_string()).into())
}

fn parse_target(rest: &str) -> Result<Target, ServerError> {
    let rest = rest.trim_start_matches('/');
    if rest == "_trust/changefeed" {
        return Ok(Target::GlobalFeed);
    }
    let not_found = || ServerError::NotFound(format!("/v2/{rest}"));
    let (gun, tail) = rest.split_once("/_trust/").ok_or_else(not_found)?;
    if gun.is_empty() {
        return Err(not_found());
    }
    let gun = Gun::new(gun);

    match tail {
        "changefeed" | "tuf/changefeed" => return Ok(Target::Feed(gun)),
        "tuf" | "tuf/" => return Ok(Target::Repo(gun)),
        _ => {}
    }
    let file = tail.strip_prefix("tuf/").ok_or_else(not_found)?;

    if let Some(role) = file.strip_suffix(".key") {
        return Ok(Target::Key(gun, parse_role(role)?));
    }
    let name = file.strip_suffix(".json").ok_or_else(not_found)?;
    if let Some((prefix, role)) = name.split_once('.') {
        if let Ok(version) = prefix.parse::<u64>() {
            return Ok(Target::Version(gun, parse_role(role)?, version));
        }
        if is_checksum(prefix) {
            return Ok(Target::Checksum(gun, parse_role(role)?, prefix.to_ascii_lowercase()));
        }
    }
    Ok(Target::Current(gun, parse_role(name)?))
}

fn metadata_response(modified: DateTime<Utc>, data: Vec<u8>, cache_control: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::LAST_MODIFIED, modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
            (header::CACHE_CONTROL, cache_control.to_string()),
        ],
        Body::from(data),
    )
        .into_response()
}

async fn change_feed(state: &AppState, query: &ChangeFeedQuery, gun: &str) -> Result<Response, ServerError> {
    let records = query.records()?;
    let changes = state.trust.changes(&query.change_id, records, gun).await?;
    Ok(Json(ChangeFeedResponse::from(changes)).into_response())
}

// ── GET ───────────────────────────────────────────────────────────────────────

/// `GET /v2/*rest` — role metadata, server keys and change feeds.
pub async fn tuf_get(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    Query(query): Query<ChangeFeedQuery>,
) -> Result<Response, ServerError> {
    match parse_target(&rest)? {
        Target::GlobalFeed => change_feed(&state, &query, "").await,
        Target::Feed(gun) => change_feed(&state, &query, gun.as_str()).await,
        Target::Repo(_) => Err(ServerError::NotFound(format!("/v2/{rest}"))),
        Target::Key(gun, role) => Ok(Json(state.trust.get_or_create_key(&gun, &role).await?).into_response()),
        Target::Current(gun, role) => {
            let (modified, data) = state.trust.get_current(&gun, &role).await?;
            Ok(metadata_response(modified, data, CACHE_CURRENT))
        }
        Target::Version(gun, role, version) => {
            let (modified, data) = state.trust.get_version(&gun, &role, version).await?;
            Ok(metadata_response(modified, data, CACHE_CONSISTENT))
        }
        Target::Checksum(gun, role, checksum) => {
            let (modified, data) = state.trust.get_checksum(&gun, &role, &checksum).await?;
            Ok(metadata_response(modified, data, CACHE_CONSISTENT))
        }
    }
}

// ── POST ──────────────────────────────────────────────────────────────────────

/// `POST /v2/*rest` — multipart publish to `<gun>/_trust/tuf/`, or key
/// rotation on `<gun>/_trust/tuf/<role>.key`.
pub async fn tuf_post(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    request: Request,
) -> Result<Response, ServerError> {
    match parse_target(&rest)? {
        Target::Repo(gun) => {
            let mut multipart = Multipart::from_request(request, &())
                .await
                .map_err(|e| ServerError::BadRequest(e.body_text()))?;
            let mut parts = Vec::new();
            while let Some(field) = multipart.next_field().await? {
                let filename = field.file_name().map(str::to_string).ok_or(PublishError::NoFilename)?;
                let data = field.bytes().await?.to_vec();
                parts.push(UploadPart { filename, data });
            }
            state.trust.atomic_update(&gun, parts).await?;
            tracing::info!("published update for {}", gun);
            Ok(StatusCode::OK.into_response())
        }
        Target::Key(gun, role) => {
            let key = state.trust.rotate_key(&gun, &role).await?;
            tracing::warn!("rotated {} key for {}", role, gun);
            Ok(Json(key).into_response())
        }
        _ => Err(ServerError::NotFound(format!("/v2/{rest}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────────────────────

/// `DELETE /v2/<gun>/_trust/tuf/` — Remove all trust data for a GUN.
pub async fn tuf_delete(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
) -> Result<StatusCode, ServerError> {
    match parse_target(&rest)? {
        Target::Repo(gun) => {
            state.trust.delete(&gun).await?;
            Ok(StatusCode::OK)
        }
        _ => Err(ServerError::NotFound(format!("/v2/{rest}"))),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_returns_ok() {
        let state = Arc::new(AppState::in_memory());
        let resp = health(State(state)).await.unwrap();
        assert_eq!(resp.0["status"], "ok");
        assert_eq!(resp.0["service"], "trust-registry");
    }

    #[test]
    fn paths_are_dispatched() {
        let gun = || Gun::new("docker.io/library/alpine");
        assert_eq!(parse_target("_trust/changefeed").unwrap(), Target::GlobalFeed);
        assert_eq!(
            parse_target("docker.io/library/alpine/_trust/changefeed").unwrap(),
            Target::Feed(gun())
        );
        assert_eq!(
            parse_target("docker.io/library/alpine/_trust/tuf/").unwrap(),
            Target::Repo(gun())
        );
        assert_eq!(
            parse_target("docker.io/library/alpine/_trust/tuf/timestamp.key").unwrap(),
            Target::Key(gun(), RoleName::timestamp())
        );
        assert_eq!(
            parse_target("docker.io/library/alpine/_trust/tuf/root.json").unwrap(),
            Target::Current(gun(), RoleName::root())
        );
        assert_eq!(
            parse_target("docker.io/library/alpine/_trust/tuf/3.targets.json").unwrap(),
            Target::Version(gun(), RoleName::targets(), 3)
        );
        let sum = "a".repeat(64);
        assert_eq!(
            parse_target(&format!("docker.io/library/alpine/_trust/tuf/{sum}.snapshot.json")).unwrap(),
            Target::Checksum(gun(), RoleName::snapshot(), sum)
        );
    }

    #[test]
    fn unknown_paths_are_rejected() {
        assert!(matches!(parse_target("library/alpine/manifests/latest"), Err(ServerError::NotFound(_))));
        assert!(matches!(parse_target("/_trust/tuf/root.json"), Err(ServerError::NotFound(_))));
        assert!(matches!(parse_target("x/_trust/tuf/root.txt"), Err(ServerError::NotFound(_))));
        assert!(matches!(
            parse_target("x/_trust/tuf/bogus.json"),
            Err(ServerError::Publish(PublishError::InvalidRole(_)))
        ));
    }
}
