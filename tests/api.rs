//! End-to-end tests driving the real router over in-memory stores.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{header, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use trust_registry::config::{items, ConfigError, Driver, RestDriver};
use trust_registry::tuf::testutils::RepoFixture;
use trust_registry::tuf::RoleName;
use trust_registry::{router, AppState};

const BOUNDARY: &str = "trust-registry-test-boundary";

fn multipart(files: &[(String, Vec<u8>)]) -> Bytes {
    let mut body = Vec::new();
    for (name, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Bytes::from(body)
}

fn setup() -> (TestServer, Arc<AppState>) {
    let state = Arc::new(AppState::in_memory());
    let server = TestServer::new(router(state.clone())).unwrap();
    (server, state)
}

async fn publish(server: &TestServer, gun: &str, files: &[(String, Vec<u8>)]) -> axum_test::TestResponse {
    server
        .post(&format!("/v2/{gun}/_trust/tuf/"))
        .content_type(&format!("multipart/form-data; boundary={BOUNDARY}"))
        .bytes(multipart(files))
        .await
}

#[tokio::test]
async fn health_check() {
    let (server, _) = setup();
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "trust-registry");
}

#[tokio::test]
async fn publish_and_fetch_metadata() {
    let (server, state) = setup();
    let gun = "docker.io/library/alpine";
    let fx = RepoFixture::with_server(gun, state.trust.crypto().clone(), true).unwrap();
    let files = fx.upload_parts().unwrap();
    publish(&server, gun, &files).await.assert_status_ok();

    let root = files.iter().find(|(name, _)| name == "root.json").map(|(_, data)| data.clone()).unwrap();

    let current = server.get(&format!("/v2/{gun}/_trust/tuf/root.json")).await;
    current.assert_status_ok();
    assert_eq!(current.as_bytes().as_ref(), root.as_slice());
    assert_eq!(current.header(header::CONTENT_TYPE), "application/json");
    assert!(!current.header(header::LAST_MODIFIED).is_empty());

    let by_version = server.get(&format!("/v2/{gun}/_trust/tuf/1.root.json")).await;
    by_version.assert_status_ok();
    assert_eq!(by_version.as_bytes().as_ref(), root.as_slice());

    let sum = hex::encode(Sha256::digest(&root));
    let by_checksum = server.get(&format!("/v2/{gun}/_trust/tuf/{sum}.root.json")).await;
    by_checksum.assert_status_ok();
    assert_eq!(by_checksum.as_bytes().as_ref(), root.as_slice());

    // snapshot and timestamp were signed by the server
    server.get(&format!("/v2/{gun}/_trust/tuf/snapshot.json")).await.assert_status_ok();
    server.get(&format!("/v2/{gun}/_trust/tuf/timestamp.json")).await.assert_status_ok();

    let missing = server.get(&format!("/v2/{gun}/_trust/tuf/2.root.json")).await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["code"], "METADATA_NOT_FOUND");
}

#[tokio::test]
async fn client_held_snapshot_is_served_as_uploaded() {
    let (server, state) = setup();
    let fx = RepoFixture::with_server("detached", state.trust.crypto().clone(), false).unwrap();
    let files = fx.upload_parts().unwrap();
    publish(&server, "detached", &files).await.assert_status_ok();

    let uploaded = files.iter().find(|(name, _)| name == "snapshot.json").map(|(_, d)| d.clone()).unwrap();
    let served = server.get("/v2/detached/_trust/tuf/snapshot.json").await;
    served.assert_status_ok();
    assert_eq!(served.as_bytes().as_ref(), uploaded.as_slice());
}

#[tokio::test]
async fn rejected_publishes_carry_their_reason() {
    let (server, state) = setup();
    let fx = RepoFixture::with_server("gun", state.trust.crypto().clone(), false).unwrap();

    // no snapshot and the server does not hold its key
    let resp = publish(&server, "gun", &fx.upload_parts_for(&["root", "targets"]).unwrap()).await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = resp.json();
    assert_eq!(body["code"], "INVALID_UPDATE");
    assert_eq!(body["detail"]["kind"], "bad_hierarchy");
    assert_eq!(body["detail"]["missing"], "snapshot");

    publish(&server, "gun", &fx.upload_parts().unwrap()).await.assert_status_ok();
    let again = publish(&server, "gun", &fx.upload_parts_for(&["targets", "snapshot"]).unwrap()).await;
    again.assert_status(StatusCode::CONFLICT);
    assert_eq!(again.json::<Value>()["code"], "OLD_VERSION");

    let bad_role = publish(&server, "gun", &[("bogus.json".to_string(), b"{}".to_vec())]).await;
    bad_role.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(bad_role.json::<Value>()["code"], "INVALID_ROLE");
}

#[tokio::test]
async fn root_rotation_needs_both_key_sets() {
    let (server, state) = setup();
    let mut fx = RepoFixture::with_server("rotating", state.trust.crypto().clone(), true).unwrap();
    publish(&server, "rotating", &fx.upload_parts().unwrap()).await.assert_status_ok();

    fx.rotate_root_key().unwrap();
    let only_new = fx.sign_root_without_old_keys().unwrap();
    let resp = publish(&server, "rotating", &[("root.json".to_string(), only_new)]).await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>()["detail"]["kind"], "bad_root");

    let both = fx.sign_role(&RoleName::root()).unwrap();
    publish(&server, "rotating", &[("root.json".to_string(), both.clone())])
        .await
        .assert_status_ok();
    let served = server.get("/v2/rotating/_trust/tuf/root.json").await;
    assert_eq!(served.as_bytes().as_ref(), both.as_slice());
    server.get("/v2/rotating/_trust/tuf/2.snapshot.json").await.assert_status_ok();
}

#[tokio::test]
async fn change_feed_pages_through_every_gun() {
    let (server, state) = setup();
    for gun in ["a/one", "b/two"] {
        let fx = RepoFixture::with_server(gun, state.trust.crypto().clone(), true).unwrap();
        publish(&server, gun, &fx.upload_parts().unwrap()).await.assert_status_ok();
    }

    let all: Value = server.get("/v2/_trust/changefeed").await.json();
    assert_eq!(all["count"], 2);

    let first: Value = server.get("/v2/_trust/changefeed?change_id=0&records=1").await.json();
    assert_eq!(first["count"], 1);
    assert_eq!(first["records"][0]["GUN"], "a/one");
    let cursor = first["records"][0]["ID"].as_i64().unwrap();

    let second: Value = server
        .get(&format!("/v2/_trust/changefeed?change_id={cursor}&records=1"))
        .await
        .json();
    assert_eq!(second["count"], 1);
    assert_eq!(second["records"][0]["GUN"], "b/two");

    let latest: Value = server.get("/v2/_trust/changefeed?change_id=-1&records=-1").await.json();
    assert_eq!(latest["records"][0]["GUN"], "b/two");

    let one_gun: Value = server.get("/v2/a/one/_trust/changefeed").await.json();
    assert_eq!(one_gun["count"], 1);

    server.delete("/v2/a/one/_trust/tuf/").await.assert_status_ok();
    let after: Value = server.get("/v2/a/one/_trust/changefeed").await.json();
    assert_eq!(after["count"], 2);
    assert_eq!(after["records"][1]["Category"], "deletion");
    server
        .get("/v2/a/one/_trust/tuf/root.json")
        .await
        .assert_status(StatusCode::NOT_FOUND);

    let bad = server.get("/v2/_trust/changefeed?records=ten").await;
    bad.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(bad.json::<Value>()["code"], "INVALID_QUERY");
}

#[tokio::test]
async fn server_keys_are_created_and_rotated() {
    let (server, _) = setup();
    let first: Value = server.get("/v2/keys/_trust/tuf/timestamp.key").await.json();
    let again: Value = server.get("/v2/keys/_trust/tuf/timestamp.key").await.json();
    assert_eq!(first, again);
    assert!(first["keyval"]["public"].is_string());

    let rotated = server.post("/v2/keys/_trust/tuf/timestamp.key").await;
    rotated.assert_status_ok();
    let rotated: Value = rotated.json();
    assert_ne!(rotated, first);
    let current: Value = server.get("/v2/keys/_trust/tuf/timestamp.key").await.json();
    assert_eq!(current, rotated);

    let root = server.get("/v2/keys/_trust/tuf/root.key").await;
    root.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(root.json::<Value>()["code"], "INVALID_ROLE");
}

#[tokio::test]
async fn configuration_round_trip() {
    let (server, state) = setup();
    let cfg: Value = server.get("/api/configurations").await.json();
    assert_eq!(cfg["auth_mode"], json!({ "value": "db_auth", "editable": true }));
    assert!(cfg.get(items::POSTGRESQL_HOST).is_none());

    server
        .put("/api/configurations")
        .json(&json!({ "auth_mode": "ldap_auth", "email_port": 587, "ldap_search_password": "hunter2" }))
        .await
        .assert_status_ok();
    assert_eq!(state.config.auth_mode(), "ldap_auth");

    let cfg: Value = server.get("/api/configurations").await.json();
    assert_eq!(cfg["auth_mode"]["value"], "ldap_auth");
    assert_eq!(cfg["email_port"]["value"], 587);
    assert!(cfg.get(items::LDAP_SEARCH_PASSWORD).is_none());

    let internal: Value = server.get("/api/internal/configurations").await.json();
    assert_eq!(internal[items::LDAP_SEARCH_PASSWORD]["value"], "hunter2");
    assert_eq!(internal[items::POSTGRESQL_HOST]["editable"], false);
}

#[tokio::test]
async fn invalid_configuration_is_not_applied() {
    let (server, state) = setup();

    let resp = server.put("/api/configurations").json(&json!({ "auth_mode": "magic" })).await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>()["code"], "CONFIG_VALIDATION");

    let resp = server
        .put("/api/configurations")
        .json(&json!({ "postgresql_host": "elsewhere" }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>()["code"], "NOT_EDITABLE");

    let resp = server.put("/api/configurations").json(&json!({ "no_such_item": 1 })).await;
    assert_eq!(resp.json::<Value>()["code"], "UNKNOWN_ITEM");

    // oidc_auth without an endpoint breaks the OIDC rule; nothing changes
    let resp = server
        .put("/api/configurations")
        .json(&json!({ "auth_mode": "oidc_auth", "email_port": 2525 }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<Value>()["code"], "CONFIG_RULE");
    assert_eq!(state.config.auth_mode(), "db_auth");
    assert_eq!(state.config.get(items::EMAIL_PORT).unwrap().get_int(), 25);
}

#[tokio::test]
async fn internal_api_requires_the_shared_secret() {
    let state = Arc::new(AppState::in_memory().with_internal_secret("s3cret"));
    let server = TestServer::new(router(state)).unwrap();

    server
        .get("/api/internal/configurations")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    server
        .get("/api/internal/configurations")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static("Harbor-Secret s3cret"))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn rest_driver_talks_to_a_peer() {
    let peer = Arc::new(AppState::in_memory().with_internal_secret("s3cret"));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(peer.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });
    let url = format!("http://{addr}");

    let driver = RestDriver::new(&url, Some("s3cret".into()));
    let cfg = driver.load().await.unwrap();
    assert_eq!(cfg.get(items::AUTH_MODE).map(String::as_str), Some("db_auth"));
    assert_eq!(cfg.get(items::EMAIL_PORT).map(String::as_str), Some("25"));

    driver
        .save(HashMap::from([(items::AUTH_MODE.to_string(), "uaa_auth".to_string())]))
        .await
        .unwrap();
    assert_eq!(peer.config.auth_mode(), "uaa_auth");

    let intruder = RestDriver::new(&url, Some("wrong".into()));
    assert!(matches!(
        intruder.load().await,
        Err(ConfigError::Peer { status: 401, .. })
    ));
}
