//! End-to-end tests over the full router: account linking, token grants and
//! the smarthome endpoints, driven through `tower::ServiceExt::oneshot`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use bridge::auth::persist::MemoryBlobStore;
use bridge::devices::memory::{MemoryRegistry, SimpleDevice};
use bridge::reporting::DisabledHomeGraph;
use bridge::{api, config, AppState};

const CLIENT_ID: &str = "assistant-client";
const CLIENT_SECRET: &str = "assistant-secret";
const PROJECT: &str = "proj123";
const REDIRECT: &str = "https://oauth-redirect.googleusercontent.com/r/proj123";

fn base_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("SMARTHOME_CLIENT_ID", CLIENT_ID),
        ("SMARTHOME_CLIENT_SECRET", CLIENT_SECRET),
        ("SMARTHOME_NODE_ID", "node-under-test"),
    ]
}

fn config_from(pairs: Vec<(&'static str, &'static str)>) -> config::Config {
    config::load_from(move |key| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
    .unwrap()
}

fn local_login_config() -> config::Config {
    let mut env = base_env();
    env.push(("SMARTHOME_USERNAME", "alice"));
    env.push(("SMARTHOME_PASSWORD", "wonderland"));
    config_from(env)
}

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    registry: Arc<MemoryRegistry>,
}

async fn test_app_with(cfg: config::Config) -> TestApp {
    let registry = Arc::new(MemoryRegistry::new([
        SimpleDevice::on_off("lamp-1", "Desk lamp", "action.devices.types.LIGHT"),
        SimpleDevice::on_off("hood-1", "Kitchen hood", "action.devices.types.HOOD").local(true),
    ]));
    let state = AppState::initialize(
        cfg,
        Arc::new(MemoryBlobStore::new()),
        registry.clone(),
        Arc::new(DisabledHomeGraph),
        Some(PROJECT.to_string()),
    )
    .await
    .unwrap();
    TestApp {
        router: api::router(state.clone()),
        state,
        registry,
    }
}

async fn test_app() -> TestApp {
    test_app_with(local_login_config()).await
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, headers, body)
}

fn form(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn form_request(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

fn smarthome_request(uri: &str, token: Option<&str>, body: &Value, peer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let mut req = builder.body(Body::from(body.to_string())).unwrap();
    if let Some(peer) = peer {
        let addr: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
    }
    req
}

/// Log in on the authorize page and return the code from the redirect.
async fn authorize(router: &Router) -> String {
    let body = form(&[
        ("client_id", CLIENT_ID),
        ("redirect_uri", REDIRECT),
        ("state", "xyz"),
        ("username", "alice"),
        ("password", "wonderland"),
    ]);
    let (status, headers, _) = send(router, form_request("/oauth", body)).await;
    assert_eq!(status, StatusCode::FOUND);

    let location = headers.get(header::LOCATION).unwrap().to_str().unwrap();
    let url = url::Url::parse(location).unwrap();
    assert!(location.starts_with(REDIRECT));
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert!(pairs.contains(&("state".to_string(), "xyz".to_string())));
    pairs
        .into_iter()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v)
        .unwrap()
}

async fn exchange(router: &Router, code: &str) -> Value {
    let body = form(&[
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", REDIRECT),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
    ]);
    let (status, _, body) = send(router, form_request("/token", body)).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

async fn linked_access_token(router: &Router) -> String {
    let code = authorize(router).await;
    let grant = exchange(router, &code).await;
    grant["access_token"].as_str().unwrap().to_string()
}

fn envelope(intent: &str, payload: Value) -> Value {
    json!({
        "requestId": "req-1",
        "inputs": [{ "intent": intent, "payload": payload }],
    })
}

#[tokio::test]
async fn test_account_linking_then_sync() {
    let app = test_app().await;

    let code = authorize(&app.router).await;
    let grant = exchange(&app.router, &code).await;
    assert_eq!(grant["token_type"], "bearer");
    assert_eq!(grant["expires_in"], 3600);
    assert!(grant["refresh_token"].is_string());

    let token = grant["access_token"].as_str().unwrap();
    let req = smarthome_request(
        "/smarthome",
        Some(token),
        &envelope("action.devices.SYNC", json!({})),
        None,
    );
    let (status, headers, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
        api::ALLOWED_HEADERS
    );

    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["requestId"], "req-1");
    assert_eq!(body["payload"]["agentUserId"], "0");
    let ids: Vec<&str> = body["payload"]["devices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"lamp-1"));
    assert!(ids.contains(&"hood-1"));

    assert!(app.state.authority.is_linked().await);
}

#[tokio::test]
async fn test_code_is_single_use() {
    let app = test_app().await;
    let code = authorize(&app.router).await;
    exchange(&app.router, &code).await;

    let body = form(&[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", REDIRECT),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
    ]);
    let (status, _, body) = send(&app.router, form_request("/token", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_refresh_grant_via_basic_auth() {
    let app = test_app().await;
    let code = authorize(&app.router).await;
    let grant = exchange(&app.router, &code).await;
    let refresh_token = grant["refresh_token"].as_str().unwrap();

    use base64::Engine;
    let basic = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", CLIENT_ID, CLIENT_SECRET));
    let mut req = form_request(
        "/token",
        form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)]),
    );
    req.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Basic {}", basic).parse().unwrap(),
    );
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);

    let refreshed: Value = serde_json::from_slice(&body).unwrap();
    assert!(refreshed.get("refresh_token").is_none());
    assert_ne!(refreshed["access_token"], grant["access_token"]);
}

#[tokio::test]
async fn test_token_endpoint_rejects_bad_client_and_grant_type() {
    let app = test_app().await;

    let body = form(&[
        ("grant_type", "refresh_token"),
        ("refresh_token", "whatever"),
        ("client_id", CLIENT_ID),
        ("client_secret", "wrong"),
    ]);
    let (status, _, body) = send(&app.router, form_request("/token", body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "invalid_client");

    let body = form(&[
        ("grant_type", "password"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
    ]);
    let (status, _, body) = send(&app.router, form_request("/token", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "unsupported_grant_type");

    let body = form(&[
        ("grant_type", "refresh_token"),
        ("refresh_token", "never-issued"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
    ]);
    let (status, _, _) = send(&app.router, form_request("/token", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_token_endpoint_requires_client_secret() {
    let app = test_app().await;
    let code = authorize(&app.router).await;

    let body = form(&[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", REDIRECT),
        ("client_id", CLIENT_ID),
    ]);
    let (status, _, body) = send(&app.router, form_request("/token", body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "invalid_client");
    assert_eq!(app.state.authority.status().await.pending_codes, 1);

    let grant = exchange(&app.router, &code).await;
    let refresh_token = grant["refresh_token"].as_str().unwrap();
    let body = form(&[
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", CLIENT_ID),
        ("client_secret", ""),
    ]);
    let (status, _, body) = send(&app.router, form_request("/token", body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn test_failed_login_shows_page_again() {
    let app = test_app().await;
    let body = form(&[
        ("client_id", CLIENT_ID),
        ("redirect_uri", REDIRECT),
        ("username", "alice"),
        ("password", "not-it"),
    ]);
    let (status, headers, body) = send(&app.router, form_request("/oauth", body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.get(header::LOCATION).is_none());
    assert!(String::from_utf8(body).unwrap().contains("Login failed"));
    assert_eq!(app.state.authority.status().await.pending_codes, 0);
}

#[tokio::test]
async fn test_authorize_page_rejects_foreign_redirect() {
    let app = test_app().await;
    let uri = format!(
        "/oauth?client_id={}&redirect_uri={}&state=s",
        CLIENT_ID, "https%3A%2F%2Fevil.example.com%2Fcb"
    );
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, _, _) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let uri = format!(
        "/oauth?client_id={}&redirect_uri={}&state=s",
        CLIENT_ID, "https%3A%2F%2Foauth-redirect.googleusercontent.com%2Fr%2Fproj123"
    );
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains(r#"name="username""#));
}

#[tokio::test]
async fn test_smarthome_requires_bearer_token() {
    let app = test_app().await;
    let body = envelope("action.devices.SYNC", json!({}));

    let (status, _, resp) = send(&app.router, smarthome_request("/smarthome", None, &body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let resp: Value = serde_json::from_slice(&resp).unwrap();
    assert_eq!(resp["error"], "missing inputs");

    let (status, _, _) = send(
        &app.router,
        smarthome_request("/smarthome", Some("not-a-token"), &body, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_query_and_execute() {
    let app = test_app().await;
    let token = linked_access_token(&app.router).await;

    app.registry
        .get("hood-1")
        .unwrap()
        .set_state("online", json!(false))
        .await;

    let execute = envelope(
        "action.devices.EXECUTE",
        json!({
            "commands": [{
                "devices": [{ "id": "lamp-1" }, { "id": "hood-1" }, { "id": "ghost" }],
                "execution": [{
                    "command": "action.devices.commands.OnOff",
                    "params": { "on": true },
                }],
            }],
        }),
    );
    let (status, _, body) = send(
        &app.router,
        smarthome_request("/smarthome", Some(&token), &execute, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    let commands = body["payload"]["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 3);

    assert_eq!(commands[0]["ids"], json!(["lamp-1"]));
    assert_eq!(commands[0]["status"], "SUCCESS");
    assert_eq!(commands[0]["states"]["on"], true);
    assert_eq!(commands[0]["states"]["online"], true);
    for offline in &commands[1..] {
        assert_eq!(offline["status"], "ERROR");
        assert_eq!(offline["errorCode"], "deviceOffline");
    }

    let query = envelope(
        "action.devices.QUERY",
        json!({ "devices": [{ "id": "lamp-1" }, { "id": "ghost" }] }),
    );
    let (_, _, body) = send(
        &app.router,
        smarthome_request("/smarthome", Some(&token), &query, None),
    )
    .await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["payload"]["devices"]["lamp-1"]["on"], true);
    assert_eq!(body["payload"]["devices"]["ghost"]["online"], false);
}

#[tokio::test]
async fn test_disconnect_revokes_tokens() {
    let app = test_app().await;
    let token = linked_access_token(&app.router).await;

    let (status, _, body) = send(
        &app.router,
        smarthome_request(
            "/smarthome",
            Some(&token),
            &envelope("action.devices.DISCONNECT", json!({})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({}));
    assert!(!app.state.authority.is_linked().await);

    let (status, _, _) = send(
        &app.router,
        smarthome_request(
            "/smarthome",
            Some(&token),
            &envelope("action.devices.SYNC", json!({})),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_local_route_only_serves_local_peers() {
    let app = test_app().await;
    let local_token = app.state.authority.local_auth_code().await;
    let body = envelope("action.devices.REACHABLE_DEVICES", json!({ "devices": [] }));

    let (status, _, resp) = send(
        &app.router,
        smarthome_request("/local/smarthome", Some(&local_token), &body, Some("8.8.8.8:5000")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&resp).unwrap(), json!({}));

    let (status, _, resp) = send(
        &app.router,
        smarthome_request("/local/smarthome", Some(&local_token), &body, Some("192.168.1.20:5000")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let resp: Value = serde_json::from_slice(&resp).unwrap();
    assert_eq!(resp["payload"]["devices"], json!([{ "verificationId": "hood-1" }]));
}

#[tokio::test]
async fn test_local_token_on_cloud_route_from_remote_peer_is_ignored() {
    let app = test_app().await;
    let local_token = app.state.authority.local_auth_code().await;
    let body = envelope("action.devices.IDENTIFY", json!({}));

    let (status, _, resp) = send(
        &app.router,
        smarthome_request("/smarthome", Some(&local_token), &body, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&resp).unwrap(), json!({}));

    let (_, _, resp) = send(
        &app.router,
        smarthome_request("/smarthome", Some(&local_token), &body, Some("127.0.0.1:40000")),
    )
    .await;
    let resp: Value = serde_json::from_slice(&resp).unwrap();
    assert_eq!(resp["payload"]["device"]["id"], "node-under-test");
}

#[tokio::test]
async fn test_preflight_check_and_metrics() {
    let app = test_app().await;

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/smarthome")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"null");
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
        "Content-Type, Authorization"
    );

    let req = Request::builder().uri("/check").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"SUCCESS");

    linked_access_token(&app.router).await;
    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("smarthome_token_grants_total"));

    let req = Request::builder().uri("/nowhere").body(Body::empty()).unwrap();
    let (status, _, _) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let app = test_app().await;
    let token = linked_access_token(&app.router).await;

    let mut req = smarthome_request("/smarthome", Some(&token), &json!({}), None);
    *req.body_mut() = Body::from("{not json");
    let (status, _, _) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &app.router,
        smarthome_request("/smarthome", Some(&token), &json!({ "requestId": "r" }), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_credentials_checked_before_body() {
    let app = test_app().await;

    let mut req = smarthome_request("/smarthome", None, &json!({}), None);
    *req.body_mut() = Body::from("{not json");
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "missing inputs");

    let local_token = app.state.authority.local_auth_code().await;
    let mut req = smarthome_request("/smarthome", Some(&local_token), &json!({}), None);
    *req.body_mut() = Body::from("{not json");
    let (status, _, body) = send(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({}));
}

mod admin {
    use super::*;

    const ADMIN_KEY: &str = "operator-key";

    async fn admin_app() -> TestApp {
        let mut env = base_env();
        env.push(("SMARTHOME_USERNAME", "alice"));
        env.push(("SMARTHOME_PASSWORD", "wonderland"));
        env.push(("SMARTHOME_ADMIN_KEY", ADMIN_KEY));
        test_app_with(config_from(env)).await
    }

    fn admin_request(
        method: Method,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
        peer: Option<&str>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-admin-key", key);
        }
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            req.extensions_mut().insert(ConnectInfo(addr));
        }
        req
    }

    #[tokio::test]
    async fn test_admin_routes_absent_without_key() {
        let app = test_app().await;
        let req = admin_request(
            Method::GET,
            "/admin/tokens/status",
            Some(ADMIN_KEY),
            None,
            Some("127.0.0.1:5000"),
        );
        assert_eq!(send(&app.router, req).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_refuses_remote_peers_and_bad_keys() {
        let app = admin_app().await;
        let cases = [
            (Some(ADMIN_KEY), Some("8.8.8.8:5000"), StatusCode::FORBIDDEN),
            (Some(ADMIN_KEY), Some("192.168.1.20:5000"), StatusCode::FORBIDDEN),
            (Some(ADMIN_KEY), None, StatusCode::FORBIDDEN),
            (Some("operator-kez"), Some("127.0.0.1:5000"), StatusCode::UNAUTHORIZED),
            (None, Some("[::1]:5000"), StatusCode::UNAUTHORIZED),
            (Some(ADMIN_KEY), Some("[::1]:5000"), StatusCode::OK),
        ];
        for (key, peer, expected) in cases {
            let req = admin_request(Method::GET, "/admin/tokens/status", key, None, peer);
            assert_eq!(send(&app.router, req).await.0, expected, "{:?} {:?}", key, peer);
        }
    }

    #[tokio::test]
    async fn test_revoke_applies_to_the_running_server() {
        let app = admin_app().await;
        let token = linked_access_token(&app.router).await;

        let req = admin_request(
            Method::POST,
            "/admin/tokens/revoke",
            Some(ADMIN_KEY),
            Some(json!({ "user": "alice" })),
            Some("127.0.0.1:5000"),
        );
        let (status, _, body) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["revoked"], 2);

        let (status, _, _) = send(
            &app.router,
            smarthome_request(
                "/smarthome",
                Some(&token),
                &envelope("action.devices.SYNC", json!({})),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = admin_request(
            Method::GET,
            "/admin/tokens/status",
            Some(ADMIN_KEY),
            None,
            Some("127.0.0.1:5000"),
        );
        let (_, _, body) = send(&app.router, req).await;
        let status: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["linked"], false);
        assert_eq!(status["access_tokens"], 0);
    }

    #[tokio::test]
    async fn test_local_code_sync_and_state_reports() {
        let app = admin_app().await;
        let peer = Some("127.0.0.1:5000");

        let req = admin_request(Method::GET, "/admin/tokens/local", Some(ADMIN_KEY), None, peer);
        let (_, _, body) = send(&app.router, req).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], app.state.authority.local_auth_code().await);

        let req = admin_request(Method::POST, "/admin/request-sync", Some(ADMIN_KEY), None, peer);
        let (status, _, body) = send(&app.router, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["linked"], false);

        let req = admin_request(
            Method::POST,
            "/admin/report-state",
            Some(ADMIN_KEY),
            Some(json!({ "deviceId": "lamp-1" })),
            peer,
        );
        assert_eq!(send(&app.router, req).await.0, StatusCode::BAD_REQUEST);

        let req = admin_request(
            Method::POST,
            "/admin/report-state",
            Some(ADMIN_KEY),
            Some(json!({ "deviceId": "lamp-1", "states": { "on": true } })),
            peer,
        );
        assert_eq!(send(&app.router, req).await.0, StatusCode::ACCEPTED);
    }
}

mod google_login {
    use super::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GOOGLE_CLIENT: &str = "bridge.apps.googleusercontent.com";
    const TEST_KEY: &str = include_str!("fixtures/test_rsa_key.pem");
    const TEST_JWKS: &str = include_str!("fixtures/test_jwks.json");

    fn id_token(email: &str, verified: bool) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("test-key-1".to_string());
        encode(
            &header,
            &json!({
                "sub": "g-1",
                "email": email,
                "email_verified": verified,
                "aud": GOOGLE_CLIENT,
                "iss": "https://accounts.google.com",
                "exp": chrono::Utc::now().timestamp() + 600,
            }),
            &EncodingKey::from_rsa_pem(TEST_KEY.as_bytes()).unwrap(),
        )
        .unwrap()
    }

    async fn google_app() -> (TestApp, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(TEST_JWKS, "application/json"))
            .mount(&server)
            .await;

        let mut env = base_env();
        env.push(("SMARTHOME_GOOGLE_CLIENT_ID", GOOGLE_CLIENT));
        env.push(("SMARTHOME_ALLOWED_EMAILS", "owner@example.com"));
        let mut app = test_app_with(config_from(env)).await;

        // the router holds a clone; rebuild it after pointing at the mock
        drop(app.router);
        Arc::get_mut(&mut app.state).unwrap().jwks_uri = format!("{}/certs", server.uri());
        app.router = api::router(app.state.clone());
        (app, server)
    }

    async fn submit(app: &TestApp, token: &str) -> StatusCode {
        let body = form(&[
            ("client_id", CLIENT_ID),
            ("redirect_uri", REDIRECT),
            ("id_token", token),
        ]);
        send(&app.router, form_request("/oauth", body)).await.0
    }

    #[tokio::test]
    async fn test_allowed_verified_email_gets_code() {
        let (app, _server) = google_app().await;
        assert_eq!(submit(&app, &id_token("owner@example.com", true)).await, StatusCode::FOUND);
        assert_eq!(app.state.authority.status().await.pending_codes, 1);
    }

    #[tokio::test]
    async fn test_unlisted_or_unverified_email_is_refused() {
        let (app, _server) = google_app().await;
        assert_eq!(
            submit(&app, &id_token("stranger@example.com", true)).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            submit(&app, &id_token("owner@example.com", false)).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(app.state.authority.status().await.pending_codes, 0);
    }
}
