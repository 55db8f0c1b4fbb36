use link_client::{HttpRemoteState, RemoteError, RemoteState, StateWrite};
use link_protocol::{CapabilityAction, StatePutBody, Stage};
use serde_json::json;
use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SESSION: &str = "SLX9A2B3C4D";

async fn client(server: &MockServer) -> HttpRemoteState {
    HttpRemoteState::new(&format!("{}/state", server.uri())).expect("valid url")
}

#[tokio::test]
async fn get_maps_empty_object_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/state"))
        .and(query_param("session", SESSION))
        .and(header("cache-control", "no-store"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let snapshot = client(&server).await.get(SESSION).await.expect("get");
    assert_eq!(snapshot, None);
}

#[tokio::test]
async fn get_decodes_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/state"))
        .and(query_param("session", SESSION))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "stage": 4,
            "twofa_verified": true,
            "linking_code": "AB12",
            "updated_at": 1714557600,
            "actor_tg_user_id": 42,
            "actor_chat_id": 42,
            "tg_username": "alice",
            "tg_display_name": null,
            "tg_photo_url": null,
            "send_test_at": null
        })))
        .mount(&server)
        .await;

    let snapshot = client(&server)
        .await
        .get(SESSION)
        .await
        .expect("get")
        .expect("record");
    assert_eq!(snapshot.stage, Stage::CODE_ISSUED);
    assert!(snapshot.twofa_verified);
    assert_eq!(snapshot.linking_code.as_deref(), Some("AB12"));
    assert_eq!(snapshot.updated_at, 1_714_557_600);
    assert_eq!(snapshot.actor_tg_user_id, Some(42));
    assert_eq!(snapshot.tg_username.as_deref(), Some("alice"));
}

#[tokio::test]
async fn admin_reset_sends_reset_headers() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/state"))
        .and(query_param("session", SESSION))
        .and(header("x-admin-reset", "1"))
        .and(header("x-client-aborted", "1"))
        .and(body_json(json!({"stage": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let ack = client(&server)
        .await
        .put(SESSION, &StateWrite::admin_reset(Stage::TWO_FACTOR_ENABLED, true))
        .await
        .expect("put");
    assert!(ack.ok);
    assert!(ack.capabilities.is_empty());
}

#[tokio::test]
async fn client_stage_write_carries_capability_and_reads_grants() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/state"))
        .and(header("x-client-stage", "6"))
        .and(header("x-link-capability", "v1.token"))
        .and(body_json(json!({"stage": 6})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "capabilities": {"unlink": "v1.unlink", "test_message": "v1.test"}
        })))
        .mount(&server)
        .await;

    let write = StateWrite::client_stage(Stage::LINKED).with_capability(Some("v1.token".into()));
    let ack = client(&server).await.put(SESSION, &write).await.expect("put");
    assert_eq!(
        ack.capabilities.get(&CapabilityAction::Unlink).map(String::as_str),
        Some("v1.unlink")
    );
    assert_eq!(
        ack.capabilities.get(&CapabilityAction::TestMessage).map(String::as_str),
        Some("v1.test")
    );
}

#[tokio::test]
async fn bot_writes_use_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/state"))
        .and(header("authorization", "Bearer bot-secret"))
        .and(header("x-profile-only", "1"))
        .and(body_json(json!({"tg_username": "alice"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let body = StatePutBody {
        tg_username: Some("alice".to_string()),
        ..StatePutBody::default()
    };
    client(&server)
        .await
        .put(SESSION, &StateWrite::profile_only("bot-secret", body))
        .await
        .expect("put");
}

#[tokio::test]
async fn test_message_write_is_stage_six_scoped() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(header("x-client-stage", "6"))
        .and(body_json(json!({"test_message": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let ack = client(&server)
        .await
        .put(SESSION, &StateWrite::test_message())
        .await
        .expect("put");
    assert!(ack.ok);
}

#[tokio::test]
async fn error_status_surfaces_error_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Unauthorized"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": "DB read error",
            "detail": "connection refused"
        })))
        .mount(&server)
        .await;

    let remote = client(&server).await;
    let err = remote
        .put(SESSION, &StateWrite::bot("wrong", StatePutBody::with_stage(Stage::LINKED)))
        .await
        .expect_err("unauthorized");
    assert_eq!(err.status(), Some(401));
    assert!(err.to_string().contains("Unauthorized"));

    let err = remote.get(SESSION).await.expect_err("server error");
    assert!(matches!(
        err,
        RemoteError::Status { status: 500, ref message } if message == "DB read error: connection refused"
    ));
}

#[tokio::test]
async fn lookup_by_telegram_user() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("tg", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": SESSION,
            "stage": 6,
            "twofa_verified": true,
            "updated_at": 10
        })))
        .mount(&server)
        .await;

    let snapshot = client(&server)
        .await
        .find_by_telegram_user(42)
        .await
        .expect("lookup")
        .expect("record");
    assert_eq!(snapshot.session_id.as_deref(), Some(SESSION));
    assert_eq!(snapshot.stage, Stage::LINKED);
}

#[tokio::test]
async fn unreachable_endpoint_is_an_http_error() {
    let remote = HttpRemoteState::new("http://127.0.0.1:9/state").expect("valid url");
    let err = remote.get(SESSION).await.expect_err("nothing listens on port 9");
    assert!(matches!(err, RemoteError::Http(_)));
    assert!(matches!(
        HttpRemoteState::new("not a url"),
        Err(RemoteError::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn header_exists_for_every_write_kind() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(header_exists("content-type"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(3)
        .mount(&server)
        .await;

    let remote = client(&server).await;
    for write in [
        StateWrite::admin_reset(Stage::LINK_GENERATED, false),
        StateWrite::client_stage(Stage::UNLINKED),
        StateWrite::bot("t", StatePutBody::with_stage(Stage::CODE_ISSUED)),
    ] {
        remote.put(SESSION, &write).await.expect("put");
    }
}
