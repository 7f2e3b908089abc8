//! `ApiClient` against the mock server's control endpoints.

use reqwest::Method;
use serde_json::{Value, json};

use lib_alerts::retrieve::ky_http::ApiClient;
use project_tests::MockServer;

#[tokio::test]
async fn reset_form_is_accepted() {
    let server = MockServer::spawn().await.unwrap();
    let api = ApiClient::new(&server.reset_url(), None).unwrap();

    let resp = api.post_form::<Value>("", &[("client_id", "client_a")]).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.status, 200);
    let body = resp.data.unwrap();
    assert_eq!(body["status"], "reset");
    assert_eq!(body["client_id"], "client_a");
    assert_eq!(server.state.resets(), vec!["client_a"]);
}

#[tokio::test]
async fn client_errors_carry_the_body() {
    let server = MockServer::spawn().await.unwrap();
    let api = ApiClient::new(&server.reset_url(), None).unwrap();

    let resp = api.post_form::<Value>("", &[]).await.unwrap();
    assert!(!resp.success);
    assert_eq!(resp.status, 400);
    assert!(resp.data.is_none());
    assert!(resp.error_body.unwrap().contains("client_id required"));
}

#[tokio::test]
async fn json_confirmation_is_recorded() {
    let server = MockServer::spawn().await.unwrap();
    let api = ApiClient::new(&server.confirm_url(), Some("token".into())).unwrap();

    let body = json!({ "notification_id": "msg_1", "client_id": "client_a", "received_at": 1 });
    let resp = api.request::<Value, _>(Method::POST, "", None, Some(body)).await.unwrap();
    assert!(resp.success);
    assert_eq!(server.state.confirmations(), vec!["msg_1"]);
}
