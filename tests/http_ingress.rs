use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use subsocket::application::{NamespaceOptions, Registry, apply_with};
use subsocket::cache::{CacheConfig, CacheEntry, build_fn};
use subsocket::domain::ApplyError;
use subsocket::infra::http::{HttpState, build_router};
use subsocket::infra::transport::Hub;
use subsocket_wire::SUBSOCKET_HEADER;
use tower::ServiceExt;

fn app() -> (Router, Arc<Registry>) {
    let hub = Hub::new(16);
    let registry = Arc::new(Registry::new(Arc::new(hub.clone()), CacheConfig::default()));

    let known_rooms = build_fn(|room: String| async move {
        if room.starts_with("room") {
            Ok(Some(CacheEntry::Terminal(json!({ "messages": [] }))))
        } else {
            Ok(None)
        }
    });
    let rooms = registry
        .register("rooms", Some(known_rooms), NamespaceOptions::default())
        .expect("register rooms");
    rooms
        .on(
            "chat",
            apply_with(|current: &mut Value, message: &Value, _: &[String]| {
                current["messages"]
                    .as_array_mut()
                    .ok_or_else(|| ApplyError::message("messages must be an array"))?
                    .push(message.clone());
                Ok(())
            }),
            None,
        )
        .expect("bind chat");
    rooms
        .on("thread:reply", apply_with(|_, _, _| Ok(())), None)
        .expect("bind reply");

    let router = build_router(HttpState {
        registry: Arc::clone(&registry),
        hub,
    });
    (router, registry)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn init_request(namespace_header: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/rooms/init")
        .header("content-type", "application/json");
    if let Some(value) = namespace_header {
        builder = builder.header(SUBSOCKET_HEADER, value);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

async fn json_body(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_probe_is_no_content() {
    let (router, _) = app();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn mutation_applies_and_returns_empty_object() {
    let (router, registry) = app();
    let response = router
        .oneshot(post(
            "/rooms/chat",
            json!({ "criteria": ["room1"], "data": "hi" }),
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({}));

    let rooms = registry.lookup("rooms").expect("rooms");
    assert_eq!(
        rooms.init_value(&["room1".to_string()]).await.expect("read"),
        json!({ "messages": ["hi"] })
    );
}

#[tokio::test]
async fn nested_event_paths_map_to_colon_names() {
    let (router, _) = app();
    let response = router
        .oneshot(post(
            "/rooms/thread/reply",
            json!({ "criteria": ["room1"], "data": "ok" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn mutation_on_missing_target_is_bad_request() {
    let (router, registry) = app();
    let response = router
        .oneshot(post(
            "/rooms/chat",
            json!({ "criteria": ["nowhere"], "data": "hi" }),
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await, json!({}));
    let rooms = registry.lookup("rooms").expect("rooms");
    assert!(rooms.init_cache().is_empty());
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let (router, _) = app();

    let unknown_event = router
        .clone()
        .oneshot(post("/rooms/shout", json!({ "criteria": ["room1"], "data": 1 })))
        .await
        .expect("response");
    assert_eq!(unknown_event.status(), StatusCode::NOT_FOUND);

    let unknown_namespace = router
        .oneshot(post("/games/move", json!({ "criteria": ["b1"], "data": 1 })))
        .await
        .expect("response");
    assert_eq!(unknown_namespace.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let (router, _) = app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/rooms/chat")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request");

    let response = router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn init_requires_matching_header() {
    let (router, _) = app();

    let missing = router
        .clone()
        .oneshot(init_request(None, json!({})))
        .await
        .expect("response");
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(missing).await,
        json!({ "error": "Invalid subsocket" })
    );

    let wrong = router
        .oneshot(init_request(Some("games"), json!({})))
        .await
        .expect("response");
    assert_eq!(wrong.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn init_returns_snapshot_or_requested_values() {
    let (router, registry) = app();
    let rooms = registry.lookup("rooms").expect("rooms");
    rooms
        .publish("chat", &["room1".to_string()], json!("hello"))
        .await
        .expect("publish");

    let snapshot = router
        .clone()
        .oneshot(init_request(Some("rooms"), json!({})))
        .await
        .expect("response");
    assert_eq!(snapshot.status(), StatusCode::OK);
    assert_eq!(
        json_body(snapshot).await,
        json!({ "room1": { "messages": ["hello"] } })
    );

    let listed = router
        .oneshot(init_request(
            Some("rooms"),
            json!({ "criteriaList": [["room1"], ["room2"], ["lobby"]] }),
        ))
        .await
        .expect("response");
    assert_eq!(listed.status(), StatusCode::OK);
    assert_eq!(
        json_body(listed).await,
        json!([{ "messages": ["hello"] }, { "messages": [] }, null])
    );
}
