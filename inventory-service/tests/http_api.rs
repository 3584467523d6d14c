mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use inventory_service::api::create_router;
use inventory_service::clock::Clock;
use inventory_service::webhooks::stripe;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn health_check_answers_ok() {
    let app = common::app();
    let router = create_router(app.state.clone());

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn checkout_flow_over_http() {
    let app = common::app();
    let router = create_router(app.state.clone());
    let product_id = Uuid::new_v4();
    let order_id = Uuid::new_v4();

    let (status, _) = send(
        &router,
        Method::POST,
        "/products",
        Some(json!({"product_id": product_id, "quantity": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, reservation) = send(
        &router,
        Method::POST,
        "/reservations",
        Some(json!({"product_id": product_id, "quantity": 3, "order_id": order_id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reservation["state"], "reserved");
    let reservation_id = reservation["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        Method::POST,
        "/reservations",
        Some(json!({"product_id": product_id, "quantity": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "insufficient_stock");

    let (status, stock) = send(&router, Method::GET, &format!("/products/{}/stock", product_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stock["available_quantity"], 2);

    let (status, confirmed) = send(
        &router,
        Method::POST,
        &format!("/reservations/{}/confirm", reservation_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["state"], "confirmed");

    let (status, body) = send(
        &router,
        Method::POST,
        &format!("/reservations/{}/cancel", reservation_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_terminal");

    let (_, listed) = send(&router, Method::GET, &format!("/orders/{}/reservations", order_id), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (_, movements) = send(&router, Method::GET, &format!("/products/{}/movements", product_id), None).await;
    let reasons: Vec<&str> = movements
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["reason"].as_str().unwrap())
        .collect();
    assert_eq!(reasons, vec!["manual-adjust", "reserve", "confirm"]);

    let (_, report) = send(
        &router,
        Method::GET,
        &format!("/products/{}/reconciliation", product_id),
        None,
    )
    .await;
    assert_eq!(report["consistent"], true);
}

#[tokio::test]
async fn manual_adjustment_rejects_negative_result() {
    let app = common::app();
    let router = create_router(app.state.clone());
    let product_id = app.product(2).await;

    let (status, body) = send(
        &router,
        Method::POST,
        &format!("/products/{}/adjustments", product_id),
        Some(json!({"delta": -3})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "insufficient_stock");

    let (status, body) = send(
        &router,
        Method::POST,
        &format!("/products/{}/adjustments", product_id),
        Some(json!({"delta": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["new_quantity"], 6);
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let app = common::app();
    let router = create_router(app.state.clone());

    let (status, _) = send(&router, Method::GET, &format!("/reservations/{}", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, Method::GET, &format!("/products/{}/stock", Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Kiwify has no secret configured, so its route is not mounted.
    let (status, body) = send(&router, Method::POST, "/webhooks/kiwify", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_provider");
}

#[tokio::test]
async fn webhook_signature_failure_is_unauthorized() {
    let app = common::app();
    let router = create_router(app.state.clone());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/stripe")
        .header(stripe::SIGNATURE_HEADER, "t=1,v1=00")
        .body(Body::from(r#"{"id":"evt_forged","type":"charge.refunded"}"#))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.state.idempotency.get("stripe:evt_forged").await.unwrap().is_none());
}

#[tokio::test]
async fn webhook_redelivery_returns_stored_result() {
    let app = common::app();
    let router = create_router(app.state.clone());
    let product_id = app.product(4).await;
    let reservation = app.state.reservations.reserve(product_id, 1, None).await.unwrap();

    let body = serde_json::to_vec(&common::stripe_event(
        "evt_http",
        "payment_intent.succeeded",
        json!({"reservation_id": reservation.id}),
    ))
    .unwrap();
    let signature = stripe::sign(common::STRIPE_SECRET, app.clock.now().timestamp(), &body);

    let deliver = || {
        Request::builder()
            .method(Method::POST)
            .uri("/webhooks/stripe")
            .header(stripe::SIGNATURE_HEADER, signature.clone())
            .body(Body::from(body.clone()))
            .unwrap()
    };

    let first = router.clone().oneshot(deliver()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first: Value = serde_json::from_slice(&to_bytes(first.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(first["status"], "applied");

    let second = router.clone().oneshot(deliver()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second: Value = serde_json::from_slice(&to_bytes(second.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(second["status"], "replayed");
    assert_eq!(second["result"], first["result"]);
}

#[tokio::test]
async fn in_flight_webhook_asks_sender_to_retry() {
    let app = common::app();
    let router = create_router(app.state.clone());
    app.state.idempotency.begin("hotmart:h-busy", app.clock.now()).await.unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/hotmart")
        .header("x-hotmart-hottok", common::HOTTOK)
        .body(Body::from(r#"{"id":"h-busy","event":"PURCHASE_APPROVED","data":{}}"#))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(response.headers()[header::RETRY_AFTER], "30");
}
