//! HTTP routes exercised in-process through the router.

mod common;

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::{metadata, Harness};
use launchsnipe::api::{handle_client_message, router, ApiState, API_KEY_HEADER};
use launchsnipe::auth::NonceAuthority;
use launchsnipe::control::ControlEvent;
use launchsnipe::ingest::TokenIngestor;
use launchsnipe::metrics::TOKENS_INGESTED;
use launchsnipe::types::{Role, LAMPORTS_PER_SOL};

const KEY: &str = "test-key";

fn state(h: &Harness) -> ApiState {
    ApiState {
        store: h.store.clone(),
        ingestor: Arc::new(TokenIngestor::new(h.store.clone(), h.metrics.clone())),
        registry: h.registry.clone(),
        auth: Arc::new(NonceAuthority::new(h.ephemeral.clone(), Duration::from_secs(60))),
        launches: h.launches.clone(),
        control: h.control.clone(),
        metrics: h.metrics.clone(),
        api_key: KEY.to_string(),
    }
}

fn post(uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(key) = key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(state: &ApiState, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = router(state.clone()).oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

#[tokio::test]
async fn test_ingest_requires_api_key() -> Result<()> {
    let h = Harness::new().await?;
    let state = state(&h);
    let event = json!({ "mint": Pubkey::new_unique().to_string(), "signature": "sig" });

    let (status, body) = send(&state, post("/v1/tokens", None, event.clone())).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth");

    let (status, _) = send(&state, post("/v1/tokens", Some("wrong"), event.clone())).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Same length, one byte off.
    let (status, body) = send(&state, post("/v1/tokens", Some("test-kez"), event)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth");
    Ok(())
}

#[tokio::test]
async fn test_ingest_then_view_token() -> Result<()> {
    let h = Harness::new().await?;
    let state = state(&h);
    let mint = Pubkey::new_unique().to_string();
    let uri = format!("/v1/tokens/{}", mint);

    let (status, body) = send(&state, get(&uri, None)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let event = json!({ "mint": mint, "signature": "sig-1", "name": "Dog", "symbol": "DOG" });
    let (status, body) = send(&state, post("/v1/tokens", Some(KEY), event.clone())).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "inserted");

    let (_, body) = send(&state, post("/v1/tokens", Some(KEY), event)).await?;
    assert_eq!(body["status"], "skipped");

    let (status, body) = send(&state, get(&uri, None)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token"]["mint"], mint.as_str());
    assert_eq!(body["token"]["status"], "pending");
    assert!(body["score"].is_null());

    let (_, metrics) = send(&state, get("/v1/metrics", None)).await?;
    assert_eq!(metrics["counters"][TOKENS_INGESTED], 1);
    Ok(())
}

#[tokio::test]
async fn test_malformed_token_event_is_a_validation_error() -> Result<()> {
    let h = Harness::new().await?;
    let state = state(&h);

    let (status, body) = send(&state, post("/v1/tokens", Some(KEY), json!({ "mint": 42 }))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let bad_mint = json!({ "mint": "not-a-key", "signature": "sig" });
    let (status, _) = send(&state, post("/v1/tokens", Some(KEY), bad_mint)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_marks_user_active() -> Result<()> {
    let h = Harness::new().await?;
    let state = state(&h);
    let (user, _) = h.user(Role::Sniper, LAMPORTS_PER_SOL).await?;
    let uri = format!("/v1/users/{}/active", user.wallet);

    let (_, body) = send(&state, get(&uri, Some(KEY))).await?;
    assert_eq!(body["active"], false);

    let (status, _) = send(
        &state,
        post(&format!("/v1/users/{}/heartbeat", user.wallet), Some(KEY), Value::Null),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&state, get(&uri, Some(KEY))).await?;
    assert_eq!(body["active"], true);
    assert_eq!(body["heartbeat"], true);
    assert_eq!(body["has_key"], true);
    assert_eq!(body["can_snipe"], true);

    let stranger = Pubkey::new_unique().to_string();
    let (_, body) = send(
        &state,
        post("/v1/users/active", Some(KEY), json!({ "wallets": [user.wallet, stranger] })),
    )
    .await?;
    let statuses = body.as_array().expect("array");
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0]["active"], true);
    assert_eq!(statuses[1]["active"], false);
    Ok(())
}

#[tokio::test]
async fn test_nonce_issue_rejects_bad_address() -> Result<()> {
    let h = Harness::new().await?;
    let state = state(&h);

    let (status, body) = send(&state, post("/v1/auth/nonce", None, json!({ "wallet": "nope" }))).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let wallet = Pubkey::new_unique().to_string();
    let (status, body) = send(&state, post("/v1/auth/nonce", None, json!({ "wallet": wallet }))).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));

    let (status, body) = send(
        &state,
        post("/v1/auth/verify", None, json!({ "wallet": wallet, "signature": "1111" })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth");
    Ok(())
}

#[tokio::test]
async fn test_launch_route_maps_errors_to_status() -> Result<()> {
    let h = Harness::new().await?;
    let state = state(&h);
    let (creator, _) = h.user(Role::Creator, LAMPORTS_PER_SOL / 10).await?;
    let request = json!({
        "creator": creator.wallet,
        "metadata": metadata(),
        "bot_count": 2,
        "per_bot_buy": 50_000_000u64,
        "creator_buy": 0,
        "venue": "pump_fun",
    });

    let (status, _) = send(&state, post("/v1/launches", None, request.clone())).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&state, post("/v1/launches", Some(KEY), request)).await?;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "insufficient_balance");
    Ok(())
}

#[tokio::test]
async fn test_client_messages_get_replies() -> Result<()> {
    let h = Harness::new().await?;
    let state = state(&h);
    let (user, _) = h.user(Role::Sniper, LAMPORTS_PER_SOL).await?;

    let reply = handle_client_message(&state, &user.wallet, r#"{"type":"ping","id":"p-1"}"#).await;
    assert_eq!(reply, ControlEvent::Pong { id: "p-1".to_string() });

    let mut sniper_policy = user.sniper_policy.clone();
    sniper_policy.buy_amount = 10_000_000;
    let update = json!({ "type": "update_config", "sniper_policy": sniper_policy, "exit_policy": null });
    let reply = handle_client_message(&state, &user.wallet, &update.to_string()).await;
    match reply {
        ControlEvent::BotLog(log) => {
            assert!(log.id.starts_with("config:"));
            assert_eq!(log.level, "info");
        }
        other => panic!("unexpected reply {:?}", other),
    }
    let stored = h.store.get_user(&user.wallet).await?.expect("user");
    assert_eq!(stored.sniper_policy.buy_amount, 10_000_000);
    assert_eq!(stored.exit_policy, user.exit_policy);

    let reply = handle_client_message(&state, &user.wallet, "not json").await;
    assert!(matches!(reply, ControlEvent::BotLog(log) if log.level == "error"));
    Ok(())
}
