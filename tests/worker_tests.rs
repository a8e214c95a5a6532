//! End-to-end tests over the router with scripted terminal mocks.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use qproxy::pool::{PoolError, PoolOptions, SessionPool};
use qproxy::session::SessionOptions;
use qproxy::store::derive_sop_id;
use qproxy::term::ClientError;

mod common;
use common::{MockConnector, Script, echoing_script, test_app, wait_ready};

const USABLE_ANSWER: &str = "The root_cause is disk pressure on node-7";

fn incident_request(body: &Value) -> Request<Body> {
    Request::builder()
        .uri("/incident")
        .method(Method::POST)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = test_app(MockConnector::new(echoing_script(USABLE_ANSWER)), 1).await;
    wait_ready(&app.pool, 1).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["ready"], 1);
    assert_eq!(json["size"], 1);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cold_start_single_request() {
    let app = test_app(MockConnector::new(echoing_script(USABLE_ANSWER)), 1).await;
    wait_ready(&app.pool, 1).await;
    let offset = app.log.commands().len();

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({
            "incident_key": "K1",
            "prompt": "P1",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["answer"], USABLE_ANSWER);

    // The mapping was derived and persisted.
    let map_path = app.dir.path().join("conversations/_sopmap.json");
    let map: Value = serde_json::from_slice(&std::fs::read(&map_path).unwrap()).unwrap();
    assert_eq!(map["K1"], derive_sop_id("K1"));

    // The answer was usable, so the conversation was compacted and saved.
    let commands = app.log.commands()[offset..].to_vec();
    let conv_file = format!("{}.json", derive_sop_id("K1"));
    assert!(commands.iter().any(|c| c == "/compact"));
    assert!(
        commands
            .iter()
            .any(|c| c.starts_with("/save") && c.contains(&conv_file) && c.ends_with("-f"))
    );
    assert!(commands.iter().any(|c| c == "/clear\ny"));
}

#[tokio::test]
async fn test_rerun_with_history_loads_first() {
    let app = test_app(MockConnector::new(echoing_script(USABLE_ANSWER)), 1).await;
    wait_ready(&app.pool, 1).await;

    let sop_id = derive_sop_id("K1");
    let conv_path = app
        .dir
        .path()
        .join("conversations")
        .join(format!("{sop_id}.json"));
    std::fs::write(&conv_path, b"{\"history\": []}").unwrap();
    let offset = app.log.commands().len();

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({
            "incident_key": "K1",
            "prompt": "P2",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let commands = app.log.commands()[offset..].to_vec();
    let pos = |pred: &dyn Fn(&str) -> bool| commands.iter().position(|c| pred(c)).unwrap();
    let load = pos(&|c| c.starts_with("/load") && c.contains(sop_id.as_str()));
    let ask = pos(&|c| c.contains("P2"));
    let compact = pos(&|c| c == "/compact");
    let save = pos(&|c| c.starts_with("/save"));
    let clear = pos(&|c| c == "/clear\ny");
    assert!(load < ask, "history must be loaded before the prompt");
    assert!(ask < compact && compact < save && save < clear);
}

#[tokio::test]
async fn test_quota_exhausted_prompt_only() {
    let script: Script = Arc::new(|_id, prompt| {
        if prompt.starts_with('/') {
            Ok("> ".to_string())
        } else {
            // The REPL accepts the input and prints nothing but a prompt.
            Ok("> ".to_string())
        }
    });
    let app = test_app(MockConnector::new(script), 1).await;
    wait_ready(&app.pool, 1).await;
    let offset = app.log.commands().len();

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({
            "incident_key": "K1",
            "prompt": "P1",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(response).await;
    assert!(
        json["error"].as_str().unwrap().contains("quota_exhausted"),
        "got: {json}"
    );

    // No persistence happened; the last saved conversation is untouched.
    let commands = app.log.commands()[offset..].to_vec();
    assert!(!commands.iter().any(|c| c == "/compact"));
    assert!(!commands.iter().any(|c| c.starts_with("/save")));
}

#[tokio::test]
async fn test_unusable_answer_skips_persist() {
    let app = test_app(MockConnector::new(echoing_script("ok")), 1).await;
    wait_ready(&app.pool, 1).await;
    let offset = app.log.commands().len();

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({
            "incident_key": "K1",
            "prompt": "P1",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["answer"], "ok");

    let commands = app.log.commands()[offset..].to_vec();
    assert!(!commands.iter().any(|c| c == "/compact"));
    assert!(!commands.iter().any(|c| c.starts_with("/save")));
    // Cleanup still runs.
    assert!(commands.iter().any(|c| c == "/clear\ny"));
}

#[tokio::test]
async fn test_sop_id_override_recorded() {
    let app = test_app(MockConnector::new(echoing_script(USABLE_ANSWER)), 1).await;
    wait_ready(&app.pool, 1).await;
    let offset = app.log.commands().len();

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({
            "incident_key": "K2",
            "sop_id": "sop_abcdef012345",
            "prompt": "P",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let map_path = app.dir.path().join("conversations/_sopmap.json");
    let map: Value = serde_json::from_slice(&std::fs::read(&map_path).unwrap()).unwrap();
    assert_eq!(map["K2"], "sop_abcdef012345");

    let commands = app.log.commands()[offset..].to_vec();
    assert!(
        commands
            .iter()
            .any(|c| c.starts_with("/save") && c.contains("sop_abcdef012345.json"))
    );
}

#[tokio::test]
async fn test_mid_request_disconnect_reconnects_once() {
    // The first dialed client drops the channel on the real ask; the redial
    // succeeds and the request completes.
    let script: Script = Arc::new(|id, prompt| {
        if prompt.starts_with('/') {
            Ok("> ".to_string())
        } else if id == 1 {
            Err(ClientError::Connection("broken pipe".to_string()))
        } else {
            Ok(format!("{prompt}\n{USABLE_ANSWER}\n> "))
        }
    });
    let app = test_app(MockConnector::new(script), 1).await;
    wait_ready(&app.pool, 1).await;

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({
            "incident_key": "K1",
            "prompt": "P1",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["answer"], USABLE_ANSWER);
    assert_eq!(app.log.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_second_disconnect_marks_broken() {
    // Every client drops the channel on the real ask: the one retry also
    // fails, the lease is marked broken and a refill replaces the session.
    let script: Script = Arc::new(|_id, prompt| {
        if prompt.starts_with('/') {
            Ok("> ".to_string())
        } else {
            Err(ClientError::Connection("broken pipe".to_string()))
        }
    });
    let app = test_app(MockConnector::new(script), 1).await;
    wait_ready(&app.pool, 1).await;

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({
            "incident_key": "K1",
            "prompt": "P1",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // The broken session was replaced in the background.
    wait_ready(&app.pool, 1).await;
    assert!(app.log.dials.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_rejects_bad_bodies() {
    let app = test_app(MockConnector::new(echoing_script(USABLE_ANSWER)), 1).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/incident")
                .method(Method::POST)
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .clone()
        .oneshot(incident_request(&json!({"incident_key": "K1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_saturation_respects_pool_size() {
    let connector = MockConnector::new(echoing_script(USABLE_ANSWER))
        .with_ask_delay(Duration::from_millis(50));
    let app = test_app(connector, 3).await;
    wait_ready(&app.pool, 3).await;

    let mut requests = Vec::new();
    for i in 0..10 {
        let router = app.router.clone();
        requests.push(async move {
            router
                .oneshot(incident_request(&json!({
                    "incident_key": format!("K{i}"),
                    "prompt": format!("P{i}"),
                })))
                .await
                .unwrap()
        });
    }
    let responses = futures::future::join_all(requests).await;
    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(
        app.log.max_in_flight.load(Ordering::SeqCst) <= 3,
        "at most pool-size asks may run at once, saw {}",
        app.log.max_in_flight.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_pool_failure_ceiling_and_reset() {
    let connector = Arc::new(MockConnector::new(echoing_script(USABLE_ANSWER)));
    connector.fail_dials.store(u32::MAX, Ordering::SeqCst);

    let pool = SessionPool::new(
        connector.clone(),
        PoolOptions {
            size: 1,
            dial_timeout: Duration::from_millis(200),
            fail_ceiling: 2,
            session: SessionOptions::default(),
        },
    );

    // Burn through the ceiling.
    let mut saw_unhealthy = false;
    for _ in 0..5 {
        match pool.acquire(Duration::from_millis(200)).await {
            Err(PoolError::Unhealthy(_)) => {
                saw_unhealthy = true;
                break;
            }
            Err(_) => continue,
            Ok(_) => panic!("acquire must not succeed while dials fail"),
        }
    }
    assert!(saw_unhealthy, "failure ceiling never tripped");

    // One successful dial resets the streak and the pool recovers.
    connector.fail_dials.store(0, Ordering::SeqCst);
    pool.reset_failures();
    let lease = pool.acquire(Duration::from_secs(2)).await.unwrap();
    lease.release().await;
    let (ready, size) = pool.stats();
    assert_eq!((ready, size), (1, 1));
}
