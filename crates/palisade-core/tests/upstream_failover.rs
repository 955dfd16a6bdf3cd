use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use palisade_core::{
    NodeEndpoint, NodePool, NodeSelectionConfig, UpstreamClient, UpstreamConfig, UpstreamRequest,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy)]
enum Behaviour {
    Healthy,
    ServerError,
    AppError,
}

struct MockNode {
    endpoint: NodeEndpoint,
    hits: Arc<AtomicUsize>,
}

async fn block_number(
    State((behaviour, hits)): State<(Behaviour, Arc<AtomicUsize>)>,
) -> (StatusCode, Json<Value>) {
    hits.fetch_add(1, Ordering::SeqCst);
    match behaviour {
        Behaviour::Healthy => (StatusCode::OK, Json(json!({"blockNumber": "0x10"}))),
        Behaviour::ServerError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "boom"})),
        ),
        Behaviour::AppError => (StatusCode::OK, Json(json!({"error": "not synced"}))),
    }
}

async fn spawn_node(behaviour: Behaviour) -> MockNode {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/eth_blockNumber", get(block_number))
        .with_state((behaviour, hits.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockNode {
        endpoint: NodeEndpoint::new("127.0.0.1", port),
        hits,
    }
}

fn fast_config(max_retries: i32) -> UpstreamConfig {
    UpstreamConfig {
        max_retries,
        backoff_min_ms: 1,
        backoff_max_ms: 5,
        ..UpstreamConfig::default()
    }
}

fn client_over(nodes: &[&MockNode], config: UpstreamConfig) -> (UpstreamClient, Arc<NodePool>) {
    let pool = Arc::new(NodePool::new(&NodeSelectionConfig::default(), &config));
    pool.replace_nodes(nodes.iter().map(|n| n.endpoint.clone()).collect());
    (UpstreamClient::new(pool.clone(), config), pool)
}

#[tokio::test]
async fn failing_node_is_blacklisted_and_retry_lands_elsewhere() {
    let good_a = spawn_node(Behaviour::Healthy).await;
    let failing = spawn_node(Behaviour::ServerError).await;
    let good_b = spawn_node(Behaviour::Healthy).await;

    // Rotation starts at index 1, so the failing node serves the first attempt.
    let (client, pool) = client_over(&[&good_a, &failing, &good_b], fast_config(3));

    let resp = client
        .call(UpstreamRequest::get("/eth_blockNumber"))
        .await
        .expect("retry should succeed on another node");

    assert_eq!(failing.hits.load(Ordering::SeqCst), 1);
    assert!(pool.is_bad(&failing.endpoint));
    assert_ne!(resp.node_url, failing.endpoint.base_url());
    assert_eq!(resp.body["nodeUrl"], Value::String(resp.node_url.clone()));
    assert_eq!(resp.body["blockNumber"], "0x10");
}

#[tokio::test]
async fn application_error_counts_as_failure() {
    let healthy = spawn_node(Behaviour::Healthy).await;
    let erroring = spawn_node(Behaviour::AppError).await;
    let (client, _) = client_over(&[&healthy, &erroring], fast_config(3));

    assert_eq!(client.block_number().await, Some(16));
    assert_eq!(erroring.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_retries_return_no_result() {
    let a = spawn_node(Behaviour::ServerError).await;
    let b = spawn_node(Behaviour::ServerError).await;
    let c = spawn_node(Behaviour::ServerError).await;
    let (client, pool) = client_over(&[&a, &b, &c], fast_config(2));

    assert!(client.call(UpstreamRequest::get("/eth_blockNumber")).await.is_none());

    let total: usize = [&a, &b, &c]
        .iter()
        .map(|n| n.hits.load(Ordering::SeqCst))
        .sum();
    assert_eq!(total, 3, "one initial attempt plus two retries");
    // The bad list never covers two thirds of the pool or more.
    assert_eq!(pool.bad_count(), 2);
}

#[tokio::test]
async fn unpenalized_routes_never_blacklist() {
    let failing = spawn_node(Behaviour::ServerError).await;
    let healthy = spawn_node(Behaviour::Healthy).await;
    let config = UpstreamConfig {
        penalized_routes: Vec::new(),
        ..fast_config(1)
    };
    let (client, pool) = client_over(&[&healthy, &failing], config);

    assert!(client.call(UpstreamRequest::get("/eth_blockNumber")).await.is_some());
    assert_eq!(pool.bad_count(), 0);
}
