mod common;

use capture_proxy::web;
use common::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn test_captured_requests_visible_through_api() {
    let origin = spawn_origin().await;
    let (state, proxy) = spawn_proxy(test_config()).await;
    let (api, server) = web::bind(state.clone()).unwrap();
    tokio::spawn(server);

    let client = proxied_client(proxy);
    for path in ["/one", "/two", "/three"] {
        client
            .get(format!("http://{origin}{path}"))
            .send()
            .await
            .unwrap();
    }

    let api_client = reqwest::Client::new();
    let body: serde_json::Value = api_client
        .get(format!("http://{api}/api/requests?limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 2);
    assert_eq!(body["requests"][0]["path"], "/two");
    assert_eq!(body["requests"][1]["path"], "/three");
    // "hello"
    assert_eq!(body["requests"][1]["response_body"], "aGVsbG8=");

    let id = body["requests"][1]["id"].as_str().unwrap().to_string();
    let record: serde_json::Value = api_client
        .get(format!("http://{api}/api/requests/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["url"], format!("http://{origin}/three"));

    let stats: serde_json::Value = api_client
        .get(format!("http://{api}/api/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_requests"], 3);
    assert_eq!(stats["http_requests"], 3);

    state.shutdown();
}

#[tokio::test]
async fn test_live_stream_delivers_new_records() {
    let origin = spawn_origin().await;
    let (state, proxy) = spawn_proxy(test_config()).await;
    let (api, server) = web::bind(state.clone()).unwrap();
    tokio::spawn(server);

    let mut stream = reqwest::Client::new()
        .get(format!("http://{api}/api/requests/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);

    let mut received = String::new();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !received.contains("connected") {
            let chunk = stream.chunk().await.unwrap().unwrap();
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .unwrap();
    assert_eq!(state.store.subscriber_count(), 1);

    proxied_client(proxy)
        .get(format!("http://{origin}/live"))
        .send()
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !received.contains(&format!("http://{origin}/live")) {
            let chunk = stream.chunk().await.unwrap().unwrap();
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .unwrap();
    assert!(received.contains("request"));

    state.shutdown();
}
