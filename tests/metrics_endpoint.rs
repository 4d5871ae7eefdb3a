use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::net::TcpListener as TokioTcpListener;

use sidecar_injector::metrics::metrics_app;
use sidecar_injector::{app, build_state_from_env};

// Spawns the webhook and metrics listeners sharing one state, the way the
// binary wires them up.
async fn spawn_servers() -> (String, String) {
    let state = build_state_from_env().unwrap();

    let webhook_listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let webhook_addr = webhook_listener.local_addr().unwrap();
    let webhook = app(state.clone());
    tokio::spawn(async move {
        axum::serve(webhook_listener, webhook).await.unwrap();
    });

    let metrics_listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let metrics_addr = metrics_listener.local_addr().unwrap();
    let metrics = metrics_app(state);
    tokio::spawn(async move {
        axum::serve(metrics_listener, metrics).await.unwrap();
    });

    (
        format!("http://{}", webhook_addr),
        format!("http://{}", metrics_addr),
    )
}

#[tokio::test]
async fn probes_respond_ok() {
    let (_, metrics_base) = spawn_servers().await;
    let client = Client::new();

    for path in ["/isAlive", "/isReady"] {
        let resp = client
            .get(format!("{}{}", metrics_base, path))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "ok");
    }
}

#[tokio::test]
async fn counters_track_admission_traffic() {
    let (webhook_base, metrics_base) = spawn_servers().await;
    let client = Client::new();
    let metrics_url = format!("{}/metrics", metrics_base);

    let before = client.get(&metrics_url).send().await.unwrap();
    let before = before.text().await.unwrap();
    assert!(before.contains("injector_requests_total 0"));
    assert!(before.contains("injector_mutations_total 0"));

    let review = json!({
        "request": {
            "uid": "11111111-2222-3333-4444-555555555555",
            "namespace": "default",
            "name": "cache",
            "operation": "CREATE",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "cache",
                    "annotations": { "redis-exporter-sidecar.nais.io/inject": "yes" }
                },
                "spec": { "containers": [{ "name": "redis", "image": "redis:6" }] }
            }
        }
    });
    let resp = client
        .post(format!("{}/mutate", webhook_base))
        .json(&review)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let after = client.get(&metrics_url).send().await.unwrap();
    let after = after.text().await.unwrap();
    assert!(after.contains("injector_requests_total 1"));
    assert!(after.contains("injector_mutations_total 1"));
    assert!(after.contains("injector_admission_errors_total 0"));

    let resp = client
        .post(format!("{}/mutate", webhook_base))
        .header("content-type", "application/json")
        .body("{broken")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let errored = client.get(&metrics_url).send().await.unwrap();
    let errored = errored.text().await.unwrap();
    assert!(errored.contains("injector_admission_errors_total 1"));
}
