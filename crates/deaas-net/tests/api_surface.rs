//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "tests"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "REST and WebSocket behaviour against a simulated provider."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use deaas_common::config::SimulationConfig;
use deaas_net::{
    ApiServerBuilder, ApiServerHandle, Dispatcher, HealthResponse, TelemetryBroadcaster,
    TelemetryFrame, TelemetryResponse,
};
use deaas_telemetry::model::metric;
use deaas_telemetry::{AssetKind, SimulatedProvider, TelemetryProvider};
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

async fn start() -> (Arc<SimulatedProvider>, ApiServerHandle) {
    let config = SimulationConfig {
        seed: Some(11),
        ..SimulationConfig::default()
    };
    let provider = Arc::new(SimulatedProvider::manual(&config, None).unwrap());
    let shared: Arc<dyn TelemetryProvider> = provider.clone();
    let dispatcher = Arc::new(Dispatcher::new(shared, TelemetryBroadcaster::new(64)));
    let handle = ApiServerBuilder::new("127.0.0.1:0".parse().unwrap(), dispatcher)
        .spawn()
        .await
        .unwrap();
    (provider, handle)
}

#[tokio::test]
async fn health_reports_provider() {
    let (_provider, handle) = start().await;
    let health: HealthResponse = Client::new()
        .get(format!("http://{}/health", handle.local_addr()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        health,
        HealthResponse {
            ok: true,
            telemetry_provider: "mock".into()
        }
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn telemetry_endpoint_watches_and_reads() {
    let (provider, handle) = start().await;
    let client = Client::new();
    let base = format!("http://{}", handle.local_addr());

    let response: TelemetryResponse = client
        .get(format!("{base}/api/telemetry?type=inverter&ids=7,8"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response.kind, "inverter");
    assert_eq!(response.data.len(), 2);
    assert_eq!(response.data[0].id, 7);
    assert_eq!(response.data[0].metrics.f64(metric::AC_POWER), Some(0.0));
    assert_eq!(provider.watched().len(), 2);

    let raw: Value = client
        .get(format!("{base}/api/telemetry?ids=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(raw["type"], "panel");
    assert_eq!(raw["data"][0]["metrics"]["DC_POWER"], json!(0.0));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn telemetry_endpoint_rejects_bad_queries() {
    let (_provider, handle) = start().await;
    let client = Client::new();
    let base = format!("http://{}", handle.local_addr());

    let missing = client
        .get(format!("{base}/api/telemetry?type=panel"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(
        body["error"],
        "ids query param required, e.g. ?type=panel&ids=1,2"
    );

    let wrong_kind = client
        .get(format!("{base}/api/telemetry?type=battery&ids=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_kind.status(), StatusCode::BAD_REQUEST);
    let body: Value = wrong_kind.json().await.unwrap();
    assert_eq!(body["error"], "type must be 'panel' or 'inverter'");

    handle.shutdown().await.unwrap();
}

async fn next_json(
    socket: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Value {
    let received = timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match received {
        WsMessage::Text(payload) => serde_json::from_str(&payload).unwrap(),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn websocket_streams_filtered_updates() {
    let (provider, handle) = start().await;
    provider.ensure_panel(1);

    let url = format!("ws://{}/ws", handle.local_addr());
    let (mut socket, _response) = connect_async(&url).await.unwrap();
    socket
        .send(WsMessage::Text(
            json!({"action": "subscribe", "channels": ["inverter"], "ids": [1]}).to_string(),
        ))
        .await
        .unwrap();

    let snapshot = next_json(&mut socket).await;
    assert_eq!(snapshot["event"], "snapshot");
    assert_eq!(snapshot["channel"], "inverter");
    assert_eq!(snapshot["data"][0]["id"], 1);
    assert_eq!(snapshot["data"][0]["metrics"]["AC_POWER"], json!(0.0));

    assert_eq!(provider.tick(), 2);

    let frame: TelemetryFrame = serde_json::from_value(next_json(&mut socket).await).unwrap();
    assert_eq!(frame.event, "telemetry");
    assert_eq!(frame.channel, AssetKind::Inverter);
    assert_eq!(frame.payload["type"], "inverter");
    assert_eq!(frame.payload["id"], 1);
    assert_eq!(frame.payload["source"], "mock");

    assert!(timeout(Duration::from_millis(50), socket.next())
        .await
        .is_err());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn websocket_rejects_unknown_channels() {
    let (provider, handle) = start().await;
    provider.ensure_panel(1);

    let url = format!("ws://{}/ws", handle.local_addr());
    let (mut socket, _response) = connect_async(&url).await.unwrap();
    socket
        .send(WsMessage::Text(
            json!({"action": "subscribe", "channels": ["battery"]}).to_string(),
        ))
        .await
        .unwrap();

    let reply = next_json(&mut socket).await;
    assert_eq!(reply["event"], "error");
    assert!(reply["message"].as_str().unwrap().contains("battery"));

    // The filter is untouched, so panel updates still arrive.
    provider.tick();
    let update = next_json(&mut socket).await;
    assert_eq!(update["event"], "telemetry");
    assert_eq!(update["channel"], "panel");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn cors_allows_any_origin_by_default() {
    let (_provider, handle) = start().await;
    let response = Client::new()
        .get(format!("http://{}/health", handle.local_addr()))
        .header("Origin", "http://localhost:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "*"
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn cors_echoes_only_configured_origins() {
    let config = SimulationConfig::default();
    let provider: Arc<dyn TelemetryProvider> =
        Arc::new(SimulatedProvider::manual(&config, None).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(provider, TelemetryBroadcaster::new(8)));
    let handle = ApiServerBuilder::new("127.0.0.1:0".parse().unwrap(), dispatcher)
        .cors_origins(vec!["https://ops.example.com".into()])
        .spawn()
        .await
        .unwrap();
    let client = Client::new();
    let url = format!("http://{}/health", handle.local_addr());

    let allowed = client
        .get(&url)
        .header("Origin", "https://ops.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(
        allowed.headers()["access-control-allow-origin"],
        "https://ops.example.com"
    );

    let other = client
        .get(&url)
        .header("Origin", "https://elsewhere.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert!(other.headers().get("access-control-allow-origin").is_none());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_cors_origin_fails_to_start() {
    let config = SimulationConfig::default();
    let provider: Arc<dyn TelemetryProvider> =
        Arc::new(SimulatedProvider::manual(&config, None).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(provider, TelemetryBroadcaster::new(8)));
    let result = ApiServerBuilder::new("127.0.0.1:0".parse().unwrap(), dispatcher)
        .cors_origins(vec!["bad\norigin".into()])
        .spawn()
        .await;
    assert!(result.is_err());
}
