use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use iot_relay::{Relay, RelayConfig, build_relay_app};
use serde_json::{Value, json};
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

type ControllerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(config: RelayConfig) -> (SocketAddr, JoinHandle<()>, Relay) {
    let relay = Relay::new(config);
    let app = build_relay_app(relay.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("relay should run");
    });
    (addr, handle, relay)
}

async fn send_frame(socket: &mut ControllerSocket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .expect("frame should send");
}

async fn next_frame(socket: &mut ControllerSocket) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("relay should send a frame")
            .expect("channel should stay open")
            .expect("frame should be readable");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("frame should be json");
        }
    }
}

/// Connects a fake controller and returns it with the scan request it received.
async fn connect_controller(addr: SocketAddr, name: &str) -> (ControllerSocket, Value) {
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/iot/channel"))
        .await
        .expect("channel should upgrade");
    send_frame(
        &mut socket,
        json!({"event": "IOT_CLIENT_READY", "data": {"type": "IOT_CONTROLLER", "name": name}}),
    )
    .await;
    let scan = next_frame(&mut socket).await;
    (socket, scan)
}

async fn controllers(client: &reqwest::Client, addr: SocketAddr) -> Vec<Value> {
    client
        .get(format!("http://{addr}/iot/controllers"))
        .send()
        .await
        .expect("controllers request should succeed")
        .json::<Vec<Value>>()
        .await
        .expect("controllers should be json")
}

async fn wait_for_controller_count(
    client: &reqwest::Client,
    addr: SocketAddr,
    expected: usize,
) -> Vec<Value> {
    for _ in 0..100 {
        let listed = controllers(client, addr).await;
        if listed.len() == expected {
            return listed;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("controller count never reached {expected}");
}

async fn announced(
    client: &reqwest::Client,
    addr: SocketAddr,
    name: &str,
) -> (ControllerSocket, String) {
    let (socket, _scan) = connect_controller(addr, name).await;
    let listed = wait_for_controller_count(client, addr, 1).await;
    let controller_id = listed[0]["controllerId"]
        .as_str()
        .expect("controller id should be a string")
        .to_string();
    (socket, controller_id)
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let body = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .expect("healthz should respond")
        .json::<Value>()
        .await
        .expect("healthz should be json");
    assert_eq!(body, json!({"status": "ok"}));
    handle.abort();
}

#[tokio::test]
async fn announced_controller_is_listed_and_asked_to_scan() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig {
        scan_timeout_ms: 5_000,
        ..RelayConfig::default()
    })
    .await;
    let client = reqwest::Client::new();

    let (_socket, scan) = connect_controller(addr, "Rig-1").await;
    assert_eq!(
        scan,
        json!({"event": "IOT_SCAN_REQUEST", "data": {"scanTimeout": 5000}})
    );

    let listed = wait_for_controller_count(&client, addr, 1).await;
    assert_eq!(listed[0]["name"], "Rig-1");
    assert!(
        listed[0]["controllerId"]
            .as_str()
            .is_some_and(|id| !id.is_empty())
    );
    handle.abort();
}

#[tokio::test]
async fn device_reports_are_listed_per_controller() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let (mut socket, controller_id) = announced(&client, addr, "Rig-1").await;

    let device = json!({"connected": false, "deviceId": "dev1", "address": "AA:BB", "name": "BB-1"});
    send_frame(
        &mut socket,
        json!({"event": "IOT_DEVICE_MSG", "data": device.clone()}),
    )
    .await;

    let mut listed = Vec::new();
    for _ in 0..100 {
        listed = client
            .get(format!("http://{addr}/iot/devices/{controller_id}"))
            .send()
            .await
            .expect("devices request should succeed")
            .json::<Vec<Value>>()
            .await
            .expect("devices should be json");
        if !listed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(listed, vec![device]);
    handle.abort();
}

#[tokio::test]
async fn unknown_controller_is_not_found() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/iot/devices/missing"))
        .send()
        .await
        .expect("devices request should respond");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body = response.json::<Value>().await.expect("error should be json");
    assert_eq!(body["error"], "unknown controller: missing");

    let response = client
        .get(format!("http://{addr}/bb8/roll/missing/dev1/10/0"))
        .send()
        .await
        .expect("roll request should respond");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    handle.abort();
}

#[tokio::test]
async fn connect_waits_for_tagged_result() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let (mut socket, controller_id) = announced(&client, addr, "Rig-1").await;

    let request = {
        let client = client.clone();
        let url = format!("http://{addr}/bb8/connect/{controller_id}/dev1");
        tokio::spawn(async move { client.get(url).send().await })
    };

    let command = next_frame(&mut socket).await;
    assert_eq!(command["event"], "IOT_COMMAND");
    assert_eq!(command["data"]["cmdId"], "BB8_CONNECTION_REQUEST");
    assert_eq!(command["data"]["deviceId"], "dev1");
    assert_eq!(command["data"]["requestResult"], true);
    let tag = command["data"]["tag"]
        .as_str()
        .expect("connect should be tagged")
        .to_string();

    send_frame(
        &mut socket,
        json!({"event": "IOT_COMMAND_RESULT", "data": {"tag": "someone-else", "status": "nope"}}),
    )
    .await;
    send_frame(
        &mut socket,
        json!({"event": "IOT_COMMAND_RESULT", "data": {"tag": tag, "status": "device connected"}}),
    )
    .await;

    let response = request
        .await
        .expect("request task should join")
        .expect("connect should respond");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.json::<String>().await.expect("status string"),
        "device connected"
    );
    handle.abort();
}

#[tokio::test]
async fn connect_failure_reported_by_controller_maps_to_status() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let (mut socket, controller_id) = announced(&client, addr, "Rig-1").await;

    let request = {
        let client = client.clone();
        let url = format!("http://{addr}/bb8/connect/{controller_id}/dev1");
        tokio::spawn(async move { client.get(url).send().await })
    };
    let command = next_frame(&mut socket).await;
    let tag = command["data"]["tag"].clone();
    send_frame(
        &mut socket,
        json!({"event": "IOT_COMMAND_RESULT", "data": {
            "tag": tag,
            "status": "failed",
            "error": {"kind": "DriverFailure", "message": "driver failure: connect was never confirmed"}
        }}),
    )
    .await;

    let response = request
        .await
        .expect("request task should join")
        .expect("connect should respond");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body = response.json::<Value>().await.expect("error should be json");
    assert_eq!(body["error"], "driver failure: connect was never confirmed");
    handle.abort();
}

#[tokio::test]
async fn silent_controller_times_out_connect() {
    let (addr, handle, relay) = spawn_relay(RelayConfig {
        result_timeout: Duration::from_millis(200),
        ..RelayConfig::default()
    })
    .await;
    let client = reqwest::Client::new();
    let (_socket, controller_id) = announced(&client, addr, "Rig-1").await;

    let response = client
        .get(format!("http://{addr}/bb8/connect/{controller_id}/dev1"))
        .send()
        .await
        .expect("connect should respond");
    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(relay.router().pending_count().await, 0);
    handle.abort();
}

#[tokio::test]
async fn fire_and_forget_routes_send_typed_commands() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let (mut socket, controller_id) = announced(&client, addr, "Rig-1").await;
    let base = format!("http://{addr}/bb8");

    let cases = [
        (
            format!("{base}/roll/{controller_id}/dev1/50/90"),
            "ROLL",
            json!({"speed": 50.0, "heading": 90.0}),
        ),
        (
            format!("{base}/roll/{controller_id}/dev1/37.5/123.69"),
            "ROLL",
            json!({"speed": 37.5, "heading": 123.69}),
        ),
        (
            format!("{base}/roll/{controller_id}/dev1/300/-45"),
            "ROLL",
            json!({"speed": 300.0, "heading": -45.0}),
        ),
        (
            format!("{base}/heading/{controller_id}/dev1/270"),
            "HEADING",
            json!({"heading": 270.0}),
        ),
        (
            format!("{base}/heading/{controller_id}/dev1/45.5"),
            "HEADING",
            json!({"heading": 45.5}),
        ),
        (
            format!("{base}/color/{controller_id}/dev1/00FF00"),
            "COLOR",
            json!({"color": 0x00FF00}),
        ),
        (
            format!("{base}/blink/{controller_id}/dev1/true/500/FF0000"),
            "BLINK",
            json!({"enabled": true, "period": 500, "color": 0xFF0000}),
        ),
        (
            format!("{base}/blink/{controller_id}/dev1/yes/0/0000FF"),
            "BLINK",
            json!({"enabled": false, "period": 0, "color": 0x0000FF}),
        ),
        (
            format!("{base}/path/{controller_id}/dev1/40/square"),
            "PATH",
            json!({"speed": 40.0, "type": "square", "length": 3.0}),
        ),
        (
            format!("{base}/path/{controller_id}/dev1/40/zigzag"),
            "PATH",
            json!({"speed": 40.0, "type": "stop", "length": 3.0}),
        ),
    ];

    for (url, cmd_id, args) in cases {
        let response = client
            .get(&url)
            .send()
            .await
            .expect("command should respond");
        assert_eq!(response.status(), reqwest::StatusCode::OK, "{url}");
        assert_eq!(
            response.json::<String>().await.expect("status string"),
            "done"
        );

        let command = next_frame(&mut socket).await;
        assert_eq!(command["data"]["cmdId"], cmd_id, "{url}");
        assert_eq!(command["data"]["deviceId"], "dev1");
        assert_eq!(command["data"]["args"], args, "{url}");
        assert!(command["data"].get("tag").is_none(), "{url}");
        assert!(command["data"].get("requestResult").is_none(), "{url}");
    }
    handle.abort();
}

#[tokio::test]
async fn malformed_route_parameters_are_rejected() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let (_socket, controller_id) = announced(&client, addr, "Rig-1").await;

    for url in [
        format!("http://{addr}/bb8/roll/{controller_id}/dev1/fast/90"),
        format!("http://{addr}/bb8/roll/{controller_id}/dev1/inf/90"),
        format!("http://{addr}/bb8/heading/{controller_id}/dev1/NaN"),
        format!("http://{addr}/bb8/color/{controller_id}/dev1/not-a-color"),
        format!("http://{addr}/bb8/blink/{controller_id}/dev1/true/soon/FF0000"),
    ] {
        let response = client.get(&url).send().await.expect("should respond");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{url}");
    }
    handle.abort();
}

#[tokio::test]
async fn closing_channel_removes_controller_and_fails_waiters() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let (mut socket, controller_id) = announced(&client, addr, "Rig-1").await;

    let request = {
        let client = client.clone();
        let url = format!("http://{addr}/bb8/connect/{controller_id}/dev1");
        tokio::spawn(async move { client.get(url).send().await })
    };
    let _command = next_frame(&mut socket).await;
    socket.close(None).await.expect("close should send");
    drop(socket);

    let response = request
        .await
        .expect("request task should join")
        .expect("connect should respond");
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    wait_for_controller_count(&client, addr, 0).await;
    handle.abort();
}

#[tokio::test]
async fn metrics_report_sessions_and_commands() {
    let (addr, handle, _relay) = spawn_relay(RelayConfig::default()).await;
    let client = reqwest::Client::new();
    let (mut socket, controller_id) = announced(&client, addr, "Rig-1").await;

    client
        .get(format!("http://{addr}/bb8/roll/{controller_id}/dev1/10/0"))
        .send()
        .await
        .expect("roll should respond");
    let _roll = next_frame(&mut socket).await;

    let text = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("metrics should respond")
        .text()
        .await
        .expect("metrics should be text");
    assert!(text.contains("iot_relay_connected_controllers 1\n"));
    assert!(text.contains("iot_relay_commands_sent_total 1\n"));
    assert!(text.contains("iot_relay_pending_results 0\n"));
    handle.abort();
}
