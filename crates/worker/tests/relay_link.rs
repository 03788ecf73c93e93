//! A worker and a web client talking through a real relay.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lims_relay::{serve_on, RelayState};
use lims_worker::{LinkMode, StationHandle, WorkerClient, WorkerConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::FakeGcms;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_on(listener, Arc::new(RelayState::new()), std::future::pending()));
    addr
}

async fn connections(addr: SocketAddr) -> u64 {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default();
    let health: Value = serde_json::from_str(body).unwrap();
    health["connections"].as_u64().unwrap_or_default()
}

async fn wait_for_connections(addr: SocketAddr, n: u64) {
    for _ in 0..200 {
        if connections(addr).await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("relay never reached {n} connections");
}

fn start_worker(url: String, link: LinkMode, station: Arc<dyn StationHandle>, status: Option<Duration>) {
    let config = WorkerConfig {
        url,
        link,
        station_name: station.kind().to_string(),
        status_interval: status,
        reconnect_delay: Duration::from_millis(50),
    };
    tokio::spawn(WorkerClient::new(config, station).run(std::future::pending()));
}

async fn next_json(ws: &mut Client) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .unwrap();
    serde_json::from_str(frame.to_text().unwrap()).unwrap()
}

/// Read frames until a worker event of type `kind` arrives; returns it.
async fn worker_event(ws: &mut Client, kind: &str, room: bool) -> Value {
    loop {
        let mut frame = next_json(ws).await;
        if room {
            // Room members receive `{"message": <raw text of the sender>}`.
            let Some(raw) = frame["message"].as_str() else { continue };
            let Ok(inner) = serde_json::from_str::<Value>(raw) else { continue };
            frame = inner;
        }
        if frame["sender"] == "worker" && frame["message"]["type"] == kind {
            return frame["message"].clone();
        }
    }
}

#[tokio::test]
async fn room_worker_answers_legacy_commands() {
    let tmp = tempfile::tempdir().unwrap();
    let (_arm, handle) = common::gcms(tmp.path(), FakeGcms::default());
    let addr = relay().await;
    start_worker(format!("ws://{addr}/ws/room/gcms"), LinkMode::Room, Arc::new(handle), None);
    wait_for_connections(addr, 1).await;

    let (mut web, _) = connect_async(format!("ws://{addr}/ws/room/gcms")).await.unwrap();
    wait_for_connections(addr, 2).await;

    web.send(Message::text("get_sequence_list")).await.unwrap();
    let event = worker_event(&mut web, "sequence_list", true).await;
    assert_eq!(event["sequences"][0]["index"], 1);

    // A bad suffix is answered, and the worker keeps serving.
    web.send(Message::text("start_analysis_x")).await.unwrap();
    let event = worker_event(&mut web, "error", true).await;
    assert_eq!(event["message"], "指令格式错误: start_analysis_x");

    web.send(Message::text(json!({"kind": "get_status"}).to_string())).await.unwrap();
    let event = worker_event(&mut web, "status_update", true).await;
    assert_eq!(event["run_mode"], "NotRun");
}

#[tokio::test]
async fn hub_worker_replies_through_send_to_client_and_reports_status() {
    let (_arm, _port, handle) = common::dispensing();
    let addr = relay().await;
    start_worker(
        format!("ws://{addr}/ws/relay/gypl_station_1"),
        LinkMode::Hub {
            reply_to: "web_client".into(),
        },
        Arc::new(handle),
        Some(Duration::from_millis(50)),
    );
    wait_for_connections(addr, 1).await;

    let (mut web, _) = connect_async(format!("ws://{addr}/ws/relay/web_client")).await.unwrap();
    wait_for_connections(addr, 2).await;

    // Periodic status reaches observers.
    loop {
        let frame = next_json(&mut web).await;
        if frame["type"] == "device_status" {
            assert_eq!(frame["station_id"], "gypl_station_1");
            assert_eq!(frame["status"]["arm"], true);
            break;
        }
    }

    let command = json!({
        "command": "send_to_client",
        "target_client_id": "gypl_station_1",
        "message": {"command": "get_arm_status"},
    });
    web.send(Message::text(command.to_string())).await.unwrap();
    let event = worker_event(&mut web, "arm_status", false).await;
    assert_eq!(event["connected"], true);
}
