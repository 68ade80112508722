use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use task_sharding::scheduler::Scheduler;
use task_sharding::server::{serve, AppState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, Arc<Scheduler>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scheduler = Arc::new(Scheduler::default());
    let shutdown = CancellationToken::new();
    let state = AppState::new(scheduler.clone()).with_shutdown(shutdown.clone());

    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });

    (addr, scheduler, shutdown)
}

async fn connect(addr: SocketAddr, client_id: &str) -> Socket {
    let url = format!("ws://{}/ws/api/1/{}/", addr, client_id);
    let (socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

fn init(cache_id: Value, total_steps: usize) -> Value {
    json!({
        "message_type": 1,
        "repo_state": {
            "org/repo_1": {
                "base_ref": "main",
                "patchset": "5bfb44678a27f9bc3b6a96ced8d0b464d7ea9b71",
            }
        },
        "complex_patchset": false,
        "cache_id": cache_id,
        "total_steps": total_steps,
        "schema_id": "1",
    })
}

#[tokio::test]
async fn worker_runs_schema_over_websocket() {
    let (addr, scheduler, shutdown) = start_server().await;
    let mut socket = connect(addr, "client-1").await;

    send_json(&mut socket, init(json!(1), 1)).await;
    assert_eq!(
        recv_json(&mut socket).await,
        json!({"message_type": 2, "schema_id": "1", "step_id": "0"})
    );
    assert_eq!(scheduler.running_cohorts().await, 1);

    send_json(
        &mut socket,
        json!({"message_type": 3, "schema_id": "1", "step_id": "0", "step_success": true}),
    )
    .await;
    assert_eq!(
        recv_json(&mut socket).await,
        json!({"message_type": 4, "schema_id": "1"})
    );

    socket.close(None).await.unwrap();
    let watched = scheduler.clone();
    wait_until(|| {
        let scheduler = watched.clone();
        async move { scheduler.running_cohorts().await == 0 }
    })
    .await;
    shutdown.cancel();
}

#[tokio::test]
async fn bad_frames_do_not_drop_the_connection() {
    let (addr, _scheduler, shutdown) = start_server().await;
    let mut socket = connect(addr, "client-1").await;

    socket
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    send_json(&mut socket, json!({"message_type": 42})).await;
    send_json(
        &mut socket,
        json!({"message_type": 3, "schema_id": "1", "step_id": "0", "step_success": true}),
    )
    .await;
    send_json(&mut socket, init(json!("1"), 2)).await;

    assert_eq!(
        recv_json(&mut socket).await,
        json!({"message_type": 2, "schema_id": "1", "step_id": "1"})
    );
    shutdown.cancel();
}

#[tokio::test]
async fn dropped_worker_step_goes_to_the_next_one_to_report() {
    let (addr, scheduler, shutdown) = start_server().await;
    let mut a = connect(addr, "a").await;
    let mut b = connect(addr, "b").await;

    send_json(&mut a, init(json!(1), 2)).await;
    assert_eq!(recv_json(&mut a).await["step_id"], json!("1"));
    send_json(&mut b, init(json!(1), 2)).await;
    assert_eq!(recv_json(&mut b).await["step_id"], json!("0"));

    drop(a);
    let watched = scheduler.clone();
    wait_until(|| {
        let scheduler = watched.clone();
        async move { scheduler.total_registered_consumers().await == 1 }
    })
    .await;

    send_json(
        &mut b,
        json!({"message_type": 3, "schema_id": "1", "step_id": "0", "step_success": true}),
    )
    .await;
    assert_eq!(
        recv_json(&mut b).await,
        json!({"message_type": 2, "schema_id": "1", "step_id": "1"})
    );
    shutdown.cancel();
}

#[tokio::test]
async fn oversized_plan_keeps_the_connection_open() {
    let (addr, scheduler, shutdown) = start_server().await;
    let mut socket = connect(addr, "client-1").await;

    let mut oversized = init(json!(1), 1);
    oversized["total_steps"] = json!(u64::MAX);
    send_json(&mut socket, oversized).await;
    send_json(&mut socket, init(json!(1), 2)).await;

    assert_eq!(
        recv_json(&mut socket).await,
        json!({"message_type": 2, "schema_id": "1", "step_id": "1"})
    );
    assert_eq!(scheduler.running_cohorts().await, 1);
    shutdown.cancel();
}

#[tokio::test]
async fn path_without_trailing_slash_is_accepted() {
    let (addr, _scheduler, shutdown) = start_server().await;
    let url = format!("ws://{}/ws/api/1/no-slash", addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    send_json(&mut socket, init(json!(1), 1)).await;
    assert_eq!(recv_json(&mut socket).await["message_type"], json!(2));
    shutdown.cancel();
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let (addr, scheduler, shutdown) = start_server().await;
    let mut socket = connect(addr, "client-1").await;
    send_json(&mut socket, init(json!(1), 1)).await;
    recv_json(&mut socket).await;

    shutdown.cancel();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let watched = scheduler.clone();
    wait_until(|| {
        let scheduler = watched.clone();
        async move { scheduler.running_cohorts().await == 0 }
    })
    .await;
}
