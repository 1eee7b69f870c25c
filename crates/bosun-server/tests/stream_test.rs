use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use bosun_proto::runner::v1::{program_config, ExecuteRequest, ExecuteResponse, ProgramConfig};
use bosun_proto::v1::{socket_request, Ping, SocketRequest, SocketResponse, StatusCode};
use bosun_server::auth::AllowAll;
use bosun_server::runner::RunnerExecutor;
use bosun_server::stream::{MultiplexerRegistry, RunnerStream};
use bosun_server::{ws, ServerError};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Runner double that waits for the first request, then replays a scripted
/// response sequence with small delays.
struct MockRunner {
    responses: Vec<ExecuteResponse>,
    executed: AtomicBool,
}

impl MockRunner {
    fn new(responses: Vec<ExecuteResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            executed: AtomicBool::new(false),
        })
    }

    fn stdout_then_exit(outputs: &[&str], exit_code: u32) -> Arc<Self> {
        let mut responses: Vec<ExecuteResponse> = outputs
            .iter()
            .map(|out| ExecuteResponse {
                stdout_data: out.as_bytes().to_vec(),
                ..Default::default()
            })
            .collect();
        responses.push(ExecuteResponse {
            exit_code: Some(exit_code),
            ..Default::default()
        });
        Self::new(responses)
    }

    fn was_executed(&self) -> bool {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunnerExecutor for MockRunner {
    async fn execute(&self, mut stream: RunnerStream) -> Result<(), ServerError> {
        self.executed.store(true, Ordering::SeqCst);

        if stream.recv().await.is_none() {
            return Ok(());
        }

        for response in &self.responses {
            stream.send(response.clone()).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Ok(())
    }
}

async fn start_server(runner: Arc<dyn RunnerExecutor>) -> SocketAddr {
    let registry = MultiplexerRegistry::new(Arc::new(AllowAll), runner);
    let app = ws::router(registry);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

async fn dial(addr: SocketAddr, run_id: &str) -> WsClient {
    let stream_id = Uuid::new_v4().simple().to_string();
    let url = format!("ws://{addr}/ws?id={stream_id}&runID={run_id}");
    let (client, response) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(response.status(), 101);
    client
}

fn execute_request(run_id: &str, known_id: &str) -> String {
    let req = SocketRequest {
        run_id: run_id.to_string(),
        known_id: known_id.to_string(),
        ping: None,
        payload: Some(socket_request::Payload::ExecuteRequest(ExecuteRequest {
            config: Some(ProgramConfig {
                source: Some(program_config::Source::Commands(
                    program_config::CommandList {
                        items: vec!["echo".to_string(), "hi".to_string()],
                    },
                )),
                ..Default::default()
            }),
            ..Default::default()
        })),
    };
    serde_json::to_string(&req).unwrap()
}

/// Read the next SocketResponse, skipping control frames. Returns None once
/// the server closes the socket.
async fn next_response(client: &mut WsClient) -> Option<SocketResponse> {
    loop {
        let frame = timeout(READ_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")?;
        match frame.expect("websocket error") {
            Message::Text(text) => {
                return Some(serde_json::from_str(&text).expect("invalid response json"))
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Wait for a PERMISSION_DENIED status, skipping any broadcast frames that
/// were already queued on the socket.
async fn expect_permission_denied(client: &mut WsClient) {
    loop {
        let response = next_response(client).await.expect("socket closed early");
        if let Some(status) = &response.status {
            if status.code == StatusCode::PermissionDenied as i32 {
                return;
            }
        }
    }
}

/// Collect stdout payloads until the exit-code response arrives.
async fn read_stdout_sequence(client: &mut WsClient) -> Vec<String> {
    let mut outputs = Vec::new();
    loop {
        let response = next_response(client).await.expect("socket closed early");
        let Some(execute_response) = response.payload.map(|payload| match payload {
            bosun_proto::v1::socket_response::Payload::ExecuteResponse(res) => res,
        }) else {
            continue;
        };
        if execute_response.exit_code.is_some() {
            return outputs;
        }
        outputs.push(String::from_utf8(execute_response.stdout_data).unwrap());
    }
}

#[tokio::test]
async fn roundtrip_single_client() {
    let runner = MockRunner::stdout_then_exit(&["hello from runner", "bye bye"], 0);
    let addr = start_server(runner.clone()).await;

    let run_id = Uuid::new_v4().to_string();
    let mut client = dial(addr, &run_id).await;

    client
        .send(Message::Text(execute_request(&run_id, "cell-1")))
        .await
        .unwrap();

    let outputs = read_stdout_sequence(&mut client).await;
    assert_eq!(outputs, vec!["hello from runner", "bye bye"]);
    assert!(runner.was_executed());

    client.close(None).await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_client_in_order() {
    let expected = ["hello from runner", "bye bye"];
    let runner = MockRunner::stdout_then_exit(&expected, 0);
    let addr = start_server(runner).await;

    let run_id = Uuid::new_v4().to_string();

    let num_clients = 5;
    let mut clients = Vec::with_capacity(num_clients);
    for _ in 0..num_clients {
        clients.push(dial(addr, &run_id).await);
    }

    // A single ExecuteRequest is enough to start processing inside the
    // multiplexer.
    clients[0]
        .send(Message::Text(execute_request(&run_id, "cell-1")))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for mut client in clients {
        handles.push(tokio::spawn(
            async move { read_stdout_sequence(&mut client).await },
        ));
    }

    for handle in handles {
        let outputs = handle.await.unwrap();
        assert_eq!(outputs, expected);
    }
}

#[tokio::test]
async fn binary_frames_are_accepted() {
    use prost::Message as ProstMessage;

    let runner = MockRunner::stdout_then_exit(&["binary roundtrip"], 0);
    let addr = start_server(runner).await;

    let run_id = Uuid::new_v4().to_string();
    let mut client = dial(addr, &run_id).await;

    let req: SocketRequest = serde_json::from_str(&execute_request(&run_id, "cell-1")).unwrap();
    client
        .send(Message::Binary(req.encode_to_vec()))
        .await
        .unwrap();

    let outputs = read_stdout_sequence(&mut client).await;
    assert_eq!(outputs, vec!["binary roundtrip"]);
}

#[tokio::test]
async fn ping_yields_pong_and_no_upstream_traffic() {
    let runner = MockRunner::stdout_then_exit(&["unused"], 0);
    let addr = start_server(runner.clone()).await;

    let run_id = Uuid::new_v4().to_string();
    let mut client = dial(addr, &run_id).await;

    let ping = SocketRequest {
        run_id: run_id.clone(),
        ping: Some(Ping { timestamp: 1234 }),
        ..Default::default()
    };
    client
        .send(Message::Text(serde_json::to_string(&ping).unwrap()))
        .await
        .unwrap();

    let response = next_response(&mut client).await.unwrap();
    assert_eq!(response.pong.unwrap().timestamp, 1234);
    assert!(!runner.was_executed());
}

#[tokio::test]
async fn mismatched_run_id_is_rejected_without_affecting_others() {
    let runner = MockRunner::stdout_then_exit(&["unused"], 0);
    let addr = start_server(runner).await;

    let run_id = Uuid::new_v4().to_string();
    let mut offender = dial(addr, &run_id).await;
    let mut bystander = dial(addr, &run_id).await;

    let other_run_id = Uuid::new_v4().to_string();
    offender
        .send(Message::Text(execute_request(&other_run_id, "cell-1")))
        .await
        .unwrap();

    expect_permission_denied(&mut offender).await;
    // The server follows up with a protocol-error close frame.
    assert!(next_response(&mut offender).await.is_none());

    // The other socket on the run still works.
    let ping = SocketRequest {
        run_id: run_id.clone(),
        ping: Some(Ping { timestamp: 7 }),
        ..Default::default()
    };
    bystander
        .send(Message::Text(serde_json::to_string(&ping).unwrap()))
        .await
        .unwrap();
    let response = next_response(&mut bystander).await.unwrap();
    assert_eq!(response.pong.unwrap().timestamp, 7);
}

#[tokio::test]
async fn payloadless_frame_is_still_subject_to_run_id_check() {
    let runner = MockRunner::stdout_then_exit(&["unused"], 0);
    let addr = start_server(runner).await;

    let run_id = Uuid::new_v4().to_string();
    let mut client = dial(addr, &run_id).await;

    // No ping and no payload; the run id check still applies.
    let req = SocketRequest {
        run_id: Uuid::new_v4().to_string(),
        ..Default::default()
    };
    client
        .send(Message::Text(serde_json::to_string(&req).unwrap()))
        .await
        .unwrap();

    expect_permission_denied(&mut client).await;
}

#[tokio::test]
async fn known_id_is_pinned_by_first_payload() {
    let runner = MockRunner::stdout_then_exit(&["hello"], 0);
    let addr = start_server(runner).await;

    let run_id = Uuid::new_v4().to_string();
    let mut first = dial(addr, &run_id).await;
    let mut second = dial(addr, &run_id).await;

    first
        .send(Message::Text(execute_request(&run_id, "cell-1")))
        .await
        .unwrap();

    // Make sure the first payload was processed before the second one, so
    // the pin is in place.
    let _ = read_stdout_sequence(&mut first).await;

    second
        .send(Message::Text(execute_request(&run_id, "cell-2")))
        .await
        .unwrap();

    expect_permission_denied(&mut second).await;
}
