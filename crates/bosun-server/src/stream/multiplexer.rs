use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bosun_proto::runner::v1::ExecuteResponse;
use bosun_proto::v1::{
    socket_request, socket_response, SocketRequest, SocketResponse, SocketStatus, StatusCode,
};

use crate::auth::Authorizer;
use crate::error::ServerError;
use crate::runner::RunnerExecutor;
use crate::stream::{Connection, Processor, Streams, CHANNEL_CAPACITY};

/// How long a finished run waits for clients to close their sockets before
/// it closes them itself.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Multiplexer owns the lifecycle of one run: it bridges the runner's
/// bidirectional execution to any number of websocket clients with the same
/// run id, coordinating authenticated requests and broadcast responses.
pub struct Multiplexer {
    token: CancellationToken,
    run_id: String,

    streams: Arc<Streams>,
    runner: Arc<dyn RunnerExecutor>,

    // Receiver half of the authed socket requests channel; taken by the
    // dispatch loop.
    authed_rx: Mutex<Option<mpsc::Receiver<SocketRequest>>>,
}

impl Multiplexer {
    pub fn new(
        parent: &CancellationToken,
        run_id: &str,
        authorizer: Arc<dyn Authorizer>,
        runner: Arc<dyn RunnerExecutor>,
    ) -> Arc<Self> {
        let (authed_tx, authed_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let streams = Arc::new(Streams::new(authorizer, authed_tx));

        Arc::new(Self {
            token: parent.child_token(),
            run_id: run_id.to_string(),
            streams,
            runner,
            authed_rx: Mutex::new(Some(authed_rx)),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register one socket and start its receive loop.
    pub fn accept_connection(
        self: &Arc<Self>,
        stream_id: &str,
        conn: Arc<Connection>,
    ) -> Result<(), ServerError> {
        self.streams.create_stream(stream_id, conn.clone())?;

        let this = self.clone();
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            this.receive_requests(&stream_id, &conn).await;
        });

        Ok(())
    }

    async fn receive_requests(&self, stream_id: &str, conn: &Connection) {
        if let Err(err) = self.streams.receive(stream_id, &self.run_id, conn).await {
            if err.is_clean_close() {
                info!(target: "bosun::stream", stream_id, "Connection closed");
            } else {
                warn!(
                    target: "bosun::stream",
                    stream_id,
                    "Error while receiving socket requests: {err}"
                );
            }
        }
        self.streams.remove_stream(stream_id).await;
    }

    /// Dispatch loop for the run. The first authenticated ExecuteRequest
    /// starts the runner execution; further requests are forwarded as-is
    /// and the runner decides whether they are stop signals or new
    /// programs. Exits when the runner finishes or the context is
    /// cancelled, then drains.
    pub async fn process(self: Arc<Self>) {
        let mut authed_rx = self
            .authed_rx
            .lock()
            .await
            .take()
            .expect("process started twice for one run");

        let mut inflight: Option<Processor> = None;

        loop {
            let req = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!(target: "bosun::stream", run_id = %self.run_id, "Context done, no need to process more requests");
                    break;
                }
                req = authed_rx.recv() => req,
            };

            let Some(req) = req else {
                info!(target: "bosun::stream", run_id = %self.run_id, "Authed socket requests channel closed");
                break;
            };

            let Some(socket_request::Payload::ExecuteRequest(execute_request)) = req.payload
            else {
                info!(target: "bosun::stream", "Received message doesn't contain an ExecuteRequest");
                continue;
            };

            if inflight.is_none() {
                let (processor, runner_stream, responses_rx) =
                    Processor::channel(&self.run_id);
                info!(target: "bosun::stream", run_id = %self.run_id, "Starting runner execution");

                let runner = self.runner.clone();
                let token = self.token.clone();
                tokio::spawn(async move {
                    if let Err(err) = runner.execute(runner_stream).await {
                        error!(target: "bosun::stream", "Failed to execute request: {err}");
                    }
                    // Runner execution finished; wind the run down.
                    token.cancel();
                });

                let streams = self.streams.clone();
                tokio::spawn(async move {
                    broadcast_responses(streams, responses_rx).await;
                });

                inflight = Some(processor);
            }

            if let Some(processor) = &inflight {
                if let Err(err) = processor.forward(execute_request).await {
                    warn!(target: "bosun::stream", "Could not forward execute request: {err}");
                }
            }
        }

        // Close the request side so the runner sees EOF, give clients a
        // chance to close their own connections, then drop the rest.
        if let Some(mut processor) = inflight.take() {
            processor.close();
        }
        self.drain().await;
        self.streams.close_all().await;
    }

    /// Wait for clients to close their own sockets, up to the grace period.
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while !self.streams.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Listens for runner responses and fans each one out to every attached
/// socket, in the order the responses were observed.
async fn broadcast_responses(streams: Arc<Streams>, mut responses: mpsc::Receiver<ExecuteResponse>) {
    loop {
        let Some(res) = responses.recv().await else {
            info!(target: "bosun::stream", "Execute responses channel closed");
            return;
        };

        let response = SocketResponse {
            status: Some(SocketStatus {
                code: StatusCode::Ok as i32,
                message: String::new(),
            }),
            pong: None,
            payload: Some(socket_response::Payload::ExecuteResponse(res)),
        };

        let data = match serde_json::to_string(&response) {
            Ok(data) => data,
            Err(err) => {
                error!(target: "bosun::stream", "Could not marshal response: {err}");
                continue;
            }
        };

        streams.broadcast(&data).await;
    }
}

/// Registry of live multiplexers, keyed by run id. A multiplexer is created
/// lazily on the first socket for a run and removed once its run has
/// terminated and drained.
pub struct MultiplexerRegistry {
    token: CancellationToken,
    authorizer: Arc<dyn Authorizer>,
    runner: Arc<dyn RunnerExecutor>,
    muxes: Mutex<HashMap<String, Arc<Multiplexer>>>,
}

impl MultiplexerRegistry {
    pub fn new(authorizer: Arc<dyn Authorizer>, runner: Arc<dyn RunnerExecutor>) -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            authorizer,
            runner,
            muxes: Mutex::new(HashMap::new()),
        })
    }

    /// Cancel every live run.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Attach one upgraded socket to the multiplexer for `run_id`, creating
    /// the multiplexer if this is the run's first socket.
    pub async fn attach(
        self: &Arc<Self>,
        run_id: &str,
        stream_id: &str,
        socket: WebSocket,
    ) -> Result<(), ServerError> {
        let mux = {
            let mut muxes = self.muxes.lock().await;
            match muxes.get(run_id) {
                Some(mux) => mux.clone(),
                None => {
                    let mux = Multiplexer::new(
                        &self.token,
                        run_id,
                        self.authorizer.clone(),
                        self.runner.clone(),
                    );
                    muxes.insert(run_id.to_string(), mux.clone());

                    let registry = self.clone();
                    let process_mux = mux.clone();
                    let run_id = run_id.to_string();
                    tokio::spawn(async move {
                        process_mux.process().await;
                        registry.muxes.lock().await.remove(&run_id);
                        info!(target: "bosun::stream", run_id = %run_id, "Multiplexer terminated");
                    });

                    mux
                }
            }
        };

        mux.accept_connection(stream_id, Arc::new(Connection::new(socket)))
    }
}
