use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bosun_proto::v1::{Pong, SocketRequest, SocketResponse, StatusCode};

use crate::auth::Authorizer;
use crate::error::ServerError;
use crate::stream::Connection;

/// Streams manages the authenticated websocket connections attached to one
/// run. Each connection is either a console element or a client
/// reconnection; all of them observe the same multiplexed execution.
pub struct Streams {
    authorizer: Arc<dyn Authorizer>,

    // The known id is the cell/block id carried in payloads. Once pinned,
    // payloads with a different id are rejected.
    known_id: Mutex<Option<String>>,

    conns: Mutex<HashMap<String, Arc<Connection>>>,

    authed_requests: mpsc::Sender<SocketRequest>,
}

impl Streams {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        authed_requests: mpsc::Sender<SocketRequest>,
    ) -> Self {
        Self {
            authorizer,
            known_id: Mutex::new(None),
            conns: Mutex::new(HashMap::new()),
            authed_requests,
        }
    }

    pub fn create_stream(
        &self,
        stream_id: &str,
        conn: Arc<Connection>,
    ) -> Result<(), ServerError> {
        let mut conns = self.conns.lock().unwrap();
        if conns.contains_key(stream_id) {
            return Err(ServerError::StreamExists {
                stream_id: stream_id.to_string(),
            });
        }
        conns.insert(stream_id.to_string(), conn);
        Ok(())
    }

    pub async fn remove_stream(&self, stream_id: &str) {
        info!(target: "bosun::stream", stream_id, "Removing stream");

        let conn = self.conns.lock().unwrap().remove(stream_id);
        match conn {
            Some(conn) => conn.close().await,
            None => debug!(target: "bosun::stream", stream_id, "Stream not found"),
        }
    }

    pub async fn close_all(&self) {
        let conns: Vec<(String, Arc<Connection>)> =
            self.conns.lock().unwrap().drain().collect();

        for (stream_id, conn) in conns {
            debug!(target: "bosun::stream", stream_id, "Closing stream");
            conn.close().await;
        }
    }

    /// Blocking receive loop for one socket: read, authorize, answer pings,
    /// enforce run and known-id pinning, and enqueue everything else for
    /// the multiplexer.
    pub async fn receive(
        &self,
        stream_id: &str,
        run_id: &str,
        conn: &Connection,
    ) -> Result<(), ServerError> {
        loop {
            let req = conn.read_socket_request().await?;

            debug!(
                target: "bosun::stream",
                stream_id,
                run_id = %req.run_id,
                "Received socket request"
            );

            if let Err(err) = self.authorizer.authorize(&req) {
                warn!(target: "bosun::stream", stream_id, "Could not authorize request: {err}");
                conn.error_message(StatusCode::PermissionDenied, "Unauthorized request")
                    .await;
                return Err(ServerError::PermissionDenied(err.to_string()));
            }

            // Everything except pings is subject to the run and known-id
            // checks, whether or not a payload is attached.
            if req.ping.is_none() {
                if req.run_id != run_id {
                    warn!(
                        target: "bosun::stream",
                        stream_id,
                        run_id = %req.run_id,
                        expected_run_id = run_id,
                        "RunID mismatch"
                    );
                    conn.error_message(StatusCode::PermissionDenied, "RunID mismatch")
                        .await;
                    return Err(ServerError::PermissionDenied("RunID mismatch".to_string()));
                }

                // The first non-ping request pins the known id for the
                // whole run.
                let mismatch = {
                    let mut known_id = self.known_id.lock().unwrap();
                    match known_id.as_ref() {
                        None => {
                            *known_id = Some(req.known_id.clone());
                            false
                        }
                        Some(known) => known != &req.known_id,
                    }
                };
                if mismatch {
                    warn!(
                        target: "bosun::stream",
                        stream_id,
                        known_id = %req.known_id,
                        "KnownID mismatch"
                    );
                    conn.error_message(StatusCode::PermissionDenied, "KnownID mismatch")
                        .await;
                    return Err(ServerError::PermissionDenied(
                        "KnownID mismatch".to_string(),
                    ));
                }
            }

            // Protocol-level ping; never forwarded upstream.
            if let Some(ping) = &req.ping {
                let resp = SocketResponse {
                    pong: Some(Pong {
                        timestamp: ping.timestamp,
                    }),
                    ..Default::default()
                };
                if let Err(err) = conn.write_socket_response(&resp).await {
                    warn!(target: "bosun::stream", stream_id, "Could not send pong response: {err}");
                }
                continue;
            }

            self.authed_requests.send(req).await.map_err(|_| {
                ServerError::ChannelClosed("authed socket requests channel is closed".to_string())
            })?;
        }
    }

    /// Write the same payload to every attached socket. Fan-out is
    /// best-effort: one failing socket does not stop the others, and its
    /// receive loop will remove it on the next read.
    pub async fn broadcast(&self, data: &str) {
        let conns: Vec<(String, Arc<Connection>)> = {
            let conns = self.conns.lock().unwrap();
            conns
                .iter()
                .map(|(id, conn)| (id.clone(), conn.clone()))
                .collect()
        };

        for (stream_id, conn) in conns {
            if let Err(err) = conn.write_text(data).await {
                warn!(
                    target: "bosun::stream",
                    stream_id,
                    "Could not send message: {err}"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
