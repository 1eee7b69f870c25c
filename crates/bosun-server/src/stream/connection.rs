use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use bosun_proto::v1::{SocketRequest, SocketResponse, SocketStatus, StatusCode};

use crate::error::ServerError;

// The websocket is treated as a transport, which is why app-level fatal
// errors surface as protocol-error close frames.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Thin wrapper around one websocket for framed SocketRequest/SocketResponse
/// I/O. Reads and writes each serialize behind their own lock.
pub struct Connection {
    reader: Mutex<SplitStream<WebSocket>>,
    writer: Mutex<SplitSink<WebSocket, Message>>,
}

impl Connection {
    pub fn new(socket: WebSocket) -> Self {
        let (writer, reader) = socket.split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Read one framed SocketRequest. Text frames are proto-JSON, binary
    /// frames are proto-binary; control frames are skipped.
    pub async fn read_socket_request(&self) -> Result<SocketRequest, ServerError> {
        let mut reader = self.reader.lock().await;
        loop {
            let message = match reader.next().await {
                None => return Err(ServerError::ConnectionClosed),
                Some(Err(err)) => return Err(ServerError::WebSocket(err)),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Text(text) => {
                    return serde_json::from_str(&text).map_err(|err| {
                        ServerError::Decode(format!(
                            "Could not unmarshal message as TextMessage: {err}"
                        ))
                    });
                }
                Message::Binary(data) => {
                    return SocketRequest::decode(data.as_slice()).map_err(|err| {
                        ServerError::Decode(format!(
                            "Could not unmarshal message as BinaryMessage: {err}"
                        ))
                    });
                }
                Message::Close(frame) => {
                    debug!(target: "bosun::stream", ?frame, "Connection closed by peer");
                    return Err(ServerError::ConnectionClosed);
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    /// Write a SocketResponse as a proto-JSON text frame.
    pub async fn write_socket_response(&self, resp: &SocketResponse) -> Result<(), ServerError> {
        let data = serde_json::to_string(resp)
            .map_err(|err| ServerError::Decode(format!("Could not marshal response: {err}")))?;
        self.write_text(&data).await
    }

    /// Write an already-marshaled text frame. Broadcasts serialize the
    /// payload once and reuse it across sockets.
    pub async fn write_text(&self, data: &str) -> Result<(), ServerError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(data.to_string()))
            .await
            .map_err(ServerError::WebSocket)
    }

    /// Send a status response to the client, then close the socket with a
    /// protocol-error close frame carrying the reason.
    pub async fn error_message(&self, code: StatusCode, message: &str) {
        let response = SocketResponse {
            status: Some(SocketStatus {
                code: code as i32,
                message: message.to_string(),
            }),
            ..Default::default()
        };

        if let Err(err) = self.write_socket_response(&response).await {
            warn!(target: "bosun::stream", "Could not send error message: {err}");
        }

        let mut writer = self.writer.lock().await;
        if let Err(err) = writer
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_PROTOCOL_ERROR,
                reason: message.to_string().into(),
            })))
            .await
        {
            warn!(target: "bosun::stream", "Could not close websocket with error: {err}");
        }
    }

    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.send(Message::Close(None)).await {
            debug!(target: "bosun::stream", "Could not send close frame: {err}");
        }
        let _ = writer.close().await;
    }
}
