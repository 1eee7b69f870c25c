use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Stream already exists: {stream_id}")]
    StreamExists { stream_id: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("Could not decode socket message: {0}")]
    Decode(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Core(#[from] bosun_core::Error),
}

impl ServerError {
    /// A close frame from the peer is the normal end of a receive loop, not
    /// a failure worth logging at error level.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ServerError::ConnectionClosed)
    }
}
