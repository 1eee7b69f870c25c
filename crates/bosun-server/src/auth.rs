use bosun_proto::v1::SocketRequest;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Unauthorized: {reason}")]
pub struct AuthError {
    pub reason: String,
}

impl AuthError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Authorization seam for socket requests. Token verification lives outside
/// this crate; the stream layer only needs an accept/reject answer.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, req: &SocketRequest) -> Result<(), AuthError>;
}

/// Accepts every request. Used in tests and trusted single-user setups.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _req: &SocketRequest) -> Result<(), AuthError> {
        Ok(())
    }
}
