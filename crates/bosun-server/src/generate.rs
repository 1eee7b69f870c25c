use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::error;

use bosun_core::agent::Agent;
use bosun_core::Error as CoreError;
use bosun_proto::v1::blocks_service_server::{BlocksService, BlocksServiceServer};
use bosun_proto::v1::{GenerateRequest, GenerateResponse};

/// Server-streaming Generate RPC wrapping the Agent.
pub struct BlocksServiceImpl {
    agent: Arc<Agent>,
}

impl BlocksServiceImpl {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn into_server(self) -> BlocksServiceServer<Self> {
        BlocksServiceServer::new(self)
    }
}

fn status_from_error(err: CoreError) -> Status {
    match err {
        CoreError::InvalidArgument(msg) => Status::invalid_argument(msg),
        CoreError::Cancelled => {
            Status::deadline_exceeded("the request context was cancelled")
        }
        CoreError::Api(api) => Status::internal(format!("model request failed: {api}")),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl BlocksService for BlocksServiceImpl {
    type GenerateStream = ReceiverStream<Result<GenerateResponse, Status>>;

    async fn generate(
        &self,
        request: Request<GenerateRequest>,
    ) -> Result<Response<Self::GenerateStream>, Status> {
        let req = request.into_inner();
        let (tx, rx) = mpsc::channel(100);
        let agent = self.agent.clone();

        tokio::spawn(async move {
            let token = CancellationToken::new();

            // Cancel the model stream when the client goes away.
            let closed_tx = tx.clone();
            let closed_token = token.clone();
            tokio::spawn(async move {
                closed_tx.closed().await;
                closed_token.cancel();
            });

            let (block_tx, mut block_rx) = mpsc::channel(100);
            let forward_tx = tx.clone();
            let forward = tokio::spawn(async move {
                while let Some(resp) = block_rx.recv().await {
                    if forward_tx.send(Ok(resp)).await.is_err() {
                        break;
                    }
                }
            });

            let result = agent.generate(req, token, block_tx).await;
            let _ = forward.await;

            if let Err(err) = result {
                error!(target: "bosun::generate", "Generate failed: {err}");
                let _ = tx.send(Err(status_from_error(err))).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_follows_rpc_codes() {
        assert_eq!(
            status_from_error(CoreError::InvalidArgument("bad".into())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            status_from_error(CoreError::Cancelled).code(),
            tonic::Code::DeadlineExceeded
        );
        assert_eq!(
            status_from_error(CoreError::Internal("boom".into())).code(),
            tonic::Code::Internal
        );
    }
}
