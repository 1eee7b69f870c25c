use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::debug;

use bosun_proto::runner::v1::runner_service_client::RunnerServiceClient;

use crate::error::ServerError;
use crate::stream::RunnerStream;

/// Consumer contract for the command runner: one bidirectional execution
/// per call. `execute` returns when the runner reports an exit code, the
/// inbound stream ends, or the call fails. Dropping the stream closes the
/// response channel, which is the termination signal for the broadcast
/// side.
#[async_trait]
pub trait RunnerExecutor: Send + Sync {
    async fn execute(&self, stream: RunnerStream) -> Result<(), ServerError>;
}

/// Runner adapter over the runner service's gRPC Execute call.
pub struct GrpcRunner {
    endpoint: String,
}

impl GrpcRunner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RunnerExecutor for GrpcRunner {
    async fn execute(&self, stream: RunnerStream) -> Result<(), ServerError> {
        let channel = Channel::from_shared(self.endpoint.clone())
            .map_err(|err| ServerError::Runner(format!("invalid runner endpoint: {err}")))?
            .connect()
            .await?;
        let mut client = RunnerServiceClient::new(channel);

        // The request channel feeds the outbound stream directly; closing
        // it on the multiplexer side ends the call from the client side.
        let (requests_rx, responses_tx) = stream.into_parts();
        let outbound = ReceiverStream::new(requests_rx);

        let mut inbound = client
            .execute(tonic::Request::new(outbound))
            .await
            .map_err(|status| ServerError::Runner(status.to_string()))?
            .into_inner();

        while let Some(response) = inbound
            .message()
            .await
            .map_err(|status| ServerError::Runner(status.to_string()))?
        {
            let exit_code = response.exit_code;
            if responses_tx.send(response).await.is_err() {
                debug!(target: "bosun::runner", "Response channel closed; stopping execution");
                break;
            }
            if let Some(code) = exit_code {
                debug!(target: "bosun::runner", code, "Runner reported exit code");
                break;
            }
        }

        Ok(())
    }
}
