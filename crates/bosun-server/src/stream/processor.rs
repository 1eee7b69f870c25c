use tokio::sync::mpsc;

use bosun_proto::runner::v1::{ExecuteRequest, ExecuteResponse};

use crate::error::ServerError;

/// Channel capacity on both sides of a run. When the response side fills up
/// the runner loop blocks until the broadcast task drains it.
pub const CHANNEL_CAPACITY: usize = 100;

/// Multiplexer-side handle of a run's channel pair. Lives for exactly one
/// runner execution.
pub struct Processor {
    run_id: String,
    requests_tx: Option<mpsc::Sender<ExecuteRequest>>,
}

impl Processor {
    /// Create the channel pair for one execution: the multiplexer keeps the
    /// `Processor`, the runner adapter drives the `RunnerStream`, and the
    /// broadcast task drains the returned response receiver.
    pub fn channel(
        run_id: &str,
    ) -> (Processor, RunnerStream, mpsc::Receiver<ExecuteResponse>) {
        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (responses_tx, responses_rx) = mpsc::channel(CHANNEL_CAPACITY);

        (
            Processor {
                run_id: run_id.to_string(),
                requests_tx: Some(requests_tx),
            },
            RunnerStream {
                requests_rx,
                responses_tx,
            },
            responses_rx,
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn forward(&self, req: ExecuteRequest) -> Result<(), ServerError> {
        let Some(tx) = &self.requests_tx else {
            return Err(ServerError::ChannelClosed(
                "execute requests channel is closed".to_string(),
            ));
        };
        tx.send(req).await.map_err(|_| {
            ServerError::ChannelClosed("execute requests channel is closed".to_string())
        })
    }

    /// Signal that no more client requests will arrive. The runner sees EOF
    /// on its next `recv`.
    pub fn close(&mut self) {
        self.requests_tx.take();
    }
}

/// Runner-side of the channel pair; the bidirectional stream the runner
/// adapter consumes. `recv` returns `None` once the client side closed, and
/// dropping the stream closes the response channel.
pub struct RunnerStream {
    requests_rx: mpsc::Receiver<ExecuteRequest>,
    responses_tx: mpsc::Sender<ExecuteResponse>,
}

impl RunnerStream {
    pub async fn recv(&mut self) -> Option<ExecuteRequest> {
        self.requests_rx.recv().await
    }

    pub async fn send(&self, resp: ExecuteResponse) -> Result<(), ServerError> {
        self.responses_tx.send(resp).await.map_err(|_| {
            ServerError::ChannelClosed("execute responses channel is closed".to_string())
        })
    }

    /// Split into the raw halves, for adapters that feed the request side
    /// directly into an outbound gRPC stream.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<ExecuteRequest>,
        mpsc::Sender<ExecuteResponse>,
    ) {
        (self.requests_rx, self.responses_tx)
    }
}
