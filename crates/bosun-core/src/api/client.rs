use futures_util::StreamExt;
use reqwest::header;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::api::error::ApiError;
use crate::api::sse::parse_sse_stream;
use crate::api::types::{ResponsesRequest, StreamEvent};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/responses";

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub type EventStream =
    Pin<Box<dyn futures::Stream<Item = Result<StreamEvent, ApiError>> + Send>>;

/// Streaming client for the Responses API create endpoint.
#[derive(Clone)]
pub struct ResponsesClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl ResponsesClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, None)
    }

    pub fn with_base_url(api_key: String, base_url: Option<String>) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .expect("Invalid API key format"),
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(super::HTTP_CONNECT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http_client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        }
    }

    /// Open a streaming response. Transient upstream failures (429, 5xx,
    /// connect errors) are retried with exponential backoff before the
    /// stream starts; once bytes are flowing, errors surface on the stream.
    pub async fn stream_response(
        &self,
        mut request: ResponsesRequest,
        token: CancellationToken,
    ) -> Result<EventStream, ApiError> {
        request.stream = Some(true);

        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        let response = loop {
            match self.send_request(&request, &token).await {
                Ok(response) => break response,
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        target: "bosun::api",
                        attempt,
                        "Retryable error from provider, backing off: {err}"
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(ApiError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let sse_stream = parse_sse_stream(response.bytes_stream());

        Ok(Box::pin(convert_event_stream(sse_stream, token)))
    }

    async fn send_request(
        &self,
        request: &ResponsesRequest,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, ApiError> {
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(target: "bosun::api", "Cancelled before sending request");
                return Err(ApiError::Cancelled);
            }
            res = self.http_client.post(&self.base_url).json(request).send() => {
                res.map_err(ApiError::Network)?
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let details = extract_error_message(&body).unwrap_or(body);
        error!(
            target: "bosun::api",
            "Request failed with status {status}: {details}"
        );

        Err(match status.as_u16() {
            401 | 403 => ApiError::AuthenticationFailed { details },
            429 => ApiError::RateLimited { details },
            code => ApiError::ServerError {
                status_code: code,
                details,
            },
        })
    }
}

/// Pull the provider's error message out of an error body, if present.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(|s| s.to_string())
}

fn convert_event_stream(
    mut sse_stream: crate::api::sse::SseStream,
    token: CancellationToken,
) -> impl futures::Stream<Item = Result<StreamEvent, ApiError>> + Send + 'static {
    async_stream::stream! {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    yield Err(ApiError::Cancelled);
                    break;
                }
                event = sse_stream.next() => event,
            };

            let Some(event) = event else {
                break;
            };

            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    yield Err(err);
                    break;
                }
            };

            if event.data.is_empty() {
                continue;
            }

            match serde_json::from_str::<StreamEvent>(&event.data) {
                Ok(StreamEvent::Error { code, message }) => {
                    yield Err(ApiError::StreamError {
                        details: format!("{code}: {message}"),
                    });
                    break;
                }
                Ok(decoded) => yield Ok(decoded),
                Err(err) => {
                    // Tolerate payloads we cannot decode; the provider may
                    // introduce event shapes at any time.
                    debug!(
                        target: "bosun::api",
                        event_type = ?event.event_type,
                        "Skipping undecodable event: {err}"
                    );
                }
            }
        }
    }
}
