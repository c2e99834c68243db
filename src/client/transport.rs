//! How the consumer reaches the relay.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;

use super::ConsumerError;

/// Body bytes in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes, ConsumerError>>;

/// The JSON body posted to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AskPayload {
    pub prompt: String,
    #[serde(rename = "previousC1Response", skip_serializing_if = "Option::is_none")]
    pub previous_response: Option<String>,
}

impl AskPayload {
    pub fn new(prompt: impl Into<String>, previous_response: Option<&str>) -> Self {
        Self {
            prompt: prompt.into(),
            previous_response: previous_response.map(str::to_owned),
        }
    }
}

/// Status plus body stream. `body` is `None` when the response carries no
/// body at all.
pub struct TransportResponse {
    pub status: u16,
    pub body: Option<ByteStream>,
}

/// Opens one relay request. Dropping the returned future, or the body
/// stream, aborts the underlying I/O.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self, payload: &AskPayload) -> Result<TransportResponse, ConsumerError>;
}

/// `reqwest`-backed transport posting to the relay's endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self, ConsumerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConsumerError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RelayTransport for HttpTransport {
    async fn open(&self, payload: &AskPayload) -> Result<TransportResponse, ConsumerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| ConsumerError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        // These statuses never carry a body.
        let body = if matches!(status, 204 | 205 | 304) {
            None
        } else {
            Some(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| ConsumerError::Read(e.to_string())))
                    .boxed(),
            )
        };

        Ok(TransportResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_wire_field_names() {
        let json = serde_json::to_value(AskPayload::new("next", Some("earlier"))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "prompt": "next", "previousC1Response": "earlier" })
        );
    }

    #[test]
    fn absent_previous_response_is_omitted() {
        let json = serde_json::to_string(&AskPayload::new("hello", None)).unwrap();
        assert_eq!(json, r#"{"prompt":"hello"}"#);
    }
}
