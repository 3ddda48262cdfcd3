// Transport layer
// The networking primitive the request pipeline sends through

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;

use crate::error::{ApiError, TransportErrorKind};

/// A fully prepared outbound request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

impl TransportRequest {
    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Raw response: status code plus undecoded payload
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Build a response whose body is the serialized JSON value
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string())
    }
}

/// Failure to obtain any response
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        ApiError::Transport {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// Sends a request and returns status + raw payload, or a transport error
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by reqwest
pub struct ReqwestTransport {
    /// Shared HTTP client with connection pooling
    client: Client,
}

impl ReqwestTransport {
    /// Create a new transport
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(request.timeout);

        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| classify_error(&e))?;

        Ok(TransportResponse { status, body })
    }
}

/// Map a reqwest error onto the transport taxonomy
fn classify_error(err: &reqwest::Error) -> TransportError {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }

    let kind = classify(err.is_timeout(), err.is_connect(), &detail);

    tracing::warn!(
        error_kind = kind.as_str(),
        error = %detail,
        "HTTP transport error"
    );

    TransportError::new(kind, detail)
}

/// Classification rules shared by all transports
pub fn classify(is_timeout: bool, is_connect: bool, detail: &str) -> TransportErrorKind {
    let detail = detail.to_lowercase();
    if is_timeout || detail.contains("timed out") {
        TransportErrorKind::Timeout
    } else if detail.contains("certificate") || detail.contains("-1012") {
        TransportErrorKind::Certificate
    } else if is_connect {
        TransportErrorKind::Connection
    } else {
        TransportErrorKind::Network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, CONTENT_TYPE};

    fn request(url: String, timeout: Duration) -> TransportRequest {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-client-type", HeaderValue::from_static("miniprogram"));
        TransportRequest {
            method: Method::POST,
            url,
            headers,
            body: Some(serde_json::json!({"title": "hello"})),
            timeout,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(true, false, ""), TransportErrorKind::Timeout);
        assert_eq!(
            classify(false, true, "error trying to connect: invalid peer certificate: UnknownIssuer"),
            TransportErrorKind::Certificate
        );
        assert_eq!(
            classify(false, true, "error trying to connect: Connection refused"),
            TransportErrorKind::Connection
        );
        assert_eq!(
            classify(false, false, "request:fail -1012"),
            TransportErrorKind::Certificate
        );
        assert_eq!(classify(false, false, "body error"), TransportErrorKind::Network);
    }

    #[test]
    fn test_transport_error_into_api_error() {
        let err: ApiError = TransportError::new(TransportErrorKind::Connection, "refused").into();
        match err {
            ApiError::Transport { kind, message } => {
                assert_eq!(kind, TransportErrorKind::Connection);
                assert_eq!(message, "refused");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reqwest_transport_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/diary")
            .match_header("x-client-type", "miniprogram")
            .match_body(mockito::Matcher::Json(serde_json::json!({"title": "hello"})))
            .with_status(201)
            .with_body(r#"{"code":200,"data":{"id":7}}"#)
            .create_async()
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .send(request(format!("{}/diary", server.url()), Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["data"]["id"], 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_reqwest_transport_passes_error_statuses_through() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/diary")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .send(request(format!("{}/diary", server.url()), Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(&response.body[..], b"unavailable");
    }

    #[tokio::test]
    async fn test_reqwest_transport_connection_refused() {
        // Bind then drop a listener to obtain a port with nothing behind it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = ReqwestTransport::new(Duration::from_secs(2)).unwrap();
        let err = transport
            .send(request(format!("http://127.0.0.1:{}/diary", port), Duration::from_secs(2)))
            .await
            .unwrap_err();

        assert_eq!(err.kind, TransportErrorKind::Connection);
    }
}
