//! HTTP seam used by the delivery queue, the heartbeat and direct requests

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    Empty,
    Text { content: String, content_type: String },
    /// Uploaded as a multipart form with a single `uploadedFile` part
    File {
        name: String,
        bytes: Bytes,
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: HttpBody,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            body: HttpBody::Empty,
            timeout,
        }
    }

    pub fn text(mut self, content: impl Into<String>, content_type: &str) -> Self {
        self.body = HttpBody::Text {
            content: content.into(),
            content_type: content_type.to_string(),
        };
        self
    }

    pub fn file(mut self, name: impl Into<String>, bytes: Bytes) -> Self {
        self.body = HttpBody::File {
            name: name.into(),
            bytes,
            content_type: None,
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status} {status_text}")]
    Status { status: u16, status_text: String },

    #[error("HTTP transport failure: {0}")]
    Transport(String),
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Sends one HTTP request. Implementations must not retry.
pub trait HttpSend: Send + Sync + 'static {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, HttpError>>;
}

/// `HttpSend` backed by a shared `reqwest::Client`
#[derive(Clone, Default)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpSend for ReqwestSender {
    fn send(&self, request: HttpRequest) -> BoxFuture<'static, Result<HttpResponse, HttpError>> {
        let client = self.client.clone();
        async move {
            let method = match request.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
            };
            let mut builder = client
                .request(method, &request.url)
                .timeout(request.timeout);

            builder = match request.body {
                HttpBody::Empty => builder,
                HttpBody::Text {
                    content,
                    content_type,
                } => builder
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(content),
                HttpBody::File {
                    name,
                    bytes,
                    content_type,
                } => {
                    let mut part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(name);
                    if let Some(content_type) = content_type {
                        part = part
                            .mime_str(&content_type)
                            .map_err(|e| HttpError::Transport(e.to_string()))?;
                    }
                    builder.multipart(reqwest::multipart::Form::new().part("uploadedFile", part))
                }
            };

            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status();
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            Ok::<_, HttpError>(HttpResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            })
        }
        .boxed()
    }
}

fn map_reqwest_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Transport(err.to_string())
    }
}

/// Send a request once and require HTTP 200.
pub async fn send_expecting_ok(
    sender: &dyn HttpSend,
    request: HttpRequest,
) -> Result<HttpResponse, HttpError> {
    let response = sender.send(request).await?;
    if response.status == 200 {
        Ok(response)
    } else {
        Err(HttpError::Status {
            status: response.status,
            status_text: response.status_text,
        })
    }
}
