use crate::backends::ConnectionString;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{QuarryError, Result};
use serde_json::Value as JsonValue;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::debug;

const DEFAULT_HOST: &str = "localhost:9200";

/// How often a caller waiting on an in-flight request re-checks its context.
const CANCEL_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Vec<u8>>,
    pub content_type: &'static str,
}

impl TransportRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
            content_type: "application/json",
        }
    }

    pub fn post(path: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
            content_type: "application/json",
        }
    }

    /// Newline-delimited JSON, as `_bulk` expects.
    pub fn bulk(path: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            content_type: "application/x-ndjson",
            ..Self::post(path, body)
        }
    }

    /// The body decoded as JSON, for inspecting requests in tests and logs.
    pub fn json_body(&self) -> Option<JsonValue> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub reason: String,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            reason: String::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(QuarryError::HttpStatus {
                status: self.status,
                reason: self.reason,
            })
        }
    }

    pub fn json(&self) -> Result<JsonValue> {
        serde_json::from_slice(&self.body).map_err(|e| QuarryError::ResponseDecode(e.to_string()))
    }
}

/// Sends one request to a search engine and returns the raw response.
///
/// A non-success status is a successful send; callers decide what it means.
pub trait SearchTransport: Send + Sync {
    fn send(&self, ctx: &Context, request: &TransportRequest) -> Result<TransportResponse>;
}

/// Blocking HTTP transport. The request timeout is the earlier of the
/// context deadline and the configured default.
pub struct HttpTransport {
    base_url: String,
    agent: ureq::Agent,
    default_timeout: Option<Duration>,
}

fn agent_with_timeout(timeout: Option<Duration>) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(timeout)
        .http_status_as_error(false)
        .build();
    ureq::Agent::new_with_config(config)
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, default_timeout: Option<Duration>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent: agent_with_timeout(default_timeout),
            default_timeout,
        }
    }

    /// `elasticsearch://host:port` speaks plain HTTP, `elasticsearch+https://`
    /// speaks TLS.
    pub fn from_connection(conn: &ConnectionString, config: &EngineConfig) -> Self {
        let scheme = match conn.protocol() {
            Some("https") => "https",
            _ => "http",
        };
        let host = if conn.host().is_empty() {
            DEFAULT_HOST
        } else {
            conn.host()
        };

        Self::new(format!("{}://{}", scheme, host), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn agent_for(&self, ctx: &Context) -> ureq::Agent {
        match (ctx.remaining(), self.default_timeout) {
            (None, _) => self.agent.clone(),
            (Some(left), Some(default)) if default <= left => self.agent.clone(),
            (Some(left), _) => agent_with_timeout(Some(left)),
        }
    }
}

fn transport_error(err: ureq::Error) -> QuarryError {
    match err {
        ureq::Error::Timeout(_) => QuarryError::DeadlineExceeded,
        err => QuarryError::Transport(err.to_string()),
    }
}

fn execute(agent: &ureq::Agent, url: &str, request: &TransportRequest) -> Result<TransportResponse> {
    let body = request.body.as_deref().unwrap_or_default();

    let result = match request.method {
        Method::Get => agent.get(url).call(),
        Method::Delete => agent.delete(url).call(),
        Method::Post => agent
            .post(url)
            .header("Content-Type", request.content_type)
            .send(body),
        Method::Put => agent
            .put(url)
            .header("Content-Type", request.content_type)
            .send(body),
    };

    let mut response = result.map_err(transport_error)?;
    let status = response.status();
    let body = response.body_mut().read_to_vec().map_err(transport_error)?;

    Ok(TransportResponse {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or_default().to_string(),
        body,
    })
}

impl SearchTransport for HttpTransport {
    /// The request runs on its own thread while the caller watches `ctx`;
    /// cancellation or an expired deadline returns at once and abandons the
    /// request, which the agent timeout eventually reaps.
    fn send(&self, ctx: &Context, request: &TransportRequest) -> Result<TransportResponse> {
        ctx.check()?;

        let url = format!("{}{}", self.base_url, request.path);
        let agent = self.agent_for(ctx);
        debug!(method = request.method.as_str(), url, "search request");

        let (tx, rx) = mpsc::channel();
        let job = request.clone();
        thread::spawn(move || {
            let _ = tx.send(execute(&agent, &url, &job));
        });

        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = ctx.check() {
                        debug!(error = %err, "abandoning in-flight search request");
                        return Err(err);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(QuarryError::Transport(
                        "request worker exited without a response".to_string(),
                    ));
                }
            }
        }
    }
}
