use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use novelai_contracts::config::Config;
use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use crate::error::GenerationError;

/// Blocking HTTP access to one backend endpoint. Configured extra headers go
/// on every request; per-call auth headers are layered on top of them.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    endpoint: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            headers: header_map(headers)?,
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config
            .endpoint()
            .with_context(|| format!("backend '{}' has no endpoint", config.backend))?;
        Self::new(endpoint, &config.headers, config.request_timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URLs pass through; anything else is joined to the endpoint.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.endpoint, path)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        auth: &[(&'static str, String)],
        timeout: Duration,
    ) -> Result<RequestBuilder, GenerationError> {
        let mut headers = self.headers.clone();
        for (name, value) in auth {
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            headers.insert(name, value);
        }
        Ok(self
            .http
            .request(method, self.url(path))
            .headers(headers)
            .timeout(timeout))
    }

    pub fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        auth: &[(&'static str, String)],
    ) -> Result<HttpResponse, GenerationError> {
        let request = self.request(Method::POST, path, auth, self.timeout)?.json(body);
        send(request)
    }

    pub fn get(
        &self,
        path: &str,
        auth: &[(&'static str, String)],
    ) -> Result<HttpResponse, GenerationError> {
        self.get_with_timeout(path, auth, self.timeout)
    }

    pub fn get_with_timeout(
        &self,
        path: &str,
        auth: &[(&'static str, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, GenerationError> {
        send(self.request(Method::GET, path, auth, timeout)?)
    }

    /// Fetches an absolute URL on another host; configured headers stay
    /// with the backend endpoint.
    pub fn get_external(&self, url: &str) -> Result<HttpResponse, GenerationError> {
        send(self.http.get(url).timeout(self.timeout))
    }

    pub fn post_multipart(
        &self,
        path: &str,
        form: MultipartForm,
    ) -> Result<HttpResponse, GenerationError> {
        let request = self
            .request(Method::POST, path, &[], self.timeout)?
            .multipart(form);
        send(request)
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid header name '{name}'"))?;
        let header_value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header '{name}'"))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn send(request: RequestBuilder) -> Result<HttpResponse, GenerationError> {
    let response = request.send().map_err(|err| classify_reqwest_error(&err))?;
    check_status(response)
}

fn check_status(response: HttpResponse) -> Result<HttpResponse, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let url = response.url().to_string();
    let body = response.text().unwrap_or_default();
    debug!("{url} responded {code}: {}", truncate_text(&body, 512));
    if code == 402 {
        return Err(GenerationError::Unauthorized);
    }
    Err(GenerationError::Status(code))
}

pub fn read_json(response: HttpResponse) -> Result<Value, GenerationError> {
    let url = response.url().to_string();
    let body = response.text().map_err(|err| classify_reqwest_error(&err))?;
    let parsed = serde_json::from_str(&body)
        .with_context(|| format!("{url} returned invalid JSON: {}", truncate_text(&body, 256)))?;
    Ok(parsed)
}

pub fn read_text(response: HttpResponse) -> Result<String, GenerationError> {
    response.text().map_err(|err| classify_reqwest_error(&err))
}

pub fn content_type(response: &HttpResponse) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Body bytes plus the response content type.
pub fn read_bytes(response: HttpResponse) -> Result<(Vec<u8>, Option<String>), GenerationError> {
    let mime = content_type(&response);
    let bytes = response
        .bytes()
        .map_err(|err| classify_reqwest_error(&err))?;
    Ok((bytes.to_vec(), mime))
}

/// Sorts a reqwest failure into timeout / transport, deriving an errno-style
/// code from the underlying I/O error when there is one.
pub fn classify_reqwest_error(err: &reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        return GenerationError::Timeout;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return GenerationError::Timeout;
            }
            if let Some(code) = io_error_code(io_err.kind()) {
                return GenerationError::transport(code);
            }
        }
        source = cause.source();
    }
    let code = if err.is_connect() {
        "ECONNECT"
    } else if err.is_body() || err.is_decode() {
        "EBODY"
    } else {
        "EREQUEST"
    };
    GenerationError::transport(code)
}

fn io_error_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
        io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        io::ErrorKind::NotConnected => Some("ENOTCONN"),
        io::ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        io::ErrorKind::UnexpectedEof => Some("ECONNRESET"),
        _ => None,
    }
}

/// Runs `attempt` up to `max_attempts` times (at least once), retrying only
/// failures for which `GenerationError::is_retryable` holds.
pub fn with_retries<T>(
    max_attempts: u32,
    label: &str,
    mut attempt: impl FnMut(u32) -> Result<T, GenerationError>,
) -> Result<T, GenerationError> {
    let max_attempts = max_attempts.max(1);
    let mut count = 0;
    loop {
        count += 1;
        match attempt(count) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && count < max_attempts => {
                warn!("{label}: attempt {count}/{max_attempts} failed ({err}), retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::net::TcpListener;

    use serde_json::json;

    use super::*;
    use crate::test_server::{FakeServer, Reply};

    #[test]
    fn retries_transport_errors_up_to_the_attempt_cap() {
        let calls = Cell::new(0);
        let result: Result<(), GenerationError> = with_retries(3, "test", |_| {
            calls.set(calls.get() + 1);
            Err(GenerationError::transport("ECONNRESET"))
        });
        assert!(matches!(result, Err(GenerationError::Transport { .. })));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_timeouts_or_statuses() {
        let calls = Cell::new(0);
        let result: Result<(), GenerationError> = with_retries(5, "test", |_| {
            calls.set(calls.get() + 1);
            Err(GenerationError::Timeout)
        });
        assert!(matches!(result, Err(GenerationError::Timeout)));
        assert_eq!(calls.get(), 1);

        let succeeded = with_retries(0, "test", |attempt| Ok(attempt));
        assert!(matches!(succeeded, Ok(1)));
    }

    #[test]
    fn recovers_after_a_transient_failure() {
        let result = with_retries(3, "test", |attempt| {
            if attempt < 2 {
                Err(GenerationError::transport("ECONNREFUSED"))
            } else {
                Ok("done")
            }
        });
        assert!(matches!(result, Ok("done")));
    }

    #[test]
    fn classifies_statuses_and_sends_headers() -> anyhow::Result<()> {
        let server = FakeServer::start(vec![
            Reply::json(200, json!({ "ok": true })),
            Reply::json(402, json!({ "message": "no anlas" })),
            Reply::text(503, "busy"),
        ])?;
        let mut headers = BTreeMap::new();
        headers.insert("X-Extra".to_string(), "1".to_string());
        let transport = HttpTransport::new(server.url(), &headers, Duration::from_secs(5))?;

        let response = transport.post_json(
            "/ai/generate-image",
            &json!({ "a": 1 }),
            &[("authorization", "Bearer abc".to_string())],
        )?;
        assert_eq!(read_json(response)?, json!({ "ok": true }));
        assert!(matches!(
            transport.get("/x", &[]),
            Err(GenerationError::Unauthorized)
        ));
        assert!(matches!(
            transport.get("/y", &[]),
            Err(GenerationError::Status(503))
        ));

        let requests = server.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/ai/generate-image");
        assert_eq!(requests[0].header("x-extra"), Some("1"));
        assert_eq!(requests[0].header("authorization"), Some("Bearer abc"));
        assert_eq!(requests[0].json()?, json!({ "a": 1 }));
        Ok(())
    }

    #[test]
    fn slow_servers_time_out() -> anyhow::Result<()> {
        let server = FakeServer::start(vec![Reply::stall(Duration::from_secs(3))])?;
        let transport =
            HttpTransport::new(server.url(), &BTreeMap::new(), Duration::from_millis(200))?;
        assert!(matches!(transport.get("/slow", &[]), Err(GenerationError::Timeout)));
        Ok(())
    }

    #[test]
    fn refused_connections_are_retryable_transport_errors() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        drop(listener);
        let transport = HttpTransport::new(endpoint, &BTreeMap::new(), Duration::from_secs(2))?;
        let err = match transport.get("/", &[]) {
            Ok(_) => anyhow::bail!("expected a connection failure"),
            Err(err) => err,
        };
        assert!(err.is_retryable(), "unexpected error: {err:?}");
        Ok(())
    }

    #[test]
    fn rejects_invalid_configured_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(HttpTransport::new("http://localhost", &headers, Duration::from_secs(1)).is_err());
    }
}
