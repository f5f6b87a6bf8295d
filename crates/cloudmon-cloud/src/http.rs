//! JSON-over-HTTP request execution with per-attempt timeout, retry and
//! backoff.
//!
//! A request is retried when it times out, fails to connect, or comes back
//! with 429/500/502/503/504. The delay honours `Retry-After` when present,
//! otherwise it doubles from a base delay up to a cap, plus random jitter so
//! concurrent workers do not retry in lockstep.

use crate::config::HttpConfig;
use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Statuses that count as transient.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Maximum number of body bytes kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    /// Upper bound applied to server-supplied `Retry-After` values.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for RetryPolicy {
    fn from(config: &HttpConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the next attempt. A server-supplied `Retry-After`
    /// replaces the computed backoff.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(wait) = retry_after {
            return wait.min(self.max_retry_after);
        }
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff(attempt) + jitter
    }

    /// `attempt` is zero-based: the first try is attempt 0.
    pub fn should_retry(&self, error: &CloudError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }
}

/// Drive `operation` until it succeeds, fails permanently, or the policy's
/// budget is spent. The closure receives the zero-based attempt number.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(&e, attempt) => {
                let delay = policy.delay_for(attempt, e.retry_after());
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Request failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(CloudError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(e),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Parse a `Retry-After` header given either as delta-seconds or as an
/// HTTP-date. Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    /// Pre-serialized body, sent byte for byte (needed when the body is signed).
    Text(String),
}

/// Description of one outbound call. Cloned for every attempt.
#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl std::fmt::Debug for HttpRequest {
    // Headers carry bearer tokens and signatures.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(pairs);
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = RequestBody::Text(body.into());
        self
    }
}

/// Shared JSON request executor. Cheap to clone; clones share the
/// connection pool.
#[derive(Clone)]
pub struct RetryingHttpClient {
    client: Client,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryingHttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .user_agent(concat!("cloudmon/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            policy: RetryPolicy::from(config),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `request` with the client's default per-attempt timeout.
    pub async fn request(&self, request: &HttpRequest) -> Result<Value> {
        self.request_with_timeout(request, self.timeout).await
    }

    /// Execute `request`, bounding every attempt by `timeout`.
    pub async fn request_with_timeout(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<Value> {
        retry_with_policy(&self.policy, &request.url, |_| {
            self.attempt(request, timeout)
        })
        .await
    }

    async fn attempt(&self, request: &HttpRequest, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.send_once(request)).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Transient {
                url: request.url.clone(),
                status: None,
                retry_after: None,
                message: format!("timed out after {timeout:?}"),
            }),
        }
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<Value> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(v) => builder.json(v),
            RequestBody::Form(pairs) => builder.form(pairs),
            RequestBody::Text(body) => builder.body(body.clone()),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&request.url, e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(&request.url, e))?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body).map_err(|e| CloudError::Protocol {
                url: request.url.clone(),
                message: format!(
                    "status {} with non-JSON body ({e}): {}",
                    status.as_u16(),
                    truncate_body(&body, MAX_ERROR_BODY_CHARS)
                ),
            });
        }

        if RETRYABLE_STATUSES.contains(&status.as_u16()) {
            return Err(CloudError::Transient {
                url: request.url.clone(),
                status: Some(status.as_u16()),
                retry_after,
                message: truncate_body(&body, MAX_ERROR_BODY_CHARS),
            });
        }

        Err(CloudError::Permanent {
            url: request.url.clone(),
            status: status.as_u16(),
            body: truncate_body(&body, MAX_ERROR_BODY_CHARS),
        })
    }
}

fn transport_error(url: &str, error: reqwest::Error) -> CloudError {
    if error.is_builder() {
        return CloudError::Network(error);
    }
    CloudError::Transient {
        url: url.to_string(),
        status: error.status().map(|s| s.as_u16()),
        retry_after: None,
        message: error.to_string(),
    }
}

/// Truncate to at most `max` bytes on a char boundary.
fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            max_jitter: Duration::ZERO,
            max_retry_after: Duration::from_secs(5),
        }
    }

    fn client(max_retries: u32) -> RetryingHttpClient {
        RetryingHttpClient::new(&HttpConfig::default())
            .unwrap()
            .with_policy(fast_policy(max_retries))
            .with_timeout(Duration::from_secs(5))
    }

    #[test]
    fn should_double_backoff_per_attempt_until_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_jitter: Duration::from_millis(50),
            max_retry_after: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));

        // jitter stays below the gap between consecutive steps
        for attempt in 0..3 {
            let this = policy.delay_for(attempt, None);
            let next = policy.delay_for(attempt + 1, None);
            assert!(next > this, "attempt {attempt}: {next:?} <= {this:?}");
        }
    }

    #[test]
    fn should_prefer_retry_after_and_cap_it() {
        let policy = fast_policy(3);
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(600))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn should_parse_retry_after_seconds_and_http_dates() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[tokio::test]
    async fn should_return_body_after_transient_failures_with_growing_delays() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let started = Instant::now();
        let body = client(3)
            .request(&HttpRequest::get(format!("{}/flaky", server.uri())))
            .await
            .expect("fourth attempt should succeed");

        assert_eq!(body["ok"], true);
        // 20ms + 40ms + 80ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn should_honour_retry_after_on_throttling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([1, 2])))
            .mount(&server)
            .await;

        let body = client(2)
            .request(&HttpRequest::get(server.uri()))
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn should_not_retry_permanent_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such thing"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(3)
            .request(&HttpRequest::get(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Permanent { status: 404, .. }));
        assert!(err.to_string().contains("no such thing"));
    }

    #[tokio::test]
    async fn should_treat_non_json_success_body_as_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(3)
            .request(&HttpRequest::get(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Protocol { .. }));
    }

    #[tokio::test]
    async fn should_surface_last_status_when_retries_are_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(2)
            .request(&HttpRequest::post(server.uri()).json(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn should_retry_timed_out_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({}))
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(2)
            .mount(&server)
            .await;

        let err = client(1)
            .with_timeout(Duration::from_millis(50))
            .request(&HttpRequest::get(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn should_truncate_on_char_boundary() {
        let body = "ab€cd";
        assert_eq!(truncate_body(body, 3), "ab...");
        assert_eq!(truncate_body("short", 10), "short");
    }
}
