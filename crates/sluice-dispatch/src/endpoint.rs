//! Endpoint: owner of one transport session and the request/response logic.
//!
//! An endpoint turns an opaque JSON request into a classified response. It
//! builds the URL and headers from immutable configuration, applies the
//! configured auth scheme, executes over HTTP (or a provider SDK client),
//! and maps every failure into the shared error taxonomy. The underlying
//! session is created lazily on first use, shared by concurrent calls, and
//! torn down exactly once by `close` or scope exit; a later call opens a
//! fresh session.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::{ApiError, Result};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

/// Transport used to execute calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Plain HTTP via the shared session.
    Http,
    /// Provider SDK client object.
    Sdk,
}

/// How the API key is presented to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// No authentication.
    None,
    /// `Authorization: Bearer <key>`.
    Bearer,
    /// `x-api-key: <key>`.
    XApiKey,
    /// HTTP basic auth with the key as username.
    Basic,
}

/// API key material, held opaquely.
///
/// The wrapper never reveals the key through `Debug` or `Display`, so the
/// secret cannot leak into logs or error messages.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wraps key material.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Reads the key from the environment variable `name`, falling back to
    /// treating `name` itself as the literal key when the variable is unset.
    pub fn from_env_or_literal(name: &str) -> Self {
        Self(std::env::var(name).unwrap_or_else(|_| name.to_string()))
    }

    /// Returns the secret for constructing an auth header.
    pub(crate) fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(***)")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

/// HTTP client construction options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// User agent sent with every request.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("sluice/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Immutable endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Provider name, used for logging and rate-limit keys.
    pub provider: String,
    /// Transport used to execute calls.
    pub transport: TransportKind,
    /// Base URL; required for the HTTP transport.
    pub base_url: Option<String>,
    /// Path appended to the base URL.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Content type for request bodies.
    pub content_type: String,
    /// Auth scheme applied to each request.
    pub auth: AuthScheme,
    /// Headers sent with every request.
    pub default_headers: HashMap<String, String>,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Advisory retry budget for layers above the endpoint.
    pub max_retries_hint: u32,
    /// HTTP client construction options.
    pub client_options: ClientOptions,
    /// API key material; required for any auth scheme except `None`.
    pub api_key: Option<ApiKey>,
}

impl EndpointConfig {
    /// Creates a config with the customary defaults: POST, JSON, no auth,
    /// 300 second timeout.
    pub fn new(provider: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            transport: TransportKind::Http,
            base_url: None,
            path: path.into(),
            method: "POST".to_string(),
            content_type: "application/json".to_string(),
            auth: AuthScheme::None,
            default_headers: HashMap::new(),
            timeout: Duration::from_secs(300),
            max_retries_hint: 3,
            client_options: ClientOptions::default(),
            api_key: None,
        }
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the HTTP method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Sets the auth scheme and key.
    pub fn with_auth(mut self, auth: AuthScheme, api_key: ApiKey) -> Self {
        self.auth = auth;
        self.api_key = Some(api_key);
        self
    }

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Switches the endpoint to the SDK transport.
    pub fn with_sdk_transport(mut self) -> Self {
        self.transport = TransportKind::Sdk;
        self
    }

    /// Full request URL.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the HTTP transport has no base URL.
    pub fn full_url(&self) -> Result<String> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| ApiError::invalid_argument("http endpoint requires a base_url"))?;
        Ok(format!("{}{}", base.trim_end_matches('/'), ensure_leading_slash(&self.path)))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero timeout, an unparsable method,
    /// a missing base URL on HTTP, or an auth scheme without key material.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(ApiError::invalid_argument("endpoint timeout must be positive"));
        }
        if Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(ApiError::invalid_argument(format!(
                "invalid http method: {}",
                self.method
            )));
        }
        if self.transport == TransportKind::Http {
            self.full_url()?;
        }
        if self.auth != AuthScheme::None && self.api_key.is_none() {
            return Err(ApiError::invalid_argument("auth scheme requires an api key"));
        }
        Ok(())
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Provider SDK client dispatched instead of HTTP.
///
/// Implementations translate the opaque request into SDK calls and map SDK
/// failures into the shared taxonomy; the endpoint applies the same
/// lifecycle rules to both transports.
#[async_trait::async_trait]
pub trait SdkClient: Send + Sync + fmt::Debug {
    /// Executes one request.
    async fn invoke(&self, request: &Value) -> Result<Value>;

    /// Releases resources held by the client.
    async fn close(&self) {}
}

/// Owner of one transport session and the call execution logic.
pub struct Endpoint {
    config: EndpointConfig,
    session: Mutex<Option<reqwest::Client>>,
    /// Counts sessions opened over the endpoint's lifetime; observable so
    /// callers can verify close-then-reopen behavior.
    generation: AtomicU64,
    sdk: Option<Arc<dyn SdkClient>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("provider", &self.config.provider)
            .field("path", &self.config.path)
            .field("transport", &self.config.transport)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Creates an HTTP endpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation or
    /// names the SDK transport (use [`with_sdk_client`](Self::with_sdk_client)).
    pub fn new(config: EndpointConfig) -> Result<Self> {
        config.validate()?;
        if config.transport == TransportKind::Sdk {
            return Err(ApiError::invalid_argument(
                "sdk transport requires an sdk client, use Endpoint::with_sdk_client",
            ));
        }
        Ok(Self {
            config,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            sdk: None,
        })
    }

    /// Creates an endpoint dispatching to a provider SDK client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configuration fails validation.
    pub fn with_sdk_client(mut config: EndpointConfig, client: Arc<dyn SdkClient>) -> Result<Self> {
        config.transport = TransportKind::Sdk;
        config.validate()?;
        Ok(Self {
            config,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            sdk: Some(client),
        })
    }

    /// Endpoint configuration.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Number of sessions opened so far.
    pub fn session_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// True while a session is open.
    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Executes one call and classifies the outcome.
    ///
    /// `cache_control` is a per-call hint forwarded from the event; the
    /// endpoint logs it but no response cache is wired in.
    ///
    /// # Errors
    ///
    /// Returns the classified error for HTTP failures, transport failures,
    /// timeouts, and undecodable success bodies.
    pub async fn call(&self, request: &Value, cache_control: bool) -> Result<Value> {
        match self.config.transport {
            TransportKind::Sdk => {
                let client = self.sdk.as_ref().ok_or_else(|| {
                    ApiError::invalid_state("sdk transport without an sdk client")
                })?;
                client.invoke(request).await
            },
            TransportKind::Http => self.call_http(request, cache_control).await,
        }
    }

    /// Tears down the session. Idempotent; a later call opens a new one.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if session.take().is_some() {
            debug!(provider = %self.config.provider, "endpoint session closed");
        }
        if let Some(sdk) = &self.sdk {
            sdk.close().await;
        }
    }

    /// Runs `f` and closes the session on the way out, on both success and
    /// error return paths.
    pub async fn scope<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let result = f().await;
        self.close().await;
        result
    }

    /// Returns the shared session, building it on first use.
    async fn session(&self) -> Result<reqwest::Client> {
        let mut session = self.session.lock().await;
        if let Some(client) = session.as_ref() {
            return Ok(client.clone());
        }

        let options = &self.config.client_options;
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(&options.user_agent)
            .redirect(reqwest::redirect::Policy::limited(options.max_redirects as usize))
            .danger_accept_invalid_certs(!options.verify_tls)
            .build()
            .map_err(|e| ApiError::invalid_argument(format!("failed to build http client: {e}")))?;

        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!(
            provider = %self.config.provider,
            generation = self.generation.load(Ordering::Acquire),
            "endpoint session opened"
        );
        *session = Some(client.clone());
        Ok(client)
    }

    async fn call_http(&self, request: &Value, cache_control: bool) -> Result<Value> {
        let client = self.session().await?;
        let url = self.config.full_url()?;
        let method = Method::from_bytes(self.config.method.as_bytes())
            .map_err(|_| ApiError::invalid_argument(format!("invalid http method: {}", self.config.method)))?;

        let span = info_span!(
            "api_call",
            provider = %self.config.provider,
            method = %self.config.method,
            path = %self.config.path,
        );

        async move {
            let mut builder = client
                .request(method.clone(), &url)
                .timeout(self.config.timeout)
                .header(CONTENT_TYPE, &self.config.content_type);

            for (name, value) in &self.config.default_headers {
                builder = builder.header(name, value);
            }
            builder = self.apply_auth(builder)?;

            if method == Method::GET {
                builder = builder.query(&query_pairs(request));
            } else {
                builder = builder.json(request);
            }

            if cache_control {
                debug!("cache_control hint set on call");
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(error) => {
                    warn!(error = %error, "request failed before a response arrived");
                    if error.is_timeout() {
                        return Err(ApiError::timeout(self.config.timeout.as_secs()));
                    }
                    if error.is_connect() {
                        return Err(ApiError::transport(format!("connection failed: {error}")));
                    }
                    return Err(ApiError::transport(error.to_string()));
                },
            };

            let status = response.status();
            let headers = extract_headers(response.headers());
            // Read the body on every path so the connection is drained and
            // released back to the pool.
            let body = response.bytes().await.map_err(|error| {
                if error.is_timeout() {
                    ApiError::timeout(self.config.timeout.as_secs())
                } else {
                    ApiError::transport(format!("failed to read response body: {error}"))
                }
            })?;

            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            if status.is_success() {
                return decode_body(&headers, &body);
            }
            Err(classify_status(status, &headers, &body))
        }
        .instrument(span)
        .await
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let key = || {
            self.config
                .api_key
                .as_ref()
                .ok_or_else(|| ApiError::invalid_argument("auth scheme requires an api key"))
        };
        Ok(match self.config.auth {
            AuthScheme::None => builder,
            AuthScheme::Bearer => builder.bearer_auth(key()?.reveal()),
            AuthScheme::XApiKey => builder.header("x-api-key", key()?.reveal()),
            AuthScheme::Basic => builder.basic_auth(key()?.reveal(), Option::<&str>::None),
        })
    }
}

/// Flattens a JSON object into query parameters for GET requests.
fn query_pairs(request: &Value) -> Vec<(String, String)> {
    match request {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Extracts response headers into a plain map, lowercasing names.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in header_map {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    headers
}

/// Decodes a 2xx body: JSON when the content type says so, raw text
/// otherwise.
fn decode_body(headers: &HashMap<String, String>, body: &[u8]) -> Result<Value> {
    let is_json = headers
        .get("content-type")
        .is_some_and(|content_type| content_type.contains("json"));

    if is_json {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::bad_response(format!("invalid json in 2xx response: {e}")))
    } else {
        Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
    }
}

/// Maps a non-2xx status onto the error taxonomy.
fn classify_status(status: StatusCode, headers: &HashMap<String, String>, body: &[u8]) -> ApiError {
    let code = status.as_u16();
    let body_text = String::from_utf8_lossy(body).into_owned();

    match code {
        401 | 403 => ApiError::auth(code, body_text),
        404 => ApiError::not_found(body_text),
        408 => ApiError::timeout(0),
        429 => ApiError::rate_limited(extract_retry_after_seconds(headers), body_text),
        400..=499 => ApiError::bad_request(code, body_text),
        500..=599 => ApiError::server(code, body_text),
        _ => ApiError::server(code, body_text),
    }
}

/// Extracts a Retry-After delay in seconds from response headers.
///
/// Supports both the delta-seconds and HTTP-date formats. An unparsable
/// header falls back to a conservative 60 seconds.
pub fn extract_retry_after_seconds(headers: &HashMap<String, String>) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let value = headers.get("retry-after")?;

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let now = chrono::Utc::now();
        let retry_at = date.with_timezone(&chrono::Utc);
        if retry_at > now {
            if let Ok(delay) = retry_at.signed_duration_since(now).to_std() {
                return Some(delay.as_secs());
            }
        }
    }

    Some(DEFAULT_RETRY_AFTER)
}
