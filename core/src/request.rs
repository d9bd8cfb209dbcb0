//! Request descriptors and the encoders that turn them into `HttpRequest`s.
//!
//! # Design
//! `RequestDescriptor` is immutable once built: the consuming builder methods
//! return a new value, and fields are only readable through getters. All
//! validation happens in `build`, before any network activity, so a malformed
//! URL surfaces as a synchronous `InternalError::InvalidUrl`.

use std::time::Duration;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use url::Url;

use crate::config::SessionConfiguration;
use crate::error::{InternalError, Result};
use crate::http::{CachePolicy, HttpMethod, HttpRequest};

/// Everything except RFC 3986 unreserved characters is escaped in query components.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "ws", "wss"];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    method: HttpMethod,
    base_url: String,
    parameters: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    timeout: Duration,
    cache_policy: CachePolicy,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, base_url: impl Into<String>) -> Self {
        Self {
            method,
            base_url: base_url.into(),
            parameters: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_TIMEOUT,
            cache_policy: CachePolicy::default(),
        }
    }

    pub fn get(base_url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, base_url)
    }

    pub fn post(base_url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, base_url)
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body, adding `Content-Type` unless one is set.
    pub fn json_body<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| InternalError::CouldNotParse(format!("request body: {e}")))?;
        if !self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
            self.headers
                .push(("Content-Type".to_string(), "application/json".to_string()));
        }
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn timeout_interval(&self) -> Duration {
        self.timeout
    }

    pub fn cache_policy_value(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Produce the transport-native request.
    ///
    /// Session defaults are applied first so descriptor headers override them.
    pub fn build(&self, config: &SessionConfiguration) -> Result<HttpRequest> {
        validate_url(&self.base_url)?;

        let mut request = HttpRequest {
            method: self.method,
            url: self.base_url.clone(),
            headers: Vec::new(),
            body: self.body.clone(),
            timeout: self.timeout,
            cache_policy: self.cache_policy,
        };

        encode_headers(&mut request, &config.default_headers);
        if let Some(agent) = &config.user_agent {
            if request.header("user-agent").is_none() {
                request.headers.push(("User-Agent".to_string(), agent.clone()));
            }
        }
        encode_headers(&mut request, &self.headers);
        encode_parameters(&mut request, &self.parameters)?;
        Ok(request)
    }
}

/// Check that `url` parses, has a supported scheme and names a host.
///
/// The WHATWG parser tolerates a missing `//` and extra slashes on special
/// schemes, so an explicit non-empty authority is required before parsing.
pub fn validate_url(url: &str) -> Result<()> {
    let invalid = |reason: String| InternalError::InvalidUrl {
        url: url.to_string(),
        reason,
    };

    if url.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace".to_string()).into());
    }
    match url.split_once("://") {
        Some((_, rest)) if !rest.is_empty() && !rest.starts_with(['/', '\\']) => {}
        Some(_) => return Err(invalid("missing host".to_string()).into()),
        None => return Err(invalid("missing scheme".to_string()).into()),
    }

    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(invalid(format!("unsupported scheme {}", parsed.scheme())).into());
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()).into());
    }
    Ok(())
}

/// Append `parameters` to the request URL's query, preserving input order.
pub fn encode_parameters(request: &mut HttpRequest, parameters: &[(String, String)]) -> Result<()> {
    if parameters.is_empty() {
        return Ok(());
    }
    validate_url(&request.url)?;
    request.url = append_query(&request.url, parameters);
    Ok(())
}

/// Set `headers` on the request in order. A header whose name matches an
/// existing one (ignoring case) replaces it in place.
pub fn encode_headers(request: &mut HttpRequest, headers: &[(String, String)]) {
    for (name, value) in headers {
        match request
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value.clone(),
            None => request.headers.push((name.clone(), value.clone())),
        }
    }
}

fn append_query(url: &str, parameters: &[(String, String)]) -> String {
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };

    let query = parameters
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, QUERY_COMPONENT),
                utf8_percent_encode(v, QUERY_COMPONENT)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    let separator = match base.find('?') {
        None => "?",
        Some(_) if base.ends_with('?') || base.ends_with('&') => "",
        Some(_) => "&",
    };

    let mut out = format!("{base}{separator}{query}");
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
