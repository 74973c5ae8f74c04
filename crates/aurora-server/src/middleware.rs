//! Request filters and middleware: the named custom filter chain, request
//! metrics, and the response header size limit

use crate::types::ErrorResponse;
use aurora_core::config::FILTER_PARAM_PREFIX;
use aurora_core::ConfigError;
use aurora_metrics::{MetricEvent, MetricsSink, ServerMetrics};
use axum::{
    extract::{MatchedPath, Request, State},
    http::{Extensions, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Init parameters of one filter (`filters.<name>.param.<key>`)
pub type FilterParams = BTreeMap<String, String>;

// ============================================================================
// Filter Chain
// ============================================================================

/// One link of the filter chain.
///
/// `on_request` runs in chain order before the handler and may short-circuit
/// by returning a response. `on_response` runs in reverse order. The
/// `scratch` extensions carry per-request state between the two hooks.
pub trait RequestFilter: Send + Sync {
    fn name(&self) -> &str;

    fn on_request(
        &self,
        _request: &mut Request,
        _scratch: &mut Extensions,
    ) -> Result<(), Response> {
        Ok(())
    }

    fn on_response(&self, _response: &mut Response, _scratch: &Extensions) {}
}

/// Ordered list of filters applied as a single middleware
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RequestFilter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn RequestFilter>>) -> Self {
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

/// Runs a [`FilterChain`] around the rest of the stack.
pub async fn filter_chain_middleware(
    State(chain): State<Arc<FilterChain>>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut scratch = Extensions::new();

    for (index, filter) in chain.filters.iter().enumerate() {
        if let Err(mut response) = filter.on_request(&mut request, &mut scratch) {
            debug!(
                filter = filter.name(),
                status = response.status().as_u16(),
                "Filter rejected request"
            );
            for earlier in chain.filters[..index].iter().rev() {
                earlier.on_response(&mut response, &scratch);
            }
            return response;
        }
    }

    let mut response = next.run(request).await;
    for filter in chain.filters.iter().rev() {
        filter.on_response(&mut response, &scratch);
    }
    response
}

// ============================================================================
// Filter Registry
// ============================================================================

/// Constructor of a named filter from its init parameters
pub type FilterFactory =
    Arc<dyn Fn(&FilterParams) -> Result<Arc<dyn RequestFilter>, ConfigError> + Send + Sync>;

/// Named filter constructors, resolved against `custom.filters` at startup.
#[derive(Clone)]
pub struct FilterRegistry {
    factories: BTreeMap<String, FilterFactory>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FilterRegistry {
    /// Registry without any filters.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding `request-id`, `security-headers`, `response-headers`
    /// and `rate-limit`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(RequestIdFilter::NAME, |_| Ok(Arc::new(RequestIdFilter)));
        registry.register(SecurityHeadersFilter::NAME, |_| {
            Ok(Arc::new(SecurityHeadersFilter))
        });
        registry.register(ResponseHeadersFilter::NAME, |params| {
            Ok(Arc::new(ResponseHeadersFilter::from_params(params)?))
        });
        registry.register(RateLimitFilter::NAME, |params| {
            Ok(Arc::new(RateLimitFilter::from_params(params)?))
        });
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&FilterParams) -> Result<Arc<dyn RequestFilter>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds the chain for `names`, in order.
    ///
    /// # Errors
    ///
    /// Fails on a name that was never registered or on invalid parameters.
    pub fn build_chain(
        &self,
        names: &[String],
        params: &BTreeMap<String, FilterParams>,
    ) -> Result<FilterChain, ConfigError> {
        let empty = FilterParams::new();
        let filters = names
            .iter()
            .map(|name| {
                let factory = self
                    .factories
                    .get(name)
                    .ok_or_else(|| ConfigError::unsupported("filter", name.clone()))?;
                factory(params.get(name).unwrap_or(&empty))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterChain::new(filters))
    }
}

fn param_key(filter: &str, key: &str) -> String {
    format!("{FILTER_PARAM_PREFIX}{filter}.param.{key}")
}

// ============================================================================
// Built-in Filters
// ============================================================================

/// Request id, taken from `X-Request-ID` or generated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Tags every request with a [`RequestId`] and echoes it in `X-Request-ID`.
#[derive(Debug)]
pub struct RequestIdFilter;

impl RequestIdFilter {
    pub const NAME: &'static str = "request-id";
    const HEADER: &'static str = "x-request-id";
}

impl RequestFilter for RequestIdFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_request(&self, request: &mut Request, scratch: &mut Extensions) -> Result<(), Response> {
        let id = request
            .headers()
            .get(Self::HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        request.extensions_mut().insert(RequestId(id.clone()));
        scratch.insert(RequestId(id));
        Ok(())
    }

    fn on_response(&self, response: &mut Response, scratch: &Extensions) {
        if let Some(value) = scratch
            .get::<RequestId>()
            .and_then(|id| HeaderValue::from_str(&id.0).ok())
        {
            response.headers_mut().insert(Self::HEADER, value);
        }
    }
}

#[derive(Debug)]
pub struct SecurityHeadersFilter;

impl SecurityHeadersFilter {
    pub const NAME: &'static str = "security-headers";
}

impl RequestFilter for SecurityHeadersFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_response(&self, response: &mut Response, _scratch: &Extensions) {
        let headers = response.headers_mut();
        headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
        headers.insert("cache-control", HeaderValue::from_static("no-store"));
    }
}

/// Adds a fixed set of headers to every response; each parameter is one
/// header name and its value.
#[derive(Debug)]
pub struct ResponseHeadersFilter {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ResponseHeadersFilter {
    pub const NAME: &'static str = "response-headers";

    pub fn from_params(params: &FilterParams) -> Result<Self, ConfigError> {
        let headers = params
            .iter()
            .map(|(name, value)| {
                let invalid = |reason: String| {
                    ConfigError::invalid_value(param_key(Self::NAME, name), reason)
                };
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| invalid(format!("invalid header name: {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| invalid(format!("invalid header value: {e}")))?;
                Ok((header, value))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { headers })
    }
}

impl RequestFilter for ResponseHeadersFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_response(&self, response: &mut Response, _scratch: &Extensions) {
        for (name, value) in &self.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

/// Server-wide request rate limit (`requests.per.second`, `burst`)
pub struct RateLimitFilter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl fmt::Debug for RateLimitFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitFilter").finish_non_exhaustive()
    }
}

impl RateLimitFilter {
    pub const NAME: &'static str = "rate-limit";
    const DEFAULT_RPS: NonZeroU32 = NonZeroU32::MIN.saturating_add(99);

    pub fn new(requests_per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(requests_per_second).allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Burst defaults to the per-second rate.
    pub fn from_params(params: &FilterParams) -> Result<Self, ConfigError> {
        let read = |key: &str| -> Result<Option<NonZeroU32>, ConfigError> {
            params
                .get(key)
                .map(|raw| {
                    raw.trim().parse::<NonZeroU32>().map_err(|_| {
                        ConfigError::invalid_value(
                            param_key(Self::NAME, key),
                            format!("must be a positive integer, got '{raw}'"),
                        )
                    })
                })
                .transpose()
        };
        let rps = read("requests.per.second")?.unwrap_or(Self::DEFAULT_RPS);
        let burst = read("burst")?.unwrap_or(rps);
        Ok(Self::new(rps, burst))
    }
}

impl RequestFilter for RateLimitFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_request(&self, request: &mut Request, _scratch: &mut Extensions) -> Result<(), Response> {
        if self.limiter.check().is_ok() {
            return Ok(());
        }
        warn!(uri = %request.uri(), "Rate limit exceeded");
        let error = ErrorResponse::new(
            "rate_limit_exceeded",
            "Too many requests. Please try again later.",
        );
        Err((StatusCode::TOO_MANY_REQUESTS, Json(error)).into_response())
    }
}

// ============================================================================
// Request Metrics
// ============================================================================

/// Shared state of [`metrics_middleware`]
#[derive(Clone)]
pub struct RequestMetrics {
    pub registry: Arc<ServerMetrics>,
    pub sink: Arc<dyn MetricsSink>,
}

/// Records every request in the registry and offers an `http.request`
/// event to the metrics queue.
pub async fn metrics_middleware(
    State(metrics): State<RequestMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().as_str().to_owned();

    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed();
    let status = response.status().as_u16();

    metrics.registry.record_request(&route, &method, status, elapsed);
    metrics.sink.record(
        MetricEvent::new("http.request")
            .with_duration(elapsed)
            .with_tag("route", route)
            .with_tag("method", method)
            .with_tag("status", status.to_string()),
    );

    response
}

// ============================================================================
// Response Header Limit
// ============================================================================

/// Encoded size of a response head's header block
fn header_block_size(response: &Response) -> usize {
    response
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum()
}

/// Replaces responses whose headers exceed `response.header.size` with a 500.
pub async fn response_header_limit(
    State(limit): State<usize>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    let size = header_block_size(&response);
    if size <= limit {
        return response;
    }

    warn!(size, limit, "Response headers exceed configured limit");
    let error = ErrorResponse::new("response_too_large", "Response headers too large");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
}
