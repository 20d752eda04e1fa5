//! Admission middleware.
//!
//! A tower [`Layer`]/[`Service`] pair that derives a bucket key from the
//! request, asks the active store for a decision, and translates it into
//! response headers and, on denial, a 429. Layered rules de-duplicate
//! through a request-extension marker: once the most specific rule has
//! consumed a token, broader rules pass the request through untouched.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use http::{Request, StatusCode};
use futures::future::BoxFuture;
use serde_json::json;
use tower::{Layer, Service};
use tracing::debug;

use crate::bucket::RateLimitResult;
use crate::config::{RateLimitContext, RateLimitRule};
use crate::store::RateLimitStore;

/// Inserted into request extensions by the caller's authentication layer;
/// when present, the default key generator tracks buckets per user instead
/// of per address.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

/// Marker: a rule already consumed a token for this request.
#[derive(Debug, Clone, Copy)]
struct RateLimitApplied;

/// Layer applying one rate limit rule against a store.
#[derive(Clone)]
pub struct RateLimitLayer {
    store: Arc<dyn RateLimitStore>,
    rule: Arc<RateLimitRule>,
}

impl RateLimitLayer {
    pub fn new(store: Arc<dyn RateLimitStore>, rule: RateLimitRule) -> Self {
        Self {
            store,
            rule: Arc::new(rule),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            store: Arc::clone(&self.store),
            rule: Arc::clone(&self.rule),
        }
    }
}

/// The per-request admission service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    store: Arc<dyn RateLimitStore>,
    rule: Arc<RateLimitRule>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let store = Arc::clone(&self.store);
        let rule = Arc::clone(&self.rule);
        // Take the service that was polled ready, leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if req.extensions().get::<RateLimitApplied>().is_some() {
                return inner.call(req).await;
            }

            let ctx = context_from(&req);
            if rule.should_skip(&ctx) {
                return inner.call(req).await;
            }

            req.extensions_mut().insert(RateLimitApplied);

            let key = rule.key_for(&ctx);
            let result = store.check(&key, &rule).await;

            if !result.allowed {
                debug!(key = %key, path = %ctx.path, "Rate limit exceeded");
                let body = Json(json!({
                    "error": rule.message,
                    "retryAfter": result.reset_in_seconds,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                apply_headers(response.headers_mut(), &result);
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(result.reset_in_seconds));
                return Ok(response);
            }

            let mut response = inner.call(req).await?;
            apply_headers(response.headers_mut(), &result);
            Ok(response)
        })
    }
}

fn apply_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(result.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(result.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(result.reset_in_seconds),
    );
}

fn context_from(req: &Request<Body>) -> RateLimitContext {
    RateLimitContext {
        ip: client_ip(req),
        path: req.uri().path().to_string(),
        method: req.method().to_string(),
        user_id: req
            .extensions()
            .get::<AuthenticatedUser>()
            .map(|user| user.0.clone()),
    }
}

/// Resolve the client address: trusted proxy header first, then alternates,
/// finally a loopback default. Trusting these headers is the deployment's
/// concern; behind no proxy they should be stripped at the edge.
fn client_ip(req: &Request<Body>) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return addr.ip().to_string();
    }

    "127.0.0.1".to_string()
}
