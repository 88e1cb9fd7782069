//! Tower middleware that puts the rate limiter in front of an HTTP service.

use futures::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, info_span, Instrument};

use super::classifier::RouteClassifier;
use crate::ratelimit::{AdmissionResult, Outcome, RateLimiter, RequestContext};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Request extension carrying the caller identity resolved by the
/// authentication layer. Requests without it are keyed by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Applies rate limiting to every request of the wrapped service.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    classifier: Arc<RouteClassifier>,
    trust_forwarded_for: bool,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, classifier: RouteClassifier) -> Self {
        Self {
            limiter,
            classifier: Arc::new(classifier),
            trust_forwarded_for: false,
        }
    }

    /// Take the caller address from the first `X-Forwarded-For` entry. Only
    /// enable behind a proxy that overwrites the header.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            classifier: self.classifier.clone(),
            trust_forwarded_for: self.trust_forwarded_for,
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    classifier: Arc<RouteClassifier>,
    trust_forwarded_for: bool,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let context = request_context(&request, self.trust_forwarded_for);
        let rule = self.classifier.classify(&context.path).to_string();
        let span = info_span!("rate_limit", rule = %rule, path = %context.path);

        Box::pin(
            async move {
                let decision = limiter.check_request_limit(&context, &rule).await;

                if !decision.allowed {
                    debug!(retry_after = ?decision.retry_after, "Rejecting request");
                    return Ok(rejection(&decision));
                }

                let mut response = inner.call(request).await?;

                let status = response.status();
                let outcome = if status.is_client_error() || status.is_server_error() {
                    Outcome::Failure
                } else {
                    Outcome::Success
                };
                limiter
                    .release_request(&context, &rule, &decision, outcome)
                    .await;

                apply_headers(response.headers_mut(), &decision);
                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Build the limiter's view of an HTTP request.
pub fn request_context<B>(request: &Request<B>, trust_forwarded_for: bool) -> RequestContext {
    let mut context = RequestContext::new(request.uri().path());

    if let Some(AuthenticatedUser(id)) = request.extensions().get::<AuthenticatedUser>() {
        context.user_id = Some(id.clone());
    }

    let forwarded = if trust_forwarded_for {
        forwarded_for(request.headers())
    } else {
        None
    };
    context.remote_addr = forwarded.or_else(|| {
        request
            .extensions()
            .get::<SocketAddr>()
            .map(|addr| addr.ip())
    });

    context
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Attach the informational rate limit headers for `decision`.
///
/// Requests no rule applies to get no headers. When quota was not consumed
/// (the store was down) the full limit is reported as remaining.
pub fn apply_headers(headers: &mut HeaderMap, decision: &AdmissionResult) {
    let Some(limit) = decision.limit else {
        return;
    };

    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(decision.remaining.unwrap_or(limit)),
    );
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_time_secs()));
}

/// The 429 response for a rejected request. The body is left empty.
pub fn rejection<B: Default>(decision: &AdmissionResult) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    apply_headers(headers, decision);
    if let Some(retry_after) = decision.retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
    response
}
