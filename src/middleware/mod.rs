//! HTTP boundary: maps requests to rules and turns decisions into responses.

mod classifier;
mod layer;

pub use classifier::{default_patterns, RouteClassifier, RoutePattern, DEFAULT_RULE};
pub use layer::{
    apply_headers, rejection, request_context, AuthenticatedUser, RateLimitLayer,
    RateLimitService, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
