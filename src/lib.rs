//! Turnstile - fixed-window request rate limiting
//!
//! This crate decides, per caller and per protected operation, whether a
//! request may proceed. Counters live in a pluggable store: in process memory
//! for a single instance, or Redis when several instances share one budget.
//! A tower layer puts the limiter in front of any HTTP service.
//!
//! When the counter store is unreachable the limiter fails open by default:
//! requests are admitted and the failure is logged. Set
//! [`FailurePolicy::Closed`](ratelimit::FailurePolicy::Closed) where abuse
//! prevention matters more than availability.

pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
