//! Anthropic Messages API client (C4's production adapter).
//!
//! - [`client::AnthropicInvoker`]: HTTP + SSE, rate-limited and retried.
//! - [`mock::MockInvoker`]: scripted substrate for tests and `--substrate mock`.
//! - [`streaming`], [`types`]: wire format and SSE framing shared by both.

pub mod client;
pub mod mock;
pub mod rate_limiter;
pub mod retry;
pub mod streaming;
pub mod types;

pub use client::{AnthropicInvoker, AnthropicInvokerConfig};
pub use mock::{MockInvoker, MockOutcome};
