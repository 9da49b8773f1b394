//! Request dispatch: authentication, delivery-mode selection, credential
//! failover, and upstream access.
//!
//! The HTTP layer hands a parsed chat-completion request to [`Dispatcher`],
//! which tries shuffled credentials sequentially until one succeeds or the
//! pool is exhausted. Upstream failures are classified in [`classify`] and
//! decide whether to advance, invalidate the key, or stop.

pub mod attempt;
pub mod auth;
pub mod classify;
pub mod dispatch;
pub mod error;
pub mod strategy;
pub mod upstream;

pub use attempt::{AttemptRecord, AttemptSink, TracingAttemptSink};
pub use auth::{ACCESS_KEY_PREFIX, authenticate};
pub use classify::{ErrorCategory, UpstreamError, classify};
pub use dispatch::{
    APOLOGY_TEXT, Delivery, DispatchOptions, Dispatcher, RequestContext, SSE_CONTENT_TYPE,
    StreamBody,
};
pub use error::ProxyError;
pub use strategy::{DeliveryMode, select_mode};
pub use upstream::{DEFAULT_BASE_URL, GeminiClient, GeminiClientConfig, Upstream};
