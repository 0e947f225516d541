//! HTTP dispatcher trait.
//!
//! The engine hands a fully-resolved request descriptor to the dispatcher
//! and consumes only the JSON payload of whatever comes back. Non-2xx
//! handling, retries, and TLS are the dispatcher's concern; the reqwest
//! implementation lives in `stepwise-infra`.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

/// Errors from dispatching an HTTP request.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// A resolved outbound request: interpolation and the plugin pipeline have
/// already been applied by the time this is built.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// JSON body; `Null` means "send no body".
    pub body: Value,
}

/// Dispatches a request and returns the response JSON payload.
pub trait HttpDispatcher: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        request: &'a HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HttpError>> + Send + 'a>>;
}
