//! Reqwest-backed implementation of the engine's `HttpDispatcher` trait.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::Value;
use stepwise_core::http::{HttpDispatcher, HttpError, HttpRequest};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("stepwise/", env!("CARGO_PKG_VERSION"));

/// Dispatches engine requests through a shared reqwest [`Client`].
///
/// The response body is parsed as JSON when possible; a non-JSON or empty
/// body becomes `Null` rather than an error, since many webhook endpoints
/// reply with plain text acknowledgements.
#[derive(Clone)]
pub struct ReqwestDispatcher {
    client: Client,
}

impl ReqwestDispatcher {
    pub fn new() -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| HttpError::InvalidRequest(err.to_string()))?;
        Ok(Self { client })
    }

    async fn send(&self, request: &HttpRequest) -> Result<Value, HttpError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| HttpError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| HttpError::Transport(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| HttpError::Transport(err.to_string()))?;

        debug!(url = %request.url, status = status.as_u16(), bytes = bytes.len(), "http response");

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(_) => {
                if !bytes.is_empty() {
                    warn!(url = %request.url, "response body is not JSON, treating as null");
                }
                Ok(Value::Null)
            }
        }
    }
}

impl HttpDispatcher for ReqwestDispatcher {
    fn dispatch<'a>(
        &'a self,
        request: &'a HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, HttpError>> + Send + 'a>> {
        Box::pin(self.send(request))
    }
}
