use std::time::Duration;

use async_trait::async_trait;
use axum::http::{Method, StatusCode, method::InvalidMethod};
use reqwest::Client;
use thiserror::Error;

use super::BanRequest;

/// Invalidation verb understood by the caching proxy.
const BAN_METHOD: &str = "BAN";

const USER_AGENT: &str = concat!("spurgo/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build the proxy HTTP client: {0}")]
    Build(#[from] reqwest::Error),
    #[error("invalid proxy invalidation verb: {0}")]
    Verb(#[from] InvalidMethod),
}

/// Result of delivering one ban request to one endpoint.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The proxy answered; the status may still be an error.
    Delivered { status: StatusCode },
    /// Connect or timeout failure before any response arrived.
    Unreachable { detail: String },
    /// Anything else that prevented a response.
    Failed { detail: String },
}

/// Delivery seam for ban requests, one call per endpoint.
///
/// Kept behind a trait so dispatch logic can be exercised without a
/// reachable proxy.
#[async_trait]
pub trait ProxySender: Send + Sync {
    async fn send(&self, endpoint: &str, request: &BanRequest) -> SendOutcome;
}

/// Reqwest-backed sender issuing `BAN` requests.
pub struct HttpProxyClient {
    client: Client,
    method: Method,
}

impl HttpProxyClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        let method = Method::from_bytes(BAN_METHOD.as_bytes())?;

        Ok(Self { client, method })
    }
}

#[async_trait]
impl ProxySender for HttpProxyClient {
    async fn send(&self, endpoint: &str, request: &BanRequest) -> SendOutcome {
        let mut call = self.client.request(self.method.clone(), endpoint);
        for (name, value) in request.headers() {
            call = call.header(name, value);
        }

        match call.send().await {
            Ok(response) => SendOutcome::Delivered {
                status: response.status(),
            },
            Err(error) if error.is_connect() || error.is_timeout() => SendOutcome::Unreachable {
                detail: error.to_string(),
            },
            Err(error) => SendOutcome::Failed {
                detail: error.to_string(),
            },
        }
    }
}
