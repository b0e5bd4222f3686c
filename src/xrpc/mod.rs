//! Minimal XRPC plumbing shared by the AppView, Ozone and PDS clients.
//!
//! Every call runs under a bounded timeout; a timeout surfaces as
//! [`XrpcError::Timeout`] and callers map it onto their component's
//! "unavailable" path.

use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::XrpcError;

pub mod appview;
pub mod ozone;
pub mod pds;

pub use appview::AppviewClient;
pub use ozone::OzoneClient;
pub use pds::PdsRepoClient;

#[derive(Clone, Debug)]
struct BasicAuth {
    username: String,
    password: String,
}

/// One XRPC service endpoint.
#[derive(Clone, Debug)]
pub struct XrpcClient {
    http_client: reqwest::Client,
    base_url: String,
    call_timeout: Duration,
    basic_auth: Option<BasicAuth>,
}

impl XrpcClient {
    pub fn new(http_client: reqwest::Client, base_url: &str, call_timeout: Duration) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            call_timeout,
            basic_auth: None,
        }
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.base_url, method)
    }

    /// GET an XRPC query.
    pub async fn query<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, XrpcError> {
        let request = self.http_client.get(self.url(method)).query(params);
        self.send(method, request).await
    }

    /// POST an XRPC procedure with a JSON body.
    pub async fn procedure<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T, XrpcError> {
        let request = self.http_client.post(self.url(method)).json(body);
        self.send(method, request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        mut request: reqwest::RequestBuilder,
    ) -> Result<T, XrpcError> {
        if let Some(auth) = &self.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = match timeout(self.call_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                return Err(XrpcError::RequestFailed {
                    method: method.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(XrpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                });
            }
        };

        let status = response.status().as_u16();
        let body = match timeout(self.call_timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(source)) => {
                return Err(XrpcError::RequestFailed {
                    method: method.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(XrpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                });
            }
        };

        if !(200..300).contains(&status) {
            debug!(method = %method, status, body = %body, "XRPC call failed");
            if is_not_found(status, &body) {
                return Err(XrpcError::NotFound {
                    method: method.to_string(),
                });
            }
            return Err(XrpcError::Status {
                method: method.to_string(),
                status,
                body,
            });
        }

        // Procedures such as emitEvent may answer with an empty body.
        let body = if body.trim().is_empty() { "null" } else { &body };
        serde_json::from_str(body).map_err(|err| XrpcError::InvalidResponse {
            method: method.to_string(),
            details: err.to_string(),
        })
    }
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// XRPC services report missing subjects as 404 or as a 400 with a
/// `*NotFound` error name or a "not found" message.
fn is_not_found(status: u16, body: &str) -> bool {
    if status == 404 {
        return true;
    }
    if status != 400 {
        return false;
    }
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => {
            err.error.ends_with("NotFound") || err.message.to_lowercase().contains("not found")
        }
        Err(_) => false,
    }
}
