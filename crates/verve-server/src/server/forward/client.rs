use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use reqwest::{Client, Method};
use verve_core::{
    Error, Result,
    types::{COUNT_PARAM, ForwardJob},
};

/// Performs one outbound call for a [`ForwardJob`].
#[async_trait]
pub trait Forward: Send + Sync + 'static {
    /// Calls `job.endpoint` with `job.count` attached and returns the response
    /// body.
    async fn forward(&self, job: &ForwardJob) -> Result<Bytes>;
}

/// [`Forward`] over HTTP with a fixed method and per-call timeout.
///
/// The count is appended as the `count` query parameter; the request body is
/// empty. A non-success status is reported as an error.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    method: Method,
}

impl HttpForwarder {
    /// # Errors
    ///
    /// Returns [`Error::Forward`] if the HTTP client cannot be built.
    pub fn new(method: Method, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Forward {
                context: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, method })
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    async fn forward(&self, job: &ForwardJob) -> Result<Bytes> {
        let response = self
            .client
            .request(self.method.clone(), &job.endpoint)
            .query(&[(COUNT_PARAM, job.count)])
            .send()
            .await
            .map_err(|e| Error::Forward {
                context: format!("calling {}: {e}", job.endpoint),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| Error::Forward {
            context: format!("reading response from {}: {e}", job.endpoint),
        })?;
        tracing::debug!(
            "API response status: {status}, body: {}",
            String::from_utf8_lossy(&body)
        );

        if !status.is_success() {
            return Err(Error::Forward {
                context: format!("{} responded {status}", job.endpoint),
            });
        }
        Ok(body)
    }
}
