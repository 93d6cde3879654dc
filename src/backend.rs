use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use tracing::{debug, trace};

use crate::error::{GapFillerError, GapFillerResult};
use crate::models::BackendTarget;

/// The GraphQL façade over the indexing database.
#[async_trait]
pub trait GraphqlBackend: Send + Sync {
    /// POSTs a GraphQL request body to `target` and returns the raw response body.
    async fn forward(&self, target: BackendTarget, body: &[u8]) -> GapFillerResult<Vec<u8>>;
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    default: Url,
    tracing: Url,
}

impl HttpBackend {
    pub fn new(default: Url, tracing: Url, timeout: Duration) -> GapFillerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GapFillerError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            default,
            tracing,
        })
    }

    pub fn url(&self, target: BackendTarget) -> &Url {
        match target {
            BackendTarget::Default => &self.default,
            BackendTarget::Tracing => &self.tracing,
        }
    }
}

#[async_trait]
impl GraphqlBackend for HttpBackend {
    async fn forward(&self, target: BackendTarget, body: &[u8]) -> GapFillerResult<Vec<u8>> {
        let url = self.url(target);
        trace!(%target, %url, body = %String::from_utf8_lossy(body), "forwarding GraphQL request");

        let res = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| GapFillerError::Transport(format!("{} backend unreachable: {}", target, e)))?;

        let status = res.status();
        let data = res
            .bytes()
            .await
            .map_err(|e| GapFillerError::Transport(format!("{} backend body: {}", target, e)))?;

        if !status.is_success() {
            debug!(%target, %status, body = %String::from_utf8_lossy(&data), "backend rejected request");
            return Err(GapFillerError::Transport(format!(
                "{} backend returned {}",
                target, status
            )));
        }
        Ok(data.to_vec())
    }
}
