use ethers::providers::{Http, Provider};
use crate::error::{GapFillerError, GapFillerResult};
use crate::client_trait::RpcClient;
use std::sync::Arc;
use serde_json::Value;
use tracing::trace;
use async_trait::async_trait;

#[derive(Clone)]
pub struct EthersRpcClient {
    provider: Arc<Provider<Http>>,
    url: String,
}

impl EthersRpcClient {
    pub fn new(rpc_url: &str) -> GapFillerResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| GapFillerError::Config(format!("Failed to create HTTP provider for {}: {}", rpc_url, e)))?;

        Ok(Self {
            provider: Arc::new(provider),
            url: rpc_url.to_string(),
        })
    }
}

#[async_trait]
impl RpcClient for EthersRpcClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> GapFillerResult<Value> {
        trace!(endpoint = %self.url, method, "ethers request");
        let result: Value = self.provider.request(method, params).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparsable_url() {
        assert!(matches!(
            EthersRpcClient::new("not a url"),
            Err(GapFillerError::Config(_))
        ));
    }

    #[test]
    fn keeps_endpoint_for_logging() {
        let client = EthersRpcClient::new("http://127.0.0.1:8545").unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:8545");
    }
}
