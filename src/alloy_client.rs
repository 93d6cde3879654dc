use crate::client_trait::RpcClient;
use crate::error::{GapFillerError, GapFillerResult};
use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;


use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::Http;


pub struct AlloyRpcClient {
    provider: RootProvider<Http<reqwest::Client>>,
    rpc_url: String,
}

impl AlloyRpcClient {
    pub fn new(rpc_url: &str) -> GapFillerResult<Self> {
        let url = reqwest::Url::parse(rpc_url)
            .map_err(|e| GapFillerError::Config(format!("Invalid URL {}: {}", rpc_url, e)))?;

        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            provider,
            rpc_url: rpc_url.to_string(),
        })
    }

    fn convert_transport_error(&self, error: impl std::fmt::Display) -> GapFillerError {
        GapFillerError::Rpc {
            endpoint: self.rpc_url.clone(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl RpcClient for AlloyRpcClient {
    fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> GapFillerResult<Value> {
        trace!(endpoint = %self.rpc_url, method, "alloy request");
        self.provider
            .raw_request::<Vec<Value>, Value>(method.to_string().into(), params)
            .await
            .map_err(|e| self.convert_transport_error(e))
    }
}
