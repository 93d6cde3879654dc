use crate::error::GapFillerResult;
use async_trait::async_trait;
use serde_json::Value;


/// One JSON-RPC connection to a source node.
#[async_trait]
pub trait RpcClient: Send + Sync {

    /// Address this client talks to, for logging.
    fn endpoint(&self) -> &str;

    /// Invokes `method` with positional `params` and returns the raw result.
    async fn call(&self, method: &str, params: Vec<Value>) -> GapFillerResult<Value>;
}


/// Which library backs the RPC connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcClientKind {
    #[default]
    Ethers,
    Alloy,
}
