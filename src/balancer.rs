use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::alloy_client::AlloyRpcClient;
use crate::client_trait::{RpcClient, RpcClientKind};
use crate::ethers_client::EthersRpcClient;
use crate::error::{GapFillerError, GapFillerResult};

/// Round-robin JSON-RPC clients for one logical upstream.
pub struct EndpointPool {
    clients: Vec<Arc<dyn RpcClient>>,
    cursor: Mutex<usize>,
}

impl EndpointPool {
    pub fn new(clients: Vec<Arc<dyn RpcClient>>) -> GapFillerResult<Self> {
        if clients.is_empty() {
            return Err(GapFillerError::NoAvailableEndpoint);
        }
        Ok(Self {
            clients,
            cursor: Mutex::new(0),
        })
    }

    /// Builds one client per address, skipping the ones that cannot be set up.
    pub fn connect(addresses: &[String], kind: RpcClientKind) -> GapFillerResult<Self> {
        let mut clients: Vec<Arc<dyn RpcClient>> = Vec::with_capacity(addresses.len());
        for address in addresses {
            let client: GapFillerResult<Arc<dyn RpcClient>> = match kind {
                RpcClientKind::Ethers => EthersRpcClient::new(address).map(|c| Arc::new(c) as Arc<dyn RpcClient>),
                RpcClientKind::Alloy => AlloyRpcClient::new(address).map(|c| Arc::new(c) as Arc<dyn RpcClient>),
            };
            match client {
                Ok(client) => clients.push(client),
                Err(e) => error!(endpoint = %address, "couldn't connect to {}: {}", address, e),
            }
        }
        info!(endpoints = clients.len(), ?kind, "RPC pool ready");
        Self::new(clients)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.endpoint().to_string()).collect()
    }

    /// Next client in round-robin order.
    pub fn next(&self) -> Arc<dyn RpcClient> {
        let index = self.advance();
        self.clients[index].clone()
    }

    fn advance(&self) -> usize {
        // The critical section never panics, but a poisoned lock still holds a valid cursor.
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let index = *cursor;
        *cursor = (index + 1) % self.clients.len();
        index
    }

    /// Calls `method` on each client in turn, starting at the round-robin
    /// cursor, until one succeeds. Gives up with `DeadlineReached` once
    /// `budget` has elapsed; otherwise returns the last error seen.
    pub async fn call_with_failover(
        &self,
        method: &str,
        params: Vec<Value>,
        budget: Duration,
    ) -> GapFillerResult<Value> {
        let deadline = Instant::now() + budget;
        let start = self.advance();
        let mut last_error = GapFillerError::NoAvailableEndpoint;

        for offset in 0..self.clients.len() {
            if Instant::now() >= deadline {
                warn!(method, "deadline reached before trying all endpoints");
                return Err(GapFillerError::DeadlineReached);
            }

            let client = &self.clients[(start + offset) % self.clients.len()];
            debug!(method, endpoint = client.endpoint(), "proxy call");

            match timeout_at(deadline, client.call(method, params.clone())).await {
                Ok(Ok(result)) => {
                    debug!(method, endpoint = client.endpoint(), resp = %result, "{} result", method);
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    warn!(method, endpoint = client.endpoint(), error = %e, "bad {} request", method);
                    last_error = e;
                }
                Err(_) => {
                    warn!(method, endpoint = client.endpoint(), "deadline reached while waiting for endpoint");
                    return Err(GapFillerError::DeadlineReached);
                }
            }
        }

        Err(last_error)
    }
}
