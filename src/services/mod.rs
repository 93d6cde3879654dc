use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GapFillerError, GapFillerResult};
use crate::models::{Argument, BackendTarget};

mod eth_header_cid;
mod graph_transaction;

pub use eth_header_cid::{EthHeaderCidByBlockNumberService, StateDiffParams};
pub use graph_transaction::GraphTransactionByTxHashService;

#[async_trait]
pub trait BackfillService: Send + Sync {
    /// GraphQL field name, also the registry key.
    fn name(&self) -> &'static str;

    /// GraphQL upstream that serves this field.
    fn target(&self) -> BackendTarget;

    fn validate(&self, args: &[Argument]) -> GapFillerResult<()>;

    /// Whether `response` (a full GraphQL response envelope) has no data for
    /// the field stored under `response_key`.
    fn is_empty(&self, response: &Value, response_key: &str) -> GapFillerResult<bool>;

    /// Asks a source node to produce the data behind this field. One RPC per call.
    async fn backfill(&self, args: &[Argument]) -> GapFillerResult<()>;
}

/// How the indexer's schema shapes a field that has no data yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptinessRule {
    /// A connection object with either a `nodes` or an `edges` list.
    Connection,
    Edges,
    Nodes,
    /// A single nullable object.
    Nullable,
}

impl EmptinessRule {
    pub fn is_empty(self, response: &Value, response_key: &str) -> GapFillerResult<bool> {
        let field = response.get("data").and_then(|data| data.get(response_key));
        let Some(field) = field else {
            return Ok(true);
        };

        let list = match self {
            EmptinessRule::Nullable => return Ok(field.is_null()),
            EmptinessRule::Connection => field.get("nodes").or_else(|| field.get("edges")),
            EmptinessRule::Edges => field.get("edges"),
            EmptinessRule::Nodes => field.get("nodes"),
        };

        match list {
            None => Ok(true),
            Some(Value::Array(items)) => Ok(items.is_empty()),
            Some(other) => Err(GapFillerError::Transport(format!(
                "{}: expected a list, got {}",
                response_key, other
            ))),
        }
    }
}

/// Immutable name → service map, built once at startup.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<&'static str, Arc<dyn BackfillService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, service: Arc<dyn BackfillService>) -> GapFillerResult<Self> {
        let name = service.name();
        if self.services.contains_key(name) {
            return Err(GapFillerError::DuplicateService(name.to_string()));
        }
        self.services.insert(name, service);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BackfillService>> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.services.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
