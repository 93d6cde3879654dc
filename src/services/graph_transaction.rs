use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::H256;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{BackfillService, EmptinessRule};
use crate::balancer::EndpointPool;
use crate::error::{GapFillerError, GapFillerResult};
use crate::models::{Argument, BackendTarget};

const FIELD: &str = "graphTransactionByTxHash";
const ARGUMENT: &str = "txHash";
const METHOD: &str = "debug_writeTxTraceGraph";

/// Backfills a transaction's call trace graph on the tracing nodes.
pub struct GraphTransactionByTxHashService {
    pool: Arc<EndpointPool>,
    rule: EmptinessRule,
    timeout: Duration,
}

impl GraphTransactionByTxHashService {
    pub fn new(pool: Arc<EndpointPool>, timeout: Duration) -> Self {
        Self {
            pool,
            rule: EmptinessRule::Nullable,
            timeout,
        }
    }

    pub fn with_rule(mut self, rule: EmptinessRule) -> Self {
        self.rule = rule;
        self
    }

    fn tx_hash(&self, args: &[Argument]) -> GapFillerResult<H256> {
        let arg = Argument::lookup(args, ARGUMENT).ok_or(GapFillerError::NoArguments)?;
        let value = arg.value.as_str().ok_or_else(|| {
            GapFillerError::BadArgumentType(format!("{}: expected string, got {}", arg.name, arg.value.type_name()))
        })?;
        parse_hash(value)
            .ok_or_else(|| GapFillerError::BadArgumentType(format!("{}: {:?} is not a 32-byte hex hash", arg.name, value)))
    }
}

fn parse_hash(value: &str) -> Option<H256> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    let bytes = hex::decode(digits).ok()?;
    (bytes.len() == 32).then(|| H256::from_slice(&bytes))
}

#[async_trait]
impl BackfillService for GraphTransactionByTxHashService {
    fn name(&self) -> &'static str {
        FIELD
    }

    fn target(&self) -> BackendTarget {
        BackendTarget::Tracing
    }

    fn validate(&self, args: &[Argument]) -> GapFillerResult<()> {
        self.tx_hash(args).map(|_| ())
    }

    fn is_empty(&self, response: &Value, response_key: &str) -> GapFillerResult<bool> {
        self.rule.is_empty(response, response_key)
    }

    async fn backfill(&self, args: &[Argument]) -> GapFillerResult<()> {
        let hash = self.tx_hash(args)?;
        let hash = format!("0x{:x}", hash);
        info!(hash = %hash, method = METHOD, "requesting trace graph from node");

        let resp = self
            .pool
            .call_with_failover(METHOD, vec![json!(hash)], self.timeout)
            .await?;
        debug!(hash = %hash, resp = %resp, "trace graph write accepted");
        Ok(())
    }
}
