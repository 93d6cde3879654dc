use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{BackfillService, EmptinessRule};
use crate::balancer::EndpointPool;
use crate::error::{GapFillerError, GapFillerResult};
use crate::models::{ArgValue, Argument, BackendTarget};

const FIELD: &str = "ethHeaderCidByBlockNumber";
const ARGUMENT: &str = "n";
const METHOD: &str = "statediff_writeStateDiffAt";

/// Options for a statediff write, as the node expects them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateDiffParams {
    pub intermediate_state_nodes: bool,
    pub intermediate_storage_nodes: bool,
    pub include_block: bool,
    pub include_receipts: bool,
    #[serde(rename = "IncludeTD")]
    pub include_td: bool,
    pub include_code: bool,
}

impl Default for StateDiffParams {
    fn default() -> Self {
        Self {
            intermediate_state_nodes: true,
            intermediate_storage_nodes: true,
            include_block: true,
            include_receipts: true,
            include_td: true,
            include_code: true,
        }
    }
}

/// Backfills block headers (and the rest of the block's state diff) by number.
pub struct EthHeaderCidByBlockNumberService {
    pool: Arc<EndpointPool>,
    rule: EmptinessRule,
    timeout: Duration,
    params: StateDiffParams,
}

impl EthHeaderCidByBlockNumberService {
    pub fn new(pool: Arc<EndpointPool>, timeout: Duration) -> Self {
        Self {
            pool,
            rule: EmptinessRule::Connection,
            timeout,
            params: StateDiffParams::default(),
        }
    }

    pub fn with_rule(mut self, rule: EmptinessRule) -> Self {
        self.rule = rule;
        self
    }

    fn block_number(&self, args: &[Argument]) -> GapFillerResult<u64> {
        let arg = Argument::lookup(args, ARGUMENT).ok_or(GapFillerError::NoArguments)?;
        match &arg.value {
            ArgValue::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| GapFillerError::BadArgumentType(format!("{}: {:?} is not a decimal block number", arg.name, s))),
            ArgValue::Int(n) => u64::try_from(*n)
                .map_err(|_| GapFillerError::BadArgumentType(format!("{}: negative block number {}", arg.name, n))),
            other => Err(GapFillerError::BadArgumentType(format!(
                "{}: expected string or int, got {}",
                arg.name,
                other.type_name()
            ))),
        }
    }
}

#[async_trait]
impl BackfillService for EthHeaderCidByBlockNumberService {
    fn name(&self) -> &'static str {
        FIELD
    }

    fn target(&self) -> BackendTarget {
        BackendTarget::Default
    }

    fn validate(&self, args: &[Argument]) -> GapFillerResult<()> {
        self.block_number(args).map(|_| ())
    }

    fn is_empty(&self, response: &Value, response_key: &str) -> GapFillerResult<bool> {
        self.rule.is_empty(response, response_key)
    }

    async fn backfill(&self, args: &[Argument]) -> GapFillerResult<()> {
        let n = self.block_number(args)?;
        info!(block_number = n, method = METHOD, "requesting state diff from node");

        let params = vec![json!(n), serde_json::to_value(&self.params)?];
        let resp = self.pool.call_with_failover(METHOD, params, self.timeout).await?;
        debug!(block_number = n, resp = %resp, "statediff write accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_trait::RpcClient;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl RpcClient for Recorder {
        fn endpoint(&self) -> &str {
            "http://recorder"
        }

        async fn call(&self, method: &str, params: Vec<Value>) -> GapFillerResult<Value> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            Ok(Value::Null)
        }
    }

    fn service() -> (EthHeaderCidByBlockNumberService, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let pool = EndpointPool::new(vec![recorder.clone() as Arc<dyn RpcClient>]).unwrap();
        (
            EthHeaderCidByBlockNumberService::new(Arc::new(pool), Duration::from_secs(15)),
            recorder,
        )
    }

    #[test]
    fn validates_decimal_block_numbers() {
        let (srv, _) = service();
        assert!(srv.validate(&[Argument::new("n", ArgValue::String("100000".into()))]).is_ok());
        assert!(srv.validate(&[Argument::new("n", ArgValue::Int(7))]).is_ok());
        assert!(matches!(srv.validate(&[]), Err(GapFillerError::NoArguments)));
        assert!(matches!(
            srv.validate(&[Argument::new("n", ArgValue::String("0x10".into()))]),
            Err(GapFillerError::BadArgumentType(_))
        ));
        assert!(matches!(
            srv.validate(&[Argument::new("n", ArgValue::Int(-1))]),
            Err(GapFillerError::BadArgumentType(_))
        ));
        assert!(matches!(
            srv.validate(&[Argument::new("n", ArgValue::Boolean(true))]),
            Err(GapFillerError::BadArgumentType(_))
        ));
    }

    #[test]
    fn falls_back_to_first_argument() {
        let (srv, _) = service();
        assert_eq!(
            srv.block_number(&[Argument::new("blockNumber", ArgValue::String("9".into()))]).unwrap(),
            9
        );
    }

    #[tokio::test]
    async fn backfill_calls_statediff_once() {
        let (srv, recorder) = service();
        srv.backfill(&[Argument::new("n", ArgValue::String("123".into()))])
            .await
            .unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "statediff_writeStateDiffAt");
        assert_eq!(calls[0].1[0], json!(123));
        assert_eq!(calls[0].1[1]["IncludeTD"], json!(true));
        assert_eq!(calls[0].1[1]["IntermediateStateNodes"], json!(true));
    }

    #[test]
    fn emptiness_rule_is_configurable() {
        let (srv, _) = service();
        let srv = srv.with_rule(EmptinessRule::Edges);
        let response = json!({"data": {FIELD: {"nodes": [{"blockHash": "0x1"}]}}});
        assert!(srv.is_empty(&response, FIELD).unwrap());
    }
}
