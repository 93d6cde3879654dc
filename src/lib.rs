pub mod alloy_client;
pub mod backend;
pub mod balancer;
pub mod client_trait;
pub mod config;
pub mod error;
pub mod ethers_client;
pub mod models;
pub mod proxy;
pub mod server;
pub mod services;
pub mod splitter;
pub mod ws;

pub use balancer::EndpointPool;
pub use client_trait::RpcClient;
pub use config::Config;
pub use error::{GapFillerError, GapFillerResult};
pub use proxy::ReverseProxy;
pub use splitter::QuerySplitter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GraphqlBackend;
    use crate::models::BackendTarget;
    use crate::proxy::PollingPolicy;
    use crate::services::{EthHeaderCidByBlockNumberService, GraphTransactionByTxHashService, ServiceRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    const HEADER: &str = "ethHeaderCidByBlockNumber";
    const TRACE: &str = "graphTransactionByTxHash";

    /// Indexer stand-in. Header rows appear `polls_until_filled` forwards
    /// after a node has been asked to backfill.
    struct Indexer {
        triggered: AtomicBool,
        polls_until_filled: usize,
        polls_after_trigger: AtomicUsize,
        header_forwards: AtomicUsize,
        fail_remainder: bool,
        requests: Mutex<Vec<(BackendTarget, Vec<u8>)>>,
    }

    impl Indexer {
        fn new(polls_until_filled: usize) -> Arc<Self> {
            Self::build(polls_until_filled, false)
        }

        fn failing_remainder() -> Arc<Self> {
            Self::build(1, true)
        }

        fn build(polls_until_filled: usize, fail_remainder: bool) -> Arc<Self> {
            Arc::new(Self {
                triggered: AtomicBool::new(false),
                polls_until_filled,
                polls_after_trigger: AtomicUsize::new(0),
                header_forwards: AtomicUsize::new(0),
                fail_remainder,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn targets_for(&self, field: &str) -> Vec<BackendTarget> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, body)| String::from_utf8_lossy(body).contains(field))
                .map(|(target, _)| *target)
                .collect()
        }
    }

    #[async_trait]
    impl GraphqlBackend for Indexer {
        async fn forward(&self, target: BackendTarget, body: &[u8]) -> GapFillerResult<Vec<u8>> {
            self.requests.lock().unwrap().push((target, body.to_vec()));
            let request: Value = serde_json::from_slice(body).unwrap();
            let query = request["query"].as_str().unwrap_or_default();

            let response = if query.contains(HEADER) {
                self.header_forwards.fetch_add(1, Ordering::SeqCst);
                let filled = self.triggered.load(Ordering::SeqCst)
                    && self.polls_after_trigger.fetch_add(1, Ordering::SeqCst) + 1 >= self.polls_until_filled;
                if filled {
                    json!({"data": {HEADER: {"edges": [{"node": {"blockHash": "0xabc"}}]}}})
                } else {
                    json!({"data": {HEADER: {"edges": []}}})
                }
            } else if query.contains(TRACE) {
                if self.triggered.load(Ordering::SeqCst) {
                    json!({"data": {TRACE: {"txHash": "0x01"}}})
                } else {
                    json!({"data": {TRACE: null}})
                }
            } else if self.fail_remainder {
                return Err(GapFillerError::Transport("connection reset".to_string()));
            } else {
                json!({"data": {"blockByKey": {"id": "1"}}})
            };
            Ok(serde_json::to_vec(&response)?)
        }
    }

    /// Source node: a successful call makes the indexer start catching up.
    struct Node {
        indexer: Arc<Indexer>,
        fail: bool,
        calls: AtomicUsize,
        methods: Mutex<Vec<String>>,
    }

    impl Node {
        fn new(indexer: &Arc<Indexer>, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                indexer: indexer.clone(),
                fail,
                calls: AtomicUsize::new(0),
                methods: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RpcClient for Node {
        fn endpoint(&self) -> &str {
            "http://node"
        }

        async fn call(&self, method: &str, _params: Vec<Value>) -> GapFillerResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.methods.lock().unwrap().push(method.to_string());
            if self.fail {
                return Err(GapFillerError::Rpc {
                    endpoint: "http://node".to_string(),
                    message: "method not available".to_string(),
                });
            }
            self.indexer.triggered.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn proxy(indexer: &Arc<Indexer>, node: &Arc<Node>) -> ReverseProxy {
        let pool = Arc::new(EndpointPool::new(vec![node.clone() as Arc<dyn RpcClient>]).unwrap());
        let timeout = Duration::from_secs(15);
        let services = ServiceRegistry::new()
            .register(Arc::new(EthHeaderCidByBlockNumberService::new(pool.clone(), timeout)))
            .unwrap()
            .register(Arc::new(GraphTransactionByTxHashService::new(pool, timeout)))
            .unwrap();
        ReverseProxy::new(indexer.clone(), Arc::new(services), PollingPolicy::default())
    }

    fn body(query: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({ "query": query })).unwrap()
    }

    async fn run(proxy: &ReverseProxy, query: &str) -> GapFillerResult<Value> {
        let raw = proxy.handle(&body(query), &CancellationToken::new()).await?;
        Ok(serde_json::from_slice(&raw).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn gap_is_filled_after_one_backfill() {
        let indexer = Indexer::new(2);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let started = Instant::now();
        let response = run(&proxy, r#"{ ethHeaderCidByBlockNumber(n: "123") { edges { node { blockHash } } } }"#)
            .await
            .unwrap();

        assert_eq!(
            response,
            json!({"data": {HEADER: {"edges": [{"node": {"blockHash": "0xabc"}}]}}})
        );
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*node.methods.lock().unwrap(), vec!["statediff_writeStateDiffAt"]);
        // initial forward plus two poll ticks
        assert_eq!(indexer.header_forwards.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gap_that_never_fills_returns_the_empty_field() {
        let indexer = Indexer::new(usize::MAX);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let started = Instant::now();
        let response = run(&proxy, r#"{ ethHeaderCidByBlockNumber(n: "7") { edges { node { blockHash } } } }"#)
            .await
            .unwrap();

        assert_eq!(response, json!({"data": {HEADER: {"edges": []}}}));
        assert!(response.get("errors").is_none());
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_fields_are_merged_verbatim() {
        let indexer = Indexer::new(1);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let raw = proxy
            .handle(
                &body(r#"{ blockByKey(key: "x") { id } ethHeaderCidByBlockNumber(n: 5) { edges { node { blockHash } } } }"#),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(raw).unwrap(),
            r#"{"data":{"blockByKey":{"id":"1"},"ethHeaderCidByBlockNumber":{"edges":[{"node":{"blockHash":"0xabc"}}]}}}"#
        );
        assert_eq!(indexer.targets_for("blockByKey"), vec![BackendTarget::Default]);
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_arguments_skip_the_node() {
        let indexer = Indexer::new(1);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let response = run(&proxy, r#"{ ethHeaderCidByBlockNumber(n: "abc") { edges { node { blockHash } } } }"#)
            .await
            .unwrap();

        assert_eq!(response, json!({"data": {HEADER: {"edges": []}}}));
        assert_eq!(node.calls.load(Ordering::SeqCst), 0);
        assert_eq!(indexer.header_forwards.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_backfill_is_not_polled() {
        let indexer = Indexer::new(1);
        let node = Node::new(&indexer, true);
        let proxy = proxy(&indexer, &node);

        let started = Instant::now();
        let response = run(&proxy, r#"{ ethHeaderCidByBlockNumber(n: "9") { edges { node { blockHash } } } }"#)
            .await
            .unwrap();

        assert_eq!(response, json!({"data": {HEADER: {"edges": []}}}));
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
        assert_eq!(indexer.header_forwards.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_stops_polling() {
        let indexer = Indexer::new(usize::MAX);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let raw = proxy
            .handle(
                &body(r#"{ ethHeaderCidByBlockNumber(n: "1") { edges { node { blockHash } } } }"#),
                &cancel,
            )
            .await
            .unwrap();

        let response: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(response, json!({"data": {HEADER: {"edges": []}}}));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_are_polled_side_by_side() {
        let indexer = Indexer::new(usize::MAX);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let query = format!(
            r#"{{ ethHeaderCidByBlockNumber(n: "3") {{ edges {{ node {{ blockHash }} }} }} graphTransactionByTxHash(txHash: "0x{}") {{ txHash }} }}"#,
            "cd".repeat(32)
        );
        let started = Instant::now();
        let response = run(&proxy, &query).await.unwrap();

        assert_eq!(
            response,
            json!({"data": {HEADER: {"edges": []}, TRACE: {"txHash": "0x01"}}})
        );
        assert!(response.get("errors").is_none());
        assert_eq!(node.calls.load(Ordering::SeqCst), 2);
        // one polling deadline, not two back to back
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test]
    async fn remainder_failure_fails_the_request() {
        let indexer = Indexer::failing_remainder();
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let err = run(&proxy, r#"{ blockByKey(key: "x") { id } ethHeaderCidByBlockNumber(n: 1) { edges { node { blockHash } } } }"#)
            .await
            .unwrap_err();

        assert!(matches!(err, GapFillerError::Transport(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn malformed_query_is_a_parse_error() {
        let indexer = Indexer::new(1);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let err = run(&proxy, "{ ethHeaderCidByBlockNumber(").await.unwrap_err();

        assert!(matches!(err, GapFillerError::Parse(_)));
        assert!(indexer.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn passthrough_forwards_the_body_untouched() {
        let indexer = Indexer::new(1);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let original = br#"{"query":"query Q {  blockByKey(key: \"x\") { id } }","operationName":"Q"}"#;
        let raw = proxy.handle(original, &CancellationToken::new()).await.unwrap();

        assert_eq!(raw, br#"{"data":{"blockByKey":{"id":"1"}}}"#.to_vec());
        let requests = indexer.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], (BackendTarget::Default, original.to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn trace_fields_use_the_tracing_upstream() {
        let indexer = Indexer::new(1);
        let node = Node::new(&indexer, false);
        let proxy = proxy(&indexer, &node);

        let query = format!(r#"{{ graphTransactionByTxHash(txHash: "0x{}") {{ txHash }} }}"#, "ab".repeat(32));
        let response = run(&proxy, &query).await.unwrap();

        assert_eq!(response, json!({"data": {TRACE: {"txHash": "0x01"}}}));
        assert_eq!(*node.methods.lock().unwrap(), vec!["debug_writeTxTraceGraph"]);
        let targets = indexer.targets_for(TRACE);
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| *t == BackendTarget::Tracing));
    }
}
