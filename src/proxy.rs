use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use serde_json::Value;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::backend::GraphqlBackend;
use crate::error::{GapFillerError, GapFillerResult};
use crate::models::{Argument, BackendTarget, GraphQLRequest, GraphQLResponse, PendingBackfill, SubDocument};
use crate::services::{BackfillService, ServiceRegistry};
use crate::splitter::QuerySplitter;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy)]
pub struct PollingPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Gap-filling front for the indexer's GraphQL endpoint.
pub struct ReverseProxy {
    backend: Arc<dyn GraphqlBackend>,
    services: Arc<ServiceRegistry>,
    splitter: QuerySplitter,
    polling: PollingPolicy,
}

/// A split-out field after its first forward.
struct ForwardedField<'a> {
    name: &'a str,
    sub: &'a SubDocument,
    service: &'a Arc<dyn BackfillService>,
    response: Value,
}

enum PollOutcome {
    Filled(Value),
    TimedOut(Option<Value>),
    Cancelled,
}

enum Interrupt {
    Cancelled,
    Expired,
}

impl ReverseProxy {
    pub fn new(backend: Arc<dyn GraphqlBackend>, services: Arc<ServiceRegistry>, polling: PollingPolicy) -> Self {
        let splitter = QuerySplitter::new(services.names());
        Self {
            backend,
            services,
            splitter,
            polling,
        }
    }

    /// Serves one GraphQL request body. `cancel` fires when the client goes
    /// away; in-flight polling for this request stops at that point.
    pub async fn handle(&self, body: &[u8], cancel: &CancellationToken) -> GapFillerResult<Vec<u8>> {
        let split = self.splitter.split(body)?;

        if split.is_passthrough() {
            debug!("no backfill-capable fields, passing request through");
            return self.backend.forward(BackendTarget::Default, body).await;
        }

        let remainder = async {
            match &split.remainder {
                Some(request) => self.forward_json(BackendTarget::Default, request).await.map(Some),
                None => Ok(None),
            }
        };
        let fields = try_join_all(split.per_field.iter().map(|(name, sub)| async move {
            let service = self
                .services
                .get(name)
                .ok_or_else(|| GapFillerError::Parse(format!("no service registered for {}", name)))?;
            let response = self.forward_json(service.target(), &sub.request).await?;
            Ok::<_, GapFillerError>(ForwardedField {
                name: name.as_str(),
                sub,
                service,
                response,
            })
        }));
        let (remainder, fields) = futures::try_join!(remainder, fields)?;

        let resolved = join_all(fields.into_iter().map(|field| {
            let span = debug_span!("backfill", field = field.name);
            self.resolve(field, cancel).instrument(span)
        }))
        .await;

        merge(remainder, resolved)
    }

    async fn forward_json(&self, target: BackendTarget, request: &GraphQLRequest) -> GapFillerResult<Value> {
        let raw = self.backend.forward(target, &request.to_body()).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| GapFillerError::Transport(format!("{} backend returned invalid JSON: {}", target, e)))
    }

    /// Emptiness check, then backfill + poll if needed. Never fails: whatever
    /// the field last looked like is what gets merged.
    async fn resolve(&self, field: ForwardedField<'_>, cancel: &CancellationToken) -> (String, Value) {
        let ForwardedField {
            name,
            sub,
            service,
            response,
        } = field;
        let key = sub.response_key.clone();
        let args = Argument::describe(&sub.arguments);

        match service.is_empty(&response, &key) {
            Ok(false) => {
                debug!("field already has data");
                return (key, response);
            }
            Ok(true) => {}
            Err(e) => {
                warn!(args = %args, error = %e, "cannot check field data, returning it as is");
                return (key, response);
            }
        }

        if let Err(e) = service.validate(&sub.arguments) {
            warn!(args = %args, error = %e, "field is empty but arguments are not usable for backfill");
            return (key, response);
        }

        info!(args = %args, "gap detected, triggering backfill");
        match race(service.backfill(&sub.arguments), None, cancel).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(args = %args, error = %e, "backfill request failed");
                return (key, response);
            }
            Err(_) => {
                debug!("client went away during backfill request");
                return (key, response);
            }
        }

        let pending = PendingBackfill {
            field_name: name.to_string(),
            args: sub.arguments.clone(),
            deadline: Instant::now() + self.polling.timeout,
        };
        match self.poll(service.as_ref(), sub, &pending, cancel).await {
            PollOutcome::Filled(filled) => {
                info!(args = %args, "gap filled");
                (key, filled)
            }
            PollOutcome::TimedOut(last) => {
                warn!(
                    args = %args,
                    error = %GapFillerError::PollingTimeout,
                    timeout = ?self.polling.timeout,
                    "data did not show up in time"
                );
                (key, last.unwrap_or(response))
            }
            PollOutcome::Cancelled => {
                debug!("client went away while polling");
                (key, response)
            }
        }
    }

    /// Re-forwards the sub-document on a fixed interval until the field is
    /// no longer empty, the deadline passes, or the request is cancelled.
    async fn poll(
        &self,
        service: &dyn BackfillService,
        sub: &SubDocument,
        pending: &PendingBackfill,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let target = service.target();
        let mut ticker = interval_at(Instant::now() + self.polling.interval, self.polling.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = None;
        let args = Argument::describe(&pending.args);

        loop {
            if pending.expired() {
                return PollOutcome::TimedOut(last);
            }
            let attempt = async {
                ticker.tick().await;
                self.forward_json(target, &sub.request).await
            };
            let response = match race(attempt, Some(pending.deadline), cancel).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(field = %pending.field_name, args = %args, error = %e, "poll request failed");
                    continue;
                }
                Err(Interrupt::Cancelled) => return PollOutcome::Cancelled,
                Err(Interrupt::Expired) => return PollOutcome::TimedOut(last),
            };

            match service.is_empty(&response, &sub.response_key) {
                Ok(true) => {
                    debug!(field = %pending.field_name, args = %args, "still empty");
                    last = Some(response);
                }
                Ok(false) => return PollOutcome::Filled(response),
                Err(e) => {
                    warn!(field = %pending.field_name, args = %args, error = %e, "cannot check polled data, stopping");
                    return PollOutcome::Filled(response);
                }
            }
        }
    }
}

/// Runs `fut` unless the request is cancelled or `deadline` passes first.
async fn race<F: Future>(fut: F, deadline: Option<Instant>, cancel: &CancellationToken) -> Result<F::Output, Interrupt> {
    let expiry = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = expiry => Err(Interrupt::Expired),
        output = fut => Ok(output),
    }
}

/// Sets each split-out field into the remainder's `data` object and appends
/// their `errors`. Keys the remainder already owns keep their order.
pub fn merge(remainder: Option<Value>, fields: Vec<(String, Value)>) -> GapFillerResult<Vec<u8>> {
    let mut merged = remainder
        .map(GraphQLResponse::from_value)
        .unwrap_or_else(GraphQLResponse::empty);

    for (key, response) in fields {
        let mut part = GraphQLResponse::from_value(response);
        let value = part.data.remove(&key).unwrap_or(Value::Null);
        merged.data.insert(key, value);
        merged.errors.append(&mut part.errors);
    }

    Ok(serde_json::to_vec(&merged)?)
}
