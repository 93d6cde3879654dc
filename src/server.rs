use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;

use crate::backend::HttpBackend;
use crate::balancer::EndpointPool;
use crate::config::Config;
use crate::error::{GapFillerError, GapFillerResult};
use crate::proxy::ReverseProxy;
use crate::services::{EthHeaderCidByBlockNumberService, GraphTransactionByTxHashService, ServiceRegistry};
use crate::ws::{self, GRAPHQL_WS_PROTOCOLS};

#[derive(Clone)]
struct AppState {
    proxy: Arc<ReverseProxy>,
    subscriptions: Url,
}

/// Wires pools, services and backends from `config`.
pub fn build_proxy(config: &Config) -> GapFillerResult<ReverseProxy> {
    let default_target = parse_url(&config.gql.default)?;
    let tracing_target = parse_url(&config.gql.tracing)?;
    let backend = HttpBackend::new(default_target, tracing_target, config.polling.http_timeout())?;

    let eth_pool = Arc::new(EndpointPool::connect(&config.rpc.eth, config.rpc.client)?);
    let tracing_pool = Arc::new(EndpointPool::connect(&config.rpc.tracing, config.rpc.client)?);
    let rpc_timeout = config.polling.rpc_timeout();

    let mut header = EthHeaderCidByBlockNumberService::new(eth_pool, rpc_timeout);
    let mut trace = GraphTransactionByTxHashService::new(tracing_pool, rpc_timeout);
    if let Some(rule) = config.emptiness_for("ethHeaderCidByBlockNumber") {
        header = header.with_rule(rule);
    }
    if let Some(rule) = config.emptiness_for("graphTransactionByTxHash") {
        trace = trace.with_rule(rule);
    }

    let services = ServiceRegistry::new()
        .register(Arc::new(header))?
        .register(Arc::new(trace))?;
    info!(services = ?services.names().collect::<Vec<_>>(), "backfill services registered");

    Ok(ReverseProxy::new(
        Arc::new(backend),
        Arc::new(services),
        config.polling.policy(),
    ))
}

fn parse_url(value: &str) -> GapFillerResult<Url> {
    Url::parse(value).map_err(|e| GapFillerError::Config(format!("invalid URL {}: {}", value, e)))
}

fn route_path(base: &str, leaf: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), leaf)
}

pub fn router(proxy: Arc<ReverseProxy>, subscriptions: Url, base_path: &str, graphiql: bool) -> Router {
    let endpoint = route_path(base_path, "graphql");
    let mut router = Router::new().route(&endpoint, any(graphql));
    if graphiql {
        let page = graphiql_page(&endpoint);
        router = router.route(&route_path(base_path, "graphiql"), get(move || std::future::ready(Html(page.clone()))));
    }
    router.with_state(AppState { proxy, subscriptions })
}

pub async fn serve(config: Config) -> GapFillerResult<()> {
    let proxy = Arc::new(build_proxy(&config)?);
    let subscriptions = ws::websocket_url(&parse_url(&config.gql.default)?)?;
    let app = router(proxy, subscriptions, &config.http.path, config.gql.gui);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, path = %route_path(&config.http.path, "graphql"), graphiql = config.gql.gui, "gap-filler listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(GapFillerError::Io)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown");
}

async fn graphql(
    State(state): State<AppState>,
    upgrade: Option<WebSocketUpgrade>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(upgrade) = upgrade {
        let protocol = headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .and_then(|offered| {
                offered
                    .split(',')
                    .map(str::trim)
                    .find(|p| GRAPHQL_WS_PROTOCOLS.contains(p))
                    .map(str::to_string)
            });
        let upstream = state.subscriptions.clone();
        return upgrade
            .protocols(GRAPHQL_WS_PROTOCOLS)
            .on_upgrade(move |socket| ws::bridge(socket, upstream, protocol));
    }

    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    // Dropping this handler (client disconnect) cancels the token and with it
    // any polling still running for the request.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let span = info_span!("graphql_request", bytes = body.len());
    match state.proxy.handle(&body, &cancel).instrument(span).await {
        Ok(data) => ([(header::CONTENT_TYPE, "application/json")], data).into_response(),
        Err(e) => {
            warn!(error = %e, "request failed");
            let status = if e.is_fatal() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, e.to_string()).into_response()
        }
    }
}

fn graphiql_page(endpoint: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <title>GraphiQL</title>
    <link rel="stylesheet" href="https://unpkg.com/graphiql@3/graphiql.min.css" />
  </head>
  <body style="margin: 0;">
    <div id="graphiql" style="height: 100vh;"></div>
    <script crossorigin src="https://unpkg.com/react@18/umd/react.production.min.js"></script>
    <script crossorigin src="https://unpkg.com/react-dom@18/umd/react-dom.production.min.js"></script>
    <script crossorigin src="https://unpkg.com/graphiql@3/graphiql.min.js"></script>
    <script>
      const fetcher = GraphiQL.createFetcher({{ url: "{endpoint}" }});
      ReactDOM.createRoot(document.getElementById("graphiql")).render(React.createElement(GraphiQL, {{ fetcher }}));
    </script>
  </body>
</html>"#
    )
}
