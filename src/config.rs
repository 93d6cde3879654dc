use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::client_trait::RpcClientKind;
use crate::error::{GapFillerError, GapFillerResult};
use crate::proxy::PollingPolicy;
use crate::services::EmptinessRule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub gql: GqlConfig,
    pub rpc: RpcConfig,
    pub log: LogConfig,
    pub polling: PollingConfig,
    /// Per-field overrides, keyed by GraphQL field name.
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GqlConfig {
    pub default: String,
    pub tracing: String,
    pub gui: bool,
}

impl Default for GqlConfig {
    fn default() -> Self {
        Self {
            default: "http://127.0.0.1:5020/graphql".to_string(),
            tracing: "http://127.0.0.1:5020/graphql".to_string(),
            gui: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    #[serde(deserialize_with = "addresses")]
    pub eth: Vec<String>,
    #[serde(deserialize_with = "addresses")]
    pub tracing: Vec<String>,
    pub client: RpcClientKind,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            eth: vec!["http://127.0.0.1:8545".to_string()],
            tracing: vec!["http://127.0.0.1:8000".to_string()],
            client: RpcClientKind::Ethers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub timestamp: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamp: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub http_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            timeout_ms: 15_000,
            rpc_timeout_ms: 15_000,
            http_timeout_ms: 15_000,
        }
    }
}

impl PollingConfig {
    pub fn policy(&self) -> PollingPolicy {
        PollingPolicy {
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub emptiness: Option<EmptinessRule>,
}

/// Accepts either a list of addresses or one comma-separated string.
fn addresses<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Addresses {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Addresses::deserialize(deserializer)? {
        Addresses::One(s) => split_addresses(&s),
        Addresses::Many(list) => list.iter().flat_map(|s| split_addresses(s)).collect(),
    })
}

pub fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn load(path: &Path) -> GapFillerResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| GapFillerError::Config(format!("unable to parse config: {err}")))
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, url) in [("gql.default", &self.gql.default), ("gql.tracing", &self.gql.tracing)] {
            if url.is_empty() {
                return Err(format!("{} cannot be empty", name));
            }
            Url::parse(url).map_err(|e| format!("{} is not a valid URL: {}", name, e))?;
        }

        if self.rpc.eth.is_empty() {
            return Err("rpc.eth needs at least one address".to_string());
        }

        if self.rpc.tracing.is_empty() {
            return Err("rpc.tracing needs at least one address".to_string());
        }

        if self.polling.interval_ms == 0
            || self.polling.timeout_ms == 0
            || self.polling.rpc_timeout_ms == 0
            || self.polling.http_timeout_ms == 0
        {
            return Err("polling durations must be positive".to_string());
        }

        if !self.http.path.starts_with('/') {
            return Err("http.path must start with '/'".to_string());
        }

        Ok(())
    }

    pub fn emptiness_for(&self, field: &str) -> Option<EmptinessRule> {
        self.services.get(field).and_then(|s| s.emptiness)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }
}
