use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;

/// GraphQL-over-HTTP request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(rename = "operationName", default)]
    pub operation_name: Option<String>,
}

impl GraphQLRequest {
    pub fn to_body(&self) -> Vec<u8> {
        // A struct of strings and JSON values always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.as_ref()?.get(name)
    }
}

/// GraphQL response envelope. Keys other than `data` and `errors` (such as
/// `extensions`) are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GraphQLResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Lenient conversion from a backend reply: a `data` that is not an
    /// object becomes `{}` and an `errors` that is not a list is dropped.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut envelope) = value else {
            return Self::empty();
        };
        let data = match envelope.remove("data") {
            Some(Value::Object(data)) => data,
            _ => Map::new(),
        };
        let errors = match envelope.remove("errors") {
            Some(Value::Array(errors)) => errors,
            _ => Vec::new(),
        };
        Self {
            data,
            errors,
            extra: envelope,
        }
    }
}

/// Typed value of a call-site argument, with variables already resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    Enum(String),
    List(Vec<ArgValue>),
    Object(Vec<(String, ArgValue)>),
}

impl ArgValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ArgValue::Int(i),
                None => ArgValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ArgValue::String(s.clone()),
            Value::Array(items) => ArgValue::List(items.iter().map(ArgValue::from_json).collect()),
            Value::Object(map) => ArgValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), ArgValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Boolean(_) => "boolean",
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::String(_) => "string",
            ArgValue::Enum(_) => "enum",
            ArgValue::List(_) => "list",
            ArgValue::Object(_) => "object",
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Null => write!(f, "null"),
            ArgValue::Boolean(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{}", x),
            ArgValue::String(s) => write!(f, "{:?}", s),
            ArgValue::Enum(e) => write!(f, "{}", e),
            ArgValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            ArgValue::Object(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: ArgValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Argument called `name`, or the first argument when none matches.
    pub fn lookup<'a>(args: &'a [Argument], name: &str) -> Option<&'a Argument> {
        args.iter().find(|a| a.name == name).or_else(|| args.first())
    }

    pub fn describe(args: &[Argument]) -> String {
        args.iter()
            .map(|a| format!("{}: {}", a.name, a.value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Which upstream GraphQL endpoint serves a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendTarget {
    Default,
    Tracing,
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTarget::Default => write!(f, "default"),
            BackendTarget::Tracing => write!(f, "tracing"),
        }
    }
}

/// Single-field request extracted from a larger one.
#[derive(Debug, Clone, PartialEq)]
pub struct SubDocument {
    pub request: GraphQLRequest,
    /// Alias if the field has one, otherwise the field name.
    pub response_key: String,
    pub arguments: Vec<Argument>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitResult {
    pub remainder: Option<GraphQLRequest>,
    pub per_field: HashMap<String, SubDocument>,
}

impl SplitResult {
    pub fn is_passthrough(&self) -> bool {
        self.per_field.is_empty()
    }
}

/// A backfill in flight for one empty field of one request.
#[derive(Debug, Clone)]
pub struct PendingBackfill {
    pub field_name: String,
    pub args: Vec<Argument>,
    pub deadline: Instant,
}

impl PendingBackfill {
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
