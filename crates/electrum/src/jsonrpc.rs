//! JSON-RPC 2.0 framing: single and batch requests, responses, and
//! unsolicited notifications.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request parameters, parsed lazily per method.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    ByPosition(Vec<Value>),
    ByName(Map<String, Value>),
    #[default]
    Absent,
}

impl Params {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// The positional view of the parameters, required by every builtin
    /// method.
    pub fn positional(&self) -> Result<&[Value], RpcError> {
        match self {
            Self::ByPosition(values) => Ok(values),
            Self::ByName(_) => Err(RpcError::invalid_params(
                "named parameters are not accepted here",
            )),
            Self::Absent => Ok(&[]),
        }
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::ByPosition(values) => values.serialize(serializer),
            Self::ByName(map) => map.serialize(serializer),
            Self::Absent => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Array(values) => Ok(Self::ByPosition(values)),
            Value::Object(map) => Ok(Self::ByName(map)),
            Value::Null => Ok(Self::Absent),
            _ => Err(D::Error::custom("params must be an array or an object")),
        }
    }
}

/// A single JSON-RPC request. A missing `id` marks a notification, which
/// gets no response entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Params::is_absent")]
    pub params: Params,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// One inbound message: either a single request or a batch of them.
/// `is_batch` is remembered so the response takes the matching shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub is_batch: bool,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    /// Decode a raw message. Batches must be non-empty arrays; any
    /// request whose `jsonrpc` field is not `"2.0"` is refused with a
    /// parse error.
    pub fn decode(raw: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| RpcError::parse_error())?;

        let (is_batch, items) = match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(RpcError::invalid_request());
                }
                (true, items)
            }
            other => (false, vec![other]),
        };

        let requests = items
            .into_iter()
            .map(|item| {
                let request: Request =
                    serde_json::from_value(item).map_err(|_| RpcError::invalid_request())?;
                if request.jsonrpc != JSONRPC_VERSION {
                    return Err(RpcError::parse_error());
                }
                Ok(request)
            })
            .collect::<Result<Vec<_>, RpcError>>()?;

        Ok(Self { is_batch, requests })
    }

    pub fn encode(&self) -> String {
        if self.is_batch {
            serde_json::to_string(&self.requests).expect("requests always serialize")
        } else {
            serde_json::to_string(&self.requests[0]).expect("request always serializes")
        }
    }
}

/// A response to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub jsonrpc: String,
    /// `Some(Value::Null)` is a literal `"result": null`, which is very
    /// different from having no result field at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.into(),
            result: None,
            error: Some(error),
        }
    }
}

/// Serialise the responses of one inbound message. `None` entries are
/// elided notifications. Returns `None` when nothing must be written at
/// all.
pub fn encode_responses(responses: Vec<Option<Response>>, is_batch: bool) -> Option<String> {
    if is_batch {
        let present: Vec<Response> = responses.into_iter().flatten().collect();
        if present.is_empty() {
            return None;
        }
        Some(serde_json::to_string(&present).expect("responses always serialize"))
    } else {
        responses
            .into_iter()
            .next()
            .flatten()
            .map(|response| serde_json::to_string(&response).expect("response always serializes"))
    }
}

/// An unsolicited server-to-client message: no id, only method and
/// params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("notification always serializes")
    }
}
