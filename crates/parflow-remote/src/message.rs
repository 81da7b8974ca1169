//! JSON messages exchanged between services.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::object::RemoteException;

/// Reserved member name for attribute reads.
pub const GETATTR_MEMBER: &str = "__getattr__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Request(CallRequest),
    Reply(CallReply),
}

/// Invoke `member` on the object named by `object_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub correlation_id: String,
    pub object_id: String,
    pub member: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReply {
    pub correlation_id: String,
    pub outcome: Outcome,
}

/// What a call produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Value),
    Exception(RemoteException),
}

impl WireMessage {
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
