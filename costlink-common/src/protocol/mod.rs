//! Wire protocol for the sync connection
//!
//! All frames are JSON text. Outbound requests carry `type` and
//! `messageId`; responses echo the `messageId` with a `<kind>_response`
//! type and a `status`. Push events (quantity updates) carry no
//! `messageId` and are routed by `type` alone.
//!
//! Inbound frames are decoded once at the boundary into [`InboundFrame`];
//! kinds this client does not know stay available as
//! [`InboundFrame::Unknown`] so newer backends do not break older clients.

mod types;

pub use types::{
    AvailableCodes, CostItem, MatchCodesResult, Provenance, QuantitySource, QuantityUpdate,
    ReconciledItem, ServerMatch,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// `type` of the outbound keep-alive frame
pub const PING_TYPE: &str = "ping";
/// `type` of the optional keep-alive answer
pub const PONG_TYPE: &str = "pong";
/// `type` of the quantity push event
pub const QUANTITY_UPDATE_TYPE: &str = "quantity_update";
/// Suffix the backend appends to a request kind when answering it
pub const RESPONSE_SUFFIX: &str = "_response";

/// Correlated request kinds understood by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Ask the backend for its authoritative spreadsheet-to-model code matches
    MatchCodes,
    /// Persist a batch of reconciled cost items
    SaveCostData,
    /// Re-run cost application against the latest model quantities
    ReapplyCosts,
    /// List the model codes the backend currently knows about
    GetAvailableCodes,
}

impl RequestKind {
    /// Wire name used as the request `type`
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::MatchCodes => "match_codes",
            RequestKind::SaveCostData => "save_cost_data",
            RequestKind::ReapplyCosts => "reapply_costs",
            RequestKind::GetAvailableCodes => "get_available_codes",
        }
    }

    /// Wire name of the matching response `type`
    pub fn response_type(&self) -> String {
        format!("{}{}", self.as_str(), RESPONSE_SUFFIX)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames this client sends
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Keep-alive, `{"type":"ping"}`
    Ping,
    /// Correlated request; payload fields are merged into the top-level object
    Request {
        kind: RequestKind,
        message_id: String,
        payload: Map<String, Value>,
    },
}

impl OutboundFrame {
    /// Encode as a JSON text frame
    ///
    /// `type` and `messageId` always win over same-named payload fields.
    pub fn to_json(&self) -> String {
        let object = match self {
            OutboundFrame::Ping => {
                let mut object = Map::new();
                object.insert("type".to_string(), Value::from(PING_TYPE));
                object
            }
            OutboundFrame::Request {
                kind,
                message_id,
                payload,
            } => {
                let mut object = payload.clone();
                object.insert("type".to_string(), Value::from(kind.as_str()));
                object.insert("messageId".to_string(), Value::from(message_id.as_str()));
                object
            }
        };
        Value::Object(object).to_string()
    }
}

/// Outcome flag carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// A correlated response frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseFrame {
    /// Full wire type, e.g. `match_codes_response`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: Option<String>,
    /// Every remaining field of the frame
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ResponseFrame {
    /// Request kind this frame answers (`type` without the `_response` suffix)
    pub fn request_kind(&self) -> &str {
        self.kind.strip_suffix(RESPONSE_SUFFIX).unwrap_or(&self.kind)
    }

    /// Convert an error-status response into [`Error::Application`]
    pub fn into_result(self) -> Result<ResponseFrame> {
        match self.status {
            ResponseStatus::Success => Ok(self),
            ResponseStatus::Error => Err(Error::Application {
                kind: self.request_kind().to_string(),
                message: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "backend reported an error without a message".to_string()),
            }),
        }
    }

    /// Deserialize the result fields into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.body.clone())).map_err(|e| {
            Error::MalformedFrame(format!("{} body: {}", self.kind, e))
        })
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Answer to a correlated request
    Response(ResponseFrame),
    /// Pushed quantity change for one classification code
    QuantityUpdate(QuantityUpdate),
    /// Keep-alive answer
    Pong,
    /// Any other kind, kept raw for forward compatibility
    Unknown {
        kind: String,
        message_id: Option<String>,
        body: Value,
    },
}

impl InboundFrame {
    /// Decode a JSON text frame
    ///
    /// Fails with [`Error::MalformedFrame`] when the text is not a JSON
    /// object with a string `type`, or when a known kind is missing
    /// required fields. A `*_response` frame without `messageId` cannot be
    /// correlated and decodes as `Unknown`.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedFrame(format!("invalid JSON: {}", e)))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedFrame("missing string field `type`".to_string()))?
            .to_string();
        let message_id = value
            .get("messageId")
            .and_then(Value::as_str)
            .map(str::to_string);

        if kind.ends_with(RESPONSE_SUFFIX) && message_id.is_some() {
            let response: ResponseFrame = serde_json::from_value(value)
                .map_err(|e| Error::MalformedFrame(format!("{}: {}", kind, e)))?;
            return Ok(InboundFrame::Response(response));
        }

        match kind.as_str() {
            QUANTITY_UPDATE_TYPE => {
                let update: QuantityUpdate = serde_json::from_value(value)
                    .map_err(|e| Error::MalformedFrame(format!("{}: {}", kind, e)))?;
                Ok(InboundFrame::QuantityUpdate(update))
            }
            PONG_TYPE => Ok(InboundFrame::Pong),
            _ => Ok(InboundFrame::Unknown {
                kind,
                message_id,
                body: value,
            }),
        }
    }

    /// Wire `type` of the frame, used as the dispatch key
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::Response(response) => &response.kind,
            InboundFrame::QuantityUpdate(_) => QUANTITY_UPDATE_TYPE,
            InboundFrame::Pong => PONG_TYPE,
            InboundFrame::Unknown { kind, .. } => kind,
        }
    }

    /// Correlation id, if the frame carries one
    pub fn message_id(&self) -> Option<&str> {
        match self {
            InboundFrame::Response(response) => Some(&response.message_id),
            InboundFrame::Unknown { message_id, .. } => message_id.as_deref(),
            InboundFrame::QuantityUpdate(_) | InboundFrame::Pong => None,
        }
    }
}
