//! Handler kinds, per-kind filters and the strict handler decoder.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::types::TransactionSummaryType;

// ─── Kinds ────────────────────────────────────────────────────────────────────

/// The runtime handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    #[serde(rename = "concordium/BlockHandler")]
    Block,
    #[serde(rename = "concordium/TransactionHandler")]
    Transaction,
    #[serde(rename = "concordium/TransactionEventHandler")]
    TransactionEvent,
    #[serde(rename = "concordium/SpecialEventHandler")]
    SpecialEvent,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 4] = [
        Self::Block,
        Self::Transaction,
        Self::TransactionEvent,
        Self::SpecialEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "concordium/BlockHandler",
            Self::Transaction => "concordium/TransactionHandler",
            Self::TransactionEvent => "concordium/TransactionEventHandler",
            Self::SpecialEvent => "concordium/SpecialEventHandler",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Filters ──────────────────────────────────────────────────────────────────

/// Matches block heights divisible by `modulo`. `timestamp` is carried but not
/// consulted when matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulo: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionFilter {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub summary_type: Option<TransactionSummaryType>,
    #[serde(
        default,
        deserialize_with = "string_values",
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransactionEventFilter {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_values",
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialEventFilter {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_values",
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<BTreeMap<String, String>>,
}

/// Filter values arrive as text; unquoted YAML scalars are accepted as their
/// textual form.
fn string_values<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    raw.map(|map| {
        map.into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => Ok((key, s)),
                Value::Number(n) => Ok((key, n.to_string())),
                Value::Bool(b) => Ok((key, b.to_string())),
                other => Err(serde::de::Error::custom(format!(
                    "filter value for '{key}' must be a string, got {other}"
                ))),
            })
            .collect()
    })
    .transpose()
}

/// A filter of any runtime kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyFilter {
    Block(BlockFilter),
    Transaction(TransactionFilter),
    TransactionEvent(TransactionEventFilter),
    SpecialEvent(SpecialEventFilter),
}

impl AnyFilter {
    /// Strictly decode `value` as the filter type belonging to `kind`.
    pub fn decode(kind: HandlerKind, value: Value) -> Result<Self, String> {
        let err = |e: serde_json::Error| format!("invalid {kind} filter: {e}");
        match kind {
            HandlerKind::Block => serde_json::from_value(value).map(Self::Block).map_err(err),
            HandlerKind::Transaction => serde_json::from_value(value)
                .map(Self::Transaction)
                .map_err(err),
            HandlerKind::TransactionEvent => serde_json::from_value(value)
                .map(Self::TransactionEvent)
                .map_err(err),
            HandlerKind::SpecialEvent => serde_json::from_value(value)
                .map(Self::SpecialEvent)
                .map_err(err),
        }
    }
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

/// Handler name plus its optional filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSpec<F> {
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<F>,
}

/// A handler of a runtime datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum RuntimeHandler {
    #[serde(rename = "concordium/BlockHandler")]
    Block(HandlerSpec<BlockFilter>),
    #[serde(rename = "concordium/TransactionHandler")]
    Transaction(HandlerSpec<TransactionFilter>),
    #[serde(rename = "concordium/TransactionEventHandler")]
    TransactionEvent(HandlerSpec<TransactionEventFilter>),
    #[serde(rename = "concordium/SpecialEventHandler")]
    SpecialEvent(HandlerSpec<SpecialEventFilter>),
}

impl RuntimeHandler {
    /// Decode a raw handler, choosing the filter shape from its `kind`.
    pub fn decode(value: &Value) -> Result<Self, String> {
        let mut obj = value
            .as_object()
            .cloned()
            .ok_or_else(|| "handler must be an object".to_string())?;
        let kind = match obj.remove("kind") {
            Some(Value::String(kind)) => kind,
            _ => return Err("handler is missing a string 'kind'".into()),
        };
        let rest = Value::Object(obj);
        let kind = HandlerKind::parse(&kind).ok_or_else(|| format!("handler {kind} not supported"))?;
        let err = |e: serde_json::Error| format!("invalid {kind}: {e}");
        match kind {
            HandlerKind::Block => serde_json::from_value(rest).map(Self::Block).map_err(err),
            HandlerKind::Transaction => serde_json::from_value(rest)
                .map(Self::Transaction)
                .map_err(err),
            HandlerKind::TransactionEvent => serde_json::from_value(rest)
                .map(Self::TransactionEvent)
                .map_err(err),
            HandlerKind::SpecialEvent => serde_json::from_value(rest)
                .map(Self::SpecialEvent)
                .map_err(err),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Block(_) => HandlerKind::Block,
            Self::Transaction(_) => HandlerKind::Transaction,
            Self::TransactionEvent(_) => HandlerKind::TransactionEvent,
            Self::SpecialEvent(_) => HandlerKind::SpecialEvent,
        }
    }

    pub fn handler(&self) -> &str {
        match self {
            Self::Block(h) => &h.handler,
            Self::Transaction(h) => &h.handler,
            Self::TransactionEvent(h) => &h.handler,
            Self::SpecialEvent(h) => &h.handler,
        }
    }

    pub fn has_filter(&self) -> bool {
        match self {
            Self::Block(h) => h.filter.is_some(),
            Self::Transaction(h) => h.filter.is_some(),
            Self::TransactionEvent(h) => h.filter.is_some(),
            Self::SpecialEvent(h) => h.filter.is_some(),
        }
    }
}

/// A handler of a custom datasource; `kind` is resolved by the datasource's processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomHandler {
    pub kind: String,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map<String, Value>>,
}
