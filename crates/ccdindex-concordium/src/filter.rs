//! Filter matching for blocks, transactions and events.
//!
//! Every predicate is total: a missing filter matches, and each present field
//! narrows the match. Filter values are text, so they are compared against the
//! datum's native representation:
//!
//! - strings compare directly
//! - integers compare by value; numbers past 64 bits through their parsed value
//! - an account address object (`{ type, address }`) compares its `address`
//! - a contract address (`{ index, subindex }`) compares its `index`
//!
//! Anything else never matches.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

use crate::manifest::{
    AnyFilter, BlockFilter, HandlerKind, RuntimeHandler, SpecialEventFilter,
    TransactionEventFilter, TransactionFilter,
};
use crate::types::{Block, Fields, SpecialEvent, Transaction, TransactionEvent};

/// A datum that a handler can be invoked with.
#[derive(Debug, Clone, Copy)]
pub enum HandlerInput<'a> {
    Block(&'a Block),
    Transaction(&'a Transaction),
    TransactionEvent(&'a TransactionEvent),
    SpecialEvent(&'a SpecialEvent),
}

impl HandlerInput<'_> {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Block(_) => HandlerKind::Block,
            Self::Transaction(_) => HandlerKind::Transaction,
            Self::TransactionEvent(_) => HandlerKind::TransactionEvent,
            Self::SpecialEvent(_) => HandlerKind::SpecialEvent,
        }
    }

    pub fn to_value(&self) -> Value {
        let result = match self {
            Self::Block(b) => serde_json::to_value(b),
            Self::Transaction(t) => serde_json::to_value(t),
            Self::TransactionEvent(e) => serde_json::to_value(e),
            Self::SpecialEvent(e) => serde_json::to_value(e),
        };
        result.unwrap_or(Value::Null)
    }
}

pub fn matches_block(block: &Block, filter: Option<&BlockFilter>) -> bool {
    match filter.and_then(|f| f.modulo) {
        Some(modulo) if modulo > 0 => block.height() % modulo == 0,
        _ => true,
    }
}

pub fn matches_transaction(tx: &Transaction, filter: Option<&TransactionFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if let Some(expected) = &filter.summary_type {
        if tx.summary_type() != Some(expected.as_str()) {
            return false;
        }
    }
    matches_values(tx, filter.values.as_ref())
}

pub fn matches_transaction_event(
    event: &TransactionEvent,
    filter: Option<&TransactionEventFilter>,
) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    matches_tag(event.tag(), filter.tag.as_deref()) && matches_values(event, filter.values.as_ref())
}

pub fn matches_special_event(event: &SpecialEvent, filter: Option<&SpecialEventFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    matches_tag(event.tag(), filter.tag.as_deref()) && matches_values(event, filter.values.as_ref())
}

/// Match `input` against a filter of any kind. A filter of a different kind
/// than the input never matches.
pub fn matches_any(input: HandlerInput<'_>, filter: &AnyFilter) -> bool {
    match (input, filter) {
        (HandlerInput::Block(b), AnyFilter::Block(f)) => matches_block(b, Some(f)),
        (HandlerInput::Transaction(t), AnyFilter::Transaction(f)) => {
            matches_transaction(t, Some(f))
        }
        (HandlerInput::TransactionEvent(e), AnyFilter::TransactionEvent(f)) => {
            matches_transaction_event(e, Some(f))
        }
        (HandlerInput::SpecialEvent(e), AnyFilter::SpecialEvent(f)) => {
            matches_special_event(e, Some(f))
        }
        _ => false,
    }
}

/// Whether a runtime handler applies to `input`: same kind, filter matches.
pub fn matches_handler(handler: &RuntimeHandler, input: HandlerInput<'_>) -> bool {
    match (handler, input) {
        (RuntimeHandler::Block(h), HandlerInput::Block(b)) => matches_block(b, h.filter.as_ref()),
        (RuntimeHandler::Transaction(h), HandlerInput::Transaction(t)) => {
            matches_transaction(t, h.filter.as_ref())
        }
        (RuntimeHandler::TransactionEvent(h), HandlerInput::TransactionEvent(e)) => {
            matches_transaction_event(e, h.filter.as_ref())
        }
        (RuntimeHandler::SpecialEvent(h), HandlerInput::SpecialEvent(e)) => {
            matches_special_event(e, h.filter.as_ref())
        }
        _ => false,
    }
}

fn matches_tag(actual: Option<&str>, expected: Option<&str>) -> bool {
    match expected {
        Some(expected) => actual == Some(expected),
        None => true,
    }
}

fn matches_values<D: Fields>(datum: &D, values: Option<&BTreeMap<String, String>>) -> bool {
    values.map_or(true, |values| {
        values
            .iter()
            .all(|(key, expected)| datum.field(key).map_or(false, |v| value_matches(v, expected)))
    })
}

/// Compare a datum value with a textual filter value.
pub fn value_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Number(n) => number_matches(n, expected),
        Value::Bool(b) => b.to_string() == expected,
        Value::Object(map) => {
            if let Some(address) = map.get("address") {
                value_matches(address, expected)
            } else if let Some(index) = map.get("index") {
                value_matches(index, expected)
            } else {
                false
            }
        }
        Value::Null | Value::Array(_) => false,
    }
}

fn number_matches(n: &Number, expected: &str) -> bool {
    if let Some(u) = n.as_u64() {
        expected.parse::<u128>().map_or(false, |e| e == u128::from(u))
    } else if let Some(i) = n.as_i64() {
        expected.parse::<i128>().map_or(false, |e| e == i128::from(i))
    } else {
        // Held as f64 by serde_json.
        match (n.as_f64(), expected.parse::<f64>()) {
            (Some(actual), Ok(expected)) => actual == expected,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionSummaryType;
    use serde_json::{json, Map};

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn values(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    fn transfer_tx(amount: &str) -> Transaction {
        Transaction::new(obj(json!({ "type": "accountTransaction", "amount": amount })))
    }

    #[test]
    fn block_modulo() {
        let block = |h| Block {
            block_height: h,
            ..Default::default()
        };
        let filter = BlockFilter {
            modulo: Some(2),
            timestamp: None,
        };
        assert!(matches_block(&block(10), Some(&filter)));
        assert!(!matches_block(&block(11), Some(&filter)));
        assert!(matches_block(&block(11), None));
        assert!(matches_block(&block(11), Some(&BlockFilter::default())));
    }

    #[test]
    fn transaction_type_and_values() {
        let tx = transfer_tx("100");
        let by_type = |t| TransactionFilter {
            summary_type: Some(t),
            values: None,
        };
        assert!(matches_transaction(&tx, Some(&by_type(TransactionSummaryType::AccountTransaction))));
        assert!(!matches_transaction(&tx, Some(&by_type(TransactionSummaryType::AccountCreation))));

        let with_amount = |a| TransactionFilter {
            summary_type: Some(TransactionSummaryType::AccountTransaction),
            values: values(&[("amount", a)]),
        };
        assert!(matches_transaction(&tx, Some(&with_amount("100"))));
        assert!(!matches_transaction(&tx, Some(&with_amount("10"))));
        assert!(matches_transaction(&tx, None));
    }

    #[test]
    fn transaction_event_tag_and_values() {
        let evt = TransactionEvent {
            data: obj(json!({ "tag": "Transferred", "amount": "100" })),
            ..Default::default()
        };
        let filter = |tag: &str, amount: Option<&str>| TransactionEventFilter {
            tag: Some(tag.into()),
            values: amount.and_then(|a| values(&[("amount", a)])),
        };
        assert!(matches_transaction_event(&evt, Some(&filter("Transferred", None))));
        assert!(!matches_transaction_event(&evt, Some(&filter("AccountCreated", None))));
        assert!(matches_transaction_event(&evt, Some(&filter("Transferred", Some("100")))));
        assert!(!matches_transaction_event(&evt, Some(&filter("Transferred", Some("10")))));
    }

    #[test]
    fn special_event_tag_and_values() {
        let evt = SpecialEvent {
            id: 0,
            data: obj(json!({ "tag": "event2", "amount": "100" })),
        };
        let filter = |tag: &str, amount: &str| SpecialEventFilter {
            tag: Some(tag.into()),
            values: values(&[("amount", amount)]),
        };
        assert!(matches_special_event(&evt, Some(&filter("event2", "100"))));
        assert!(!matches_special_event(&evt, Some(&filter("event1", "100"))));
        assert!(!matches_special_event(&evt, Some(&filter("event2", "10"))));
    }

    #[test]
    fn nested_polymorphic_values() {
        let sender = "4AuT5RRmBwcdkLMA6iVjxTDb1FQmxwAh3wHBS22mggWL8xH6s3";
        let tx = Transaction::new(obj(json!({
            "type": "accountTransaction",
            "transactionType": "update",
            "energyCost": 3739u64,
            "sender": sender,
        })));
        assert!(matches_transaction(
            &tx,
            Some(&TransactionFilter {
                summary_type: Some(TransactionSummaryType::AccountTransaction),
                values: values(&[("sender", sender)]),
            })
        ));

        let evt = TransactionEvent {
            data: obj(json!({
                "tag": "Updated",
                "contractVersion": 1,
                "address": { "index": 6536u64, "subindex": 0u64 },
                "instigator": { "type": "AddressAccount", "address": sender },
                "amount": 0u64,
                "receiveName": "Provenance-tag.update_tag_log",
                "events": [],
            })),
            ..Default::default()
        };
        let filter = TransactionEventFilter {
            tag: Some("Updated".into()),
            values: values(&[("instigator", sender), ("address", "6536"), ("amount", "0")]),
        };
        assert!(matches_transaction_event(&evt, Some(&filter)));

        let wrong_index = TransactionEventFilter {
            tag: Some("Updated".into()),
            values: values(&[("address", "0")]),
        };
        assert!(!matches_transaction_event(&evt, Some(&wrong_index)));
    }

    #[test]
    fn numbers_compare_by_value() {
        let amount = u128::MAX.to_string();
        let big: Value = serde_json::from_str(&amount).unwrap();
        assert!(value_matches(&big, &amount));
        assert!(!value_matches(&big, "1"));
        assert!(value_matches(&json!(u64::MAX), &u64::MAX.to_string()));
        assert!(value_matches(&json!(-5), "-5"));
        assert!(value_matches(&json!(100), "100"));
        assert!(!value_matches(&json!(100), "100.5"));
        assert!(!value_matches(&json!(5), "five"));
    }

    #[test]
    fn missing_keys_and_unsupported_shapes_fail() {
        let tx = transfer_tx("100");
        let filter = TransactionFilter {
            summary_type: None,
            values: values(&[("receiver", "x")]),
        };
        assert!(!matches_transaction(&tx, Some(&filter)));
        assert!(!value_matches(&json!(["100"]), "100"));
        assert!(!value_matches(&Value::Null, "null"));
        assert!(value_matches(&json!({ "type": "AddressContract", "address": { "index": 7, "subindex": 0 } }), "7"));
    }

    #[test]
    fn any_filter_kind_mismatch() {
        let tx = transfer_tx("1");
        let block_filter = AnyFilter::Block(BlockFilter::default());
        assert!(!matches_any(HandlerInput::Transaction(&tx), &block_filter));
        assert!(matches_any(
            HandlerInput::Transaction(&tx),
            &AnyFilter::Transaction(TransactionFilter::default())
        ));
    }

    #[test]
    fn runtime_handler_needs_same_kind() {
        use crate::manifest::HandlerSpec;
        let tx = transfer_tx("100");
        let handler = RuntimeHandler::Transaction(HandlerSpec {
            handler: "handleTx".into(),
            filter: Some(TransactionFilter {
                summary_type: Some(TransactionSummaryType::AccountTransaction),
                values: None,
            }),
        });
        assert!(matches_handler(&handler, HandlerInput::Transaction(&tx)));

        let block = Block::default();
        assert!(!matches_handler(&handler, HandlerInput::Block(&block)));
        assert_eq!(HandlerInput::Block(&block).kind(), HandlerKind::Block);
    }
}
