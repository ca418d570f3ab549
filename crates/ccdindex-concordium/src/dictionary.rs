//! Dictionary query building.
//!
//! A dictionary is an external index that can tell which heights contain data
//! a project cares about. The entries built here describe that data; an empty
//! list means no narrowing is sound and every height must be fetched.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ccdindex_core::error::IndexerError;

use crate::manifest::{Datasource, RuntimeHandler};
use crate::processor::DsProcessorRegistry;
use crate::project::ProjectDs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Matcher {
    #[serde(rename = "equalTo")]
    EqualTo,
    #[serde(rename = "contains")]
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCondition {
    pub field: String,
    pub value: Value,
    pub matcher: Matcher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub entity: String,
    pub conditions: Vec<QueryCondition>,
}

pub const TRANSACTIONS: &str = "transactions";
pub const TX_EVENTS: &str = "txEvents";
pub const SPECIAL_EVENTS: &str = "specialEvents";

/// Heights the dictionary reports for a queried range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryResult {
    /// Matching heights, ascending.
    pub heights: Vec<u64>,
    /// The last height the dictionary has covered for this query.
    pub last_height: u64,
}

/// An external dictionary.
#[async_trait]
pub trait DictionaryService: Send + Sync {
    /// Query heights in `[start, end]` matching any of `entries`, at most `limit`.
    ///
    /// `Ok(None)` means the dictionary cannot answer (unavailable, behind, or
    /// for another chain) and the caller must fetch every height.
    async fn query(
        &self,
        start: u64,
        end: u64,
        limit: usize,
        entries: &[QueryEntry],
    ) -> Result<Option<DictionaryResult>, IndexerError>;
}

fn filter_to_entry(
    entity: &str,
    tag: Option<&str>,
    values: Option<&std::collections::BTreeMap<String, String>>,
) -> QueryEntry {
    let mut conditions: Vec<QueryCondition> = tag
        .map(|t| QueryCondition {
            field: "type".into(),
            value: Value::String(t.to_string()),
            matcher: Matcher::EqualTo,
        })
        .into_iter()
        .collect();
    if let Some(values) = values {
        let mut nested = Map::new();
        for (key, value) in values {
            set_path(&mut nested, key, Value::String(value.clone()));
        }
        conditions.push(QueryCondition {
            field: "data".into(),
            value: Value::Object(nested),
            matcher: Matcher::Contains,
        });
    }
    QueryEntry {
        entity: entity.to_string(),
        conditions,
    }
}

/// Insert `value` at a dotted path, creating intermediate objects.
fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                set_path(map, rest, value);
            }
        }
    }
}

/// Keep one datasource per template name; plain datasources are kept as-is.
pub fn group_templates(data_sources: &[Arc<ProjectDs>]) -> Vec<Arc<ProjectDs>> {
    let mut seen = HashSet::new();
    data_sources
        .iter()
        .filter(|ds| match &ds.template_name {
            Some(name) => seen.insert(name.clone()),
            None => true,
        })
        .cloned()
        .collect()
}

/// Build dictionary entries for `data_sources`.
///
/// Returns an empty list as soon as any handler cannot be narrowed: a handler
/// without a filter, a block handler without `modulo`, an event or transaction
/// filter with neither `type` nor `values`, or a custom handler whose processor
/// offers no dictionary query.
pub fn build_dictionary_query_entries(
    data_sources: &[Arc<ProjectDs>],
    processors: &DsProcessorRegistry,
) -> Vec<QueryEntry> {
    let mut entries = Vec::new();

    for project_ds in group_templates(data_sources) {
        match &project_ds.ds {
            Datasource::Runtime(ds) => {
                for handler in &ds.mapping.handlers {
                    let entry = match handler {
                        RuntimeHandler::Block(h) => match &h.filter {
                            Some(f) if f.modulo.is_some() => continue,
                            _ => return Vec::new(),
                        },
                        RuntimeHandler::Transaction(h) => match &h.filter {
                            Some(f) if f.summary_type.is_some() || f.values.is_some() => {
                                filter_to_entry(
                                    TRANSACTIONS,
                                    f.summary_type.as_ref().map(|t| t.as_str()),
                                    f.values.as_ref(),
                                )
                            }
                            _ => return Vec::new(),
                        },
                        RuntimeHandler::TransactionEvent(h) => match &h.filter {
                            Some(f) if f.tag.is_some() || f.values.is_some() => {
                                filter_to_entry(TX_EVENTS, f.tag.as_deref(), f.values.as_ref())
                            }
                            _ => return Vec::new(),
                        },
                        RuntimeHandler::SpecialEvent(h) => match &h.filter {
                            Some(f) if f.tag.is_some() || f.values.is_some() => {
                                filter_to_entry(SPECIAL_EVENTS, f.tag.as_deref(), f.values.as_ref())
                            }
                            _ => return Vec::new(),
                        },
                    };
                    entries.push(entry);
                }
            }
            Datasource::Custom(ds) => {
                for handler in &ds.mapping.handlers {
                    if handler.filter.is_none() {
                        return Vec::new();
                    }
                    let entry = processors
                        .handler_processor(ds, &handler.kind)
                        .ok()
                        .and_then(|hp| hp.dictionary_query(handler.filter.as_ref(), ds));
                    match entry {
                        Some(entry) => entries.push(entry),
                        None => return Vec::new(),
                    }
                }
            }
        }
    }

    dedup_entries(entries)
}

/// Drop entries with the same entity and the same conditions in any order.
fn dedup_entries(entries: Vec<QueryEntry>) -> Vec<QueryEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| {
            let mut conditions = entry.conditions.clone();
            conditions.sort_by(|a, b| a.field.cmp(&b.field));
            let key = format!(
                "{}|{}",
                entry.entity,
                serde_json::to_string(&conditions).unwrap_or_default()
            );
            seen.insert(key)
        })
        .collect()
}
