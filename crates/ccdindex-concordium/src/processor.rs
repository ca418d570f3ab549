//! Custom datasource processors.
//!
//! A custom datasource names a `kind` that no runtime handler understands. A
//! [`DsProcessor`] registered for that kind validates the datasource and, per
//! custom handler kind, supplies a [`HandlerProcessor`] that maps the handler
//! onto one of the runtime kinds, filters inputs and transforms each matched
//! input into zero or more handler arguments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use ccdindex_core::error::IndexerError;

use crate::dictionary::QueryEntry;
use crate::filter::HandlerInput;
use crate::manifest::{AnyFilter, CustomDatasource, HandlerKind};
use crate::project::ProjectDs;

/// Second-layer processor for one custom handler kind.
#[async_trait]
pub trait HandlerProcessor: Send + Sync {
    /// The runtime kind whose inputs this handler consumes.
    fn base_handler_kind(&self) -> HandlerKind;

    /// Runtime filters applied before `filter_processor`; any match suffices.
    fn base_filter(&self) -> Vec<Value> {
        Vec::new()
    }

    fn validate_filter(&self, _filter: Option<&Map<String, Value>>) -> Result<(), IndexerError> {
        Ok(())
    }

    fn filter_processor(
        &self,
        _filter: Option<&Map<String, Value>>,
        _input: HandlerInput<'_>,
        _ds: &CustomDatasource,
    ) -> bool {
        true
    }

    /// Turn one matched input into the arguments the handler is invoked with.
    async fn transform(
        &self,
        input: HandlerInput<'_>,
        ds: &CustomDatasource,
        assets: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, IndexerError>;

    /// Dictionary entry narrowing the heights this handler needs, if expressible.
    fn dictionary_query(
        &self,
        _filter: Option<&Map<String, Value>>,
        _ds: &CustomDatasource,
    ) -> Option<QueryEntry> {
        None
    }
}

/// Processor for one custom datasource kind.
pub trait DsProcessor: Send + Sync {
    fn kind(&self) -> &str;

    fn validate(
        &self,
        _ds: &CustomDatasource,
        _assets: &BTreeMap<String, String>,
    ) -> Result<(), IndexerError> {
        Ok(())
    }

    /// Whether the datasource takes part in indexing at all.
    fn ds_filter(&self, _ds: &CustomDatasource) -> bool {
        true
    }

    fn handler_processor(&self, handler_kind: &str) -> Option<Arc<dyn HandlerProcessor>>;
}

/// Processors keyed by custom datasource kind.
#[derive(Default, Clone)]
pub struct DsProcessorRegistry {
    processors: HashMap<String, Arc<dyn DsProcessor>>,
}

impl DsProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn DsProcessor>) {
        self.processors.insert(processor.kind().to_string(), processor);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn DsProcessor>> {
        self.processors.get(kind)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Processor for `ds`, or a validation error if none is registered.
    pub fn for_ds(&self, ds: &CustomDatasource) -> Result<&Arc<dyn DsProcessor>, IndexerError> {
        self.get(&ds.kind).ok_or_else(|| {
            IndexerError::validation(format!(
                "ds kind ({}) not supported; no processor registered",
                ds.kind
            ))
        })
    }

    /// The handler processor for a custom handler kind of `ds`.
    pub fn handler_processor(
        &self,
        ds: &CustomDatasource,
        handler_kind: &str,
    ) -> Result<Arc<dyn HandlerProcessor>, IndexerError> {
        self.for_ds(ds)?.handler_processor(handler_kind).ok_or_else(|| {
            IndexerError::validation(format!(
                "ds kind {} does not support handler kind {handler_kind}",
                ds.kind
            ))
        })
    }

    /// Validate every custom datasource in `data_sources`, collecting all errors.
    pub fn validate_custom_ds<'a>(
        &self,
        data_sources: impl IntoIterator<Item = &'a ProjectDs>,
    ) -> Result<(), IndexerError> {
        let mut errors = Vec::new();
        for project_ds in data_sources {
            let Some(ds) = project_ds.ds.as_custom() else {
                continue;
            };
            let processor = match self.for_ds(ds) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };
            if let Err(e) = processor.validate(ds, &project_ds.assets) {
                errors.push(format!("{}: {e}", ds.kind));
            }
            for handler in &ds.mapping.handlers {
                match processor.handler_processor(&handler.kind) {
                    None => errors.push(format!(
                        "{}: handler kind {} is not supported",
                        ds.kind, handler.kind
                    )),
                    Some(hp) => {
                        if let Err(e) = hp.validate_filter(handler.filter.as_ref()) {
                            errors.push(format!("{}: {}: {e}", ds.kind, handler.handler));
                        }
                        for base in hp.base_filter() {
                            if let Err(e) = AnyFilter::decode(hp.base_handler_kind(), base) {
                                errors.push(format!("{}: {}: {e}", ds.kind, handler.kind));
                            }
                        }
                    }
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(IndexerError::Validation(errors))
        }
    }
}

impl std::fmt::Debug for DsProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.processors.keys().collect();
        kinds.sort();
        f.debug_struct("DsProcessorRegistry").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::{CustomHandler, CustomMapping, Datasource, ProcessorReference};
    use serde_json::json;

    /// Consumes transaction events and emits the event payload twice.
    pub(crate) struct EchoHandler;

    #[async_trait]
    impl HandlerProcessor for EchoHandler {
        fn base_handler_kind(&self) -> HandlerKind {
            HandlerKind::TransactionEvent
        }

        fn base_filter(&self) -> Vec<Value> {
            vec![json!({ "type": "Updated" })]
        }

        fn validate_filter(&self, filter: Option<&Map<String, Value>>) -> Result<(), IndexerError> {
            match filter {
                Some(f) if f.contains_key("bad") => Err(IndexerError::validation("bad filter")),
                _ => Ok(()),
            }
        }

        async fn transform(
            &self,
            input: HandlerInput<'_>,
            _ds: &CustomDatasource,
            _assets: &BTreeMap<String, String>,
        ) -> Result<Vec<Value>, IndexerError> {
            let v = input.to_value();
            Ok(vec![v.clone(), v])
        }
    }

    pub(crate) struct EchoProcessor;

    impl DsProcessor for EchoProcessor {
        fn kind(&self) -> &str {
            "concordium/Echo"
        }

        fn handler_processor(&self, handler_kind: &str) -> Option<Arc<dyn HandlerProcessor>> {
            (handler_kind == "echo/Event").then(|| Arc::new(EchoHandler) as Arc<dyn HandlerProcessor>)
        }
    }

    pub(crate) fn echo_ds(handler_kind: &str, filter: Option<Map<String, Value>>) -> ProjectDs {
        ProjectDs::new(Datasource::Custom(CustomDatasource {
            kind: "concordium/Echo".into(),
            start_block: Some(1),
            mapping: CustomMapping {
                file: "index.js".into(),
                handlers: vec![CustomHandler {
                    kind: handler_kind.into(),
                    handler: "handleEcho".into(),
                    filter,
                }],
            },
            assets: BTreeMap::new(),
            processor: ProcessorReference {
                file: "echo.js".into(),
                options: None,
            },
            options: None,
        }))
    }

    fn registry() -> DsProcessorRegistry {
        let mut registry = DsProcessorRegistry::new();
        registry.register(Arc::new(EchoProcessor));
        registry
    }

    #[test]
    fn validates_known_custom_ds() {
        assert!(registry().validate_custom_ds([&echo_ds("echo/Event", None)]).is_ok());
    }

    #[test]
    fn reports_unknown_kinds_and_bad_filters() {
        let mut bad = Map::new();
        bad.insert("bad".into(), json!(true));
        let err = registry()
            .validate_custom_ds([&echo_ds("echo/Nope", None), &echo_ds("echo/Event", Some(bad))])
            .unwrap_err();
        match err {
            IndexerError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {other}"),
        }

        let empty = DsProcessorRegistry::new();
        assert!(empty.validate_custom_ds([&echo_ds("echo/Event", None)]).is_err());
    }
}
