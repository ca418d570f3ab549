//! Runtime and custom datasources, and their templates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::handler::{CustomHandler, RuntimeHandler};

/// Kind of the built-in datasource.
pub const RUNTIME_KIND: &str = "concordium/Runtime";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileReference {
    pub file: String,
}

/// Contract hints attached to a datasource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// The processor file of a custom datasource plus its options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorReference {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeMapping {
    pub file: String,
    pub handlers: Vec<RuntimeHandler>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomMapping {
    pub file: String,
    pub handlers: Vec<CustomHandler>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDatasource {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    pub mapping: RuntimeMapping,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: BTreeMap<String, FileReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ProcessorOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomDatasource {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    pub mapping: CustomMapping,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: BTreeMap<String, FileReference>,
    pub processor: ProcessorReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ProcessorOptions>,
}

/// A datasource declared in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Datasource {
    Runtime(RuntimeDatasource),
    Custom(CustomDatasource),
}

impl Datasource {
    pub fn kind(&self) -> &str {
        match self {
            Self::Runtime(ds) => &ds.kind,
            Self::Custom(ds) => &ds.kind,
        }
    }

    pub fn start_block(&self) -> Option<u64> {
        match self {
            Self::Runtime(ds) => ds.start_block,
            Self::Custom(ds) => ds.start_block,
        }
    }

    pub fn set_start_block(&mut self, height: u64) {
        match self {
            Self::Runtime(ds) => ds.start_block = Some(height),
            Self::Custom(ds) => ds.start_block = Some(height),
        }
    }

    pub fn assets(&self) -> &BTreeMap<String, FileReference> {
        match self {
            Self::Runtime(ds) => &ds.assets,
            Self::Custom(ds) => &ds.assets,
        }
    }

    pub fn options(&self) -> Option<&ProcessorOptions> {
        match self {
            Self::Runtime(ds) => ds.options.as_ref(),
            Self::Custom(ds) => ds.options.as_ref(),
        }
    }

    pub fn handler_count(&self) -> usize {
        match self {
            Self::Runtime(ds) => ds.mapping.handlers.len(),
            Self::Custom(ds) => ds.mapping.handlers.len(),
        }
    }

    pub fn as_custom(&self) -> Option<&CustomDatasource> {
        match self {
            Self::Custom(ds) => Some(ds),
            Self::Runtime(_) => None,
        }
    }
}

/// A named datasource without a start block, instantiated at runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasourceTemplate {
    pub name: String,
    #[serde(flatten)]
    pub datasource: Datasource,
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawRuntime {
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    start_block: Option<u64>,
    mapping: RawRuntimeMapping,
    #[serde(default)]
    assets: BTreeMap<String, FileReference>,
    #[serde(default)]
    options: Option<ProcessorOptions>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRuntimeMapping {
    file: String,
    handlers: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawCustom {
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    start_block: Option<u64>,
    mapping: CustomMapping,
    #[serde(default)]
    assets: BTreeMap<String, FileReference>,
    #[serde(default)]
    processor: Option<ProcessorReference>,
    #[serde(default)]
    options: Option<ProcessorOptions>,
}

/// Strictly decode one datasource (or template when `template` is set).
///
/// Returns the template name alongside the datasource; every problem found is
/// pushed to `errors` prefixed with `label`.
pub(crate) fn decode_datasource(
    value: &Value,
    label: &str,
    template: bool,
    errors: &mut Vec<String>,
) -> Option<(Option<String>, Datasource)> {
    let kind = value.get("kind").and_then(Value::as_str);
    let decoded = match kind {
        None => {
            errors.push(format!("{label}: missing string 'kind'"));
            return None;
        }
        Some(RUNTIME_KIND) => decode_runtime(value.clone(), label, errors),
        Some(_) => decode_custom(value.clone(), label, errors),
    }?;

    let (name, ds) = decoded;
    match (&name, template) {
        (None, true) => {
            errors.push(format!("{label}: template is missing 'name'"));
            None
        }
        (Some(_), false) => {
            errors.push(format!("{label}: unknown field `name`"));
            None
        }
        _ => Some((name, ds)),
    }
}

fn decode_runtime(
    value: Value,
    label: &str,
    errors: &mut Vec<String>,
) -> Option<(Option<String>, Datasource)> {
    let raw: RawRuntime = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            errors.push(format!("{label}: failed to validate runtime datasource: {e}"));
            return None;
        }
    };

    let mut handlers = Vec::with_capacity(raw.mapping.handlers.len());
    let before = errors.len();
    for (i, handler) in raw.mapping.handlers.iter().enumerate() {
        match RuntimeHandler::decode(handler) {
            Ok(h) => handlers.push(h),
            Err(e) => errors.push(format!("{label}.mapping.handlers[{i}]: {e}")),
        }
    }
    if errors.len() > before {
        return None;
    }

    Some((
        raw.name,
        Datasource::Runtime(RuntimeDatasource {
            kind: raw.kind,
            start_block: raw.start_block,
            mapping: RuntimeMapping {
                file: raw.mapping.file,
                handlers,
            },
            assets: raw.assets,
            options: raw.options,
        }),
    ))
}

fn decode_custom(
    value: Value,
    label: &str,
    errors: &mut Vec<String>,
) -> Option<(Option<String>, Datasource)> {
    let raw: RawCustom = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            errors.push(format!("{label}: failed to validate custom datasource: {e}"));
            return None;
        }
    };
    let Some(processor) = raw.processor else {
        errors.push(format!(
            "{label}: custom datasource '{}' is missing a processor",
            raw.kind
        ));
        return None;
    };
    Some((
        raw.name,
        Datasource::Custom(CustomDatasource {
            kind: raw.kind,
            start_block: raw.start_block,
            mapping: raw.mapping,
            assets: raw.assets,
            processor,
            options: raw.options,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runtime_datasource_decodes() {
        let mut errors = Vec::new();
        let (name, ds) = decode_datasource(
            &json!({
                "kind": "concordium/Runtime",
                "startBlock": 100,
                "mapping": {
                    "file": "./dist/index.js",
                    "handlers": [{ "kind": "concordium/BlockHandler", "handler": "handleBlock" }],
                },
            }),
            "dataSources[0]",
            false,
            &mut errors,
        )
        .unwrap();
        assert!(errors.is_empty());
        assert!(name.is_none());
        assert_eq!(ds.start_block(), Some(100));
        assert_eq!(ds.handler_count(), 1);
    }

    #[test]
    fn custom_datasource_requires_processor() {
        let mut errors = Vec::new();
        let ds = decode_datasource(
            &json!({
                "kind": "concordium/Custom",
                "mapping": { "file": "index.js", "handlers": [] },
            }),
            "dataSources[0]",
            false,
            &mut errors,
        );
        assert!(ds.is_none());
        assert!(errors[0].contains("missing a processor"));
    }

    #[test]
    fn template_requires_name() {
        let mut errors = Vec::new();
        let raw = json!({
            "kind": "concordium/Runtime",
            "mapping": { "file": "index.js", "handlers": [] },
        });
        assert!(decode_datasource(&raw, "templates[0]", true, &mut errors).is_none());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn collects_every_handler_error() {
        let mut errors = Vec::new();
        decode_datasource(
            &json!({
                "kind": "concordium/Runtime",
                "mapping": {
                    "file": "index.js",
                    "handlers": [
                        { "kind": "concordium/Unknown", "handler": "a" },
                        { "kind": "concordium/BlockHandler", "handler": "b", "bogus": 1 },
                    ],
                },
            }),
            "dataSources[0]",
            false,
            &mut errors,
        );
        assert_eq!(errors.len(), 2);
    }
}
