//! Versioned project manifest: strict decoding and validation.
//!
//! The manifest is decoded from YAML (or JSON) into a generic value first, then
//! every section is decoded strictly: unknown keys are rejected, handler filters
//! are decoded according to the handler kind, and all problems found are
//! reported together as [`IndexerError::Validation`].

pub mod datasource;
pub mod handler;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ccdindex_core::error::IndexerError;

pub use datasource::{
    CustomDatasource, CustomMapping, Datasource, DatasourceTemplate, FileReference,
    ProcessorOptions, ProcessorReference, RuntimeDatasource, RuntimeMapping, RUNTIME_KIND,
};
pub use handler::{
    AnyFilter, BlockFilter, CustomHandler, HandlerKind, HandlerSpec, RuntimeHandler,
    SpecialEventFilter, TransactionEventFilter, TransactionFilter,
};

/// The only supported manifest version.
pub const SPEC_VERSION: &str = "1.0.0";

/// Runner node name a manifest must declare.
pub const NODE_NAME: &str = "@subql/node-concordium";

// ─── Network ──────────────────────────────────────────────────────────────────

/// One endpoint or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    One(String),
    Many(Vec<String>),
}

impl Endpoint {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(e) => vec![e],
            Self::Many(es) => es,
        }
    }
}

/// A height (`123`) or inclusive range (`"100-200"`) that must not be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BypassBlock {
    Height(u64),
    Range(String),
}

impl BypassBlock {
    /// The inclusive height range this entry covers.
    pub fn bounds(&self) -> Result<(u64, u64), String> {
        match self {
            Self::Height(h) => Ok((*h, *h)),
            Self::Range(r) => {
                let (start, end) = r
                    .split_once('-')
                    .ok_or_else(|| format!("bypass block range '{r}' must look like 'start-end'"))?;
                let parse = |s: &str| {
                    s.trim()
                        .parse::<u64>()
                        .map_err(|_| format!("bypass block range '{r}' is not numeric"))
                };
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("bypass block range '{r}' is reversed"));
                }
                Ok((start, end))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaintypes: Option<FileReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_blocks: Option<Vec<BypassBlock>>,
}

// ─── Runner ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerNode {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerQuery {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSpecs {
    pub node: RunnerNode,
    pub query: RunnerQuery,
}

// ─── Manifest ─────────────────────────────────────────────────────────────────

/// A validated v1.0.0 project manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectManifest {
    pub spec_version: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub repository: Option<String>,
    pub schema: FileReference,
    pub network: NetworkConfig,
    pub runner: RunnerSpecs,
    pub data_sources: Vec<Datasource>,
    pub templates: Vec<DatasourceTemplate>,
    pub parent: Option<Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawManifest {
    spec_version: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    repository: Option<String>,
    schema: FileReference,
    network: NetworkConfig,
    runner: RunnerSpecs,
    data_sources: Vec<Value>,
    #[serde(default)]
    templates: Vec<Value>,
    #[serde(default)]
    parent: Option<Value>,
}

impl ProjectManifest {
    /// Parse a YAML (or JSON) manifest document.
    pub fn from_yaml(raw: &str) -> Result<Self, IndexerError> {
        let value: Value = serde_yaml::from_str(raw)
            .map_err(|e| IndexerError::validation(format!("manifest is not valid YAML: {e}")))?;
        Self::parse(value)
    }

    /// Validate a generic manifest value.
    pub fn parse(raw: Value) -> Result<Self, IndexerError> {
        if let Some(version) = raw.get("specVersion").and_then(Value::as_str) {
            if version != SPEC_VERSION {
                return Err(IndexerError::validation(format!(
                    "Manifest specVersion {version} is not supported"
                )));
            }
        }

        let raw: RawManifest = serde_json::from_value(raw)
            .map_err(|e| IndexerError::validation(format!("failed to validate manifest: {e}")))?;

        let mut errors = Vec::new();

        if raw.runner.node.name != NODE_NAME {
            errors.push(format!(
                "Runner node name incorrect, expected '{NODE_NAME}', got '{}'",
                raw.runner.node.name
            ));
        }
        if let Err(e) = semver::VersionReq::parse(&raw.runner.node.version) {
            errors.push(format!(
                "Runner node version '{}' is not a valid version requirement: {e}",
                raw.runner.node.version
            ));
        }
        for entry in raw.network.bypass_blocks.iter().flatten() {
            if let Err(e) = entry.bounds() {
                errors.push(format!("network.bypassBlocks: {e}"));
            }
        }
        if let Some(chain_id) = &raw.network.chain_id {
            if chain_id.trim().is_empty() {
                errors.push("network.chainId must not be empty".to_string());
            }
        }

        let data_sources = raw
            .data_sources
            .iter()
            .enumerate()
            .filter_map(|(i, ds)| {
                datasource::decode_datasource(ds, &format!("dataSources[{i}]"), false, &mut errors)
                    .map(|(_, ds)| ds)
            })
            .collect();

        let templates = raw
            .templates
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                datasource::decode_datasource(t, &format!("templates[{i}]"), true, &mut errors)
                    .and_then(|(name, datasource)| {
                        name.map(|name| DatasourceTemplate { name, datasource })
                    })
            })
            .collect();

        if !errors.is_empty() {
            return Err(IndexerError::Validation(errors));
        }

        let mut network = raw.network;
        if let Some(chain_id) = network.chain_id.as_mut() {
            *chain_id = chain_id.trim().to_string();
        }

        Ok(Self {
            spec_version: raw.spec_version,
            name: raw.name,
            version: raw.version,
            description: raw.description,
            repository: raw.repository,
            schema: raw.schema,
            network,
            runner: raw.runner,
            data_sources,
            templates,
            parent: raw.parent,
        })
    }

    pub fn template(&self, name: &str) -> Option<&DatasourceTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
specVersion: "1.0.0"
name: test
schema:
  file: ./schema.graphql
network:
  chainId: abc
  endpoint: http://node:20000
runner:
  node:
    name: "@subql/node-concordium"
    version: "*"
  query:
    name: "@subql/query"
    version: "*"
dataSources:
  - kind: concordium/Runtime
    startBlock: 1
    mapping:
      file: ./dist/index.js
      handlers:
        - kind: concordium/BlockHandler
          handler: handleBlock
"#;

    #[test]
    fn parses_minimal_manifest() {
        let manifest = ProjectManifest::from_yaml(MINIMAL).unwrap();
        assert_eq!(manifest.data_sources.len(), 1);
        assert_eq!(manifest.network.chain_id.as_deref(), Some("abc"));
        assert!(manifest.templates.is_empty());
    }

    #[test]
    fn rejects_unsupported_version() {
        let raw = MINIMAL.replace("\"1.0.0\"", "\"0.2.0\"");
        let err = ProjectManifest::from_yaml(&raw).unwrap_err();
        assert!(err.to_string().contains("specVersion 0.2.0 is not supported"));
    }

    #[test]
    fn rejects_wrong_runner_node() {
        let raw = MINIMAL.replace("@subql/node-concordium", "@subql/node");
        let err = ProjectManifest::from_yaml(&raw).unwrap_err();
        assert!(err.to_string().contains("Runner node name incorrect"));
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let raw = format!("{MINIMAL}extra: 1\n");
        assert!(ProjectManifest::from_yaml(&raw).is_err());
    }

    #[test]
    fn bypass_block_bounds() {
        assert_eq!(BypassBlock::Height(5).bounds().unwrap(), (5, 5));
        assert_eq!(BypassBlock::Range("10-20".into()).bounds().unwrap(), (10, 20));
        assert!(BypassBlock::Range("20-10".into()).bounds().is_err());
        assert!(BypassBlock::Range("x".into()).bounds().is_err());
    }
}
