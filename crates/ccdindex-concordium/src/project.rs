//! Project loading: a validated manifest plus everything it references.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Serialize;

use ccdindex_core::error::IndexerError;

use crate::manifest::{
    BypassBlock, Datasource, DatasourceTemplate, Endpoint, FileReference, NetworkConfig,
    ProjectManifest, RunnerSpecs,
};

/// Version of this engine, checked against the manifest's runner requirement.
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ─── Reader ───────────────────────────────────────────────────────────────────

/// Loads files referenced by a manifest (schema, assets, processors).
#[async_trait]
pub trait Reader: Send + Sync {
    async fn get_file(&self, path: &str) -> Result<String, IndexerError>;

    /// Project root, used as the project id when available.
    fn root(&self) -> Option<&str> {
        None
    }
}

/// Reads files relative to a local directory.
#[derive(Debug, Clone)]
pub struct LocalReader {
    root: PathBuf,
    root_str: String,
}

impl LocalReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_str = root.display().to_string();
        Self { root, root_str }
    }
}

#[async_trait]
impl Reader for LocalReader {
    async fn get_file(&self, path: &str) -> Result<String, IndexerError> {
        let full = self.root.join(path);
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| IndexerError::Other(format!("failed to read {}: {e}", full.display())))
    }

    fn root(&self) -> Option<&str> {
        Some(&self.root_str)
    }
}

// ─── Project ──────────────────────────────────────────────────────────────────

/// Network settings that replace the manifest's values when set.
#[derive(Debug, Clone, Default)]
pub struct NetworkOverrides {
    pub endpoint: Option<Vec<String>>,
    pub dictionary: Option<String>,
    pub chain_id: Option<String>,
    pub genesis_hash: Option<String>,
}

/// Network configuration after folding `genesisHash` into `chainId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNetwork {
    pub chain_id: String,
    pub endpoints: Vec<String>,
    pub dictionary: Option<String>,
    pub chaintypes: Option<FileReference>,
    pub bypass_blocks: Vec<BypassBlock>,
}

impl ResolvedNetwork {
    /// Every height listed in `bypassBlocks`.
    pub fn bypass_heights(&self) -> BTreeSet<u64> {
        self.bypass_blocks
            .iter()
            .filter_map(|b| b.bounds().ok())
            .flat_map(|(start, end)| start..=end)
            .collect()
    }
}

/// A datasource with its asset contents loaded. Templates instantiated at
/// runtime keep their template name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectDs {
    pub template_name: Option<String>,
    pub ds: Datasource,
    pub assets: BTreeMap<String, String>,
    /// Source of a custom datasource's processor file.
    pub processor_source: Option<String>,
}

impl ProjectDs {
    pub fn new(ds: Datasource) -> Self {
        Self {
            template_name: None,
            ds,
            assets: BTreeMap::new(),
            processor_source: None,
        }
    }

    /// Start block, defaulting to 1 when unset.
    pub fn start_height(&self) -> u64 {
        self.ds.start_block().unwrap_or(1)
    }
}

/// A loaded, validated project.
#[derive(Debug)]
pub struct Project {
    pub id: String,
    pub manifest: ProjectManifest,
    pub network: ResolvedNetwork,
    pub schema: String,
    pub data_sources: Vec<Arc<ProjectDs>>,
    pub templates: Vec<Arc<ProjectTemplate>>,
    pub runner: RunnerSpecs,
    deployment: OnceLock<String>,
}

/// A template with its asset contents loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectTemplate {
    pub name: String,
    pub ds: ProjectDs,
}

impl Project {
    /// Resolve a manifest into a project, reading referenced files through `reader`.
    pub async fn load(
        manifest: ProjectManifest,
        reader: &dyn Reader,
        path: &str,
        overrides: NetworkOverrides,
    ) -> Result<Self, IndexerError> {
        let network = resolve_network(&manifest.network, overrides)?;

        let schema = reader.get_file(&manifest.schema.file).await.map_err(|_| {
            IndexerError::Config(format!(
                "unable to fetch the schema from {}",
                manifest.schema.file
            ))
        })?;

        let mut data_sources = Vec::with_capacity(manifest.data_sources.len());
        for ds in &manifest.data_sources {
            data_sources.push(Arc::new(load_datasource(ds.clone(), None, reader).await?));
        }

        let mut templates = Vec::with_capacity(manifest.templates.len());
        for template in &manifest.templates {
            let ds =
                load_datasource(template.datasource.clone(), Some(&template.name), reader).await?;
            templates.push(Arc::new(ProjectTemplate {
                name: template.name.clone(),
                ds,
            }));
        }

        check_runner_version(&manifest.runner)?;

        let id = reader.root().unwrap_or(path).to_string();
        tracing::info!(
            id = %id,
            chain_id = %network.chain_id,
            data_sources = data_sources.len(),
            templates = templates.len(),
            "Project loaded"
        );

        Ok(Self {
            id,
            runner: manifest.runner.clone(),
            manifest,
            network,
            schema,
            data_sources,
            templates,
            deployment: OnceLock::new(),
        })
    }

    pub fn template(&self, name: &str) -> Option<&Arc<ProjectTemplate>> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// The deployment projection as YAML, computed once.
    pub fn deployment(&self) -> Result<&str, IndexerError> {
        if let Some(yaml) = self.deployment.get() {
            return Ok(yaml);
        }
        let yaml = to_deployment(&self.manifest, &self.network.chain_id)?;
        Ok(self.deployment.get_or_init(|| yaml))
    }
}

fn resolve_network(
    network: &NetworkConfig,
    overrides: NetworkOverrides,
) -> Result<ResolvedNetwork, IndexerError> {
    let endpoints = overrides
        .endpoint
        .or_else(|| network.endpoint.clone().map(Endpoint::into_vec))
        .unwrap_or_default();

    let chain_id = overrides.chain_id.or_else(|| network.chain_id.clone());
    let genesis_hash = overrides.genesis_hash.or_else(|| network.genesis_hash.clone());
    let chain_id = match (chain_id, genesis_hash) {
        (Some(_), Some(_)) => {
            return Err(IndexerError::Config(
                "Please only provide one of chainId and genesisHash".into(),
            ))
        }
        (Some(id), None) | (None, Some(id)) => id.trim().to_string(),
        (None, None) => {
            return Err(IndexerError::Config(
                "Network chainId or genesisHash must be provided".into(),
            ))
        }
    };

    if endpoints.is_empty() {
        return Err(IndexerError::Config(format!(
            "Network endpoint must be provided for network. chainId=\"{chain_id}\""
        )));
    }

    Ok(ResolvedNetwork {
        chain_id,
        endpoints,
        dictionary: overrides.dictionary.or_else(|| network.dictionary.clone()),
        chaintypes: network.chaintypes.clone(),
        bypass_blocks: network.bypass_blocks.clone().unwrap_or_default(),
    })
}

async fn load_datasource(
    ds: Datasource,
    template_name: Option<&str>,
    reader: &dyn Reader,
) -> Result<ProjectDs, IndexerError> {
    let mut assets = BTreeMap::new();
    for (name, file) in ds.assets() {
        let content = reader.get_file(&file.file).await.map_err(|_| {
            IndexerError::Config(format!("Failed to load datasource asset {}", file.file))
        })?;
        assets.insert(name.clone(), content);
    }

    let processor_source = match ds.as_custom() {
        Some(custom) => Some(reader.get_file(&custom.processor.file).await.map_err(|_| {
            IndexerError::Config(format!(
                "Failed to load datasource processor {}",
                custom.processor.file
            ))
        })?),
        None => None,
    };

    Ok(ProjectDs {
        template_name: template_name.map(str::to_string),
        ds,
        assets,
        processor_source,
    })
}

fn check_runner_version(runner: &RunnerSpecs) -> Result<(), IndexerError> {
    let required = semver::VersionReq::parse(&runner.node.version)
        .map_err(|e| IndexerError::validation(format!("invalid runner node version: {e}")))?;
    let current = semver::Version::parse(NODE_VERSION)
        .map_err(|e| IndexerError::Other(format!("invalid engine version: {e}")))?;
    if !required.matches(&current) {
        return Err(IndexerError::validation(format!(
            "Runner require node version {}, current node {NODE_VERSION}",
            runner.node.version
        )));
    }
    Ok(())
}

// ─── Deployment ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Deployment<'a> {
    spec_version: &'a str,
    network: DeploymentNetwork<'a>,
    runner: &'a RunnerSpecs,
    schema: &'a FileReference,
    data_sources: &'a [Datasource],
    #[serde(skip_serializing_if = "no_templates")]
    templates: &'a [DatasourceTemplate],
}

fn no_templates(templates: &&[DatasourceTemplate]) -> bool {
    templates.is_empty()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentNetwork<'a> {
    chain_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chaintypes: Option<&'a FileReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bypass_blocks: Option<&'a Vec<BypassBlock>>,
}

/// Render the deployment projection: network reduced to its chain id, no
/// endpoints or dictionary, no descriptive metadata.
pub fn to_deployment(manifest: &ProjectManifest, chain_id: &str) -> Result<String, IndexerError> {
    let deployment = Deployment {
        spec_version: &manifest.spec_version,
        network: DeploymentNetwork {
            chain_id,
            chaintypes: manifest.network.chaintypes.as_ref(),
            bypass_blocks: manifest.network.bypass_blocks.as_ref(),
        },
        runner: &manifest.runner,
        schema: &manifest.schema,
        data_sources: &manifest.data_sources,
        templates: &manifest.templates,
    };
    serde_yaml::to_string(&deployment)
        .map_err(|e| IndexerError::Other(format!("failed to render deployment: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct MapReader(pub HashMap<String, String>);

    #[async_trait]
    impl Reader for MapReader {
        async fn get_file(&self, path: &str) -> Result<String, IndexerError> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| IndexerError::Other(format!("no such file {path}")))
        }
    }

    const MANIFEST: &str = r#"
specVersion: "1.0.0"
schema:
  file: schema.graphql
network:
  genesisHash: "  genesis  "
  endpoint: http://node:20000
runner:
  node:
    name: "@subql/node-concordium"
    version: ">=0.1.0"
  query:
    name: "@subql/query"
    version: "*"
dataSources:
  - kind: concordium/Runtime
    startBlock: 5
    assets:
      Pool:
        file: pool.json
    mapping:
      file: index.js
      handlers:
        - kind: concordium/TransactionHandler
          handler: handleTx
          filter:
            type: accountTransaction
templates:
  - name: Pool
    kind: concordium/Runtime
    options:
      abi: Pool
    mapping:
      file: index.js
      handlers:
        - kind: concordium/BlockHandler
          handler: handlePoolBlock
"#;

    fn reader() -> MapReader {
        MapReader(HashMap::from([
            ("schema.graphql".to_string(), "type A @entity { id: ID! }".to_string()),
            ("pool.json".to_string(), "{}".to_string()),
        ]))
    }

    #[tokio::test]
    async fn folds_genesis_hash_into_chain_id() {
        let manifest = ProjectManifest::from_yaml(MANIFEST).unwrap();
        let project = Project::load(manifest, &reader(), "p", NetworkOverrides::default())
            .await
            .unwrap();
        assert_eq!(project.network.chain_id, "genesis");
        assert_eq!(project.network.endpoints, vec!["http://node:20000".to_string()]);
        assert_eq!(project.data_sources[0].assets["Pool"], "{}");
        assert_eq!(project.id, "p");
    }

    #[tokio::test]
    async fn rejects_chain_id_and_genesis_hash() {
        let manifest = ProjectManifest::from_yaml(MANIFEST).unwrap();
        let overrides = NetworkOverrides {
            chain_id: Some("x".into()),
            ..Default::default()
        };
        let err = Project::load(manifest, &reader(), "p", overrides).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config error: Please only provide one of chainId and genesisHash"
        );
    }

    #[tokio::test]
    async fn missing_schema_names_the_file() {
        let manifest = ProjectManifest::from_yaml(MANIFEST).unwrap();
        let empty = MapReader(HashMap::new());
        let err = Project::load(manifest, &empty, "p", NetworkOverrides::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unable to fetch the schema from schema.graphql"));
    }

    #[tokio::test]
    async fn missing_endpoint_is_a_config_error() {
        let raw = MANIFEST.replace("  endpoint: http://node:20000\n", "");
        let manifest = ProjectManifest::from_yaml(&raw).unwrap();
        let err = Project::load(manifest, &reader(), "p", NetworkOverrides::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Network endpoint must be provided"));
    }

    #[tokio::test]
    async fn runner_version_mismatch() {
        let raw = MANIFEST.replace(">=0.1.0", ">=99.0.0");
        let manifest = ProjectManifest::from_yaml(&raw).unwrap();
        let err = Project::load(manifest, &reader(), "p", NetworkOverrides::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Runner require node version"));
    }

    #[tokio::test]
    async fn deployment_keeps_templates_and_drops_endpoints() {
        let manifest = ProjectManifest::from_yaml(MANIFEST).unwrap();
        let project = Project::load(manifest, &reader(), "p", NetworkOverrides::default())
            .await
            .unwrap();
        let yaml = project.deployment().unwrap();
        assert!(yaml.contains("name: Pool"));
        assert!(yaml.contains("abi: Pool"));
        assert!(yaml.contains("chainId:"));
        assert!(!yaml.contains("endpoint"));
        assert!(std::ptr::eq(yaml, project.deployment().unwrap()));
    }
}
