//! Dynamic datasources: templates instantiated by handlers at runtime.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ccdindex_core::error::IndexerError;

use crate::manifest::{Datasource, ProcessorOptions};
use crate::processor::DsProcessorRegistry;
use crate::project::{ProjectDs, ProjectTemplate};

/// What a handler asked for when creating a datasource. Persisted so the set
/// can be rebuilt on restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceParams {
    pub template_name: String,
    pub start_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

/// Creates and remembers dynamic datasources.
#[derive(Debug, Clone)]
pub struct DynamicDsService {
    templates: Vec<Arc<ProjectTemplate>>,
    processors: Arc<DsProcessorRegistry>,
    params: Vec<DatasourceParams>,
    datasources: Vec<Arc<ProjectDs>>,
}

impl DynamicDsService {
    pub fn new(templates: Vec<Arc<ProjectTemplate>>, processors: Arc<DsProcessorRegistry>) -> Self {
        Self {
            templates,
            processors,
            params: Vec::new(),
            datasources: Vec::new(),
        }
    }

    /// Instantiate a template and add it to the dynamic set.
    pub fn create(&mut self, params: DatasourceParams) -> Result<Arc<ProjectDs>, IndexerError> {
        let ds = Arc::new(self.build(&params)?);
        tracing::info!(
            template = %params.template_name,
            start_block = params.start_block,
            "Created dynamic datasource"
        );
        self.params.push(params);
        self.datasources.push(ds.clone());
        Ok(ds)
    }

    /// Rebuild the dynamic set from persisted params.
    pub fn restore(&mut self, params: Vec<DatasourceParams>) -> Result<(), IndexerError> {
        self.params.clear();
        self.datasources.clear();
        for p in params {
            let ds = Arc::new(self.build(&p)?);
            self.params.push(p);
            self.datasources.push(ds);
        }
        Ok(())
    }

    pub fn datasources(&self) -> &[Arc<ProjectDs>] {
        &self.datasources
    }

    pub fn params(&self) -> &[DatasourceParams] {
        &self.params
    }

    /// Drop datasources created above `height`.
    pub fn reset_after(&mut self, height: u64) {
        let before = self.params.len();
        let (params, datasources): (Vec<_>, Vec<_>) = std::mem::take(&mut self.params)
            .into_iter()
            .zip(std::mem::take(&mut self.datasources))
            .filter(|(p, _)| p.start_block <= height)
            .unzip();
        self.params = params;
        self.datasources = datasources;
        let removed = before - self.params.len();
        if removed > 0 {
            tracing::info!(height, removed, "Removed dynamic datasources after rewind");
        }
    }

    fn build(&self, params: &DatasourceParams) -> Result<ProjectDs, IndexerError> {
        let template = self
            .templates
            .iter()
            .find(|t| t.name == params.template_name)
            .ok_or_else(|| {
                IndexerError::validation(format!(
                    "Unable to find matching template in project for name: \"{}\"",
                    params.template_name
                ))
            })?;

        let mut project_ds = template.ds.clone();
        project_ds.template_name = Some(template.name.clone());
        project_ds.ds.set_start_block(params.start_block);

        self.apply_args(&mut project_ds, params.args.as_ref())
            .map_err(|e| {
                IndexerError::validation(format!("Unable to create dynamic datasource.\n {e}"))
            })?;
        Ok(project_ds)
    }

    fn apply_args(
        &self,
        project_ds: &mut ProjectDs,
        args: Option<&Map<String, Value>>,
    ) -> Result<(), IndexerError> {
        match &mut project_ds.ds {
            Datasource::Custom(ds) => {
                if let Some(args) = args {
                    let options = ds.processor.options.get_or_insert_with(Map::new);
                    for (k, v) in args {
                        options.insert(k.clone(), v.clone());
                    }
                }
            }
            Datasource::Runtime(ds) => {
                if let Some(args) = args {
                    let current = ds.options.clone().unwrap_or_default();
                    let mut merged = match serde_json::to_value(current) {
                        Ok(Value::Object(m)) => m,
                        _ => Map::new(),
                    };
                    merged.extend(args.clone());
                    let options: ProcessorOptions = serde_json::from_value(Value::Object(merged))
                        .map_err(|e| IndexerError::validation(format!("Dynamic ds is invalid\n{e}")))?;
                    ds.options = Some(options);
                }
                return Ok(());
            }
        }
        self.processors
            .validate_custom_ds(std::iter::once(&*project_ds))
    }
}

/// Static datasources plus the dynamic ones created so far.
#[derive(Debug, Clone)]
pub struct DatasourceRegistry {
    static_ds: Vec<Arc<ProjectDs>>,
    dynamic: DynamicDsService,
}

impl DatasourceRegistry {
    pub fn new(static_ds: Vec<Arc<ProjectDs>>, dynamic: DynamicDsService) -> Self {
        Self { static_ds, dynamic }
    }

    /// Datasources in effect at `height`.
    pub fn active_at(&self, height: u64) -> Vec<Arc<ProjectDs>> {
        self.all()
            .filter(|ds| ds.start_height() <= height)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ProjectDs>> {
        self.static_ds.iter().chain(self.dynamic.datasources())
    }

    /// Lowest start height of any static datasource.
    pub fn start_height(&self) -> Option<u64> {
        self.static_ds.iter().map(|ds| ds.start_height()).min()
    }

    pub fn dynamic(&self) -> &DynamicDsService {
        &self.dynamic
    }

    pub fn dynamic_mut(&mut self) -> &mut DynamicDsService {
        &mut self.dynamic
    }
}
