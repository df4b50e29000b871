// File-backed catalog of deployments and model versions for running the
// service standalone. Implements both lookup contracts the core consumes.
//
// {
//   "artifact_root": "models",
//   "model_versions": [{"id": "...", "framework": "linear", "artifact_path": "fraud.json"}],
//   "deployments": [{"id": "...", "name": "fraud-v1", "status": "active", ...}]
// }

use std::{collections::HashMap, path::Path};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::{
    inference::{Deployment, DeploymentResolver},
    models::{ModelVersionRecord, ModelVersionSource},
};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    artifact_root: Option<String>,
    #[serde(default)]
    model_versions: Vec<ModelVersionRecord>,
    #[serde(default)]
    deployments: Vec<Deployment>,
}

pub struct Catalog {
    artifact_root: Option<String>,
    versions: HashMap<String, ModelVersionRecord>,
    deployments: RwLock<HashMap<String, Deployment>>,
}

impl Catalog {
    pub fn new(versions: Vec<ModelVersionRecord>, deployments: Vec<Deployment>) -> Result<Self> {
        let versions: HashMap<_, _> = versions.into_iter().map(|v| (v.id.clone(), v)).collect();
        let mut by_id = HashMap::new();
        for deployment in deployments {
            if !versions.contains_key(&deployment.model_version_id) {
                bail!(
                    "deployment {} references unknown model version {}",
                    deployment.id,
                    deployment.model_version_id
                );
            }
            if by_id.insert(deployment.id.clone(), deployment).is_some() {
                bail!("duplicate deployment id in catalog");
            }
        }
        Ok(Self {
            artifact_root: None,
            versions,
            deployments: RwLock::new(by_id),
        })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let file: CatalogFile = serde_json::from_slice(&raw)
            .with_context(|| format!("catalog {} is not valid JSON", path.display()))?;

        let mut catalog = Self::new(file.model_versions, file.deployments)?;
        // Relative artifact roots are resolved against the catalog's directory.
        catalog.artifact_root = file.artifact_root.map(|root| {
            let root = Path::new(&root);
            if root.is_relative() {
                path.parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(root)
                    .to_string_lossy()
                    .into_owned()
            } else {
                root.to_string_lossy().into_owned()
            }
        });

        info!(
            deployments = catalog.deployments.read().len(),
            model_versions = catalog.versions.len(),
            "📚 Catalog loaded from {}",
            path.display()
        );
        Ok(catalog)
    }

    pub fn artifact_root(&self) -> Option<&str> {
        self.artifact_root.as_deref()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        let mut deployments: Vec<_> = self.deployments.read().values().cloned().collect();
        deployments.sort_by(|a, b| a.name.cmp(&b.name));
        deployments
    }
}

#[async_trait]
impl DeploymentResolver for Catalog {
    async fn resolve(&self, name_or_id: &str) -> Result<Option<Deployment>> {
        let deployments = self.deployments.read();
        Ok(deployments
            .get(name_or_id)
            .or_else(|| deployments.values().find(|d| d.name == name_or_id))
            .cloned())
    }

    async fn record_request(&self, deployment_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(deployment) = self.deployments.write().get_mut(deployment_id) {
            deployment.last_request_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl ModelVersionSource for Catalog {
    async fn model_version(&self, id: &str) -> Result<Option<ModelVersionRecord>> {
        Ok(self.versions.get(id).cloned())
    }
}
