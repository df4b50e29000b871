// Deployments as the request path sees them. Lookup lives behind
// `DeploymentResolver`; this crate never owns the relational store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schema::ModelSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Active,
    Pending,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub status: DeploymentStatus,
    pub model_version_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
    pub model_name: String,
    pub version: String,
    pub framework: String,
    #[serde(default)]
    pub model_schema: Option<ModelSchema>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_request_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn is_active(&self) -> bool {
        self.status == DeploymentStatus::Active
    }
}

#[async_trait]
pub trait DeploymentResolver: Send + Sync {
    /// Look a deployment up by id or by name. `Ok(None)` when neither matches.
    async fn resolve(&self, name_or_id: &str) -> Result<Option<Deployment>>;

    /// Note that a request was served. Best effort.
    async fn record_request(&self, _deployment_id: &str, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}
