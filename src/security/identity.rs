// Caller identity as seen by the inference core. Token issuance and
// verification live upstream; this module only reads what the gateway
// forwarded and derives a stable, non-reversible client id from it.

use std::{collections::HashSet, convert::Infallible, str::FromStr};

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use serde::{Deserialize, Serialize};

use super::policy::ANONYMOUS_CLIENT;
use crate::error::{Error, Result};

pub const PERMISSIONS_HEADER: &str = "x-permissions";

// PERMISSIONS: Permission - Endpoint Classes a Caller May Use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Inference,      // Single predictions
    BatchInference, // Batch predictions
    Health,         // Deployment health probes
    Schema,         // Schema introspection
    Admin,          // Rate limit and cache administration
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inference" => Ok(Permission::Inference),
            "batch_inference" => Ok(Permission::BatchInference),
            "health" => Ok(Permission::Health),
            "schema" => Ok(Permission::Schema),
            "admin" => Ok(Permission::Admin),
            other => Err(format!("unknown permission '{other}'")),
        }
    }
}

/// Who is calling and what they may do. `permissions: None` means the
/// upstream auth layer attached no restriction on the request path; `Admin`
/// is only ever granted by an explicit permission list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerContext {
    pub client_id: Option<String>,
    pub permissions: Option<HashSet<Permission>>,
}

impl CallerContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn identified(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions = Some(permissions.into_iter().collect());
        self
    }

    /// Client id used for rate limiting.
    pub fn rate_limit_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(ANONYMOUS_CLIENT)
    }

    pub fn is_anonymous(&self) -> bool {
        self.client_id.is_none()
    }

    pub fn require(&self, permission: Permission) -> Result<()> {
        let granted = match &self.permissions {
            Some(granted) => granted.contains(&permission),
            None => permission != Permission::Admin,
        };
        if granted {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "caller lacks the {permission:?} permission"
            )))
        }
    }

    /// Read `Authorization: Bearer <key>` or `X-API-Key`, plus an optional
    /// comma-separated `X-Permissions` list.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let api_key = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
            .map(str::trim)
            .filter(|key| !key.is_empty());

        let permissions = headers
            .get(PERMISSIONS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|list| {
                list.split(',')
                    .filter_map(|p| p.parse::<Permission>().ok())
                    .collect::<HashSet<_>>()
            });

        Self {
            client_id: api_key.map(client_id_for_key),
            permissions,
        }
    }
}

// Keys never appear in counters or logs; only a short digest does.
fn client_id_for_key(api_key: &str) -> String {
    let digest = blake3::hash(api_key.as_bytes()).to_hex();
    format!("key_{}", &digest.as_str()[..16])
}

impl<S: Send + Sync> FromRequestParts<S> for CallerContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
