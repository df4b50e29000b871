// Rate-limit policy model: windows, tiers, override scopes and the merge that
// turns raw inputs into the effective per-window limits for one check.
//
// Merge precedence, lowest first:
//   hardcoded defaults < deployment-wide overrides < client overrides
//   (client-wide, then client+deployment) < tier limits (identified clients only)

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

/// Client id used when the caller carries no identity.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Trailing windows the limiter counts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RateWindow {
    #[serde(rename = "requests_per_minute")]
    PerMinute,
    #[serde(rename = "requests_per_hour")]
    PerHour,
    #[serde(rename = "requests_per_day")]
    PerDay,
}

impl RateWindow {
    pub const ALL: [RateWindow; 3] = [RateWindow::PerMinute, RateWindow::PerHour, RateWindow::PerDay];

    pub fn duration(self) -> Duration {
        match self {
            RateWindow::PerMinute => Duration::from_secs(60),
            RateWindow::PerHour => Duration::from_secs(3_600),
            RateWindow::PerDay => Duration::from_secs(86_400),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RateWindow::PerMinute => "requests_per_minute",
            RateWindow::PerHour => "requests_per_hour",
            RateWindow::PerDay => "requests_per_day",
        }
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw per-window overrides as stored by the admin operations. A value `<= 0`
/// disables the window.
pub type LimitOverrides = BTreeMap<RateWindow, i64>;

/// Request classes with separate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Inference,
    BatchInference,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Inference => "inference",
            EndpointClass::BatchInference => "batch_inference",
        }
    }
}

/// Subscription tier assigned to an identified client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Built-in limits per tier (minute / hour / day).
    pub fn default_limits(self) -> LimitOverrides {
        let (minute, hour, day) = match self {
            Tier::Free => (10, 100, 1_000),
            Tier::Basic => (60, 1_000, 10_000),
            Tier::Pro => (300, 5_000, 50_000),
            Tier::Enterprise => (1_000, 20_000, 200_000),
        };
        BTreeMap::from([
            (RateWindow::PerMinute, minute),
            (RateWindow::PerHour, hour),
            (RateWindow::PerDay, day),
        ])
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Where a custom override applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideScope {
    Client {
        client_id: String,
        deployment_id: Option<String>,
    },
    Deployment {
        deployment_id: String,
    },
}

/// Which family of limits an override belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    Regular,
    Batch,
}

impl OverrideScope {
    pub fn client(client_id: impl Into<String>, deployment_id: Option<&str>) -> Self {
        OverrideScope::Client {
            client_id: client_id.into(),
            deployment_id: deployment_id.map(str::to_string),
        }
    }

    pub fn deployment(deployment_id: impl Into<String>) -> Self {
        OverrideScope::Deployment {
            deployment_id: deployment_id.into(),
        }
    }

    /// Storage key in the configuration store.
    pub fn storage_key(&self, kind: OverrideKind) -> String {
        let kind = match kind {
            OverrideKind::Regular => "regular",
            OverrideKind::Batch => "batch",
        };
        match self {
            OverrideScope::Client {
                client_id,
                deployment_id: Some(deployment_id),
            } => format!("custom_limits:{kind}:client:{client_id}:{deployment_id}"),
            OverrideScope::Client {
                client_id,
                deployment_id: None,
            } => format!("custom_limits:{kind}:client:{client_id}"),
            OverrideScope::Deployment { deployment_id } => {
                format!("custom_limits:{kind}:deployment:{deployment_id}")
            }
        }
    }
}

pub fn tier_key(client_id: &str) -> String {
    format!("api_key_tier:{client_id}")
}

/// Key of one sliding-window counter.
pub fn counter_key(client_id: &str, scope: &str, window: &str) -> String {
    format!("{}{scope}:{window}", client_counter_prefix(client_id))
}

/// Prefix shared by every counter belonging to a client. The id is escaped so
/// it never contains `:`, and one client's prefix cannot match another's keys.
pub fn client_counter_prefix(client_id: &str) -> String {
    format!("rate_limit:{}:", escape_key_segment(client_id))
}

fn escape_key_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3A")
}

/// Effective limits for one check. Built fresh on every call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitPolicy {
    limits: BTreeMap<RateWindow, i64>,
}

impl RateLimitPolicy {
    pub fn new(defaults: &LimitOverrides) -> Self {
        let mut limits = BTreeMap::new();
        for window in RateWindow::ALL {
            limits.insert(window, defaults.get(&window).copied().unwrap_or(0));
        }
        Self { limits }
    }

    /// Layer overrides on top; later calls win.
    pub fn apply(&mut self, overrides: &LimitOverrides) {
        for (window, limit) in overrides {
            self.limits.insert(*window, *limit);
        }
    }

    pub fn limit(&self, window: RateWindow) -> i64 {
        self.limits.get(&window).copied().unwrap_or(0)
    }

    /// Windows with a positive limit; all others are unlimited and skipped.
    pub fn active_windows(&self) -> impl Iterator<Item = (RateWindow, u64)> + '_ {
        self.limits
            .iter()
            .filter(|(_, limit)| **limit > 0)
            .map(|(window, limit)| (*window, *limit as u64))
    }
}

/// Limits for the batch endpoint's dedicated windows (both per minute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub batch_requests_per_minute: i64,
    pub batch_instances_per_minute: i64,
}

/// Partial batch override as stored by the admin API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_requests_per_minute: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_instances_per_minute: Option<i64>,
}

impl BatchLimits {
    pub fn apply(&mut self, overrides: &BatchLimitOverrides) {
        if let Some(requests) = overrides.batch_requests_per_minute {
            self.batch_requests_per_minute = requests;
        }
        if let Some(instances) = overrides.batch_instances_per_minute {
            self.batch_instances_per_minute = instances;
        }
    }
}
