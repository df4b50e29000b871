// ARCHITECTURE: Security Module - Admission Control for the Inference Path
//
// DESIGN PHILOSOPHY:
// 1. RATE LIMITING: exact sliding windows per client over a pluggable backend
// 2. POLICY LAYERING: defaults, deployment and client overrides, then tiers
// 3. CALLER IDENTITY: API key digests and forwarded permission sets
//
// PRODUCTION REQUIREMENTS MET:
// ✅ Per-client limits with minute, hour and day windows
// ✅ Separate batch frequency and volume budgets
// ✅ Fail-open when the limiter backend is degraded

pub mod identity;
pub mod policy;
pub mod rate_limiter;
pub mod store;

pub use identity::{CallerContext, Permission};
pub use policy::{
    BatchLimitOverrides, BatchLimits, EndpointClass, LimitOverrides, RateLimitPolicy, RateWindow,
    Tier, ANONYMOUS_CLIENT,
};
pub use rate_limiter::{
    RateLimitResult, RateLimiter, RateLimiterConfig, RateLimiterMetrics, ViolationSummary,
    WindowStatus,
};
pub use store::{
    LimiterBackendError, MemoryRateLimitStore, RateLimitStore, RateLimitViolation, WindowUsage,
};
