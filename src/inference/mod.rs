pub mod deployment;
pub mod orchestrator;
pub mod preprocessing;
pub mod response_cache;
pub mod schema;
pub mod types;

pub use deployment::{Deployment, DeploymentResolver, DeploymentStatus};
pub use orchestrator::{InferenceOrchestrator, OrchestratorConfig, RequestStage};
pub use preprocessing::{Encoding, PreprocessingSpec, Scaling};
pub use response_cache::ResponseCache;
pub use schema::{FeatureSpec, FeatureType, InputSchema, InstanceValidator, ModelSchema, OutputSchema};
pub use types::{
    BatchMetadata, BatchPredictionRequest, BatchPredictionResponse, DeploymentHealth,
    HealthStatus, ModelInfo, PredictionMetadata, PredictionRequest, PredictionResponse,
    PredictionResult, SchemaResponse,
};
