pub mod artifact;
pub mod cache;
pub mod linear;
pub mod registry;
pub mod traits;
pub mod tree_ensemble;

pub use artifact::{Artifact, ArtifactStore, FsArtifactStore, ModelVersionRecord, ModelVersionSource};
pub use cache::{
    CacheStats, LoadedModelInfo, MemoryUsage, ModelCache, ModelCacheConfig, ModelLease,
};
pub use linear::{LinearLoader, LinearModel};
pub use registry::LoaderRegistry;
pub use traits::{
    BoxedPredictor, FeatureRow, FrameworkLoader, Predictor, PredictorInfo, RawPrediction,
};
pub use tree_ensemble::{TreeEnsemble, TreeEnsembleLoader};
