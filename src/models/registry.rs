// ARCHITECTURE: Framework Loader Registry
//
// DESIGN PHILOSOPHY:
// Framework dispatch is a lookup, not a match statement. Loaders register
// under a canonical tag plus aliases; the cache asks the registry for the
// loader of a version's framework tag and fails the load when none exists.
//
// KEY FEATURES:
// 1. RUNTIME REGISTRATION: loaders can be added after startup
// 2. ALIAS SUPPORT: "sklearn-linear" and "linear" reach the same loader
// 3. THREAD SAFETY: shared behind `Arc` across the cache's load tasks

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use super::{linear::LinearLoader, traits::FrameworkLoader, tree_ensemble::TreeEnsembleLoader};

/// Thread-safe framework loader registry
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: RwLock<HashMap<String, Arc<dyn FrameworkLoader>>>,
    aliases: RwLock<HashMap<String, String>>, // alias -> canonical tag
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every framework this crate ships.
    pub fn with_builtin_loaders() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(LinearLoader));
        registry.register(Arc::new(TreeEnsembleLoader));
        registry
    }

    pub fn register(&self, loader: Arc<dyn FrameworkLoader>) {
        let tag = loader.framework().to_ascii_lowercase();
        let alias_count = loader.aliases().len();
        {
            let mut aliases = self.aliases.write();
            for alias in loader.aliases() {
                aliases.insert(alias.to_ascii_lowercase(), tag.clone());
            }
        }
        self.loaders.write().insert(tag.clone(), loader);
        tracing::info!("📋 Registered framework loader: {} with {} aliases", tag, alias_count);
    }

    /// Loader for a framework tag or alias.
    pub fn resolve(&self, framework: &str) -> Option<Arc<dyn FrameworkLoader>> {
        let tag = framework.trim().to_ascii_lowercase();
        let loaders = self.loaders.read();
        if let Some(loader) = loaders.get(&tag) {
            return Some(Arc::clone(loader));
        }
        let canonical = self.aliases.read().get(&tag).cloned()?;
        loaders.get(&canonical).cloned()
    }

    pub fn is_supported(&self, framework: &str) -> bool {
        self.resolve(framework).is_some()
    }

    pub fn frameworks(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.loaders.read().keys().cloned().collect();
        tags.sort();
        tags
    }
}
