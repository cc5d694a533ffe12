//! Discovers and hot-reloads the set of available arbitration strategies (C7).
//!
//! Safe Rust cannot dynamically `dlopen` a `strategy_*.py`-style file the way
//! the original plugin loader did, so "discovery" here means: scan a
//! directory for `strategy_*.toml` manifests (`strategy_name =
//! "majority_vote"`) and bind each manifest to one of the statically-linked
//! strategies in
//! [`crate::collabmesh::arbitration::strategies`]. Directory layout and the
//! atomic-reload contract are preserved; dynamic code loading is not.
//!
//! Registration is first-wins: a later manifest naming an already-registered
//! strategy name is skipped with a warning, reversing the original
//! last-wins `self.strategies[name] = strategy` overwrite behavior.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::collabmesh::arbitration::strategies::{
    ArbitrationStrategy, ConfidenceWeight, CostAware, HybridScore, LatencyAware, MajorityVote, MetaEvaluator,
    RecencyBias,
};

#[derive(Debug, Deserialize)]
struct StrategyManifest {
    strategy_name: String,
}

fn builtin(name: &str) -> Option<Arc<dyn ArbitrationStrategy>> {
    let strategy: Arc<dyn ArbitrationStrategy> = match name {
        "majority_vote" => Arc::new(MajorityVote),
        "confidence_weight" => Arc::new(ConfidenceWeight),
        "recency_bias" => Arc::new(RecencyBias),
        "cost_aware" => Arc::new(CostAware),
        "latency_aware" => Arc::new(LatencyAware),
        "hybrid_score" => Arc::new(HybridScore),
        "meta_evaluator" => Arc::new(MetaEvaluator::new()),
        _ => return None,
    };
    Some(strategy)
}

type StrategyMap = HashMap<String, Arc<dyn ArbitrationStrategy>>;

/// Hot-reloadable registry of named arbitration strategies.
pub struct ArbitrationLoader {
    plugins_dir: Option<PathBuf>,
    strategies: RwLock<Arc<StrategyMap>>,
}

impl ArbitrationLoader {
    /// Build a loader with all six built-in strategies plus `meta_evaluator`
    /// pre-registered, with no plugin directory to scan.
    pub fn with_builtins() -> Self {
        let mut map: StrategyMap = HashMap::new();
        for name in [
            "majority_vote",
            "confidence_weight",
            "recency_bias",
            "cost_aware",
            "latency_aware",
            "hybrid_score",
            "meta_evaluator",
        ] {
            map.insert(name.to_string(), builtin(name).unwrap());
        }
        ArbitrationLoader {
            plugins_dir: None,
            strategies: RwLock::new(Arc::new(map)),
        }
    }

    /// Build a loader that additionally scans `plugins_dir` for manifests on
    /// every [`ArbitrationLoader::reload`].
    pub fn with_plugins_dir<P: AsRef<Path>>(plugins_dir: P) -> Self {
        let mut loader = Self::with_builtins();
        loader.plugins_dir = Some(plugins_dir.as_ref().to_path_buf());
        loader
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ArbitrationStrategy>> {
        self.strategies.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        self.strategies.read().await.keys().cloned().collect()
    }

    /// Register or replace one strategy directly (used by tests and callers
    /// embedding custom strategies without a manifest file).
    pub async fn register(&self, name: &str, strategy: Arc<dyn ArbitrationStrategy>) {
        let mut guard = self.strategies.write().await;
        let mut next = (**guard).clone();
        next.insert(name.to_string(), strategy);
        *guard = Arc::new(next);
    }

    /// Rescan `plugins_dir` (if configured), first-wins on name collisions
    /// against the current snapshot. No-ops if no directory was configured.
    pub async fn reload(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let Some(dir) = &self.plugins_dir else {
            return warnings;
        };
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warnings.push(format!("could not read plugins dir {}: {}", dir.display(), e));
                return warnings;
            }
        };

        let mut next: StrategyMap = (**self.strategies.read().await).clone();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let stem_matches = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(false, |s| s.starts_with("strategy_"));
            if !stem_matches {
                continue;
            }
            let manifest = match fs::read_to_string(&path).ok().and_then(|s| toml::from_str::<StrategyManifest>(&s).ok()) {
                Some(m) => m,
                None => {
                    warnings.push(format!("invalid manifest: {}", path.display()));
                    continue;
                }
            };
            if next.contains_key(&manifest.strategy_name) {
                warnings.push(format!(
                    "duplicate strategy name {} from {}, keeping first registration",
                    manifest.strategy_name,
                    path.display()
                ));
                continue;
            }
            match builtin(&manifest.strategy_name) {
                Some(strategy) => {
                    next.insert(manifest.strategy_name, strategy);
                }
                None => warnings.push(format!("unknown strategy {} in {}", manifest.strategy_name, path.display())),
            }
        }

        *self.strategies.write().await = Arc::new(next);
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builtins_are_all_registered() {
        let loader = ArbitrationLoader::with_builtins();
        assert!(loader.get("majority_vote").await.is_some());
        assert!(loader.get("meta_evaluator").await.is_some());
        assert!(loader.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn reload_skips_duplicate_manifest_names_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("strategy_a_hybrid.toml"), "strategy_name = \"hybrid_score\"\n").unwrap();
        // Already present from with_builtins(); a second manifest naming the
        // same strategy should be skipped rather than overwrite it.
        fs::write(dir.path().join("strategy_b_hybrid.toml"), "strategy_name = \"hybrid_score\"\n").unwrap();
        let loader = ArbitrationLoader::with_plugins_dir(dir.path());
        let warnings = loader.reload().await;
        assert!(warnings.iter().any(|w| w.contains("duplicate")));
        assert!(loader.get("hybrid_score").await.is_some());
    }

    #[tokio::test]
    async fn reload_skips_manifests_without_the_strategy_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hybrid.toml"), "strategy_name = \"hybrid_score\"\n").unwrap();
        let loader = ArbitrationLoader::with_plugins_dir(dir.path());
        let warnings = loader.reload().await;
        assert!(warnings.is_empty());
    }
}
