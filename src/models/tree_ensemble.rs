// Gradient-boosted tree ensembles dumped as JSON.
//
// Each tree is a flat node array rooted at index 0. Split nodes send a row
// left when `value < threshold`, and down `default_left` when the feature is
// missing. The raw score is `base_score` plus one leaf per tree.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::{
    artifact::Artifact,
    traits::{
        argmax, class_value, number_value, numeric_feature, sigmoid, BoxedPredictor, FeatureRow,
        FrameworkLoader, Predictor, PredictorInfo, RawPrediction,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Objective {
    Regression,
    BinaryLogistic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Node {
    Split {
        feature: String,
        threshold: f64,
        left: usize,
        right: usize,
        #[serde(default)]
        default_left: bool,
    },
    Leaf {
        leaf: f64,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    // Children always sit after their parent, which rules out cycles.
    fn validate(&self, index: usize) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("tree {index} has no nodes");
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let Node::Split { left, right, .. } = node {
                for child in [*left, *right] {
                    if child <= i || child >= self.nodes.len() {
                        bail!("tree {index} node {i} points at invalid child {child}");
                    }
                }
            }
        }
        Ok(())
    }

    fn leaf_for(&self, row: &FeatureRow) -> f64 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf { leaf } => return *leaf,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    default_left,
                } => {
                    let go_left = match numeric_feature(row, feature) {
                        Some(value) => value < *threshold,
                        None => *default_left,
                    };
                    i = if go_left { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TreeEnsemble {
    objective: Objective,
    #[serde(default)]
    base_score: f64,
    trees: Vec<Tree>,
    #[serde(default)]
    classes: Option<Vec<String>>,
}

impl TreeEnsemble {
    fn validate(&self) -> Result<()> {
        if self.trees.is_empty() {
            bail!("ensemble has no trees");
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(i)?;
        }
        if let (Objective::BinaryLogistic, Some(classes)) = (self.objective, &self.classes) {
            if classes.len() != 2 {
                bail!("binary ensemble needs 2 class labels, found {}", classes.len());
            }
        }
        Ok(())
    }

    fn raw_score(&self, row: &FeatureRow) -> f64 {
        self.base_score + self.trees.iter().map(|tree| tree.leaf_for(row)).sum::<f64>()
    }

    fn feature_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for node in self.trees.iter().flat_map(|t| &t.nodes) {
            if let Node::Split { feature, .. } = node {
                if !names.contains(feature) {
                    names.push(feature.clone());
                }
            }
        }
        names
    }
}

impl Predictor for TreeEnsemble {
    fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<RawPrediction>> {
        rows.iter()
            .map(|row| {
                let score = self.raw_score(row);
                match self.objective {
                    Objective::Regression => Ok(RawPrediction {
                        value: number_value(score)?,
                        probabilities: None,
                    }),
                    Objective::BinaryLogistic => {
                        let p = sigmoid(score);
                        let probabilities = vec![1.0 - p, p];
                        Ok(RawPrediction {
                            value: class_value(self.classes.as_deref(), argmax(&probabilities)),
                            probabilities: Some(probabilities),
                        })
                    }
                }
            })
            .collect()
    }

    fn info(&self) -> PredictorInfo {
        PredictorInfo {
            framework: TreeEnsembleLoader.framework().to_string(),
            task: match self.objective {
                Objective::Regression => "regression",
                Objective::BinaryLogistic => "binary_classification",
            }
            .to_string(),
            features: self.feature_names(),
            classes: self.classes.clone(),
            parameters: self.trees.iter().map(|t| t.nodes.len()).sum(),
        }
    }
}

pub struct TreeEnsembleLoader;

impl FrameworkLoader for TreeEnsembleLoader {
    fn framework(&self) -> &'static str {
        "tree_ensemble"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["xgboost-json", "gbdt"]
    }

    fn load(&self, artifact: &Artifact) -> Result<BoxedPredictor> {
        let ensemble: TreeEnsemble = serde_json::from_slice(&artifact.bytes)
            .with_context(|| format!("artifact {} is not a tree ensemble", artifact.path))?;
        ensemble.validate()?;
        Ok(Box::new(ensemble))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stump() -> serde_json::Value {
        json!({
            "objective": "binary_logistic",
            "base_score": 0.0,
            "classes": ["legit", "fraud"],
            "trees": [
                {"nodes": [
                    {"feature": "amount", "threshold": 100.0, "left": 1, "right": 2, "default_left": true},
                    {"leaf": -2.0},
                    {"leaf": 2.0}
                ]}
            ]
        })
    }

    fn load(value: serde_json::Value) -> Result<BoxedPredictor> {
        TreeEnsembleLoader.load(&Artifact::new("t.json", serde_json::to_vec(&value).unwrap()))
    }

    #[test]
    fn test_splits_and_default_branch() {
        let model = load(stump()).unwrap();
        let rows: Vec<FeatureRow> = [json!({"amount": 20}), json!({"amount": 500}), json!({})]
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect();

        let out = model.predict(&rows).unwrap();
        assert_eq!(out[0].value, json!("legit"));
        assert_eq!(out[1].value, json!("fraud"));
        assert_eq!(out[2].value, json!("legit"));
        assert_eq!(model.info().features, vec!["amount"]);
    }

    #[test]
    fn test_backward_child_is_rejected() {
        let bad = json!({
            "objective": "regression",
            "trees": [{"nodes": [
                {"feature": "x", "threshold": 1.0, "left": 0, "right": 1},
                {"leaf": 1.0}
            ]}]
        });
        assert!(load(bad).is_err());
        assert!(load(json!({"objective": "regression", "trees": []})).is_err());
    }
}
