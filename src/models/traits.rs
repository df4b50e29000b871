// ARCHITECTURE: Trait-Based Predictor Abstraction Layer
//
// DESIGN PHILOSOPHY:
// 1. RUNTIME POLYMORPHISM: the cache holds `dyn Predictor` and never knows
//    which framework produced it
// 2. PLUGIN LOADERS: a framework is supported by registering one
//    `FrameworkLoader` for its tag
// 3. PURE LOADING: a loader maps artifact bytes to a predictor and touches
//    nothing else, so the cache can run it on any thread

use std::fmt::Debug;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::artifact::Artifact;

/// One instance after validation and preprocessing: feature name to value.
pub type FeatureRow = serde_json::Map<String, Value>;

/// Framework output for one instance, before labels and confidence are attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawPrediction {
    pub value: Value,
    pub probabilities: Option<Vec<f64>>,
}

/// Static description of a loaded predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorInfo {
    pub framework: String,
    pub task: String,          // "regression", "binary_classification", ...
    pub features: Vec<String>, // Features the predictor reads, in order
    pub classes: Option<Vec<String>>,
    pub parameters: usize,
}

/// A loaded model. Implementations are immutable after load, so one instance
/// serves concurrent predictions.
pub trait Predictor: Send + Sync + Debug {
    /// Score a batch of rows. Output order matches input order.
    fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<RawPrediction>>;

    fn is_healthy(&self) -> bool {
        true
    }

    fn info(&self) -> PredictorInfo;
}

pub type BoxedPredictor = Box<dyn Predictor>;

/// Turns an artifact of one framework into a predictor.
pub trait FrameworkLoader: Send + Sync {
    /// Canonical framework tag, matched case-insensitively.
    fn framework(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn load(&self, artifact: &Artifact) -> Result<BoxedPredictor>;
}

// Shared numeric helpers for the built-in frameworks.

pub(crate) fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

pub(crate) fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the highest probability; first wins on ties.
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Numeric view of a feature. Booleans count as 1/0 so encoded features
/// can be fed straight in.
pub(crate) fn numeric_feature(row: &FeatureRow, name: &str) -> Option<f64> {
    match row.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub(crate) fn number_value(x: f64) -> Result<Value> {
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| anyhow::anyhow!("prediction produced a non-finite value"))
}

/// Label for class `index`: the class name when known, the index otherwise.
pub(crate) fn class_value(classes: Option<&[String]>, index: usize) -> Value {
    match classes.and_then(|c| c.get(index)) {
        Some(label) => Value::String(label.clone()),
        None => Value::from(index),
    }
}
