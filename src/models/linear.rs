// Linear and logistic models exported as JSON.
//
// {
//   "task": "binary_classification",
//   "features": ["amount", "merchant_risk"],
//   "coefficients": [0.012, 1.7],
//   "intercept": -3.2,
//   "classes": ["legit", "fraud"]
// }
//
// Multiclass models carry one coefficient row and one intercept per class.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use super::{
    artifact::Artifact,
    traits::{
        argmax, class_value, number_value, numeric_feature, sigmoid, softmax, BoxedPredictor,
        FeatureRow, FrameworkLoader, Predictor, PredictorInfo, RawPrediction,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LinearTask {
    Regression,
    BinaryClassification,
    MulticlassClassification,
}

impl LinearTask {
    fn as_str(self) -> &'static str {
        match self {
            LinearTask::Regression => "regression",
            LinearTask::BinaryClassification => "binary_classification",
            LinearTask::MulticlassClassification => "multiclass_classification",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coefficients {
    Single(Vec<f64>),
    PerClass(Vec<Vec<f64>>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Intercept {
    Single(f64),
    PerClass(Vec<f64>),
}

#[derive(Debug, Deserialize)]
struct LinearArtifact {
    task: LinearTask,
    features: Vec<String>,
    coefficients: Coefficients,
    #[serde(default)]
    intercept: Option<Intercept>,
    #[serde(default)]
    classes: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct LinearModel {
    task: LinearTask,
    features: Vec<String>,
    weights: Vec<Vec<f64>>, // One row for regression/binary, one per class otherwise
    intercepts: Vec<f64>,
    classes: Option<Vec<String>>,
}

impl LinearModel {
    fn from_artifact(raw: LinearArtifact) -> Result<Self> {
        let n = raw.features.len();
        if n == 0 {
            bail!("linear model declares no features");
        }

        let weights = match (raw.task, raw.coefficients) {
            (LinearTask::MulticlassClassification, Coefficients::PerClass(rows)) => rows,
            (LinearTask::MulticlassClassification, Coefficients::Single(_)) => {
                bail!("multiclass model needs one coefficient row per class")
            }
            (_, Coefficients::Single(row)) => vec![row],
            (_, Coefficients::PerClass(_)) => {
                bail!("{} model takes a single coefficient row", raw.task.as_str())
            }
        };
        if weights.is_empty() {
            bail!("linear model has no coefficients");
        }
        if let Some(row) = weights.iter().find(|row| row.len() != n) {
            bail!("coefficient row has {} entries for {} features", row.len(), n);
        }

        let intercepts = match raw.intercept {
            None => vec![0.0; weights.len()],
            Some(Intercept::Single(b)) if weights.len() == 1 => vec![b],
            Some(Intercept::PerClass(b)) if b.len() == weights.len() => b,
            Some(_) => bail!("intercept shape does not match coefficients"),
        };

        let expected_classes = match raw.task {
            LinearTask::Regression => None,
            LinearTask::BinaryClassification => Some(2),
            LinearTask::MulticlassClassification => Some(weights.len()),
        };
        if let (Some(classes), Some(expected)) = (&raw.classes, expected_classes) {
            if classes.len() != expected {
                bail!("expected {expected} class labels, found {}", classes.len());
            }
        }

        Ok(Self {
            task: raw.task,
            features: raw.features,
            weights,
            intercepts,
            classes: raw.classes,
        })
    }

    fn features_of(&self, row: &FeatureRow) -> Result<Vec<f64>> {
        self.features
            .iter()
            .map(|name| {
                numeric_feature(row, name)
                    .ok_or_else(|| anyhow!("feature '{name}' is missing or not numeric"))
            })
            .collect()
    }

    fn score(&self, x: &[f64], class: usize) -> f64 {
        self.weights[class]
            .iter()
            .zip(x)
            .map(|(w, v)| w * v)
            .sum::<f64>()
            + self.intercepts[class]
    }
}

impl Predictor for LinearModel {
    fn predict(&self, rows: &[FeatureRow]) -> Result<Vec<RawPrediction>> {
        rows.iter()
            .map(|row| {
                let x = self.features_of(row)?;
                match self.task {
                    LinearTask::Regression => Ok(RawPrediction {
                        value: number_value(self.score(&x, 0))?,
                        probabilities: None,
                    }),
                    LinearTask::BinaryClassification => {
                        let p = sigmoid(self.score(&x, 0));
                        let probabilities = vec![1.0 - p, p];
                        Ok(RawPrediction {
                            value: class_value(self.classes.as_deref(), argmax(&probabilities)),
                            probabilities: Some(probabilities),
                        })
                    }
                    LinearTask::MulticlassClassification => {
                        let scores: Vec<f64> =
                            (0..self.weights.len()).map(|c| self.score(&x, c)).collect();
                        let probabilities = softmax(&scores);
                        Ok(RawPrediction {
                            value: class_value(self.classes.as_deref(), argmax(&probabilities)),
                            probabilities: Some(probabilities),
                        })
                    }
                }
            })
            .collect()
    }

    fn is_healthy(&self) -> bool {
        self.weights.iter().flatten().all(|w| w.is_finite())
            && self.intercepts.iter().all(|b| b.is_finite())
    }

    fn info(&self) -> PredictorInfo {
        PredictorInfo {
            framework: LinearLoader.framework().to_string(),
            task: self.task.as_str().to_string(),
            features: self.features.clone(),
            classes: self.classes.clone(),
            parameters: self.weights.iter().map(Vec::len).sum::<usize>() + self.intercepts.len(),
        }
    }
}

pub struct LinearLoader;

impl FrameworkLoader for LinearLoader {
    fn framework(&self) -> &'static str {
        "linear"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["logistic", "sklearn-linear"]
    }

    fn load(&self, artifact: &Artifact) -> Result<BoxedPredictor> {
        let raw: LinearArtifact = serde_json::from_slice(&artifact.bytes)
            .with_context(|| format!("artifact {} is not a linear model", artifact.path))?;
        Ok(Box::new(LinearModel::from_artifact(raw)?))
    }
}
