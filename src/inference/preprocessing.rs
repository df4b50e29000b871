// Feature transforms declared in the model schema. Applied after validation,
// before prediction. Pure: the same row and spec always give the same output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::json_eq;
use crate::models::FeatureRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Scaling {
    Standard { mean: f64, std: f64 },
    Minmax { min: f64, max: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Encoding {
    /// Replaces the feature with one `feature_category` column per category.
    Onehot { categories: Vec<Value> },
    /// Maps the value's string form to a number; unmapped values become 0.
    Label { mapping: BTreeMap<String, f64> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingSpec {
    #[serde(default)]
    pub scaling: BTreeMap<String, Scaling>,
    #[serde(default)]
    pub encoding: BTreeMap<String, Encoding>,
}

impl PreprocessingSpec {
    /// Scaling first, then encoding.
    pub fn apply(&self, mut row: FeatureRow) -> Result<FeatureRow, String> {
        for (feature, scaling) in &self.scaling {
            let Some(value) = row.get(feature) else { continue };
            let x = value
                .as_f64()
                .ok_or_else(|| format!("cannot scale non-numeric feature '{feature}'"))?;
            let scaled = match scaling {
                Scaling::Standard { mean, std } => {
                    if *std == 0.0 {
                        return Err(format!("standard scaling for '{feature}' has zero std"));
                    }
                    (x - mean) / std
                }
                Scaling::Minmax { min, max } => {
                    if max == min {
                        return Err(format!("minmax scaling for '{feature}' has an empty range"));
                    }
                    (x - min) / (max - min)
                }
            };
            row.insert(feature.clone(), Value::from(scaled));
        }

        for (feature, encoding) in &self.encoding {
            match encoding {
                Encoding::Onehot { categories } => {
                    let Some(value) = row.remove(feature) else { continue };
                    for category in categories {
                        let column = format!("{feature}_{}", category_name(category));
                        let hot = if json_eq(category, &value) { 1 } else { 0 };
                        row.insert(column, Value::from(hot));
                    }
                }
                Encoding::Label { mapping } => {
                    let Some(value) = row.get(feature) else { continue };
                    let code = mapping.get(&category_name(value)).copied().unwrap_or(0.0);
                    row.insert(feature.clone(), Value::from(code));
                }
            }
        }
        Ok(row)
    }
}

fn category_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
