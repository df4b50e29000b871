// Model schema and instance validation.
//
// A schema lists required features and, per feature, a type with optional
// constraints. Validation coerces each known feature to its declared type,
// then checks minimum, maximum, enum and pattern. Unknown features pass
// through untouched.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::warn;

use super::preprocessing::PreprocessingSpec;
use crate::{
    error::{Error, Result},
    models::FeatureRow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    Number,
    Integer,
    String,
    Boolean,
    Array,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FeatureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, FeatureSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    #[serde(default)]
    pub input_schema: InputSchema,
    #[serde(default)]
    pub output_schema: OutputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<PreprocessingSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
}

/// A schema with its patterns compiled, built once per request.
pub struct InstanceValidator<'a> {
    schema: &'a ModelSchema,
    patterns: BTreeMap<&'a str, Regex>,
}

impl<'a> InstanceValidator<'a> {
    pub fn new(schema: &'a ModelSchema) -> Result<Self> {
        let mut patterns = BTreeMap::new();
        for (feature, spec) in &schema.input_schema.properties {
            if let Some(pattern) = &spec.pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("schema pattern for '{feature}' is invalid: {e}"))
                })?;
                patterns.insert(feature.as_str(), regex);
            }
        }
        Ok(Self { schema, patterns })
    }

    /// Validate one instance. The message names the instance index and the
    /// offending feature.
    pub fn validate(&self, index: usize, instance: &Value) -> std::result::Result<FeatureRow, String> {
        let Value::Object(fields) = instance else {
            return Err(format!("Instance {index}: expected an object of features"));
        };

        let missing: BTreeSet<&str> = self
            .schema
            .input_schema
            .required
            .iter()
            .map(String::as_str)
            .filter(|feature| !fields.contains_key(*feature))
            .collect();
        if !missing.is_empty() {
            let missing: Vec<_> = missing.into_iter().collect();
            return Err(format!(
                "Instance {index}: Missing required features: {}",
                missing.join(", ")
            ));
        }

        let mut validated = FeatureRow::new();
        for (feature, value) in fields {
            match self.schema.input_schema.properties.get(feature) {
                Some(spec) => {
                    let coerced = coerce(value, spec.kind).map_err(|reason| {
                        format!("Instance {index}: Invalid type for feature '{feature}': {reason}")
                    })?;
                    self.check_constraints(feature, &coerced, spec)
                        .map_err(|reason| format!("Instance {index}: {reason}"))?;
                    validated.insert(feature.clone(), coerced);
                }
                None => {
                    warn!(feature = %feature, instance = index, "Unknown feature passed through");
                    validated.insert(feature.clone(), value.clone());
                }
            }
        }
        Ok(validated)
    }

    fn check_constraints(
        &self,
        feature: &str,
        value: &Value,
        spec: &FeatureSpec,
    ) -> std::result::Result<(), String> {
        if let Some(number) = value.as_f64() {
            if let Some(minimum) = spec.minimum {
                if number < minimum {
                    return Err(format!("Feature '{feature}' value {number} below minimum {minimum}"));
                }
            }
            if let Some(maximum) = spec.maximum {
                if number > maximum {
                    return Err(format!("Feature '{feature}' value {number} above maximum {maximum}"));
                }
            }
        }

        if let Some(allowed) = &spec.allowed {
            if !allowed.iter().any(|candidate| json_eq(candidate, value)) {
                return Err(format!(
                    "Feature '{feature}' value {value} not in allowed values {}",
                    Value::Array(allowed.clone())
                ));
            }
        }

        if let (Some(regex), Value::String(text)) = (self.patterns.get(feature), value) {
            // Anchored at the start only.
            if !regex.find(text).is_some_and(|m| m.start() == 0) {
                return Err(format!(
                    "Feature '{feature}' value doesn't match pattern {}",
                    regex.as_str()
                ));
            }
        }
        Ok(())
    }
}

fn coerce(value: &Value, kind: Option<FeatureType>) -> std::result::Result<Value, String> {
    let Some(kind) = kind else {
        return Ok(value.clone());
    };
    if value.is_null() {
        return Err("value is null".to_string());
    }

    match kind {
        FeatureType::Number => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
                _ => None,
            }
            .ok_or_else(|| format!("could not convert {value} to number"))?;
            Number::from_f64(number)
                .map(Value::Number)
                .ok_or_else(|| format!("could not convert {value} to number"))
        }
        FeatureType::Integer => {
            let integer = match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("could not convert {value} to integer"))?;
            Ok(Value::from(integer))
        }
        FeatureType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(format!("could not convert {value} to string")),
        },
        FeatureType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) if n.as_f64() == Some(0.0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_f64() == Some(1.0) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(format!("could not convert {value} to boolean")),
            },
            _ => Err(format!("could not convert {value} to boolean")),
        },
        FeatureType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err("expected array".to_string()),
        },
    }
}

/// JSON equality that treats `1` and `1.0` as the same number.
pub(crate) fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
