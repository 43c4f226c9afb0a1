// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Validation Engine
//!
//! JSON-schema checks for step inputs and outputs. One instance is shared by
//! every strategy so compiled schemas are reused across concurrent steps.
//! Violations come back as a [`ValidationReport`], never as an error.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::domain::routine::IoSpec;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[derive(Default)]
pub struct ValidationEngine {
    compiled: DashMap<String, Arc<jsonschema::Validator>>,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn validator(&self, schema: &Value) -> Result<Arc<jsonschema::Validator>, String> {
        let key = schema.to_string();
        if let Some(hit) = self.compiled.get(&key) {
            return Ok(hit.clone());
        }
        let compiled = jsonschema::validator_for(schema)
            .map(Arc::new)
            .map_err(|e| format!("invalid schema: {e}"))?;
        self.compiled.insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Check `instance` against `schema`, prefixing messages with `label`.
    pub fn check(&self, label: &str, schema: &Value, instance: &Value) -> Vec<String> {
        match self.validator(schema) {
            Ok(validator) => validator
                .iter_errors(instance)
                .map(|e| format!("{label}: {e}"))
                .collect(),
            Err(e) => vec![format!("{label}: {e}")],
        }
    }

    fn check_declared(&self, kind: &str, specs: &[IoSpec], values: &Map<String, Value>) -> Vec<String> {
        let mut errors = Vec::new();
        for spec in specs {
            match values.get(&spec.name) {
                None if spec.required => {
                    errors.push(format!("missing required {kind} '{}'", spec.name));
                }
                None => {}
                Some(value) => {
                    if let Some(schema) = &spec.schema {
                        errors.extend(self.check(&format!("{kind} '{}'", spec.name), schema, value));
                    }
                }
            }
        }
        errors
    }

    pub fn validate_inputs(&self, specs: &[IoSpec], inputs: &Map<String, Value>) -> ValidationReport {
        let report = ValidationReport::from_errors(self.check_declared("input", specs, inputs));
        debug!(valid = report.valid, errors = report.errors.len(), "Validated step inputs");
        report
    }

    /// Declared outputs first, then the whole output object against
    /// `output_schema` when one is given.
    pub fn validate_outputs(
        &self,
        output_schema: Option<&Value>,
        specs: &[IoSpec],
        outputs: &Map<String, Value>,
    ) -> ValidationReport {
        let mut errors = self.check_declared("output", specs, outputs);
        if let Some(schema) = output_schema {
            errors.extend(self.check("outputs", schema, &Value::Object(outputs.clone())));
        }
        let report = ValidationReport::from_errors(errors);
        debug!(valid = report.valid, errors = report.errors.len(), "Validated step outputs");
        report
    }

    pub fn cached_schemas(&self) -> usize {
        self.compiled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_missing_required_input() {
        let engine = ValidationEngine::new();
        let specs = vec![IoSpec::required("text")];
        let report = engine.validate_inputs(&specs, &Map::new());
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["missing required input 'text'"]);
    }

    #[test]
    fn test_input_schema_violation() {
        let engine = ValidationEngine::new();
        let mut spec = IoSpec::required("count");
        spec.schema = Some(json!({"type": "integer"}));
        let report = engine.validate_inputs(&[spec], &map(json!({"count": "three"})));
        assert!(!report.valid);
        assert!(report.errors[0].starts_with("input 'count'"));
    }

    #[test]
    fn test_output_schema_and_cache() {
        let engine = ValidationEngine::new();
        let schema = json!({
            "type": "object",
            "required": ["score"],
            "properties": { "score": { "type": "number", "maximum": 1 } }
        });

        let ok = engine.validate_outputs(Some(&schema), &[], &map(json!({"score": 0.5})));
        assert!(ok.valid);

        let bad = engine.validate_outputs(Some(&schema), &[], &map(json!({"score": 7})));
        assert!(!bad.valid);
        assert_eq!(bad.errors.len(), 1);
        assert_eq!(engine.cached_schemas(), 1);
    }
}
