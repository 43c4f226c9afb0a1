// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Routine YAML Parser
//!
//! Translates routine manifests into [`Routine`] domain objects.
//!
//! ```yaml
//! apiVersion: strata.dev/v1
//! kind: Routine
//! metadata:
//!   name: greet
//!   description: Say hello
//! spec:
//!   inputs:
//!     - name: who
//!   outputs:
//!     - name: greeting
//!   allocation:
//!     max_credits: 100
//!     max_tokens: 10000
//!     timeout: 30s
//!     max_tool_calls: 5
//!   type: single_step
//!   step:
//!     transforms:
//!       - op: template
//!         output: greeting
//!         template: "Hello {{who}}"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::domain::config::API_VERSION;
use crate::domain::resources::ResourceAllocation;
use crate::domain::routine::{IoSpec, Routine, RoutineKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: RoutineMetadataYaml,
    pub spec: RoutineSpecYaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineMetadataYaml {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineSpecYaml {
    #[serde(default)]
    pub inputs: Vec<IoSpec>,
    #[serde(default)]
    pub outputs: Vec<IoSpec>,
    /// Budget used when the caller supplies none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ResourceAllocation>,
    #[serde(flatten)]
    pub kind: RoutineKind,
}

/// A parsed manifest: the routine plus its default budget.
#[derive(Debug, Clone)]
pub struct ParsedRoutine {
    pub routine: Routine,
    pub allocation: Option<ResourceAllocation>,
    pub labels: HashMap<String, String>,
}

pub struct RoutineParser;

impl RoutineParser {
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<ParsedRoutine, RoutineParseError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| RoutineParseError::IoError {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        Self::parse_yaml(&content)
    }

    pub fn parse_yaml(yaml: &str) -> Result<ParsedRoutine, RoutineParseError> {
        let manifest: RoutineManifest =
            serde_yaml::from_str(yaml).map_err(|e| RoutineParseError::YamlError(e.to_string()))?;

        Self::validate_and_convert(manifest)
    }

    fn validate_and_convert(manifest: RoutineManifest) -> Result<ParsedRoutine, RoutineParseError> {
        if manifest.api_version != API_VERSION {
            return Err(RoutineParseError::InvalidApiVersion {
                expected: API_VERSION.to_string(),
                got: manifest.api_version,
            });
        }

        if manifest.kind != "Routine" {
            return Err(RoutineParseError::InvalidKind {
                expected: "Routine".to_string(),
                got: manifest.kind,
            });
        }

        let routine = Routine {
            id: manifest.metadata.name.clone(),
            name: manifest.metadata.name,
            description: manifest.metadata.description,
            inputs: manifest.spec.inputs,
            outputs: manifest.spec.outputs,
            kind: manifest.spec.kind,
        };

        routine
            .validate()
            .map_err(|e| RoutineParseError::ValidationError(e.to_string()))?;

        if let Some(allocation) = &manifest.spec.allocation {
            allocation
                .validate()
                .map_err(|e| RoutineParseError::ValidationError(e.to_string()))?;
        }

        Ok(ParsedRoutine {
            routine,
            allocation: manifest.spec.allocation,
            labels: manifest.metadata.labels,
        })
    }

    pub fn to_yaml(parsed: &ParsedRoutine) -> Result<String, RoutineParseError> {
        let manifest = RoutineManifest {
            api_version: API_VERSION.to_string(),
            kind: "Routine".to_string(),
            metadata: RoutineMetadataYaml {
                name: parsed.routine.id.clone(),
                description: parsed.routine.description.clone(),
                labels: parsed.labels.clone(),
            },
            spec: RoutineSpecYaml {
                inputs: parsed.routine.inputs.clone(),
                outputs: parsed.routine.outputs.clone(),
                allocation: parsed.allocation.clone(),
                kind: parsed.routine.kind.clone(),
            },
        };
        serde_yaml::to_string(&manifest).map_err(|e| RoutineParseError::YamlError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutineParseError {
    #[error("IO error reading {path}: {error}")]
    IoError { path: String, error: String },

    #[error("YAML parse error: {0}")]
    YamlError(String),

    #[error("Invalid API version: expected '{expected}', got '{got}'")]
    InvalidApiVersion { expected: String, got: String },

    #[error("Invalid kind: expected '{expected}', got '{got}'")]
    InvalidKind { expected: String, got: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::routine::NodeKind;
    use std::io::Write;
    use std::time::Duration;

    const COMPOSITE: &str = r#"
apiVersion: strata.dev/v1
kind: Routine
metadata:
  name: triage
spec:
  inputs:
    - name: ticket
  outputs:
    - name: route
  allocation:
    max_credits: 50
    max_tokens: 1000
    timeout: 10s
    max_tool_calls: 2
  type: multi_step
  graph:
    start: classify
    nodes:
      - id: classify
        type: routine
        routine:
          id: classify
          name: Classify
          inputs:
            - name: ticket
          outputs:
            - name: route
          type: single_step
          step:
            routes:
              - label: urgent
                when: { type: truthy, variable: ticket.urgent }
              - label: normal
                when: { type: always }
      - id: fanout
        type: parallel
        branches:
          - start: a
            nodes:
              - id: a
                type: routine
                routine:
                  id: a
                  name: a
                  type: single_step
                  step:
                    transforms:
                      - op: constant
                        output: a_done
                        value: true
    edges:
      - from: classify
        to: fanout
"#;

    #[test]
    fn test_parse_composite_routine() {
        let parsed = RoutineParser::parse_yaml(COMPOSITE).unwrap();
        assert_eq!(parsed.routine.id, "triage");
        assert!(parsed.routine.is_composite());
        assert_eq!(parsed.allocation.unwrap().timeout, Duration::from_secs(10));

        let RoutineKind::MultiStep { graph } = &parsed.routine.kind else {
            panic!("expected a composite routine");
        };
        assert_eq!(graph.nodes.len(), 2);
        assert!(matches!(graph.nodes[1].kind, NodeKind::Parallel { .. }));
    }

    #[test]
    fn test_invalid_api_version() {
        let yaml = COMPOSITE.replace("strata.dev/v1", "other/v2");
        assert!(matches!(
            RoutineParser::parse_yaml(&yaml),
            Err(RoutineParseError::InvalidApiVersion { .. })
        ));
    }

    #[test]
    fn test_graph_errors_surface_as_validation() {
        let yaml = COMPOSITE.replace("to: fanout", "to: nowhere");
        assert!(matches!(
            RoutineParser::parse_yaml(&yaml),
            Err(RoutineParseError::ValidationError(_))
        ));
    }

    #[test]
    fn test_parse_file_and_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(COMPOSITE.as_bytes()).unwrap();

        let parsed = RoutineParser::parse_file(file.path()).unwrap();
        let yaml = RoutineParser::to_yaml(&parsed).unwrap();
        let again = RoutineParser::parse_yaml(&yaml).unwrap();
        assert_eq!(again.routine, parsed.routine);
    }
}
