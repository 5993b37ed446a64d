//! Workflow definition parsing and validation.
//!
//! Converts YAML workflow files into `WorkflowDefinition`s and checks them
//! before the engine sees them: name format, non-empty stage list, graph
//! structure (duplicates, unknown predecessors, cycles) and, when a registry
//! is at hand, that every task and fallback binding exists.

use std::path::Path;

use stagecraft_types::workflow::WorkflowDefinition;
use thiserror::Error;

use crate::graph::{GraphError, StageGraph};
use crate::task::registry::TaskRegistry;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("stage '{stage}' is bound to unknown task '{task}'")]
    UnknownTask { stage: String, task: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and structurally validate a YAML workflow.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural checks that need no registry.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Validation(format!(
            "workflow name '{}' contains invalid characters",
            def.name
        )));
    }
    if def.stages.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one stage".to_string(),
        ));
    }
    if def.max_concurrency == Some(0) {
        return Err(DefinitionError::Validation(
            "max_concurrency must be >= 1".to_string(),
        ));
    }

    StageGraph::from_descriptors(def.stages.iter().cloned())?;
    Ok(())
}

/// Check every task and fallback binding against `registry`.
pub fn check_task_bindings(
    def: &WorkflowDefinition,
    registry: &TaskRegistry,
) -> Result<(), DefinitionError> {
    for stage in &def.stages {
        for task in std::iter::once(&stage.task).chain(stage.fallback.iter()) {
            if !registry.contains(task) {
                return Err(DefinitionError::UnknownTask {
                    stage: stage.name.clone(),
                    task: task.clone(),
                });
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
