//! Workflow definition: the declarative stage list handed to the engine.

use serde::{Deserialize, Serialize};

use crate::budget::BudgetCeilings;
use crate::stage::StageDescriptor;

/// A named graph of stages, as loaded from a YAML workflow file.
///
/// ```yaml
/// name: release-notes
/// max_concurrency: 2
/// budget:
///   tokens: 50000
/// stages:
///   - name: fetch
///     task: agent
///     agent: git-reader
///   - name: draft
///     task: agent
///     agent: writer
///     predecessors: [fetch]
///     estimates:
///       tokens: 8000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Overrides the engine-wide concurrency ceiling for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Overrides engine-wide ceilings per kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetCeilings>,
    /// Stages in registration order.
    pub stages: Vec<StageDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_example_parses() {
        let yaml = r#"
name: release-notes
max_concurrency: 2
budget:
  tokens: 50000
stages:
  - name: fetch
    task: agent
    agent: git-reader
  - name: draft
    task: agent
    agent: writer
    predecessors: [fetch]
    estimates:
      tokens: 8000
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.name, "release-notes");
        assert_eq!(def.max_concurrency, Some(2));
        assert_eq!(def.budget.as_ref().and_then(|b| b.tokens), Some(50_000));
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[1].predecessors, vec!["fetch"]);
    }
}
