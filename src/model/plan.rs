// src/model/plan.rs
//! Execution plans
//!
//! An [`ExecutionPlan`] is the portable unit of work claimed from the broker:
//! an ordered/DAG collection of steps plus workflow options. Steps carrying
//! adaptors and an expression are jobs; steps without an expression are no-op
//! trigger nodes that only route control flow.

use crate::model::specifier::AdaptorSpecifier;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Edge condition controlling whether a downstream step runs
///
/// Whether a `fail`-severity step error halts downstream steps is a per-edge
/// policy, not a hardcoded behavior. `OnSuccess` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    #[default]
    OnSuccess,
    OnFailure,
}

impl EdgeCondition {
    /// Whether the edge is taken given the upstream step's outcome
    pub fn matches(&self, upstream_failed: bool) -> bool {
        match self {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => !upstream_failed,
            EdgeCondition::OnFailure => upstream_failed,
        }
    }
}

/// Outgoing edges of a step: a single target or a conditional-edge map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextEdges {
    Single(String),
    Conditional(HashMap<String, EdgeCondition>),
}

impl NextEdges {
    /// Target ids whose condition matches the upstream outcome
    pub fn targets(&self, upstream_failed: bool) -> Vec<&str> {
        match self {
            NextEdges::Single(id) => {
                if EdgeCondition::default().matches(upstream_failed) {
                    vec![id.as_str()]
                } else {
                    vec![]
                }
            }
            NextEdges::Conditional(map) => {
                let mut targets: Vec<&str> = map
                    .iter()
                    .filter(|(_, cond)| cond.matches(upstream_failed))
                    .map(|(id, _)| id.as_str())
                    .collect();
                targets.sort();
                targets
            }
        }
    }

    /// All target ids regardless of condition
    pub fn all_targets(&self) -> Vec<&str> {
        match self {
            NextEdges::Single(id) => vec![id.as_str()],
            NextEdges::Conditional(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

/// Per-run override mapping a module name to a local path and/or version
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkerOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One node of an execution plan
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Step {
    pub id: String,

    /// Adaptor specifiers this step's expression is bound against
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adaptors: Vec<String>,

    /// Compiled (or raw) expression source; absent for trigger nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Step configuration (credentials etc.), merged into initial state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,

    /// Seed state for this step when it starts the plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,

    /// Per-run module resolution overrides
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub linker: HashMap<String, LinkerOverride>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextEdges>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
}

impl Step {
    /// A job carries an expression; anything else is a trigger node
    pub fn is_job(&self) -> bool {
        self.expression.is_some()
    }

    /// Parsed adaptor specifiers
    pub fn specifiers(&self) -> Vec<AdaptorSpecifier> {
        self.adaptors.iter().map(|s| AdaptorSpecifier::parse(s)).collect()
    }
}

/// Plan-level options, interpreted by the orchestrator and pool, never by
/// the sandbox
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Whole-plan timeout (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Per-step timeout (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,

    /// Step id to start from (default: first step)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// Step id to stop after
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

/// Portable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Opaque run identifier, unique per claim
    pub id: String,

    pub steps: Vec<Step>,

    #[serde(default)]
    pub options: WorkflowOptions,
}

impl ExecutionPlan {
    /// Validate the data-model invariants before execution
    ///
    /// - step ids are unique
    /// - a step with adaptors carries an expression
    /// - edges and start/end options reference known steps
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(EngineError::InvalidPlan(format!("plan '{}' has no steps", self.id)));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(EngineError::InvalidPlan("step with empty id".to_string()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::InvalidPlan(format!("duplicate step id '{}'", step.id)));
            }
            if !step.adaptors.is_empty() && step.expression.is_none() {
                return Err(EngineError::InvalidPlan(format!(
                    "step '{}' declares adaptors but carries no expression",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            if let Some(next) = &step.next {
                for target in next.all_targets() {
                    if !seen.contains(target) {
                        return Err(EngineError::InvalidPlan(format!(
                            "step '{}' routes to unknown step '{}'",
                            step.id, target
                        )));
                    }
                }
            }
        }

        for opt in [&self.options.start, &self.options.end] {
            if let Some(id) = opt {
                if !seen.contains(id.as_str()) {
                    return Err(EngineError::InvalidPlan(format!("unknown step '{}' in options", id)));
                }
            }
        }

        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The step execution begins at
    pub fn initial_step(&self) -> Option<&Step> {
        match &self.options.start {
            Some(id) => self.step(id),
            None => self.steps.first(),
        }
    }

    /// Distinct adaptor specifiers across all steps
    pub fn adaptor_specifiers(&self) -> Vec<AdaptorSpecifier> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for step in &self.steps {
            for spec in step.specifiers() {
                if seen.insert(spec.alias()) {
                    out.push(spec);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, expression: &str) -> Step {
        Step {
            id: id.to_string(),
            adaptors: vec!["common@1.0.0".to_string()],
            expression: Some(expression.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        let plan = ExecutionPlan {
            id: "run-1".to_string(),
            steps: vec![job("a", "fn((s) => s)")],
            options: WorkflowOptions::default(),
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_adaptors_require_expression() {
        let mut step = job("a", "fn((s) => s)");
        step.expression = None;
        let plan = ExecutionPlan {
            id: "run-1".to_string(),
            steps: vec![step],
            options: WorkflowOptions::default(),
        };
        assert!(matches!(plan.validate(), Err(crate::EngineError::InvalidPlan(_))));
    }

    #[test]
    fn test_trigger_node_without_expression_is_valid() {
        let trigger = Step { id: "t".to_string(), ..Default::default() };
        let plan = ExecutionPlan {
            id: "run-1".to_string(),
            steps: vec![trigger],
            options: WorkflowOptions::default(),
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_unknown_edge_target_rejected() {
        let mut step = job("a", "fn((s) => s)");
        step.next = Some(NextEdges::Single("missing".to_string()));
        let plan = ExecutionPlan {
            id: "run-1".to_string(),
            steps: vec![step],
            options: WorkflowOptions::default(),
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_edge_conditions() {
        assert!(EdgeCondition::Always.matches(true));
        assert!(EdgeCondition::Always.matches(false));
        assert!(EdgeCondition::OnSuccess.matches(false));
        assert!(!EdgeCondition::OnSuccess.matches(true));
        assert!(EdgeCondition::OnFailure.matches(true));
        assert!(!EdgeCondition::OnFailure.matches(false));
    }

    #[test]
    fn test_single_edge_defaults_to_on_success() {
        let next = NextEdges::Single("b".to_string());
        assert_eq!(next.targets(false), vec!["b"]);
        assert!(next.targets(true).is_empty());
    }

    #[test]
    fn test_adaptor_specifiers_deduped() {
        let plan = ExecutionPlan {
            id: "run-1".to_string(),
            steps: vec![job("a", "fn((s) => s)"), job("b", "fn((s) => s)")],
            options: WorkflowOptions::default(),
        };
        assert_eq!(plan.adaptor_specifiers().len(), 1);
    }

    #[test]
    fn test_plan_deserializes_from_wire_json() {
        let raw = serde_json::json!({
            "id": "run-xyz",
            "steps": [
                { "id": "trigger", "next": "job-1" },
                {
                    "id": "job-1",
                    "adaptors": ["common@1.0.0"],
                    "expression": "fn((s) => s)",
                    "next": { "job-2": "on_failure" }
                },
                { "id": "job-2", "expression": "fn((s) => s)" }
            ],
            "options": { "timeout_ms": 60000 }
        });
        let plan: ExecutionPlan = serde_json::from_value(raw).unwrap();
        assert!(plan.validate().is_ok());
        assert_eq!(plan.options.timeout_ms, Some(60_000));
        let job1 = plan.step("job-1").unwrap();
        assert_eq!(job1.next.as_ref().unwrap().targets(true), vec!["job-2"]);
    }
}
