//! Task plans.
//!
//! A plan is a TOML file naming a blueprint and listing its tasks:
//!
//! ```toml
//! blueprint = "auth-service"
//!
//! [[task]]
//! id = "schema"
//! name = "Create user schema"
//! category = "config"
//!
//! [[task]]
//! id = "login"
//! name = "Implement login"
//! depends_on = ["schema"]
//! complexity = "complex"
//! ```
//!
//! Tasks may appear in any order; parents and dependencies are resolved
//! after every task is known.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{Complexity, TaskCategory, TaskGraph, TaskId, TaskNode};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub blueprint: String,
    #[serde(default, rename = "task")]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    /// Defaults to the id.
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: TaskCategory,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub priority: u32,
    pub parent: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub acceptance_tests: Vec<String>,
}

impl PlanTask {
    fn to_node(&self, default_max_retries: u32) -> TaskNode {
        let mut node = TaskNode::new(self.id.as_str(), self.name.as_deref().unwrap_or(&self.id))
            .with_description(&self.description)
            .with_category(self.category)
            .with_complexity(self.complexity)
            .with_priority(self.priority)
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries));
        for test in &self.acceptance_tests {
            node = node.with_acceptance_test(test);
        }
        node
    }
}

impl Plan {
    pub fn parse(content: &str) -> Result<Self> {
        let plan: Plan = toml::from_str(content)?;
        if plan.blueprint.trim().is_empty() {
            return Err(Error::Plan("blueprint must not be empty".to_string()));
        }
        if plan.tasks.is_empty() {
            return Err(Error::Plan("plan has no tasks".to_string()));
        }
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Build a fresh task graph on `main_branch`.
    ///
    /// Tasks without `max_retries` get `default_max_retries`.
    pub fn build(&self, main_branch: &str, default_max_retries: u32) -> Result<TaskGraph> {
        let mut graph = TaskGraph::new(&self.blueprint, main_branch);
        let known: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();

        // Parents first: keep sweeping until nothing more can be placed.
        let mut remaining: Vec<&PlanTask> = self.tasks.iter().collect();
        let mut placed: HashSet<&str> = HashSet::new();
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for task in remaining {
                match task.parent.as_deref() {
                    Some(parent) if !placed.contains(parent) => deferred.push(task),
                    parent => {
                        graph.add_task(
                            task.to_node(default_max_retries),
                            parent.map(TaskId::from),
                        )?;
                        placed.insert(task.id.as_str());
                    }
                }
            }
            if deferred.len() == before {
                let stuck = deferred[0];
                let parent = stuck.parent.as_deref().unwrap_or_default();
                let reason = if known.contains(parent) {
                    format!("parent chain of {} loops back on itself", stuck.id)
                } else {
                    format!("task {} names unknown parent {}", stuck.id, parent)
                };
                return Err(Error::Plan(reason));
            }
            remaining = deferred;
        }

        let order: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        for task in &self.tasks {
            for dependency in &task.depends_on {
                if !order.contains_key(dependency.as_str()) {
                    return Err(Error::Plan(format!(
                        "task {} depends on unknown task {}",
                        task.id, dependency
                    )));
                }
                graph.add_dependency(&TaskId::from(task.id.as_str()), &TaskId::from(dependency.as_str()))?;
            }
        }

        debug!(blueprint = %self.blueprint, tasks = graph.len(), "plan built");
        Ok(graph)
    }
}
