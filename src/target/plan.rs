//! Ordered load plans
//!
//! A plan is a sequence of stages. Each stage names one row batch and the
//! targets loaded from it, leaves first. The loader never reorders a plan;
//! [`LoadPlan::validate`] only checks that the order the caller chose can
//! work.

use petgraph::algo::toposort;
use petgraph::{Directed, Graph};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::TargetDescriptor;
use crate::load::{LoadError, LoadResult};

/// One batch and the targets loaded from it, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Batch name (e.g. "observation", "candidate")
    pub name: String,
    /// Targets in dependency order
    #[serde(default)]
    pub targets: Vec<TargetDescriptor>,
}

impl Stage {
    pub fn new(name: impl Into<String>, targets: Vec<TargetDescriptor>) -> Self {
        Self {
            name: name.into(),
            targets,
        }
    }
}

/// Ordered sequence of stages
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadPlan {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl LoadPlan {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Parse a plan from TOML
    pub fn from_toml(content: &str) -> LoadResult<Self> {
        toml::from_str(content)
            .map_err(|e| LoadError::InvalidPlan(format!("Failed to parse plan: {}", e)))
    }

    /// Serialize a plan to TOML
    pub fn to_toml(&self) -> LoadResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LoadError::InvalidPlan(format!("Failed to serialize plan: {}", e)))
    }

    /// Find a stage by name
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// All targets in load order with their stage index
    pub fn targets(&self) -> impl Iterator<Item = (usize, &TargetDescriptor)> {
        self.stages
            .iter()
            .enumerate()
            .flat_map(|(i, stage)| stage.targets.iter().map(move |t| (i, t)))
    }

    /// Stage index and target whose local key is `column`
    pub fn producer_of(&self, column: &str) -> Option<(usize, &TargetDescriptor)> {
        self.targets().find(|(_, t)| t.local_key == column)
    }

    /// Foreign key columns of a stage that are produced by an earlier stage
    ///
    /// Returns `(column, producing stage index)` pairs in target order.
    pub fn cross_stage_links(&self, stage_index: usize) -> Vec<(String, usize)> {
        let Some(stage) = self.stages.get(stage_index) else {
            return Vec::new();
        };
        let mut links: Vec<(String, usize)> = Vec::new();
        for target in &stage.targets {
            for fk in &target.foreign_keys {
                if let Some((producer_stage, _)) = self.producer_of(fk)
                    && producer_stage < stage_index
                    && !links.iter().any(|(c, _)| c == fk)
                {
                    links.push((fk.clone(), producer_stage));
                }
            }
        }
        links
    }

    /// Check names, key uniqueness and dependency order
    pub fn validate(&self) -> LoadResult<()> {
        let mut stage_names: HashMap<&str, usize> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                return Err(LoadError::InvalidPlan(format!("Stage {} has no name", i)));
            }
            if stage_names.insert(stage.name.as_str(), i).is_some() {
                return Err(LoadError::InvalidPlan(format!(
                    "Stage name '{}' is used twice",
                    stage.name
                )));
            }
        }

        let ordered: Vec<&TargetDescriptor> = self.targets().map(|(_, t)| t).collect();

        let mut graph = Graph::<usize, (), Directed>::new();
        let nodes: Vec<_> = (0..ordered.len()).map(|i| graph.add_node(i)).collect();
        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (i, target) in ordered.iter().enumerate() {
            if target.local_key.is_empty() || target.table_name.is_empty() {
                return Err(LoadError::InvalidPlan(format!(
                    "Target #{} needs both a table name and a local key",
                    i
                )));
            }
            if let Some(previous) = producers.insert(target.local_key.as_str(), i) {
                return Err(LoadError::InvalidPlan(format!(
                    "Local key '{}' is declared by both {} and {}",
                    target.local_key, ordered[previous].table_name, target.table_name
                )));
            }
        }

        for (i, target) in ordered.iter().enumerate() {
            for fk in &target.foreign_keys {
                if let Some(&producer) = producers.get(fk.as_str()) {
                    graph.add_edge(nodes[producer], nodes[i], ());
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let target = ordered[graph[cycle.node_id()]];
            return Err(LoadError::InvalidPlan(format!(
                "Foreign keys of {} form a dependency cycle",
                target.table_name
            )));
        }

        for (i, target) in ordered.iter().enumerate() {
            for fk in &target.foreign_keys {
                if let Some(&producer) = producers.get(fk.as_str())
                    && producer > i
                {
                    return Err(LoadError::InvalidPlan(format!(
                        "{} references {} through '{}' but is loaded before it",
                        target.table_name, ordered[producer].table_name, fk
                    )));
                }
            }
        }

        Ok(())
    }
}
