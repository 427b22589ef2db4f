//! Run plan decoding.
//!
//! A run plan holds the run loops of one experiment (indexed by run ID) and the
//! components they reference. Decoding normalizes iteration counts, fills in
//! missing component types and enforces the nesting depth limit, so execution
//! never has to.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::component::ComponentSpec;
use super::loop_spec::LoopSpec;
use crate::error::{FleetError, Result};

/// Default maximum loop nesting depth.
pub const DEFAULT_MAX_LOOP_DEPTH: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawPlan {
    runs: Vec<LoopSpec>,
    components: Vec<ComponentSpec>,
}

/// Decoded, normalized run plan.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    runs: Vec<LoopSpec>,
    components: HashMap<String, ComponentSpec>,
}

impl RunPlan {
    /// Build a plan from already-constructed parts, applying the same normalization as decoding.
    pub fn new(runs: Vec<LoopSpec>, components: Vec<ComponentSpec>, max_depth: usize) -> Result<Self> {
        let mut plan = Self {
            runs,
            components: HashMap::new(),
        };

        for run in &mut plan.runs {
            run.check_depth(max_depth)?;
            run.normalize();
        }

        for mut component in components {
            if component.name.is_empty() {
                return Err(FleetError::Config("component with empty name".to_string()));
            }
            if component.component_type.is_empty() {
                component.component_type = component.name.clone();
            }
            if plan.components.contains_key(&component.name) {
                return Err(FleetError::Config(format!(
                    "duplicate component name {}",
                    component.name
                )));
            }
            plan.components.insert(component.name.clone(), component);
        }

        Ok(plan)
    }

    pub fn from_yaml(content: &str, max_depth: usize) -> Result<Self> {
        let raw: RawPlan = serde_yaml::from_str(content)?;
        Self::new(raw.runs, raw.components, max_depth)
    }

    pub fn from_file<P: AsRef<Path>>(path: P, max_depth: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content, max_depth)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Loop spec for a run ID, or a configuration error when out of range.
    pub fn run(&self, run_id: usize) -> Result<&LoopSpec> {
        self.runs.get(run_id).ok_or_else(|| {
            FleetError::Config(format!(
                "invalid run ID {} (plan defines {} runs)",
                run_id,
                self.runs.len()
            ))
        })
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.get(name)
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentSpec> {
        self.components.values()
    }

    /// Resolve every component referenced by a run; any missing name is fatal.
    pub fn resolve(&self, run_id: usize) -> Result<Vec<&ComponentSpec>> {
        let run = self.run(run_id)?;
        let mut resolved = Vec::new();
        let mut missing = Vec::new();

        for name in run.component_names() {
            match self.components.get(name) {
                Some(component) => resolved.push(component),
                None => missing.push(name),
            }
        }

        if !missing.is_empty() {
            return Err(FleetError::Config(format!(
                "run {} references unknown components: {}",
                run_id,
                missing.join(", ")
            )));
        }

        Ok(resolved)
    }

    /// Check every run resolves.
    pub fn validate(&self) -> Result<()> {
        for run_id in 0..self.runs.len() {
            self.resolve(run_id)?;
        }
        Ok(())
    }
}
