//! Recursive loop specification.
//!
//! A loop node runs its four phase lists `count` times, descending into its
//! optional child loop between `start` and `stop` of every iteration.

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Lifecycle phase applied to a list of components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Configure,
    Start,
    Stop,
    Cleanup,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 4] = [Phase::Configure, Phase::Start, Phase::Stop, Phase::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Configure => "configure",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a (possibly nested) run loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSpec {
    /// Iterations of this node; zero means "unset" until normalized.
    pub count: u32,
    pub configure: Vec<String>,
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub cleanup: Vec<String>,
    /// Single optional child; a chain, never a list, so nesting cannot form a cycle.
    #[serde(rename = "loop")]
    pub child: Option<Box<LoopSpec>>,
}

impl LoopSpec {
    /// Create a single-iteration loop with no components.
    pub fn new() -> Self {
        Self {
            count: 1,
            ..Default::default()
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_phase(mut self, phase: Phase, names: &[&str]) -> Self {
        *self.phase_mut(phase) = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_child(mut self, child: LoopSpec) -> Self {
        self.child = Some(Box::new(child));
        self
    }

    /// Component names listed for a phase of this node (not the child).
    pub fn phase(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Configure => &self.configure,
            Phase::Start => &self.start,
            Phase::Stop => &self.stop,
            Phase::Cleanup => &self.cleanup,
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut Vec<String> {
        match phase {
            Phase::Configure => &mut self.configure,
            Phase::Start => &mut self.start,
            Phase::Stop => &mut self.stop,
            Phase::Cleanup => &mut self.cleanup,
        }
    }

    /// True if the name appears in any phase of this node or, transitively, its child.
    pub fn contains_component(&self, name: &str) -> bool {
        if Phase::ALL.iter().any(|p| self.phase(*p).iter().any(|n| n == name)) {
            return true;
        }

        match &self.child {
            Some(child) => child.contains_component(name),
            None => false,
        }
    }

    /// Every component name referenced anywhere in the chain, first occurrence order.
    pub fn component_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        let mut node = Some(self);

        while let Some(current) = node {
            for phase in Phase::ALL {
                for name in current.phase(phase) {
                    if !names.contains(&name.as_str()) {
                        names.push(name);
                    }
                }
            }
            node = current.child.as_deref();
        }

        names
    }

    /// Number of nodes in the chain (a loop without a child has depth 1).
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut node = self.child.as_deref();

        while let Some(child) = node {
            depth += 1;
            node = child.child.as_deref();
        }

        depth
    }

    /// Default missing iteration counts to 1 for the whole chain.
    pub fn normalize(&mut self) {
        let mut node = Some(self);

        while let Some(current) = node {
            if current.count == 0 {
                current.count = 1;
            }
            node = current.child.as_deref_mut();
        }
    }

    /// Reject chains nested deeper than `max_depth`.
    pub fn check_depth(&self, max_depth: usize) -> Result<()> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(FleetError::Config(format!(
                "loop nesting depth {} exceeds maximum of {}",
                depth, max_depth
            )));
        }
        Ok(())
    }
}
