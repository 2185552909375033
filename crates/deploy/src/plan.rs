//! Deployment plan: the contracts to deploy and the references between them.
//!
//! A plan is a directed acyclic graph. Edges are never declared directly: a step
//! depends on another step exactly when one of its constructor arguments is a
//! [`StepRef`] to it.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while loading or validating a [`DeploymentPlan`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan file {}: {message}", .path.display())]
    Read { path: PathBuf, message: String },

    #[error("failed to parse plan: {0}")]
    Parse(String),

    #[error("step #{0} has an empty name")]
    EmptyName(usize),

    #[error("step `{0}` is declared more than once")]
    DuplicateStep(String),

    #[error("step `{step}` references unknown step `{target}`")]
    UnknownReference { step: String, target: String },

    #[error("cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
}

/// Reference to the deployed address of another step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepRef {
    #[serde(rename = "ref")]
    pub step: String,
}

/// A single constructor argument.
///
/// In plan files a reference is written `{ ref = "Token" }`; anything else is a
/// literal passed through to the chain client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    StepRef(StepRef),
    Literal(Value),
}

impl ArgSpec {
    pub fn step_ref(step: impl Into<String>) -> Self {
        Self::StepRef(StepRef { step: step.into() })
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }
}

/// One contract deployment within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    /// Unique step name, used by references and by the ledger.
    pub name: String,
    /// Contract artifact to deploy. Falls back to `name` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    /// Ordered constructor arguments.
    #[serde(default, rename = "args", skip_serializing_if = "Vec::is_empty")]
    pub constructor_args: Vec<ArgSpec>,
}

impl DeploymentStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contract: None,
            constructor_args: Vec::new(),
        }
    }

    /// Set the contract artifact name.
    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    /// Append a constructor argument.
    pub fn arg(mut self, arg: ArgSpec) -> Self {
        self.constructor_args.push(arg);
        self
    }

    /// The contract name handed to the chain client.
    pub fn contract_name(&self) -> &str {
        self.contract.as_deref().unwrap_or(&self.name)
    }

    /// Names of the steps this step depends on, in argument order, without duplicates.
    pub fn depends_on(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for arg in &self.constructor_args {
            if let ArgSpec::StepRef(reference) = arg
                && !deps.contains(&reference.step.as_str())
            {
                deps.push(&reference.step);
            }
        }
        deps
    }
}

/// On-disk plan layout.
#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    steps: Vec<DeploymentStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// A validated, immutable deployment plan.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    steps: Vec<DeploymentStep>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

impl DeploymentPlan {
    /// Validate `steps` and build a plan.
    ///
    /// Steps keep their declaration order, which is used to break ties in
    /// [`DeploymentPlan::topological_order`].
    pub fn build(steps: Vec<DeploymentStep>) -> Result<Self, PlanError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (position, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(PlanError::EmptyName(position));
            }
            if index.insert(step.name.clone(), position).is_some() {
                return Err(PlanError::DuplicateStep(step.name.clone()));
            }
        }

        let mut edges = Vec::with_capacity(steps.len());
        for step in &steps {
            let mut deps = Vec::new();
            for target in step.depends_on() {
                let Some(&dep) = index.get(target) else {
                    return Err(PlanError::UnknownReference {
                        step: step.name.clone(),
                        target: target.to_string(),
                    });
                };
                deps.push(dep);
            }
            edges.push(deps);
        }

        if let Some(cycle) = find_cycle(&edges) {
            return Err(PlanError::CyclicDependency(
                cycle.into_iter().map(|i| steps[i].name.clone()).collect(),
            ));
        }

        let order = topological_sort(&edges);

        tracing::debug!(steps = steps.len(), "Deployment plan validated");

        Ok(Self {
            steps,
            index,
            order,
        })
    }

    /// Parse a plan from its TOML representation.
    pub fn from_toml_str(content: &str) -> Result<Self, PlanError> {
        let file: PlanFile =
            toml::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))?;
        Self::build(file.steps)
    }

    /// Load a plan from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|e| PlanError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let plan = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), steps = plan.len(), "Deployment plan loaded");
        Ok(plan)
    }

    /// Step names in deployment order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.ordered_steps().map(|step| step.name.as_str()).collect()
    }

    /// Steps in deployment order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &DeploymentStep> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    pub fn step(&self, name: &str) -> Option<&DeploymentStep> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[DeploymentStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Depth-first search with three colors. Returns the first cycle found, closed
/// on its starting node (`[a, b, a]`).
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; edges.len()];
    // The current path, each node with the index of its next edge to follow.
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..edges.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::InProgress;
        stack.push((root, 0));

        while let Some((node, next)) = stack.last_mut() {
            let node = *node;
            let Some(&dep) = edges[node].get(*next) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            *next += 1;

            match marks[dep] {
                Mark::Done => {}
                Mark::InProgress => {
                    let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let mut cycle: Vec<usize> =
                        stack[start..].iter().map(|&(n, _)| n).collect();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[dep] = Mark::InProgress;
                    stack.push((dep, 0));
                }
            }
        }
    }

    None
}

/// Kahn's algorithm, always releasing the earliest-declared ready step first.
fn topological_sort(edges: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = edges.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); edges.len()];
    for (node, deps) in edges.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = remaining
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| Reverse(node))
        .collect();

    let mut order = Vec::with_capacity(edges.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &dependent in &dependents[node] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
    order
}
