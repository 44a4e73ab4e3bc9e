//! Job definitions and the read-only job registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use conveyor_job::ParameterKey;

use crate::error::CoreError;
use crate::step::StepBody;

/// One named step within a job definition.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub body: Arc<dyn StepBody>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, body: Arc<dyn StepBody>) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

/// Immutable description of a job: its name, recognized parameters and
/// ordered step list.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub parameter_keys: Vec<ParameterKey>,
    pub steps: Vec<StepDefinition>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameter_keys: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, key: ParameterKey) -> Self {
        self.parameter_keys.push(key);
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, body: Arc<dyn StepBody>) -> Self {
        self.steps.push(StepDefinition::new(name, body));
        self
    }

    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn parameter_key(&self, name: &str) -> Option<&ParameterKey> {
        self.parameter_keys.iter().find(|k| k.name == name)
    }
}

/// Catalog mapping job name to definition. Populated by registration
/// during initialization; read-only afterwards (shared as
/// `Arc<JobRegistry>`).
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job definition. Job names are unique across the
    /// registry and step names unique within their job.
    pub fn register(&mut self, definition: JobDefinition) -> Result<(), CoreError> {
        if definition.steps.is_empty() {
            return Err(CoreError::Registration(format!(
                "job '{}' has no steps",
                definition.name
            )));
        }
        if self.jobs.contains_key(&definition.name) {
            return Err(CoreError::Registration(format!(
                "job '{}' already registered",
                definition.name
            )));
        }
        let mut seen = HashSet::new();
        for step in &definition.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(CoreError::Registration(format!(
                    "job '{}' declares step '{}' twice",
                    definition.name, step.name
                )));
            }
        }
        self.jobs
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(name).cloned()
    }

    /// Registered job names in deterministic (sorted) order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
