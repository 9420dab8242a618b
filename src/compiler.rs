//! End-to-end compilation of a stage tree

use crate::action::{
    create_container, finalize, group, optimize_to_fixed_point, sort, Action, ActionGroups,
    ActionList, ContainerSpec, Processor,
};
use crate::config::CompilerConfig;
use crate::error::Result;
use crate::expression::Machine;
use crate::stage::{EnvVar, Stage};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A container together with the action tape it replays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledContainer {
    pub container: ContainerSpec,
    /// Env entries marked global, under their declared names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_env: Vec<EnvVar>,
    pub actions: ActionList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledWorkflow {
    pub containers: Vec<CompiledContainer>,
}

impl CompiledWorkflow {
    /// Serialized plan of every container, as injected into the pod
    pub fn actions_annotation(&self) -> Result<String> {
        let groups: Vec<&ActionList> = self.containers.iter().map(|c| &c.actions).collect();
        Ok(serde_json::to_string(&groups)?)
    }

    pub fn images(&self) -> Vec<&str> {
        self.containers
            .iter()
            .map(|c| c.container.image.as_str())
            .collect()
    }

    /// Global env entries of every container, later declarations winning by name
    pub fn global_env(&self) -> Vec<&EnvVar> {
        let mut merged: Vec<&EnvVar> = Vec::new();
        for env in self.containers.iter().flat_map(|c| &c.global_env) {
            match merged.iter_mut().find(|e| e.name == env.name) {
                Some(slot) => *slot = env,
                None => merged.push(env),
            }
        }
        merged
    }
}

/// Whether the toolkit image is needed anywhere in the plan
pub fn uses_toolkit(groups: &ActionGroups, config: &CompilerConfig) -> bool {
    groups.iter().flatten().any(|action| match action {
        Action::Container(container) => container.config.image == config.images.toolkit,
        Action::Execute(execute) => execute.toolkit,
        _ => false,
    })
}

/// Runs the pipeline with one configuration and a fixed set of machines
pub struct Compiler<'a> {
    config: CompilerConfig,
    machines: Vec<&'a dyn Machine>,
}

impl<'a> Compiler<'a> {
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config,
            machines: Vec::new(),
        }
    }

    /// Add a machine used to resolve container templates
    pub fn with_machine(mut self, machine: &'a dyn Machine) -> Self {
        self.machines.push(machine);
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Process, optimize and sort
    pub fn compile_actions(&self, root: &Stage) -> Result<ActionList> {
        let processed = Processor::new()
            .with_machines(&self.machines)
            .with_pure_default(self.config.pure_by_default)
            .process(root)?;
        processed.validate()?;
        trace!("Processed actions: {:?}", processed);

        let mut actions = optimize_to_fixed_point(processed, &self.config)?;
        sort(&mut actions);
        actions.validate()?;
        debug!("Compiled '{}' into {} actions", root.reference(), actions.len());
        Ok(actions)
    }

    /// Actions split into finalized groups, one per container
    pub fn plan(&self, root: &Stage) -> Result<ActionGroups> {
        let actions = self.compile_actions(root)?;
        let groups = finalize(group(actions), self.config.isolated_containers, &self.config);
        debug!("Planned {} container(s)", groups.len());
        Ok(groups)
    }

    pub fn compile(&self, root: &Stage) -> Result<CompiledWorkflow> {
        let groups = self.plan(root)?;
        let toolkit = uses_toolkit(&groups, &self.config);
        let containers = groups
            .iter()
            .enumerate()
            .map(|(index, actions)| {
                let (container, global_env, actions) = create_container(
                    index,
                    &self.config.default_container,
                    actions,
                    toolkit,
                    &self.config,
                )?;
                Ok(CompiledContainer {
                    container,
                    global_env,
                    actions,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledWorkflow { containers })
    }
}

impl Default for Compiler<'_> {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}
