//! Turning one action group into a concrete container

use super::{Action, ActionList, ContainerAction};
use crate::config::CompilerConfig;
use crate::error::{Error, Result};
use crate::stage::{
    ContainerConfig, EnvFromSource, EnvVar, EnvVarSource, PullPolicy, ResourceFieldRef, Resources,
    VolumeMount,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Reserved environment groups. Mutation indices are not zero-padded, so they never clash.
pub const ENV_GROUP_DEBUG: &str = "00";
pub const ENV_GROUP_ACTIONS: &str = "01";
pub const ENV_GROUP_INTERNAL: &str = "02";
pub const ENV_GROUP_RESOURCES: &str = "03";
pub const ENV_GROUP_RUNTIME: &str = "04";

/// Container as handed to the pod builder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<PullPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

impl ContainerSpec {
    fn from_config(config: &ContainerConfig) -> Self {
        Self {
            image: config.image.clone(),
            image_pull_policy: config.image_pull_policy,
            command: config.command.clone().unwrap_or_default(),
            args: config.args.clone().unwrap_or_default(),
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            env_from: config.env_from.clone(),
            volume_mounts: config.volume_mounts.clone(),
            resources: config.resources.clone(),
            ..Default::default()
        }
    }

    pub fn env_value(&self, name: &str) -> Option<&EnvVar> {
        self.env.iter().find(|e| e.name == name)
    }
}

/// Namespaced name of an environment entry: `_<group>[C][S]_<name>`.
///
/// `C` marks a value the runtime still has to compute, `S` a secret-sourced one.
pub fn env_name(group: &str, computed: bool, sensitive: bool, name: &str) -> String {
    format!(
        "_{group}{}{}_{name}",
        if computed { "C" } else { "" },
        if sensitive { "S" } else { "" }
    )
}

fn field_ref_env(group: &str, name: &str, field_path: &str) -> EnvVar {
    EnvVar::field_ref(env_name(group, false, false, name), field_path)
}

fn resource_env(container: &str, name: &str, resource: &str, divisor: Option<&str>) -> EnvVar {
    EnvVar {
        name: env_name(ENV_GROUP_RESOURCES, false, false, name),
        value: String::new(),
        value_from: Some(EnvVarSource {
            resource_field_ref: Some(ResourceFieldRef {
                container_name: container.to_string(),
                resource: resource.to_string(),
                divisor: divisor.map(str::to_string),
            }),
            ..Default::default()
        }),
        global: None,
    }
}

/// Pick the mutation whose image the container runs.
///
/// Only mutations of refs executed in the group compete. A user image beats
/// a built-in or unset one, and anything beats a toolkit step. Without
/// candidates the last mutation wins.
fn best_mutation<'a>(
    mutations: &[&'a ContainerAction],
    executed: &HashMap<&str, bool>,
    config: &CompilerConfig,
) -> Option<&'a ContainerAction> {
    let mut best: Option<&'a ContainerAction> = None;
    let mut best_is_toolkit = false;
    let mut best_is_default = true;
    for &mutation in mutations {
        let Some(&toolkit) = executed.get(mutation.reference.as_str()) else {
            continue;
        };
        let is_default = config.is_default_image(&mutation.config.image);
        if best.is_none() || best_is_toolkit || (best_is_default && !is_default) {
            best = Some(mutation);
            best_is_toolkit = toolkit;
            best_is_default = is_default;
        }
    }
    best.or_else(|| mutations.last().copied())
}

/// Build the container for group `group_index` and the actions it replays.
///
/// Also returns the environment entries marked global, under their own
/// names, for the pod builder to share across containers. The returned action list keeps only what the runtime still needs from
/// container mutations: command, args and working directory of the refs
/// executed in this group. Mutations of other refs are dropped.
pub fn create_container(
    group_index: usize,
    default_container: &ContainerConfig,
    actions: &ActionList,
    uses_toolkit: bool,
    config: &CompilerConfig,
) -> Result<(ContainerSpec, Vec<EnvVar>, ActionList)> {
    let mut has_setup = false;
    let mut mutations: Vec<&ContainerAction> = Vec::new();
    let mut executed: HashMap<&str, bool> = HashMap::new();
    for action in actions {
        match action {
            Action::Setup(_) => has_setup = true,
            Action::Container(container) => mutations.push(container),
            Action::Execute(execute) => {
                if executed.insert(execute.reference.as_str(), execute.toolkit).is_some() {
                    return Err(Error::Invariant(format!(
                        "'{}' is executed more than once in group {}",
                        execute.reference, group_index
                    )));
                }
            }
            _ => {}
        }
    }

    let mut global_env = Vec::new();
    let mut spec = match best_mutation(&mutations, &executed, config) {
        Some(best) => {
            let mut spec = ContainerSpec::from_config(&best.config);
            spec.env.clear();
            spec.env_from.clear();
            for (index, mutation) in mutations.iter().enumerate() {
                let group = index.to_string();
                spec.env.extend(mutation.config.env.iter().map(|env| EnvVar {
                    name: env_name(&group, env.is_computed(), env.is_sensitive(), &env.name),
                    global: None,
                    ..env.clone()
                }));
                global_env.extend(mutation.config.env.iter().filter(|env| env.is_global()).cloned());
                spec.env_from.extend(mutation.config.env_from.iter().map(|source| EnvFromSource {
                    prefix: env_name(&group, false, source.is_sensitive(), &source.prefix),
                    ..source.clone()
                }));

                for mount in &mutation.config.volume_mounts {
                    if !spec.volume_mounts.iter().any(|m| m.mount_path == mount.mount_path) {
                        spec.volume_mounts.push(mount.clone());
                    }
                }
            }
            spec
        }
        None => ContainerSpec {
            image: String::new(),
            env: Vec::new(),
            env_from: Vec::new(),
            ..ContainerSpec::from_config(default_container)
        },
    };

    if spec.image.is_empty() {
        spec.image = if uses_toolkit {
            config.images.toolkit.clone()
        } else {
            config.images.init.clone()
        };
        spec.image_pull_policy = Some(PullPolicy::IfNotPresent);
    } else if spec.image_pull_policy.is_none() {
        spec.image_pull_policy = Some(PullPolicy::IfNotPresent);
    }
    if uses_toolkit && spec.image == config.images.init {
        spec.image = config.images.toolkit.clone();
    }

    if has_setup {
        let annotations = &config.annotations;
        spec.env.extend([
            field_ref_env(ENV_GROUP_DEBUG, "NODE_NAME", "spec.nodeName"),
            field_ref_env(ENV_GROUP_DEBUG, "POD_NAME", "metadata.name"),
            field_ref_env(ENV_GROUP_DEBUG, "NAMESPACE_NAME", "metadata.namespace"),
            field_ref_env(ENV_GROUP_DEBUG, "SERVICE_ACCOUNT_NAME", "spec.serviceAccountName"),
            field_ref_env(ENV_GROUP_ACTIONS, "ACTIONS", &annotations.actions),
            field_ref_env(ENV_GROUP_INTERNAL, "INTERNAL_CONFIG", &annotations.internal),
            field_ref_env(ENV_GROUP_INTERNAL, "SIGNATURE", &annotations.signature),
        ]);
    }

    spec.name = (group_index + 1).to_string();
    spec.env.extend([
        resource_env(&spec.name, "REQUESTS_CPU", "requests.cpu", Some("1m")),
        resource_env(&spec.name, "LIMITS_CPU", "limits.cpu", Some("1m")),
        resource_env(&spec.name, "REQUESTS_MEMORY", "requests.memory", None),
        resource_env(&spec.name, "LIMITS_MEMORY", "limits.memory", None),
        EnvVar::new(env_name(ENV_GROUP_RUNTIME, false, false, "CONTAINER_NAME"), spec.name.clone()),
    ]);

    let init_path = if config.is_builtin_image(&spec.image) {
        &config.paths.image_init
    } else {
        &config.paths.internal_init
    };
    spec.command = vec![init_path.clone(), group_index.to_string()];
    spec.args.clear();

    let residual = residual_actions(actions, &executed.keys().copied().collect());
    debug!(
        "Container {} runs {} with {} mutation(s) and {} action(s)",
        spec.name,
        spec.image,
        mutations.len(),
        residual.len()
    );
    Ok((spec, global_env, residual))
}

/// Strip mutations down to what the runtime applies per step
fn residual_actions(actions: &ActionList, executed: &HashSet<&str>) -> ActionList {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Container(container) => {
                if !executed.contains(container.reference.as_str()) {
                    return None;
                }
                let config = ContainerConfig {
                    command: container.config.command.clone(),
                    args: container.config.args.clone(),
                    working_dir: container.config.working_dir.clone(),
                    ..Default::default()
                };
                (!config.is_empty()).then(|| {
                    Action::Container(ContainerAction {
                        reference: container.reference.clone(),
                        config,
                    })
                })
            }
            other => Some(other.clone()),
        })
        .collect()
}
