//! Container configuration carried by stages and `Container` actions

use crate::expression::{is_template, resolve_template, Expression, ExpressionError, Machine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many `env.NAME` hops a single environment lookup may follow
const MAX_ENV_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// Partial container definition. Every field is optional, so the zero value
/// means "no change".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<PullPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
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

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
    /// Shared with every container of the pod, not only the declaring step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_ref: Option<FieldRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_field_ref: Option<ResourceFieldRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    pub field_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFieldRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divisor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvFromSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<NameRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<NameRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            value_from: None,
            global: None,
        }
    }

    /// Binding to a field of the pod itself
    pub fn field_ref(name: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            value_from: Some(EnvVarSource {
                field_ref: Some(FieldRef {
                    field_path: field_path.into(),
                }),
                ..Default::default()
            }),
            global: None,
        }
    }

    pub fn secret(name: impl Into<String>, secret: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(KeyRef {
                    name: secret.into(),
                    key: key.into(),
                }),
                ..Default::default()
            }),
            global: None,
        }
    }

    pub fn with_global(mut self) -> Self {
        self.global = Some(true);
        self
    }

    pub fn is_global(&self) -> bool {
        self.global == Some(true)
    }

    /// Value is still a template the runtime has to compute
    pub fn is_computed(&self) -> bool {
        is_template(&self.value)
    }

    pub fn is_sensitive(&self) -> bool {
        self.value_from
            .as_ref()
            .is_some_and(|source| source.secret_key_ref.is_some())
    }
}

impl EnvFromSource {
    pub fn is_sensitive(&self) -> bool {
        self.secret_ref.is_some()
    }
}

impl ContainerConfig {
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env_var(mut self, env: EnvVar) -> Self {
        self.env.push(env);
        self
    }

    pub fn volume_mount(mut self, name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        self.volume_mounts.push(VolumeMount {
            name: name.into(),
            mount_path: mount_path.into(),
            read_only: false,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Effective configuration of a child stage running under `parent`.
    ///
    /// The command is not inherited when the child replaces it or switches
    /// the image, and args additionally reset when the child sets a command.
    pub fn inherit(parent: &ContainerConfig, child: &ContainerConfig) -> ContainerConfig {
        let image_changed = !child.image.is_empty() && child.image != parent.image;
        let image = if child.image.is_empty() {
            parent.image.clone()
        } else {
            child.image.clone()
        };

        let command = if child.command.is_some() || image_changed {
            child.command.clone()
        } else {
            parent.command.clone()
        };

        let child_has_args = child.args.as_ref().is_some_and(|args| !args.is_empty());
        let args = if child_has_args || child.command.is_some() || image_changed {
            child.args.clone()
        } else {
            parent.args.clone()
        };

        let mut env = parent.env.clone();
        env.extend(child.env.iter().cloned());
        let mut volume_mounts = parent.volume_mounts.clone();
        volume_mounts.extend(child.volume_mounts.iter().cloned());
        let mut env_from = parent.env_from.clone();
        env_from.extend(child.env_from.iter().cloned());

        ContainerConfig {
            image,
            image_pull_policy: child.image_pull_policy.or(parent.image_pull_policy),
            command,
            args,
            working_dir: join_working_dir(parent.working_dir.as_deref(), child.working_dir.as_deref()),
            env: dedupe_last_wins(env, |e| e.name.clone()),
            env_from,
            volume_mounts: dedupe_last_wins(volume_mounts, |v| v.mount_path.clone()),
            resources: merge_resources(parent.resources.as_ref(), child.resources.as_ref()),
        }
    }

    /// Substitute `{{expr}}` templates in every string field.
    ///
    /// Besides the supplied machines, `env.NAME` resolves to the literal value
    /// of this configuration's own environment variable `NAME`.
    pub fn resolve(&self, machines: &[&dyn Machine]) -> Result<ContainerConfig, ExpressionError> {
        let env_machine = EnvMachine {
            env: &self.env,
            machines,
            depth: 0,
        };
        let mut all: Vec<&dyn Machine> = Vec::with_capacity(machines.len() + 1);
        all.push(&env_machine);
        all.extend_from_slice(machines);
        let resolve = |text: &str| resolve_template(text, &all);

        let mut resolved = self.clone();
        resolved.image = resolve(&self.image)?;
        if let Some(command) = &self.command {
            resolved.command = Some(command.iter().map(|s| resolve(s)).collect::<Result<_, _>>()?);
        }
        if let Some(args) = &self.args {
            resolved.args = Some(args.iter().map(|s| resolve(s)).collect::<Result<_, _>>()?);
        }
        if let Some(dir) = &self.working_dir {
            resolved.working_dir = Some(resolve(dir)?);
        }
        for env in resolved.env.iter_mut().filter(|e| e.value_from.is_none()) {
            env.value = resolve(&env.value)?;
        }
        for mount in resolved.volume_mounts.iter_mut() {
            mount.mount_path = resolve(&mount.mount_path)?;
        }
        Ok(resolved)
    }
}

/// Resolves `env.NAME` against a container's own literal environment
struct EnvMachine<'a> {
    env: &'a [EnvVar],
    machines: &'a [&'a dyn Machine],
    depth: usize,
}

impl Machine for EnvMachine<'_> {
    fn get(&self, name: &str) -> Option<Expression> {
        let name = name.strip_prefix("env.")?;
        let env = self.env.iter().rev().find(|e| e.name == name)?;
        if env.value_from.is_some() || self.depth >= MAX_ENV_DEPTH {
            return None;
        }

        let nested = EnvMachine {
            env: self.env,
            machines: self.machines,
            depth: self.depth + 1,
        };
        let mut all: Vec<&dyn Machine> = Vec::with_capacity(self.machines.len() + 1);
        all.push(&nested);
        all.extend_from_slice(self.machines);
        let value = resolve_template(&env.value, &all).ok()?;
        if is_template(&value) {
            return None;
        }
        Some(Expression::literal(value))
    }
}

fn join_working_dir(parent: Option<&str>, child: Option<&str>) -> Option<String> {
    match (parent, child) {
        (parent, None) => parent.map(str::to_string),
        (None, Some(child)) => Some(child.to_string()),
        (Some(_), Some(child)) if child.starts_with('/') => Some(child.to_string()),
        (Some(parent), Some("")) => Some(parent.to_string()),
        (Some(parent), Some(child)) => Some(format!("{}/{}", parent.trim_end_matches('/'), child)),
    }
}

/// Keep the last occurrence of each key, in order of those last occurrences
fn dedupe_last_wins<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let keys: Vec<K> = items.iter().map(&key).collect();
    items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !keys[i + 1..].contains(&keys[*i]))
        .map(|(_, item)| item)
        .collect()
}

fn merge_resources(parent: Option<&Resources>, child: Option<&Resources>) -> Option<Resources> {
    match (parent, child) {
        (parent, None) => parent.cloned(),
        (None, Some(child)) => Some(child.clone()),
        (Some(parent), Some(child)) => Some(Resources {
            requests: if child.requests.is_empty() {
                parent.requests.clone()
            } else {
                child.requests.clone()
            },
            limits: if child.limits.is_empty() {
                parent.limits.clone()
            } else {
                child.limits.clone()
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::MapMachine;

    #[test]
    fn test_empty_config_is_zero() {
        assert!(ContainerConfig::default().is_empty());
        assert!(!ContainerConfig::with_image("alpine").is_empty());
        assert!(!ContainerConfig::default().args(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_inherit_keeps_parent_command_for_same_image() {
        let parent = ContainerConfig::with_image("alpine").command(["sh", "-c"]).args(["echo"]);
        let child = ContainerConfig::default();
        let effective = ContainerConfig::inherit(&parent, &child);
        assert_eq!(effective.image, "alpine");
        assert_eq!(effective.command, Some(vec!["sh".to_string(), "-c".to_string()]));
        assert_eq!(effective.args, Some(vec!["echo".to_string()]));
    }

    #[test]
    fn test_inherit_drops_command_when_image_changes() {
        let parent = ContainerConfig::with_image("alpine").command(["sh"]).args(["x"]);
        let child = ContainerConfig::with_image("node:20");
        let effective = ContainerConfig::inherit(&parent, &child);
        assert_eq!(effective.image, "node:20");
        assert_eq!(effective.command, None);
        assert_eq!(effective.args, None);
    }

    #[test]
    fn test_inherit_drops_args_when_command_set() {
        let parent = ContainerConfig::default().command(["sh"]).args(["x"]);
        let child = ContainerConfig::default().command(["bash"]);
        let effective = ContainerConfig::inherit(&parent, &child);
        assert_eq!(effective.command, Some(vec!["bash".to_string()]));
        assert_eq!(effective.args, None);
    }

    #[test]
    fn test_inherit_joins_relative_working_dir() {
        let parent = ContainerConfig::default().working_dir("/data/");
        assert_eq!(
            ContainerConfig::inherit(&parent, &ContainerConfig::default().working_dir("repo"))
                .working_dir
                .as_deref(),
            Some("/data/repo")
        );
        assert_eq!(
            ContainerConfig::inherit(&parent, &ContainerConfig::default().working_dir("/abs"))
                .working_dir
                .as_deref(),
            Some("/abs")
        );
        assert_eq!(
            ContainerConfig::inherit(&parent, &ContainerConfig::default())
                .working_dir
                .as_deref(),
            Some("/data/")
        );
    }

    #[test]
    fn test_inherit_dedupes_env_and_mounts() {
        let parent = ContainerConfig::default()
            .env_var(EnvVar::new("A", "1"))
            .env_var(EnvVar::new("B", "2"))
            .volume_mount("data", "/data");
        let child = ContainerConfig::default()
            .env_var(EnvVar::new("A", "3"))
            .volume_mount("other", "/data");
        let effective = ContainerConfig::inherit(&parent, &child);
        assert_eq!(effective.env, vec![EnvVar::new("B", "2"), EnvVar::new("A", "3")]);
        assert_eq!(effective.volume_mounts.len(), 1);
        assert_eq!(effective.volume_mounts[0].name, "other");
    }

    #[test]
    fn test_resolve_uses_own_environment() {
        let config = ContainerConfig::with_image("{{env.IMAGE}}:{{version}}")
            .env_var(EnvVar::new("ZERO", "foo"))
            .env_var(EnvVar::new("INPUT", "{{env.ZERO}}bar"))
            .env_var(EnvVar::new("IMAGE", "{{env.INPUT}}"))
            .env_var(EnvVar::new("UNDETERMINED", "{{call(abc)}}xxx"))
            .env_var(EnvVar::new("NEXT", "foo{{env.UNDETERMINED}}"));
        let machine = MapMachine::new().register("version", "1.0");
        let resolved = config.resolve(&[&machine]).unwrap();
        assert_eq!(resolved.image, "foobar:1.0");
        assert_eq!(resolved.env[1].value, "foobar");
        assert_eq!(resolved.env[3].value, "{{call(abc)}}xxx");
        assert_eq!(resolved.env[4].value, "foo{{env.UNDETERMINED}}");
    }

    #[test]
    fn test_resolve_skips_secret_sourced_env() {
        let config = ContainerConfig::default().env_var(EnvVar::secret("TOKEN", "creds", "token"));
        let resolved = config.resolve(&[]).unwrap();
        assert_eq!(resolved, config);
    }

    #[test]
    fn test_resolve_reports_malformed_template() {
        let config = ContainerConfig::default().command(["echo", "{{a &&}}"]);
        assert!(config.resolve(&[]).is_err());
    }

    #[test]
    fn test_env_flags() {
        assert!(EnvVar::new("A", "{{x}}").is_computed());
        assert!(!EnvVar::new("A", "x").is_computed());
        assert!(EnvVar::secret("A", "s", "k").is_sensitive());
        assert!(EnvVar::new("A", "x").with_global().is_global());
        assert!(!EnvVar::new("A", "x").is_global());

        let parsed: EnvVar = serde_json::from_str(r#"{"name":"A","value":"x","global":true}"#).unwrap();
        assert!(parsed.is_global());
    }
}
