//! Stage tree consumed by the compiler
//!
//! A workflow is a tree of stages: container leaves that execute something,
//! and groups that sequence their children and aggregate their results.

use serde::{Deserialize, Serialize};

mod container;

pub use container::{
    ContainerConfig, EnvFromSource, EnvVar, EnvVarSource, FieldRef, KeyRef, NameRef, PullPolicy,
    ResourceFieldRef, Resources, VolumeMount,
};

/// Retry settings for a stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub until: String,
}

/// Settings shared by every kind of stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOptions {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Empty means "run when everything before passed"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negative: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStage {
    #[serde(flatten)]
    pub options: StageOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pure: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub toolkit: bool,
    #[serde(default)]
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStage {
    #[serde(flatten)]
    pub options: StageOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pure: Option<bool>,
    /// Defaults applied to every child container
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub children: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Stage {
    Container(ContainerStage),
    Group(GroupStage),
}

impl Stage {
    pub fn container(reference: impl Into<String>, container: ContainerConfig) -> Self {
        Stage::Container(ContainerStage {
            options: StageOptions {
                reference: reference.into(),
                ..Default::default()
            },
            container,
            ..Default::default()
        })
    }

    pub fn group(reference: impl Into<String>, children: Vec<Stage>) -> Self {
        Stage::Group(GroupStage {
            options: StageOptions {
                reference: reference.into(),
                ..Default::default()
            },
            children,
            ..Default::default()
        })
    }

    pub fn options(&self) -> &StageOptions {
        match self {
            Stage::Container(stage) => &stage.options,
            Stage::Group(stage) => &stage.options,
        }
    }

    pub fn options_mut(&mut self) -> &mut StageOptions {
        match self {
            Stage::Container(stage) => &mut stage.options,
            Stage::Group(stage) => &mut stage.options,
        }
    }

    pub fn reference(&self) -> &str {
        &self.options().reference
    }

    /// Own container configuration (a group's defaults for its children)
    pub fn container_config(&self) -> &ContainerConfig {
        match self {
            Stage::Container(stage) => &stage.container,
            Stage::Group(stage) => &stage.container,
        }
    }

    pub fn pure(&self) -> Option<bool> {
        match self {
            Stage::Container(stage) => stage.pure,
            Stage::Group(stage) => stage.pure,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.options_mut().condition = condition.into();
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.options_mut().timeout = timeout.into();
        self
    }

    pub fn with_retry(mut self, count: i32, until: impl Into<String>) -> Self {
        self.options_mut().retry = Some(RetryPolicy {
            count,
            until: until.into(),
        });
        self
    }

    pub fn with_pure(mut self, pure: bool) -> Self {
        match &mut self {
            Stage::Container(stage) => stage.pure = Some(pure),
            Stage::Group(stage) => stage.pure = Some(pure),
        }
        self
    }

    /// Replace the stage's own container configuration
    pub fn with_container(mut self, config: ContainerConfig) -> Self {
        match &mut self {
            Stage::Container(stage) => stage.container = config,
            Stage::Group(stage) => stage.container = config,
        }
        self
    }

    pub fn optional(mut self) -> Self {
        self.options_mut().optional = true;
        self
    }

    pub fn negative(mut self) -> Self {
        self.options_mut().negative = true;
        self
    }

    pub fn paused(mut self) -> Self {
        self.options_mut().paused = true;
        self
    }

    /// Mark a container stage as running the built-in toolkit; no-op for groups
    pub fn toolkit(mut self) -> Self {
        if let Stage::Container(stage) = &mut self {
            stage.toolkit = true;
        }
        self
    }

    /// Every ref in the tree, parents before children
    pub fn refs(&self) -> Vec<String> {
        let mut refs = vec![self.reference().to_string()];
        if let Stage::Group(group) = self {
            for child in &group.children {
                refs.extend(child.refs());
            }
        }
        refs
    }
}
