//! Compiled action tape
//!
//! The compiler lowers a stage tree into a flat list of [`Action`]s which a
//! runtime interpreter replays inside the containers. The list is split into
//! [`ActionGroups`], one per container.
//!
//! Actions serialize in a compact single-key form, e.g. `{"d":{"r":"step1","c":"passed"}}`.

use crate::error::{Error, ExpressionContext, Result};
use crate::expression::Expression;
use crate::stage::ContainerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};

pub mod containerize;
pub mod finalize;
pub mod group;
pub mod optimize;
pub mod process;
pub mod sort;

pub use containerize::{create_container, ContainerSpec};
pub use finalize::finalize;
pub use group::group;
pub use optimize::{optimize, optimize_to_fixed_point};
pub use process::{process, Processor};
pub use sort::sort;

/// Synthetic ref of the whole workflow
pub const ROOT_REF: &str = "";

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupAction {
    #[serde(rename = "i", default, skip_serializing_if = "is_false")]
    pub copy_init: bool,
    #[serde(rename = "t", default, skip_serializing_if = "is_false")]
    pub copy_toolkit: bool,
    #[serde(rename = "b", default, skip_serializing_if = "is_false")]
    pub copy_binaries: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareAction {
    #[serde(rename = "r")]
    pub reference: String,
    #[serde(rename = "c")]
    pub condition: String,
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultAction {
    #[serde(rename = "r")]
    pub reference: String,
    #[serde(rename = "v")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerAction {
    #[serde(rename = "r")]
    pub reference: String,
    #[serde(rename = "c")]
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteAction {
    #[serde(rename = "r")]
    pub reference: String,
    #[serde(rename = "n", default, skip_serializing_if = "is_false")]
    pub negative: bool,
    #[serde(rename = "t", default, skip_serializing_if = "is_false")]
    pub toolkit: bool,
    #[serde(rename = "p", default, skip_serializing_if = "is_false")]
    pub pure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutAction {
    #[serde(rename = "r")]
    pub reference: String,
    #[serde(rename = "t")]
    pub timeout: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAction {
    #[serde(rename = "r")]
    pub reference: String,
    #[serde(rename = "c")]
    pub count: i32,
    #[serde(rename = "u", default, skip_serializing_if = "String::is_empty")]
    pub until: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseAction {
    #[serde(rename = "r")]
    pub reference: String,
}

/// One instruction of the compiled tape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "_")]
    Setup(SetupAction),
    #[serde(rename = "d")]
    Declare(DeclareAction),
    #[serde(rename = "S")]
    Start(String),
    #[serde(rename = "E")]
    End(String),
    /// Snapshot of "everything so far passed", read in emission order
    #[serde(rename = "s")]
    CurrentStatus(String),
    #[serde(rename = "r")]
    Result(ResultAction),
    /// Cumulative container mutation for a ref
    #[serde(rename = "c")]
    Container(ContainerAction),
    #[serde(rename = "e")]
    Execute(ExecuteAction),
    #[serde(rename = "t")]
    Timeout(TimeoutAction),
    #[serde(rename = "R")]
    Retry(RetryAction),
    #[serde(rename = "p")]
    Pause(PauseAction),
}

impl Action {
    /// Ref the action belongs to; `None` for setup and status markers
    pub fn reference(&self) -> Option<&str> {
        match self {
            Action::Setup(_) | Action::CurrentStatus(_) => None,
            Action::Declare(a) => Some(&a.reference),
            Action::Start(r) | Action::End(r) => Some(r),
            Action::Result(a) => Some(&a.reference),
            Action::Container(a) => Some(&a.reference),
            Action::Execute(a) => Some(&a.reference),
            Action::Timeout(a) => Some(&a.reference),
            Action::Retry(a) => Some(&a.reference),
            Action::Pause(a) => Some(&a.reference),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Setup(_) => "setup",
            Action::Declare(_) => "declare",
            Action::Start(_) => "start",
            Action::End(_) => "end",
            Action::CurrentStatus(_) => "status",
            Action::Result(_) => "result",
            Action::Container(_) => "container",
            Action::Execute(_) => "execute",
            Action::Timeout(_) => "timeout",
            Action::Retry(_) => "retry",
            Action::Pause(_) => "pause",
        }
    }
}

/// Ordered action tape; order is replay order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionList(Vec<Action>);

/// One action list per container, in execution order
pub type ActionGroups = Vec<ActionList>;

impl ActionList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<Action> {
        self.0
    }

    pub fn setup(mut self, copy_init: bool, copy_toolkit: bool, copy_binaries: bool) -> Self {
        self.0.push(Action::Setup(SetupAction {
            copy_init,
            copy_toolkit,
            copy_binaries,
        }));
        self
    }

    pub fn declare(mut self, reference: &str, condition: &str, parents: &[&str]) -> Self {
        self.0.push(Action::Declare(DeclareAction {
            reference: reference.to_string(),
            condition: condition.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
        }));
        self
    }

    pub fn start(mut self, reference: &str) -> Self {
        self.0.push(Action::Start(reference.to_string()));
        self
    }

    pub fn end(mut self, reference: &str) -> Self {
        self.0.push(Action::End(reference.to_string()));
        self
    }

    pub fn current_status(mut self, status: &str) -> Self {
        self.0.push(Action::CurrentStatus(status.to_string()));
        self
    }

    pub fn result(mut self, reference: &str, value: &str) -> Self {
        self.0.push(Action::Result(ResultAction {
            reference: reference.to_string(),
            value: value.to_string(),
        }));
        self
    }

    pub fn mutate_container(mut self, reference: &str, config: ContainerConfig) -> Self {
        self.0.push(Action::Container(ContainerAction {
            reference: reference.to_string(),
            config,
        }));
        self
    }

    pub fn execute(mut self, reference: &str, negative: bool, toolkit: bool, pure: bool) -> Self {
        self.0.push(Action::Execute(ExecuteAction {
            reference: reference.to_string(),
            negative,
            toolkit,
            pure,
        }));
        self
    }

    pub fn timeout(mut self, reference: &str, timeout: &str) -> Self {
        self.0.push(Action::Timeout(TimeoutAction {
            reference: reference.to_string(),
            timeout: timeout.to_string(),
        }));
        self
    }

    pub fn retry(mut self, reference: &str, count: i32, until: &str) -> Self {
        self.0.push(Action::Retry(RetryAction {
            reference: reference.to_string(),
            count,
            until: until.to_string(),
        }));
        self
    }

    pub fn pause(mut self, reference: &str) -> Self {
        self.0.push(Action::Pause(PauseAction {
            reference: reference.to_string(),
        }));
        self
    }

    /// Every ref a status expression may mention
    pub fn refs(&self) -> HashSet<String> {
        self.0
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    Action::Declare(_) | Action::End(_) | Action::Execute(_) | Action::Result(_)
                )
            })
            .filter_map(Action::reference)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Refs whose declared condition is statically false
    pub fn skipped_refs(&self) -> HashSet<String> {
        self.0
            .iter()
            .filter_map(|a| match a {
                Action::Declare(d) => Some(d),
                _ => None,
            })
            .filter(|d| {
                Expression::parse(&d.condition)
                    .and_then(|e| e.resolve(&[]))
                    .ok()
                    .and_then(|e| e.static_value().map(|v| !v.is_truthy()))
                    .unwrap_or(false)
            })
            .map(|d| d.reference.clone())
            .collect()
    }

    /// Parsed result expression of every group
    pub fn results(&self) -> Result<HashMap<String, Expression>> {
        let mut results = HashMap::new();
        for action in &self.0 {
            if let Action::Result(r) = action {
                let expr = Expression::parse(&r.value).context(|| format!("result of '{}'", r.reference))?;
                results.insert(r.reference.clone(), expr);
            }
        }
        Ok(results)
    }

    /// Parsed condition of every declared ref
    pub fn conditions(&self) -> Result<HashMap<String, Expression>> {
        let mut conditions = HashMap::new();
        for action in &self.0 {
            if let Action::Declare(d) = action {
                let expr =
                    Expression::parse(&d.condition).context(|| format!("condition of '{}'", d.reference))?;
                conditions.insert(d.reference.clone(), expr);
            }
        }
        Ok(conditions)
    }

    /// Refs with an `Execute` action
    pub fn executed_refs(&self) -> HashSet<String> {
        self.0
            .iter()
            .filter_map(|a| match a {
                Action::Execute(e) => Some(e.reference.clone()),
                _ => None,
            })
            .collect()
    }

    /// Check that every ref is declared before anything else refers to it
    pub fn validate(&self) -> Result<()> {
        let mut declared = HashSet::new();
        for action in &self.0 {
            match action {
                Action::Declare(d) => {
                    declared.insert(d.reference.as_str());
                }
                Action::Setup(_) | Action::CurrentStatus(_) | Action::Start(_) | Action::End(_) => {}
                other => {
                    let reference = other.reference().unwrap_or_default();
                    if reference != ROOT_REF && !declared.contains(reference) {
                        return Err(Error::Invariant(format!(
                            "{} action for '{}' precedes its declaration",
                            other.name(),
                            reference
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Deref for ActionList {
    type Target = Vec<Action>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ActionList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Action>> for ActionList {
    fn from(actions: Vec<Action>) -> Self {
        Self(actions)
    }
}

impl FromIterator<Action> for ActionList {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ActionList {
    type Item = Action;
    type IntoIter = std::vec::IntoIter<Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ActionList {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
