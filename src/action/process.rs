//! Lowering of a stage tree into a linear action list

use super::{
    Action, ActionList, ContainerAction, DeclareAction, ExecuteAction, PauseAction, ResultAction,
    RetryAction, TimeoutAction, ROOT_REF,
};
use crate::error::{Error, ExpressionContext, Result};
use crate::expression::{resolve_template, Expression, Machine};
use crate::stage::{ContainerConfig, Stage};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, trace};

/// Condition used when a stage does not declare one
const DEFAULT_CONDITION: &str = "passed";

/// Names the status expressions already give a meaning to
const RESERVED_REFS: &[&str] = &[
    "true", "false", "null", "passed", "success", "failed", "error", "always", "never",
];

static REF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex pattern"));

/// Every ref must be usable as an identifier in status expressions and name
/// exactly one stage.
fn validate_refs(root: &Stage) -> Result<()> {
    let mut seen = HashSet::new();
    for reference in root.refs() {
        if reference.is_empty() {
            return Err(Error::InvalidStage("stage ref must not be empty".to_string()));
        }
        if !REF_PATTERN.is_match(&reference) {
            return Err(Error::InvalidStage(format!(
                "stage ref '{reference}' is not a valid identifier"
            )));
        }
        if RESERVED_REFS.contains(&reference.as_str()) {
            return Err(Error::InvalidStage(format!("stage ref '{reference}' is reserved")));
        }
        if !seen.insert(reference.clone()) {
            return Err(Error::InvalidStage(format!(
                "stage ref '{reference}' is used more than once"
            )));
        }
    }
    Ok(())
}

/// State handed down the recursion; each level builds a fresh one for its children
#[derive(Debug, Clone)]
struct Scope {
    status: Expression,
    parents: Vec<String>,
    pure: Option<bool>,
    container: ContainerConfig,
}

/// Lowers stage trees using a fixed set of machines for container templating
#[derive(Default)]
pub struct Processor<'a> {
    machines: Vec<&'a dyn Machine>,
    pure_by_default: Option<bool>,
}

impl<'a> Processor<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machine(mut self, machine: &'a dyn Machine) -> Self {
        self.machines.push(machine);
        self
    }

    pub fn with_machines(mut self, machines: &[&'a dyn Machine]) -> Self {
        self.machines.extend_from_slice(machines);
        self
    }

    /// Purity assumed for stages that neither set it nor inherit it
    pub fn with_pure_default(mut self, pure: Option<bool>) -> Self {
        self.pure_by_default = pure;
        self
    }

    /// Lower the whole tree, wrapped in the synthetic root ref.
    ///
    /// The list starts with `Start("")` and ends with `Result("", root)` and
    /// `End("")`. Setup is left to the finalizer. Refs that are empty, reserved,
    /// repeated or not identifiers are rejected before anything is emitted.
    pub fn process(&self, root: &Stage) -> Result<ActionList> {
        validate_refs(root)?;
        let scope = Scope {
            status: Expression::literal(true),
            parents: Vec::new(),
            pure: self.pure_by_default,
            container: ContainerConfig::default(),
        };

        let mut actions = vec![Action::Start(ROOT_REF.to_string())];
        actions.extend(self.lower(root, &scope)?);
        actions.push(Action::Result(ResultAction {
            reference: ROOT_REF.to_string(),
            value: root.reference().to_string(),
        }));
        actions.push(Action::End(ROOT_REF.to_string()));

        debug!(
            "Processed stage tree '{}' into {} actions",
            root.reference(),
            actions.len()
        );
        Ok(actions.into())
    }

    fn lower(&self, stage: &Stage, scope: &Scope) -> Result<Vec<Action>> {
        let options = stage.options();
        let reference = &options.reference;
        trace!("Lowering stage '{}' under status '{}'", reference, scope.status);

        let mut actions = vec![Action::CurrentStatus(scope.status.to_string())];

        let condition = if options.condition.is_empty() || options.condition.trim() == "null" {
            DEFAULT_CONDITION
        } else {
            options.condition.as_str()
        };
        Expression::parse(condition).context(|| format!("condition of '{reference}'"))?;
        actions.push(Action::Declare(DeclareAction {
            reference: reference.clone(),
            condition: condition.to_string(),
            parents: scope.parents.clone(),
        }));

        let effective = ContainerConfig::inherit(&scope.container, stage.container_config());
        let resolved = effective
            .resolve(&self.machines)
            .context(|| format!("container of '{reference}'"))?;
        if !resolved.is_empty() {
            actions.push(Action::Container(ContainerAction {
                reference: reference.clone(),
                config: resolved,
            }));
        }

        actions.push(Action::Start(reference.clone()));

        if !options.timeout.is_empty() {
            let timeout = resolve_template(&options.timeout, &self.machines)
                .context(|| format!("timeout of '{reference}'"))?;
            actions.push(Action::Timeout(TimeoutAction {
                reference: reference.clone(),
                timeout,
            }));
        }
        if let Some(retry) = options.retry.as_ref().filter(|r| r.count != 0) {
            if !retry.until.is_empty() {
                Expression::parse(&retry.until).context(|| format!("retry condition of '{reference}'"))?;
            }
            actions.push(Action::Retry(RetryAction {
                reference: reference.clone(),
                count: retry.count,
                until: retry.until.clone(),
            }));
        }
        if options.paused {
            actions.push(Action::Pause(PauseAction {
                reference: reference.clone(),
            }));
        }

        match stage {
            Stage::Container(leaf) => {
                actions.push(Action::Execute(ExecuteAction {
                    reference: reference.clone(),
                    negative: options.negative,
                    toolkit: leaf.toolkit,
                    pure: leaf.pure.or(scope.pure).unwrap_or(false),
                }));
            }
            Stage::Group(group) => {
                let mut status = match scope.status.static_value() {
                    Some(value) if value.is_truthy() => Expression::identifier(reference),
                    _ => Expression::and(Expression::identifier(reference), scope.status.clone()),
                };
                let mut parents = scope.parents.clone();
                parents.push(reference.clone());
                let pure = group.pure.or(scope.pure);

                let mut gating = Vec::new();
                for child in &group.children {
                    let child_scope = Scope {
                        status: status.clone(),
                        parents: parents.clone(),
                        pure,
                        container: effective.clone(),
                    };
                    actions.extend(self.lower(child, &child_scope)?);

                    if !child.options().optional {
                        status = Expression::and(Expression::identifier(child.reference()), status);
                        gating.push(child.reference());
                    }
                }

                actions.push(Action::Result(ResultAction {
                    reference: reference.clone(),
                    value: aggregate_result(&gating, options.negative).to_string(),
                }));
            }
        }

        actions.push(Action::End(reference.clone()));
        Ok(actions)
    }
}

/// `a&&b` over the gating children, `!a||!b` for a negative group
fn aggregate_result(refs: &[&str], negative: bool) -> Expression {
    let mut terms = refs.iter().map(|r| {
        let term = Expression::identifier(*r);
        if negative {
            Expression::not(term)
        } else {
            term
        }
    });
    let Some(first) = terms.next() else {
        return Expression::literal(!negative);
    };
    terms.fold(first, |acc, term| {
        if negative {
            Expression::or(acc, term)
        } else {
            Expression::and(acc, term)
        }
    })
}

/// Lower a stage tree with the given machines and no purity default
pub fn process(root: &Stage, machines: &[&dyn Machine]) -> Result<ActionList> {
    Processor::new().with_machines(machines).process(root)
}
