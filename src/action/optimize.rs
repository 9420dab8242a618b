//! Rewrite passes run over the action list until it stops changing

use super::{Action, ActionList};
use crate::config::CompilerConfig;
use crate::error::{ExpressionContext, Result};
use crate::expression::{Expression, ExpressionError};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

impl ActionList {
    /// Drop container mutations that change nothing
    pub fn delete_empty_container_mutations(self) -> Self {
        self.into_iter()
            .filter(|a| !matches!(a, Action::Container(c) if c.config.is_empty()))
            .collect()
    }

    /// Wrap every known ref in `bool(...)`, so folding never mistakes a
    /// ref's non-boolean value for its pass/fail status.
    pub fn cast_ref_status_to_bool(mut self) -> Result<Self> {
        let refs = self.refs();
        let cast = |expr: &Expression| match expr {
            Expression::Call { name, args } if name == "bool" && is_ref_argument(args, &refs) => {
                Some(expr.clone())
            }
            Expression::Identifier(name) if refs.contains(name) => {
                Some(Expression::cast_bool(expr.clone()))
            }
            _ => None,
        };
        self.rewrite_statuses(|text| Ok(Expression::parse(text)?.transform(&cast).resolve(&[])?.to_string()))?;
        Ok(self)
    }

    /// Fold each declared condition against what is already known at the
    /// point of its declaration.
    pub fn simplify_intermediate_statuses(mut self) -> Result<Self> {
        let refs = self.refs();
        let skipped = self.skipped_refs();
        let results = self.results()?;
        let mut conditions = self.conditions()?;

        let mut current_status = Expression::literal(true);
        let mut executed: HashSet<String> = HashSet::new();

        for action in self.iter_mut() {
            match action {
                Action::CurrentStatus(status) => {
                    current_status = Expression::parse(status).context(|| "current status".to_string())?;
                }
                Action::Execute(execute) => {
                    executed.insert(execute.reference.clone());
                }
                Action::End(reference) => {
                    executed.insert(reference.clone());
                }
                Action::Declare(declare) => {
                    let machine = |name: &str| -> Option<Expression> {
                        match name {
                            "never" => Some(Expression::literal(false)),
                            "always" => Some(Expression::literal(true)),
                            "passed" | "success" => Some(current_status.clone()),
                            "failed" | "error" => Some(Expression::not(Expression::identifier("passed"))),
                            _ if skipped.contains(name) => Some(Expression::literal(true)),
                            _ if !refs.contains(name) && !results.contains_key(name) => None,
                            _ if !executed.contains(name) => Some(Expression::literal(true)),
                            _ => {
                                let result = results.get(name)?;
                                result.static_value()?;
                                match conditions.get(name) {
                                    Some(condition) => Some(Expression::and(condition.clone(), result.clone())),
                                    None => Some(result.clone()),
                                }
                            }
                        }
                    };
                    let condition = Expression::parse(&declare.condition)
                        .and_then(|e| e.resolve(&[&machine]))
                        .context(|| format!("condition of '{}'", declare.reference))?;
                    trace!("Condition of '{}' folded to '{}'", declare.reference, condition);

                    declare.condition = condition.to_string();
                    conditions.insert(declare.reference.clone(), condition);
                    if declare.parents.iter().any(|p| skipped.contains(p)) {
                        declare.condition = "false".to_string();
                    }
                }
                _ => {}
            }
        }
        Ok(self)
    }

    /// Remove `bool(...)` around plain refs again
    pub fn uncast_ref_status_from_bool(mut self) -> Result<Self> {
        let refs = self.refs();
        let uncast = |expr: &Expression| match expr {
            Expression::Call { name, args } if name == "bool" && is_ref_argument(args, &refs) => {
                args.first().cloned()
            }
            _ => None,
        };
        self.rewrite_statuses(|text| Ok(Expression::parse(text)?.transform(&uncast).to_string()))?;
        Ok(self)
    }

    /// Statically skip `refs` and everything declared under them.
    ///
    /// Skipped refs keep their `Declare`, `Start` and `End` markers, with the
    /// condition forced to `false`. Everything that would run or report for
    /// them is dropped, and statuses mentioning them treat them as passed.
    pub fn skip(self, refs: &HashSet<String>) -> Result<Self> {
        let mut skipped = refs.clone();
        let mut actions: Vec<Action> = self.into_inner();

        for action in actions.iter_mut() {
            if let Action::Declare(declare) = action {
                if declare.parents.iter().any(|p| skipped.contains(p)) {
                    skipped.insert(declare.reference.clone());
                }
                if skipped.contains(&declare.reference) {
                    declare.condition = "false".to_string();
                    declare.parents.clear();
                }
            }
        }

        actions.retain(|action| match action {
            Action::Execute(_)
            | Action::Result(_)
            | Action::Timeout(_)
            | Action::Retry(_)
            | Action::Pause(_)
            | Action::Container(_) => !action.reference().is_some_and(|r| skipped.contains(r)),
            _ => true,
        });

        let skip_machine = |name: &str| skipped.contains(name).then(|| Expression::literal(true));
        for action in actions.iter_mut() {
            match action {
                Action::CurrentStatus(status) => {
                    *status = Expression::parse(status)
                        .and_then(|e| e.resolve(&[&skip_machine]))
                        .context(|| "current status".to_string())?
                        .to_string();
                }
                Action::Result(result) => {
                    result.value = Expression::parse(&result.value)
                        .and_then(|e| e.resolve(&[&skip_machine]))
                        .context(|| format!("result of '{}'", result.reference))?
                        .to_string();
                }
                _ => {}
            }
        }

        if !skipped.is_empty() {
            debug!("Statically skipped {} ref(s)", skipped.len());
        }
        Ok(actions.into())
    }

    /// Rewrite a leading `src/` in the command of every mutation on `image` to `dest/`
    pub fn rewire_command_directory(mut self, image: &str, src: &str, dest: &str) -> Self {
        let prefix = format!("{src}/");
        for action in self.iter_mut() {
            let Action::Container(container) = action else {
                continue;
            };
            if container.config.image != image {
                continue;
            }
            if let Some(binary) = container.config.command.as_mut().and_then(|c| c.first_mut()) {
                if binary.starts_with(&prefix) {
                    *binary = format!("{dest}{}", &binary[src.len()..]);
                }
            }
        }
        self
    }

    /// Point mutations on `image` running exactly `from` at `to` instead
    pub fn rewire_binary(mut self, image: &str, from: &str, to: &str) -> Self {
        for action in self.iter_mut() {
            let Action::Container(container) = action else {
                continue;
            };
            if container.config.image != image {
                continue;
            }
            if let Some(binary) = container.config.command.as_mut().and_then(|c| c.first_mut()) {
                if binary == from {
                    *binary = to.to_string();
                }
            }
        }
        self
    }

    /// Apply `f` to every status-bearing expression: current statuses,
    /// declared conditions and results.
    fn rewrite_statuses<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&str) -> std::result::Result<String, ExpressionError>,
    {
        for action in self.iter_mut() {
            match action {
                Action::CurrentStatus(status) => {
                    *status = f(status.as_str()).context(|| "current status".to_string())?;
                }
                Action::Declare(declare) => {
                    declare.condition =
                        f(declare.condition.as_str()).context(|| format!("condition of '{}'", declare.reference))?;
                }
                Action::Result(result) => {
                    result.value = f(result.value.as_str()).context(|| format!("result of '{}'", result.reference))?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn is_ref_argument(args: &[Expression], refs: &HashSet<String>) -> bool {
    matches!(args, [Expression::Identifier(name)] if refs.contains(name))
}

/// One round of every pass, in order
pub fn optimize(actions: ActionList, config: &CompilerConfig) -> Result<ActionList> {
    let actions = actions
        .delete_empty_container_mutations()
        .cast_ref_status_to_bool()?
        .simplify_intermediate_statuses()?
        .uncast_ref_status_from_bool()?;

    let skipped = actions.skipped_refs();
    let paths = &config.paths;
    Ok(actions
        .skip(&skipped)?
        .rewire_command_directory(&config.images.init, &paths.internal_bin, &paths.image_bin)
        .rewire_command_directory(&config.images.toolkit, &paths.internal_bin, &paths.image_bin))
}

/// Repeat [`optimize`] until a round leaves the list unchanged.
///
/// Always runs at least one round. Gives up after `config.max_optimize_passes`
/// rounds and returns the last list.
pub fn optimize_to_fixed_point(mut actions: ActionList, config: &CompilerConfig) -> Result<ActionList> {
    let max_rounds = config.max_optimize_passes.max(1);
    for round in 1..=max_rounds {
        let next = optimize(actions.clone(), config)?;
        if next == actions {
            debug!("Optimizer settled after {} round(s) with {} actions", round, next.len());
            return Ok(next);
        }
        trace!("Optimizer round {} produced {} actions", round, next.len());
        actions = next;
    }
    warn!(
        "Optimizer did not settle within {} rounds, using the last result",
        max_rounds
    );
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{process, sort};
    use crate::stage::{ContainerConfig, Stage};

    fn compile(stage: &Stage) -> ActionList {
        let config = CompilerConfig::default();
        let mut actions = optimize_to_fixed_point(process(stage, &[]).unwrap(), &config).unwrap();
        sort(&mut actions);
        actions
    }

    fn image1() -> ContainerConfig {
        ContainerConfig::with_image("image:1.2.3").command(["a", "b"])
    }

    fn image2() -> ContainerConfig {
        ContainerConfig::with_image("image:3.2.1").command(["c", "d"])
    }

    fn two_steps(step1: Stage, step2: Stage) -> Stage {
        Stage::group("init", vec![step1, step2])
    }

    #[test]
    fn test_basic() {
        let actions = compile(&two_steps(
            Stage::container("step1", image1()),
            Stage::container("step2", image2()),
        ));
        let want = ActionList::new()
            .declare("init", "true", &[])
            .declare("step1", "true", &["init"])
            .declare("step2", "step1", &["init"])
            .result("init", "step1&&step2")
            .result("", "init")
            .start("")
            .current_status("true")
            .start("init")
            .current_status("init")
            .mutate_container("step1", image1())
            .start("step1")
            .execute("step1", false, false, false)
            .end("step1")
            .current_status("step1&&init")
            .mutate_container("step2", image2())
            .start("step2")
            .execute("step2", false, false, false)
            .end("step2")
            .end("init")
            .end("");
        assert_eq!(actions, want);
    }

    #[test]
    fn test_pause_is_kept_as_metadata() {
        let actions = compile(&two_steps(
            Stage::container("step1", image1()).paused(),
            Stage::container("step2", image2()),
        ));
        let want = ActionList::new()
            .declare("init", "true", &[])
            .declare("step1", "true", &["init"])
            .declare("step2", "step1", &["init"])
            .pause("step1")
            .result("init", "step1&&step2")
            .result("", "init")
            .start("")
            .current_status("true")
            .start("init")
            .current_status("init")
            .mutate_container("step1", image1())
            .start("step1")
            .execute("step1", false, false, false)
            .end("step1")
            .current_status("step1&&init")
            .mutate_container("step2", image2())
            .start("step2")
            .execute("step2", false, false, false)
            .end("step2")
            .end("init")
            .end("");
        assert_eq!(actions, want);
    }

    #[test]
    fn test_negative_step() {
        let actions = compile(&two_steps(
            Stage::container("step1", image1()).negative(),
            Stage::container("step2", image2()),
        ));
        assert!(actions.contains(&Action::Execute(crate::action::ExecuteAction {
            reference: "step1".to_string(),
            negative: true,
            toolkit: false,
            pure: false,
        })));
        assert_eq!(actions.results().unwrap()["init"].to_string(), "step1&&step2");
    }

    #[test]
    fn test_negative_group() {
        let actions = compile(
            &two_steps(
                Stage::container("step1", image1()),
                Stage::container("step2", image2()),
            )
            .negative(),
        );
        assert_eq!(actions.results().unwrap()["init"].to_string(), "!step1||!step2");
    }

    #[test]
    fn test_optional_step() {
        let actions = compile(&two_steps(
            Stage::container("step1", image1()).optional(),
            Stage::container("step2", image2()),
        ));
        let want = ActionList::new()
            .declare("init", "true", &[])
            .declare("step1", "true", &["init"])
            .declare("step2", "true", &["init"])
            .result("init", "step2")
            .result("", "init")
            .start("")
            .current_status("true")
            .start("init")
            .current_status("init")
            .mutate_container("step1", image1())
            .start("step1")
            .execute("step1", false, false, false)
            .end("step1")
            .current_status("init")
            .mutate_container("step2", image2())
            .start("step2")
            .execute("step2", false, false, false)
            .end("step2")
            .end("init")
            .end("");
        assert_eq!(actions, want);
    }

    #[test]
    fn test_optional_group() {
        let tree = Stage::group(
            "init",
            vec![Stage::group(
                "inner",
                vec![
                    Stage::container("step1", image1()),
                    Stage::container("step2", image2()),
                ],
            )
            .optional()],
        );
        let actions = compile(&tree);
        let want = ActionList::new()
            .declare("init", "true", &[])
            .declare("inner", "true", &["init"])
            .declare("step1", "true", &["init", "inner"])
            .declare("step2", "step1", &["init", "inner"])
            .result("inner", "step1&&step2")
            .result("init", "true")
            .result("", "init")
            .start("")
            .current_status("true")
            .start("init")
            .current_status("init")
            .start("inner")
            .current_status("inner&&init")
            .mutate_container("step1", image1())
            .start("step1")
            .execute("step1", false, false, false)
            .end("step1")
            .current_status("step1&&inner&&init")
            .mutate_container("step2", image2())
            .start("step2")
            .execute("step2", false, false, false)
            .end("step2")
            .end("inner")
            .end("init")
            .end("");
        assert_eq!(actions, want);
    }

    #[test]
    fn test_statically_skipped_step() {
        let actions = compile(&two_steps(
            Stage::container("step1", image1()).with_condition("false"),
            Stage::container("step2", image2()),
        ));
        let want = ActionList::new()
            .declare("init", "true", &[])
            .declare("step1", "false", &[])
            .declare("step2", "true", &["init"])
            .result("init", "step2")
            .result("", "init")
            .start("")
            .current_status("true")
            .start("init")
            .current_status("init")
            .start("step1")
            .end("step1")
            .current_status("init")
            .mutate_container("step2", image2())
            .start("step2")
            .execute("step2", false, false, false)
            .end("step2")
            .end("init")
            .end("");
        assert_eq!(actions, want);
    }

    #[test]
    fn test_skipped_root_removes_all_work() {
        let tree = two_steps(
            Stage::container("step1", image1()).paused(),
            Stage::container("step2", image2()).with_timeout("10s").with_retry(2, ""),
        )
        .with_condition("false");
        let actions = compile(&tree);
        let want = ActionList::new()
            .declare("init", "false", &[])
            .declare("step1", "false", &[])
            .declare("step2", "false", &[])
            .result("", "true")
            .start("")
            .current_status("true")
            .start("init")
            .current_status("true")
            .start("step1")
            .end("step1")
            .current_status("true")
            .start("step2")
            .end("step2")
            .end("init")
            .end("");
        assert_eq!(actions, want);
    }

    #[test]
    fn test_failed_alias_refers_to_running_status() {
        let actions = compile(&two_steps(
            Stage::container("step1", image1()),
            Stage::container("step2", image2()).with_condition("failed"),
        ));
        let conditions = actions.conditions().unwrap();
        assert_eq!(conditions["step2"].to_string(), "!step1");
    }

    #[test]
    fn test_always_and_never() {
        let actions = compile(&two_steps(
            Stage::container("step1", image1()).with_condition("never"),
            Stage::container("step2", image2()).with_condition("always"),
        ));
        let conditions = actions.conditions().unwrap();
        assert_eq!(conditions["init"].to_string(), "true");
        assert_eq!(conditions["step1"].to_string(), "false");
        assert_eq!(conditions["step2"].to_string(), "true");
        assert!(!actions.executed_refs().contains("step1"));
    }

    #[test]
    fn test_result_of_finished_group_feeds_later_conditions() {
        let tree = Stage::group(
            "root",
            vec![
                Stage::group("setup", vec![]),
                Stage::container("run", image1()).with_condition("setup"),
            ],
        );
        let actions = compile(&tree);
        assert_eq!(actions.conditions().unwrap()["run"].to_string(), "true");
    }

    #[test]
    fn test_optimized_list_is_a_fixed_point() {
        let config = CompilerConfig::default();
        let tree = two_steps(
            Stage::container("step1", image1()).optional(),
            Stage::container("step2", image2()).with_condition("step1 || failed"),
        );
        let once = optimize_to_fixed_point(process(&tree, &[]).unwrap(), &config).unwrap();
        let twice = optimize(once.clone(), &config).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_mutations_are_removed() {
        let actions = ActionList::new()
            .mutate_container("a", ContainerConfig::default())
            .mutate_container("b", ContainerConfig::with_image("alpine"))
            .delete_empty_container_mutations();
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_cast_and_uncast_touch_only_refs() {
        let actions = ActionList::new()
            .declare("a", "true", &[])
            .current_status("a&&other")
            .result("", "bool(other)&&a")
            .cast_ref_status_to_bool()
            .unwrap();
        assert_eq!(actions[1], Action::CurrentStatus("bool(a)&&other".to_string()));
        assert_eq!(
            actions[2],
            Action::Result(crate::action::ResultAction {
                reference: String::new(),
                value: "bool(other)&&bool(a)".to_string(),
            })
        );

        let actions = actions.uncast_ref_status_from_bool().unwrap();
        assert_eq!(actions[1], Action::CurrentStatus("a&&other".to_string()));
    }

    #[test]
    fn test_rewire_command_directory() {
        let actions = ActionList::new()
            .mutate_container("a", ContainerConfig::with_image("init").command(["/.tktw/bin/sh", "-c"]))
            .mutate_container("b", ContainerConfig::with_image("alpine").command(["/.tktw/bin/sh"]))
            .mutate_container("c", ContainerConfig::with_image("init").command(["/.tktw/binary"]))
            .rewire_command_directory("init", "/.tktw/bin", "/bin");
        let commands: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Container(c) => c.config.command.as_ref().map(|c| c[0].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(commands, vec!["/bin/sh", "/.tktw/bin/sh", "/.tktw/binary"]);
    }

    #[test]
    fn test_malformed_status_is_reported() {
        let err = ActionList::new()
            .current_status("a &&")
            .cast_ref_status_to_bool()
            .unwrap_err();
        assert!(err.to_string().contains("current status"));
    }

    #[test]
    fn test_zero_pass_cap_still_optimizes_once() {
        let config = CompilerConfig {
            max_optimize_passes: 0,
            ..Default::default()
        };
        let tree = two_steps(
            Stage::container("step1", image1()),
            Stage::container("step2", image2()),
        );
        let raw = process(&tree, &[]).unwrap();
        let actions = optimize_to_fixed_point(raw.clone(), &config).unwrap();
        assert_ne!(actions, raw);
        assert_eq!(actions, optimize(raw, &config).unwrap());
        assert!(actions.contains(&Action::Declare(crate::action::DeclareAction {
            reference: "init".to_string(),
            condition: "true".to_string(),
            parents: vec![],
        })));
    }
}
