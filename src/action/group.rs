//! Splitting the action list into one group per container

use super::{Action, ActionGroups, ActionList};
use std::collections::HashMap;
use tracing::debug;

/// Index at which each group must start, in list order.
///
/// A `Setup` starts a group on its own. An `Execute` pulls its group start
/// back to the ref's `Start` or first container mutation, whichever is first.
fn cut_points(actions: &ActionList) -> Vec<usize> {
    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    let mut cuts = Vec::new();

    for (index, action) in actions.iter().enumerate() {
        match action {
            Action::Start(reference) => {
                first_seen.entry(reference.as_str()).or_insert(index);
            }
            Action::Container(container) => {
                first_seen.entry(container.reference.as_str()).or_insert(index);
            }
            Action::Setup(_) => cuts.push(index),
            Action::Execute(execute) => {
                let cut = first_seen
                    .get(execute.reference.as_str())
                    .copied()
                    .unwrap_or(index);
                cuts.push(cut);
            }
            _ => {}
        }
    }
    cuts
}

/// Partition the list into groups, one per container, in execution order.
///
/// Concatenating the groups gives back the input list.
pub fn group(actions: ActionList) -> ActionGroups {
    let cuts = cut_points(&actions);
    if cuts.len() <= 1 {
        return vec![actions];
    }

    let cut_count = cuts.len();
    let mut rest = actions.into_inner();
    let mut groups: Vec<Vec<Action>> = Vec::with_capacity(cuts.len());
    for cut in cuts.into_iter().rev() {
        let cut = cut.min(rest.len());
        let tail = rest.split_off(cut);
        if !tail.is_empty() {
            groups.push(tail);
        }
    }
    groups.reverse();

    // Whatever precedes the first cut runs with the first group
    match groups.first_mut() {
        Some(first) => {
            rest.append(first);
            *first = rest;
        }
        None => groups.push(rest),
    }

    debug!("Split {} cut points into {} groups", cut_count, groups.len());
    groups.into_iter().map(ActionList::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ContainerConfig;

    fn two_containers() -> ActionList {
        ActionList::new()
            .declare("init", "true", &[])
            .declare("a", "true", &["init"])
            .declare("b", "a", &["init"])
            .result("init", "a&&b")
            .start("")
            .start("init")
            .current_status("init")
            .mutate_container("a", ContainerConfig::with_image("one"))
            .start("a")
            .execute("a", false, false, false)
            .end("a")
            .current_status("a&&init")
            .start("b")
            .mutate_container("b", ContainerConfig::with_image("two"))
            .execute("b", false, false, false)
            .end("b")
            .end("init")
            .end("")
    }

    #[test]
    fn test_single_execution_is_one_group() {
        let actions = ActionList::new()
            .declare("a", "true", &[])
            .start("a")
            .execute("a", false, false, false)
            .end("a");
        assert_eq!(group(actions.clone()), vec![actions]);
    }

    #[test]
    fn test_groups_cut_at_first_start_or_mutation() {
        let actions = two_containers();
        let groups = group(actions.clone());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 12);
        assert_eq!(groups[1][0], Action::Start("b".to_string()));
        assert_eq!(groups[1].len(), 6);

        let joined: ActionList = groups.into_iter().flatten().collect();
        assert_eq!(joined, actions);
    }

    #[test]
    fn test_setup_opens_its_own_group() {
        let mut actions = two_containers();
        actions.insert(0, Action::Setup(Default::default()));
        let groups = group(actions);
        assert_eq!(groups.len(), 3);
        assert!(matches!(groups[0][0], Action::Setup(_)));
        assert_eq!(groups[0].len(), 8);
        assert!(matches!(groups[1][0], Action::Container(_)));
    }

    #[test]
    fn test_setup_before_single_execution_is_split() {
        let actions = ActionList::new()
            .setup(true, false, true)
            .declare("a", "true", &[])
            .start("")
            .mutate_container("a", ContainerConfig::with_image("one"))
            .start("a")
            .execute("a", false, false, false)
            .end("a")
            .end("");
        let groups = group(actions.clone());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert!(matches!(groups[1][0], Action::Container(_)));

        let joined: ActionList = groups.into_iter().flatten().collect();
        assert_eq!(joined, actions);
    }
}
