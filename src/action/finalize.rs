//! Setup injection and binary-copy decisions

use super::{Action, ActionGroups, ActionList, SetupAction};
use crate::config::CompilerConfig;
use tracing::debug;

fn container_images(actions: &ActionList) -> impl Iterator<Item = &str> {
    actions.iter().filter_map(|action| match action {
        Action::Container(container) => Some(container.config.image.as_str()),
        _ => None,
    })
}

/// Decide what the setup step has to copy, and put it in front.
///
/// Setup is merged into the first group when that group runs on a built-in
/// image and containers are not isolated. Otherwise it gets its own leading
/// group, which also takes over the first group's bookkeeping actions that
/// precede its first container mutation.
pub fn finalize(groups: ActionGroups, isolated: bool, config: &CompilerConfig) -> ActionGroups {
    if groups.is_empty() {
        return vec![ActionList::new().setup(false, false, false)];
    }
    let toolkit_image = config.images.toolkit.as_str();

    let foreign_images = groups
        .iter()
        .flat_map(container_images)
        .any(|image| !config.is_default_image(image));
    let mut setup = SetupAction {
        copy_init: foreign_images,
        copy_toolkit: false,
        copy_binaries: foreign_images,
    };

    // The toolkit has to be copied in when it shares a container with another image
    setup.copy_toolkit = groups.iter().any(|group| {
        let mut images = container_images(group);
        let has_toolkit = container_images(group).any(|image| image == toolkit_image);
        has_toolkit && images.any(|image| !config.is_default_image(image))
    });

    let mut can_merge = !isolated;
    let mut maybe_copy_toolkit = false;
    if can_merge {
        for image in container_images(&groups[0]) {
            if !config.is_default_image(image) {
                can_merge = false;
                break;
            }
            if image == toolkit_image {
                maybe_copy_toolkit = true;
            }
        }
        if can_merge && maybe_copy_toolkit {
            setup.copy_toolkit = true;
        }
    }

    if groups.len() == 1 && can_merge {
        setup = SetupAction::default();
    }

    let paths = &config.paths;
    let (from, to) = if setup.copy_toolkit {
        (&paths.image_toolkit, &paths.internal_toolkit)
    } else {
        (&paths.internal_toolkit, &paths.image_toolkit)
    };
    let mut groups: ActionGroups = groups
        .into_iter()
        .map(|group| group.rewire_binary(toolkit_image, from, to))
        .collect();

    debug!(
        "Setup copies init={} toolkit={} binaries={}, merged={}",
        setup.copy_init, setup.copy_toolkit, setup.copy_binaries, can_merge
    );

    if can_merge {
        groups[0].insert(0, Action::Setup(setup));
        return groups;
    }

    let first = &mut groups[0];
    let split = first
        .iter()
        .position(|action| matches!(action, Action::Container(_)))
        .unwrap_or(first.len());
    let mut setup_group = vec![Action::Setup(setup)];
    setup_group.extend(first.drain(..split));

    if groups[0].is_empty() {
        groups.remove(0);
    }
    groups.insert(0, setup_group.into());
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::group;
    use crate::stage::ContainerConfig;

    fn config() -> CompilerConfig {
        CompilerConfig::default()
    }

    fn run_on(reference: &str, image: &str, command: &str) -> ActionList {
        ActionList::new()
            .mutate_container(reference, ContainerConfig::with_image(image).command([command]))
            .start(reference)
            .execute(reference, false, false, false)
            .end(reference)
    }

    fn setup_of(groups: &ActionGroups) -> SetupAction {
        match &groups[0][0] {
            Action::Setup(setup) => *setup,
            other => panic!("expected setup first, got {other:?}"),
        }
    }

    #[test]
    fn test_no_groups_yields_bare_setup() {
        let groups = finalize(vec![], false, &config());
        assert_eq!(groups, vec![ActionList::new().setup(false, false, false)]);
    }

    #[test]
    fn test_single_default_group_merges_without_copies() {
        let group = ActionList::new()
            .declare("a", "true", &[])
            .start("")
            .current_status("true")
            .start("a")
            .execute("a", false, false, false)
            .end("a")
            .end("");
        let groups = finalize(vec![group.clone()], false, &config());
        assert_eq!(groups.len(), 1);
        assert_eq!(setup_of(&groups), SetupAction::default());
        assert_eq!(groups[0][1..], group[..]);
    }

    #[test]
    fn test_custom_images_get_a_separate_setup_group() {
        let head = ActionList::new()
            .declare("a", "true", &[])
            .declare("b", "a", &[])
            .start("")
            .current_status("true");
        let mut first = head.clone();
        first.extend(run_on("a", "image:1", "x").into_inner());
        let groups = finalize(vec![first, run_on("b", "image:2", "y")], false, &config());

        assert_eq!(groups.len(), 3);
        assert_eq!(
            setup_of(&groups),
            SetupAction {
                copy_init: true,
                copy_toolkit: false,
                copy_binaries: true
            }
        );
        assert_eq!(groups[0][1..], head[..]);
        assert!(matches!(groups[1][0], Action::Container(_)));
    }

    #[test]
    fn test_isolation_prevents_merge() {
        let groups = finalize(vec![run_on("a", "", "x")], true, &config());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(setup_of(&groups), SetupAction::default());
    }

    #[test]
    fn test_toolkit_next_to_custom_image_is_copied() {
        let mut shared = run_on("a", "image:1", "x");
        shared.extend(run_on("t", "testflow/toolkit:latest", "/toolkit").into_inner());
        let groups = finalize(vec![shared], false, &config());
        assert!(setup_of(&groups).copy_toolkit);

        let command = groups
            .iter()
            .flatten()
            .find_map(|a| match a {
                Action::Container(c) if c.reference == "t" => c.config.command.clone(),
                _ => None,
            })
            .unwrap();
        assert_eq!(command, vec!["/.tktw/toolkit".to_string()]);
    }

    #[test]
    fn test_toolkit_alone_uses_in_image_binary() {
        let mut actions = run_on("t", "testflow/toolkit:latest", "/.tktw/toolkit");
        actions.extend(run_on("u", "testflow/toolkit:latest", "/.tktw/toolkit").into_inner());
        let groups = finalize(vec![actions], true, &config());
        assert!(!setup_of(&groups).copy_toolkit);
        let commands: Vec<_> = groups
            .iter()
            .flatten()
            .filter_map(|a| match a {
                Action::Container(c) => c.config.command.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(commands, vec![vec!["/toolkit".to_string()]; 2]);
    }

    #[test]
    fn test_toolkit_first_group_merges_and_copies_toolkit() {
        let groups = group(
            run_on("t", "testflow/toolkit:latest", "/toolkit")
                .into_iter()
                .chain(run_on("b", "testflow/init:latest", "/bin/sh"))
                .collect(),
        );
        let groups = finalize(groups, false, &config());
        assert_eq!(groups.len(), 2);
        assert!(setup_of(&groups).copy_toolkit);
        assert!(!setup_of(&groups).copy_init);
    }
}
