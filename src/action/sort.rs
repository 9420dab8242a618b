use super::{Action, ActionList};

/// Position of an action kind in the canonical order; control flow shares the last slot
fn rank(action: &Action) -> u8 {
    match action {
        Action::Setup(_) => 0,
        Action::Declare(_) => 1,
        Action::Pause(_) => 2,
        Action::Result(_) => 3,
        Action::Timeout(_) => 4,
        Action::Retry(_) => 5,
        _ => 6,
    }
}

/// Move metadata actions to the front in canonical order.
///
/// The sort is stable, so actions of the same kind and all control-flow
/// actions keep their relative order.
pub fn sort(actions: &mut ActionList) {
    actions.sort_by_key(rank);
}
