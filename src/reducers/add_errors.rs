use super::Reducer;
use crate::{channels::Channel, node::NodePartial, state::VersionedState};

/// Appends incoming error events to the errors channel.
#[derive(Debug, PartialEq, Clone, Hash, Eq)]
pub struct AddErrors;

impl Reducer for AddErrors {
    fn apply(&self, state: &mut VersionedState, update: &NodePartial) {
        if let Some(errors) = &update.errors
            && !errors.is_empty()
        {
            state.errors.get_mut().extend(errors.iter().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::errors::{ErrorEvent, LadderError};

    #[test]
    fn appends_errors_in_order() {
        let mut state = VersionedState::new_with_user_message("hi");
        let update = NodePartial {
            messages: None,
            extra: None,
            errors: Some(vec![ErrorEvent::app(LadderError::msg("boom"))]),
            frontier: None,
        };
        AddErrors.apply(&mut state, &update);
        assert_eq!(state.errors.get().len(), 1);
    }
}
