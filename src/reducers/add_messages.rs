use super::Reducer;
use crate::{channels::Channel, node::NodePartial, state::VersionedState};

/// Appends incoming messages to the messages channel, in order.
#[derive(Debug, PartialEq, Clone, Hash, Eq)]
pub struct AddMessages;

impl Reducer for AddMessages {
    fn apply(&self, state: &mut VersionedState, update: &NodePartial) {
        if let Some(messages) = &update.messages
            && !messages.is_empty()
        {
            state.messages.get_mut().extend(messages.iter().cloned());
        }
    }
}
