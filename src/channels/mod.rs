//! Versioned channel primitives backing [`crate::state::VersionedState`].
//!
//! Each channel wraps a piece of workflow data together with a monotonic
//! version counter. The counter is bumped by the barrier/reducer layer
//! whenever a superstep actually changes the channel's content, which lets
//! schedulers and checkpointers detect "nothing changed" without diffing
//! payloads themselves.

pub mod errors;

use rustc_hash::FxHashMap;
use serde_json::Value;

pub use errors::ErrorEvent;

use crate::message::Message;

/// Common behavior shared by all versioned channels.
pub trait Channel {
    /// The snapshot type returned by [`Channel::snapshot`].
    type Item: Clone;

    /// Current version number. Starts at 1 for freshly constructed channels.
    fn version(&self) -> u32;

    /// Overwrite the version counter (used when restoring from a checkpoint).
    fn set_version(&mut self, version: u32);

    /// Clone the channel's current content.
    fn snapshot(&self) -> Self::Item;

    /// Number of logical entries held by the channel.
    fn len(&self) -> usize;

    /// True when the channel holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Channel holding the conversation/message history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessagesChannel {
    items: Vec<Message>,
    version: u32,
}

impl Default for MessagesChannel {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            version: 1,
        }
    }
}

impl MessagesChannel {
    pub fn new(items: Vec<Message>, version: u32) -> Self {
        Self { items, version }
    }

    pub fn get_mut(&mut self) -> &mut Vec<Message> {
        &mut self.items
    }

    pub fn get(&self) -> &[Message] {
        &self.items
    }
}

impl Channel for MessagesChannel {
    type Item = Vec<Message>;

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    fn snapshot(&self) -> Vec<Message> {
        self.items.clone()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Channel holding arbitrary JSON metadata keyed by string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtrasChannel {
    map: FxHashMap<String, Value>,
    version: u32,
}

impl Default for ExtrasChannel {
    fn default() -> Self {
        Self {
            map: FxHashMap::default(),
            version: 1,
        }
    }
}

impl ExtrasChannel {
    pub fn new(map: FxHashMap<String, Value>, version: u32) -> Self {
        Self { map, version }
    }

    pub fn get_mut(&mut self) -> &mut FxHashMap<String, Value> {
        &mut self.map
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }
}

impl Channel for ExtrasChannel {
    type Item = FxHashMap<String, Value>;

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    fn snapshot(&self) -> FxHashMap<String, Value> {
        self.map.clone()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Channel holding error events raised during execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorsChannel {
    items: Vec<ErrorEvent>,
    version: u32,
}

impl Default for ErrorsChannel {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            version: 1,
        }
    }
}

impl ErrorsChannel {
    pub fn new(items: Vec<ErrorEvent>, version: u32) -> Self {
        Self { items, version }
    }

    pub fn get_mut(&mut self) -> &mut Vec<ErrorEvent> {
        &mut self.items
    }

    pub fn get(&self) -> &[ErrorEvent] {
        &self.items
    }
}

impl Channel for ErrorsChannel {
    type Item = Vec<ErrorEvent>;

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    fn snapshot(&self) -> Vec<ErrorEvent> {
        self.items.clone()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
