//! Small collection constructors used to keep call sites terse.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Builds an empty extras map with the project's hasher pre-selected.
pub fn new_extra_map() -> FxHashMap<String, Value> {
    FxHashMap::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_extra_map_is_empty() {
        assert!(new_extra_map().is_empty());
    }
}
