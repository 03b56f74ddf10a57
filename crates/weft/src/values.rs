//! Name↔index registry for every value in a graph.

use std::collections::HashMap;

use thiserror::Error;

use crate::spec::ValueId;

/// Lookup failure for a name that was never registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value `{0}`")]
pub struct UnknownValue(pub String);

/// Bidirectional map between value names and their stable indices.
///
/// Indices are assigned monotonically in registration order and never change
/// for the life of the table.
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    names: Vec<String>,
    index: HashMap<String, ValueId>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, returning its index. Registering an existing name
    /// returns the index it already holds.
    pub fn add(&mut self, name: impl Into<String>) -> ValueId {
        let name = name.into();
        if let Some(id) = self.index.get(&name) {
            return *id;
        }
        let id = ValueId(self.names.len() as u32);
        self.index.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn index_of(&self, name: &str) -> Result<ValueId, UnknownValue> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| UnknownValue(name.to_string()))
    }

    pub fn name_of(&self, value: ValueId) -> Option<&str> {
        self.names.get(value.index()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
