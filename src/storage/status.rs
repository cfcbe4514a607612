use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::error::{Result, WardenError};

/// A state whose changes are validated by the state itself.
pub trait StatusState: Copy + Eq + Debug {
    fn can_change_to(&self, next: Self) -> bool;
}

/// Id-indexed values, each carrying a validated state.
///
/// Not synchronized: owners wrap it in their own lock.
#[derive(Debug, Clone)]
pub struct StatusStorage<S, T> {
    entries: BTreeMap<String, (T, S)>,
}

impl<S: StatusState, T: Clone> StatusStorage<S, T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Stores a new value in its initial state. Existing entries are kept.
    pub fn store(&mut self, id: &str, value: T, initial: S) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), (value, initial));
        true
    }

    /// Moves an entry to `next`, returning its previous state.
    pub fn change_state(&mut self, id: &str, next: S) -> Result<S> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| WardenError::InvalidId(id.to_string()))?;

        let current = entry.1;
        if !current.can_change_to(next) {
            return Err(WardenError::InvalidTransition {
                id: id.to_string(),
                from: format!("{:?}", current),
                to: format!("{:?}", next),
            });
        }

        entry.1 = next;
        Ok(current)
    }

    pub fn get_state(&self, id: &str) -> Option<S> {
        self.entries.get(id).map(|(_, state)| *state)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id).map(|(value, _)| value)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids_in_states(&self, states: &[S]) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, (_, state))| states.contains(state))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn values_in_states(&self, states: &[S]) -> Vec<T> {
        self.entries
            .values()
            .filter(|(_, state)| states.contains(state))
            .map(|(value, _)| value.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T, S)> + '_ {
        self.entries
            .iter()
            .map(|(id, (value, state))| (id.as_str(), value, *state))
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.entries.remove(id).map(|(value, _)| value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: StatusState, T: Clone> Default for StatusStorage<S, T> {
    fn default() -> Self {
        Self::new()
    }
}
