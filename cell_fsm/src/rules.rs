//! Transition rule table.
//!
//! Maps `(state, event)` to the next state. Built once when a machine is
//! constructed; lookups never fail, a missing pair simply yields `None`
//! and the engine keeps the current state.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::error::{FsmError, FsmResult};

/// Identifier of a machine state.
pub trait StateId: Copy + Eq + Hash + fmt::Debug + Send + 'static {
    /// Every state of the machine.
    const ALL: &'static [Self];

    /// Name published to the store and used in logs.
    fn name(self) -> &'static str;
}

/// Identifier of a strategy-produced event.
pub trait EventId: Copy + Eq + Hash + fmt::Debug + Send + 'static {
    /// "No transition yet."
    const NONE: Self;

    /// Name used in logs.
    fn name(self) -> &'static str;
}

/// Unique `(state, event) → state` mapping.
///
/// Rules registered with [`RuleTable::add_from_any`] apply to every state
/// that has no explicit rule for the same event.
#[derive(Debug, Clone)]
pub struct RuleTable<S, E> {
    rules: HashMap<(S, E), S>,
    any: HashMap<E, S>,
}

impl<S: StateId, E: EventId> RuleTable<S, E> {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            any: HashMap::new(),
        }
    }

    /// Add `from --event--> to`.
    ///
    /// # Errors
    /// [`FsmError::DuplicateRule`] if the pair already has a target.
    pub fn add(&mut self, from: S, event: E, to: S) -> FsmResult<()> {
        if self.rules.contains_key(&(from, event)) {
            return Err(FsmError::DuplicateRule {
                state: from.name(),
                event: event.name(),
            });
        }
        self.rules.insert((from, event), to);
        Ok(())
    }

    /// Add `* --event--> to`.
    ///
    /// # Errors
    /// [`FsmError::DuplicateRule`] if `event` already has a wildcard target.
    pub fn add_from_any(&mut self, event: E, to: S) -> FsmResult<()> {
        if self.any.contains_key(&event) {
            return Err(FsmError::DuplicateRule {
                state: "*",
                event: event.name(),
            });
        }
        self.any.insert(event, to);
        Ok(())
    }

    /// Target of `(state, event)`, explicit rules first.
    pub fn next(&self, state: S, event: E) -> Option<S> {
        self.rules
            .get(&(state, event))
            .or_else(|| self.any.get(&event))
            .copied()
    }

    /// Number of explicit plus wildcard rules.
    pub fn len(&self) -> usize {
        self.rules.len() + self.any.len()
    }

    /// Whether no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.any.is_empty()
    }
}

impl<S: StateId, E: EventId> Default for RuleTable<S, E> {
    fn default() -> Self {
        Self::new()
    }
}
