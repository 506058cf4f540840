//! Child entities owned by an aggregate.
//!
//! Children have no stream of their own. Their mutation methods validate a
//! request and return the event to raise on the owning [`Root`]; the root's
//! reducer then routes the event back through [`Children::apply`]. Replaying
//! the root's single stream therefore rebuilds the aggregate and every child.
//!
//! [`Root`]: crate::aggregate::Root

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ensure, error::RuleViolation};

/// An entity nested inside an aggregate.
pub trait Entity: Clone {
    /// Identifier, unique among the siblings of one aggregate.
    fn id(&self) -> &str;

    /// # Errors
    ///
    /// Returns the first broken invariant.
    fn ensure_invariants(&self) -> Result<(), RuleViolation> {
        Ok(())
    }
}

/// Reducer for one child event type.
pub trait ApplyChange<E>: Entity {
    /// # Errors
    ///
    /// Returns a [`RuleViolation`] when the event is not acceptable in the
    /// child's current state.
    fn apply_change(&mut self, event: &E) -> Result<(), RuleViolation>;
}

/// The children of one kind held by an aggregate, keyed by id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Children<C> {
    items: BTreeMap<String, C>,
}

impl<C> Default for Children<C> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<C: Entity> Children<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&C> {
        self.items.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.items.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Add a new child.
    ///
    /// # Errors
    ///
    /// Fails if a sibling already uses the id or the child breaks its own
    /// invariants.
    pub fn insert(&mut self, child: C) -> Result<(), RuleViolation> {
        ensure!(
            !self.items.contains_key(child.id()),
            "child {} already exists",
            child.id()
        );
        child.ensure_invariants()?;
        self.items.insert(child.id().to_owned(), child);
        Ok(())
    }

    /// Apply `event` to the child `id`, then check its invariants.
    ///
    /// The child is only replaced when both steps succeed.
    ///
    /// # Errors
    ///
    /// Fails if there is no such child, the child's reducer rejects the
    /// event, or an invariant breaks.
    pub fn apply<E>(&mut self, id: &str, event: &E) -> Result<(), RuleViolation>
    where
        C: ApplyChange<E>,
    {
        let Some(current) = self.items.get(id) else {
            return Err(RuleViolation::new(format!("no child {id}")));
        };
        let mut next = current.clone();
        next.apply_change(event)?;
        next.ensure_invariants()?;
        ensure!(next.id() == id, "child {id} may not change its identifier");
        self.items.insert(id.to_owned(), next);
        Ok(())
    }

    /// Remove the child `id`.
    ///
    /// # Errors
    ///
    /// Fails if there is no such child.
    pub fn remove(&mut self, id: &str) -> Result<C, RuleViolation> {
        self.items
            .remove(id)
            .ok_or_else(|| RuleViolation::new(format!("no child {id}")))
    }
}
