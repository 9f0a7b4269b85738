#![forbid(unsafe_code)]

//! Identity-keyed owner for armed observations.
//!
//! Observations cancel themselves when dropped, so something has to own
//! them. [`ObservationSet`] is that owner for callers that hold many:
//! entries are keyed by [`ObservationId`], never by configuration, and
//! dropping the set cancels everything in it.

use std::collections::BTreeMap;

use tracing::debug;

use crate::scheduler::{Observation, ObservationId};

/// Collection of armed observations keyed by identity.
#[derive(Debug, Default)]
pub struct ObservationSet {
    entries: BTreeMap<ObservationId, Observation>,
}

impl ObservationSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `observation`. Returns its id.
    pub fn insert(&mut self, observation: Observation) -> ObservationId {
        let id = observation.id();
        self.entries.insert(id, observation);
        id
    }

    /// Remove an observation without cancelling it.
    pub fn remove(&mut self, id: ObservationId) -> Option<Observation> {
        self.entries.remove(&id)
    }

    /// Cancel and drop an observation. Returns false if it was not present.
    pub fn cancel(&mut self, id: ObservationId) -> bool {
        match self.entries.remove(&id) {
            Some(observation) => {
                observation.cancel();
                true
            }
            None => false,
        }
    }

    /// Look up an observation.
    #[must_use]
    pub fn get(&self, id: ObservationId) -> Option<&Observation> {
        self.entries.get(&id)
    }

    /// Whether an observation with `id` is held.
    #[must_use]
    pub fn contains(&self, id: ObservationId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of held observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no observations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in creation order.
    pub fn ids(&self) -> impl Iterator<Item = ObservationId> + '_ {
        self.entries.keys().copied()
    }

    /// Drop entries that were cancelled through their own handle.
    /// Returns how many were removed.
    pub fn retain_live(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, observation| !observation.is_cancelled());
        before - self.entries.len()
    }

    /// Cancel and drop every observation.
    pub fn cancel_all(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        debug!(count = self.entries.len(), "cancelling stored observations");
        for observation in std::mem::take(&mut self.entries).into_values() {
            observation.cancel();
        }
    }
}

impl Extend<Observation> for ObservationSet {
    fn extend<I: IntoIterator<Item = Observation>>(&mut self, iter: I) {
        for observation in iter {
            self.insert(observation);
        }
    }
}
