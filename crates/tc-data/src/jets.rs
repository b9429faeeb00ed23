//! Jet collections keyed by event.

use std::collections::BTreeMap;

use tc_core::FourMomentum;

/// Jets of one collection (e.g. `AntiKt4EMTopoJets`), grouped by event id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JetCollection {
    name: String,
    events: BTreeMap<u64, Vec<FourMomentum>>,
}

impl JetCollection {
    /// Empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), events: BTreeMap::new() }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append one jet to an event.
    pub fn push(&mut self, event: u64, jet: FourMomentum) {
        self.events.entry(event).or_default().push(jet);
    }

    /// Replace the jets of an event.
    pub fn set_event(&mut self, event: u64, jets: Vec<FourMomentum>) {
        self.events.insert(event, jets);
    }

    /// Jets of one event (empty when the event has none).
    pub fn jets(&self, event: u64) -> &[FourMomentum] {
        self.events.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Event ids with an entry, ascending.
    pub fn event_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.events.keys().copied()
    }

    /// Iterate `(event, jets)` in ascending event order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[FourMomentum])> + '_ {
        self.events.iter().map(|(&ev, jets)| (ev, jets.as_slice()))
    }

    /// Total number of jets.
    pub fn n_jets(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }
}
