//! Entities
//!
//! An entity is the transient unit of traffic: created by a source,
//! carried through locations by its process, destroyed on arrival at a
//! sink.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::ProcessId;
use crate::location::LocationId;

/// Entity identifier, unique within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub(crate) u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity-{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct EntityState {
    pub(crate) class: String,
    pub(crate) location: LocationId,
    /// Time the entity entered its current location
    pub(crate) entered_at: f64,
    pub(crate) process: ProcessId,
}

/// Live entities, ordered by creation for deterministic iteration
#[derive(Debug, Default)]
pub(crate) struct EntityTable {
    entities: BTreeMap<EntityId, EntityState>,
    next_id: u64,
}

impl EntityTable {
    pub(crate) fn insert(
        &mut self,
        class: &str,
        location: LocationId,
        entered_at: f64,
        process: ProcessId,
    ) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.entities.insert(
            id,
            EntityState {
                class: class.to_string(),
                location,
                entered_at,
                process,
            },
        );
        id
    }

    pub(crate) fn get(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityState> {
        self.entities.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: EntityId) -> Option<EntityState> {
        self.entities.remove(&id)
    }
}
