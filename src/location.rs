//! Locations
//!
//! Static tree-structured places entities occupy. Every location keeps a
//! time-weighted population dataset, an unweighted entry count and an
//! unweighted time-in-location dataset. `SimQueue` is a location whose
//! population doubles as its `size`; sources and sinks are locations with
//! generator and disposal roles.

use serde::{Deserialize, Serialize};

use crate::data::{DatasetId, ValueType};
use crate::engine::{Kernel, ProcessId};
use crate::entity::EntityId;
use crate::error::{SimError, SimResult};

/// Location identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationId(pub(crate) u32);

/// Role a location plays in the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocationKind {
    Plain,
    Queue,
    Source,
    Sink,
}

impl LocationKind {
    fn element_type(self) -> &'static str {
        match self {
            LocationKind::Plain => "location",
            LocationKind::Queue => "queue",
            LocationKind::Source => "source",
            LocationKind::Sink => "sink",
        }
    }

    fn class_name(self) -> &'static str {
        match self {
            LocationKind::Plain => "Location",
            LocationKind::Queue => "SimQueue",
            LocationKind::Source => "Source",
            LocationKind::Sink => "Sink",
        }
    }
}

#[derive(Debug)]
pub(crate) struct LocationState {
    pub(crate) element: String,
    pub(crate) kind: LocationKind,
    pub(crate) parent: Option<LocationId>,
    pub(crate) children: Vec<LocationId>,
    /// Entities currently inside, in entry order
    pub(crate) population: Vec<EntityId>,
    pub(crate) ds_population: Option<DatasetId>,
    pub(crate) ds_entries: DatasetId,
    pub(crate) ds_time: Option<DatasetId>,
}

#[derive(Debug, Default)]
pub(crate) struct LocationTable {
    list: Vec<LocationState>,
}

impl LocationTable {
    pub(crate) fn get(&self, id: LocationId) -> &LocationState {
        &self.list[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: LocationId) -> &mut LocationState {
        &mut self.list[id.0 as usize]
    }

    pub(crate) fn push(&mut self, state: LocationState) -> LocationId {
        let id = LocationId(self.list.len() as u32);
        self.list.push(state);
        id
    }
}

impl Kernel {
    pub(crate) fn add_location_impl(
        &self,
        parent: Option<LocationId>,
        name: &str,
        kind: LocationKind,
    ) -> SimResult<LocationId> {
        let element = match parent {
            Some(p) => format!("{}.{}", self.locations.borrow().get(p).element, name),
            None => name.to_string(),
        };
        self.claim_element_id(&element)?;

        let (ds_population, ds_entries, ds_time) = {
            let mut data = self.data.borrow_mut();
            data.register_element(&element, kind.class_name(), kind.element_type());
            let population = match kind {
                LocationKind::Sink => None,
                LocationKind::Queue => Some(data.register_dataset(
                    &element,
                    "size",
                    ValueType::Integer,
                    true,
                    self.base_unit,
                    0.0,
                )),
                _ => Some(data.register_dataset(
                    &element,
                    "population",
                    ValueType::Integer,
                    true,
                    self.base_unit,
                    0.0,
                )),
            };
            let entries = data.register_dataset(
                &element,
                "entries",
                ValueType::Integer,
                false,
                self.base_unit,
                0.0,
            );
            let time = match kind {
                LocationKind::Sink => None,
                _ => Some(data.register_dataset(
                    &element,
                    "time",
                    ValueType::Time,
                    false,
                    self.base_unit,
                    0.0,
                )),
            };
            (population, entries, time)
        };

        let id = self.locations.borrow_mut().push(LocationState {
            element,
            kind,
            parent,
            children: Vec::new(),
            population: Vec::new(),
            ds_population,
            ds_entries,
            ds_time,
        });
        if let Some(p) = parent {
            self.locations.borrow_mut().get_mut(p).children.push(id);
        }
        Ok(id)
    }

    /// Place a brand new entity at a location (source arrival path)
    pub(crate) fn create_entity_at(
        &self,
        class: &str,
        location: LocationId,
        process: ProcessId,
    ) -> EntityId {
        let now = self.now.get();
        let entity = self
            .entities
            .borrow_mut()
            .insert(class, location, now, process);
        self.enter_location(entity, location, now);
        entity
    }

    fn enter_location(&self, entity: EntityId, location: LocationId, now: f64) {
        let (population, ds_population, ds_entries) = {
            let mut locations = self.locations.borrow_mut();
            let state = locations.get_mut(location);
            state.population.push(entity);
            (
                state.population.len(),
                state.ds_population,
                state.ds_entries,
            )
        };
        let mut data = self.data.borrow_mut();
        if let Some(ds) = ds_population {
            data.set_level(ds, now, population as f64);
        }
        data.put_value(ds_entries, now, 1.0);
    }

    fn exit_location(&self, entity: EntityId, location: LocationId, entered_at: f64, now: f64) {
        let (population, ds_population, ds_time) = {
            let mut locations = self.locations.borrow_mut();
            let state = locations.get_mut(location);
            state.population.retain(|e| *e != entity);
            (state.population.len(), state.ds_population, state.ds_time)
        };
        let mut data = self.data.borrow_mut();
        if let Some(ds) = ds_population {
            data.set_level(ds, now, population as f64);
        }
        if let Some(ds) = ds_time {
            data.put_value(ds, now, now - entered_at);
        }
    }

    /// Move an entity to a new location, with full entry/exit bookkeeping.
    /// Moving to a sink destroys the entity.
    pub(crate) fn move_entity(&self, entity: EntityId, dest: LocationId) -> SimResult<()> {
        let now = self.now.get();
        let (old, entered_at) = {
            let entities = self.entities.borrow();
            let state = entities.get(entity).ok_or_else(|| {
                SimError::InvalidRequest(format!("{} no longer exists", entity))
            })?;
            (state.location, state.entered_at)
        };
        if old == dest {
            return Ok(());
        }
        self.exit_location(entity, old, entered_at, now);

        let dest_kind = self.locations.borrow().get(dest).kind;
        if dest_kind == LocationKind::Sink {
            let ds_entries = self.locations.borrow().get(dest).ds_entries;
            self.data.borrow_mut().put_value(ds_entries, now, 1.0);
            let _ = self.entities.borrow_mut().remove(entity);
            tracing::trace!(%entity, "entity disposed at sink");
            return Ok(());
        }

        {
            let mut entities = self.entities.borrow_mut();
            if let Some(state) = entities.get_mut(entity) {
                state.location = dest;
                state.entered_at = now;
            }
        }
        self.enter_location(entity, dest, now);
        Ok(())
    }
}

impl crate::engine::Simulation {
    /// Full dotted element id of a location
    pub fn location_element(&self, location: LocationId) -> String {
        self.kernel.locations.borrow().get(location).element.clone()
    }

    pub fn location_parent(&self, location: LocationId) -> Option<LocationId> {
        self.kernel.locations.borrow().get(location).parent
    }

    pub fn location_children(&self, location: LocationId) -> Vec<LocationId> {
        self.kernel.locations.borrow().get(location).children.clone()
    }

    /// Number of entities currently inside a location
    pub fn population(&self, location: LocationId) -> usize {
        self.kernel.locations.borrow().get(location).population.len()
    }

    /// Where an entity currently is; `None` once it reached a sink
    pub fn entity_location(&self, entity: crate::entity::EntityId) -> Option<LocationId> {
        self.kernel
            .entities
            .borrow()
            .get(entity)
            .map(|state| state.location)
    }

    /// The process carrying an entity
    pub fn entity_process(&self, entity: crate::entity::EntityId) -> Option<crate::engine::ProcessId> {
        self.kernel
            .entities
            .borrow()
            .get(entity)
            .map(|state| state.process)
    }
}
