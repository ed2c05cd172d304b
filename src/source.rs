//! Sources and entity generators
//!
//! A source is a location that creates entities. Each attached generator
//! draws interarrival times from its own sampler, instantiates an entity
//! and its process on every fire, and immediately draws the next fire.
//! Generators on one source run independent schedules.

use std::future::Future;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::data::{DatasetId, ValueType};
use crate::engine::{Kernel, Simulation};
use crate::entity::EntityId;
use crate::error::{SimError, SimResult};
use crate::event::EventAction;
use crate::location::{LocationId, LocationKind};
use crate::process::ProcessContext;
use crate::random::Sampler;

type ProcessFactory = Box<dyn Fn(ProcessContext, EntityId) -> LocalBoxFuture<'static, SimResult<()>>>;

pub(crate) struct GeneratorDef {
    pub(crate) entity_class: String,
    pub(crate) process_element: String,
    pub(crate) ds_entries: DatasetId,
    pub(crate) ds_process_time: DatasetId,
    pub(crate) priority: i64,
    pub(crate) interarrival: Sampler,
    pub(crate) factory: ProcessFactory,
}

impl Simulation {
    /// Attach an entity generator to a source.
    ///
    /// `process_name` becomes the element the per-class `entries` and
    /// `process_time` datasets hang off. The factory runs once per
    /// arrival and returns the process body for that entity.
    pub fn add_generator<F, Fut>(
        &mut self,
        source: LocationId,
        entity_class: &str,
        process_name: &str,
        interarrival: Sampler,
        factory: F,
    ) -> SimResult<()>
    where
        F: Fn(ProcessContext, EntityId) -> Fut + 'static,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        self.add_generator_with_priority(source, entity_class, process_name, interarrival, 0, factory)
    }

    /// `add_generator` with an explicit process priority
    pub fn add_generator_with_priority<F, Fut>(
        &mut self,
        source: LocationId,
        entity_class: &str,
        process_name: &str,
        interarrival: Sampler,
        priority: i64,
        factory: F,
    ) -> SimResult<()>
    where
        F: Fn(ProcessContext, EntityId) -> Fut + 'static,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        let kernel = Rc::clone(&self.kernel);
        {
            let locations = kernel.locations.borrow();
            if locations.get(source).kind != LocationKind::Source {
                return Err(SimError::InvalidRequest(format!(
                    "{} is not a source",
                    locations.get(source).element
                )));
            }
        }
        kernel.claim_element_id(process_name)?;
        let (ds_entries, ds_process_time) = {
            let mut data = kernel.data.borrow_mut();
            data.register_element(process_name, entity_class, "process");
            (
                data.register_dataset(
                    process_name,
                    "entries",
                    ValueType::Integer,
                    false,
                    kernel.base_unit,
                    0.0,
                ),
                data.register_dataset(
                    process_name,
                    "process_time",
                    ValueType::Time,
                    false,
                    kernel.base_unit,
                    0.0,
                ),
            )
        };
        let index = {
            let mut generators = kernel.generators.borrow_mut();
            generators.push(GeneratorDef {
                entity_class: entity_class.to_string(),
                process_element: process_name.to_string(),
                ds_entries,
                ds_process_time,
                priority,
                interarrival,
                factory: Box::new(move |ctx, entity| factory(ctx, entity).boxed_local()),
            });
            generators.len() - 1
        };
        // the first interarrival draw happens now; the first entity
        // arrives one draw later
        let delay = kernel.sample_ticks(&interarrival)?.max(0.0);
        kernel.schedule_at_ticks(
            kernel.now.get() + delay,
            EventAction::SourceArrival {
                source,
                generator: index,
            },
        );
        Ok(())
    }
}

impl Kernel {
    /// One generator fire: draw the next arrival, build the entity and
    /// its process, and start the process at the current time.
    pub(crate) fn source_arrival(&self, source: LocationId, generator: usize) {
        let (interarrival, entity_class, process_element, priority, ds_entries, ds_process_time) = {
            let generators = self.generators.borrow();
            let def = match generators.get(generator) {
                Some(def) => def,
                None => return,
            };
            (
                def.interarrival,
                def.entity_class.clone(),
                def.process_element.clone(),
                def.priority,
                def.ds_entries,
                def.ds_process_time,
            )
        };

        match self.sample_ticks(&interarrival) {
            Ok(delay) => {
                self.schedule_at_ticks(
                    self.now.get() + delay.max(0.0),
                    EventAction::SourceArrival { source, generator },
                );
            }
            Err(err) => {
                self.halt_with(err);
                return;
            }
        }

        let kernel = match self.weak_self.upgrade() {
            Some(kernel) => kernel,
            None => return,
        };
        let pid = self.new_process(
            &format!("{}-{}", process_element, self.processes.borrow().len()),
            priority,
            None,
            Some(ds_entries),
            Some(ds_process_time),
        );
        let entity = self.create_entity_at(&entity_class, source, pid);
        self.processes.borrow_mut()[pid.0 as usize].entity = Some(entity);

        let ctx = ProcessContext { kernel, pid };
        let future = {
            let generators = self.generators.borrow();
            (generators[generator].factory)(ctx, entity)
        };
        self.processes.borrow_mut()[pid.0 as usize].future = Some(future);
        self.schedule_at_ticks(self.now.get(), EventAction::StartProcess { process: pid });
        tracing::trace!(%entity, class = %entity_class, "entity generated");
    }
}
