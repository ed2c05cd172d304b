//! Engine core
//!
//! The kernel owns the clock, the event queue and every model table, all
//! behind single-threaded interior mutability: one event dispatches at a
//! time, and a dispatched continuation re-enters the kernel through
//! short-lived borrows. Process bodies are boxed futures polled with a
//! no-op waker; nothing ever runs concurrently inside a run, so a run is a
//! pure function of the model, the configuration and the run index.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::agent::{
    AgentBrain, AgentId, AgentRegistry, Message, MessageId, MessageKind, MessagePayload,
    MsgEndpoint, ResponseWaiter,
};
use crate::config::SimConfig;
use crate::data::{CollectorId, CounterId, DataHub, DataSink, NullSink, ValueType};
use crate::downtime::{DowntimeSchedule, ImmediateTakedown, TakedownPolicy};
use crate::entity::{EntityId, EntityTable};
use crate::error::{SimError, SimResult};
use crate::event::{EventAction, EventId, EventQueue, ResumeSignal};
use crate::location::{LocationId, LocationKind, LocationTable};
use crate::pool::{AssignmentPolicy, DefaultPoolPolicy, PoolId, PoolState};
use crate::process::{ProcessContext, ProcessState, ResumeValue, WaitCell, WaitKind};
use crate::random::{Sampler, StreamRegistry};
use crate::resource::{ClassId, ResourceId, ResourceTable};
use crate::source::GeneratorDef;
use crate::time::{SimTime, TimeUnit};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub(crate) u64);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process-{}", self.0)
    }
}

/// When `run_until` stops
pub enum EndCondition {
    /// Run until simulated time reaches this point
    Time(SimTime),
    /// Run until the event queue drains
    NoEvents,
    /// Run until this many events have been dispatched in total
    Steps(u64),
}

enum RunUntil {
    Time(f64),
    NoEvents,
    Steps(u64),
}

pub(crate) struct Kernel {
    pub(crate) config: SimConfig,
    pub(crate) base_unit: TimeUnit,
    pub(crate) run_index: u32,
    pub(crate) now: Cell<f64>,
    pub(crate) events: RefCell<EventQueue>,
    pub(crate) processes: RefCell<Vec<ProcessState>>,
    pub(crate) entities: RefCell<EntityTable>,
    pub(crate) locations: RefCell<LocationTable>,
    pub(crate) resources: RefCell<ResourceTable>,
    pub(crate) pools: RefCell<Vec<PoolState>>,
    pub(crate) agents: RefCell<AgentRegistry>,
    pub(crate) data: RefCell<DataHub>,
    pub(crate) rng: RefCell<StreamRegistry>,
    pub(crate) generators: RefCell<Vec<GeneratorDef>>,
    pub(crate) pending_responses: RefCell<BTreeMap<MessageId, ResponseWaiter>>,
    pub(crate) element_ids: RefCell<HashSet<String>>,
    pub(crate) next_msg_id: Cell<u64>,
    pub(crate) fatal: RefCell<Option<SimError>>,
    pub(crate) steps: Cell<u64>,
    pub(crate) traced: Cell<u64>,
    pub(crate) weak_self: Weak<Kernel>,
}

impl Kernel {
    fn new(config: SimConfig, run_index: u32, sink: Box<dyn DataSink>) -> SimResult<Rc<Self>> {
        config.validate()?;
        if run_index == 0 || run_index > config.max_replications {
            return Err(SimError::InvalidRequest(format!(
                "run index {} outside 1..={}",
                run_index, config.max_replications
            )));
        }
        let data = DataHub::new(&config, run_index, sink)?;
        let rng = StreamRegistry::new(run_index, config.streams_per_run);
        let base_unit = config.base_time_unit;
        Ok(Rc::new_cyclic(|weak| Kernel {
            config,
            base_unit,
            run_index,
            now: Cell::new(0.0),
            events: RefCell::new(EventQueue::new()),
            processes: RefCell::new(Vec::new()),
            entities: RefCell::new(EntityTable::default()),
            locations: RefCell::new(LocationTable::default()),
            resources: RefCell::new(ResourceTable::default()),
            pools: RefCell::new(Vec::new()),
            agents: RefCell::new(AgentRegistry::default()),
            data: RefCell::new(data),
            rng: RefCell::new(rng),
            generators: RefCell::new(Vec::new()),
            pending_responses: RefCell::new(BTreeMap::new()),
            element_ids: RefCell::new(HashSet::new()),
            next_msg_id: Cell::new(0),
            fatal: RefCell::new(None),
            steps: Cell::new(0),
            traced: Cell::new(0),
            weak_self: weak.clone(),
        }))
    }

    pub(crate) fn now_time(&self) -> SimTime {
        SimTime::from_ticks(self.now.get(), self.base_unit)
    }

    /// Normalize a model-facing time into base-unit ticks
    pub(crate) fn ticks(&self, time: SimTime) -> SimResult<f64> {
        time.to_ticks(self.base_unit)
    }

    /// Element ids are unique within a run
    pub(crate) fn claim_element_id(&self, id: &str) -> SimResult<()> {
        if id.is_empty() {
            return Err(SimError::InvalidRequest(
                "element id cannot be empty".to_string(),
            ));
        }
        if !self.element_ids.borrow_mut().insert(id.to_string()) {
            return Err(SimError::InvalidRequest(format!(
                "duplicate element id {}",
                id
            )));
        }
        Ok(())
    }

    /// Internal absolute-time scheduling. A target in the past is an
    /// engine bug: the run is halted and the event lands at `now` so the
    /// loop can wind down.
    pub(crate) fn schedule_at_ticks(&self, time: f64, action: EventAction) -> EventId {
        let now = self.now.get();
        let time = if time < now {
            self.halt_with(SimError::SchedulerInvariant(format!(
                "scheduling at {} behind the clock {}",
                time, now
            )));
            now
        } else {
            time
        };
        self.events.borrow_mut().push(time, action)
    }

    /// Model-facing relative scheduling; negative delays are rejected
    pub(crate) fn schedule_in(&self, delay: SimTime, action: EventAction) -> SimResult<EventId> {
        let delta = self.ticks(delay)?;
        if delta < 0.0 {
            return Err(SimError::InvalidRequest(format!(
                "negative schedule delay {}",
                delta
            )));
        }
        Ok(self.events.borrow_mut().push(self.now.get() + delta, action))
    }

    /// Queue a process resumption at the current time, behind every event
    /// already scheduled at it
    pub(crate) fn schedule_resume(&self, process: ProcessId, token: u64, outcome: ResumeSignal) {
        self.schedule_at_ticks(
            self.now.get(),
            EventAction::Resume {
                process,
                token,
                outcome,
            },
        );
    }

    pub(crate) fn sample_ticks(&self, sampler: &Sampler) -> SimResult<f64> {
        self.rng.borrow_mut().sample(sampler)
    }

    /// Record a fatal error; the run loop surfaces it before the next
    /// dispatch. The first error wins.
    pub(crate) fn halt_with(&self, err: SimError) {
        let mut fatal = self.fatal.borrow_mut();
        if fatal.is_none() {
            tracing::error!(error = %err, "run halted");
            *fatal = Some(err);
        }
    }

    // process lifecycle

    pub(crate) fn new_process(
        &self,
        name: &str,
        priority: i64,
        entity: Option<EntityId>,
        ds_entries: Option<crate::data::DatasetId>,
        ds_process_time: Option<crate::data::DatasetId>,
    ) -> ProcessId {
        let mut processes = self.processes.borrow_mut();
        let pid = ProcessId(processes.len() as u64);
        processes.push(ProcessState {
            name: name.to_string(),
            priority,
            entity,
            future: None,
            started_at: self.now.get(),
            done: false,
            next_token: 0,
            active_token: None,
            wait_kind: WaitKind::None,
            wait_cell: Rc::new(WaitCell::default()),
            holdings: Vec::new(),
            ds_entries,
            ds_process_time,
        });
        pid
    }

    pub(crate) fn process_priority(&self, process: ProcessId) -> i64 {
        self.processes.borrow()[process.0 as usize].priority
    }

    pub(crate) fn add_holding(&self, process: ProcessId, assignment: crate::resource::AssignmentId) {
        if let Some(state) = self.processes.borrow_mut().get_mut(process.0 as usize) {
            state.holdings.push(assignment);
        }
    }

    // tolerant of teardown: assignment guards dropped with the process
    // table already drained must not index into it
    pub(crate) fn remove_holding(
        &self,
        process: ProcessId,
        assignment: crate::resource::AssignmentId,
    ) {
        if let Some(state) = self.processes.borrow_mut().get_mut(process.0 as usize) {
            state.holdings.retain(|a| *a != assignment);
        }
    }

    /// Arm a fresh wait and hand back its token and mailbox
    pub(crate) fn begin_wait(&self, process: ProcessId) -> (u64, Rc<WaitCell>) {
        let mut processes = self.processes.borrow_mut();
        let state = &mut processes[process.0 as usize];
        let token = state.next_token;
        state.next_token += 1;
        state.active_token = Some(token);
        state.wait_kind = WaitKind::None;
        state.wait_cell = Rc::new(WaitCell::default());
        (token, Rc::clone(&state.wait_cell))
    }

    pub(crate) fn set_wait_kind(&self, process: ProcessId, kind: WaitKind) {
        self.processes.borrow_mut()[process.0 as usize].wait_kind = kind;
    }

    pub(crate) fn clear_wait(&self, process: ProcessId) {
        let mut processes = self.processes.borrow_mut();
        let state = &mut processes[process.0 as usize];
        state.active_token = None;
        state.wait_kind = WaitKind::None;
    }

    /// Deliver an outcome into a process's armed wait and poll it. Stale
    /// tokens fall through silently: the wait was already completed by a
    /// different path.
    pub(crate) fn complete_wait(
        &self,
        process: ProcessId,
        token: u64,
        outcome: SimResult<ResumeValue>,
    ) {
        let cell = {
            let mut processes = self.processes.borrow_mut();
            let state = match processes.get_mut(process.0 as usize) {
                Some(state) => state,
                None => return,
            };
            if state.done || state.active_token != Some(token) {
                return;
            }
            state.active_token = None;
            state.wait_kind = WaitKind::None;
            Rc::clone(&state.wait_cell)
        };
        *cell.outcome.borrow_mut() = Some(outcome);
        self.poll_process(process);
    }

    /// Run a process until its next suspension or completion. No borrows
    /// are held across the poll, so the body re-enters the kernel freely.
    pub(crate) fn poll_process(&self, process: ProcessId) {
        let mut future = {
            let mut processes = self.processes.borrow_mut();
            let state = match processes.get_mut(process.0 as usize) {
                Some(state) => state,
                None => return,
            };
            if state.done {
                return;
            }
            match state.future.take() {
                Some(f) => f,
                // mid-poll already; the stored outcome is picked up when
                // execution reaches the next await
                None => return,
            }
        };
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Pending => {
                self.processes.borrow_mut()[process.0 as usize].future = Some(future);
            }
            Poll::Ready(result) => self.finish_process(process, result),
        }
    }

    /// Completion bookkeeping: every still-held assignment is released on
    /// every exit path, then the process is retired.
    fn finish_process(&self, process: ProcessId, result: SimResult<()>) {
        let now = self.now.get();
        let (holdings, started_at, ds_process_time) = {
            let mut processes = self.processes.borrow_mut();
            let state = &mut processes[process.0 as usize];
            state.done = true;
            state.active_token = None;
            state.wait_kind = WaitKind::None;
            (
                std::mem::take(&mut state.holdings),
                state.started_at,
                state.ds_process_time,
            )
        };
        for assignment in holdings {
            self.release_assignment(assignment);
        }
        if let Some(ds) = ds_process_time {
            self.data.borrow_mut().put_value(ds, now, now - started_at);
        }
        match result {
            Ok(()) => tracing::trace!(%process, "process completed"),
            Err(err) => {
                tracing::error!(%process, error = %err, "process failed");
                let fatal = match err {
                    SimError::SchedulerInvariant(_) => err,
                    other => SimError::Model(other.to_string()),
                };
                self.halt_with(fatal);
            }
        }
    }

    /// Raise an error into a suspended process, first unwinding whatever
    /// it was blocked on.
    pub(crate) fn inject_error(&self, process: ProcessId, err: SimError) {
        let armed = {
            let processes = self.processes.borrow();
            match processes.get(process.0 as usize) {
                Some(state) if !state.done && state.future.is_some() => {
                    state.active_token.map(|token| (token, state.wait_kind))
                }
                _ => None,
            }
        };
        let (token, kind) = match armed {
            Some(armed) => armed,
            None => {
                tracing::warn!(%process, "error injection with no armed wait");
                return;
            }
        };
        match kind {
            WaitKind::None => {}
            WaitKind::Timer { event } => self.events.borrow_mut().cancel(event),
            WaitKind::Acquire { request } => self.withdraw_request(request),
            WaitKind::Response { message } => self.cancel_pending_response(message),
            WaitKind::Counter { counter } => self
                .data
                .borrow_mut()
                .counter_remove_waiter(counter, process),
            WaitKind::ResourceUp { resource } => self.remove_up_waiter(resource, process),
        }
        self.complete_wait(process, token, Err(err));
    }

    fn cancel_pending_response(&self, message: MessageId) {
        let waiter = self.pending_responses.borrow_mut().remove(&message);
        if let Some(waiter) = waiter {
            if let Some(event) = waiter.timeout_event {
                self.events.borrow_mut().cancel(event);
            }
            self.agents
                .borrow_mut()
                .get_mut(waiter.receiver)
                .queue
                .retain(|m| m.id != message);
        }
    }

    /// Synchronous send: the waiter suspends until the receiver responds
    /// or the timeout fires.
    pub(crate) fn send_sync_message(
        &self,
        process: ProcessId,
        token: u64,
        to: AgentId,
        kind: MessageKind,
        value: serde_json::Value,
        timeout: Option<SimTime>,
    ) -> SimResult<()> {
        let id = self.next_message_id();
        self.pending_responses.borrow_mut().insert(
            id,
            ResponseWaiter {
                process,
                token,
                receiver: to,
                timeout_event: None,
            },
        );
        self.set_wait_kind(process, WaitKind::Response { message: id });
        let msg = Message {
            id,
            kind,
            sender: MsgEndpoint::Process(process),
            receiver: to,
            payload: MessagePayload::Value(value),
            response_to: None,
        };
        self.agents.borrow_mut().get_mut(to).queue.push_back(msg);
        self.pump_agent(to);
        if let Some(timeout) = timeout {
            let pending = self.pending_responses.borrow().contains_key(&id);
            if pending {
                let event = self.schedule_in(timeout, EventAction::ResponseTimeout { message: id })?;
                if let Some(waiter) = self.pending_responses.borrow_mut().get_mut(&id) {
                    waiter.timeout_event = Some(event);
                }
            }
        }
        Ok(())
    }

    /// First poll of a process body
    pub(crate) fn start_process(&self, process: ProcessId) {
        let ds_entries = {
            let mut processes = self.processes.borrow_mut();
            let state = &mut processes[process.0 as usize];
            if state.done {
                return;
            }
            state.started_at = self.now.get();
            state.ds_entries
        };
        if let Some(ds) = ds_entries {
            let now = self.now.get();
            self.data.borrow_mut().put_value(ds, now, 1.0);
        }
        self.poll_process(process);
    }

    /// A scheduled resume fired. Stale resumes that carry a committed
    /// assignment give the units straight back.
    fn deliver_resume(&self, process: ProcessId, token: u64, outcome: ResumeSignal) {
        let valid = {
            let processes = self.processes.borrow();
            let state = &processes[process.0 as usize];
            !state.done && state.active_token == Some(token)
        };
        if !valid {
            if let ResumeSignal::Assignment(assignment) = outcome {
                self.release_assignment(assignment);
            }
            return;
        }
        let value = match outcome {
            ResumeSignal::Timer => ResumeValue::Timer,
            ResumeSignal::Assignment(assignment) => ResumeValue::Assignment(
                crate::process::ResourceAssignment::new(self.weak_self.clone(), assignment),
            ),
            ResumeSignal::Response(value) => ResumeValue::Response(value),
            ResumeSignal::Counter => ResumeValue::Counter,
            ResumeSignal::ResourceUp => ResumeValue::ResourceUp,
        };
        self.complete_wait(process, token, Ok(value));
    }

    fn dispatch(&self, action: EventAction) {
        match action {
            EventAction::StartProcess { process } => self.start_process(process),
            EventAction::Resume {
                process,
                token,
                outcome,
            } => self.deliver_resume(process, token, outcome),
            EventAction::AcquireTimeout { request } => self.acquire_timed_out(request),
            EventAction::ResponseTimeout { message } => self.response_timed_out(message),
            EventAction::SourceArrival { source, generator } => {
                self.source_arrival(source, generator)
            }
            EventAction::AgentTimer { agent, tag } => self.agent_timer(agent, tag),
            EventAction::GoingDownExpired { resource } => self.going_down_expired(resource),
            EventAction::BatchBoundary => {
                let now = self.now.get();
                self.data.borrow_mut().next_batch(now);
            }
        }
    }

    fn trace_event(&self, time: f64, action: &EventAction) {
        if !self.config.trace.enabled {
            return;
        }
        let traced = self.traced.get();
        if traced < self.config.trace.max_events {
            tracing::trace!(target: "procsim::events", time, ?action, "dispatch");
            self.traced.set(traced + 1);
        }
    }

    fn run(&self, until: RunUntil) -> SimResult<()> {
        loop {
            if let Some(err) = self.fatal.borrow_mut().take() {
                return Err(err);
            }
            match until {
                RunUntil::Time(stop) => {
                    let next = self.events.borrow_mut().peek_time();
                    let proceed = matches!(next, Some(t) if t <= stop);
                    if !proceed {
                        if stop > self.now.get() {
                            self.now.set(stop);
                        }
                        return Ok(());
                    }
                }
                RunUntil::NoEvents => {
                    if self.events.borrow_mut().is_empty() {
                        return Ok(());
                    }
                }
                RunUntil::Steps(steps) => {
                    if self.steps.get() >= steps {
                        return Ok(());
                    }
                }
            }
            let (time, action) = match self.events.borrow_mut().pop() {
                Some(event) => event,
                None => return Ok(()),
            };
            if time < self.now.get() {
                return Err(SimError::SchedulerInvariant(format!(
                    "event at {} popped behind the clock {}",
                    time,
                    self.now.get()
                )));
            }
            self.now.set(time);
            self.trace_event(time, &action);
            self.dispatch(action);
            self.steps.set(self.steps.get() + 1);
            #[cfg(debug_assertions)]
            self.check_invariants();
        }
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        let table = self.resources.borrow();
        for state in &table.resources {
            debug_assert!(
                state.in_use + state.down_units <= state.capacity,
                "capacity accounting broke on {}",
                state.element
            );
        }
    }
}

/// A single simulation run: model construction plus the event loop.
///
/// Build the static model (locations, resources, pools, sources,
/// downtime), then drive it with [`run_until`](Simulation::run_until) or
/// the warmup-and-batches protocol of
/// [`run_single`](Simulation::run_single).
pub struct Simulation {
    pub(crate) kernel: Rc<Kernel>,
}

impl Simulation {
    /// A run with the default (discarding) sink and run index 1
    pub fn new(config: SimConfig) -> SimResult<Self> {
        Self::with_sink(config, 1, Box::new(NullSink))
    }

    /// A specific replication emitting to an injected sink
    pub fn with_sink(
        config: SimConfig,
        run_index: u32,
        sink: Box<dyn DataSink>,
    ) -> SimResult<Self> {
        Ok(Self {
            kernel: Kernel::new(config, run_index, sink)?,
        })
    }

    /// Current simulated time
    pub fn now(&self) -> SimTime {
        self.kernel.now_time()
    }

    pub fn config(&self) -> &SimConfig {
        &self.kernel.config
    }

    pub fn run_index(&self) -> u32 {
        self.kernel.run_index
    }

    /// Draw a sample outside any process (model setup)
    pub fn sample(&self, sampler: &Sampler) -> SimResult<f64> {
        self.kernel.sample_ticks(sampler)
    }

    // static model construction

    pub fn add_location(&mut self, parent: Option<LocationId>, name: &str) -> SimResult<LocationId> {
        self.kernel.add_location_impl(parent, name, LocationKind::Plain)
    }

    /// A FIFO queue location; its population dataset is named `size`
    pub fn add_queue(&mut self, parent: Option<LocationId>, name: &str) -> SimResult<LocationId> {
        self.kernel.add_location_impl(parent, name, LocationKind::Queue)
    }

    pub fn add_source(&mut self, parent: Option<LocationId>, name: &str) -> SimResult<LocationId> {
        self.kernel.add_location_impl(parent, name, LocationKind::Source)
    }

    pub fn add_sink(&mut self, parent: Option<LocationId>, name: &str) -> SimResult<LocationId> {
        self.kernel.add_location_impl(parent, name, LocationKind::Sink)
    }

    pub fn add_resource(&mut self, name: &str, capacity: u32) -> SimResult<ResourceId> {
        self.kernel.add_resource_impl(name, capacity, None)
    }

    pub fn add_resource_in_class(
        &mut self,
        name: &str,
        capacity: u32,
        class: ClassId,
    ) -> SimResult<ResourceId> {
        self.kernel.add_resource_impl(name, capacity, Some(class))
    }

    pub fn add_resource_class(&mut self, name: &str, parent: Option<ClassId>) -> ClassId {
        self.kernel.add_resource_class_impl(name, parent)
    }

    /// A pool running the default maximizing assignment pass
    pub fn add_pool(&mut self, name: &str) -> SimResult<PoolId> {
        self.kernel
            .add_pool_impl(name, Box::new(DefaultPoolPolicy))
    }

    /// A pool running a model-defined assignment pass
    pub fn add_pool_with_policy(
        &mut self,
        name: &str,
        policy: Box<dyn AssignmentPolicy>,
    ) -> SimResult<PoolId> {
        self.kernel.add_pool_impl(name, policy)
    }

    pub fn add_to_pool(&mut self, pool: PoolId, resource: ResourceId) -> SimResult<()> {
        self.kernel.pool_add_member(pool, resource)
    }

    /// Scheduled downtime with the default immediate-takedown policy
    pub fn add_scheduled_downtime(
        &mut self,
        name: &str,
        resource: ResourceId,
        schedule: DowntimeSchedule,
    ) -> SimResult<AgentId> {
        self.kernel
            .add_scheduled_downtime_impl(name, resource, &schedule, Box::new(ImmediateTakedown))
    }

    /// Scheduled downtime with a custom takedown policy (peer
    /// coordination, soft-stops)
    pub fn add_scheduled_downtime_with_policy(
        &mut self,
        name: &str,
        resource: ResourceId,
        schedule: DowntimeSchedule,
        policy: Box<dyn TakedownPolicy>,
    ) -> SimResult<AgentId> {
        self.kernel
            .add_scheduled_downtime_impl(name, resource, &schedule, policy)
    }

    /// Failure-driven downtime from time-to-failure / time-to-repair draws
    pub fn add_failure_agent(
        &mut self,
        name: &str,
        resource: ResourceId,
        time_to_failure: Sampler,
        time_to_repair: Sampler,
    ) -> SimResult<AgentId> {
        self.kernel
            .add_failure_agent_impl(name, resource, time_to_failure, time_to_repair)
    }

    /// Register a model-defined agent
    pub fn add_agent(
        &mut self,
        name: &str,
        behavior: Box<dyn crate::agent::AgentBehavior>,
    ) -> SimResult<AgentId> {
        self.kernel.claim_element_id(name)?;
        self.kernel
            .data
            .borrow_mut()
            .register_element(name, "Agent", "agent");
        Ok(self
            .kernel
            .agents
            .borrow_mut()
            .add(name.to_string(), AgentBrain::User(behavior)))
    }

    /// Subscribe an agent to a message kind published by another agent
    pub fn subscribe(&mut self, publisher: AgentId, kind: MessageKind, subscriber: AgentId) {
        self.kernel.subscribe(publisher, kind, subscriber);
    }

    pub fn unsubscribe(&mut self, publisher: AgentId, kind: MessageKind, subscriber: AgentId) {
        self.kernel.unsubscribe(publisher, kind, subscriber);
    }

    /// The assignment agent fronting a resource (its own, or its pool's)
    pub fn resource_agent(&self, resource: ResourceId) -> AgentId {
        self.kernel.resources.borrow().get(resource).agent
    }

    /// Element id an agent was registered under
    pub fn agent_element(&self, agent: AgentId) -> String {
        self.kernel.agents.borrow().get(agent).element.clone()
    }

    /// A time-weighted counter, optionally capacity-bounded
    pub fn add_counter(&mut self, name: &str, capacity: Option<u32>) -> SimResult<CounterId> {
        self.kernel.claim_element_id(name)?;
        let dataset = {
            let mut data = self.kernel.data.borrow_mut();
            data.register_element(name, "Counter", "counter");
            data.register_dataset(
                name,
                "count",
                ValueType::Integer,
                true,
                self.kernel.base_unit,
                0.0,
            )
        };
        Ok(self.kernel.data.borrow_mut().add_counter(dataset, capacity))
    }

    /// An unweighted value collector
    pub fn add_collector(&mut self, name: &str) -> SimResult<CollectorId> {
        self.kernel.claim_element_id(name)?;
        let dataset = {
            let mut data = self.kernel.data.borrow_mut();
            data.register_element(name, "Collector", "collector");
            data.register_dataset(
                name,
                "values",
                ValueType::Real,
                false,
                self.kernel.base_unit,
                0.0,
            )
        };
        Ok(self.kernel.data.borrow_mut().add_collector(dataset))
    }

    /// Spawn a standalone process (no entity, no generator). The body
    /// starts at the current simulated time.
    pub fn spawn<F, Fut>(&mut self, name: &str, priority: i64, body: F) -> SimResult<ProcessId>
    where
        F: FnOnce(ProcessContext) -> Fut,
        Fut: Future<Output = SimResult<()>> + 'static,
    {
        let pid = self.kernel.new_process(name, priority, None, None, None);
        let ctx = ProcessContext {
            kernel: Rc::clone(&self.kernel),
            pid,
        };
        let future = body(ctx).boxed_local();
        self.kernel.processes.borrow_mut()[pid.0 as usize].future = Some(future);
        self.kernel.schedule_at_ticks(
            self.kernel.now.get(),
            EventAction::StartProcess { process: pid },
        );
        Ok(pid)
    }

    /// Drive the event loop until the condition is met
    pub fn run_until(&mut self, until: EndCondition) -> SimResult<()> {
        let until = match until {
            EndCondition::Time(stop) => RunUntil::Time(self.kernel.ticks(stop)?),
            EndCondition::NoEvents => RunUntil::NoEvents,
            EndCondition::Steps(steps) => RunUntil::Steps(steps),
        };
        self.kernel.run(until)
    }

    pub(crate) fn run_to_ticks(&mut self, stop: f64) -> SimResult<()> {
        self.kernel.run(RunUntil::Time(stop))
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        // process futures capture Rc<Kernel>; dropping them here breaks
        // the reference cycles. The tables are taken out first so guard
        // destructors re-entering the kernel see no outstanding borrow.
        let processes = std::mem::take(&mut *self.kernel.processes.borrow_mut());
        drop(processes);
        let generators = std::mem::take(&mut *self.kernel.generators.borrow_mut());
        drop(generators);
    }
}
