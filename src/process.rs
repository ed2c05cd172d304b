//! Processes
//!
//! A process wraps a plain `async` body polled by the engine's
//! single-threaded loop. The body suspends at exactly `wait_for`,
//! `acquire`, `acquire_from`, synchronous sends and capped-counter
//! increments; everything else runs to completion within one event
//! dispatch. Completion (normal or error) releases every assignment the
//! process still holds.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;

use crate::agent::{AgentId, MessageKind, MessagePayload, MsgEndpoint};
use crate::data::{CollectorId, CounterId, CounterWaiter, DatasetId};
use crate::engine::{Kernel, ProcessId};
use crate::entity::EntityId;
use crate::error::{SimError, SimResult};
use crate::event::{EventAction, EventId, ResumeSignal};
use crate::location::LocationId;
use crate::pool::PoolId;
use crate::random::Sampler;
use crate::resource::{AssignmentId, ClassId, RequestId, ResourceId, Selector};
use crate::time::SimTime;

/// What a suspended process is blocked on, kept for cleanup when an error
/// is injected from outside
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitKind {
    None,
    Timer { event: EventId },
    Acquire { request: RequestId },
    Response { message: crate::agent::MessageId },
    Counter { counter: CounterId },
    ResourceUp { resource: ResourceId },
}

/// One-shot mailbox between the kernel and a suspended wait
#[derive(Default)]
pub(crate) struct WaitCell {
    pub(crate) outcome: RefCell<Option<SimResult<ResumeValue>>>,
}

/// Value a resumed wait completes with
pub(crate) enum ResumeValue {
    Timer,
    Assignment(ResourceAssignment),
    Response(serde_json::Value),
    Counter,
    ResourceUp,
}

pub(crate) struct WaitFuture {
    cell: Rc<WaitCell>,
}

impl Future for WaitFuture {
    type Output = SimResult<ResumeValue>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.outcome.borrow_mut().take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

pub(crate) struct ProcessState {
    #[allow(dead_code)]
    pub(crate) name: String,
    pub(crate) priority: i64,
    pub(crate) entity: Option<EntityId>,
    pub(crate) future: Option<LocalBoxFuture<'static, SimResult<()>>>,
    pub(crate) started_at: f64,
    pub(crate) done: bool,
    /// Monotonic per-process wait counter
    pub(crate) next_token: u64,
    /// Token of the wait currently armed, if any
    pub(crate) active_token: Option<u64>,
    pub(crate) wait_kind: WaitKind,
    pub(crate) wait_cell: Rc<WaitCell>,
    pub(crate) holdings: Vec<AssignmentId>,
    /// Per-process-class datasets, set for generator-created processes
    pub(crate) ds_entries: Option<DatasetId>,
    pub(crate) ds_process_time: Option<DatasetId>,
}

/// Options for `acquire`/`acquire_from`
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Request priority; defaults to the process priority
    pub priority: Option<i64>,
    /// Give up after this long with *TimedOut*
    pub timeout: Option<SimTime>,
}

/// Units of a resource (or of several pool members) held by a process.
///
/// Releasing is idempotent and scoped: dropping the assignment releases
/// whatever is still held, so an early return or an error inside the
/// process body can never leak units.
pub struct ResourceAssignment {
    kernel: Weak<Kernel>,
    id: AssignmentId,
}

impl ResourceAssignment {
    pub(crate) fn new(kernel: Weak<Kernel>, id: AssignmentId) -> Self {
        Self { kernel, id }
    }

    /// The `(resource, units)` pairs backing this assignment. Units drop
    /// to zero for resources that were hard taken down while held.
    pub fn resources(&self) -> Vec<(ResourceId, u32)> {
        match self.kernel.upgrade() {
            Some(kernel) => kernel.assignment_resources(self.id),
            None => Vec::new(),
        }
    }

    /// Total units currently held
    pub fn units(&self) -> u32 {
        self.resources().iter().map(|(_, n)| n).sum()
    }

    /// Time the assignment was fulfilled
    pub fn acquired_at(&self) -> SimTime {
        match self.kernel.upgrade() {
            Some(kernel) => SimTime::from_ticks(
                kernel.assignment_acquired_at(self.id),
                kernel.base_unit,
            ),
            None => SimTime::zero(),
        }
    }

    /// Return every unit now instead of at scope exit
    pub fn release(&self) {
        if let Some(kernel) = self.kernel.upgrade() {
            kernel.release_assignment(self.id);
        }
    }
}

impl Drop for ResourceAssignment {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ResourceAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAssignment")
            .field("id", &self.id)
            .finish()
    }
}

/// The engine surface available inside a process body
#[derive(Clone)]
pub struct ProcessContext {
    pub(crate) kernel: Rc<Kernel>,
    pub(crate) pid: ProcessId,
}

impl ProcessContext {
    /// Current simulated time
    pub fn now(&self) -> SimTime {
        self.kernel.now_time()
    }

    pub fn process_id(&self) -> ProcessId {
        self.pid
    }

    /// The entity this process carries, if it was created by a generator
    pub fn entity(&self) -> Option<EntityId> {
        self.kernel.processes.borrow()[self.pid.0 as usize].entity
    }

    /// Draw one sample from a bound distribution
    pub fn sample(&self, sampler: &Sampler) -> SimResult<f64> {
        self.kernel.sample_ticks(sampler)
    }

    /// Suspend for a span of simulated time
    pub async fn wait_for(&self, delta: SimTime) -> SimResult<()> {
        self.wait_for_opts(delta, false).await
    }

    /// `wait_for` that optionally rides out hard take-downs: a
    /// *ResourceDown* raised mid-wait is swallowed, the process waits for
    /// the resource to come back up and then finishes the unexpired
    /// remainder of the original delay.
    pub async fn wait_for_opts(
        &self,
        delta: SimTime,
        extend_through_downtime: bool,
    ) -> SimResult<()> {
        let mut remaining = self.kernel.ticks(delta)?;
        if remaining < 0.0 {
            return Err(SimError::InvalidRequest(format!(
                "negative wait_for delay {}",
                remaining
            )));
        }
        loop {
            let slept_from = self.kernel.now.get();
            match self.sleep_ticks(remaining).await {
                Ok(()) => return Ok(()),
                Err(SimError::ResourceDown { resource }) if extend_through_downtime => {
                    let elapsed = self.kernel.now.get() - slept_from;
                    remaining = (remaining - elapsed).max(0.0);
                    self.await_resource_up(resource).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn sleep_ticks(&self, ticks: f64) -> SimResult<()> {
        let (token, cell) = self.kernel.begin_wait(self.pid);
        let at = self.kernel.now.get() + ticks;
        let event = self.kernel.schedule_at_ticks(
            at,
            EventAction::Resume {
                process: self.pid,
                token,
                outcome: ResumeSignal::Timer,
            },
        );
        self.kernel
            .set_wait_kind(self.pid, WaitKind::Timer { event });
        match (WaitFuture { cell }).await? {
            ResumeValue::Timer => Ok(()),
            _ => Err(SimError::SchedulerInvariant(
                "timer wait resumed with a foreign signal".to_string(),
            )),
        }
    }

    /// Suspend until a downed resource is brought back up
    async fn await_resource_up(&self, resource: ResourceId) -> SimResult<()> {
        let snapshot = self.kernel.resource_snapshot(resource);
        if !snapshot.is_down() {
            return Ok(());
        }
        let (token, cell) = self.kernel.begin_wait(self.pid);
        self.kernel.register_up_waiter(resource, self.pid, token);
        self.kernel
            .set_wait_kind(self.pid, WaitKind::ResourceUp { resource });
        match (WaitFuture { cell }).await? {
            ResumeValue::ResourceUp => Ok(()),
            _ => Err(SimError::SchedulerInvariant(
                "resource-up wait resumed with a foreign signal".to_string(),
            )),
        }
    }

    /// Acquire `units` of a resource, suspending until assigned
    pub async fn acquire(
        &self,
        resource: ResourceId,
        units: u32,
    ) -> SimResult<ResourceAssignment> {
        self.acquire_with(resource, units, AcquireOptions::default())
            .await
    }

    /// `acquire` with an explicit priority and/or timeout
    pub async fn acquire_with(
        &self,
        resource: ResourceId,
        units: u32,
        options: AcquireOptions,
    ) -> SimResult<ResourceAssignment> {
        let (token, cell) = self.kernel.begin_wait(self.pid);
        let priority = options
            .priority
            .unwrap_or_else(|| self.kernel.process_priority(self.pid));
        let entity = self.entity();
        let made = self.kernel.make_request(
            self.pid,
            token,
            entity,
            Selector::Resource(resource),
            units,
            priority,
        );
        let (request, agent) = match made {
            Ok(r) => r,
            Err(err) => {
                self.kernel.clear_wait(self.pid);
                return Err(err);
            }
        };
        self.post_request(request, agent, options.timeout, cell).await
    }

    /// Acquire `units` of any pool member matching a resource class
    pub async fn acquire_from(
        &self,
        pool: PoolId,
        class: ClassId,
        units: u32,
    ) -> SimResult<ResourceAssignment> {
        self.acquire_from_with(pool, class, units, AcquireOptions::default())
            .await
    }

    /// `acquire_from` with an explicit priority and/or timeout
    pub async fn acquire_from_with(
        &self,
        pool: PoolId,
        class: ClassId,
        units: u32,
        options: AcquireOptions,
    ) -> SimResult<ResourceAssignment> {
        let (token, cell) = self.kernel.begin_wait(self.pid);
        let priority = options
            .priority
            .unwrap_or_else(|| self.kernel.process_priority(self.pid));
        let entity = self.entity();
        let made = self
            .kernel
            .make_pool_request(self.pid, token, entity, pool, class, units, priority);
        let (request, agent) = match made {
            Ok(r) => r,
            Err(err) => {
                self.kernel.clear_wait(self.pid);
                return Err(err);
            }
        };
        self.post_request(request, agent, options.timeout, cell).await
    }

    async fn post_request(
        &self,
        request: RequestId,
        agent: AgentId,
        timeout: Option<SimTime>,
        cell: Rc<WaitCell>,
    ) -> SimResult<ResourceAssignment> {
        self.kernel
            .set_wait_kind(self.pid, WaitKind::Acquire { request });
        self.kernel.send_message(
            MsgEndpoint::Process(self.pid),
            agent,
            MessageKind::ResourceRequest,
            MessagePayload::Request(request),
            None,
        );
        // armed after the first pass so an immediate fulfillment never
        // races its own timeout
        if let Some(timeout) = timeout {
            if let Err(err) = self.kernel.arm_request_timeout(request, timeout) {
                self.kernel.withdraw_request(request);
                self.kernel.clear_wait(self.pid);
                return Err(err);
            }
        }
        match (WaitFuture { cell }).await? {
            ResumeValue::Assignment(assignment) => Ok(assignment),
            _ => Err(SimError::SchedulerInvariant(
                "acquire resumed with a foreign signal".to_string(),
            )),
        }
    }

    /// Return an assignment's units; equivalent to `assignment.release()`
    pub fn release(&self, assignment: &ResourceAssignment) {
        assignment.release();
    }

    /// Move this process's entity to a location. Arrival at a sink
    /// destroys the entity.
    pub fn move_to(&self, location: LocationId) -> SimResult<()> {
        let entity = self.entity().ok_or_else(|| {
            SimError::InvalidRequest("process has no entity to move".to_string())
        })?;
        self.kernel.move_entity(entity, location)
    }

    /// Fire-and-forget message to an agent
    pub fn send_async(&self, to: AgentId, kind: MessageKind, value: serde_json::Value) {
        self.kernel.send_message(
            MsgEndpoint::Process(self.pid),
            to,
            kind,
            MessagePayload::Value(value),
            None,
        );
    }

    /// Synchronous send: suspend until the agent responds
    pub async fn send_sync(
        &self,
        to: AgentId,
        kind: MessageKind,
        value: serde_json::Value,
    ) -> SimResult<serde_json::Value> {
        self.send_sync_opts(to, kind, value, None).await
    }

    /// Synchronous send bounded by a timeout; *TimedOut* if no response
    /// arrives in time
    pub async fn send_sync_with_timeout(
        &self,
        to: AgentId,
        kind: MessageKind,
        value: serde_json::Value,
        timeout: SimTime,
    ) -> SimResult<serde_json::Value> {
        self.send_sync_opts(to, kind, value, Some(timeout)).await
    }

    async fn send_sync_opts(
        &self,
        to: AgentId,
        kind: MessageKind,
        value: serde_json::Value,
        timeout: Option<SimTime>,
    ) -> SimResult<serde_json::Value> {
        let (token, cell) = self.kernel.begin_wait(self.pid);
        if let Err(err) = self
            .kernel
            .send_sync_message(self.pid, token, to, kind, value, timeout)
        {
            self.kernel.clear_wait(self.pid);
            return Err(err);
        }
        match (WaitFuture { cell }).await? {
            ResumeValue::Response(response) => Ok(response),
            _ => Err(SimError::SchedulerInvariant(
                "synchronous send resumed with a foreign signal".to_string(),
            )),
        }
    }

    /// Increment a counter, suspending while a capacity bound would be
    /// exceeded
    pub async fn increment(&self, counter: CounterId, units: u32) -> SimResult<()> {
        let now = self.kernel.now.get();
        let applied = self
            .kernel
            .data
            .borrow_mut()
            .counter_try_increment(counter, units, now);
        if applied {
            return Ok(());
        }
        let (token, cell) = self.kernel.begin_wait(self.pid);
        self.kernel.data.borrow_mut().counter_enqueue_waiter(
            counter,
            CounterWaiter {
                process: self.pid,
                token,
                units,
            },
        );
        self.kernel
            .set_wait_kind(self.pid, WaitKind::Counter { counter });
        match (WaitFuture { cell }).await? {
            ResumeValue::Counter => Ok(()),
            _ => Err(SimError::SchedulerInvariant(
                "counter wait resumed with a foreign signal".to_string(),
            )),
        }
    }

    /// Decrement a counter and admit waiters that now fit. Never suspends.
    pub fn decrement(&self, counter: CounterId, units: u32) {
        let now = self.kernel.now.get();
        let admitted = self
            .kernel
            .data
            .borrow_mut()
            .counter_decrement(counter, units, now);
        for (process, token) in admitted {
            self.kernel
                .schedule_resume(process, token, ResumeSignal::Counter);
        }
    }

    /// Record one value on an unweighted collector
    pub fn add_value(&self, collector: CollectorId, value: f64) {
        let now = self.kernel.now.get();
        let dataset = self.kernel.data.borrow().collector_dataset(collector);
        self.kernel.data.borrow_mut().put_value(dataset, now, value);
    }
}
