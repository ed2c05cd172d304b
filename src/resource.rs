//! Resources, requests and assignments
//!
//! A resource is a capacity-constrained static object fronted by an
//! assignment agent (itself by default, a pool when it joins one).
//! Requests queue FIFO-within-priority at the agent; the single-resource
//! pass applies a hard priority discipline: it never skips past an
//! unfillable request to backfill a lower-priority one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentBrain, AgentId, MessageKind, MessagePayload};
use crate::data::{DatasetId, ValueType};
use crate::engine::{Kernel, ProcessId};
use crate::entity::EntityId;
use crate::error::{SimError, SimResult};
use crate::event::{EventAction, EventId, ResumeSignal};
use crate::pool::PoolId;
use crate::time::SimTime;

/// Resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub(crate) u32);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resource-{}", self.0)
    }
}

/// Resource class identifier; classes form a subtype tree for pool
/// selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassId(pub(crate) u32);

/// Pending acquire identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub(crate) u64);

/// Fulfilled-assignment identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssignmentId(pub(crate) u64);

/// Which resources a request may be satisfied from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// A specific resource
    Resource(ResourceId),
    /// Any pool member of this class or a subtype
    Class(ClassId),
}

/// Read-only view of a resource's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub capacity: u32,
    pub in_use: u32,
    pub down_units: u32,
    pub going_down: bool,
}

impl ResourceSnapshot {
    /// Whether the resource is fully down
    pub fn is_down(&self) -> bool {
        self.capacity > 0 && self.down_units == self.capacity
    }

    /// Units assignable to a new request
    pub fn available(&self) -> u32 {
        if self.going_down {
            0
        } else {
            self.capacity
                .saturating_sub(self.in_use)
                .saturating_sub(self.down_units)
        }
    }
}

pub(crate) struct ResourceState {
    pub(crate) element: String,
    pub(crate) capacity: u32,
    pub(crate) in_use: u32,
    pub(crate) down_units: u32,
    pub(crate) going_down: bool,
    pub(crate) going_down_expiry: Option<EventId>,
    pub(crate) class: Option<ClassId>,
    /// Assignment agent; the resource's own agent unless it joined a pool
    pub(crate) agent: AgentId,
    pub(crate) pool: Option<PoolId>,
    /// Processes suspended until this resource comes back up
    pub(crate) up_waiters: Vec<(ProcessId, u64)>,
    pub(crate) ds_in_use: DatasetId,
    pub(crate) ds_down: DatasetId,
}

pub(crate) struct RequestState {
    pub(crate) process: ProcessId,
    pub(crate) token: u64,
    #[allow(dead_code)]
    pub(crate) entity: Option<EntityId>,
    pub(crate) selector: Selector,
    pub(crate) units: u32,
    pub(crate) priority: i64,
    pub(crate) seq: u64,
    pub(crate) timeout_event: Option<EventId>,
    pub(crate) agent: AgentId,
}

pub(crate) struct AssignmentState {
    pub(crate) process: ProcessId,
    pub(crate) resources: Vec<(ResourceId, u32)>,
    pub(crate) acquired_at: f64,
    pub(crate) released: bool,
}

#[derive(Default)]
pub(crate) struct ClassTable {
    names: Vec<String>,
    parents: Vec<Option<ClassId>>,
}

impl ClassTable {
    pub(crate) fn add(&mut self, name: &str, parent: Option<ClassId>) -> ClassId {
        let id = ClassId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.parents.push(parent);
        id
    }

    pub(crate) fn name(&self, class: ClassId) -> &str {
        &self.names[class.0 as usize]
    }

    /// Whether `class` is `wanted` or one of its subtypes
    pub(crate) fn matches(&self, class: Option<ClassId>, wanted: ClassId) -> bool {
        let mut cursor = class;
        while let Some(c) = cursor {
            if c == wanted {
                return true;
            }
            cursor = self.parents[c.0 as usize];
        }
        false
    }
}

#[derive(Default)]
pub(crate) struct ResourceTable {
    pub(crate) resources: Vec<ResourceState>,
    pub(crate) classes: ClassTable,
    pub(crate) requests: BTreeMap<RequestId, RequestState>,
    pub(crate) assignments: BTreeMap<AssignmentId, AssignmentState>,
    next_request: u64,
    next_assignment: u64,
    next_request_seq: u64,
}

impl ResourceTable {
    pub(crate) fn get(&self, id: ResourceId) -> &ResourceState {
        &self.resources[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: ResourceId) -> &mut ResourceState {
        &mut self.resources[id.0 as usize]
    }

    fn new_request(&mut self, request: RequestState) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.requests.insert(id, request);
        id
    }

    fn new_assignment(&mut self, assignment: AssignmentState) -> AssignmentId {
        let id = AssignmentId(self.next_assignment);
        self.next_assignment += 1;
        self.assignments.insert(id, assignment);
        id
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_request_seq;
        self.next_request_seq += 1;
        seq
    }
}

impl Kernel {
    pub(crate) fn add_resource_impl(
        &self,
        name: &str,
        capacity: u32,
        class: Option<ClassId>,
    ) -> SimResult<ResourceId> {
        if capacity == 0 {
            return Err(SimError::InvalidRequest(format!(
                "resource {} must have positive capacity",
                name
            )));
        }
        self.claim_element_id(name)?;
        let (ds_in_use, ds_down) = {
            let mut data = self.data.borrow_mut();
            data.register_element(name, "Resource", "resource");
            (
                data.register_dataset(name, "in_use", ValueType::Integer, true, self.base_unit, 0.0),
                data.register_dataset(name, "down", ValueType::Integer, true, self.base_unit, 0.0),
            )
        };
        let id = ResourceId(self.resources.borrow().resources.len() as u32);
        let agent = self
            .agents
            .borrow_mut()
            .add(name.to_string(), AgentBrain::Resource(id));
        self.resources.borrow_mut().resources.push(ResourceState {
            element: name.to_string(),
            capacity,
            in_use: 0,
            down_units: 0,
            going_down: false,
            going_down_expiry: None,
            class,
            agent,
            pool: None,
            up_waiters: Vec::new(),
            ds_in_use,
            ds_down,
        });
        Ok(id)
    }

    pub(crate) fn resource_snapshot(&self, id: ResourceId) -> ResourceSnapshot {
        let table = self.resources.borrow();
        let state = table.get(id);
        ResourceSnapshot {
            capacity: state.capacity,
            in_use: state.in_use,
            down_units: state.down_units,
            going_down: state.going_down,
        }
    }

    /// Units currently assignable from a resource to a new request
    pub(crate) fn available_units(&self, id: ResourceId) -> u32 {
        self.resource_snapshot(id).available()
    }

    /// Create a pending request and return the agent it must be posted to
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn make_request(
        &self,
        process: ProcessId,
        token: u64,
        entity: Option<EntityId>,
        selector: Selector,
        units: u32,
        priority: i64,
    ) -> SimResult<(RequestId, AgentId)> {
        if units == 0 {
            return Err(SimError::InvalidRequest(
                "acquire needs at least one unit".to_string(),
            ));
        }
        let agent = match selector {
            Selector::Resource(rid) => {
                let table = self.resources.borrow();
                let state = table.get(rid);
                if units > state.capacity {
                    return Err(SimError::InvalidRequest(format!(
                        "acquire of {} units exceeds capacity {} of {}",
                        units, state.capacity, state.element
                    )));
                }
                state.agent
            }
            Selector::Class(_) => {
                return Err(SimError::InvalidRequest(
                    "class selectors must target a pool".to_string(),
                ))
            }
        };
        let request = {
            let mut table = self.resources.borrow_mut();
            let seq = table.next_seq();
            table.new_request(RequestState {
                process,
                token,
                entity,
                selector,
                units,
                priority,
                seq,
                timeout_event: None,
                agent,
            })
        };
        Ok((request, agent))
    }

    /// Pool variant: the request goes to the pool's agent with a class
    /// selector
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn make_pool_request(
        &self,
        process: ProcessId,
        token: u64,
        entity: Option<EntityId>,
        pool: PoolId,
        class: ClassId,
        units: u32,
        priority: i64,
    ) -> SimResult<(RequestId, AgentId)> {
        if units == 0 {
            return Err(SimError::InvalidRequest(
                "acquire needs at least one unit".to_string(),
            ));
        }
        let agent = self.pool_agent(pool);
        let request = {
            let mut table = self.resources.borrow_mut();
            let seq = table.next_seq();
            table.new_request(RequestState {
                process,
                token,
                entity,
                selector: Selector::Class(class),
                units,
                priority,
                seq,
                timeout_event: None,
                agent,
            })
        };
        Ok((request, agent))
    }

    /// Stash a request into its agent's priority queue (called from the
    /// agent's queue pass on a *ResourceRequest* message)
    pub(crate) fn enqueue_request(&self, agent: AgentId, request: RequestId) {
        if !self.resources.borrow().requests.contains_key(&request) {
            return; // timed out or cancelled before the pass saw it
        }
        let mut agents = self.agents.borrow_mut();
        let queue = &mut agents.get_mut(agent).request_queue;
        if !queue.contains(&request) {
            queue.push(request);
        }
    }

    /// Current request queue of an agent in dispatch order:
    /// FIFO within descending priority
    pub(crate) fn sorted_requests(&self, agent: AgentId) -> Vec<RequestId> {
        let ids = self.agents.borrow().get(agent).request_queue.clone();
        let table = self.resources.borrow();
        let mut keyed: Vec<(i64, u64, RequestId)> = ids
            .into_iter()
            .filter_map(|id| table.requests.get(&id).map(|r| (r.priority, r.seq, id)))
            .collect();
        keyed.sort_by_key(|(priority, seq, _)| (std::cmp::Reverse(*priority), *seq));
        keyed.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Hard-priority pass over a single resource's queue: fulfill in
    /// priority order and stop dead at the first request that does not fit.
    pub(crate) fn process_queued_requests_single(&self, resource: ResourceId, agent: AgentId) {
        for request in self.sorted_requests(agent) {
            let units = match self.resources.borrow().requests.get(&request) {
                Some(r) => r.units,
                None => continue,
            };
            if self.available_units(resource) >= units {
                self.commit_allocation(request, vec![(resource, units)]);
            } else {
                break;
            }
        }
    }

    /// Commit an allocation for a pending request: debit the resources,
    /// build the assignment and schedule the requester's resumption.
    pub(crate) fn commit_allocation(&self, request: RequestId, alloc: Vec<(ResourceId, u32)>) {
        let now = self.now.get();
        let removed = {
            let mut table = self.resources.borrow_mut();
            table.requests.remove(&request)
        };
        let req = match removed {
            Some(r) => r,
            None => return,
        };
        if let Some(timeout) = req.timeout_event {
            self.events.borrow_mut().cancel(timeout);
        }
        {
            let mut agents = self.agents.borrow_mut();
            agents
                .get_mut(req.agent)
                .request_queue
                .retain(|r| *r != request);
        }

        let total: u32 = alloc.iter().map(|(_, n)| n).sum();
        if total != req.units {
            self.halt_with(SimError::SchedulerInvariant(format!(
                "allocation of {} units for a request of {}",
                total, req.units
            )));
            return;
        }

        let mut levels = Vec::with_capacity(alloc.len());
        let mut overflow = None;
        {
            let mut table = self.resources.borrow_mut();
            for (rid, n) in &alloc {
                let state = table.get_mut(*rid);
                if state.in_use + *n + state.down_units > state.capacity {
                    overflow = Some(*rid);
                    break;
                }
                state.in_use += *n;
                levels.push((state.ds_in_use, state.in_use));
            }
        }
        if let Some(rid) = overflow {
            self.halt_with(SimError::SchedulerInvariant(format!(
                "in_use exceeded capacity on {}",
                rid
            )));
            return;
        }
        {
            let mut data = self.data.borrow_mut();
            for (ds, level) in levels {
                data.set_level(ds, now, f64::from(level));
            }
        }

        let assignment = self.resources.borrow_mut().new_assignment(AssignmentState {
            process: req.process,
            resources: alloc,
            acquired_at: now,
            released: false,
        });
        self.add_holding(req.process, assignment);
        tracing::debug!(?request, ?assignment, "request fulfilled");
        self.schedule_resume(req.process, req.token, ResumeSignal::Assignment(assignment));
    }

    /// Arm an acquire timeout if the request is still pending
    pub(crate) fn arm_request_timeout(
        &self,
        request: RequestId,
        timeout: SimTime,
    ) -> SimResult<()> {
        if !self.resources.borrow().requests.contains_key(&request) {
            return Ok(());
        }
        let event = self.schedule_in(timeout, EventAction::AcquireTimeout { request })?;
        if let Some(req) = self.resources.borrow_mut().requests.get_mut(&request) {
            req.timeout_event = Some(event);
        }
        Ok(())
    }

    /// An acquire timeout fired before fulfillment: withdraw the request
    /// and raise *TimedOut* into the requester.
    pub(crate) fn acquire_timed_out(&self, request: RequestId) {
        let removed = self.resources.borrow_mut().requests.remove(&request);
        let req = match removed {
            Some(r) => r,
            None => return, // fulfilled first; the cancel raced the pop
        };
        self.agents
            .borrow_mut()
            .get_mut(req.agent)
            .request_queue
            .retain(|r| *r != request);
        tracing::debug!(?request, "acquire timed out");
        self.complete_wait(req.process, req.token, Err(SimError::TimedOut));
    }

    /// Return every unit of an assignment. Idempotent: force-released and
    /// double-released assignments fall through.
    pub(crate) fn release_assignment(&self, assignment: AssignmentId) {
        let now = self.now.get();
        let released = {
            let mut table = self.resources.borrow_mut();
            match table.assignments.get_mut(&assignment) {
                Some(state) if !state.released => {
                    state.released = true;
                    Some((state.process, state.resources.clone()))
                }
                _ => None,
            }
        };
        let (process, alloc) = match released {
            Some(r) => r,
            None => return,
        };
        self.remove_holding(process, assignment);

        let mut agents_to_notify = Vec::new();
        let mut levels = Vec::new();
        let mut drained_going_down = Vec::new();
        {
            let mut table = self.resources.borrow_mut();
            for (rid, n) in &alloc {
                if *n == 0 {
                    continue;
                }
                let state = table.get_mut(*rid);
                state.in_use = state.in_use.saturating_sub(*n);
                levels.push((state.ds_in_use, state.in_use));
                if !agents_to_notify.contains(&state.agent) {
                    agents_to_notify.push(state.agent);
                }
                if state.going_down && state.in_use == 0 {
                    drained_going_down.push(*rid);
                }
            }
        }
        {
            let mut data = self.data.borrow_mut();
            for (ds, level) in levels {
                data.set_level(ds, now, f64::from(level));
            }
        }
        tracing::debug!(?assignment, "assignment released");
        // the last holder draining completes a pending soft-stop
        for rid in drained_going_down {
            self.takedown_resource(rid);
        }
        for agent in agents_to_notify {
            self.send_message(
                crate::agent::MsgEndpoint::Engine,
                agent,
                MessageKind::ResourceRelease,
                MessagePayload::None,
                None,
            );
        }
    }

    /// Immediate up/going_down -> down transition. Holders get
    /// *ResourceDown* injected and their units are forcibly released.
    pub(crate) fn takedown_resource(&self, resource: ResourceId) {
        let now = self.now.get();
        let prepared = {
            let mut table = self.resources.borrow_mut();
            let state = table.get_mut(resource);
            if state.capacity == state.down_units {
                None
            } else {
                state.going_down = false;
                state.down_units = state.capacity;
                let expiry = state.going_down_expiry.take();
                Some((state.agent, state.ds_in_use, state.ds_down, expiry))
            }
        };
        let (agent, ds_in_use, ds_down, expiry) = match prepared {
            Some(p) => p,
            None => return,
        };
        if let Some(event) = expiry {
            self.events.borrow_mut().cancel(event);
        }

        // strip the downed units out of every live assignment
        let mut holders: Vec<ProcessId> = Vec::new();
        {
            let mut table = self.resources.borrow_mut();
            let mut reclaimed = 0u32;
            for state in table.assignments.values_mut() {
                if state.released {
                    continue;
                }
                for entry in state.resources.iter_mut() {
                    if entry.0 == resource && entry.1 > 0 {
                        reclaimed += entry.1;
                        entry.1 = 0;
                        if !holders.contains(&state.process) {
                            holders.push(state.process);
                        }
                    }
                }
            }
            let state = table.get_mut(resource);
            state.in_use = state.in_use.saturating_sub(reclaimed);
        }
        let (in_use, capacity) = {
            let table = self.resources.borrow();
            let state = table.get(resource);
            (state.in_use, state.capacity)
        };
        {
            let mut data = self.data.borrow_mut();
            data.set_level(ds_in_use, now, f64::from(in_use));
            data.set_level(ds_down, now, f64::from(capacity));
        }
        tracing::debug!(%resource, holders = holders.len(), "resource taken down");

        self.publish_from(
            agent,
            MessageKind::ResourceDown,
            MessagePayload::Resource(resource),
        );
        for process in holders {
            self.inject_error(process, SimError::ResourceDown { resource });
        }
    }

    /// Soft-stop: exclude the resource from new assignments while current
    /// holders finish. An optional timeout arms a hard take-down; with no
    /// holders the take-down happens immediately.
    pub(crate) fn set_resource_going_down(
        &self,
        resource: ResourceId,
        timeout: Option<SimTime>,
    ) -> SimResult<()> {
        let in_use = {
            let mut table = self.resources.borrow_mut();
            let state = table.get_mut(resource);
            if state.capacity == state.down_units {
                return Ok(()); // already down
            }
            state.going_down = true;
            state.in_use
        };
        if in_use == 0 {
            self.takedown_resource(resource);
            return Ok(());
        }
        if let Some(delay) = timeout {
            let event = self.schedule_in(delay, EventAction::GoingDownExpired { resource })?;
            self.resources.borrow_mut().get_mut(resource).going_down_expiry = Some(event);
        }
        tracing::debug!(%resource, "resource going down");
        Ok(())
    }

    /// A going-down grace period expired with holders still active
    pub(crate) fn going_down_expired(&self, resource: ResourceId) {
        let still_going_down = {
            let table = self.resources.borrow();
            table.get(resource).going_down
        };
        if still_going_down {
            self.takedown_resource(resource);
        }
    }

    /// going_down or down -> up. Publishes *ResourceUp*, wakes waiters and
    /// reruns the assignment queue.
    pub(crate) fn bring_up_resource(&self, resource: ResourceId) {
        let now = self.now.get();
        let prepared = {
            let mut table = self.resources.borrow_mut();
            let state = table.get_mut(resource);
            if state.down_units == 0 && !state.going_down {
                return;
            }
            state.down_units = 0;
            state.going_down = false;
            let expiry = state.going_down_expiry.take();
            let waiters = std::mem::take(&mut state.up_waiters);
            (state.agent, state.ds_down, expiry, waiters)
        };
        let (agent, ds_down, expiry, waiters) = prepared;
        if let Some(event) = expiry {
            self.events.borrow_mut().cancel(event);
        }
        self.data.borrow_mut().set_level(ds_down, now, 0.0);
        tracing::debug!(%resource, "resource back up");
        self.publish_from(
            agent,
            MessageKind::ResourceUp,
            MessagePayload::Resource(resource),
        );
        for (process, token) in waiters {
            self.schedule_resume(process, token, ResumeSignal::ResourceUp);
        }
        self.pump_agent(agent);
    }

    /// Park a process until the resource comes back up
    pub(crate) fn register_up_waiter(&self, resource: ResourceId, process: ProcessId, token: u64) {
        self.resources
            .borrow_mut()
            .get_mut(resource)
            .up_waiters
            .push((process, token));
    }

    pub(crate) fn remove_up_waiter(&self, resource: ResourceId, process: ProcessId) {
        self.resources
            .borrow_mut()
            .get_mut(resource)
            .up_waiters
            .retain(|(p, _)| *p != process);
    }

    /// Clean a pending request out of its agent queue (downtime injection
    /// into a process suspended on acquire)
    pub(crate) fn withdraw_request(&self, request: RequestId) {
        let removed = self.resources.borrow_mut().requests.remove(&request);
        if let Some(req) = removed {
            if let Some(timeout) = req.timeout_event {
                self.events.borrow_mut().cancel(timeout);
            }
            self.agents
                .borrow_mut()
                .get_mut(req.agent)
                .request_queue
                .retain(|r| *r != request);
        }
    }

    pub(crate) fn assignment_resources(&self, assignment: AssignmentId) -> Vec<(ResourceId, u32)> {
        self.resources
            .borrow()
            .assignments
            .get(&assignment)
            .map(|a| a.resources.clone())
            .unwrap_or_default()
    }

    pub(crate) fn assignment_acquired_at(&self, assignment: AssignmentId) -> f64 {
        self.resources
            .borrow()
            .assignments
            .get(&assignment)
            .map(|a| a.acquired_at)
            .unwrap_or(0.0)
    }
}

impl crate::engine::Simulation {
    /// Observable state of a resource
    pub fn resource_snapshot(&self, resource: ResourceId) -> ResourceSnapshot {
        self.kernel.resource_snapshot(resource)
    }

    /// Declared name of a resource class
    pub fn class_name(&self, class: ClassId) -> String {
        self.kernel
            .resources
            .borrow()
            .classes
            .name(class)
            .to_string()
    }
}
