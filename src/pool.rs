//! Resource pools
//!
//! A pool is an assignment agent multiplexing a heterogeneous set of
//! resources with class-filtered selection. The default pass maximizes
//! assignments without ever starving a higher-priority request: units a
//! still-unfulfilled higher-priority request could use are reserved away
//! from everything below it. Models replace the whole pass through
//! [`AssignmentPolicy`]; commits go through [`PoolApi::assign`], which
//! enforces the capacity invariants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentBrain, AgentId};
use crate::engine::{Kernel, ProcessId};
use crate::entity::EntityId;
use crate::error::{SimError, SimResult};
use crate::resource::{ClassId, RequestId, ResourceId, ResourceSnapshot, Selector};
use crate::time::SimTime;

/// Pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(pub(crate) u32);

pub(crate) struct PoolState {
    #[allow(dead_code)]
    pub(crate) element: String,
    pub(crate) agent: AgentId,
    /// Members in registration order (ascending resource index)
    pub(crate) members: Vec<ResourceId>,
}

/// Read-only view of a pending request, for assignment policies
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo {
    pub process: ProcessId,
    pub entity: Option<EntityId>,
    pub selector: Selector,
    pub units: u32,
    pub priority: i64,
}

/// The queue-processing seam of a pool agent
///
/// `process_queued_requests` runs after every queue pass of the pool's
/// agent: on request arrival, on release, on bring-up. It may fulfill any
/// subset of the queued requests through [`PoolApi::assign`]; whatever it
/// leaves unfulfilled stays queued for the next pass.
pub trait AssignmentPolicy {
    fn process_queued_requests(&mut self, api: &mut PoolApi<'_>) -> SimResult<()>;
}

/// Engine surface handed to an [`AssignmentPolicy`] during one pass
pub struct PoolApi<'a> {
    pub(crate) kernel: &'a Kernel,
    pub(crate) pool: PoolId,
    pub(crate) agent: AgentId,
    /// Units staged per request, committed when the request total is met
    staged: BTreeMap<RequestId, Vec<(ResourceId, u32)>>,
    /// Provisional debits against real availability
    debits: BTreeMap<ResourceId, u32>,
}

impl<'a> PoolApi<'a> {
    pub(crate) fn new(kernel: &'a Kernel, pool: PoolId, agent: AgentId) -> Self {
        Self {
            kernel,
            pool,
            agent,
            staged: BTreeMap::new(),
            debits: BTreeMap::new(),
        }
    }

    /// Current simulated time
    pub fn now(&self) -> SimTime {
        self.kernel.now_time()
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    /// Queued requests in dispatch order: FIFO within descending priority
    pub fn requests(&self) -> Vec<RequestId> {
        self.kernel.sorted_requests(self.agent)
    }

    /// Details of a still-pending request
    pub fn request(&self, request: RequestId) -> Option<RequestInfo> {
        let table = self.kernel.resources.borrow();
        table.requests.get(&request).map(|r| RequestInfo {
            process: r.process,
            entity: r.entity,
            selector: r.selector,
            units: r.units,
            priority: r.priority,
        })
    }

    /// Pool members in registration order
    pub fn members(&self) -> Vec<ResourceId> {
        self.kernel.pool_members(self.pool)
    }

    pub fn resource(&self, resource: ResourceId) -> ResourceSnapshot {
        self.kernel.resource_snapshot(resource)
    }

    /// Assignable units of a member net of this pass's staged debits
    pub fn available_units(&self, resource: ResourceId) -> u32 {
        let debit = self.debits.get(&resource).copied().unwrap_or(0);
        self.kernel.available_units(resource).saturating_sub(debit)
    }

    /// Whether a member's class satisfies a request's selector
    pub fn eligible(&self, resource: ResourceId, request: RequestId) -> bool {
        let table = self.kernel.resources.borrow();
        let req = match table.requests.get(&request) {
            Some(r) => r,
            None => return false,
        };
        match req.selector {
            Selector::Resource(wanted) => wanted == resource,
            Selector::Class(class) => {
                let member_class = table.get(resource).class;
                table.classes.matches(member_class, class)
            }
        }
    }

    /// Stage `units` of a member toward a request. When the staged total
    /// reaches the requested unit count, the assignment commits: state is
    /// mutated, the request leaves the queue and the requester's
    /// resumption is scheduled.
    pub fn assign(&mut self, request: RequestId, resource: ResourceId, units: u32) -> SimResult<()> {
        if units == 0 {
            return Err(SimError::InvalidRequest(
                "cannot assign zero units".to_string(),
            ));
        }
        let info = self.request(request).ok_or_else(|| {
            SimError::InvalidRequest(format!("request {:?} is no longer pending", request))
        })?;
        if !self.eligible(resource, request) {
            return Err(SimError::InvalidRequest(format!(
                "{} does not satisfy the request selector",
                resource
            )));
        }
        if units > self.available_units(resource) {
            return Err(SimError::SchedulerInvariant(format!(
                "assignment of {} units exceeds availability of {}",
                units, resource
            )));
        }
        *self.debits.entry(resource).or_default() += units;
        let staged = self.staged.entry(request).or_default();
        staged.push((resource, units));
        let total: u32 = staged.iter().map(|(_, n)| *n).sum();
        if total > info.units {
            return Err(SimError::SchedulerInvariant(format!(
                "staged {} units for a request of {}",
                total, info.units
            )));
        }
        if total == info.units {
            let alloc = self.staged.remove(&request).unwrap_or_default();
            for (rid, n) in &alloc {
                if let Some(debit) = self.debits.get_mut(rid) {
                    *debit = debit.saturating_sub(*n);
                }
            }
            self.kernel.commit_allocation(request, alloc);
        }
        Ok(())
    }
}

/// Default maximizing pass.
///
/// Requests are visited in priority order. A request whose eligible
/// members can jointly cover it takes units from them in registration
/// order (lowest resource index first, the documented tiebreak). A
/// request that cannot be covered reserves every unit it was eligible
/// for, so nothing below it in the queue can take them this pass.
#[derive(Debug, Default)]
pub struct DefaultPoolPolicy;

impl AssignmentPolicy for DefaultPoolPolicy {
    fn process_queued_requests(&mut self, api: &mut PoolApi<'_>) -> SimResult<()> {
        let members = api.members();
        let mut reserved: Vec<ResourceId> = Vec::new();
        for request in api.requests() {
            let info = match api.request(request) {
                Some(info) => info,
                None => continue,
            };
            let eligible: Vec<ResourceId> = members
                .iter()
                .copied()
                .filter(|r| !reserved.contains(r) && api.eligible(*r, request))
                .collect();
            let total: u32 = eligible.iter().map(|r| api.available_units(*r)).sum();
            if total >= info.units {
                let mut remaining = info.units;
                for resource in eligible {
                    if remaining == 0 {
                        break;
                    }
                    let take = api.available_units(resource).min(remaining);
                    if take > 0 {
                        api.assign(request, resource, take)?;
                        remaining -= take;
                    }
                }
            } else {
                reserved.extend(eligible);
            }
        }
        Ok(())
    }
}

impl Kernel {
    pub(crate) fn add_pool_impl(
        &self,
        name: &str,
        policy: Box<dyn AssignmentPolicy>,
    ) -> SimResult<PoolId> {
        self.claim_element_id(name)?;
        self.data
            .borrow_mut()
            .register_element(name, "ResourcePool", "pool");
        let id = PoolId(self.pools.borrow().len() as u32);
        let agent = self
            .agents
            .borrow_mut()
            .add(name.to_string(), AgentBrain::Pool(id, policy));
        self.pools.borrow_mut().push(PoolState {
            element: name.to_string(),
            agent,
            members: Vec::new(),
        });
        Ok(id)
    }

    /// Hand a resource's assignment duty over to a pool
    pub(crate) fn pool_add_member(&self, pool: PoolId, resource: ResourceId) -> SimResult<()> {
        let agent = self.pool_agent(pool);
        {
            let mut table = self.resources.borrow_mut();
            let state = table.get_mut(resource);
            if state.pool.is_some() {
                return Err(SimError::InvalidRequest(format!(
                    "{} already belongs to a pool",
                    resource
                )));
            }
            state.pool = Some(pool);
            state.agent = agent;
        }
        let mut pools = self.pools.borrow_mut();
        let members = &mut pools[pool.0 as usize].members;
        members.push(resource);
        members.sort();
        Ok(())
    }

    pub(crate) fn pool_agent(&self, pool: PoolId) -> AgentId {
        self.pools.borrow()[pool.0 as usize].agent
    }

    pub(crate) fn pool_members(&self, pool: PoolId) -> Vec<ResourceId> {
        self.pools.borrow()[pool.0 as usize].members.clone()
    }

    pub(crate) fn add_resource_class_impl(&self, name: &str, parent: Option<ClassId>) -> ClassId {
        self.resources.borrow_mut().classes.add(name, parent)
    }
}
