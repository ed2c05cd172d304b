//! Downtime agents
//!
//! A downtime agent takes exactly one resource down and later brings it
//! back up. Scheduled agents fire on a repeating cycle of break intervals;
//! failure agents alternate time-to-failure and time-to-repair draws.
//! Several agents may share one resource.
//!
//! The customization seam is [`TakedownPolicy`]: the default hard-stops
//! immediately, custom policies can soft-stop with a grace timeout or
//! defer the break until a peer resource is back up.

use crate::agent::{AgentBrain, AgentId, Message, MessageKind, MessagePayload};
use crate::engine::Kernel;
use crate::error::{SimError, SimResult};
use crate::event::EventAction;
use crate::random::Sampler;
use crate::resource::{ResourceId, ResourceSnapshot};
use crate::time::SimTime;

/// A repeating cycle of break intervals
#[derive(Debug, Clone)]
pub struct DowntimeSchedule {
    pub cycle_length: SimTime,
    /// `(offset into cycle, duration)` pairs
    pub intervals: Vec<(SimTime, SimTime)>,
}

impl DowntimeSchedule {
    /// Normalize to ticks and reject overlapping or out-of-cycle intervals
    pub(crate) fn to_ticks(&self, base: crate::time::TimeUnit) -> SimResult<ScheduleTicks> {
        let cycle = self.cycle_length.to_ticks(base)?;
        if cycle <= 0.0 {
            return Err(SimError::InvalidRequest(
                "downtime cycle length must be positive".to_string(),
            ));
        }
        let mut intervals = Vec::with_capacity(self.intervals.len());
        for (offset, duration) in &self.intervals {
            let offset = offset.to_ticks(base)?;
            let duration = duration.to_ticks(base)?;
            if offset < 0.0 || duration <= 0.0 || offset + duration > cycle {
                return Err(SimError::InvalidRequest(format!(
                    "downtime interval ({}, {}) does not fit in a cycle of {}",
                    offset, duration, cycle
                )));
            }
            intervals.push((offset, duration));
        }
        let mut sorted = intervals.clone();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
        for pair in sorted.windows(2) {
            if pair[0].0 + pair[0].1 > pair[1].0 {
                return Err(SimError::InvalidRequest(
                    "downtime intervals overlap".to_string(),
                ));
            }
        }
        Ok(ScheduleTicks { cycle, intervals })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScheduleTicks {
    cycle: f64,
    /// `(offset, duration)` in ticks, in declaration order
    intervals: Vec<(f64, f64)>,
}

/// What a takedown policy decided to do when a break came due
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TakedownDecision {
    /// Hard take-down right now
    TakedownNow,
    /// Soft-stop; holders keep their units, optionally bounded by a grace
    /// timeout after which the take-down turns hard
    GoingDown { timeout: Option<SimTime> },
    /// Wait until a peer resource is back up, then decide again
    Defer { until_up: ResourceId },
}

/// Read-only context handed to a [`TakedownPolicy`]
pub struct DowntimeView<'a> {
    kernel: &'a Kernel,
    resource: ResourceId,
}

impl DowntimeView<'_> {
    pub fn now(&self) -> SimTime {
        self.kernel.now_time()
    }

    /// The resource this agent manages
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// State of any resource, peers included
    pub fn snapshot(&self, resource: ResourceId) -> ResourceSnapshot {
        self.kernel.resource_snapshot(resource)
    }
}

/// The seam a scheduled-downtime agent runs when a break comes due
pub trait TakedownPolicy {
    fn start_resource_takedown(&mut self, view: &DowntimeView<'_>) -> TakedownDecision;
}

/// Default policy: hard take-down the moment the break starts
#[derive(Debug, Default)]
pub struct ImmediateTakedown;

impl TakedownPolicy for ImmediateTakedown {
    fn start_resource_takedown(&mut self, _view: &DowntimeView<'_>) -> TakedownDecision {
        TakedownDecision::TakedownNow
    }
}

/// Timer tag reserved for bring-up; interval indices use the low tags
const TAG_BRING_UP: u64 = u64::MAX;
const TAG_FAIL: u64 = 0;
const TAG_REPAIR: u64 = 1;

pub(crate) struct ScheduledDowntime {
    resource: ResourceId,
    schedule: ScheduleTicks,
    policy: Box<dyn TakedownPolicy>,
    /// Duration of the break currently being taken, consumed when the
    /// resource actually goes down
    pending_break: Option<f64>,
    /// Break armed but waiting for a peer to come back up
    deferred: bool,
}

pub(crate) struct FailureDowntime {
    resource: ResourceId,
    time_to_failure: Sampler,
    time_to_repair: Sampler,
}

pub(crate) enum DowntimeBrain {
    Scheduled(ScheduledDowntime),
    Failure(FailureDowntime),
}

impl DowntimeBrain {
    pub(crate) fn handle_message(&mut self, kernel: &Kernel, agent: AgentId, msg: &Message) {
        if let DowntimeBrain::Scheduled(state) = self {
            match (msg.kind, &msg.payload) {
                (MessageKind::ResourceDown, MessagePayload::Resource(rid))
                    if *rid == state.resource =>
                {
                    state.schedule_bring_up(kernel, agent);
                }
                (MessageKind::ResourceUp, MessagePayload::Resource(rid))
                    if *rid != state.resource && state.deferred =>
                {
                    state.deferred = false;
                    state.begin_takedown(kernel, agent);
                }
                _ => {}
            }
        }
    }

    pub(crate) fn on_timer(&mut self, kernel: &Kernel, agent: AgentId, tag: u64) {
        match self {
            DowntimeBrain::Scheduled(state) => state.on_timer(kernel, agent, tag),
            DowntimeBrain::Failure(state) => state.on_timer(kernel, agent, tag),
        }
    }
}

impl ScheduledDowntime {
    fn on_timer(&mut self, kernel: &Kernel, agent: AgentId, tag: u64) {
        if tag == TAG_BRING_UP {
            kernel.bring_up_resource(self.resource);
            return;
        }
        let index = tag as usize;
        let (_, duration) = match self.schedule.intervals.get(index) {
            Some(interval) => *interval,
            None => return,
        };
        // keep the cycle ticking regardless of how this break plays out
        let next = kernel.now.get() + self.schedule.cycle;
        kernel.schedule_at_ticks(next, EventAction::AgentTimer { agent, tag });

        self.pending_break = Some(duration);
        self.begin_takedown(kernel, agent);
    }

    /// Run the policy and execute its decision
    fn begin_takedown(&mut self, kernel: &Kernel, agent: AgentId) {
        let decision = {
            let view = DowntimeView {
                kernel,
                resource: self.resource,
            };
            self.policy.start_resource_takedown(&view)
        };
        tracing::debug!(resource = %self.resource, ?decision, "break due");
        match decision {
            TakedownDecision::TakedownNow => {
                kernel.takedown_resource(self.resource);
                // if the transition happened (or the resource was already
                // down), the down-notification consumes the pending break;
                // cover the already-down case where nothing was published
                if kernel.resource_snapshot(self.resource).is_down() {
                    self.schedule_bring_up(kernel, agent);
                }
            }
            TakedownDecision::GoingDown { timeout } => {
                if let Err(err) = kernel.set_resource_going_down(self.resource, timeout) {
                    kernel.halt_with(err);
                }
            }
            TakedownDecision::Defer { until_up } => {
                let peer_agent = {
                    let table = kernel.resources.borrow();
                    table.get(until_up).agent
                };
                kernel.subscribe(peer_agent, MessageKind::ResourceUp, agent);
                self.deferred = true;
            }
        }
    }

    fn schedule_bring_up(&mut self, kernel: &Kernel, agent: AgentId) {
        if let Some(duration) = self.pending_break.take() {
            let at = kernel.now.get() + duration;
            kernel.schedule_at_ticks(
                at,
                EventAction::AgentTimer {
                    agent,
                    tag: TAG_BRING_UP,
                },
            );
        }
    }
}

impl FailureDowntime {
    fn on_timer(&mut self, kernel: &Kernel, agent: AgentId, tag: u64) {
        match tag {
            TAG_FAIL => {
                kernel.takedown_resource(self.resource);
                self.arm(kernel, agent, self.time_to_repair, TAG_REPAIR);
            }
            TAG_REPAIR => {
                kernel.bring_up_resource(self.resource);
                self.arm(kernel, agent, self.time_to_failure, TAG_FAIL);
            }
            _ => {}
        }
    }

    fn arm(&self, kernel: &Kernel, agent: AgentId, sampler: Sampler, tag: u64) {
        match kernel.sample_ticks(&sampler) {
            Ok(dt) => {
                let at = kernel.now.get() + dt.max(0.0);
                kernel.schedule_at_ticks(at, EventAction::AgentTimer { agent, tag });
            }
            Err(err) => kernel.halt_with(err),
        }
    }
}

impl Kernel {
    pub(crate) fn add_scheduled_downtime_impl(
        &self,
        name: &str,
        resource: ResourceId,
        schedule: &DowntimeSchedule,
        policy: Box<dyn TakedownPolicy>,
    ) -> SimResult<AgentId> {
        let ticks = schedule.to_ticks(self.base_unit)?;
        self.claim_element_id(name)?;
        self.data
            .borrow_mut()
            .register_element(name, "ScheduledDowntimeAgent", "agent");
        let agent = self.agents.borrow_mut().add(
            name.to_string(),
            AgentBrain::Downtime(DowntimeBrain::Scheduled(ScheduledDowntime {
                resource,
                schedule: ticks.clone(),
                policy,
                pending_break: None,
                deferred: false,
            })),
        );
        // watch the managed resource's transitions
        let resource_agent = self.resources.borrow().get(resource).agent;
        self.subscribe(resource_agent, MessageKind::ResourceDown, agent);
        self.subscribe(resource_agent, MessageKind::ResourceUp, agent);
        for (index, (offset, _)) in ticks.intervals.iter().enumerate() {
            self.schedule_at_ticks(
                *offset,
                EventAction::AgentTimer {
                    agent,
                    tag: index as u64,
                },
            );
        }
        Ok(agent)
    }

    pub(crate) fn add_failure_agent_impl(
        &self,
        name: &str,
        resource: ResourceId,
        time_to_failure: Sampler,
        time_to_repair: Sampler,
    ) -> SimResult<AgentId> {
        self.claim_element_id(name)?;
        self.data
            .borrow_mut()
            .register_element(name, "FailureAgent", "agent");
        let agent = self.agents.borrow_mut().add(
            name.to_string(),
            AgentBrain::Downtime(DowntimeBrain::Failure(FailureDowntime {
                resource,
                time_to_failure,
                time_to_repair,
            })),
        );
        let first = self.sample_ticks(&time_to_failure)?.max(0.0);
        self.schedule_at_ticks(
            self.now.get() + first,
            EventAction::AgentTimer {
                agent,
                tag: TAG_FAIL,
            },
        );
        Ok(agent)
    }
}
