//! Agents and messages
//!
//! Every agent owns a FIFO incoming queue. Queue processing runs at most
//! once per agent within one event dispatch (re-entrancy guarded); a
//! handler that declines a message leaves it queued for a later pass.
//! Publish/subscribe fans asynchronous copies out per message kind.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::downtime::DowntimeBrain;
use crate::engine::Kernel;
use crate::error::{SimError, SimResult};
use crate::event::{EventAction, EventId, ResumeSignal};
use crate::pool::{AssignmentPolicy, PoolId};
use crate::resource::{RequestId, ResourceId, ResourceSnapshot};
use crate::time::SimTime;

/// Agent identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub(crate) u32);

/// Message identifier, unique within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub(crate) u64);

/// Message discriminator used for handler dispatch and subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    ResourceRequest,
    ResourceAssigned,
    ResourceRelease,
    ResourceDown,
    ResourceUp,
    Response,
    /// Model-defined message kinds
    User(u32),
}

/// Message payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    None,
    Request(RequestId),
    Resource(ResourceId),
    Value(serde_json::Value),
}

/// Originator of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgEndpoint {
    Agent(AgentId),
    Process(crate::engine::ProcessId),
    Engine,
}

/// A message between agents (or from a process to an agent)
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub sender: MsgEndpoint,
    pub receiver: AgentId,
    pub payload: MessagePayload,
    /// Set on responses to a synchronous send
    pub response_to: Option<MessageId>,
}

/// Handler surface for model-defined agents
///
/// `handle_message` returns `true` when the message is consumed; a `false`
/// leaves it in the queue for the next processing pass.
pub trait AgentBehavior {
    fn handle_message(&mut self, api: &mut AgentApi<'_>, msg: &Message) -> bool;

    /// Runs once after every queue pass
    fn after_queue(&mut self, _api: &mut AgentApi<'_>) {}

    /// Timer scheduled through [`AgentApi::schedule_timer`] fired
    fn on_timer(&mut self, _api: &mut AgentApi<'_>, _tag: u64) {}
}

/// What drives an agent's queue processing
pub(crate) enum AgentBrain {
    /// Assignment agent of a single resource
    Resource(ResourceId),
    /// Assignment agent multiplexing a pool of resources
    Pool(PoolId, Box<dyn AssignmentPolicy>),
    /// Scheduled or failure downtime agent
    Downtime(DowntimeBrain),
    /// Model-defined agent
    User(Box<dyn AgentBehavior>),
}

pub(crate) struct AgentState {
    pub(crate) element: String,
    pub(crate) queue: VecDeque<Message>,
    pub(crate) pumping: bool,
    pub(crate) brain: Option<AgentBrain>,
    pub(crate) subscribers: HashMap<MessageKind, Vec<AgentId>>,
    /// Pending resource requests, for assignment agents
    pub(crate) request_queue: Vec<RequestId>,
}

#[derive(Default)]
pub(crate) struct AgentRegistry {
    list: Vec<AgentState>,
}

impl AgentRegistry {
    pub(crate) fn add(&mut self, element: String, brain: AgentBrain) -> AgentId {
        let id = AgentId(self.list.len() as u32);
        self.list.push(AgentState {
            element,
            queue: VecDeque::new(),
            pumping: false,
            brain: Some(brain),
            subscribers: HashMap::new(),
            request_queue: Vec::new(),
        });
        id
    }

    pub(crate) fn get(&self, id: AgentId) -> &AgentState {
        &self.list[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: AgentId) -> &mut AgentState {
        &mut self.list[id.0 as usize]
    }
}

pub(crate) struct ResponseWaiter {
    pub(crate) process: crate::engine::ProcessId,
    pub(crate) token: u64,
    pub(crate) receiver: AgentId,
    pub(crate) timeout_event: Option<EventId>,
}

/// Engine surface handed to agent behaviors during queue processing
pub struct AgentApi<'a> {
    pub(crate) kernel: &'a Kernel,
    pub(crate) agent: AgentId,
}

impl AgentApi<'_> {
    /// Current simulated time
    pub fn now(&self) -> SimTime {
        self.kernel.now_time()
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent
    }

    /// Fire-and-forget send
    pub fn send_async(&mut self, to: AgentId, kind: MessageKind, payload: MessagePayload) {
        self.kernel
            .send_message(MsgEndpoint::Agent(self.agent), to, kind, payload, None);
    }

    /// Fan an asynchronous copy out to every subscriber of `kind`
    pub fn publish(&mut self, kind: MessageKind, payload: MessagePayload) {
        self.kernel.publish_from(self.agent, kind, payload);
    }

    /// Answer a synchronous send; resumes the sender with the value
    pub fn respond(&mut self, to: &Message, value: serde_json::Value) {
        self.kernel.resolve_response(to.id, value);
    }

    /// Subscribe this agent to a kind published by another agent
    pub fn subscribe(&mut self, publisher: AgentId, kind: MessageKind) {
        self.kernel.subscribe(publisher, kind, self.agent);
    }

    /// Arm a timer that calls back `on_timer(tag)`
    pub fn schedule_timer(&mut self, delay: SimTime, tag: u64) -> SimResult<EventId> {
        let agent = self.agent;
        self.kernel
            .schedule_in(delay, EventAction::AgentTimer { agent, tag })
    }

    /// Cancel a scheduled event; idempotent
    pub fn cancel_event(&mut self, event: EventId) {
        self.kernel.events.borrow_mut().cancel(event);
    }

    /// Observable state of any resource
    pub fn resource(&self, resource: ResourceId) -> ResourceSnapshot {
        self.kernel.resource_snapshot(resource)
    }

    /// Hard take-down: up -> down, with *ResourceDown* delivered into every
    /// holder and their units forcibly released.
    pub fn takedown_resource(&mut self, resource: ResourceId) {
        self.kernel.takedown_resource(resource);
    }

    /// Soft-stop: up -> going_down. The resource keeps serving current
    /// holders but accepts no new assignments; an optional timeout arms a
    /// hard take-down.
    pub fn set_resource_going_down(
        &mut self,
        resource: ResourceId,
        timeout: Option<SimTime>,
    ) -> SimResult<()> {
        self.kernel.set_resource_going_down(resource, timeout)
    }

    /// going_down or down -> up; publishes *ResourceUp* and reprocesses the
    /// assignment queue.
    pub fn bring_up_resource(&mut self, resource: ResourceId) {
        self.kernel.bring_up_resource(resource);
    }
}

impl Kernel {
    pub(crate) fn next_message_id(&self) -> MessageId {
        let id = self.next_msg_id.get();
        self.next_msg_id.set(id + 1);
        MessageId(id)
    }

    /// Append a message to the receiver's queue and run its queue pass
    pub(crate) fn send_message(
        &self,
        sender: MsgEndpoint,
        to: AgentId,
        kind: MessageKind,
        payload: MessagePayload,
        response_to: Option<MessageId>,
    ) -> MessageId {
        let id = self.next_message_id();
        let msg = Message {
            id,
            kind,
            sender,
            receiver: to,
            payload,
            response_to,
        };
        self.agents.borrow_mut().get_mut(to).queue.push_back(msg);
        self.pump_agent(to);
        id
    }

    pub(crate) fn subscribe(&self, publisher: AgentId, kind: MessageKind, subscriber: AgentId) {
        let mut agents = self.agents.borrow_mut();
        let subs = agents
            .get_mut(publisher)
            .subscribers
            .entry(kind)
            .or_default();
        if !subs.contains(&subscriber) {
            subs.push(subscriber);
        }
    }

    pub(crate) fn unsubscribe(&self, publisher: AgentId, kind: MessageKind, subscriber: AgentId) {
        let mut agents = self.agents.borrow_mut();
        if let Some(subs) = agents.get_mut(publisher).subscribers.get_mut(&kind) {
            subs.retain(|s| *s != subscriber);
        }
    }

    /// Send an async copy to every subscriber registered on the publisher
    pub(crate) fn publish_from(&self, publisher: AgentId, kind: MessageKind, payload: MessagePayload) {
        let targets: Vec<AgentId> = self
            .agents
            .borrow()
            .get(publisher)
            .subscribers
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for to in targets {
            self.send_message(
                MsgEndpoint::Agent(publisher),
                to,
                kind,
                payload.clone(),
                None,
            );
        }
    }

    /// One queue-processing pass over an agent. Re-entrant calls within the
    /// same dispatch are no-ops; the running pass picks up messages that
    /// arrive mid-scan because the scan is positional.
    pub(crate) fn pump_agent(&self, agent: AgentId) {
        let mut brain = {
            let mut agents = self.agents.borrow_mut();
            let state = agents.get_mut(agent);
            if state.pumping || state.brain.is_none() {
                return;
            }
            state.pumping = true;
            state.brain.take()
        };

        let mut index = 0;
        loop {
            let msg = {
                let agents = self.agents.borrow();
                agents.get(agent).queue.get(index).cloned()
            };
            let msg = match msg {
                Some(m) => m,
                None => break,
            };
            let handled = self.dispatch_to_brain(agent, brain.as_mut(), &msg);
            if handled {
                let _ = self.agents.borrow_mut().get_mut(agent).queue.remove(index);
            } else {
                index += 1;
            }
        }

        self.after_queue(agent, brain.as_mut());

        let mut agents = self.agents.borrow_mut();
        let state = agents.get_mut(agent);
        state.brain = brain;
        state.pumping = false;
    }

    fn dispatch_to_brain(
        &self,
        agent: AgentId,
        brain: Option<&mut AgentBrain>,
        msg: &Message,
    ) -> bool {
        match brain {
            Some(AgentBrain::Resource(_)) | Some(AgentBrain::Pool(..)) => {
                if msg.kind == MessageKind::ResourceRequest {
                    if let MessagePayload::Request(request) = &msg.payload {
                        self.enqueue_request(agent, *request);
                    }
                }
                // release and informational kinds carry no queue state
                true
            }
            Some(AgentBrain::Downtime(downtime)) => {
                downtime.handle_message(self, agent, msg);
                true
            }
            Some(AgentBrain::User(behavior)) => {
                let mut api = AgentApi {
                    kernel: self,
                    agent,
                };
                behavior.handle_message(&mut api, msg)
            }
            None => true,
        }
    }

    fn after_queue(&self, agent: AgentId, brain: Option<&mut AgentBrain>) {
        match brain {
            Some(AgentBrain::Resource(resource)) => {
                self.process_queued_requests_single(*resource, agent);
            }
            Some(AgentBrain::Pool(pool, policy)) => {
                let mut api = crate::pool::PoolApi::new(self, *pool, agent);
                if let Err(err) = policy.process_queued_requests(&mut api) {
                    self.halt_with(err);
                }
            }
            Some(AgentBrain::User(behavior)) => {
                let mut api = AgentApi {
                    kernel: self,
                    agent,
                };
                behavior.after_queue(&mut api);
            }
            _ => {}
        }
    }

    /// Route an agent timer to its brain
    pub(crate) fn agent_timer(&self, agent: AgentId, tag: u64) {
        let mut brain = {
            let mut agents = self.agents.borrow_mut();
            agents.get_mut(agent).brain.take()
        };
        match brain.as_mut() {
            Some(AgentBrain::Downtime(downtime)) => downtime.on_timer(self, agent, tag),
            Some(AgentBrain::User(behavior)) => {
                let mut api = AgentApi {
                    kernel: self,
                    agent,
                };
                behavior.on_timer(&mut api, tag);
            }
            _ => {}
        }
        self.agents.borrow_mut().get_mut(agent).brain = brain;
        // timers count as explicit queue-processing triggers
        self.pump_agent(agent);
    }

    /// Resolve a pending synchronous send with a response value
    pub(crate) fn resolve_response(&self, request: MessageId, value: serde_json::Value) {
        let waiter = self.pending_responses.borrow_mut().remove(&request);
        if let Some(waiter) = waiter {
            if let Some(timeout) = waiter.timeout_event {
                self.events.borrow_mut().cancel(timeout);
            }
            self.schedule_resume(waiter.process, waiter.token, ResumeSignal::Response(value));
        }
    }

    /// A synchronous send's timeout fired before any response
    pub(crate) fn response_timed_out(&self, request: MessageId) {
        let waiter = self.pending_responses.borrow_mut().remove(&request);
        if let Some(waiter) = waiter {
            // the unanswered request is withdrawn from the receiver's queue
            self.agents
                .borrow_mut()
                .get_mut(waiter.receiver)
                .queue
                .retain(|m| m.id != request);
            self.complete_wait(waiter.process, waiter.token, Err(SimError::TimedOut));
        }
    }
}
