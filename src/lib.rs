//! Process-based discrete-event simulation engine
//!
//! This crate provides a deterministic single-threaded simulation core:
//! - An event loop over a min-heap of `(time, sequence)`-ordered events
//! - Processes written as plain `async` bodies that suspend on
//!   `wait_for`, `acquire`, `acquire_from` and synchronous sends
//! - Resources with priority-queued assignment, pools with class-filtered
//!   selection and a pluggable assignment pass
//! - Downtime agents (scheduled and failure-driven) with a going-down
//!   soft-stop protocol
//! - Dataset emission to an injected sink, batched for batch-means and
//!   independent-replication analysis
//!
//! Replications are reproducible: a run's event sequence is a pure
//! function of the model, the configuration and the run index.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod agent;
pub mod config;
pub mod data;
pub mod downtime;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod location;
pub mod pool;
pub mod process;
pub mod random;
pub mod resource;
pub mod source;
pub mod telemetry;
pub mod time;

mod run;

pub use agent::{AgentApi, AgentBehavior, AgentId, Message, MessageKind, MessagePayload, MsgEndpoint};
pub use config::{DatasetFilter, SimConfig, TraceConfig};
pub use data::{
    CollectorId, CounterId, DataSink, DatasetId, Emission, NullSink, RecordingHandle,
    RecordingSink, ValueType,
};
pub use downtime::{
    DowntimeSchedule, DowntimeView, ImmediateTakedown, TakedownDecision, TakedownPolicy,
};
pub use engine::{EndCondition, ProcessId, Simulation};
pub use entity::EntityId;
pub use error::{SimError, SimResult};
pub use event::EventId;
pub use location::LocationId;
pub use pool::{AssignmentPolicy, DefaultPoolPolicy, PoolApi, PoolId, RequestInfo};
pub use process::{AcquireOptions, ProcessContext, ResourceAssignment};
pub use random::{Dist, Sampler, StreamId, BASE_SEED};
pub use resource::{ClassId, RequestId, ResourceId, ResourceSnapshot, Selector};
pub use time::{SimTime, TimeUnit};
