//! Data collection
//!
//! The engine does not persist anything itself: elements and datasets are
//! announced to an injected [`DataSink`], and every value change is pushed
//! through it tagged with the current run and batch. Time-weighted datasets
//! emit `(from, to, value)` intervals; unweighted datasets emit point
//! values. Batch 0 is warmup.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::config::SimConfig;
use crate::engine::ProcessId;
use crate::error::SimResult;
use crate::time::TimeUnit;

/// Dataset handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub(crate) u32);

/// Handle to a model-owned counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterId(pub(crate) u32);

/// Handle to a model-owned unweighted collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectorId(pub(crate) u32);

/// Kind of values a dataset carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Real,
    Time,
}

/// Write-only sink receiving every dataset emission
///
/// The reporting layer (database, CSV summaries) lives behind this trait;
/// the engine only guarantees the emission sequence is deterministic for a
/// given `(model, seed, run index)`.
pub trait DataSink {
    fn on_element(&mut self, element_id: &str, class_name: &str, element_type: &str);
    #[allow(clippy::too_many_arguments)]
    fn on_dataset(
        &mut self,
        dataset: DatasetId,
        element_id: &str,
        name: &str,
        value_type: ValueType,
        is_time_weighted: bool,
        time_unit: TimeUnit,
    );
    fn put_unweighted(&mut self, dataset: DatasetId, run: u32, batch: u32, simtime: f64, value: f64);
    fn put_timeweighted(
        &mut self,
        dataset: DatasetId,
        run: u32,
        batch: u32,
        from_time: f64,
        to_time: f64,
        value: f64,
    );
    fn begin_run(&mut self, run: u32);
    fn begin_batch(&mut self, run: u32, batch: u32);
    fn end_batch(&mut self, run: u32, batch: u32);
    fn end_run(&mut self, run: u32);
}

/// Sink that drops everything
#[derive(Debug, Default)]
pub struct NullSink;

impl DataSink for NullSink {
    fn on_element(&mut self, _element_id: &str, _class_name: &str, _element_type: &str) {}
    fn on_dataset(
        &mut self,
        _dataset: DatasetId,
        _element_id: &str,
        _name: &str,
        _value_type: ValueType,
        _is_time_weighted: bool,
        _time_unit: TimeUnit,
    ) {
    }
    fn put_unweighted(
        &mut self,
        _dataset: DatasetId,
        _run: u32,
        _batch: u32,
        _simtime: f64,
        _value: f64,
    ) {
    }
    fn put_timeweighted(
        &mut self,
        _dataset: DatasetId,
        _run: u32,
        _batch: u32,
        _from_time: f64,
        _to_time: f64,
        _value: f64,
    ) {
    }
    fn begin_run(&mut self, _run: u32) {}
    fn begin_batch(&mut self, _run: u32, _batch: u32) {}
    fn end_batch(&mut self, _run: u32, _batch: u32) {}
    fn end_run(&mut self, _run: u32) {}
}

/// One record captured by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Emission {
    Element {
        element_id: String,
        class_name: String,
        element_type: String,
    },
    Dataset {
        dataset: DatasetId,
        element_id: String,
        name: String,
        value_type: ValueType,
        is_time_weighted: bool,
    },
    Unweighted {
        dataset: DatasetId,
        run: u32,
        batch: u32,
        simtime: f64,
        value: f64,
    },
    Timeweighted {
        dataset: DatasetId,
        run: u32,
        batch: u32,
        from_time: f64,
        to_time: f64,
        value: f64,
    },
    BeginRun(u32),
    BeginBatch(u32, u32),
    EndBatch(u32, u32),
    EndRun(u32),
}

/// In-memory sink capturing the full emission sequence, shared with the
/// caller through a [`RecordingHandle`]. Used for replication-determinism
/// checks and in tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Rc<RefCell<Vec<Emission>>>,
}

/// Reader side of a [`RecordingSink`]
#[derive(Debug, Clone, Default)]
pub struct RecordingHandle {
    records: Rc<RefCell<Vec<Emission>>>,
}

impl RecordingSink {
    /// Create a sink and the handle that outlives it
    pub fn new() -> (Self, RecordingHandle) {
        let records = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                records: Rc::clone(&records),
            },
            RecordingHandle { records },
        )
    }
}

impl RecordingHandle {
    /// Snapshot of everything emitted so far
    pub fn records(&self) -> Vec<Emission> {
        self.records.borrow().clone()
    }

    /// Datasets registered under the given element id and name
    pub fn dataset_ids(&self, element_id: &str, name: &str) -> Vec<DatasetId> {
        self.records
            .borrow()
            .iter()
            .filter_map(|r| match r {
                Emission::Dataset {
                    dataset,
                    element_id: e,
                    name: n,
                    ..
                } if e == element_id && n == name => Some(*dataset),
                _ => None,
            })
            .collect()
    }

    /// Time-weighted mean of a dataset over the given batches
    pub fn timeweighted_mean(&self, dataset: DatasetId, batches: std::ops::Range<u32>) -> f64 {
        let mut weighted = 0.0;
        let mut span = 0.0;
        for r in self.records.borrow().iter() {
            if let Emission::Timeweighted {
                dataset: d,
                batch,
                from_time,
                to_time,
                value,
                ..
            } = r
            {
                if *d == dataset && batches.contains(batch) {
                    weighted += value * (to_time - from_time);
                    span += to_time - from_time;
                }
            }
        }
        if span > 0.0 {
            weighted / span
        } else {
            0.0
        }
    }

    /// Plain mean of an unweighted dataset over the given batches
    pub fn unweighted_mean(&self, dataset: DatasetId, batches: std::ops::Range<u32>) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for r in self.records.borrow().iter() {
            if let Emission::Unweighted {
                dataset: d,
                batch,
                value,
                ..
            } = r
            {
                if *d == dataset && batches.contains(batch) {
                    total += value;
                    count += 1;
                }
            }
        }
        if count > 0 {
            total / count as f64
        } else {
            0.0
        }
    }
}

impl DataSink for RecordingSink {
    fn on_element(&mut self, element_id: &str, class_name: &str, element_type: &str) {
        self.records.borrow_mut().push(Emission::Element {
            element_id: element_id.to_string(),
            class_name: class_name.to_string(),
            element_type: element_type.to_string(),
        });
    }

    fn on_dataset(
        &mut self,
        dataset: DatasetId,
        element_id: &str,
        name: &str,
        value_type: ValueType,
        is_time_weighted: bool,
        _time_unit: TimeUnit,
    ) {
        self.records.borrow_mut().push(Emission::Dataset {
            dataset,
            element_id: element_id.to_string(),
            name: name.to_string(),
            value_type,
            is_time_weighted,
        });
    }

    fn put_unweighted(&mut self, dataset: DatasetId, run: u32, batch: u32, simtime: f64, value: f64) {
        self.records.borrow_mut().push(Emission::Unweighted {
            dataset,
            run,
            batch,
            simtime,
            value,
        });
    }

    fn put_timeweighted(
        &mut self,
        dataset: DatasetId,
        run: u32,
        batch: u32,
        from_time: f64,
        to_time: f64,
        value: f64,
    ) {
        self.records.borrow_mut().push(Emission::Timeweighted {
            dataset,
            run,
            batch,
            from_time,
            to_time,
            value,
        });
    }

    fn begin_run(&mut self, run: u32) {
        self.records.borrow_mut().push(Emission::BeginRun(run));
    }

    fn begin_batch(&mut self, run: u32, batch: u32) {
        self.records.borrow_mut().push(Emission::BeginBatch(run, batch));
    }

    fn end_batch(&mut self, run: u32, batch: u32) {
        self.records.borrow_mut().push(Emission::EndBatch(run, batch));
    }

    fn end_run(&mut self, run: u32) {
        self.records.borrow_mut().push(Emission::EndRun(run));
    }
}

struct DatasetState {
    enabled: bool,
    time_weighted: bool,
    last_value: f64,
    last_time: f64,
}

struct CounterState {
    dataset: DatasetId,
    value: f64,
    capacity: Option<u32>,
    waiters: VecDeque<CounterWaiter>,
}

pub(crate) struct CounterWaiter {
    pub(crate) process: ProcessId,
    pub(crate) token: u64,
    pub(crate) units: u32,
}

struct CollectorState {
    dataset: DatasetId,
}

/// Per-run hub between model elements and the injected sink
pub(crate) struct DataHub {
    sink: Box<dyn DataSink>,
    run: u32,
    batch: u32,
    element_filters: Vec<GlobMatcher>,
    dataset_filters: Vec<(GlobMatcher, GlobMatcher)>,
    datasets: Vec<DatasetState>,
    counters: Vec<CounterState>,
    collectors: Vec<CollectorState>,
}

impl DataHub {
    pub(crate) fn new(config: &SimConfig, run: u32, sink: Box<dyn DataSink>) -> SimResult<Self> {
        let mut element_filters = Vec::new();
        for pattern in &config.disable_elements {
            element_filters.push(Glob::new(pattern)?.compile_matcher());
        }
        let mut dataset_filters = Vec::new();
        for filter in &config.disable_datasets {
            dataset_filters.push((
                Glob::new(&filter.element)?.compile_matcher(),
                Glob::new(&filter.dataset)?.compile_matcher(),
            ));
        }
        Ok(Self {
            sink,
            run,
            batch: 0,
            element_filters,
            dataset_filters,
            datasets: Vec::new(),
            counters: Vec::new(),
            collectors: Vec::new(),
        })
    }

    fn element_enabled(&self, element_id: &str) -> bool {
        !self.element_filters.iter().any(|m| m.is_match(element_id))
    }

    fn dataset_enabled(&self, element_id: &str, name: &str) -> bool {
        self.element_enabled(element_id)
            && !self
                .dataset_filters
                .iter()
                .any(|(e, d)| e.is_match(element_id) && d.is_match(name))
    }

    /// Announce an element to the sink unless its id is filtered out
    pub(crate) fn register_element(&mut self, element_id: &str, class_name: &str, element_type: &str) {
        if self.element_enabled(element_id) {
            self.sink.on_element(element_id, class_name, element_type);
        }
    }

    /// Register a dataset under an element, wiring up the disable filters
    pub(crate) fn register_dataset(
        &mut self,
        element_id: &str,
        name: &str,
        value_type: ValueType,
        time_weighted: bool,
        time_unit: TimeUnit,
        initial_value: f64,
    ) -> DatasetId {
        let id = DatasetId(self.datasets.len() as u32);
        let enabled = self.dataset_enabled(element_id, name);
        if enabled {
            self.sink
                .on_dataset(id, element_id, name, value_type, time_weighted, time_unit);
        }
        self.datasets.push(DatasetState {
            enabled,
            time_weighted,
            last_value: initial_value,
            last_time: 0.0,
        });
        id
    }

    /// Emit a point value on an unweighted dataset
    pub(crate) fn put_value(&mut self, dataset: DatasetId, now: f64, value: f64) {
        let state = &self.datasets[dataset.0 as usize];
        debug_assert!(!state.time_weighted);
        if state.enabled {
            self.sink
                .put_unweighted(dataset, self.run, self.batch, now, value);
        }
    }

    /// Record a transition on a time-weighted dataset: the previous value
    /// held from its transition time until now.
    pub(crate) fn set_level(&mut self, dataset: DatasetId, now: f64, value: f64) {
        let run = self.run;
        let batch = self.batch;
        let state = &mut self.datasets[dataset.0 as usize];
        debug_assert!(state.time_weighted);
        if state.enabled && now > state.last_time {
            self.sink
                .put_timeweighted(dataset, run, batch, state.last_time, now, state.last_value);
        }
        state.last_value = value;
        state.last_time = state.last_time.max(now);
    }

    /// Close every open time-weighted interval at a batch boundary or at
    /// run end, so each batch owns exactly its own span.
    pub(crate) fn flush_levels(&mut self, now: f64) {
        let run = self.run;
        let batch = self.batch;
        for (idx, state) in self.datasets.iter_mut().enumerate() {
            if state.time_weighted && now > state.last_time {
                if state.enabled {
                    self.sink.put_timeweighted(
                        DatasetId(idx as u32),
                        run,
                        batch,
                        state.last_time,
                        now,
                        state.last_value,
                    );
                }
                state.last_time = now;
            }
        }
    }

    pub(crate) fn begin_run(&mut self) {
        self.sink.begin_run(self.run);
        self.sink.begin_batch(self.run, 0);
    }

    /// End the current batch at `now` and open the next one
    pub(crate) fn next_batch(&mut self, now: f64) {
        self.flush_levels(now);
        self.sink.end_batch(self.run, self.batch);
        self.batch += 1;
        self.sink.begin_batch(self.run, self.batch);
    }

    pub(crate) fn end_run(&mut self, now: f64) {
        self.flush_levels(now);
        self.sink.end_batch(self.run, self.batch);
        self.sink.end_run(self.run);
    }

    // counters and collectors

    pub(crate) fn add_counter(&mut self, dataset: DatasetId, capacity: Option<u32>) -> CounterId {
        let id = CounterId(self.counters.len() as u32);
        self.counters.push(CounterState {
            dataset,
            value: 0.0,
            capacity,
            waiters: VecDeque::new(),
        });
        id
    }

    pub(crate) fn add_collector(&mut self, dataset: DatasetId) -> CollectorId {
        let id = CollectorId(self.collectors.len() as u32);
        self.collectors.push(CollectorState { dataset });
        id
    }

    pub(crate) fn counter_value(&self, counter: CounterId) -> f64 {
        self.counters[counter.0 as usize].value
    }

    /// Apply an increment if it fits under the capacity. Returns whether
    /// the increment was applied; a `false` means the caller must wait.
    pub(crate) fn counter_try_increment(
        &mut self,
        counter: CounterId,
        units: u32,
        now: f64,
    ) -> bool {
        let state = &self.counters[counter.0 as usize];
        let fits = match state.capacity {
            Some(cap) => state.value + f64::from(units) <= f64::from(cap),
            None => true,
        };
        if fits {
            let dataset = state.dataset;
            let value = state.value + f64::from(units);
            self.counters[counter.0 as usize].value = value;
            self.set_level(dataset, now, value);
        }
        fits
    }

    pub(crate) fn counter_enqueue_waiter(&mut self, counter: CounterId, waiter: CounterWaiter) {
        self.counters[counter.0 as usize].waiters.push_back(waiter);
    }

    pub(crate) fn counter_remove_waiter(&mut self, counter: CounterId, process: ProcessId) {
        self.counters[counter.0 as usize]
            .waiters
            .retain(|w| w.process != process);
    }

    /// Apply a decrement and admit FIFO waiters that now fit. Returns the
    /// processes to resume.
    pub(crate) fn counter_decrement(
        &mut self,
        counter: CounterId,
        units: u32,
        now: f64,
    ) -> Vec<(ProcessId, u64)> {
        let idx = counter.0 as usize;
        let dataset = self.counters[idx].dataset;
        let value = (self.counters[idx].value - f64::from(units)).max(0.0);
        self.counters[idx].value = value;
        self.set_level(dataset, now, value);

        let mut admitted = Vec::new();
        loop {
            let admit = {
                let state = &self.counters[idx];
                match (state.waiters.front(), state.capacity) {
                    (Some(w), Some(cap)) => state.value + f64::from(w.units) <= f64::from(cap),
                    (Some(_), None) => true,
                    (None, _) => false,
                }
            };
            if !admit {
                break;
            }
            let waiter = match self.counters[idx].waiters.pop_front() {
                Some(w) => w,
                None => break,
            };
            let value = self.counters[idx].value + f64::from(waiter.units);
            self.counters[idx].value = value;
            self.set_level(dataset, now, value);
            admitted.push((waiter.process, waiter.token));
        }
        admitted
    }

    pub(crate) fn collector_dataset(&self, collector: CollectorId) -> DatasetId {
        self.collectors[collector.0 as usize].dataset
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn hub_with(config: SimConfig) -> (DataHub, RecordingHandle) {
        let (sink, handle) = RecordingSink::new();
        let hub = DataHub::new(&config, 1, Box::new(sink)).unwrap();
        (hub, handle)
    }

    #[test]
    fn test_timeweighted_transitions() {
        let (mut hub, handle) = hub_with(SimConfig::default());
        let ds = hub.register_dataset("Shop.Line", "population", ValueType::Integer, true, TimeUnit::None, 0.0);
        hub.set_level(ds, 3.0, 1.0);
        hub.set_level(ds, 7.0, 2.0);
        hub.flush_levels(10.0);
        let spans: Vec<(f64, f64, f64)> = handle
            .records()
            .iter()
            .filter_map(|r| match r {
                Emission::Timeweighted {
                    from_time,
                    to_time,
                    value,
                    ..
                } => Some((*from_time, *to_time, *value)),
                _ => None,
            })
            .collect();
        assert_eq!(spans, vec![(0.0, 3.0, 0.0), (3.0, 7.0, 1.0), (7.0, 10.0, 2.0)]);
    }

    #[test]
    fn test_same_time_transition_emits_nothing() {
        let (mut hub, handle) = hub_with(SimConfig::default());
        let ds = hub.register_dataset("R", "in_use", ValueType::Integer, true, TimeUnit::None, 0.0);
        hub.set_level(ds, 0.0, 1.0);
        hub.set_level(ds, 0.0, 2.0);
        assert!(handle
            .records()
            .iter()
            .all(|r| !matches!(r, Emission::Timeweighted { .. })));
    }

    #[test]
    fn test_element_disable_glob() {
        let config = SimConfig {
            disable_elements: vec!["Shop.*".to_string()],
            ..SimConfig::default()
        };
        let (mut hub, handle) = hub_with(config);
        hub.register_element("Shop.Line", "SimQueue", "location");
        hub.register_element("Bank.Line", "SimQueue", "location");
        let ds = hub.register_dataset("Shop.Line", "population", ValueType::Integer, true, TimeUnit::None, 0.0);
        hub.set_level(ds, 1.0, 5.0);
        hub.flush_levels(2.0);
        let records = handle.records();
        assert!(records
            .iter()
            .any(|r| matches!(r, Emission::Element { element_id, .. } if element_id == "Bank.Line")));
        assert!(!records
            .iter()
            .any(|r| matches!(r, Emission::Element { element_id, .. } if element_id == "Shop.Line")));
        assert!(!records
            .iter()
            .any(|r| matches!(r, Emission::Timeweighted { .. })));
    }

    #[test]
    fn test_dataset_disable_pair() {
        let config = SimConfig {
            disable_datasets: vec![crate::config::DatasetFilter {
                element: "*".to_string(),
                dataset: "entries".to_string(),
            }],
            ..SimConfig::default()
        };
        let (mut hub, handle) = hub_with(config);
        let entries = hub.register_dataset("Q", "entries", ValueType::Integer, false, TimeUnit::None, 0.0);
        let time = hub.register_dataset("Q", "time", ValueType::Time, false, TimeUnit::None, 0.0);
        hub.put_value(entries, 1.0, 1.0);
        hub.put_value(time, 1.0, 4.5);
        let unweighted: Vec<DatasetId> = handle
            .records()
            .iter()
            .filter_map(|r| match r {
                Emission::Unweighted { dataset, .. } => Some(*dataset),
                _ => None,
            })
            .collect();
        assert_eq!(unweighted, vec![time]);
    }

    #[test]
    fn test_counter_capacity_queueing() {
        let (mut hub, _handle) = hub_with(SimConfig::default());
        let ds = hub.register_dataset("C", "level", ValueType::Integer, true, TimeUnit::None, 0.0);
        let counter = hub.add_counter(ds, Some(2));
        assert!(hub.counter_try_increment(counter, 2, 1.0));
        assert!(!hub.counter_try_increment(counter, 1, 1.0));
        hub.counter_enqueue_waiter(
            counter,
            CounterWaiter {
                process: ProcessId(7),
                token: 42,
                units: 1,
            },
        );
        let admitted = hub.counter_decrement(counter, 1, 2.0);
        assert_eq!(admitted, vec![(ProcessId(7), 42)]);
        assert_eq!(hub.counter_value(counter), 2.0);
    }

    #[test]
    fn test_batch_rollover_flushes() {
        let (mut hub, handle) = hub_with(SimConfig::default());
        hub.begin_run();
        let ds = hub.register_dataset("R", "in_use", ValueType::Integer, true, TimeUnit::None, 0.0);
        hub.set_level(ds, 2.0, 1.0);
        hub.next_batch(5.0);
        hub.set_level(ds, 8.0, 0.0);
        hub.end_run(9.0);
        let batches: Vec<(u32, f64, f64)> = handle
            .records()
            .iter()
            .filter_map(|r| match r {
                Emission::Timeweighted {
                    batch,
                    from_time,
                    to_time,
                    ..
                } => Some((*batch, *from_time, *to_time)),
                _ => None,
            })
            .collect();
        assert_eq!(
            batches,
            vec![(0, 0.0, 2.0), (0, 2.0, 5.0), (1, 5.0, 8.0), (1, 8.0, 9.0)]
        );
    }
}
