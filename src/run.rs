//! Replication protocol
//!
//! One replication runs warmup (batch 0) followed by `nbatches` equal
//! batches, emitting batch boundaries to the sink so the summary layer can
//! do batch-means analysis. Replications parallelize across OS processes:
//! the caller launches one process per run index and aggregates the sinks.

use crate::engine::Simulation;
use crate::error::{SimError, SimResult};
use crate::event::EventAction;
use crate::time::SimTime;

impl Simulation {
    /// Run warmup plus `nbatches` batches, driving the sink's run/batch
    /// lifecycle, and leave the clock at the run's end time.
    pub fn run_single(
        &mut self,
        warmup: SimTime,
        batch_length: SimTime,
        nbatches: u32,
    ) -> SimResult<()> {
        let warmup = self.kernel.ticks(warmup)?;
        let batch = self.kernel.ticks(batch_length)?;
        if warmup < 0.0 {
            return Err(SimError::InvalidRequest(
                "warmup cannot be negative".to_string(),
            ));
        }
        if batch <= 0.0 || nbatches == 0 {
            return Err(SimError::InvalidRequest(
                "need at least one batch of positive length".to_string(),
            ));
        }

        tracing::info!(
            run = self.kernel.run_index,
            warmup,
            batch,
            nbatches,
            "replication started"
        );
        self.kernel.data.borrow_mut().begin_run();
        for k in 0..nbatches {
            self.kernel
                .schedule_at_ticks(warmup + f64::from(k) * batch, EventAction::BatchBoundary);
        }
        let end = warmup + f64::from(nbatches) * batch;
        self.run_to_ticks(end)?;
        self.kernel.data.borrow_mut().end_run(end);
        tracing::info!(run = self.kernel.run_index, end, "replication finished");
        Ok(())
    }
}
