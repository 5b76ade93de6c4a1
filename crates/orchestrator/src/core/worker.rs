use std::sync::Arc;

use events::Event;
use provision_core::{LogLevel, SlotOutcome};
use tracing::debug;

use super::pipeline::{AttemptPipeline, SlotReport};
use super::run_state::RunState;

/// One sequential worker: claims slots and resources until the run is done.
pub struct Worker {
    id: usize,
    tag: String,
    run: Arc<RunState>,
    pipeline: Arc<AttemptPipeline>,
}

impl Worker {
    /// `tagged` prefixes every log line with `[W{id}]`; used when more than
    /// one worker is running.
    pub fn new(id: usize, tagged: bool, run: Arc<RunState>, pipeline: Arc<AttemptPipeline>) -> Self {
        let tag = if tagged {
            format!("[W{}] ", id)
        } else {
            String::new()
        };
        Self {
            id,
            tag,
            run,
            pipeline,
        }
    }

    pub async fn run(self) {
        let run = &self.run;
        let _active = ActiveWorker::register(run);
        debug!(worker = self.id, session_id = %run.session_id, "Worker started");

        loop {
            if run.is_cancelled() {
                run.log(LogLevel::Warning, format!("{}Stop requested, worker exiting", self.tag));
                break;
            }

            let Some(slot) = run.slots.claim_next() else {
                break;
            };

            let Some(lease) = run.pool.claim() else {
                run.slots.return_slot(slot);
                let delay = self.pipeline.timings().no_resource_delay();
                run.log(
                    LogLevel::Warning,
                    format!(
                        "{}No free resource available, waiting {}s",
                        self.tag,
                        delay.as_secs()
                    ),
                );
                run.sleep_unless_cancelled(delay).await;
                continue;
            };

            run.log(
                LogLevel::Info,
                format!(
                    "{}Starting unit {}/{} on {}",
                    self.tag,
                    slot + 1,
                    run.target_count,
                    lease.spec().display_name()
                ),
            );

            let report = self.pipeline.run_slot(run, slot, &lease, &self.tag).await;
            lease.release();

            self.apply(slot, report);
        }

        debug!(worker = self.id, session_id = %run.session_id, "Worker finished");
    }

    fn apply(&self, slot: usize, report: SlotReport) {
        let run = &self.run;

        match report.outcome {
            SlotOutcome::Succeeded => {
                if let Some(record) = report.record {
                    let succeeded = run.record_success(record);
                    run.log(
                        LogLevel::Success,
                        format!(
                            "{}SUCCESS: unit {} completed after {} attempt(s)",
                            self.tag,
                            slot + 1,
                            report.attempts
                        ),
                    );
                    run.log(
                        LogLevel::Info,
                        format!("Progress: {}/{}", succeeded, run.target_count),
                    );
                }
            }
            SlotOutcome::Exhausted => {
                run.record_failure();
            }
            SlotOutcome::Cancelled => {}
        }

        run.emit(Event::SlotCompleted {
            session_id: run.session_id,
            slot,
            outcome: report.outcome,
            attempts: report.attempts,
        });
        run.emit_progress(true);
    }
}

/// Counts a worker as active until dropped, including on unwind.
struct ActiveWorker<'a>(&'a RunState);

impl<'a> ActiveWorker<'a> {
    fn register(run: &'a RunState) -> Self {
        run.worker_started();
        Self(run)
    }
}

impl Drop for ActiveWorker<'_> {
    fn drop(&mut self) {
        self.0.worker_finished();
    }
}
