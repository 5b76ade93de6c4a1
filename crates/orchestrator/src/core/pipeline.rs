//! Attempt pipeline: rotate, provision, run stages, finalize.
//!
//! A slot is retried on a freshly rotated resource until one attempt gets
//! through every stage, the rotation budget is spent, or the session is
//! stopped.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use provision_core::{
    CompletedUnitRecord, LogLevel, ResourceSpec, SessionParams, SlotOutcome,
    MAX_ROTATIONS_PER_SLOT,
};
use tokio::time::Instant;
use tracing::debug;

use crate::config::EngineTimings;
use crate::error::{OrchestratorError, ProvisionError, Result};
use crate::resources::{ContextGuard, ResourceLease};
use crate::services::{
    Collaborators, ContextId, ExecutionHandle, ProvisionOptions, RotationOutcome, StageContext,
    StageReport,
};

use super::run_state::RunState;

/// How a slot's attempt loop ended.
#[derive(Debug, Clone)]
pub struct SlotReport {
    pub outcome: SlotOutcome,
    pub attempts: u32,
    /// Present only for [`SlotOutcome::Succeeded`]
    pub record: Option<CompletedUnitRecord>,
}

struct AttemptSuccess {
    context_id: ContextId,
    artifacts: BTreeMap<String, String>,
}

pub struct AttemptPipeline {
    collaborators: Collaborators,
    params: SessionParams,
    timings: EngineTimings,
    max_rotations: u32,
}

impl AttemptPipeline {
    pub fn new(collaborators: Collaborators, params: SessionParams, timings: EngineTimings) -> Self {
        Self {
            collaborators,
            params,
            timings,
            max_rotations: MAX_ROTATIONS_PER_SLOT,
        }
    }

    pub fn with_max_rotations(mut self, max_rotations: u32) -> Self {
        self.max_rotations = max_rotations;
        self
    }

    pub fn timings(&self) -> &EngineTimings {
        &self.timings
    }

    /// Drive one slot to a terminal outcome on the leased resource.
    ///
    /// Each failed attempt consumes one rotation, so a slot gets at most
    /// `max_rotations + 1` attempts. A panic anywhere in an attempt counts as
    /// a failed attempt; a context opened before the panic is torn down by
    /// its guard.
    pub async fn run_slot(
        &self,
        run: &RunState,
        slot: usize,
        lease: &ResourceLease,
        tag: &str,
    ) -> SlotReport {
        let started = Instant::now();
        let mut rotations = 0u32;
        let mut attempts = 0u32;

        while rotations <= self.max_rotations {
            if run.is_cancelled() {
                return cancelled(attempts);
            }
            attempts += 1;

            let attempt = AssertUnwindSafe(self.run_attempt(run, slot, attempts, lease, tag))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(OrchestratorError::AttemptPanicked(panic_message(&*panic)))
                });

            match attempt {
                Ok(success) => {
                    let resource = lease.spec();
                    let record = CompletedUnitRecord {
                        slot,
                        context_id: success.context_id.to_string(),
                        resource_index: lease.index(),
                        resource_name: resource.display_name(),
                        attempts,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        artifacts: success.artifacts,
                        completed_at: Utc::now(),
                    };
                    return SlotReport {
                        outcome: SlotOutcome::Succeeded,
                        attempts,
                        record: Some(record),
                    };
                }
                Err(OrchestratorError::Cancelled) => {
                    run.log(
                        LogLevel::Warning,
                        format!("{}Slot {} stopped before completion", tag, slot + 1),
                    );
                    return cancelled(attempts);
                }
                Err(e) => {
                    rotations += 1;
                    run.record_rotation();
                    run.log(
                        LogLevel::Error,
                        format!("{}Attempt {} failed: {}", tag, attempts, e),
                    );
                    if rotations <= self.max_rotations {
                        run.log(
                            LogLevel::Info,
                            format!(
                                "{}Retrying with a rotated resource ({}/{})",
                                tag, rotations, self.max_rotations
                            ),
                        );
                    }
                }
            }
        }

        let exhausted = OrchestratorError::BudgetExhausted { slot, attempts };
        run.log(LogLevel::Error, format!("{}{}", tag, exhausted));
        SlotReport {
            outcome: SlotOutcome::Exhausted,
            attempts,
            record: None,
        }
    }

    async fn run_attempt(
        &self,
        run: &RunState,
        slot: usize,
        attempt: u32,
        lease: &ResourceLease,
        tag: &str,
    ) -> Result<AttemptSuccess> {
        let resource = lease.spec();
        self.rotate(run, resource, tag).await?;

        if run.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let provisioner = &self.collaborators.provisioner;
        let options = ProvisionOptions {
            visible: run.visible(),
            label: format!("slot-{}-attempt-{}", slot + 1, attempt),
        };

        run.log(
            LogLevel::Action,
            format!("{}Provisioning context on {}", tag, resource.display_name()),
        );

        let context_id = match provisioner.create(resource, &options).await {
            Ok(id) => id,
            Err(e) => return Err(self.provision_failed(run, e).await),
        };

        let mut guard = ContextGuard::new(provisioner.clone(), context_id.clone());

        let handle = match provisioner.open(&context_id).await {
            Ok(handle) => handle,
            Err(e) => {
                guard.finalize().await;
                return Err(self.provision_failed(run, e).await);
            }
        };

        debug!(context = %context_id, slot, attempt, "Execution context opened");

        let result = self
            .run_stages(run, slot, attempt, lease.index(), &handle, tag)
            .await;
        guard.finalize().await;

        Ok(AttemptSuccess {
            context_id,
            artifacts: result?,
        })
    }

    /// Rotate until the service succeeds or the session is stopped.
    async fn rotate(&self, run: &RunState, resource: &ResourceSpec, tag: &str) -> Result<()> {
        loop {
            if run.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            run.log(
                LogLevel::Action,
                format!("{}Rotating {}", tag, resource.display_name()),
            );

            match self.collaborators.rotator.rotate(resource).await {
                Ok(RotationOutcome::Rotated) => {
                    let settle = self.timings.rotation_settle();
                    run.log(
                        LogLevel::Success,
                        format!(
                            "{}Rotation complete, waiting {}s for the resource to settle",
                            tag,
                            settle.as_secs()
                        ),
                    );
                    if !run.sleep_unless_cancelled(settle).await {
                        return Err(OrchestratorError::Cancelled);
                    }
                    return Ok(());
                }
                Ok(RotationOutcome::Skipped) => {
                    run.log(
                        LogLevel::Warning,
                        format!(
                            "{}{} has no rotation handle, using it as is",
                            tag,
                            resource.display_name()
                        ),
                    );
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.timings.rotation_retry();
                    let err = OrchestratorError::from(e);
                    run.log(
                        LogLevel::Error,
                        format!("{}{}; retrying in {}s", tag, err, delay.as_secs()),
                    );
                    if !run.sleep_unless_cancelled(delay).await {
                        return Err(OrchestratorError::Cancelled);
                    }
                }
            }
        }
    }

    async fn provision_failed(&self, run: &RunState, e: ProvisionError) -> OrchestratorError {
        if run.sleep_unless_cancelled(self.timings.provision_retry()).await {
            OrchestratorError::Provision(e)
        } else {
            OrchestratorError::Cancelled
        }
    }

    /// Run every stage in order, merging artifacts. The first non-success
    /// outcome aborts the remaining stages.
    async fn run_stages(
        &self,
        run: &RunState,
        slot: usize,
        attempt: u32,
        resource_index: usize,
        handle: &ExecutionHandle,
        tag: &str,
    ) -> Result<BTreeMap<String, String>> {
        let mut artifacts = BTreeMap::new();

        for stage in self.collaborators.stages.iter() {
            if run.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            run.log(
                LogLevel::Action,
                format!("{}Running stage {}", tag, stage.name()),
            );

            let ctx = StageContext {
                session_id: run.session_id,
                slot,
                attempt,
                resource_index,
                params: self.params.clone(),
                artifacts: artifacts.clone(),
            };

            let report = AssertUnwindSafe(stage.run(handle, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    StageReport::hard_fail(format!("stage panicked: {}", panic_message(&*panic)))
                });

            let StageReport {
                outcome,
                detail,
                artifacts: produced,
            } = report;

            if !outcome.is_success() {
                return Err(OrchestratorError::stage_failed(stage.name(), outcome, detail));
            }
            artifacts.extend(produced);
        }

        Ok(artifacts)
    }
}

fn cancelled(attempts: u32) -> SlotReport {
    SlotReport {
        outcome: SlotOutcome::Cancelled,
        attempts,
        record: None,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run_state::SharedSettings;
    use crate::core::testing::{MockProvisioner, MockRotator, ScriptedStage};
    use crate::resources::ResourcePool;
    use crate::services::Stage;
    use provision_core::StageOutcome;
    use std::sync::Arc;

    fn run_state(pool: Vec<ResourceSpec>) -> RunState {
        RunState::new(
            1,
            ResourcePool::new(pool),
            Arc::new(SharedSettings::default()),
            None,
        )
    }

    fn pipeline(
        provisioner: Arc<MockProvisioner>,
        rotator: Arc<MockRotator>,
        stages: Vec<Arc<dyn Stage>>,
    ) -> AttemptPipeline {
        AttemptPipeline::new(
            Collaborators::new(provisioner, rotator, stages),
            SessionParams::new().with("locale", "en"),
            EngineTimings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_merges_artifacts() {
        let provisioner = Arc::new(MockProvisioner::default());
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(ScriptedStage::always("register", StageOutcome::Success).with_artifact("user", "u1")),
            Arc::new(ScriptedStage::always("verify", StageOutcome::Success).expecting_artifact("user")),
        ];
        let pipeline = pipeline(provisioner.clone(), Arc::new(MockRotator::default()), stages);
        let run = run_state(vec![ResourceSpec::direct()]);
        let lease = run.pool.claim().unwrap();

        let report = pipeline.run_slot(&run, 0, &lease, "").await;

        assert_eq!(report.outcome, SlotOutcome::Succeeded);
        assert_eq!(report.attempts, 1);
        let record = report.record.unwrap();
        assert_eq!(record.artifacts["user"], "u1");
        assert_eq!(record.resource_name, "direct");
        assert_eq!(run.rotation_count(), 0);
        assert_eq!(provisioner.created(), 1);
        assert_eq!(provisioner.finalized(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_provision_exhausts_budget() {
        let provisioner = Arc::new(MockProvisioner::failing_create());
        let pipeline = pipeline(provisioner.clone(), Arc::new(MockRotator::default()), vec![]);
        let run = run_state(vec![ResourceSpec::direct()]);
        let lease = run.pool.claim().unwrap();

        let report = pipeline.run_slot(&run, 0, &lease, "").await;

        assert_eq!(report.outcome, SlotOutcome::Exhausted);
        assert_eq!(report.attempts, MAX_ROTATIONS_PER_SLOT + 1);
        assert_eq!(run.rotation_count(), u64::from(MAX_ROTATIONS_PER_SLOT) + 1);
        assert_eq!(provisioner.created(), (MAX_ROTATIONS_PER_SLOT + 1) as usize);
        assert_eq!(provisioner.finalized(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_provisioner_consumes_one_rotation() {
        let provisioner = Arc::new(MockProvisioner::panicking_first_create(1));
        let stage: Arc<dyn Stage> = Arc::new(ScriptedStage::always("register", StageOutcome::Success));
        let pipeline = pipeline(provisioner.clone(), Arc::new(MockRotator::default()), vec![stage]);
        let run = run_state(vec![ResourceSpec::direct()]);
        let lease = run.pool.claim().unwrap();

        let report = pipeline.run_slot(&run, 0, &lease, "").await;

        assert_eq!(report.outcome, SlotOutcome::Succeeded);
        assert_eq!(report.attempts, 2);
        assert_eq!(run.rotation_count(), 1);
        assert_eq!(provisioner.created(), 2);
        let logs = run.snapshot(false).logs;
        assert!(logs
            .iter()
            .any(|e| e.message == "Attempt 1 failed: Attempt panicked: provisioner crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_tears_down_context() {
        let provisioner = Arc::new(MockProvisioner::failing_open());
        let pipeline =
            pipeline(provisioner.clone(), Arc::new(MockRotator::default()), vec![])
                .with_max_rotations(1);
        let run = run_state(vec![ResourceSpec::direct()]);
        let lease = run.pool.claim().unwrap();

        let report = pipeline.run_slot(&run, 0, &lease, "").await;

        assert_eq!(report.outcome, SlotOutcome::Exhausted);
        assert_eq!(report.attempts, 2);
        assert_eq!(provisioner.finalized(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_fail_then_success() {
        let provisioner = Arc::new(MockProvisioner::default());
        let stage: Arc<dyn Stage> = Arc::new(ScriptedStage::sequence(
            "register",
            vec![StageOutcome::SoftFail, StageOutcome::HardFail, StageOutcome::Success],
        ));
        let pipeline = pipeline(provisioner.clone(), Arc::new(MockRotator::default()), vec![stage]);
        let run = run_state(vec![ResourceSpec::direct()]);
        let lease = run.pool.claim().unwrap();

        let report = pipeline.run_slot(&run, 4, &lease, "[W2] ").await;

        assert_eq!(report.outcome, SlotOutcome::Succeeded);
        assert_eq!(report.attempts, 3);
        assert_eq!(run.rotation_count(), 2);
        assert_eq!(provisioner.finalized(), 3);
        let logs = run.snapshot(true).logs;
        assert!(logs.iter().any(|e| e.message.starts_with("[W2] Attempt 1 failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_stage_is_hard_fail() {
        let provisioner = Arc::new(MockProvisioner::default());
        let stage: Arc<dyn Stage> = Arc::new(ScriptedStage::panicking("explode"));
        let pipeline = pipeline(provisioner.clone(), Arc::new(MockRotator::default()), vec![stage])
            .with_max_rotations(0);
        let run = run_state(vec![ResourceSpec::direct()]);
        let lease = run.pool.claim().unwrap();

        let report = pipeline.run_slot(&run, 0, &lease, "").await;

        assert_eq!(report.outcome, SlotOutcome::Exhausted);
        assert_eq!(provisioner.finalized(), 1);
        let logs = run.snapshot(true).logs;
        assert!(logs
            .iter()
            .any(|e| e.message.contains("hard_fail: stage panicked")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_failures_retry_without_consuming_budget() {
        let provisioner = Arc::new(MockProvisioner::default());
        let rotator = Arc::new(MockRotator::failing_first(3));
        let pipeline = pipeline(provisioner.clone(), rotator.clone(), vec![]);
        let run = run_state(vec![ResourceSpec::direct().with_rotation_url("http://rotate.test")]);
        let lease = run.pool.claim().unwrap();

        let started = Instant::now();
        let report = pipeline.run_slot(&run, 0, &lease, "").await;

        assert_eq!(report.outcome, SlotOutcome::Succeeded);
        assert_eq!(report.attempts, 1);
        assert_eq!(rotator.calls(), 4);
        assert_eq!(run.rotation_count(), 0);
        let timings = EngineTimings::default();
        assert!(started.elapsed() >= timings.rotation_retry() * 3 + timings.rotation_settle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_rotation_retry() {
        let provisioner = Arc::new(MockProvisioner::default());
        let rotator = Arc::new(MockRotator::failing_first(u32::MAX));
        let pipeline = Arc::new(pipeline(provisioner.clone(), rotator, vec![]));
        let run = Arc::new(run_state(vec![ResourceSpec::direct()]));

        let task = {
            let run = Arc::clone(&run);
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                let lease = run.pool.claim().unwrap();
                pipeline.run_slot(&run, 0, &lease, "").await
            })
        };

        tokio::time::sleep(std::time::Duration::from_secs(65)).await;
        run.request_cancel();
        let report = task.await.unwrap();

        assert_eq!(report.outcome, SlotOutcome::Cancelled);
        assert_eq!(run.rotation_count(), 0);
        assert_eq!(provisioner.created(), 0);
        assert_eq!(run.pool.locked_count(), 0);
    }
}
