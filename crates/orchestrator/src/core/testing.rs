//! In-memory collaborators for engine tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use provision_core::{ResourceSpec, StageOutcome};

use crate::error::{ProvisionError, RotationError};
use crate::services::{
    ContextId, ExecutionHandle, ProvisionOptions, ProvisioningClient, RotationOutcome,
    RotationService, Stage, StageContext, StageReport,
};

#[derive(Default)]
pub struct MockProvisioner {
    fail_create: bool,
    panics_left: AtomicU32,
    fail_open: bool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    visible: Mutex<Vec<bool>>,
}

impl MockProvisioner {
    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Default::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Default::default()
        }
    }

    /// Panics on the first `panics` calls to `create`.
    pub fn panicking_first_create(panics: u32) -> Self {
        Self {
            panics_left: AtomicU32::new(panics),
            ..Default::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Contexts that were closed and destroyed.
    pub fn finalized(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn visibility_requests(&self) -> Vec<bool> {
        self.visible.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProvisioningClient for MockProvisioner {
    async fn create(
        &self,
        _resource: &ResourceSpec,
        options: &ProvisionOptions,
    ) -> Result<ContextId, ProvisionError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.visible.lock().unwrap().push(options.visible);
        if self
            .panics_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("provisioner crashed");
        }
        if self.fail_create {
            return Err(ProvisionError::Create("backend offline".to_string()));
        }
        Ok(ContextId::new(format!("ctx-{}", n)))
    }

    async fn open(&self, context: &ContextId) -> Result<ExecutionHandle, ProvisionError> {
        if self.fail_open {
            return Err(ProvisionError::Open {
                context: context.to_string(),
                reason: "window crashed".to_string(),
            });
        }
        Ok(ExecutionHandle::new(context.clone()))
    }

    async fn close(&self, _context: &ContextId) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn destroy(&self, _context: &ContextId) -> Result<(), ProvisionError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Skips rotation by default; can fail a fixed number of calls first.
#[derive(Default)]
pub struct MockRotator {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl MockRotator {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RotationService for MockRotator {
    async fn rotate(&self, resource: &ResourceSpec) -> Result<RotationOutcome, RotationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RotationError::Rejected("cooldown active".to_string()));
        }
        if resource.can_rotate() {
            Ok(RotationOutcome::Rotated)
        } else {
            Ok(RotationOutcome::Skipped)
        }
    }
}

enum Script {
    Sequence(Mutex<VecDeque<StageOutcome>>, StageOutcome),
    Panic,
}

/// Stage returning scripted outcomes, optionally holding the resource for a
/// while and checking that no two attempts share a resource.
pub struct ScriptedStage {
    name: String,
    script: Script,
    delay: Duration,
    artifact: Option<(String, String)>,
    required_artifact: Option<String>,
    in_use: Mutex<BTreeSet<usize>>,
    overlaps: AtomicUsize,
    runs: AtomicUsize,
}

impl ScriptedStage {
    fn with_script(name: &str, script: Script) -> Self {
        Self {
            name: name.to_string(),
            script,
            delay: Duration::ZERO,
            artifact: None,
            required_artifact: None,
            in_use: Mutex::new(BTreeSet::new()),
            overlaps: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn always(name: &str, outcome: StageOutcome) -> Self {
        Self::with_script(name, Script::Sequence(Mutex::new(VecDeque::new()), outcome))
    }

    /// Outcomes in order; the last one repeats.
    pub fn sequence(name: &str, outcomes: Vec<StageOutcome>) -> Self {
        let last = outcomes.last().copied().unwrap_or(StageOutcome::Success);
        Self::with_script(name, Script::Sequence(Mutex::new(outcomes.into()), last))
    }

    pub fn panicking(name: &str) -> Self {
        Self::with_script(name, Script::Panic)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_artifact(mut self, key: &str, value: &str) -> Self {
        self.artifact = Some((key.to_string(), value.to_string()));
        self
    }

    pub fn expecting_artifact(mut self, key: &str) -> Self {
        self.required_artifact = Some(key.to_string());
        self
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _handle: &ExecutionHandle, ctx: &StageContext) -> StageReport {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let outcome = match &self.script {
            Script::Panic => panic!("stage {} exploded", self.name),
            Script::Sequence(queue, last) => queue.lock().unwrap().pop_front().unwrap_or(*last),
        };

        if let Some(key) = &self.required_artifact {
            if !ctx.artifacts.contains_key(key) {
                return StageReport::hard_fail(format!("missing artifact {}", key));
            }
        }

        if !self.in_use.lock().unwrap().insert(ctx.resource_index) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_use.lock().unwrap().remove(&ctx.resource_index);

        let mut report = match outcome {
            StageOutcome::Success => StageReport::success(),
            StageOutcome::SoftFail => StageReport::soft_fail("scripted soft failure"),
            StageOutcome::HardFail => StageReport::hard_fail("scripted hard failure"),
        };
        if let Some((key, value)) = &self.artifact {
            report = report.with_artifact(key.clone(), value.clone());
        }
        report
    }
}
