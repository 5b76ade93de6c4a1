//! Session controller: the single entry point for the control channel.
//!
//! At most one session runs at a time. Each start builds a fresh
//! [`RunState`], launches a supervisor task that staggers the workers and
//! awaits them, and returns immediately. A monitor task clears the running
//! flag once the supervisor is gone, whether it finished, failed or panicked.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use events::{Event, EventBus, EventEnvelope};
use provision_core::{
    CommandAck, CoreError, LogEntry, LogLevel, ProgressSnapshot, ResourceSpec, SessionParams,
};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::config::{ConfigSource, RunConfig};
use crate::core::{AttemptPipeline, RunState, SharedSettings, Worker};
use crate::error::{OrchestratorError, Result};
use crate::log_buffer::{LogBuffer, LOG_EXPOSED};
use crate::resources::ResourcePool;
use crate::services::Collaborators;

/// Workers actually launched: never more than the requested concurrency,
/// the number of units, or the number of resources.
pub fn effective_workers(concurrency: u32, target_count: usize, pool_len: usize) -> usize {
    (concurrency as usize).min(target_count).min(pool_len)
}

pub struct SessionController {
    collaborators: Collaborators,
    config_source: Arc<dyn ConfigSource>,
    events: EventBus,
    settings: Arc<SharedSettings>,
    running: Arc<watch::Sender<bool>>,
    current: RwLock<Option<Arc<RunState>>>,
    /// Entries logged before the first session exists.
    idle_log: Mutex<LogBuffer>,
}

impl SessionController {
    pub fn new(collaborators: Collaborators, config_source: Arc<dyn ConfigSource>) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            collaborators,
            config_source,
            events: EventBus::new(),
            settings: Arc::new(SharedSettings::default()),
            running: Arc::new(running),
            current: RwLock::new(None),
            idle_log: Mutex::new(LogBuffer::default()),
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn current_run(&self) -> Option<Arc<RunState>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Log against the current run if there is one, otherwise into the
    /// controller's own buffer.
    fn note(&self, level: LogLevel, message: String) {
        if let Some(run) = self.current_run() {
            run.log(level, message);
            return;
        }

        match level {
            LogLevel::Warning | LogLevel::Error => warn!("{}", message),
            _ => info!("{}", message),
        }
        self.idle_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry::new(level, message));
    }

    /// Start a session producing `target_count` units.
    ///
    /// Configuration is read once here; a failure to load it rejects the
    /// start. Workers are launched in the background.
    pub async fn start(&self, target_count: usize, params: SessionParams) -> Result<CommandAck> {
        if target_count == 0 {
            self.note(LogLevel::Warning, "Start rejected: target count must be at least 1".to_string());
            return Err(CoreError::InvalidTarget(target_count).into());
        }
        if self.is_running() {
            self.note(LogLevel::Warning, "Start rejected: a session is already running".to_string());
            return Err(OrchestratorError::AlreadyRunning);
        }

        let (config, resources) = match self.load_config().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.note(LogLevel::Error, format!("Start rejected: {}", e));
                return Err(e);
            }
        };

        let concurrency = self.settings.concurrency();
        let run = Arc::new(RunState::new(
            target_count,
            ResourcePool::new(resources),
            Arc::clone(&self.settings),
            Some(self.events.clone()),
        ));

        let installed = self.running.send_if_modified(|running| {
            if *running {
                return false;
            }
            *running = true;
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&run));
            true
        });
        if !installed {
            self.note(LogLevel::Warning, "Start rejected: a session is already running".to_string());
            return Err(OrchestratorError::AlreadyRunning);
        }

        run.log(
            LogLevel::Info,
            format!(
                "Starting session: target {}, concurrency {}",
                target_count, concurrency
            ),
        );
        run.emit_progress(true);

        let pipeline = Arc::new(AttemptPipeline::new(
            self.collaborators.clone(),
            config.default_params.merged(&params),
            config.timings,
        ));

        let supervisor = tokio::spawn(supervise(Arc::clone(&run), pipeline, concurrency));
        tokio::spawn(finish_session(
            Arc::clone(&run),
            Arc::clone(&self.running),
            supervisor,
        ));

        Ok(CommandAck::accepted(format!(
            "Session {} started for {} unit(s)",
            run.session_id, target_count
        )))
    }

    async fn load_config(&self) -> Result<(RunConfig, Vec<ResourceSpec>)> {
        let config = self.config_source.load().await?;
        let resources = config.resource_pool()?;
        Ok((config, resources))
    }

    /// Request cancellation. Returns immediately; in-flight collaborator
    /// calls are never interrupted.
    pub fn stop(&self) -> Result<CommandAck> {
        let run = {
            let running = self.running.borrow();
            if *running {
                self.current_run()
            } else {
                None
            }
        };

        let Some(run) = run else {
            self.note(LogLevel::Warning, "Stop rejected: no session is running".to_string());
            return Err(OrchestratorError::NotRunning);
        };

        if run.request_cancel() {
            run.log(
                LogLevel::Warning,
                "Stop requested, finishing in-flight attempts",
            );
            run.emit(Event::StopRequested {
                session_id: run.session_id,
            });
            run.emit_progress(true);
        }

        Ok(CommandAck::accepted("Stop requested"))
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let running = self.is_running();
        match self.current_run() {
            Some(run) => run.snapshot(running),
            None => ProgressSnapshot {
                concurrency: self.settings.concurrency(),
                visible: self.settings.visible(),
                logs: self
                    .idle_log
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recent(LOG_EXPOSED),
                ..Default::default()
            },
        }
    }

    /// Clamp and store the worker count for the next start.
    pub fn set_concurrency(&self, requested: i64) -> u32 {
        let value = self.settings.set_concurrency(requested);
        self.note(
            LogLevel::Info,
            format!("Concurrency set to {} (applies to the next session)", value),
        );
        self.settings_changed();
        value
    }

    /// Applies from the next provisioning call on.
    pub fn set_visible(&self, visible: bool) {
        self.settings.set_visible(visible);
        self.note(
            LogLevel::Info,
            format!(
                "Execution contexts will be {}",
                if visible { "visible" } else { "hidden" }
            ),
        );
        self.settings_changed();
    }

    fn settings_changed(&self) {
        self.events.emit(Event::SettingsChanged {
            concurrency: self.settings.concurrency(),
            visible: self.settings.visible(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Resolve once no session is running.
    pub async fn wait(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|running| !*running).await;
    }
}

/// Wait for the supervisor, then clear the running flag. A supervisor error
/// or panic is logged and reported as the session's fatal reason.
async fn finish_session(
    run: Arc<RunState>,
    running: Arc<watch::Sender<bool>>,
    supervisor: JoinHandle<Result<()>>,
) {
    let fatal = match supervisor.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(format!("supervisor task failed: {}", e)),
    };
    if let Some(reason) = &fatal {
        run.log(LogLevel::Error, format!("Session aborted: {}", reason));
    }

    run.mark_finished();
    running.send_replace(false);

    run.emit(Event::SessionFinished {
        session_id: run.session_id,
        success_count: run.success_count(),
        failed_count: run.failed_count(),
        rotation_count: run.rotation_count(),
        fatal,
    });
    run.emit_progress(false);
}

async fn supervise(
    run: Arc<RunState>,
    pipeline: Arc<AttemptPipeline>,
    concurrency: u32,
) -> Result<()> {
    debug_assert!(!run.pool.is_empty(), "resource pool resolves to at least one entry");

    let workers = effective_workers(concurrency, run.target_count, run.pool.len());
    if run.pool.len() < concurrency as usize {
        run.log(
            LogLevel::Warning,
            format!(
                "Only {} resource(s) for concurrency {}, running {} worker(s)",
                run.pool.len(),
                concurrency,
                workers
            ),
        );
    }

    run.emit(Event::SessionStarted {
        session_id: run.session_id,
        target_count: run.target_count,
        workers,
    });

    let stagger = pipeline.timings().worker_stagger();
    let mut set = JoinSet::new();

    for id in 1..=workers {
        if id > 1 && !run.sleep_unless_cancelled(stagger).await {
            run.log(LogLevel::Warning, "Stop requested, no further workers launched");
            break;
        }
        set.spawn(Worker::new(id, workers > 1, Arc::clone(&run), Arc::clone(&pipeline)).run());
        if workers > 1 {
            run.log(LogLevel::Info, format!("Worker {} launched", id));
        }
    }

    let mut failed_workers = 0usize;
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            failed_workers += 1;
            run.log(LogLevel::Error, format!("Worker task failed: {}", e));
        }
    }

    // A dead worker abandons the slots it would have claimed.
    if failed_workers > 0 && !run.is_cancelled() && run.remaining() > 0 {
        return Err(OrchestratorError::SessionFatal(format!(
            "{} worker task(s) failed with {} unit(s) unaccounted",
            failed_workers,
            run.remaining()
        )));
    }

    run.log(
        LogLevel::Success,
        format!(
            "JOB COMPLETE - Succeeded: {}/{}, Rotations: {}, Failed: {}",
            run.success_count(),
            run.target_count,
            run.rotation_count(),
            run.failed_count()
        ),
    );

    Ok(())
}
