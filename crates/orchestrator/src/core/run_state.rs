//! State owned by one session run.
//!
//! A fresh [`RunState`] is built on every start, so counters, logs and
//! completed records never leak between sessions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use events::{Event, EventBus};
use provision_core::{
    clamp_concurrency, CompletedUnitRecord, LogEntry, LogLevel, ProgressSnapshot,
};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::log_buffer::{LogBuffer, LOG_EXPOSED};
use crate::resources::ResourcePool;
use crate::slots::SlotTracker;

/// Settings that outlive a single run and may change while one is active.
#[derive(Debug)]
pub struct SharedSettings {
    concurrency: AtomicU32,
    visible: AtomicBool,
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self {
            concurrency: AtomicU32::new(1),
            visible: AtomicBool::new(true),
        }
    }
}

impl SharedSettings {
    pub fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::SeqCst)
    }

    /// Store the clamped value and return it.
    pub fn set_concurrency(&self, requested: i64) -> u32 {
        let value = clamp_concurrency(requested);
        self.concurrency.store(value, Ordering::SeqCst);
        value
    }

    pub fn visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

pub struct RunState {
    pub session_id: Uuid,
    pub target_count: usize,
    pub started_at: DateTime<Utc>,
    pub slots: SlotTracker,
    pub pool: Arc<ResourcePool>,
    settings: Arc<SharedSettings>,
    events: Option<EventBus>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    success_count: AtomicUsize,
    failed_count: AtomicUsize,
    rotation_count: AtomicU64,
    active_workers: AtomicUsize,
    logs: Mutex<LogBuffer>,
    completed: Mutex<Vec<CompletedUnitRecord>>,
}

impl RunState {
    pub fn new(
        target_count: usize,
        pool: Arc<ResourcePool>,
        settings: Arc<SharedSettings>,
        events: Option<EventBus>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            target_count,
            started_at: Utc::now(),
            slots: SlotTracker::new(target_count),
            pool,
            settings,
            events,
            finished_at: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            success_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
            rotation_count: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            logs: Mutex::new(LogBuffer::default()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Append a progress log entry, mirror it to tracing and publish it.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);

        match level {
            LogLevel::Error => error!(session_id = %self.session_id, "{}", entry.message),
            LogLevel::Warning => warn!(session_id = %self.session_id, "{}", entry.message),
            _ => info!(session_id = %self.session_id, level = level.as_str(), "{}", entry.message),
        }

        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());

        self.emit(Event::LogAppended {
            session_id: self.session_id,
            entry,
        });
    }

    pub fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    pub fn emit_progress(&self, running: bool) {
        if self.events.is_some() {
            self.emit(Event::ProgressUpdated {
                snapshot: Box::new(self.snapshot(running)),
            });
        }
    }

    /// Raise the cancel flag and wake every pending backoff sleep.
    /// Returns `false` if cancellation had already been requested.
    pub fn request_cancel(&self) -> bool {
        let first = !self.cancel_requested.swap(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancellation is requested first.
    /// Returns `true` if the full duration elapsed without cancellation.
    pub async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        let notified = self.cancel_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = &mut notified => false,
        }
    }

    pub fn visible(&self) -> bool {
        self.settings.visible()
    }

    pub fn record_success(&self, record: CompletedUnitRecord) -> usize {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        self.success_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_failure(&self) -> usize {
        self.failed_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_rotation(&self) -> u64 {
        self.rotation_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn success_count(&self) -> usize {
        self.success_count.load(Ordering::SeqCst)
    }

    pub fn failed_count(&self) -> usize {
        self.failed_count.load(Ordering::SeqCst)
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotation_count.load(Ordering::SeqCst)
    }

    /// Units neither succeeded nor failed yet.
    pub fn remaining(&self) -> usize {
        self.target_count
            .saturating_sub(self.success_count() + self.failed_count())
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_finished(&self) {
        *self
            .finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    pub fn log_len(&self) -> usize {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn snapshot(&self, running: bool) -> ProgressSnapshot {
        let success_count = self.success_count();
        let failed_count = self.failed_count();

        ProgressSnapshot {
            session_id: Some(self.session_id),
            running,
            cancel_requested: self.is_cancelled(),
            target_count: self.target_count,
            success_count,
            failed_count,
            attempt_count: success_count + failed_count,
            rotation_count: self.rotation_count(),
            concurrency: self.settings.concurrency(),
            active_workers: self.active_workers.load(Ordering::SeqCst),
            visible: self.settings.visible(),
            started_at: Some(self.started_at),
            finished_at: *self
                .finished_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            logs: self
                .logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recent(LOG_EXPOSED),
            completed: self
                .completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
