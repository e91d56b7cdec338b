//! Tick scheduler
//!
//! A tick lists everything due, then claims and applies each item on its own.
//! It holds no lock of its own: two overlapping ticks race per item on the
//! claim, and the loser simply skips it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::jobs::{JobKind, ProcessOutcome, QueueManager};
use crate::rally::RallyPointEngine;
use crate::util::time::{Clock, Timer};

/// Default number of items applied in parallel within one sweep
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Most items listed per kind in one sweep; the rest wait for the next tick
const SWEEP_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct TickSettings {
    pub concurrency: usize,
    /// Age after which a PROCESSING claim is taken over; zero disables recovery
    pub claim_timeout: Duration,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            claim_timeout: Duration::seconds(300),
        }
    }
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub applied: usize,
    /// Claimed by someone else first
    pub lost: usize,
    pub deferred: usize,
    pub failed: usize,
    pub recovered: usize,
    pub duration_ms: u64,
}

impl TickReport {
    fn record(&mut self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Applied => self.applied += 1,
            ProcessOutcome::Lost => self.lost += 1,
            ProcessOutcome::Deferred => self.deferred += 1,
            ProcessOutcome::Failed => self.failed += 1,
        }
    }
}

pub struct TickScheduler {
    store: Arc<dyn crate::store::WorldStore>,
    rally: Arc<RallyPointEngine>,
    queues: Arc<QueueManager>,
    clock: Arc<dyn Clock>,
    settings: TickSettings,
    last_report: Mutex<Option<TickReport>>,
}

impl TickScheduler {
    pub fn new(
        store: Arc<dyn crate::store::WorldStore>,
        rally: Arc<RallyPointEngine>,
        queues: Arc<QueueManager>,
        clock: Arc<dyn Clock>,
        settings: TickSettings,
    ) -> Self {
        Self {
            store,
            rally,
            queues,
            clock,
            settings,
            last_report: Mutex::new(None),
        }
    }

    pub fn last_report(&self) -> Option<TickReport> {
        self.last_report.lock().clone()
    }

    /// Apply everything whose due time has passed.
    ///
    /// A store failure aborts the sweep: items not yet started are left for
    /// the next tick, items already applied stay applied.
    pub async fn tick(&self) -> EngineResult<TickReport> {
        let timer = Timer::new();
        let mut report = TickReport::default();

        if self.settings.claim_timeout > Duration::zero() {
            report.recovered = self.recover_stale().await?;
        }

        let now = self.clock.now();
        let mut due: Vec<(JobKind, Uuid)> = self
            .store
            .due_movements(now, SWEEP_LIMIT)
            .await?
            .into_iter()
            .map(|id| (JobKind::Movement, id))
            .collect();
        due.extend(self.store.due_jobs(now, SWEEP_LIMIT).await?);
        report.due = due.len();

        if due.is_empty() {
            report.duration_ms = timer.elapsed_ms();
            debug!("Tick found nothing due");
            *self.last_report.lock() = Some(report.clone());
            return Ok(report);
        }

        let aborted = AtomicBool::new(false);
        let aborted = &aborted;
        let mut results = stream::iter(due)
            .map(|(kind, id)| async move {
                if aborted.load(Ordering::Acquire) {
                    return None;
                }
                let result = self.dispatch(kind, id).await;
                if let Err(e) = &result {
                    error!(kind = kind.as_str(), id = %id, error = %e, "Sweep aborted");
                    aborted.store(true, Ordering::Release);
                }
                Some(result)
            })
            .buffer_unordered(self.settings.concurrency.max(1));

        let mut first_error: Option<EngineError> = None;
        while let Some(result) = results.next().await {
            match result {
                Some(Ok(outcome)) => report.record(outcome),
                Some(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                None => {}
            }
        }
        drop(results);

        report.duration_ms = timer.elapsed_ms();
        if let Some(e) = first_error {
            warn!(applied = report.applied, "Tick aborted after store failure");
            return Err(e);
        }

        info!(
            due = report.due,
            applied = report.applied,
            lost = report.lost,
            deferred = report.deferred,
            failed = report.failed,
            recovered = report.recovered,
            duration_ms = report.duration_ms,
            "Tick complete"
        );
        *self.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    /// Route one due item to the handler for its kind
    async fn dispatch(&self, kind: JobKind, id: Uuid) -> EngineResult<ProcessOutcome> {
        match kind {
            JobKind::Movement => self.rally.process_due(id).await,
            JobKind::Training | JobKind::Building | JobKind::Quest => {
                self.queues.process_due(id).await
            }
        }
    }

    /// Finish work left in PROCESSING by a run that died after claiming
    pub async fn recover_stale(&self) -> EngineResult<usize> {
        let before = self.clock.now() - self.settings.claim_timeout;
        let movements = self.rally.recover_stale(before).await?;
        let jobs = self.queues.recover_stale(before).await?;
        let total = movements.resumed + movements.settled + jobs;
        if total > 0 {
            warn!(
                movements_resumed = movements.resumed,
                movements_settled = movements.settled,
                jobs_resumed = jobs,
                "Recovered stale work"
            );
        }
        Ok(total)
    }
}
