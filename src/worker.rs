use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::AvailabilityCache;
use crate::config::SchedulerConfig;
use crate::error::{SchedulingError, ValidationError};
use crate::limits::LOOKAHEAD_GRANULARITY;
use crate::model::{Ms, Span};
use crate::notify::Notifier;
use crate::observability::{CYCLE_DURATION_SECONDS, CYCLES_TOTAL, LOCK_WAIT_SECONDS};
use crate::recurrence::Period;
use crate::scheduler::{self, PreprocessReport, ScheduleReport};
use crate::storage::Storage;

/// The one lock shared by the scheduling coordinator and the execution
/// subsystem. Held for a whole cycle.
#[derive(Clone, Default)]
pub struct ExecutionLock(Arc<Mutex<()>>);

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }

    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }
}

/// Rolling window the coordinator looks at, recomputed every cycle.
pub struct LookaheadWindow;

impl LookaheadWindow {
    /// `[now floored to the hour, that + lookahead]`.
    pub fn compute(now: Ms, lookahead: &Period) -> Result<Span, ValidationError> {
        let from = now.div_euclid(LOOKAHEAD_GRANULARITY) * LOOKAHEAD_GRANULARITY;
        let to = lookahead.add_to(from)?;
        Span::try_new(from, to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub window: Span,
    pub preprocess: PreprocessReport,
    pub schedule: ScheduleReport,
    pub flushed: usize,
}

pub struct Coordinator {
    storage: Arc<dyn Storage>,
    cache: Arc<AvailabilityCache>,
    notifier: Arc<dyn Notifier>,
    lock: ExecutionLock,
    config: SchedulerConfig,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<AvailabilityCache>,
        notifier: Arc<dyn Notifier>,
        lock: ExecutionLock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            notifier,
            lock,
            config,
        }
    }

    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One cycle: lock, window, pre-process, schedule, flush, unlock.
    /// The lock is released on every exit path.
    pub async fn run_cycle(&self, now: Ms) -> Result<CycleReport, SchedulingError> {
        let wait = Instant::now();
        let _guard = self.lock.acquire().await;
        metrics::histogram!(LOCK_WAIT_SECONDS).record(wait.elapsed().as_secs_f64());

        let window = LookaheadWindow::compute(now, &self.config.lookahead)?;
        debug!(from = window.start, to = window.end, "cycle started");

        let preprocess =
            scheduler::preprocess(self.storage.as_ref(), self.notifier.as_ref(), &self.config, window).await?;
        let schedule = scheduler::schedule(
            self.storage.as_ref(),
            &self.cache,
            self.notifier.as_ref(),
            &self.config.domain,
            window,
            now,
        )
        .await?;
        let flushed = self.notifier.flush().await;

        Ok(CycleReport {
            window,
            preprocess,
            schedule,
            flushed,
        })
    }

    /// `run_cycle` with panics turned into `SchedulingError::Panicked`.
    pub async fn run_cycle_isolated(&self, now: Ms) -> Result<CycleReport, SchedulingError> {
        match AssertUnwindSafe(self.run_cycle(now)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(SchedulingError::Panicked(message))
            }
        }
    }

    /// Run cycles every `worker_period` until `cancel` fires. Cancellation
    /// interrupts the wait between cycles, never a running cycle. Pending
    /// notifications get a final flush before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.worker_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.config.worker_period, lookahead = %self.config.lookahead, "scheduling worker started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let started = Instant::now();
            match self.run_cycle_isolated(now_ms()).await {
                Ok(report) => {
                    metrics::counter!(CYCLES_TOTAL, "status" => "ok").increment(1);
                    let changed = report.preprocess.changed() + report.schedule.allocated + report.schedule.failed;
                    if changed > 0 {
                        info!(
                            allocated = report.schedule.allocated,
                            failed = report.schedule.failed,
                            materialized = report.preprocess.changed(),
                            flushed = report.flushed,
                            "cycle finished"
                        );
                    } else {
                        debug!("cycle finished, nothing to do");
                    }
                }
                Err(e) => {
                    metrics::counter!(CYCLES_TOTAL, "status" => "failed").increment(1);
                    error!(error = %e, "scheduling cycle aborted");
                }
            }
            metrics::histogram!(CYCLE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        }

        let flushed = self.notifier.flush().await;
        info!(flushed, "scheduling worker stopped");
    }
}

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}
