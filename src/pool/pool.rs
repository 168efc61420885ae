// ABOUTME: WorkerPool - bounded set of slots, each bound to one automation instance.
// ABOUTME: Dispatch waits for a free slot, runs one search, and records the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::slot::{AutomationGuard, SlotSnapshot, SlotStatus, WorkerSlot};
use crate::automation::{AutomationFactory, AutomationSession, RawPost, SearchOptions};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::hook::{HookEvent, HookRegistry, fire_opt};

/// Aggregate pool counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub errored: usize,
    /// Totals over the slots currently in the pool.
    pub completed: u64,
    pub failed: u64,
    /// Exponentially weighted task duration.
    pub avg_duration_ms: f64,
    pub slots: Vec<SlotSnapshot>,
}

#[derive(Debug, Default)]
struct Timing {
    avg_ms: f64,
    samples: u64,
}

/// Bounded worker pool.
///
/// Slots are claimed under a short sync lock and released through a lease,
/// so a dispatch future dropped mid-task still frees its slot (as Errored).
pub struct WorkerPool {
    config: PoolConfig,
    factory: AutomationFactory,
    slots: Mutex<Vec<Arc<WorkerSlot>>>,
    next_id: AtomicUsize,
    available: Notify,
    shut_down: AtomicBool,
    timing: Mutex<Timing>,
    /// Serializes initialize, scale and shutdown.
    resize: tokio::sync::Mutex<()>,
    hooks: Option<Arc<HookRegistry>>,
}

impl WorkerPool {
    /// Create an empty pool. Call `initialize` before dispatching.
    pub fn new(config: PoolConfig, factory: AutomationFactory) -> Self {
        Self {
            config,
            factory,
            slots: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            available: Notify::new(),
            shut_down: AtomicBool::new(false),
            timing: Mutex::new(Timing::default()),
            resize: tokio::sync::Mutex::new(()),
            hooks: None,
        }
    }

    /// Fire slot events into this registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create `size` idle slots.
    ///
    /// Any slot failing to initialize fails the whole call; instances that did
    /// start are shut down again. Calling this on a pool that already has
    /// slots does nothing.
    pub async fn initialize(&self, size: usize) -> Result<(), PoolError> {
        let _resize = self.resize.lock().await;
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        if !self.slots.lock().is_empty() {
            warn!("pool already initialized");
            return Ok(());
        }

        let created = self.create_slots(size).await?;
        self.slots.lock().extend(created);
        self.available.notify_waiters();

        info!(size, "worker pool initialized");
        Ok(())
    }

    /// Run one search on a free slot.
    ///
    /// Waits up to `acquire_timeout` for an Idle slot (or an Errored one to
    /// reclaim), then bounds the search by `task_timeout`. `cancel` aborts
    /// either wait.
    pub async fn dispatch<F>(
        &self,
        session: &AutomationSession,
        keywords: &[String],
        options: &SearchOptions,
        cancel: F,
    ) -> Result<Vec<RawPost>, PoolError>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancel);

        let (slot, previous, automation) =
            self.wait_for_slot(&session.session_id, &mut cancel).await?;
        let mut lease = SlotLease {
            pool: self,
            slot: slot.clone(),
            automation: Some(automation),
            finished: false,
        };
        let started = Instant::now();

        let result = match lease.automation.as_deref_mut() {
            Some(automation) => {
                let run = async {
                    if previous == SlotStatus::Errored {
                        debug!(slot = slot.id(), "reclaiming errored slot");
                        if let Err(e) = automation.initialize().await {
                            return Err(e);
                        }
                    }
                    automation.search(session, keywords, options).await
                };

                tokio::select! {
                    biased;
                    () = &mut cancel => Err(PoolError::Cancelled),
                    outcome = tokio::time::timeout(self.config.task_timeout, run) => match outcome {
                        Ok(Ok(posts)) => Ok(posts),
                        Ok(Err(e)) => Err(PoolError::Automation(e)),
                        Err(_) => Err(PoolError::TaskTimeout(self.config.task_timeout)),
                    },
                }
            }
            None => Err(PoolError::ShutDown),
        };

        let elapsed = started.elapsed();
        lease.finish(result.as_ref().err().map(|e| e.to_string()), elapsed);

        match &result {
            Ok(posts) => {
                debug!(
                    slot = slot.id(),
                    session_id = %session.session_id,
                    posts = posts.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "dispatch completed"
                );
            }
            Err(e) => {
                warn!(slot = slot.id(), session_id = %session.session_id, error = %e, "dispatch failed");
                fire_opt(
                    &self.hooks,
                    HookEvent::SlotErrored {
                        slot_id: slot.id(),
                        error: e.to_string(),
                    },
                )
                .await;
            }
        }

        result
    }

    /// `dispatch` with bounded retries for transient automation errors.
    ///
    /// Backoff doubles from `retry_backoff`. Session and blocking errors are
    /// returned at once; retrying them on the same session cannot help.
    pub async fn dispatch_with_retry<F>(
        &self,
        session: &AutomationSession,
        keywords: &[String],
        options: &SearchOptions,
        cancel: F,
    ) -> Result<Vec<RawPost>, PoolError>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.dispatch(session, keywords, options, &mut cancel).await {
                Ok(posts) => return Ok(posts),
                Err(PoolError::Automation(e)) if e.is_transient() && attempt + 1 < attempts => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying dispatch");
                    tokio::select! {
                        biased;
                        () = &mut cancel => return Err(PoolError::Cancelled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Grow or shrink the pool to `new_size` slots.
    ///
    /// Growing initializes new instances (all or nothing). Shrinking removes
    /// the most recently added slots at once, then waits up to
    /// `drain_timeout` for each to finish its task before shutting it down.
    pub async fn scale_pool(&self, new_size: usize) -> Result<(), PoolError> {
        let _resize = self.resize.lock().await;
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let current = self.slots.lock().len();
        if new_size > current {
            let created = self.create_slots(new_size - current).await?;
            self.slots.lock().extend(created);
            self.available.notify_waiters();
            info!(from = current, to = new_size, "worker pool scaled up");
        } else if new_size < current {
            let removed = self.slots.lock().split_off(new_size);
            info!(from = current, to = new_size, "worker pool scaling down");
            self.drain(removed).await;
        }
        Ok(())
    }

    /// Shut down every slot. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _resize = self.resize.lock().await;
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let removed: Vec<_> = self.slots.lock().drain(..).collect();
        // waiters see the flag and give up
        self.available.notify_waiters();
        let count = removed.len();
        self.drain(removed).await;
        info!(slots = count, "worker pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        let slots: Vec<SlotSnapshot> = self.slots.lock().iter().map(|s| s.snapshot()).collect();
        let mut stats = PoolStats {
            size: slots.len(),
            avg_duration_ms: self.timing.lock().avg_ms,
            ..Default::default()
        };
        for slot in &slots {
            match slot.status {
                SlotStatus::Idle => stats.idle += 1,
                SlotStatus::Busy => stats.busy += 1,
                SlotStatus::Errored => stats.errored += 1,
            }
            stats.completed += slot.completed;
            stats.failed += slot.failed;
        }
        stats.slots = slots;
        stats
    }

    async fn wait_for_slot<F>(
        &self,
        session_id: &str,
        cancel: &mut std::pin::Pin<&mut F>,
    ) -> Result<(Arc<WorkerSlot>, SlotStatus, AutomationGuard), PoolError>
    where
        F: std::future::Future<Output = ()>,
    {
        let started = tokio::time::Instant::now();
        let deadline = started + self.config.acquire_timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shut_down() {
                return Err(PoolError::ShutDown);
            }
            if let Some(claimed) = self.claim(session_id) {
                return Ok(claimed);
            }

            tokio::select! {
                biased;
                () = cancel.as_mut() => return Err(PoolError::Cancelled),
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::NoWorkerAvailable { waited: started.elapsed() });
                }
            }
        }
    }

    /// Claim an Idle slot, or failing that an Errored one.
    ///
    /// The instance is locked here, under the slots lock, so a scale-down
    /// that removes the slot afterwards has to wait for this task.
    pub(super) fn claim(
        &self,
        session_id: &str,
    ) -> Option<(Arc<WorkerSlot>, SlotStatus, AutomationGuard)> {
        let slots = self.slots.lock();
        let idle = slots.iter().filter(|s| s.status() == SlotStatus::Idle);
        let errored = slots.iter().filter(|s| s.status() == SlotStatus::Errored);

        for slot in idle.chain(errored) {
            if let Some((previous, automation)) = slot.try_claim(session_id) {
                debug!(slot = slot.id(), session_id, "slot claimed");
                return Some((slot.clone(), previous, automation));
            }
        }
        None
    }

    async fn create_slots(&self, count: usize) -> Result<Vec<Arc<WorkerSlot>>, PoolError> {
        let starts = (0..count).map(|_| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let mut automation = (self.factory)();
            async move {
                let result = automation.initialize().await;
                (id, automation, result)
            }
        });

        let mut ready = Vec::with_capacity(count);
        let mut failure = None;
        for (id, automation, result) in join_all(starts).await {
            match result {
                Ok(()) => ready.push((id, automation)),
                Err(e) => {
                    warn!(slot = id, error = %e, "slot failed to initialize");
                    if failure.is_none() {
                        failure = Some(PoolError::SlotInit { slot: id, source: e });
                    }
                }
            }
        }

        if let Some(err) = failure {
            for (id, mut automation) in ready {
                if let Err(e) = automation.shutdown().await {
                    warn!(slot = id, error = %e, "failed to shut down slot after aborted start");
                }
            }
            return Err(err);
        }

        Ok(ready
            .into_iter()
            .map(|(id, automation)| Arc::new(WorkerSlot::new(id, automation)))
            .collect())
    }

    async fn drain(&self, slots: Vec<Arc<WorkerSlot>>) {
        let timeout = self.config.drain_timeout;
        join_all(slots.into_iter().map(|slot| async move {
            match tokio::time::timeout(timeout, slot.automation.lock()).await {
                Ok(mut automation) => {
                    if let Err(e) = automation.shutdown().await {
                        warn!(slot = slot.id(), error = %e, "slot shutdown failed");
                    } else {
                        debug!(slot = slot.id(), "slot shut down");
                    }
                }
                Err(_) => {
                    warn!(slot = slot.id(), "slot still busy after drain timeout, deferring shutdown");
                    let slot = slot.clone();
                    tokio::spawn(async move {
                        let mut automation = slot.automation.lock().await;
                        if let Err(e) = automation.shutdown().await {
                            warn!(slot = slot.id(), error = %e, "deferred slot shutdown failed");
                        }
                    });
                }
            }
        }))
        .await;
    }

    fn record_duration(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        let mut timing = self.timing.lock();
        timing.avg_ms = if timing.samples == 0 {
            ms
        } else {
            0.8 * timing.avg_ms + 0.2 * ms
        };
        timing.samples += 1;
    }
}

/// Returns a claimed slot to the pool, even if the dispatch future is dropped.
///
/// The instance guard is released before waiters are woken.
struct SlotLease<'a> {
    pool: &'a WorkerPool,
    slot: Arc<WorkerSlot>,
    automation: Option<AutomationGuard>,
    finished: bool,
}

impl SlotLease<'_> {
    fn finish(mut self, error: Option<String>, elapsed: Duration) {
        self.finished = true;
        self.automation = None;
        self.slot.finish(error);
        self.pool.record_duration(elapsed);
        self.pool.available.notify_waiters();
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.automation = None;
            self.slot.finish(Some("dispatch abandoned mid-task".into()));
            self.pool.available.notify_waiters();
        }
    }
}
