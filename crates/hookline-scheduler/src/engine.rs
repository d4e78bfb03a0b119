use std::sync::Arc;
use std::time::Duration;

use hookline_core::config::{DeliveryConfig, SchedulerConfig};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    delivery::{Delivery, DeliveryError},
    error::Result,
    store::MessageStore,
    types::ScheduledMessage,
};

/// What happened to the due set during one [`DispatchEngine::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Rows returned by the ready queue.
    pub due: usize,
    /// Delivered successfully.
    pub sent: usize,
    /// Delivery failed; row marked failed.
    pub failed: usize,
    /// Claimed elsewhere, changed or deleted mid-flight, or not started
    /// because of shutdown.
    pub skipped: usize,
}

enum Outcome {
    Sent,
    Failed,
    Skipped,
}

/// Dispatch driver: polls the ready queue and delivers due messages through a
/// bounded pool of workers.
///
/// Several engines may share one database; the per-row claim in
/// [`MessageStore::claim`] ensures each fire is delivered by only one of them.
#[derive(Clone)]
pub struct DispatchEngine {
    store: MessageStore,
    delivery: Arc<dyn Delivery>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    workers: Arc<Semaphore>,
    lease: chrono::Duration,
    max_attempts: u32,
    retry_backoff: Duration,
    attempt_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(
        store: MessageStore,
        delivery: Arc<dyn Delivery>,
        clock: Arc<dyn Clock>,
        scheduler: &SchedulerConfig,
        delivery_config: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            clock,
            poll_interval: Duration::from_secs(scheduler.poll_interval_secs.max(1)),
            workers: Arc::new(Semaphore::new(scheduler.max_concurrency.max(1))),
            lease: chrono::Duration::seconds(scheduler.lease_secs as i64),
            max_attempts: delivery_config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(delivery_config.retry_backoff_ms),
            attempt_timeout: Duration::from_secs(delivery_config.timeout_secs),
        }
    }

    /// Main event loop. Polls every `poll_interval` until `shutdown`
    /// broadcasts `true` or its sender is dropped.
    ///
    /// A shutdown that arrives mid-tick stops the tick from starting further
    /// deliveries; the ones already in flight run to completion before this
    /// returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            "dispatch engine started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick_until(Some(&mut shutdown)).await {
                        Ok(summary) if summary.due > 0 => info!(
                            due = summary.due,
                            sent = summary.sent,
                            failed = summary.failed,
                            skipped = summary.skipped,
                            "dispatch tick"
                        ),
                        Ok(_) => {}
                        Err(e) => error!("dispatch tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("dispatch engine shutting down");
    }

    /// Release stale leases, then deliver everything that is due now.
    /// Returns once every delivery started by this tick has finished.
    pub async fn tick(&self) -> Result<TickSummary> {
        self.tick_until(None).await
    }

    async fn tick_until(
        &self,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<TickSummary> {
        let now = self.clock.now();
        self.store.release_expired_leases(now)?;
        let due = self.store.select_due(now)?;

        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }
        debug!(count = due.len(), "due messages selected");

        let mut tasks = JoinSet::new();
        for (started, msg) in due.into_iter().enumerate() {
            let acquire = Arc::clone(&self.workers).acquire_owned();
            let permit = match shutdown.as_deref_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    _ = stop_requested(rx) => {
                        info!(
                            not_started = summary.due - started,
                            "shutdown requested, leaving remaining messages for the next run"
                        );
                        summary.skipped += summary.due - started;
                        break;
                    }
                    permit = acquire => permit,
                },
                None => acquire.await,
            };
            let Ok(permit) = permit else {
                break;
            };
            let engine = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let id = msg.id.clone();
                (id, engine.dispatch(msg).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Outcome::Sent))) => summary.sent += 1,
                Ok((_, Ok(Outcome::Failed))) => summary.failed += 1,
                Ok((_, Ok(Outcome::Skipped))) => summary.skipped += 1,
                Ok((id, Err(e))) => {
                    error!(message_id = %id, "dispatch failed: {e}");
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!("dispatch task panicked: {e}");
                    summary.skipped += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Claim, deliver and record one message.
    async fn dispatch(&self, msg: ScheduledMessage) -> Result<Outcome> {
        let Some(claimed) = self.store.claim(&msg.id, self.clock.now(), self.lease)? else {
            return Ok(Outcome::Skipped);
        };

        let (result, attempts) = self.deliver_with_retry(&claimed).await;
        let finished = self.clock.now();

        match result {
            Ok(()) => {
                self.store.record_send(&claimed, finished, attempts, None)?;
                match self.store.mark_as_sent(&claimed, finished)? {
                    Some(updated) => {
                        info!(
                            message_id = %updated.id,
                            send_count = updated.send_count,
                            status = %updated.status,
                            next_send_at = ?updated.next_send_at,
                            "message sent"
                        );
                        Ok(Outcome::Sent)
                    }
                    None => {
                        info!(message_id = %claimed.id, "message sent, row changed or gone");
                        Ok(Outcome::Skipped)
                    }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(message_id = %claimed.id, attempts, error = %reason, "delivery failed");
                self.store
                    .record_send(&claimed, finished, attempts, Some(&reason))?;
                match self.store.mark_as_failed(&claimed, &reason, finished)? {
                    Some(_) => Ok(Outcome::Failed),
                    None => Ok(Outcome::Skipped),
                }
            }
        }
    }

    /// Whether sleeping `wait` and then making one more attempt still ends
    /// before `msg`'s lease runs out.
    fn retry_fits_lease(&self, msg: &ScheduledMessage, wait: Duration) -> bool {
        let Some(locked_until) = msg.locked_until else {
            return true;
        };
        let Ok(needed) = chrono::Duration::from_std(wait.saturating_add(self.attempt_timeout)) else {
            return false;
        };
        self.clock
            .now()
            .checked_add_signed(needed)
            .is_some_and(|end| end <= locked_until)
    }

    /// Deliver with up to `max_attempts` tries for transient errors.
    ///
    /// Backoff doubles after every retry; a rate limit waits for the
    /// destination's `retry_after` instead. A retry that could not finish
    /// inside the claim's lease is not attempted.
    async fn deliver_with_retry(
        &self,
        msg: &ScheduledMessage,
    ) -> (std::result::Result<(), DeliveryError>, u32) {
        let mut attempt = 0;
        let mut backoff = self.retry_backoff;
        loop {
            attempt += 1;
            match self.delivery.deliver(msg).await {
                Ok(()) => return (Ok(()), attempt),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let wait = match e {
                        DeliveryError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(retry_after_ms)
                        }
                        _ => backoff,
                    };
                    if !self.retry_fits_lease(msg, wait) {
                        warn!(
                            message_id = %msg.id,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            "retry would outlive the lease, giving up: {e}"
                        );
                        return (Err(e), attempt);
                    }
                    warn!(
                        message_id = %msg.id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "delivery attempt failed, retrying: {e}"
                    );
                    tokio::time::sleep(wait).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

/// Resolves once `rx` holds `true` or its sender is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}
