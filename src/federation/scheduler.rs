//! Durable delivery job scheduler
//!
//! Job lifecycle:
//!
//! ```text
//! pending --claim--> in_flight --2xx--> succeeded
//!                       |--retryable, attempts < max--> pending (backoff)
//!                       |--retryable, attempts = max--> dead
//!                       `--permanent--> dead
//! ```
//!
//! Every transition is a state-guarded UPDATE, so `succeeded` and `dead`
//! rows are never touched again.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Notify, Semaphore};

use super::delivery::{DeliveryClient, DeliveryOutcome};
use crate::config::DeliveryConfig;
use crate::data::{Database, DeliveryJob, NewDeliveryJob, now_millis};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_IN_FLIGHT, DELIVERY_JOBS};

/// Retry schedule for transient failures
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl From<&DeliveryConfig> for BackoffPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_backoff_secs),
            cap: Duration::from_secs(config.max_backoff_secs),
            max_attempts: config.max_attempts,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// `base * 2^(attempt-1)` plus up to a quarter of that as jitter, capped.
/// The jitter bound keeps successive delays non-decreasing.
pub fn backoff_delay<R: Rng + ?Sized>(policy: &BackoffPolicy, attempt: u32, rng: &mut R) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base_ms = policy.base.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << exponent);
    let jitter_ms = if exp_ms >= 4 {
        rng.gen_range(0..=exp_ms / 4)
    } else {
        0
    };
    let cap_ms = policy.cap.as_millis() as u64;

    Duration::from_millis(exp_ms.saturating_add(jitter_ms).min(cap_ms))
}

/// What a tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead: usize,
    /// Claimed jobs that were cancelled before delivery started
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Succeeded,
    Retried,
    Dead,
    Skipped,
}

/// Delivery job scheduler
#[derive(Clone)]
pub struct JobScheduler {
    db: Arc<Database>,
    delivery: DeliveryClient,
    policy: BackoffPolicy,
    batch_size: u32,
    poll_interval: Duration,
    stale_claim: Duration,
    semaphore: Arc<Semaphore>,
    wake: Arc<Notify>,
}

impl JobScheduler {
    pub fn new(db: Arc<Database>, delivery: DeliveryClient, config: &DeliveryConfig) -> Self {
        Self {
            db,
            delivery,
            policy: BackoffPolicy::from(config),
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            stale_claim: Duration::from_secs(config.stale_claim_secs),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Persist new pending jobs and wake the driver loop.
    pub async fn enqueue(&self, jobs: &[NewDeliveryJob]) -> Result<Vec<String>, AppError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self.db.enqueue_jobs(jobs, now_millis()).await?;
        self.wake.notify_one();
        Ok(ids)
    }

    /// Restart sweep: return jobs a previous process left in_flight to pending.
    pub async fn recover_in_flight(&self) -> Result<u64, AppError> {
        let recovered = self.db.reset_in_flight_jobs(now_millis()).await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered in-flight delivery jobs");
        }
        Ok(recovered)
    }

    /// Mark every unfinished job of an activity dead with reason `cancelled`.
    pub async fn cancel_for_activity(&self, activity_id: &str) -> Result<u64, AppError> {
        let cancelled = self
            .db
            .cancel_jobs_for_activity(activity_id, now_millis())
            .await?;
        if cancelled > 0 {
            tracing::info!(activity_id = %activity_id, cancelled, "Cancelled delivery jobs");
        }
        Ok(cancelled)
    }

    /// Run every job due at the current time.
    pub async fn run_once(&self) -> Result<TickReport, AppError> {
        self.run_due(now_millis()).await
    }

    /// Claim jobs due at `now_ms` and deliver them with bounded parallelism.
    ///
    /// Claims older than the stale window are first returned to pending.
    /// Retries are scheduled relative to `now_ms`.
    pub async fn run_due(&self, now_ms: i64) -> Result<TickReport, AppError> {
        let claimed_before = now_ms.saturating_sub(self.stale_claim.as_millis() as i64);
        let stale = self
            .db
            .reset_stale_in_flight_jobs(claimed_before, now_ms)
            .await?;
        if stale > 0 {
            tracing::warn!(stale, "Returned stale in-flight delivery jobs to pending");
        }

        let jobs = self.db.claim_due_jobs(now_ms, self.batch_size).await?;
        self.run_claimed(jobs, now_ms).await
    }

    /// Deliver jobs already moved to in_flight.
    ///
    /// Jobs cancelled since their claim are skipped without a request.
    pub async fn run_claimed(&self, jobs: Vec<DeliveryJob>, now_ms: i64) -> Result<TickReport, AppError> {
        let mut report = TickReport {
            claimed: jobs.len(),
            ..TickReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        tracing::debug!(claimed = jobs.len(), "Claimed delivery jobs");

        let mut tasks = Vec::with_capacity(jobs.len());
        for job in jobs {
            let semaphore = self.semaphore.clone();
            let scheduler = self.clone();

            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(AppError::Internal(anyhow::anyhow!(
                        "delivery semaphore closed"
                    )));
                };

                DELIVERIES_IN_FLIGHT.inc();
                let result = scheduler.execute(job, now_ms).await;
                DELIVERIES_IN_FLIGHT.dec();
                result
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Ok(Transition::Succeeded)) => report.succeeded += 1,
                Ok(Ok(Transition::Retried)) => report.retried += 1,
                Ok(Ok(Transition::Dead)) => report.dead += 1,
                Ok(Ok(Transition::Skipped)) => report.skipped += 1,
                // The job stays in_flight until the stale-claim sweep
                Ok(Err(e)) => tracing::error!(error = %e, "Failed to record delivery result"),
                Err(e) => tracing::error!(error = %e, "Delivery task panicked"),
            }
        }

        self.refresh_gauges().await;
        Ok(report)
    }

    async fn execute(&self, job: DeliveryJob, now_ms: i64) -> Result<Transition, AppError> {
        // Cancelled between claim and send
        if !self.db.job_is_in_flight(&job.id).await? {
            return Ok(Transition::Skipped);
        }

        let outcome = self
            .delivery
            .deliver(&job.recipient_inbox, job.payload.into_bytes())
            .await;
        let attempts = job.attempts + 1;

        let transition = match outcome {
            DeliveryOutcome::Success => {
                self.db.mark_job_succeeded(&job.id, attempts, now_ms).await?;
                tracing::debug!(job_id = %job.id, inbox = %job.recipient_inbox, attempts, "Delivered");
                Transition::Succeeded
            }
            DeliveryOutcome::Permanent(reason) => {
                self.db
                    .mark_job_dead(&job.id, attempts, &reason, now_ms)
                    .await?;
                tracing::warn!(
                    job_id = %job.id,
                    inbox = %job.recipient_inbox,
                    activity_id = %job.activity_id,
                    reason = %reason,
                    "Delivery failed permanently"
                );
                Transition::Dead
            }
            DeliveryOutcome::Retryable(reason) if attempts >= i64::from(self.policy.max_attempts) => {
                let reason = format!("retries exhausted: {}", reason);
                self.db
                    .mark_job_dead(&job.id, attempts, &reason, now_ms)
                    .await?;
                tracing::warn!(
                    job_id = %job.id,
                    inbox = %job.recipient_inbox,
                    activity_id = %job.activity_id,
                    attempts,
                    reason = %reason,
                    "Delivery dead-lettered"
                );
                Transition::Dead
            }
            DeliveryOutcome::Retryable(reason) => {
                let delay = {
                    let mut rng = rand::thread_rng();
                    backoff_delay(&self.policy, attempts as u32, &mut rng)
                };
                let next_attempt_at = now_ms.saturating_add(delay.as_millis() as i64);
                self.db
                    .reschedule_job(&job.id, attempts, next_attempt_at, &reason, now_ms)
                    .await?;
                tracing::info!(
                    job_id = %job.id,
                    inbox = %job.recipient_inbox,
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    reason = %reason,
                    "Delivery failed, will retry"
                );
                Transition::Retried
            }
        };

        Ok(transition)
    }

    async fn refresh_gauges(&self) {
        match self.db.count_jobs_by_state().await {
            Ok(counts) => {
                for (state, count) in counts {
                    DELIVERY_JOBS.with_label_values(&[state.as_str()]).set(count);
                }
            }
            Err(e) => tracing::debug!(error = %e, "Failed to refresh job gauges"),
        }
    }

    /// Driver loop. Runs until the task is dropped.
    pub async fn run_loop(self) {
        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            max_attempts = self.policy.max_attempts,
            "Delivery scheduler started"
        );

        loop {
            let full_batch = match self.run_once().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        tracing::info!(
                            claimed = report.claimed,
                            succeeded = report.succeeded,
                            retried = report.retried,
                            dead = report.dead,
                            "Delivery tick"
                        );
                    }
                    report.claimed as u32 >= self.batch_size
                }
                Err(e) => {
                    tracing::error!(error = %e, "Delivery tick failed");
                    false
                }
            };

            if full_batch {
                continue;
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=self.poll_interval.as_millis() as u64 / 5);
            let sleep = self.poll_interval + Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.wake.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(3600),
            max_attempts: 10,
        }
    }

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 1..=5u32 {
            let exp = 60u64 * (1 << (attempt - 1));
            let delay = backoff_delay(&policy, attempt, &mut rng).as_secs();
            assert!(delay >= exp.min(3600), "attempt {attempt}: {delay} < {exp}");
            assert!(delay <= (exp + exp / 4).min(3600), "attempt {attempt}: {delay} too large");
        }
    }

    #[test]
    fn backoff_gaps_are_non_decreasing_and_capped() {
        let policy = policy();

        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut previous = Duration::ZERO;
            for attempt in 1..=12 {
                let delay = backoff_delay(&policy, attempt, &mut rng);
                assert!(delay >= previous, "seed {seed}, attempt {attempt}");
                assert!(delay <= policy.cap);
                previous = delay;
            }
            assert_eq!(previous, policy.cap);
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff_delay(&policy(), u32::MAX, &mut rng), policy().cap);
    }
}
