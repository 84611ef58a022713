//! Background effect queue
//!
//! Side effects that must not hold up a request (bonus points, chain
//! verification) are sent here as `Job`s. A single worker drains the queue;
//! retryable failures are re-sent after an exponential backoff, and a job
//! that keeps failing is logged and dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{AwardContext, Platform, SponsorshipStatus};
use crate::payments::PaymentVerifier;
use crate::points::{Action, PointsLedger};

/// Minimum backoff delay in seconds
const MIN_BACKOFF_SECS: u64 = 5;
/// Maximum backoff delay in seconds
const MAX_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone)]
pub enum Job {
    AwardPoints {
        platform_user_id: String,
        platform: Platform,
        action: Action,
        idempotency_key: Option<String>,
    },
    VerifySponsorship {
        sponsorship_id: String,
    },
}

#[derive(Debug)]
pub struct Envelope {
    pub job: Job,
    pub attempt: u32,
}

/// Cloneable sending half handed to services and controllers
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Envelope>,
}

impl TaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, job: Job) {
        if let Err(e) = self.sender.send(Envelope { job, attempt: 0 }) {
            log::warn!("[tasks] Queue closed, dropping {:?}", e.0.job);
        }
    }

    /// Fire a points award without waiting for it
    pub fn award(&self, platform_user_id: &str, platform: Platform, action: Action, idempotency_key: Option<String>) {
        self.enqueue(Job::AwardPoints {
            platform_user_id: platform_user_id.to_string(),
            platform,
            action,
            idempotency_key,
        });
    }

    fn retry_later(&self, envelope: Envelope, delay: Duration) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = sender.send(envelope) {
                log::warn!("[tasks] Queue closed before retry of {:?}", e.0.job);
            }
        });
    }
}

/// Backoff before retry number `attempt + 1`: 5s doubling, capped at 60s
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = MIN_BACKOFF_SECS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

enum JobFailure {
    Retry(String),
    Drop(String),
}

pub struct TaskWorker {
    queue: TaskQueue,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    points: Arc<PointsLedger>,
    verifier: Arc<PaymentVerifier>,
    max_attempts: u32,
}

impl TaskWorker {
    pub fn new(
        queue: TaskQueue,
        receiver: mpsc::UnboundedReceiver<Envelope>,
        points: Arc<PointsLedger>,
        verifier: Arc<PaymentVerifier>,
    ) -> Self {
        Self {
            queue,
            receiver,
            points,
            verifier,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!("[tasks] Worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[tasks] Worker stopping");
                    break;
                }
                next = self.receiver.recv() => match next {
                    Some(envelope) => self.handle(envelope).await,
                    None => break,
                },
            }
        }
    }

    async fn handle(&self, envelope: Envelope) {
        match self.execute(&envelope.job).await {
            Ok(()) => {}
            Err(JobFailure::Drop(reason)) => {
                log::warn!("[tasks] Dropping {:?}: {}", envelope.job, reason);
            }
            Err(JobFailure::Retry(reason)) => {
                let next_attempt = envelope.attempt + 1;
                if next_attempt >= self.max_attempts {
                    log::error!(
                        "[tasks] Giving up on {:?} after {} attempts: {}",
                        envelope.job,
                        next_attempt,
                        reason
                    );
                    return;
                }
                let delay = backoff_delay(envelope.attempt);
                log::warn!(
                    "[tasks] {:?} failed ({}), retry {} in {}s",
                    envelope.job,
                    reason,
                    next_attempt,
                    delay.as_secs()
                );
                self.queue.retry_later(
                    Envelope {
                        job: envelope.job,
                        attempt: next_attempt,
                    },
                    delay,
                );
            }
        }
    }

    async fn execute(&self, job: &Job) -> Result<(), JobFailure> {
        match job {
            Job::AwardPoints {
                platform_user_id,
                platform,
                action,
                idempotency_key,
            } => {
                let context = AwardContext {
                    idempotency_key: idempotency_key.clone(),
                    occurred_at: None,
                };
                match self.points.award(platform_user_id, *platform, *action, &context) {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_retryable() => Err(JobFailure::Retry(e.to_string())),
                    Err(e) => Err(JobFailure::Drop(e.to_string())),
                }
            }
            Job::VerifySponsorship { sponsorship_id } => match self.verifier.verify(sponsorship_id).await {
                Ok(outcome) if outcome.status == SponsorshipStatus::Pending => Err(JobFailure::Retry(
                    outcome.error.unwrap_or_else(|| "verification indeterminate".to_string()),
                )),
                Ok(_) => Ok(()),
                Err(e) if e.is_retryable() => Err(JobFailure::Retry(e.to_string())),
                Err(e) => Err(JobFailure::Drop(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaymentSettings;
    use crate::db::Database;
    use crate::domain_types::Usdc;
    use crate::identity::IdentityResolver;
    use crate::payments::chain::testing::{tx_hash, ScriptedChain};

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(40));
        assert_eq!(backoff_delay(4), Duration::from_secs(60));
        assert_eq!(backoff_delay(30), Duration::from_secs(60));
    }

    fn worker() -> (TaskWorker, Arc<Database>, Arc<ScriptedChain>) {
        let db = Arc::new(Database::in_memory());
        let identities = Arc::new(IdentityResolver::new(db.clone()));
        let points = Arc::new(PointsLedger::new(db.clone(), identities));
        let chain = Arc::new(ScriptedChain::new());
        let (queue, receiver) = TaskQueue::new();
        let verifier = Arc::new(PaymentVerifier::new(
            db.clone(),
            chain.clone(),
            PaymentSettings::for_tests(),
            Usdc::from_micros(1_000_000),
            queue.clone(),
        ));
        (TaskWorker::new(queue, receiver, points, verifier), db, chain)
    }

    #[tokio::test]
    async fn test_award_job_credits_points() {
        let (worker, db, _) = worker();
        worker
            .handle(Envelope {
                job: Job::AwardPoints {
                    platform_user_id: "telegram_1".to_string(),
                    platform: Platform::Telegram,
                    action: Action::Rsvp,
                    idempotency_key: Some("evt-1".to_string()),
                },
                attempt: 0,
            })
            .await;

        assert_eq!(db.get_points_account("telegram_1").unwrap().unwrap().total_points, 5);
    }

    #[tokio::test]
    async fn test_worker_drains_verification_and_bonus() {
        let (mut worker, db, chain) = worker();
        let settings = PaymentSettings::for_tests();
        let tx = tx_hash(9);
        chain.pay(&tx, &settings.token_contract, &settings.treasury_address, 2_000_000);

        let sponsorship = worker
            .verifier
            .submit("farcaster_5", "location", "hall-a", Usdc::from_micros(2_000_000), &tx)
            .unwrap();

        // Submission and the bonus it triggers both pass through the queue
        for _ in 0..2 {
            let envelope = worker.receiver.recv().await.unwrap();
            worker.handle(envelope).await;
        }

        let stored = db.get_sponsorship(&sponsorship.id).unwrap().unwrap();
        assert_eq!(stored.status, SponsorshipStatus::Verified);
        assert_eq!(db.get_points_account("farcaster_5").unwrap().unwrap().total_points, 100);
    }
}
