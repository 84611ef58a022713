//! Sponsorship verification
//!
//! A sponsorship is stored `pending` and verified out of band. The chain
//! decides whether it moves to `verified` or `rejected`; a timeout leaves it
//! pending for the queue to retry. Each transition is a conditional update on
//! `status = 'pending'`, so racing verifiers move a row at most once and side
//! effects run only for the winner.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use super::chain::{parse_tx_hash, verify_transfer, ChainRpc, TransferVerdict};
use crate::config::PaymentSettings;
use crate::db::sqlite::is_constraint_violation;
use crate::db::Database;
use crate::domain_types::Usdc;
use crate::error::{CoreError, CoreResult};
use crate::models::{Platform, SponsorTotal, Sponsorship, SponsorshipStatus, TargetType};
use crate::points::Action;
use crate::tasks::{Job, TaskQueue};

/// Purpose recorded against the tx in the consumed-payment registry
const PAYMENT_PURPOSE: &str = "sponsorship";

/// Result of one verification pass
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub sponsorship_id: String,
    pub status: SponsorshipStatus,
    pub valid: bool,
    pub confirmed_amount: Option<Usdc>,
    pub error: Option<String>,
}

impl VerifyOutcome {
    fn from_row(s: &Sponsorship) -> Self {
        Self {
            sponsorship_id: s.id.clone(),
            status: s.status,
            valid: s.status == SponsorshipStatus::Verified,
            confirmed_amount: s.confirmed_amount,
            error: s.rejection_reason.clone(),
        }
    }
}

pub struct PaymentVerifier {
    db: Arc<Database>,
    chain: Arc<dyn ChainRpc>,
    settings: PaymentSettings,
    min_amount: Usdc,
    tasks: TaskQueue,
}

impl PaymentVerifier {
    pub fn new(
        db: Arc<Database>,
        chain: Arc<dyn ChainRpc>,
        settings: PaymentSettings,
        min_amount: Usdc,
        tasks: TaskQueue,
    ) -> Self {
        Self {
            db,
            chain,
            settings,
            min_amount,
            tasks,
        }
    }

    pub fn settings(&self) -> &PaymentSettings {
        &self.settings
    }

    /// Record a pending sponsorship and queue its verification. Never waits
    /// on the chain.
    pub fn submit(
        &self,
        sponsor_identity: &str,
        target_type: &str,
        target_id: &str,
        amount: Usdc,
        tx_reference: &str,
    ) -> CoreResult<Sponsorship> {
        let target_type = target_type
            .parse::<TargetType>()
            .map_err(|_| CoreError::InvalidInput(format!("unknown target type '{}'", target_type)))?;
        if target_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("target id is required".to_string()));
        }
        if amount < self.min_amount {
            return Err(CoreError::InvalidInput(format!(
                "sponsorship must be at least {} USDC",
                self.min_amount
            )));
        }
        if parse_tx_hash(tx_reference).is_none() {
            return Err(CoreError::InvalidInput(format!(
                "malformed transaction hash '{}'",
                tx_reference
            )));
        }
        let tx_reference = tx_reference.to_lowercase();

        if self.db.get_sponsorship_by_tx(&tx_reference)?.is_some() {
            return Err(CoreError::Conflict("transaction already submitted".to_string()));
        }
        // One registry for every consumed transfer, shared with agent purchases
        if !self
            .db
            .record_external_payment(&tx_reference, PAYMENT_PURPOSE, None, amount)?
        {
            return Err(CoreError::Conflict("transaction already used as payment".to_string()));
        }

        let now = Utc::now();
        let sponsorship = Sponsorship {
            id: uuid::Uuid::new_v4().to_string(),
            sponsor_identity: sponsor_identity.to_string(),
            target_type,
            target_id: target_id.trim().to_string(),
            amount,
            tx_reference,
            status: SponsorshipStatus::Pending,
            confirmed_amount: None,
            rejection_reason: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            verified_at: None,
            effects_applied: false,
        };

        if let Err(e) = self.db.insert_sponsorship(&sponsorship) {
            self.release_payment(&sponsorship.tx_reference);
            return Err(if is_constraint_violation(&e) {
                CoreError::Conflict("transaction already submitted".to_string())
            } else {
                e.into()
            });
        }

        log::info!(
            "[verifier] Sponsorship {} pending: {} {} on {} {}",
            sponsorship.id,
            sponsorship.amount,
            sponsorship.tx_reference,
            sponsorship.target_type,
            sponsorship.target_id
        );
        self.tasks.enqueue(Job::VerifySponsorship {
            sponsorship_id: sponsorship.id.clone(),
        });
        Ok(sponsorship)
    }

    pub fn get(&self, id: &str) -> CoreResult<Sponsorship> {
        self.db
            .get_sponsorship(id)?
            .ok_or_else(|| CoreError::NotFound(format!("sponsorship {}", id)))
    }

    /// Check the chain for a pending sponsorship and settle it. Terminal rows
    /// are reported as stored without touching the chain.
    pub async fn verify(&self, id: &str) -> CoreResult<VerifyOutcome> {
        let sponsorship = self.get(id)?;
        if sponsorship.status == SponsorshipStatus::Verified && !sponsorship.effects_applied {
            // An earlier pass verified the row but failed before its effects landed
            self.apply_side_effects(&sponsorship)?;
            return Ok(VerifyOutcome::from_row(&self.get(id)?));
        }
        if sponsorship.status.is_terminal() {
            return Ok(VerifyOutcome::from_row(&sponsorship));
        }

        self.db.record_verification_attempt(id)?;
        let verdict = verify_transfer(
            self.chain.as_ref(),
            &self.settings,
            &sponsorship.tx_reference,
            sponsorship.amount,
        )
        .await;

        match verdict {
            TransferVerdict::Valid(confirmed) => {
                if self.db.mark_sponsorship_verified(id, confirmed, Utc::now())? {
                    log::info!("[verifier] Sponsorship {} verified ({} USDC)", id, confirmed);
                }
                let settled = self.get(id)?;
                if settled.status == SponsorshipStatus::Verified {
                    self.apply_side_effects(&settled)?;
                }
                return Ok(VerifyOutcome::from_row(&self.get(id)?));
            }
            TransferVerdict::Invalid(reason) => {
                if self.db.mark_sponsorship_rejected(id, &reason)? {
                    log::warn!("[verifier] Sponsorship {} rejected: {}", id, reason);
                }
            }
            TransferVerdict::Indeterminate(reason) => {
                log::warn!("[verifier] Sponsorship {} still pending: {}", id, reason);
                let mut outcome = VerifyOutcome::from_row(&sponsorship);
                outcome.error = Some(reason);
                return Ok(outcome);
            }
        }

        // Report whatever state won, ours or a concurrent verifier's
        Ok(VerifyOutcome::from_row(&self.get(id)?))
    }

    /// Runs at most once per sponsorship: the settle call claims the effects
    /// and writes the total together.
    fn apply_side_effects(&self, sponsorship: &Sponsorship) -> CoreResult<()> {
        let confirmed = sponsorship.confirmed_amount.unwrap_or(sponsorship.amount);
        let total = match sponsorship.target_type {
            TargetType::Location | TargetType::Event => {
                Some((sponsorship.target_type, sponsorship.target_id.as_str(), confirmed))
            }
            TargetType::FeaturedEvent => None,
        };
        if !self.db.settle_sponsorship_effects(&sponsorship.id, total)? {
            return Ok(());
        }

        if sponsorship.target_type == TargetType::FeaturedEvent {
            // Informational only; the effects are already claimed
            if let Ok(Some(featured)) = self.db.top_featured_sponsorship() {
                if featured.id == sponsorship.id {
                    log::info!(
                        "[verifier] {} is now the featured event ({} USDC)",
                        sponsorship.target_id,
                        confirmed
                    );
                }
            }
        }

        match Platform::from_user_id(&sponsorship.sponsor_identity) {
            Some(platform) => self.tasks.award(
                &sponsorship.sponsor_identity,
                platform,
                Action::SponsorshipVerified,
                Some(sponsorship.id.clone()),
            ),
            None => log::warn!(
                "[verifier] No bonus for {}: not a platform user id",
                sponsorship.sponsor_identity
            ),
        }
        Ok(())
    }

    fn release_payment(&self, tx_reference: &str) {
        if let Err(e) = self.db.delete_external_payment(tx_reference) {
            log::error!("[verifier] Failed to release payment {}: {}", tx_reference, e);
        }
    }

    /// Operator re-entry into the pipeline. Rejected rows are reopened;
    /// verified rows stay final.
    pub fn reverify(&self, id: &str) -> CoreResult<Sponsorship> {
        let sponsorship = self.get(id)?;
        match sponsorship.status {
            SponsorshipStatus::Verified => {
                return Err(CoreError::Conflict(format!("sponsorship {} is already verified", id)));
            }
            SponsorshipStatus::Rejected => {
                if !self.db.reopen_sponsorship(id)? {
                    return Err(CoreError::Conflict(format!("sponsorship {} changed state", id)));
                }
                log::info!("[verifier] Sponsorship {} reopened by operator", id);
            }
            SponsorshipStatus::Pending => {}
        }
        self.tasks.enqueue(Job::VerifySponsorship {
            sponsorship_id: id.to_string(),
        });
        self.get(id)
    }

    /// The verified featured-event bid currently holding the slot
    pub fn current_featured(&self) -> CoreResult<Option<Sponsorship>> {
        Ok(self.db.top_featured_sponsorship()?)
    }

    pub fn sponsor_total(&self, target_type: TargetType, target_id: &str) -> CoreResult<SponsorTotal> {
        Ok(self.db.get_sponsor_total(target_type, target_id)?)
    }

    /// Re-queue rows a previous run left pending or half-settled
    pub fn requeue_pending(&self, limit: i64) -> CoreResult<usize> {
        let pending = self.db.list_unsettled_sponsorships(limit)?;
        for sponsorship in &pending {
            self.tasks.enqueue(Job::VerifySponsorship {
                sponsorship_id: sponsorship.id.clone(),
            });
        }
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::chain::testing::{receipt, tx_hash, ScriptedChain};
    use crate::payments::chain::ChainError;
    use crate::tasks::Envelope;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn verifier() -> (PaymentVerifier, Arc<ScriptedChain>, UnboundedReceiver<Envelope>) {
        let db = Arc::new(Database::in_memory());
        let chain = Arc::new(ScriptedChain::new());
        let (queue, receiver) = TaskQueue::new();
        let verifier = PaymentVerifier::new(
            db,
            chain.clone(),
            PaymentSettings::for_tests(),
            Usdc::from_micros(1_000_000),
            queue,
        );
        (verifier, chain, receiver)
    }

    fn usdc(s: &str) -> Usdc {
        s.parse().unwrap()
    }

    fn pay(chain: &ScriptedChain, tx: &str, amount: &str) {
        let settings = PaymentSettings::for_tests();
        chain.pay(tx, &settings.token_contract, &settings.treasury_address, usdc(amount).micros() as u64);
    }

    #[test]
    fn test_submit_validates_and_queues() {
        let (verifier, _, mut rx) = verifier();

        assert!(matches!(
            verifier.submit("web_0xabc", "billboard", "x", usdc("5"), &tx_hash(1)),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            verifier.submit("web_0xabc", "event", "evt-1", usdc("0.99"), &tx_hash(1)),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            verifier.submit("web_0xabc", "event", "evt-1", usdc("5"), "0xnope"),
            Err(CoreError::InvalidInput(_))
        ));

        let s = verifier.submit("web_0xabc", "event", "evt-1", usdc("5"), &tx_hash(1)).unwrap();
        assert_eq!(s.status, SponsorshipStatus::Pending);
        assert!(matches!(
            rx.try_recv().unwrap().job,
            Job::VerifySponsorship { ref sponsorship_id } if *sponsorship_id == s.id
        ));

        // The same transaction cannot back two sponsorships
        assert!(matches!(
            verifier.submit("web_0xdef", "location", "hall", usdc("5"), &tx_hash(1)),
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_underpayment_is_rejected_and_final() {
        let (verifier, chain, _rx) = verifier();
        let tx = tx_hash(2);
        pay(&chain, &tx, "1.50");

        let s = verifier.submit("telegram_1", "location", "hall-a", usdc("2.00"), &tx).unwrap();
        let outcome = verifier.verify(&s.id).await.unwrap();
        assert_eq!(outcome.status, SponsorshipStatus::Rejected);
        assert!(!outcome.valid);
        assert_eq!(verifier.sponsor_total(TargetType::Location, "hall-a").unwrap().total, Usdc::ZERO);

        // Even if the chain later says otherwise, a terminal row never moves
        pay(&chain, &tx, "5.00");
        let again = verifier.verify(&s.id).await.unwrap();
        assert_eq!(again.status, SponsorshipStatus::Rejected);
    }

    #[tokio::test]
    async fn test_verified_location_accumulates_total_and_queues_bonus() {
        let (verifier, chain, mut rx) = verifier();
        for (n, amount) in [(3u8, "1.25"), (4u8, "2.00")] {
            let tx = tx_hash(n);
            pay(&chain, &tx, amount);
            let s = verifier.submit("telegram_1", "location", "hall-a", usdc(amount), &tx).unwrap();
            let outcome = verifier.verify(&s.id).await.unwrap();
            assert!(outcome.valid);
            assert_eq!(outcome.confirmed_amount, Some(usdc(amount)));
        }

        let total = verifier.sponsor_total(TargetType::Location, "hall-a").unwrap();
        assert_eq!(total.total, usdc("3.25"));
        assert_eq!(total.sponsorship_count, 2);

        let mut bonuses = 0;
        while let Ok(envelope) = rx.try_recv() {
            if let Job::AwardPoints { action: Action::SponsorshipVerified, .. } = envelope.job {
                bonuses += 1;
            }
        }
        assert_eq!(bonuses, 2);
    }

    #[tokio::test]
    async fn test_featured_precedence() {
        let (verifier, chain, _rx) = verifier();
        for (n, amount) in [(5u8, "1.00"), (6u8, "1.50"), (7u8, "1.50")] {
            let tx = tx_hash(n);
            pay(&chain, &tx, amount);
            let s = verifier
                .submit("farcaster_2", "featured_event", &format!("evt-{}", n), usdc(amount), &tx)
                .unwrap();
            verifier.verify(&s.id).await.unwrap();
        }

        // Highest amount wins; the earlier of the two 1.50 bids keeps the slot
        let featured = verifier.current_featured().unwrap().unwrap();
        assert_eq!(featured.amount, usdc("1.50"));
        assert_eq!(featured.target_id, "evt-6");
    }

    #[tokio::test]
    async fn test_timeout_leaves_pending() {
        let (verifier, chain, _rx) = verifier();
        let tx = tx_hash(8);
        chain.answer(&tx, Err(ChainError::Timeout));

        let s = verifier.submit("telegram_1", "event", "evt-1", usdc("1"), &tx).unwrap();
        let outcome = verifier.verify(&s.id).await.unwrap();
        assert_eq!(outcome.status, SponsorshipStatus::Pending);
        assert!(outcome.error.is_some());
        assert_eq!(verifier.get(&s.id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_reverify_reopens_rejected_only() {
        let (verifier, chain, _rx) = verifier();
        let tx = tx_hash(10);
        chain.answer(&tx, Ok(Some(receipt(&tx, 0, vec![]))));

        let s = verifier.submit("telegram_1", "event", "evt-1", usdc("1"), &tx).unwrap();
        assert_eq!(verifier.verify(&s.id).await.unwrap().status, SponsorshipStatus::Rejected);

        // Operator retries after the payer re-broadcast; the node now has it
        pay(&chain, &tx, "1.00");
        assert_eq!(verifier.reverify(&s.id).unwrap().status, SponsorshipStatus::Pending);
        assert_eq!(verifier.verify(&s.id).await.unwrap().status, SponsorshipStatus::Verified);

        assert!(matches!(verifier.reverify(&s.id), Err(CoreError::Conflict(_))));
    }

    #[test]
    fn test_transfer_spent_on_agent_purchase_cannot_back_sponsorship() {
        let (verifier, _, _rx) = verifier();
        let tx = tx_hash(11);
        assert!(verifier
            .db
            .record_external_payment(&tx, "skill_purchase", Some(1), usdc("0.50"))
            .unwrap());

        assert!(matches!(
            verifier.submit("telegram_1", "featured_event", "evt-1", usdc("1.00"), &tx),
            Err(CoreError::Conflict(_))
        ));
        assert!(verifier.db.get_sponsorship_by_tx(&tx).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_side_effects_survive_store_failure_after_verify() {
        let (verifier, chain, mut rx) = verifier();
        let tx = tx_hash(12);
        pay(&chain, &tx, "2.00");
        let s = verifier.submit("telegram_1", "location", "hall-b", usdc("2.00"), &tx).unwrap();
        while rx.try_recv().is_ok() {}

        // Take the totals table away so the settle step fails after the status moved
        verifier
            .db
            .conn
            .lock()
            .execute_batch("ALTER TABLE sponsor_totals RENAME TO sponsor_totals_offline")
            .unwrap();
        assert!(verifier.verify(&s.id).await.is_err());
        let row = verifier.get(&s.id).unwrap();
        assert_eq!(row.status, SponsorshipStatus::Verified);
        assert!(!row.effects_applied);
        assert!(rx.try_recv().is_err());
        assert_eq!(verifier.db.list_unsettled_sponsorships(10).unwrap().len(), 1);

        verifier
            .db
            .conn
            .lock()
            .execute_batch("ALTER TABLE sponsor_totals_offline RENAME TO sponsor_totals")
            .unwrap();

        // The retry settles what the first pass missed, exactly once
        for _ in 0..2 {
            let outcome = verifier.verify(&s.id).await.unwrap();
            assert_eq!(outcome.status, SponsorshipStatus::Verified);
        }
        let total = verifier.sponsor_total(TargetType::Location, "hall-b").unwrap();
        assert_eq!(total.total, usdc("2.00"));
        assert_eq!(total.sponsorship_count, 1);
        assert!(verifier.get(&s.id).unwrap().effects_applied);
        assert!(verifier.db.list_unsettled_sponsorships(10).unwrap().is_empty());

        let mut bonuses = 0;
        while let Ok(envelope) = rx.try_recv() {
            if let Job::AwardPoints { action: Action::SponsorshipVerified, .. } = envelope.job {
                bonuses += 1;
            }
        }
        assert_eq!(bonuses, 1);
    }
}
