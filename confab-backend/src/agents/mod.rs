//! Agent micropayment ledger
//!
//! Balances move only through single-row guarded updates; the transaction
//! row is appended after the balance change it records. If a later step
//! fails, the earlier balance changes are reversed, so the log and the
//! balances never disagree once an operation returns.

pub mod catalog;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::config::PaymentSettings;
use crate::db::sqlite::is_constraint_violation;
use crate::db::{BalanceDelta, Database};
use crate::domain_types::Usdc;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    AgentAccount, AgentTransaction, LedgerCheck, PaymentRequired, Recommendation, Settlement, Skill, TxMetadata,
    TxStatus,
};
use crate::payments::chain::{verify_transfer, ChainRpc, TransferVerdict};
use catalog::{find_skill, EVENT_BOOST_PRICE, RECOMMENDATION_PRICE, STARTER_SKILL};

const MAX_CAS_ATTEMPTS: usize = 5;
const OPEN_SLOT_BATCH: i64 = 5;
const MAX_CLAIM_ROUNDS: usize = 10;
/// Upcoming events returned with a recommendation
const RECOMMENDATION_EVENTS: i64 = 5;

/// Either the operation happened, or the payer has to top up first
#[derive(Debug, Clone)]
pub enum LedgerOutcome<T> {
    Completed(T),
    PaymentRequired(PaymentRequired),
}

#[derive(Debug, Clone, Serialize)]
pub struct Purchased {
    pub agent: AgentAccount,
    pub skill: &'static Skill,
}

pub struct AgentLedger {
    db: Arc<Database>,
    chain: Arc<dyn ChainRpc>,
    settings: PaymentSettings,
    seed: Usdc,
}

impl AgentLedger {
    pub fn new(db: Arc<Database>, chain: Arc<dyn ChainRpc>, settings: PaymentSettings, seed: Usdc) -> Self {
        Self {
            db,
            chain,
            settings,
            seed,
        }
    }

    pub fn get(&self, slot: i64) -> CoreResult<AgentAccount> {
        self.db
            .get_agent(slot)?
            .ok_or_else(|| CoreError::NotFound(format!("agent {}", slot)))
    }

    /// Ids an agent of this person may be recorded under: the canonical id
    /// first, then every linked platform user id. Canonical ids are minted
    /// from a platform user id, so a slot left under a merged-away canonical
    /// id is still found here.
    fn owner_keys(&self, canonical_id: &str) -> CoreResult<Vec<String>> {
        let mut keys = vec![canonical_id.to_string()];
        for member in self.db.list_identities_by_canonical(canonical_id)? {
            if member.platform_user_id != canonical_id {
                keys.push(member.platform_user_id);
            }
        }
        Ok(keys)
    }

    pub fn owned_by(&self, canonical_id: &str) -> CoreResult<Option<AgentAccount>> {
        for key in self.owner_keys(canonical_id)? {
            if let Some(agent) = self.db.get_agent_by_owner(&key)? {
                return Ok(Some(agent));
            }
        }
        Ok(None)
    }

    /// The agent in `slot`, if the person behind `canonical_id` owns it
    pub fn authorize(&self, slot: i64, canonical_id: &str) -> CoreResult<AgentAccount> {
        let agent = self.get(slot)?;
        let owned = match agent.owner_identity.as_deref() {
            Some(owner) => self.owner_keys(canonical_id)?.iter().any(|k| k == owner),
            None => false,
        };
        if !owned {
            return Err(CoreError::Forbidden(format!("agent {} belongs to someone else", slot)));
        }
        Ok(agent)
    }

    /// Give the person the first open slot, the starter skill, and the seed balance
    pub fn claim(&self, canonical_id: &str, display_name: Option<&str>) -> CoreResult<AgentAccount> {
        if self.owned_by(canonical_id)?.is_some() {
            return Err(CoreError::Conflict("identity already owns an agent".to_string()));
        }

        for _ in 0..MAX_CLAIM_ROUNDS {
            let open = self.db.list_open_slots(OPEN_SLOT_BATCH)?;
            if open.is_empty() {
                return Err(CoreError::Conflict("no open agent slots".to_string()));
            }

            for slot in open {
                match self.db.claim_agent_slot(slot, canonical_id, display_name, STARTER_SKILL) {
                    Ok(true) => {
                        log::info!("[agents] Slot {} claimed by {}", slot, canonical_id);
                        self.seed_balance(slot, canonical_id)?;
                        return self.get(slot);
                    }
                    // Someone else took this slot between list and claim
                    Ok(false) => continue,
                    Err(e) if is_constraint_violation(&e) => {
                        return Err(CoreError::Conflict("identity already owns an agent".to_string()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(CoreError::Unavailable("agent pool is contended".to_string()))
    }

    fn seed_balance(&self, slot: i64, canonical_id: &str) -> CoreResult<()> {
        if !self.seed.is_positive() {
            return Ok(());
        }
        let metadata = TxMetadata::Seed {
            owner_identity: canonical_id.to_string(),
        };
        self.transfer(None, Some(slot), self.seed, metadata)?;
        Ok(())
    }

    /// Buy a skill from the balance, or with `payment_tx` paying the treasury directly
    pub async fn purchase(
        &self,
        slot: i64,
        skill_slug: &str,
        payment_tx: Option<&str>,
    ) -> CoreResult<LedgerOutcome<Purchased>> {
        let skill = find_skill(skill_slug).ok_or_else(|| CoreError::NotFound(format!("skill {}", skill_slug)))?;
        let agent = self.get(slot)?;
        ensure_owned(&agent)?;
        if agent.has_skill(skill.slug) {
            return Err(CoreError::Conflict(format!("agent {} already has {}", slot, skill.slug)));
        }

        match payment_tx {
            Some(tx_reference) => self.purchase_with_proof(slot, skill, tx_reference).await,
            None => self.purchase_from_balance(slot, skill),
        }
    }

    fn purchase_from_balance(&self, slot: i64, skill: &'static Skill) -> CoreResult<LedgerOutcome<Purchased>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let agent = self.get(slot)?;
            if agent.has_skill(skill.slug) {
                return Err(CoreError::Conflict(format!("agent {} already has {}", slot, skill.slug)));
            }
            if agent.balance < skill.price {
                return Ok(LedgerOutcome::PaymentRequired(self.payment_required(skill.price, agent.balance)));
            }

            let mut next = agent.clone();
            next.balance = Usdc::from_micros(agent.balance.micros() - skill.price.micros());
            next.total_spent = Usdc::from_micros(agent.total_spent.micros() + skill.price.micros());
            next.skills.push(skill.slug.to_string());

            if !self.db.update_agent_state(&next, agent.version)? {
                continue;
            }

            if skill.price.is_positive() {
                let tx = new_transaction(
                    Some(slot),
                    None,
                    skill.price,
                    TxMetadata::SkillPurchase {
                        skill: skill.slug.to_string(),
                        settlement: Settlement::Balance,
                    },
                );
                if let Err(e) = self.db.insert_agent_transaction(&tx) {
                    log::error!("[agents] Failed to log purchase for agent {}: {}", slot, e);
                    self.undo_skill(slot, skill, skill.price);
                    return Err(CoreError::Unavailable("could not record purchase".to_string()));
                }
            }

            log::info!("[agents] Agent {} bought {} for {}", slot, skill.slug, skill.price);
            return Ok(LedgerOutcome::Completed(Purchased {
                agent: self.get(slot)?,
                skill,
            }));
        }
        Err(CoreError::Unavailable(format!("agent {} is contended", slot)))
    }

    async fn purchase_with_proof(
        &self,
        slot: i64,
        skill: &'static Skill,
        tx_reference: &str,
    ) -> CoreResult<LedgerOutcome<Purchased>> {
        let tx_reference = tx_reference.to_lowercase();
        match verify_transfer(self.chain.as_ref(), &self.settings, &tx_reference, skill.price).await {
            TransferVerdict::Valid(_) => {}
            TransferVerdict::Invalid(reason) => {
                return Err(CoreError::InvalidInput(format!("payment proof rejected: {}", reason)));
            }
            TransferVerdict::Indeterminate(reason) => {
                return Err(CoreError::Unavailable(format!("payment proof not yet verifiable: {}", reason)));
            }
        }

        if !self
            .db
            .record_external_payment(&tx_reference, "skill_purchase", Some(slot), skill.price)?
        {
            return Err(CoreError::Conflict("payment proof already used".to_string()));
        }

        match self.grant_skill(slot, skill) {
            Ok(()) => {}
            Err(e) => {
                self.release_proof(&tx_reference);
                return Err(e);
            }
        }

        // Paid outside the pool: the row points at the agent on both sides so
        // it shows in the agent's history and nets to zero against the balance
        let tx = new_transaction(
            Some(slot),
            Some(slot),
            skill.price,
            TxMetadata::SkillPurchase {
                skill: skill.slug.to_string(),
                settlement: Settlement::External {
                    tx_reference: tx_reference.clone(),
                },
            },
        );
        if let Err(e) = self.db.insert_agent_transaction(&tx) {
            log::error!("[agents] Failed to log external purchase for agent {}: {}", slot, e);
            self.undo_skill(slot, skill, Usdc::ZERO);
            self.release_proof(&tx_reference);
            return Err(CoreError::Unavailable("could not record purchase".to_string()));
        }

        log::info!("[agents] Agent {} bought {} with {}", slot, skill.slug, tx_reference);
        Ok(LedgerOutcome::Completed(Purchased {
            agent: self.get(slot)?,
            skill,
        }))
    }

    fn grant_skill(&self, slot: i64, skill: &Skill) -> CoreResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let agent = self.get(slot)?;
            if agent.has_skill(skill.slug) {
                return Err(CoreError::Conflict(format!("agent {} already has {}", slot, skill.slug)));
            }
            let mut next = agent.clone();
            next.skills.push(skill.slug.to_string());
            if self.db.update_agent_state(&next, agent.version)? {
                return Ok(());
            }
        }
        Err(CoreError::Unavailable(format!("agent {} is contended", slot)))
    }

    /// Compensation: take the skill back and refund what was debited for it
    fn undo_skill(&self, slot: i64, skill: &Skill, refund: Usdc) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let agent = match self.db.get_agent(slot) {
                Ok(Some(agent)) => agent,
                Ok(None) => break,
                Err(e) => {
                    log::error!("[agents] Compensation read failed for agent {}: {}", slot, e);
                    return;
                }
            };
            let mut next = agent.clone();
            next.skills.retain(|s| s != skill.slug);
            next.balance = Usdc::from_micros(agent.balance.micros() + refund.micros());
            next.total_spent = Usdc::from_micros(agent.total_spent.micros() - refund.micros());
            match self.db.update_agent_state(&next, agent.version) {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    log::error!("[agents] Compensation write failed for agent {}: {}", slot, e);
                    return;
                }
            }
        }
        log::error!("[agents] Could not undo {} on agent {}", skill.slug, slot);
    }

    fn release_proof(&self, tx_reference: &str) {
        if let Err(e) = self.db.delete_external_payment(tx_reference) {
            log::error!("[agents] Failed to release payment proof {}: {}", tx_reference, e);
        }
    }

    /// Pay to push an event up the listings
    pub fn boost_event(&self, slot: i64, event_id: &str) -> CoreResult<LedgerOutcome<AgentTransaction>> {
        if event_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("event id is required".to_string()));
        }
        ensure_owned(&self.get(slot)?)?;
        let metadata = TxMetadata::EventBoost {
            event_id: event_id.to_string(),
        };
        self.charge(Some(slot), None, EVENT_BOOST_PRICE, metadata)
    }

    /// Pay another agent for its owner's schedule and whereabouts
    pub fn recommend(&self, requester_slot: i64, target_slot: i64) -> CoreResult<LedgerOutcome<Recommendation>> {
        if requester_slot == target_slot {
            return Err(CoreError::InvalidInput("an agent cannot recommend to itself".to_string()));
        }
        ensure_owned(&self.get(requester_slot)?)?;
        let target = self.get(target_slot)?;
        ensure_owned(&target)?;
        let owner = target
            .owner_identity
            .clone()
            .ok_or_else(|| CoreError::Invariant(format!("owned agent {} has no owner", target_slot)))?;

        // Read the product before charging for it
        let upcoming = self.db.upcoming_rsvps(&owner, Utc::now(), RECOMMENDATION_EVENTS)?;
        let latest_checkin = self.db.latest_checkin(&owner)?;

        let metadata = TxMetadata::Recommendation {
            requester_slot,
            target_slot,
        };
        Ok(
            match self.charge(Some(requester_slot), Some(target_slot), RECOMMENDATION_PRICE, metadata)? {
                LedgerOutcome::Completed(_) => LedgerOutcome::Completed(Recommendation {
                    agent_slot: target_slot,
                    agent_name: target.display_name,
                    upcoming,
                    latest_checkin,
                }),
                LedgerOutcome::PaymentRequired(required) => LedgerOutcome::PaymentRequired(required),
            },
        )
    }

    pub fn tip(
        &self,
        from_slot: i64,
        to_slot: i64,
        amount: Usdc,
        note: Option<String>,
    ) -> CoreResult<LedgerOutcome<AgentTransaction>> {
        if !amount.is_positive() {
            return Err(CoreError::InvalidInput("tip must be positive".to_string()));
        }
        if from_slot == to_slot {
            return Err(CoreError::InvalidInput("an agent cannot tip itself".to_string()));
        }
        ensure_owned(&self.get(from_slot)?)?;
        ensure_owned(&self.get(to_slot)?)?;
        self.charge(Some(from_slot), Some(to_slot), amount, TxMetadata::Tip { note })
    }

    /// Operator credit from outside the pool
    pub fn prize(&self, slot: i64, amount: Usdc, reason: &str) -> CoreResult<AgentTransaction> {
        if !amount.is_positive() {
            return Err(CoreError::InvalidInput("prize must be positive".to_string()));
        }
        let agent = self.get(slot)?;
        ensure_owned(&agent)?;
        if agent.balance.checked_add(amount).is_none() || agent.total_earned.checked_add(amount).is_none() {
            return Err(CoreError::InvalidInput(format!(
                "prize of {} would overflow agent {}'s balance",
                amount, slot
            )));
        }
        let metadata = TxMetadata::Prize {
            reason: reason.to_string(),
        };
        self.transfer(None, Some(slot), amount, metadata)?
            .ok_or_else(|| CoreError::Unavailable(format!("agent {} could not be credited", slot)))
    }

    pub fn transactions(&self, slot: i64, limit: i64) -> CoreResult<Vec<AgentTransaction>> {
        self.get(slot)?;
        Ok(self.db.list_agent_transactions(slot, limit)?)
    }

    /// Compare the stored balance with the sum of the agent's log
    pub fn ledger_check(&self, slot: i64) -> CoreResult<LedgerCheck> {
        let agent = self.get(slot)?;
        let ledger_sum = self.db.agent_ledger_sum(slot)?;
        let consistent = ledger_sum == agent.balance;
        if !consistent {
            log::warn!(
                "[agents] Agent {} balance {} disagrees with ledger {}",
                slot,
                agent.balance,
                ledger_sum
            );
        }
        Ok(LedgerCheck {
            slot,
            balance: agent.balance,
            ledger_sum,
            consistent,
        })
    }

    fn charge(
        &self,
        from: Option<i64>,
        to: Option<i64>,
        amount: Usdc,
        metadata: TxMetadata,
    ) -> CoreResult<LedgerOutcome<AgentTransaction>> {
        match self.transfer(from, to, amount, metadata)? {
            Some(tx) => Ok(LedgerOutcome::Completed(tx)),
            None => {
                let balance = match from {
                    Some(slot) => self.get(slot)?.balance,
                    None => Usdc::ZERO,
                };
                Ok(LedgerOutcome::PaymentRequired(self.payment_required(amount, balance)))
            }
        }
    }

    /// Debit `from`, credit `to`, then log. `None` when the payer cannot cover it.
    fn transfer(
        &self,
        from: Option<i64>,
        to: Option<i64>,
        amount: Usdc,
        metadata: TxMetadata,
    ) -> CoreResult<Option<AgentTransaction>> {
        if let Some(payer) = from {
            if !self.db.adjust_agent_balance(payer, BalanceDelta::debit(amount))? {
                return Ok(None);
            }
        }

        if let Some(payee) = to {
            let credited = self.db.adjust_agent_balance(payee, BalanceDelta::credit(amount));
            if !matches!(credited, Ok(true)) {
                if let Some(payer) = from {
                    self.undo(payer, BalanceDelta::debit(amount));
                }
                return match credited {
                    Err(e) => Err(e.into()),
                    _ => Err(CoreError::Conflict(format!("agent {} cannot receive payments", payee))),
                };
            }
        }

        let tx = new_transaction(from, to, amount, metadata);
        if let Err(e) = self.db.insert_agent_transaction(&tx) {
            log::error!("[agents] Failed to log {} of {}: {}", tx.tx_type, amount, e);
            if let Some(payer) = from {
                self.undo(payer, BalanceDelta::debit(amount));
            }
            if let Some(payee) = to {
                self.undo(payee, BalanceDelta::credit(amount));
            }
            return Err(CoreError::Unavailable(format!("could not record {}", tx.tx_type)));
        }

        log::debug!("[agents] {} {} {:?} -> {:?}", tx.tx_type, amount, from, to);
        Ok(Some(tx))
    }

    fn undo(&self, slot: i64, applied: BalanceDelta) {
        match self.db.adjust_agent_balance(slot, applied.reversed()) {
            Ok(true) => {}
            Ok(false) => log::error!("[agents] Reversal refused for agent {}: {:?}", slot, applied),
            Err(e) => log::error!("[agents] Reversal failed for agent {}: {}", slot, e),
        }
    }

    fn payment_required(&self, price: Usdc, balance: Usdc) -> PaymentRequired {
        PaymentRequired {
            price,
            currency: "USDC".to_string(),
            pay_to: self.settings.treasury_address.clone(),
            network: self.settings.network.clone(),
            balance,
        }
    }
}

fn ensure_owned(agent: &AgentAccount) -> CoreResult<()> {
    if !agent.status.is_owned() {
        return Err(CoreError::Conflict(format!("agent {} is not claimed", agent.slot)));
    }
    Ok(())
}

fn new_transaction(from: Option<i64>, to: Option<i64>, amount: Usdc, metadata: TxMetadata) -> AgentTransaction {
    AgentTransaction {
        id: uuid::Uuid::new_v4().to_string(),
        from_agent: from,
        to_agent: to,
        amount,
        tx_type: metadata.tx_type(),
        status: TxStatus::Completed,
        metadata,
        created_at: Utc::now(),
    }
}
