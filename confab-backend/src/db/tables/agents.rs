//! Agent pool, agent transaction log, and consumed payment proofs
//!
//! Balance changes go through `update_agent_state` (compare-and-swap on
//! version) or `adjust_agent_balance` (guarded atomic increment). Neither can
//! drive a balance negative.

use chrono::Utc;
use rusqlite::Result as SqliteResult;

use crate::db::sqlite::{is_constraint_violation, parse_datetime, parse_optional_datetime};
use crate::domain_types::Usdc;
use crate::models::{AgentAccount, AgentStatus, AgentTransaction, TxMetadata, TxStatus, TxType};
use super::super::Database;

const AGENT_COLUMNS: &str = "slot, owner_identity, display_name, status, balance_micros, total_earned_micros, \
     total_spent_micros, skills, version, claimed_at, updated_at";

/// Signed deltas applied to one agent row in a single statement
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceDelta {
    pub balance: i64,
    pub earned: i64,
    pub spent: i64,
}

impl BalanceDelta {
    pub fn credit(amount: Usdc) -> Self {
        Self { balance: amount.micros(), earned: amount.micros(), spent: 0 }
    }

    pub fn debit(amount: Usdc) -> Self {
        Self { balance: -amount.micros(), earned: 0, spent: amount.micros() }
    }

    /// The delta that undoes this one
    pub fn reversed(self) -> Self {
        Self { balance: -self.balance, earned: -self.earned, spent: -self.spent }
    }
}

impl Database {
    /// Create the fixed slot pool. Existing slots are left untouched.
    pub fn seed_agent_slots(&self, count: i64) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let mut created = 0;
        for slot in 1..=count {
            created += conn.execute(
                "INSERT OR IGNORE INTO agent_accounts (slot, status, updated_at) VALUES (?1, 'open', ?2)",
                rusqlite::params![slot, now],
            )?;
        }
        Ok(created)
    }

    pub fn get_agent(&self, slot: i64) -> SqliteResult<Option<AgentAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM agent_accounts WHERE slot = ?1", AGENT_COLUMNS))?;

        match stmt.query_row([slot], Self::row_to_agent) {
            Ok(agent) => Ok(Some(agent)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_agent_by_owner(&self, owner_identity: &str) -> SqliteResult<Option<AgentAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agent_accounts WHERE owner_identity = ?1",
            AGENT_COLUMNS
        ))?;

        match stmt.query_row([owner_identity], Self::row_to_agent) {
            Ok(agent) => Ok(Some(agent)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list_open_slots(&self, limit: i64) -> SqliteResult<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT slot FROM agent_accounts WHERE status = 'open' ORDER BY slot ASC LIMIT ?1")?;
        let slots = stmt
            .query_map([limit], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(slots)
    }

    /// open -> claimed for one slot. Returns false if the slot was taken first.
    /// A second slot for the same owner trips the UNIQUE index and errors.
    pub fn claim_agent_slot(
        &self,
        slot: i64,
        owner_identity: &str,
        display_name: Option<&str>,
        starter_skill: &str,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let skills = serde_json::to_string(&[starter_skill]).unwrap_or_else(|_| "[]".to_string());
        let rows = conn.execute(
            "UPDATE agent_accounts
             SET status = 'claimed', owner_identity = ?1, display_name = ?2, skills = ?3,
                 claimed_at = ?4, updated_at = ?4, version = version + 1
             WHERE slot = ?5 AND status = 'open'",
            rusqlite::params![owner_identity, display_name, skills, now, slot],
        )?;
        Ok(rows > 0)
    }

    /// Hand an agent to the canonical id its owner was merged into. Returns
    /// false when there is nothing to move or the new owner already holds a
    /// slot (the UNIQUE owner index refuses the second one).
    pub fn transfer_agent_owner(&self, from_owner: &str, to_owner: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let result = conn.execute(
            "UPDATE agent_accounts SET owner_identity = ?1, version = version + 1, updated_at = ?2
             WHERE owner_identity = ?3",
            rusqlite::params![to_owner, now, from_owner],
        );

        match result {
            Ok(rows) => Ok(rows > 0),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write balance, totals, and skills if the row is still at `expected_version`
    pub fn update_agent_state(&self, agent: &AgentAccount, expected_version: i64) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let skills = serde_json::to_string(&agent.skills).unwrap_or_else(|_| "[]".to_string());
        let result = conn.execute(
            "UPDATE agent_accounts
             SET balance_micros = ?1, total_earned_micros = ?2, total_spent_micros = ?3, skills = ?4,
                 version = version + 1, updated_at = ?5
             WHERE slot = ?6 AND version = ?7",
            rusqlite::params![
                agent.balance.micros(),
                agent.total_earned.micros(),
                agent.total_spent.micros(),
                skills,
                now,
                agent.slot,
                expected_version,
            ],
        );

        match result {
            Ok(rows) => Ok(rows > 0),
            // CHECK (balance >= 0) refused the write
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Apply signed deltas in one statement. Refuses (returns false) when the
    /// resulting balance would be negative or overflow i64 micros, or the slot
    /// is not owned.
    pub fn adjust_agent_balance(&self, slot: i64, delta: BalanceDelta) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE agent_accounts
             SET balance_micros = balance_micros + ?1,
                 total_earned_micros = total_earned_micros + ?2,
                 total_spent_micros = total_spent_micros + ?3,
                 version = version + 1, updated_at = ?4
             WHERE slot = ?5 AND status IN ('claimed', 'active') AND balance_micros + ?1 >= 0
               AND (?1 <= 0 OR balance_micros <= 9223372036854775807 - ?1)
               AND (?2 <= 0 OR total_earned_micros <= 9223372036854775807 - ?2)",
            rusqlite::params![delta.balance, delta.earned, delta.spent, now, slot],
        )?;
        Ok(rows > 0)
    }

    pub fn insert_agent_transaction(&self, tx: &AgentTransaction) -> SqliteResult<()> {
        let conn = self.conn.lock();
        let metadata = serde_json::to_string(&tx.metadata)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        conn.execute(
            "INSERT INTO agent_transactions (id, from_agent, to_agent, amount_micros, tx_type, status, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                tx.id,
                tx.from_agent,
                tx.to_agent,
                tx.amount.micros(),
                tx.tx_type.as_ref(),
                tx.status.as_ref(),
                metadata,
                tx.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Transactions touching an agent, newest first
    pub fn list_agent_transactions(&self, slot: i64, limit: i64) -> SqliteResult<Vec<AgentTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, from_agent, to_agent, amount_micros, tx_type, status, metadata, created_at
             FROM agent_transactions
             WHERE from_agent = ?1 OR to_agent = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;

        let txs = stmt
            .query_map([slot, limit], Self::row_to_agent_transaction)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(txs)
    }

    /// Credits minus debits over the completed log for one agent
    pub fn agent_ledger_sum(&self, slot: i64) -> SqliteResult<Usdc> {
        let conn = self.conn.lock();
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(CASE WHEN to_agent = ?1 THEN amount_micros ELSE 0 END), 0)
                  - COALESCE(SUM(CASE WHEN from_agent = ?1 THEN amount_micros ELSE 0 END), 0)
             FROM agent_transactions
             WHERE status = 'completed' AND (to_agent = ?1 OR from_agent = ?1)",
            [slot],
            |row| row.get(0),
        )?;
        Ok(Usdc::from_micros(sum))
    }

    /// Mark an external payment tx as consumed. Returns false if it was already used.
    pub fn record_external_payment(
        &self,
        tx_reference: &str,
        purpose: &str,
        slot: Option<i64>,
        amount: Usdc,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO external_payments (tx_reference, purpose, slot, amount_micros, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![tx_reference, purpose, slot, amount.micros(), now],
        )?;
        Ok(rows > 0)
    }

    pub fn delete_external_payment(&self, tx_reference: &str) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM external_payments WHERE tx_reference = ?1", [tx_reference])?;
        Ok(())
    }

    fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentAccount> {
        let status_str: String = row.get(3)?;
        let skills_json: String = row.get(7)?;
        let updated_at_str: String = row.get(10)?;

        let status = status_str.parse::<AgentStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(AgentAccount {
            slot: row.get(0)?,
            owner_identity: row.get(1)?,
            display_name: row.get(2)?,
            status,
            balance: Usdc::from_micros(row.get(4)?),
            total_earned: Usdc::from_micros(row.get(5)?),
            total_spent: Usdc::from_micros(row.get(6)?),
            skills: serde_json::from_str(&skills_json).unwrap_or_default(),
            version: row.get(8)?,
            claimed_at: parse_optional_datetime(row.get(9)?),
            updated_at: parse_datetime(&updated_at_str),
        })
    }

    fn row_to_agent_transaction(row: &rusqlite::Row) -> rusqlite::Result<AgentTransaction> {
        let tx_type_str: String = row.get(4)?;
        let status_str: String = row.get(5)?;
        let metadata_json: String = row.get(6)?;
        let created_at_str: String = row.get(7)?;

        let tx_type = tx_type_str.parse::<TxType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let status = status_str.parse::<TxStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let metadata: TxMetadata = serde_json::from_str(&metadata_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(AgentTransaction {
            id: row.get(0)?,
            from_agent: row.get(1)?,
            to_agent: row.get(2)?,
            amount: Usdc::from_micros(row.get(3)?),
            tx_type,
            status,
            metadata,
            created_at: parse_datetime(&created_at_str),
        })
    }
}
