//! Sponsorship rows and verified sponsor totals
//!
//! Status transitions are conditional updates on the current status, so two
//! verifiers racing on one row can only move it once.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Result as SqliteResult};

use crate::db::sqlite::{parse_datetime, parse_optional_datetime};
use crate::domain_types::Usdc;
use crate::models::{SponsorTotal, Sponsorship, SponsorshipStatus, TargetType};
use super::super::Database;

const SPONSORSHIP_COLUMNS: &str = "id, sponsor_identity, target_type, target_id, amount_micros, tx_reference, \
     status, confirmed_micros, rejection_reason, attempts, created_at, updated_at, verified_at, effects_applied";

impl Database {
    pub fn insert_sponsorship(&self, sponsorship: &Sponsorship) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sponsorships (id, sponsor_identity, target_type, target_id, amount_micros, tx_reference,
                                       status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
            rusqlite::params![
                sponsorship.id,
                sponsorship.sponsor_identity,
                sponsorship.target_type.as_ref(),
                sponsorship.target_id,
                sponsorship.amount.micros(),
                sponsorship.tx_reference,
                sponsorship.status.as_ref(),
                sponsorship.created_at.to_rfc3339(),
                sponsorship.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_sponsorship(&self, id: &str) -> SqliteResult<Option<Sponsorship>> {
        self.query_one_sponsorship("id = ?1", id)
    }

    pub fn get_sponsorship_by_tx(&self, tx_reference: &str) -> SqliteResult<Option<Sponsorship>> {
        self.query_one_sponsorship("tx_reference = ?1", tx_reference)
    }

    fn query_one_sponsorship(&self, predicate: &str, value: &str) -> SqliteResult<Option<Sponsorship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sponsorships WHERE {}",
            SPONSORSHIP_COLUMNS, predicate
        ))?;

        match stmt.query_row([value], Self::row_to_sponsorship) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// pending -> verified. Returns false if the row was no longer pending.
    pub fn mark_sponsorship_verified(
        &self,
        id: &str,
        confirmed: Usdc,
        verified_at: DateTime<Utc>,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE sponsorships SET status = 'verified', confirmed_micros = ?1, verified_at = ?2, updated_at = ?2,
                                     rejection_reason = NULL
             WHERE id = ?3 AND status = 'pending'",
            rusqlite::params![confirmed.micros(), verified_at.to_rfc3339_opts(SecondsFormat::Micros, true), id],
        )?;
        Ok(rows > 0)
    }

    /// pending -> rejected. Returns false if the row was no longer pending.
    pub fn mark_sponsorship_rejected(&self, id: &str, reason: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE sponsorships SET status = 'rejected', rejection_reason = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            rusqlite::params![reason, now, id],
        )?;
        Ok(rows > 0)
    }

    /// Operator path: rejected -> pending so the row can be verified again
    pub fn reopen_sponsorship(&self, id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE sponsorships SET status = 'pending', rejection_reason = NULL, attempts = 0, updated_at = ?1
             WHERE id = ?2 AND status = 'rejected'",
            rusqlite::params![now, id],
        )?;
        Ok(rows > 0)
    }

    pub fn record_verification_attempt(&self, id: &str) -> SqliteResult<()> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE sponsorships SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
        Ok(())
    }

    /// Rows the verifier still owes work: pending ones, and verified ones whose
    /// side effects never landed. Oldest first (re-queued on startup).
    pub fn list_unsettled_sponsorships(&self, limit: i64) -> SqliteResult<Vec<Sponsorship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sponsorships
             WHERE status = 'pending' OR (status = 'verified' AND effects_applied = 0)
             ORDER BY created_at ASC LIMIT ?1",
            SPONSORSHIP_COLUMNS
        ))?;

        let rows = stmt
            .query_map([limit], Self::row_to_sponsorship)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(rows)
    }

    /// Highest verified featured-event bid; ties go to the earliest verification.
    /// `verified_at` is written with fixed microsecond precision so it sorts as text.
    pub fn top_featured_sponsorship(&self) -> SqliteResult<Option<Sponsorship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sponsorships
             WHERE target_type = 'featured_event' AND status = 'verified'
             ORDER BY confirmed_micros DESC, verified_at ASC, rowid ASC
             LIMIT 1",
            SPONSORSHIP_COLUMNS
        ))?;

        match stmt.query_row([], Self::row_to_sponsorship) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Claim the side effects of a verified sponsorship and, for targets that
    /// keep a running total, add `total` in the same transaction. Returns false
    /// when they were already applied; a failure leaves the claim unset.
    pub fn settle_sponsorship_effects(
        &self,
        id: &str,
        total: Option<(TargetType, &str, Usdc)>,
    ) -> SqliteResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let claimed = tx.execute(
            "UPDATE sponsorships SET effects_applied = 1
             WHERE id = ?1 AND status = 'verified' AND effects_applied = 0",
            [id],
        )?;
        if claimed == 0 {
            return Ok(false);
        }
        if let Some((target_type, target_id, amount)) = total {
            add_sponsor_total(&tx, target_type, target_id, amount)?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get_sponsor_total(&self, target_type: TargetType, target_id: &str) -> SqliteResult<SponsorTotal> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT total_micros, sponsorship_count FROM sponsor_totals WHERE target_type = ?1 AND target_id = ?2",
        )?;

        let (total, count) = stmt
            .query_row([target_type.as_ref(), target_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .unwrap_or((0, 0));

        Ok(SponsorTotal {
            target_type,
            target_id: target_id.to_string(),
            total: Usdc::from_micros(total),
            sponsorship_count: count,
        })
    }

    fn row_to_sponsorship(row: &rusqlite::Row) -> rusqlite::Result<Sponsorship> {
        let target_type_str: String = row.get(2)?;
        let status_str: String = row.get(6)?;
        let created_at_str: String = row.get(10)?;
        let updated_at_str: String = row.get(11)?;

        let target_type = target_type_str.parse::<TargetType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let status = status_str.parse::<SponsorshipStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Sponsorship {
            id: row.get(0)?,
            sponsor_identity: row.get(1)?,
            target_type,
            target_id: row.get(3)?,
            amount: Usdc::from_micros(row.get(4)?),
            tx_reference: row.get(5)?,
            status,
            confirmed_amount: row.get::<_, Option<i64>>(7)?.map(Usdc::from_micros),
            rejection_reason: row.get(8)?,
            attempts: row.get(9)?,
            created_at: parse_datetime(&created_at_str),
            updated_at: parse_datetime(&updated_at_str),
            verified_at: parse_optional_datetime(row.get(12)?),
            effects_applied: row.get::<_, i64>(13)? != 0,
        })
    }
}

fn add_sponsor_total(conn: &Connection, target_type: TargetType, target_id: &str, amount: Usdc) -> SqliteResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sponsor_totals (target_type, target_id, total_micros, sponsorship_count, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(target_type, target_id) DO UPDATE SET
            total_micros = total_micros + excluded.total_micros,
            sponsorship_count = sponsorship_count + 1,
            updated_at = excluded.updated_at",
        rusqlite::params![target_type.as_ref(), target_id, amount.micros(), now],
    )?;
    Ok(())
}
