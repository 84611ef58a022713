//! Points account and award-event operations

use chrono::{DateTime, Utc};
use rusqlite::Result as SqliteResult;

use crate::db::sqlite::{is_constraint_violation, parse_datetime, parse_optional_date};
use crate::models::{Platform, PointsAccount};
use super::super::Database;

const ACCOUNT_COLUMNS: &str = "platform_user_id, platform, total_points, current_streak, longest_streak, \
     milestone_level, last_award_date, version, updated_at";

impl Database {
    pub fn get_points_account(&self, platform_user_id: &str) -> SqliteResult<Option<PointsAccount>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM points_accounts WHERE platform_user_id = ?1",
            ACCOUNT_COLUMNS
        ))?;

        match stmt.query_row([platform_user_id], Self::row_to_points_account) {
            Ok(account) => Ok(Some(account)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create the account row if missing (lazy creation on first award)
    pub fn ensure_points_account(&self, platform_user_id: &str, platform: Platform) -> SqliteResult<()> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO points_accounts (platform_user_id, platform, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            rusqlite::params![platform_user_id, platform.as_ref(), now],
        )?;
        Ok(())
    }

    /// Write the new account state if nobody else wrote since `expected_version`.
    /// Returns false on a lost race; the caller re-reads and retries.
    pub fn update_points_account(&self, account: &PointsAccount, expected_version: i64) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let last_award_date = account.last_award_date.map(|d| d.format("%Y-%m-%d").to_string());
        let rows = conn.execute(
            "UPDATE points_accounts
             SET total_points = ?1, current_streak = ?2, longest_streak = ?3, milestone_level = ?4,
                 last_award_date = ?5, version = version + 1, updated_at = ?6
             WHERE platform_user_id = ?7 AND version = ?8",
            rusqlite::params![
                account.total_points,
                account.current_streak,
                account.longest_streak,
                account.milestone_level,
                last_award_date,
                now,
                account.platform_user_id,
                expected_version,
            ],
        )?;
        Ok(rows > 0)
    }

    /// Fetch several accounts at once (missing ones are simply absent)
    pub fn list_points_accounts(&self, platform_user_ids: &[String]) -> SqliteResult<Vec<PointsAccount>> {
        if platform_user_ids.is_empty() {
            return Ok(vec![]);
        }

        let placeholders: Vec<String> = platform_user_ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM points_accounts WHERE platform_user_id IN ({}) ORDER BY platform_user_id",
            ACCOUNT_COLUMNS,
            placeholders.join(", ")
        ))?;

        let accounts = stmt
            .query_map(
                rusqlite::params_from_iter(platform_user_ids.iter()),
                Self::row_to_points_account,
            )?
            .filter_map(|r| r.ok())
            .collect();

        Ok(accounts)
    }

    /// Claim an award slot. Returns the award row id, or None when the
    /// `(user, action, key)` triple was already claimed.
    pub fn try_record_award(
        &self,
        platform_user_id: &str,
        action: &str,
        award_key: &str,
        points: i64,
        awarded_at: DateTime<Utc>,
    ) -> SqliteResult<Option<i64>> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO points_awards (platform_user_id, action, award_key, points, awarded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![platform_user_id, action, award_key, points, awarded_at.to_rfc3339()],
        );

        match result {
            Ok(_) => Ok(Some(conn.last_insert_rowid())),
            Err(e) if is_constraint_violation(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Release an award claim whose account update failed
    pub fn delete_award(&self, award_id: i64) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM points_awards WHERE id = ?1", [award_id])?;
        Ok(())
    }

    /// Most recent award instant for an action (used by cooldown actions)
    pub fn last_award_at(&self, platform_user_id: &str, action: &str) -> SqliteResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT awarded_at FROM points_awards WHERE platform_user_id = ?1 AND action = ?2
             ORDER BY awarded_at DESC LIMIT 1",
        )?;

        let last: Option<String> = stmt.query_row([platform_user_id, action], |row| row.get(0)).ok();
        Ok(last.map(|s| parse_datetime(&s)))
    }

    fn row_to_points_account(row: &rusqlite::Row) -> rusqlite::Result<PointsAccount> {
        let platform_str: String = row.get(1)?;
        let updated_at_str: String = row.get(8)?;

        let platform = platform_str.parse::<Platform>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(PointsAccount {
            platform_user_id: row.get(0)?,
            platform,
            total_points: row.get(2)?,
            current_streak: row.get(3)?,
            longest_streak: row.get(4)?,
            milestone_level: row.get(5)?,
            last_award_date: parse_optional_date(row.get(6)?),
            version: row.get(7)?,
            updated_at: parse_datetime(&updated_at_str),
        })
    }
}
