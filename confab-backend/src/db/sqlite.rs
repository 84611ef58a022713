//! SQLite database - schema definitions and connection management
//!
//! This file contains:
//! - Database struct definition
//! - Connection management (new, init)
//! - Schema creation
//!
//! All table operations are in the tables/ subdirectory. Every operation there
//! is a single statement touching a single row, or a read; there are no
//! multi-row transactions, so the services above must tolerate interleaving.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;

/// Main database wrapper around a single shared connection
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    /// Create a new database connection and initialize schema
    pub fn new(database_url: &str) -> SqliteResult<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = Path::new(database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(database_url)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// In-memory database for tests
    #[cfg(test)]
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("open in-memory database");
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init().expect("initialize schema");
        db
    }

    /// Initialize all database tables
    fn init(&self) -> SqliteResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // Auth sessions table (bearer tokens)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT UNIQUE NOT NULL,
                platform_user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            [],
        )?;

        // Auth challenges table for wallet sign-in
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_challenges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                public_address TEXT UNIQUE NOT NULL,
                challenge TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Identities - one row per platform account, grouped by canonical_id
        conn.execute(
            "CREATE TABLE IF NOT EXISTS identities (
                platform_user_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                canonical_id TEXT NOT NULL,
                display_name TEXT,
                external_auth_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_identities_canonical ON identities(canonical_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_identities_external_auth ON identities(external_auth_id)",
            [],
        )?;

        // Points accounts - one row per platform account, never per canonical id
        conn.execute(
            "CREATE TABLE IF NOT EXISTS points_accounts (
                platform_user_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                total_points INTEGER NOT NULL DEFAULT 0 CHECK (total_points >= 0),
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                milestone_level INTEGER NOT NULL DEFAULT 1,
                last_award_date TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (longest_streak >= current_streak)
            )",
            [],
        )?;

        // Award events - the unique key is the eligibility claim
        conn.execute(
            "CREATE TABLE IF NOT EXISTS points_awards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                platform_user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                award_key TEXT NOT NULL,
                points INTEGER NOT NULL,
                awarded_at TEXT NOT NULL,
                UNIQUE(platform_user_id, action, award_key)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_points_awards_recent ON points_awards(platform_user_id, action, awarded_at)",
            [],
        )?;

        // Sponsorships - pending until the chain confirms or refutes the transfer
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sponsorships (
                id TEXT PRIMARY KEY,
                sponsor_identity TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                amount_micros INTEGER NOT NULL CHECK (amount_micros > 0),
                tx_reference TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                confirmed_micros INTEGER,
                rejection_reason TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                verified_at TEXT,
                effects_applied INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sponsorships_featured ON sponsorships(target_type, status, confirmed_micros)",
            [],
        )?;

        // Verified sponsorship totals per target (location sponsor totals, event boosts)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sponsor_totals (
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                total_micros INTEGER NOT NULL DEFAULT 0,
                sponsorship_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (target_type, target_id)
            )",
            [],
        )?;

        // Agent pool - fixed slots created at deployment
        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_accounts (
                slot INTEGER PRIMARY KEY,
                owner_identity TEXT UNIQUE,
                display_name TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                balance_micros INTEGER NOT NULL DEFAULT 0 CHECK (balance_micros >= 0),
                total_earned_micros INTEGER NOT NULL DEFAULT 0,
                total_spent_micros INTEGER NOT NULL DEFAULT 0,
                skills TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Agent transactions - append-only audit log
        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_transactions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                from_agent INTEGER,
                to_agent INTEGER,
                amount_micros INTEGER NOT NULL CHECK (amount_micros > 0),
                tx_type TEXT NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (from_agent) REFERENCES agent_accounts(slot),
                FOREIGN KEY (to_agent) REFERENCES agent_accounts(slot)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_tx_from ON agent_transactions(from_agent)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_tx_to ON agent_transactions(to_agent)",
            [],
        )?;

        // Every on-chain transfer already spent, by sponsorships or agent purchases
        conn.execute(
            "CREATE TABLE IF NOT EXISTS external_payments (
                tx_reference TEXT PRIMARY KEY,
                purpose TEXT NOT NULL,
                slot INTEGER,
                amount_micros INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // RSVPs and check-ins written by the activity handlers
        conn.execute(
            "CREATE TABLE IF NOT EXISTS rsvps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                title TEXT NOT NULL,
                starts_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(canonical_id, event_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_id TEXT NOT NULL,
                location_id TEXT NOT NULL,
                checked_in_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkins_canonical ON checkins(canonical_id, checked_in_at)",
            [],
        )?;

        Ok(())
    }
}

/// Parse an RFC 3339 column, falling back to now for malformed rows
pub(crate) fn parse_datetime(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_optional_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

pub(crate) fn parse_optional_date(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

/// True when the error is a UNIQUE / CHECK constraint refusal
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("confab.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::new(path).unwrap();
            db.seed_agent_slots(3).unwrap();
        }

        // Schema creation is idempotent and data survives a reopen
        let db = Database::new(path).unwrap();
        assert_eq!(db.seed_agent_slots(3).unwrap(), 0);
        assert!(db.get_agent(3).unwrap().is_some());
    }
}
