//! Identity row operations
//!
//! Rows are only ever inserted or patched one at a time; a merge is a series
//! of these calls made by the resolver.

use chrono::Utc;
use rusqlite::Result as SqliteResult;

use crate::db::sqlite::parse_datetime;
use crate::models::{Identity, Platform};
use super::super::Database;

const IDENTITY_COLUMNS: &str =
    "platform_user_id, platform, canonical_id, display_name, external_auth_id, created_at, updated_at";

impl Database {
    /// Get an identity by its platform-scoped user id
    pub fn get_identity(&self, platform_user_id: &str) -> SqliteResult<Option<Identity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM identities WHERE platform_user_id = ?1",
            IDENTITY_COLUMNS
        ))?;

        match stmt.query_row([platform_user_id], Self::row_to_identity) {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert a new identity row. Returns false if the row already existed
    /// (a concurrent login got there first).
    pub fn insert_identity(&self, identity: &Identity) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO identities (platform_user_id, platform, canonical_id, display_name, external_auth_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                identity.platform_user_id,
                identity.platform.as_ref(),
                identity.canonical_id,
                identity.display_name,
                identity.external_auth_id,
                identity.created_at.to_rfc3339(),
                identity.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(rows > 0)
    }

    /// All identities that the external auth provider has tagged with this id
    pub fn find_identities_by_external_auth(&self, external_auth_id: &str) -> SqliteResult<Vec<Identity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM identities WHERE external_auth_id = ?1 ORDER BY created_at ASC, platform_user_id ASC",
            IDENTITY_COLUMNS
        ))?;

        let identities = stmt
            .query_map([external_auth_id], Self::row_to_identity)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(identities)
    }

    /// All member identities of a canonical id, oldest first
    pub fn list_identities_by_canonical(&self, canonical_id: &str) -> SqliteResult<Vec<Identity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM identities WHERE canonical_id = ?1 ORDER BY created_at ASC, platform_user_id ASC",
            IDENTITY_COLUMNS
        ))?;

        let identities = stmt
            .query_map([canonical_id], Self::row_to_identity)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(identities)
    }

    /// Re-point one identity to a new canonical id, only if it still points at
    /// `expected_canonical`. Returns false when another writer moved it first.
    pub fn repoint_identity(
        &self,
        platform_user_id: &str,
        expected_canonical: &str,
        new_canonical: &str,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE identities SET canonical_id = ?1, updated_at = ?2 WHERE platform_user_id = ?3 AND canonical_id = ?4",
            rusqlite::params![new_canonical, now, platform_user_id, expected_canonical],
        )?;
        Ok(rows > 0)
    }

    /// Tag an identity with the external auth id that co-owns it (first writer wins)
    pub fn set_identity_external_auth(&self, platform_user_id: &str, external_auth_id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE identities SET external_auth_id = ?1, updated_at = ?2 WHERE platform_user_id = ?3 AND external_auth_id IS NULL",
            rusqlite::params![external_auth_id, now, platform_user_id],
        )?;
        Ok(rows > 0)
    }

    pub fn update_identity_display_name(&self, platform_user_id: &str, display_name: &str) -> SqliteResult<()> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE identities SET display_name = ?1, updated_at = ?2 WHERE platform_user_id = ?3",
            rusqlite::params![display_name, now, platform_user_id],
        )?;
        Ok(())
    }

    fn row_to_identity(row: &rusqlite::Row) -> rusqlite::Result<Identity> {
        let platform_str: String = row.get(1)?;
        let created_at_str: String = row.get(5)?;
        let updated_at_str: String = row.get(6)?;

        let platform = platform_str.parse::<Platform>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Identity {
            platform_user_id: row.get(0)?,
            platform,
            canonical_id: row.get(2)?,
            display_name: row.get(3)?,
            external_auth_id: row.get(4)?,
            created_at: parse_datetime(&created_at_str),
            updated_at: parse_datetime(&updated_at_str),
        })
    }
}
