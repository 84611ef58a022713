//! Session and sign-in challenge database operations

use chrono::{Duration, Utc};
use rusqlite::Result as SqliteResult;

use crate::db::sqlite::parse_datetime;
use crate::models::Session;
use super::super::Database;

impl Database {
    /// Store (or replace) the sign-in challenge for a wallet address
    pub fn create_or_update_challenge(&self, public_address: &str, challenge: &str) -> SqliteResult<()> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO auth_challenges (public_address, challenge, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(public_address) DO UPDATE SET challenge = excluded.challenge, created_at = excluded.created_at",
            [public_address, challenge, &now],
        )?;
        Ok(())
    }

    pub fn get_challenge(&self, public_address: &str) -> SqliteResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT challenge FROM auth_challenges WHERE public_address = ?1")?;
        let challenge = stmt.query_row([public_address], |row| row.get(0)).ok();
        Ok(challenge)
    }

    pub fn delete_challenge(&self, public_address: &str) -> SqliteResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM auth_challenges WHERE public_address = ?1", [public_address])?;
        Ok(())
    }

    /// Issue a new bearer token for a platform account
    pub fn create_session(&self, platform_user_id: &str, ttl_hours: i64) -> SqliteResult<Session> {
        let token = hex::encode(rand::random::<[u8; 32]>());
        let created_at = Utc::now();
        let expires_at = created_at + Duration::hours(ttl_hours);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO auth_sessions (token, platform_user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![&token, platform_user_id, created_at.to_rfc3339(), expires_at.to_rfc3339()],
        )?;

        Ok(Session {
            id: conn.last_insert_rowid(),
            token,
            platform_user_id: platform_user_id.to_string(),
            created_at,
            expires_at,
        })
    }

    /// Return the session if the token exists and has not expired
    pub fn validate_session(&self, token: &str) -> SqliteResult<Option<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, token, platform_user_id, created_at, expires_at FROM auth_sessions WHERE token = ?1",
        )?;

        let session = stmt
            .query_row([token], |row| {
                let created_at: String = row.get(3)?;
                let expires_at: String = row.get(4)?;
                Ok(Session {
                    id: row.get(0)?,
                    token: row.get(1)?,
                    platform_user_id: row.get(2)?,
                    created_at: parse_datetime(&created_at),
                    expires_at: parse_datetime(&expires_at),
                })
            })
            .ok();

        Ok(session.filter(|s| s.expires_at > Utc::now()))
    }

    pub fn delete_session(&self, token: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM auth_sessions WHERE token = ?1", [token])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_round_trip_and_logout() {
        let db = Database::in_memory();
        let session = db.create_session("telegram_42", 1).unwrap();
        assert_eq!(session.token.len(), 64);

        let found = db.validate_session(&session.token).unwrap().unwrap();
        assert_eq!(found.platform_user_id, "telegram_42");

        assert!(db.delete_session(&session.token).unwrap());
        assert!(db.validate_session(&session.token).unwrap().is_none());
    }

    #[test]
    fn test_expired_session_is_rejected() {
        let db = Database::in_memory();
        let session = db.create_session("web_0xabc", -1).unwrap();
        assert!(db.validate_session(&session.token).unwrap().is_none());
    }

    #[test]
    fn test_challenge_is_replaced() {
        let db = Database::in_memory();
        db.create_or_update_challenge("0xabc", "first").unwrap();
        db.create_or_update_challenge("0xabc", "second").unwrap();
        assert_eq!(db.get_challenge("0xabc").unwrap().as_deref(), Some("second"));
        db.delete_challenge("0xabc").unwrap();
        assert!(db.get_challenge("0xabc").unwrap().is_none());
    }
}
