//! RSVP and check-in rows

use chrono::{DateTime, Utc};
use rusqlite::Result as SqliteResult;

use crate::db::sqlite::parse_datetime;
use crate::models::{Checkin, ScheduledEvent};
use super::super::Database;

impl Database {
    /// Record an RSVP. Returns false if this person already RSVP'd to the event.
    pub fn record_rsvp(&self, canonical_id: &str, event: &ScheduledEvent) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO rsvps (canonical_id, event_id, title, starts_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![canonical_id, event.event_id, event.title, event.starts_at.to_rfc3339(), now],
        )?;
        Ok(rows > 0)
    }

    pub fn record_checkin(&self, canonical_id: &str, location_id: &str, at: DateTime<Utc>) -> SqliteResult<Checkin> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO checkins (canonical_id, location_id, checked_in_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![canonical_id, location_id, at.to_rfc3339()],
        )?;
        Ok(Checkin {
            location_id: location_id.to_string(),
            checked_in_at: at,
        })
    }

    /// Move a merged-away canonical id's RSVPs and check-ins to the surviving
    /// one. An RSVP the survivor already holds is dropped as a duplicate.
    pub fn move_activity(&self, from_canonical: &str, to_canonical: &str) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        let mut moved = conn.execute(
            "UPDATE OR IGNORE rsvps SET canonical_id = ?1 WHERE canonical_id = ?2",
            [to_canonical, from_canonical],
        )?;
        conn.execute("DELETE FROM rsvps WHERE canonical_id = ?1", [from_canonical])?;
        moved += conn.execute(
            "UPDATE checkins SET canonical_id = ?1 WHERE canonical_id = ?2",
            [to_canonical, from_canonical],
        )?;
        Ok(moved)
    }

    /// RSVP'd events starting after `now`, soonest first
    pub fn upcoming_rsvps(&self, canonical_id: &str, now: DateTime<Utc>, limit: i64) -> SqliteResult<Vec<ScheduledEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, title, starts_at FROM rsvps
             WHERE canonical_id = ?1 AND starts_at > ?2
             ORDER BY starts_at ASC
             LIMIT ?3",
        )?;

        let events = stmt
            .query_map(rusqlite::params![canonical_id, now.to_rfc3339(), limit], |row| {
                let starts_at: String = row.get(2)?;
                Ok(ScheduledEvent {
                    event_id: row.get(0)?,
                    title: row.get(1)?,
                    starts_at: parse_datetime(&starts_at),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(events)
    }

    pub fn latest_checkin(&self, canonical_id: &str) -> SqliteResult<Option<Checkin>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT location_id, checked_in_at FROM checkins WHERE canonical_id = ?1
             ORDER BY checked_in_at DESC LIMIT 1",
        )?;

        match stmt.query_row([canonical_id], |row| {
            let at: String = row.get(1)?;
            Ok(Checkin {
                location_id: row.get(0)?,
                checked_in_at: parse_datetime(&at),
            })
        }) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_upcoming_rsvps_skip_past_and_duplicates() {
        let db = Database::in_memory();
        let now = Utc::now();
        let past = ScheduledEvent { event_id: "e1".into(), title: "Breakfast".into(), starts_at: now - Duration::hours(2) };
        let later = ScheduledEvent { event_id: "e2".into(), title: "Keynote".into(), starts_at: now + Duration::hours(3) };
        let soon = ScheduledEvent { event_id: "e3".into(), title: "Panel".into(), starts_at: now + Duration::hours(1) };

        assert!(db.record_rsvp("c1", &past).unwrap());
        assert!(db.record_rsvp("c1", &later).unwrap());
        assert!(db.record_rsvp("c1", &soon).unwrap());
        assert!(!db.record_rsvp("c1", &soon).unwrap());

        let upcoming = db.upcoming_rsvps("c1", now, 10).unwrap();
        let ids: Vec<&str> = upcoming.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e2"]);
    }

    #[test]
    fn test_latest_checkin() {
        let db = Database::in_memory();
        assert!(db.latest_checkin("c1").unwrap().is_none());

        let now = Utc::now();
        db.record_checkin("c1", "hall-a", now - Duration::minutes(30)).unwrap();
        db.record_checkin("c1", "hall-b", now).unwrap();

        assert_eq!(db.latest_checkin("c1").unwrap().unwrap().location_id, "hall-b");
    }
}
