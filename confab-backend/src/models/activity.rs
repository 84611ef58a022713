//! Activity rows written by the RSVP / check-in / chat handlers.
//! The core only reads them back for agent recommendations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledEvent {
    pub event_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checkin {
    pub location_id: String,
    pub checked_in_at: DateTime<Utc>,
}

/// The paid product returned by an agent recommendation
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub agent_slot: i64,
    pub agent_name: Option<String>,
    pub upcoming: Vec<ScheduledEvent>,
    pub latest_checkin: Option<Checkin>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RsvpRequest {
    pub event_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckinRequest {
    pub location_id: String,
}
