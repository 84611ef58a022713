use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::identity::Platform;

/// Points state for a single platform account
#[derive(Debug, Clone, Serialize)]
pub struct PointsAccount {
    pub platform_user_id: String,
    pub platform: Platform,
    pub total_points: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub milestone_level: i64,
    pub last_award_date: Option<NaiveDate>,
    #[serde(skip)]
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl PointsAccount {
    pub fn empty(platform_user_id: &str, platform: Platform) -> Self {
        Self {
            platform_user_id: platform_user_id.to_string(),
            platform,
            total_points: 0,
            current_streak: 0,
            longest_streak: 0,
            milestone_level: 1,
            last_award_date: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Extra information an award caller may attach
#[derive(Debug, Clone, Default)]
pub struct AwardContext {
    /// Deduplication key for per-key and uncapped actions (event id, replay stamp)
    pub idempotency_key: Option<String>,
    /// When the action happened; defaults to now
    pub occurred_at: Option<DateTime<Utc>>,
}

impl AwardContext {
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            occurred_at: None,
        }
    }

    pub fn at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            idempotency_key: None,
            occurred_at: Some(occurred_at),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AwardResult {
    pub awarded: bool,
    pub points: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformPoints {
    pub platform: Platform,
    pub platform_user_id: String,
    pub points: i64,
    pub streak: i64,
    pub level: i64,
}

/// Points for a person, aggregated over every linked platform account
#[derive(Debug, Clone, Serialize)]
pub struct PointsSummary {
    pub canonical_id: String,
    pub points: i64,
    pub streak: i64,
    pub longest_streak: i64,
    pub level: i64,
    pub breakdown: Vec<PlatformPoints>,
}

/// An interaction recorded on the client before the user authenticated
#[derive(Debug, Clone, Deserialize)]
pub struct PendingAction {
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimPendingResult {
    pub claimed: i64,
    pub total: i64,
}
