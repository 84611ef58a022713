use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::domain_types::Usdc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetType {
    Event,
    Location,
    FeaturedEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SponsorshipStatus {
    Pending,
    Verified,
    Rejected,
}

impl SponsorshipStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SponsorshipStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Sponsorship {
    pub id: String,
    pub sponsor_identity: String,
    pub target_type: TargetType,
    pub target_id: String,
    pub amount: Usdc,
    pub tx_reference: String,
    pub status: SponsorshipStatus,
    pub confirmed_amount: Option<Usdc>,
    pub rejection_reason: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Set once the verified side effects (totals, bonus) have landed
    #[serde(skip)]
    pub effects_applied: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitSponsorshipRequest {
    pub target_type: String,
    pub target_id: String,
    pub amount: Usdc,
    pub tx_reference: String,
}

/// Accumulated verified sponsorship for one target
#[derive(Debug, Clone, Serialize)]
pub struct SponsorTotal {
    pub target_type: TargetType,
    pub target_id: String,
    pub total: Usdc,
    pub sponsorship_count: i64,
}
