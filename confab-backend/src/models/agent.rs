use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::domain_types::Usdc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentStatus {
    Open,
    Reserved,
    Claimed,
    Active,
}

impl AgentStatus {
    /// Claimed and active slots can hold balance and transact
    pub fn is_owned(&self) -> bool {
        matches!(self, AgentStatus::Claimed | AgentStatus::Active)
    }
}

/// One slot in the fixed agent pool
#[derive(Debug, Clone, Serialize)]
pub struct AgentAccount {
    pub slot: i64,
    pub owner_identity: Option<String>,
    pub display_name: Option<String>,
    pub status: AgentStatus,
    pub balance: Usdc,
    pub total_earned: Usdc,
    pub total_spent: Usdc,
    pub skills: Vec<String>,
    #[serde(skip)]
    pub version: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AgentAccount {
    pub fn has_skill(&self, slug: &str) -> bool {
        self.skills.iter().any(|s| s == slug)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TxType {
    Seed,
    SkillPurchase,
    EventBoost,
    Recommendation,
    Tip,
    Prize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TxStatus {
    Completed,
}

/// How a skill purchase was paid for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum Settlement {
    Balance,
    External { tx_reference: String },
}

/// Per-type transaction details; the type column is derived from the variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxMetadata {
    Seed { owner_identity: String },
    SkillPurchase { skill: String, settlement: Settlement },
    EventBoost { event_id: String },
    Recommendation { requester_slot: i64, target_slot: i64 },
    Tip { note: Option<String> },
    Prize { reason: String },
}

impl TxMetadata {
    pub fn tx_type(&self) -> TxType {
        match self {
            TxMetadata::Seed { .. } => TxType::Seed,
            TxMetadata::SkillPurchase { .. } => TxType::SkillPurchase,
            TxMetadata::EventBoost { .. } => TxType::EventBoost,
            TxMetadata::Recommendation { .. } => TxType::Recommendation,
            TxMetadata::Tip { .. } => TxType::Tip,
            TxMetadata::Prize { .. } => TxType::Prize,
        }
    }
}

/// Append-only audit row; credits land on `to_agent`, debits leave `from_agent`
#[derive(Debug, Clone, Serialize)]
pub struct AgentTransaction {
    pub id: String,
    pub from_agent: Option<i64>,
    pub to_agent: Option<i64>,
    pub amount: Usdc,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub metadata: TxMetadata,
    pub created_at: DateTime<Utc>,
}

/// Catalog entry for a purchasable skill
#[derive(Debug, Clone, Serialize)]
pub struct Skill {
    pub slug: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub price: Usdc,
}

/// HTTP-402 style answer: what to pay, in what, to whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRequired {
    pub price: Usdc,
    pub currency: String,
    pub pay_to: String,
    pub network: String,
    pub balance: Usdc,
}

/// Result of comparing an agent's balance with its transaction log
#[derive(Debug, Clone, Serialize)]
pub struct LedgerCheck {
    pub slot: i64,
    pub balance: Usdc,
    pub ledger_sum: Usdc,
    pub consistent: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimAgentRequest {
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseSkillRequest {
    pub skill: String,
    /// Transaction hash paying the treasury directly
    pub payment_tx: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoostEventRequest {
    pub event_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendRequest {
    pub target_slot: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TipRequest {
    pub to_slot: i64,
    pub amount: Usdc,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrizeRequest {
    pub amount: Usdc,
    pub reason: String,
}
