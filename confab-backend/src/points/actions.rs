//! Reward table and eligibility rules per action

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::models::AwardContext;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    DailyLogin,
    VerificationComplete,
    AccountLinked,
    ProfileComplete,
    Rsvp,
    Checkin,
    Message,
    Share,
    AgentClaimed,
    SponsorshipVerified,
}

/// How often an action may be credited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Once ever
    OneTime,
    /// Once per UTC calendar day
    Daily,
    /// At most once inside the window
    Cooldown(Duration),
    /// Once per caller-supplied key (event id, platform, ...)
    PerKey,
    Uncapped,
}

impl Action {
    pub fn reward(&self) -> i64 {
        match self {
            Action::DailyLogin => 10,
            Action::VerificationComplete => 50,
            Action::AccountLinked => 25,
            Action::ProfileComplete => 20,
            Action::Rsvp => 5,
            Action::Checkin => 15,
            Action::Message => 1,
            Action::Share => 3,
            Action::AgentClaimed => 25,
            Action::SponsorshipVerified => 100,
        }
    }

    pub fn eligibility(&self) -> Eligibility {
        match self {
            Action::DailyLogin => Eligibility::Daily,
            Action::VerificationComplete | Action::ProfileComplete | Action::AgentClaimed => Eligibility::OneTime,
            Action::AccountLinked | Action::Rsvp | Action::Checkin | Action::SponsorshipVerified => {
                Eligibility::PerKey
            }
            Action::Message => Eligibility::Uncapped,
            Action::Share => Eligibility::Cooldown(Duration::hours(1)),
        }
    }

    /// Engagement actions that keep a daily streak alive
    pub fn counts_toward_streak(&self) -> bool {
        matches!(
            self,
            Action::DailyLogin | Action::Rsvp | Action::Checkin | Action::Message | Action::Share
        )
    }

    /// Actions a signed-in client may report for itself
    pub fn client_claimable(&self) -> bool {
        matches!(self, Action::DailyLogin | Action::Share | Action::ProfileComplete)
    }

    /// The unique award key that makes a second credit collide.
    /// None when a per-key action arrives without a key.
    pub fn award_key(&self, context: &AwardContext, at: DateTime<Utc>) -> Option<String> {
        match self.eligibility() {
            Eligibility::OneTime => Some("once".to_string()),
            Eligibility::Daily => Some(at.format("%Y-%m-%d").to_string()),
            Eligibility::Cooldown(_) => Some(at.timestamp_millis().to_string()),
            Eligibility::PerKey => context.idempotency_key.clone(),
            Eligibility::Uncapped => Some(
                context
                    .idempotency_key
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_action_names_round_trip() {
        assert_eq!("daily_login".parse::<Action>().unwrap(), Action::DailyLogin);
        assert_eq!(Action::SponsorshipVerified.as_ref(), "sponsorship_verified");
        assert!("unknown".parse::<Action>().is_err());
    }

    #[test]
    fn test_award_keys() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 23, 59, 0).unwrap();
        let none = AwardContext::default();

        assert_eq!(Action::DailyLogin.award_key(&none, at).as_deref(), Some("2026-03-14"));
        assert_eq!(Action::VerificationComplete.award_key(&none, at).as_deref(), Some("once"));
        assert_eq!(Action::Rsvp.award_key(&none, at), None);
        assert_eq!(
            Action::Rsvp.award_key(&AwardContext::keyed("evt-1"), at).as_deref(),
            Some("evt-1")
        );

        let a = Action::Message.award_key(&none, at).unwrap();
        let b = Action::Message.award_key(&none, at).unwrap();
        assert_ne!(a, b);
    }
}
