//! Points ledger: per-account awards, streaks, levels, and the
//! per-person aggregate over linked accounts.
//!
//! Eligibility is claimed by inserting a unique `points_awards` row; the
//! account itself is updated with compare-and-swap on its version. If the
//! account update fails the award row is removed again so the action can be
//! credited later.

mod actions;

pub use actions::{Action, Eligibility};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityResolver;
use crate::models::{
    AwardContext, AwardResult, ClaimPendingResult, PendingAction, Platform, PlatformPoints, PointsAccount,
    PointsSummary,
};

/// Ascending point thresholds; level N is reached at LEVEL_THRESHOLDS[N - 1]
pub const LEVEL_THRESHOLDS: [i64; 7] = [0, 100, 300, 600, 1000, 2000, 5000];

/// Pending client actions older than this are dropped
const PENDING_WINDOW_HOURS: i64 = 24;
/// Tolerated client clock skew for pending actions stamped in the future
const PENDING_FUTURE_SKEW_MINUTES: i64 = 5;
const MAX_CAS_ATTEMPTS: usize = 5;

pub struct PointsLedger {
    db: Arc<Database>,
    identities: Arc<IdentityResolver>,
}

impl PointsLedger {
    pub fn new(db: Arc<Database>, identities: Arc<IdentityResolver>) -> Self {
        Self { db, identities }
    }

    /// Credit `action` to one platform account if it is eligible.
    /// Ineligible awards are not errors: they come back with `awarded = false`.
    pub fn award(
        &self,
        platform_user_id: &str,
        platform: Platform,
        action: Action,
        context: &AwardContext,
    ) -> CoreResult<AwardResult> {
        let at = context.occurred_at.unwrap_or_else(Utc::now);
        let award_key = action.award_key(context, at).ok_or_else(|| {
            CoreError::InvalidInput(format!("{} requires an idempotency key", action))
        })?;

        self.db.ensure_points_account(platform_user_id, platform)?;

        if let Eligibility::Cooldown(window) = action.eligibility() {
            if let Some(last) = self.db.last_award_at(platform_user_id, action.as_ref())? {
                if (at - last).abs() < window {
                    return self.unchanged(platform_user_id);
                }
            }
        }

        let reward = action.reward();
        let Some(award_id) = self
            .db
            .try_record_award(platform_user_id, action.as_ref(), &award_key, reward, at)?
        else {
            return self.unchanged(platform_user_id);
        };

        match self.credit(platform_user_id, action, reward, at.date_naive()) {
            Ok(total) => {
                log::debug!("[points] {} +{} for {} (total {})", platform_user_id, reward, action, total);
                Ok(AwardResult {
                    awarded: true,
                    points: reward,
                    total,
                })
            }
            Err(e) => {
                if let Err(undo) = self.db.delete_award(award_id) {
                    log::error!(
                        "[points] Failed to release award {} for {} after {}: {}",
                        award_id,
                        platform_user_id,
                        e,
                        undo
                    );
                }
                Err(e)
            }
        }
    }

    fn credit(&self, platform_user_id: &str, action: Action, reward: i64, day: NaiveDate) -> CoreResult<i64> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let account = self
                .db
                .get_points_account(platform_user_id)?
                .ok_or_else(|| CoreError::NotFound(format!("points account {}", platform_user_id)))?;
            let expected_version = account.version;
            let next = apply_award(account, reward, action.counts_toward_streak(), day);

            if self.db.update_points_account(&next, expected_version)? {
                return Ok(next.total_points);
            }
        }
        Err(CoreError::Unavailable(format!(
            "points account {} is contended",
            platform_user_id
        )))
    }

    fn unchanged(&self, platform_user_id: &str) -> CoreResult<AwardResult> {
        let total = self
            .db
            .get_points_account(platform_user_id)?
            .map(|a| a.total_points)
            .unwrap_or(0);
        Ok(AwardResult {
            awarded: false,
            points: 0,
            total,
        })
    }

    /// Points for a person across every linked platform account
    pub fn aggregate(&self, canonical_id: &str) -> CoreResult<PointsSummary> {
        let linked_ids = self.identities.linked_ids(canonical_id)?;
        let accounts = self.db.list_points_accounts(&linked_ids)?;

        let breakdown: Vec<PlatformPoints> = accounts
            .iter()
            .map(|a| PlatformPoints {
                platform: a.platform,
                platform_user_id: a.platform_user_id.clone(),
                points: a.total_points,
                streak: a.current_streak,
                level: a.milestone_level,
            })
            .collect();

        Ok(PointsSummary {
            canonical_id: canonical_id.to_string(),
            points: accounts.iter().map(|a| a.total_points).sum(),
            streak: accounts.iter().map(|a| a.current_streak).max().unwrap_or(0),
            longest_streak: accounts.iter().map(|a| a.longest_streak).max().unwrap_or(0),
            level: accounts.iter().map(|a| a.milestone_level).max().unwrap_or(1),
            breakdown,
        })
    }

    /// Replay actions the client recorded before the user signed in.
    /// Each replay keys on its original instant, so a second replay of the
    /// same list credits nothing.
    pub fn claim_pending(
        &self,
        platform_user_id: &str,
        platform: Platform,
        pending: &[PendingAction],
        now: DateTime<Utc>,
    ) -> CoreResult<ClaimPendingResult> {
        let oldest = now - Duration::hours(PENDING_WINDOW_HOURS);
        let newest = now + Duration::minutes(PENDING_FUTURE_SKEW_MINUTES);
        let mut claimed = 0;

        for item in pending {
            let Ok(action) = item.action.parse::<Action>() else {
                log::debug!("[points] Ignoring unknown pending action '{}'", item.action);
                continue;
            };
            if !action.client_claimable() || item.timestamp < oldest || item.timestamp > newest {
                continue;
            }

            let idempotency_key = match action.eligibility() {
                Eligibility::PerKey | Eligibility::Uncapped => {
                    Some(format!("replay:{}", item.timestamp.timestamp_millis()))
                }
                _ => None,
            };
            let context = AwardContext {
                idempotency_key,
                occurred_at: Some(item.timestamp),
            };

            if self.award(platform_user_id, platform, action, &context)?.awarded {
                claimed += 1;
            }
        }

        let total = self
            .db
            .get_points_account(platform_user_id)?
            .map(|a| a.total_points)
            .unwrap_or(0);

        if claimed > 0 {
            log::info!("[points] {} claimed {} pending action(s)", platform_user_id, claimed);
        }
        Ok(ClaimPendingResult { claimed, total })
    }
}

/// New account state after crediting `reward` on `day`
fn apply_award(mut account: PointsAccount, reward: i64, counts_toward_streak: bool, day: NaiveDate) -> PointsAccount {
    account.total_points += reward;
    if counts_toward_streak {
        advance_streak(&mut account, day);
    }
    account.longest_streak = account.longest_streak.max(account.current_streak);
    account.milestone_level = account.milestone_level.max(level_for(account.total_points));
    account
}

fn advance_streak(account: &mut PointsAccount, day: NaiveDate) {
    match account.last_award_date {
        None => {
            account.current_streak = 1;
            account.last_award_date = Some(day);
        }
        // Same day, or a late replay of an earlier day
        Some(last) if day <= last => {}
        Some(last) if day - last == Duration::days(1) => {
            account.current_streak += 1;
            account.last_award_date = Some(day);
        }
        Some(_) => {
            account.current_streak = 1;
            account.last_award_date = Some(day);
        }
    }
}

/// 1-based index of the highest threshold not above `total`
pub fn level_for(total: i64) -> i64 {
    LEVEL_THRESHOLDS.iter().filter(|t| **t <= total).count().max(1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResolveHints;
    use chrono::TimeZone;

    fn ledger() -> (PointsLedger, Arc<IdentityResolver>) {
        let db = Arc::new(Database::in_memory());
        let identities = Arc::new(IdentityResolver::new(db.clone()));
        (PointsLedger::new(db, identities.clone()), identities)
    }

    fn at(day: u32, hour: u32) -> AwardContext {
        AwardContext::at(Utc.with_ymd_and_hms(2026, 5, day, hour, 0, 0).unwrap())
    }

    fn account(ledger: &PointsLedger, id: &str) -> PointsAccount {
        ledger.db.get_points_account(id).unwrap().unwrap()
    }

    #[test]
    fn test_one_time_action_credits_once() {
        let (ledger, _) = ledger();
        let ctx = AwardContext::default();

        let first = ledger
            .award("telegram_1", Platform::Telegram, Action::VerificationComplete, &ctx)
            .unwrap();
        assert_eq!(first, AwardResult { awarded: true, points: 50, total: 50 });

        let second = ledger
            .award("telegram_1", Platform::Telegram, Action::VerificationComplete, &ctx)
            .unwrap();
        assert_eq!(second, AwardResult { awarded: false, points: 0, total: 50 });
    }

    #[test]
    fn test_daily_login_capped_per_day() {
        let (ledger, _) = ledger();
        let id = "farcaster_1";

        assert!(ledger.award(id, Platform::Farcaster, Action::DailyLogin, &at(1, 8)).unwrap().awarded);
        let again = ledger.award(id, Platform::Farcaster, Action::DailyLogin, &at(1, 22)).unwrap();
        assert!(!again.awarded);
        assert_eq!(again.total, 10);

        assert!(ledger.award(id, Platform::Farcaster, Action::DailyLogin, &at(2, 8)).unwrap().awarded);
        assert_eq!(account(&ledger, id).current_streak, 2);
    }

    #[test]
    fn test_streak_reset_keeps_longest() {
        let (ledger, _) = ledger();
        let id = "web_0xabc";

        for day in 1..=3 {
            ledger.award(id, Platform::Web, Action::DailyLogin, &at(day, 9)).unwrap();
            let a = account(&ledger, id);
            assert!(a.longest_streak >= a.current_streak);
        }
        assert_eq!(account(&ledger, id).current_streak, 3);

        ledger.award(id, Platform::Web, Action::DailyLogin, &at(6, 9)).unwrap();
        let a = account(&ledger, id);
        assert_eq!(a.current_streak, 1);
        assert_eq!(a.longest_streak, 3);
    }

    #[test]
    fn test_non_streak_action_leaves_streak_alone() {
        let (ledger, _) = ledger();
        let id = "telegram_2";
        ledger.award(id, Platform::Telegram, Action::DailyLogin, &at(1, 9)).unwrap();
        ledger
            .award(id, Platform::Telegram, Action::VerificationComplete, &at(5, 9))
            .unwrap();

        let a = account(&ledger, id);
        assert_eq!(a.current_streak, 1);
        assert_eq!(a.last_award_date, NaiveDate::from_ymd_opt(2026, 5, 1));
    }

    #[test]
    fn test_late_replay_does_not_move_streak_backwards() {
        let (ledger, _) = ledger();
        let id = "telegram_3";
        ledger.award(id, Platform::Telegram, Action::DailyLogin, &at(4, 9)).unwrap();
        ledger.award(id, Platform::Telegram, Action::DailyLogin, &at(5, 9)).unwrap();
        ledger.award(id, Platform::Telegram, Action::DailyLogin, &at(2, 9)).unwrap();

        let a = account(&ledger, id);
        assert_eq!(a.current_streak, 2);
        assert_eq!(a.total_points, 30);
    }

    #[test]
    fn test_share_cooldown() {
        let (ledger, _) = ledger();
        let id = "discord_5";
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();

        assert!(ledger.award(id, Platform::Discord, Action::Share, &AwardContext::at(base)).unwrap().awarded);
        let early = AwardContext::at(base + Duration::minutes(30));
        assert!(!ledger.award(id, Platform::Discord, Action::Share, &early).unwrap().awarded);
        let later = AwardContext::at(base + Duration::minutes(61));
        assert!(ledger.award(id, Platform::Discord, Action::Share, &later).unwrap().awarded);
    }

    #[test]
    fn test_per_key_action_requires_key() {
        let (ledger, _) = ledger();
        let err = ledger
            .award("telegram_4", Platform::Telegram, Action::Rsvp, &AwardContext::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        let ctx = AwardContext::keyed("evt-9");
        assert!(ledger.award("telegram_4", Platform::Telegram, Action::Rsvp, &ctx).unwrap().awarded);
        assert!(!ledger.award("telegram_4", Platform::Telegram, Action::Rsvp, &ctx).unwrap().awarded);
    }

    #[test]
    fn test_levels() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(99), 1);
        assert_eq!(level_for(100), 2);
        assert_eq!(level_for(650), 4);
        assert_eq!(level_for(10_000), 7);
    }

    #[test]
    fn test_aggregate_across_linked_accounts() {
        let (ledger, identities) = ledger();
        let hints = ResolveHints {
            external_auth_id: Some("ext-1".to_string()),
            display_name: None,
        };
        let canonical = identities.resolve("telegram_a", &hints).unwrap();
        identities.resolve("farcaster_b", &hints).unwrap();

        // 30 on telegram from two RSVPs and two logins, 70 on farcaster
        for evt in ["e1", "e2"] {
            ledger
                .award("telegram_a", Platform::Telegram, Action::Rsvp, &AwardContext::keyed(evt))
                .unwrap();
        }
        ledger.award("telegram_a", Platform::Telegram, Action::DailyLogin, &at(1, 9)).unwrap();
        ledger.award("telegram_a", Platform::Telegram, Action::DailyLogin, &at(2, 9)).unwrap();
        ledger
            .award("farcaster_b", Platform::Farcaster, Action::VerificationComplete, &at(1, 9))
            .unwrap();
        ledger
            .award("farcaster_b", Platform::Farcaster, Action::ProfileComplete, &at(1, 9))
            .unwrap();

        let a = account(&ledger, "telegram_a");
        let b = account(&ledger, "farcaster_b");
        assert_eq!(a.total_points, 30);
        assert_eq!(b.total_points, 70);

        let summary = ledger.aggregate(&canonical).unwrap();
        assert_eq!(summary.points, 100);
        assert_eq!(summary.streak, a.current_streak.max(b.current_streak));
        assert_eq!(summary.level, 1);
        assert_eq!(summary.breakdown.len(), 2);
    }

    #[test]
    fn test_claim_pending_is_idempotent() {
        let (ledger, _) = ledger();
        let now = Utc::now();
        let pending = vec![
            PendingAction { action: "daily_login".to_string(), timestamp: now - Duration::hours(1) },
            PendingAction { action: "share".to_string(), timestamp: now - Duration::hours(3) },
            PendingAction { action: "share".to_string(), timestamp: now - Duration::hours(30) },
            PendingAction { action: "sponsorship_verified".to_string(), timestamp: now },
            PendingAction { action: "bogus".to_string(), timestamp: now },
        ];

        let first = ledger
            .claim_pending("telegram_9", Platform::Telegram, &pending, now)
            .unwrap();
        assert_eq!(first.claimed, 2);
        assert_eq!(first.total, 13);

        let second = ledger
            .claim_pending("telegram_9", Platform::Telegram, &pending, now)
            .unwrap();
        assert_eq!(second.claimed, 0);
        assert_eq!(second.total, 13);
    }
}
