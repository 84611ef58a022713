//! Cross-platform identity resolution
//!
//! Every platform account owns one `identities` row pointing at a canonical
//! id. Writes go one row at a time, so two racing first-logins can leave a
//! person split across two canonical ids until the next `merge_all` with the
//! provider's full linkage record pulls both groups together.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::models::{Identity, LinkageRecord, LinkedAccounts, MergeOutcome, Platform, ResolveHints};

pub struct IdentityResolver {
    db: Arc<Database>,
}

impl IdentityResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Map a platform-scoped user id to its canonical id, creating the row on
    /// first sight.
    pub fn resolve(&self, platform_user_id: &str, hints: &ResolveHints) -> CoreResult<String> {
        let platform = Platform::from_user_id(platform_user_id).ok_or_else(|| {
            CoreError::InvalidInput(format!("malformed platform user id '{}'", platform_user_id))
        })?;

        if let Some(existing) = self.db.get_identity(platform_user_id)? {
            self.apply_hints(&existing, hints)?;
            return Ok(existing.canonical_id);
        }

        // Co-owned account already known under the same external auth id
        let adopted = match hints.external_auth_id.as_deref() {
            Some(external_id) => self
                .db
                .find_identities_by_external_auth(external_id)?
                .into_iter()
                .next()
                .map(|identity| identity.canonical_id),
            None => None,
        };

        let canonical_id = adopted.unwrap_or_else(|| platform_user_id.to_string());
        let identity = new_identity(
            platform_user_id,
            platform,
            &canonical_id,
            hints.display_name.clone(),
            hints.external_auth_id.clone(),
        );

        if self.db.insert_identity(&identity)? {
            log::info!("[identity] Created {} -> {}", platform_user_id, canonical_id);
            return Ok(canonical_id);
        }

        // A concurrent login inserted the row first; its mapping wins
        self.db
            .get_identity(platform_user_id)?
            .map(|identity| identity.canonical_id)
            .ok_or_else(|| CoreError::Unavailable(format!("identity {} vanished after insert", platform_user_id)))
    }

    fn apply_hints(&self, existing: &Identity, hints: &ResolveHints) -> CoreResult<()> {
        if let Some(external_id) = hints.external_auth_id.as_deref() {
            if existing.external_auth_id.is_none() {
                self.db.set_identity_external_auth(&existing.platform_user_id, external_id)?;
            }
        }
        if let Some(name) = hints.display_name.as_deref() {
            if existing.display_name.as_deref() != Some(name) {
                self.db.update_identity_display_name(&existing.platform_user_id, name)?;
            }
        }
        Ok(())
    }

    /// Bring every account in the provider's linkage record under one
    /// canonical id. Safe to repeat; a repeat with the same record changes
    /// nothing.
    pub fn merge_all(&self, record: &LinkageRecord) -> CoreResult<MergeOutcome> {
        if record.accounts.is_empty() {
            return Err(CoreError::InvalidInput("linkage record has no accounts".to_string()));
        }

        let mut current = Vec::with_capacity(record.accounts.len());
        for credential in &record.accounts {
            let platform_user_id = credential.platform_user_id();
            let row = self.db.get_identity(&platform_user_id)?;
            current.push((credential, platform_user_id, row));
        }
        let tagged = self.db.find_identities_by_external_auth(&record.external_auth_id)?;

        // First pre-existing canonical in record order, then any row already
        // tagged by the provider, then the first credential itself
        let canonical_id = current
            .iter()
            .find_map(|(_, _, row)| row.as_ref().map(|r| r.canonical_id.clone()))
            .or_else(|| tagged.first().map(|r| r.canonical_id.clone()))
            .unwrap_or_else(|| current[0].1.clone());

        let mut losing: BTreeSet<String> = tagged
            .iter()
            .map(|r| r.canonical_id.clone())
            .filter(|c| *c != canonical_id)
            .collect();

        for (credential, platform_user_id, row) in &current {
            let row = match row {
                Some(row) => row.clone(),
                None => {
                    let identity = new_identity(
                        platform_user_id,
                        credential.platform,
                        &canonical_id,
                        credential.display_name.clone(),
                        Some(record.external_auth_id.clone()),
                    );
                    if self.db.insert_identity(&identity)? {
                        continue;
                    }
                    match self.db.get_identity(platform_user_id)? {
                        Some(raced) => raced,
                        None => continue,
                    }
                }
            };

            if row.canonical_id != canonical_id {
                losing.insert(row.canonical_id.clone());
                self.db.repoint_identity(platform_user_id, &row.canonical_id, &canonical_id)?;
            }
            if row.external_auth_id.is_none() {
                self.db.set_identity_external_auth(platform_user_id, &record.external_auth_id)?;
            }
        }

        // Members of a losing group that were not in the record follow it,
        // and so does everything keyed by the losing canonical id
        for loser in &losing {
            for member in self.db.list_identities_by_canonical(loser)? {
                self.db.repoint_identity(&member.platform_user_id, loser, &canonical_id)?;
            }
            self.carry_owned_rows(loser, &canonical_id)?;
        }

        if !losing.is_empty() {
            log::info!(
                "[identity] Merged {} canonical group(s) into {} for {}",
                losing.len(),
                canonical_id,
                record.external_auth_id
            );
        }

        let platform_user_ids = self.linked_ids(&canonical_id)?;

        // A canonical id is always minted from a member's own platform user id,
        // so sweeping the members also finishes a merge that stopped between
        // re-pointing identities and moving their rows
        for member in &platform_user_ids {
            if *member != canonical_id && !losing.contains(member) {
                self.carry_owned_rows(member, &canonical_id)?;
            }
        }

        Ok(MergeOutcome {
            canonical_id,
            platform_user_ids,
        })
    }

    fn carry_owned_rows(&self, loser: &str, winner: &str) -> CoreResult<()> {
        if !self.db.transfer_agent_owner(loser, winner)? {
            if let Some(agent) = self.db.get_agent_by_owner(loser)? {
                // Both groups hold a slot; the agent ledger still lets the
                // person act on it through their linked ids
                log::warn!(
                    "[identity] {} already owns an agent; slot {} stays under {}",
                    winner,
                    agent.slot,
                    loser
                );
            }
        }
        let moved = self.db.move_activity(loser, winner)?;
        if moved > 0 {
            log::debug!("[identity] Moved {} activity rows from {} to {}", moved, loser, winner);
        }
        Ok(())
    }

    /// Every platform user id sharing a canonical id, oldest first
    pub fn linked_ids(&self, canonical_id: &str) -> CoreResult<Vec<String>> {
        Ok(self.linked_accounts(canonical_id)?.platform_user_ids())
    }

    pub fn linked_accounts(&self, canonical_id: &str) -> CoreResult<LinkedAccounts> {
        let members = self.db.list_identities_by_canonical(canonical_id)?;
        if members.is_empty() {
            return Err(CoreError::NotFound(format!("identity {}", canonical_id)));
        }
        Ok(LinkedAccounts {
            canonical_id: canonical_id.to_string(),
            members,
        })
    }

    /// Current canonical id for a known platform account
    pub fn canonical_of(&self, platform_user_id: &str) -> CoreResult<String> {
        self.db
            .get_identity(platform_user_id)?
            .map(|identity| identity.canonical_id)
            .ok_or_else(|| CoreError::NotFound(format!("identity {}", platform_user_id)))
    }
}

fn new_identity(
    platform_user_id: &str,
    platform: Platform,
    canonical_id: &str,
    display_name: Option<String>,
    external_auth_id: Option<String>,
) -> Identity {
    let now = Utc::now();
    Identity {
        platform_user_id: platform_user_id.to_string(),
        platform,
        canonical_id: canonical_id.to_string(),
        display_name,
        external_auth_id,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinkedCredential, ScheduledEvent};
    use chrono::Duration;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(Database::in_memory()))
    }

    fn credential(platform: Platform, native_id: &str) -> LinkedCredential {
        LinkedCredential {
            platform,
            native_id: native_id.to_string(),
            display_name: None,
        }
    }

    #[test]
    fn test_first_login_mints_own_canonical() {
        let resolver = resolver();
        let canonical = resolver.resolve("telegram_42", &ResolveHints::default()).unwrap();
        assert_eq!(canonical, "telegram_42");
        assert_eq!(resolver.resolve("telegram_42", &ResolveHints::default()).unwrap(), "telegram_42");
    }

    #[test]
    fn test_external_auth_hint_adopts_existing_canonical() {
        let resolver = resolver();
        let hints = ResolveHints {
            external_auth_id: Some("did:privy:abc".to_string()),
            display_name: Some("Ada".to_string()),
        };
        assert_eq!(resolver.resolve("farcaster_7", &hints).unwrap(), "farcaster_7");
        assert_eq!(resolver.resolve("telegram_42", &hints).unwrap(), "farcaster_7");

        let linked = resolver.linked_accounts("farcaster_7").unwrap();
        assert!(linked.flags().has_telegram);
        assert!(linked.flags().has_farcaster);
        assert!(!linked.flags().has_web);
    }

    #[test]
    fn test_existing_row_is_tagged_by_later_hint() {
        let resolver = resolver();
        resolver.resolve("web_0xabc", &ResolveHints::default()).unwrap();
        let hints = ResolveHints {
            external_auth_id: Some("ext-1".to_string()),
            display_name: None,
        };
        resolver.resolve("web_0xabc", &hints).unwrap();

        // A new platform presenting the same external id now joins the group
        assert_eq!(resolver.resolve("discord_9", &hints).unwrap(), "web_0xabc");
    }

    #[test]
    fn test_malformed_platform_user_id() {
        let resolver = resolver();
        let err = resolver.resolve("myspace_1", &ResolveHints::default()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert!(resolver.resolve("telegram_", &ResolveHints::default()).is_err());
    }

    #[test]
    fn test_merge_all_is_idempotent() {
        let resolver = resolver();
        let record = LinkageRecord {
            external_auth_id: "ext-1".to_string(),
            accounts: vec![
                credential(Platform::Telegram, "42"),
                credential(Platform::Farcaster, "7"),
                credential(Platform::Web, "0xabc"),
            ],
        };

        let first = resolver.merge_all(&record).unwrap();
        let second = resolver.merge_all(&record).unwrap();

        assert_eq!(first.canonical_id, "telegram_42");
        assert_eq!(first.canonical_id, second.canonical_id);
        let mut a = first.platform_user_ids.clone();
        let mut b = second.platform_user_ids.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_merge_all_prefers_first_existing_canonical() {
        let resolver = resolver();
        resolver.resolve("farcaster_7", &ResolveHints::default()).unwrap();

        let record = LinkageRecord {
            external_auth_id: "ext-1".to_string(),
            accounts: vec![credential(Platform::Telegram, "42"), credential(Platform::Farcaster, "7")],
        };
        let outcome = resolver.merge_all(&record).unwrap();
        assert_eq!(outcome.canonical_id, "farcaster_7");
        assert_eq!(resolver.canonical_of("telegram_42").unwrap(), "farcaster_7");
    }

    #[test]
    fn test_merge_all_heals_split_identity() {
        let resolver = resolver();
        // Two racing first-logins produced two canonical groups for one person
        resolver.resolve("telegram_42", &ResolveHints::default()).unwrap();
        resolver.resolve("farcaster_7", &ResolveHints::default()).unwrap();
        let hints = ResolveHints {
            external_auth_id: None,
            display_name: None,
        };
        // A third account that only ever joined the farcaster group
        let db = resolver.db.clone();
        db.insert_identity(&new_identity("email_ada", Platform::Email, "farcaster_7", None, None))
            .unwrap();
        assert_eq!(resolver.resolve("email_ada", &hints).unwrap(), "farcaster_7");

        let record = LinkageRecord {
            external_auth_id: "ext-1".to_string(),
            accounts: vec![credential(Platform::Telegram, "42"), credential(Platform::Farcaster, "7")],
        };
        let outcome = resolver.merge_all(&record).unwrap();

        assert_eq!(outcome.canonical_id, "telegram_42");
        assert_eq!(outcome.platform_user_ids.len(), 3);
        assert_eq!(resolver.canonical_of("email_ada").unwrap(), "telegram_42");
        assert!(resolver.linked_accounts("farcaster_7").is_err());
    }

    #[test]
    fn test_merge_all_moves_rows_keyed_by_losing_canonical() {
        let resolver = resolver();
        let db = resolver.db.clone();
        resolver.resolve("farcaster_7", &ResolveHints::default()).unwrap();
        resolver.resolve("telegram_42", &ResolveHints::default()).unwrap();

        db.seed_agent_slots(2).unwrap();
        assert!(db.claim_agent_slot(1, "telegram_42", None, "event-scout").unwrap());
        let event = ScheduledEvent {
            event_id: "evt-1".to_string(),
            title: "Keynote".to_string(),
            starts_at: Utc::now() + Duration::hours(1),
        };
        db.record_rsvp("telegram_42", &event).unwrap();
        db.record_rsvp("farcaster_7", &event).unwrap();
        db.record_checkin("telegram_42", "hall-a", Utc::now()).unwrap();

        let record = LinkageRecord {
            external_auth_id: "ext-1".to_string(),
            accounts: vec![credential(Platform::Farcaster, "7"), credential(Platform::Telegram, "42")],
        };
        assert_eq!(resolver.merge_all(&record).unwrap().canonical_id, "farcaster_7");

        let agent = db.get_agent_by_owner("farcaster_7").unwrap().unwrap();
        assert_eq!(agent.slot, 1);
        assert!(db.get_agent_by_owner("telegram_42").unwrap().is_none());

        // The shared RSVP collapses into one row
        assert_eq!(db.upcoming_rsvps("farcaster_7", Utc::now(), 10).unwrap().len(), 1);
        assert!(db.upcoming_rsvps("telegram_42", Utc::now(), 10).unwrap().is_empty());
        assert_eq!(db.latest_checkin("farcaster_7").unwrap().unwrap().location_id, "hall-a");
        assert!(db.latest_checkin("telegram_42").unwrap().is_none());

        // Re-running the merge finds nothing left to move
        resolver.merge_all(&record).unwrap();
        assert_eq!(db.get_agent_by_owner("farcaster_7").unwrap().unwrap().slot, 1);
    }

    #[test]
    fn test_linked_ids_unknown_canonical() {
        let resolver = resolver();
        assert!(matches!(resolver.linked_ids("nobody"), Err(CoreError::NotFound(_))));
    }
}
