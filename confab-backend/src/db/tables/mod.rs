//! Database model modules - extends Database with domain-specific methods
//!
//! Each module adds `impl Database` blocks with methods for a specific table group.

mod activity;       // rsvps, checkins
mod agents;         // agent_accounts, agent_transactions, external_payments
mod auth;           // auth_sessions, auth_challenges
mod identities;     // identities
mod points;         // points_accounts, points_awards
mod sponsorships;   // sponsorships, sponsor_totals

pub use agents::BalanceDelta;
