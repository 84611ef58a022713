//! Error taxonomy for the identity & ledger core
//!
//! Ineligible awards and insufficient balances are not errors: they are
//! variants of the operation's outcome type. Everything here is something the
//! caller has to react to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown identity, agent, skill, or sponsorship
    #[error("{0} not found")]
    NotFound(String),

    /// Caller is signed in but acting on something it does not own
    #[error("{0}")]
    Forbidden(String),

    /// Expected steady-state refusal (slot already claimed, skill already owned)
    #[error("{0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// External dependency failed or a write lost too many races; retryable
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// A write would have broken a ledger invariant and was refused
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl CoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Unavailable(_) | CoreError::Store(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
