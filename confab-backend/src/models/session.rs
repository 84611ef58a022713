use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An issued bearer token, bound to the platform account that logged in.
/// The canonical id is looked up per request since merges can re-point it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub token: String,
    pub platform_user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
