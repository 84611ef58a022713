use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Login platforms that can own an identity row
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Telegram,
    Farcaster,
    Web,
    Discord,
    Twitter,
    Github,
    Apple,
    Email,
    Phone,
}

impl Platform {
    /// Build a platform-scoped user id: `<platform>_<native-id>`
    pub fn user_id(&self, native_id: &str) -> String {
        format!("{}_{}", self.as_ref(), native_id)
    }

    /// Recover the platform from a platform-scoped user id
    pub fn from_user_id(platform_user_id: &str) -> Option<Platform> {
        let (prefix, native) = platform_user_id.split_once('_')?;
        if native.is_empty() {
            return None;
        }
        prefix.parse().ok()
    }
}

/// One row per platform account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub platform_user_id: String,
    pub platform: Platform,
    pub canonical_id: String,
    pub display_name: Option<String>,
    pub external_auth_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional linkage information supplied by a login provider
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveHints {
    pub external_auth_id: Option<String>,
    pub display_name: Option<String>,
}

/// A platform credential known to the external auth provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedCredential {
    pub platform: Platform,
    pub native_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl LinkedCredential {
    pub fn platform_user_id(&self) -> String {
        self.platform.user_id(&self.native_id)
    }
}

/// The auth provider's full account-linkage record for one person
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkageRecord {
    pub external_auth_id: String,
    pub accounts: Vec<LinkedCredential>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub canonical_id: String,
    pub platform_user_ids: Vec<String>,
}

/// Every identity sharing a canonical id
#[derive(Debug, Clone, Serialize)]
pub struct LinkedAccounts {
    pub canonical_id: String,
    pub members: Vec<Identity>,
}

impl LinkedAccounts {
    pub fn platform_user_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.platform_user_id.clone()).collect()
    }

    pub fn has(&self, platform: Platform) -> bool {
        self.members.iter().any(|m| m.platform == platform)
    }

    pub fn flags(&self) -> AccountFlags {
        AccountFlags {
            has_telegram: self.has(Platform::Telegram),
            has_farcaster: self.has(Platform::Farcaster),
            has_web: self.has(Platform::Web),
            has_discord: self.has(Platform::Discord),
            has_twitter: self.has(Platform::Twitter),
            has_github: self.has(Platform::Github),
            has_apple: self.has(Platform::Apple),
            has_email: self.has(Platform::Email),
            has_phone: self.has(Platform::Phone),
        }
    }

    /// Platforms the person has not linked yet
    pub fn missing_platforms(&self) -> Vec<Platform> {
        Platform::iter().filter(|p| !self.has(*p)).collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccountFlags {
    pub has_telegram: bool,
    pub has_farcaster: bool,
    pub has_web: bool,
    pub has_discord: bool,
    pub has_twitter: bool,
    pub has_github: bool,
    pub has_apple: bool,
    pub has_email: bool,
    pub has_phone: bool,
}

/// Request from a login provider after it verified the platform user
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderLoginRequest {
    pub platform: Platform,
    pub native_id: String,
    pub display_name: Option<String>,
    pub external_auth_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityResponse {
    pub canonical_id: String,
    pub linked_accounts: Vec<LinkedAccountInfo>,
    pub flags: AccountFlags,
}

impl From<&LinkedAccounts> for IdentityResponse {
    fn from(linked: &LinkedAccounts) -> Self {
        Self {
            canonical_id: linked.canonical_id.clone(),
            linked_accounts: linked.members.iter().map(LinkedAccountInfo::from).collect(),
            flags: linked.flags(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkedAccountInfo {
    pub platform: Platform,
    pub platform_user_id: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Identity> for LinkedAccountInfo {
    fn from(identity: &Identity) -> Self {
        Self {
            platform: identity.platform,
            platform_user_id: identity.platform_user_id.clone(),
            display_name: identity.display_name.clone(),
            created_at: identity.created_at,
        }
    }
}
