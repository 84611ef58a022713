use std::env;

use crate::domain_types::Usdc;

/// Default minimum sponsorship (1.00 USDC)
const DEFAULT_MIN_SPONSORSHIP: &str = "1.00";
/// Default agent seed balance (0.50 USDC)
const DEFAULT_AGENT_SEED: &str = "0.50";

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// JSON-RPC endpoint used for receipt lookups
    pub chain_rpc_url: String,
    pub chain_rpc_timeout_secs: u64,
    /// USDC token contract whose Transfer logs count as payment
    pub usdc_contract: String,
    /// Address that receives sponsorships and external agent payments
    pub treasury_address: String,
    pub payment_network: String,
    pub min_sponsorship: Usdc,
    pub agent_slot_count: i64,
    pub agent_seed: Usdc,
    /// Shared secret presented by login providers
    pub provider_api_key: String,
    pub admin_api_key: String,
    pub session_ttl_hours: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("PORT must be a valid number"),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "./.db/confab.db".to_string()),
            chain_rpc_url: env::var("CHAIN_RPC_URL")
                .unwrap_or_else(|_| "https://mainnet.base.org".to_string()),
            chain_rpc_timeout_secs: env::var("CHAIN_RPC_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            usdc_contract: env::var("USDC_CONTRACT_ADDRESS")
                .unwrap_or_else(|_| "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".to_string())
                .to_lowercase(),
            treasury_address: env::var("TREASURY_ADDRESS")
                .expect("TREASURY_ADDRESS must be set")
                .to_lowercase(),
            payment_network: env::var("PAYMENT_NETWORK").unwrap_or_else(|_| "base".to_string()),
            min_sponsorship: env::var("MIN_SPONSORSHIP_USDC")
                .unwrap_or_else(|_| DEFAULT_MIN_SPONSORSHIP.to_string())
                .parse()
                .expect("MIN_SPONSORSHIP_USDC must be a decimal amount"),
            agent_slot_count: env::var("AGENT_SLOT_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            agent_seed: env::var("AGENT_SEED_USDC")
                .unwrap_or_else(|_| DEFAULT_AGENT_SEED.to_string())
                .parse()
                .expect("AGENT_SEED_USDC must be a decimal amount"),
            provider_api_key: env::var("PROVIDER_API_KEY").expect("PROVIDER_API_KEY must be set"),
            admin_api_key: env::var("ADMIN_API_KEY").expect("ADMIN_API_KEY must be set"),
            session_ttl_hours: env::var("SESSION_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24 * 7),
        }
    }

    /// Payment settings handed to the verifier and agent ledger
    pub fn payment_settings(&self) -> PaymentSettings {
        PaymentSettings {
            token_contract: self.usdc_contract.clone(),
            treasury_address: self.treasury_address.clone(),
            network: self.payment_network.clone(),
        }
    }
}

/// Where payments must land and in which token
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub token_contract: String,
    pub treasury_address: String,
    pub network: String,
}

#[cfg(test)]
impl PaymentSettings {
    pub fn for_tests() -> Self {
        Self {
            token_contract: "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".to_string(),
            treasury_address: "0x1111111111111111111111111111111111111111".to_string(),
            network: "base".to_string(),
        }
    }
}
