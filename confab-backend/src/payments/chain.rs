//! Read-only chain access: one JSON-RPC call, `eth_getTransactionReceipt`,
//! plus decoding of ERC-20 `Transfer` logs from the receipt.

use async_trait::async_trait;
use ethers::types::{Address, Log, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::PaymentSettings;
use crate::domain_types::Usdc;

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Value,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    result: Option<Value>,
    error: Option<JsonRpcError>,
    #[allow(dead_code)]
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("chain RPC timed out")]
    Timeout,
    #[error("chain RPC unreachable: {0}")]
    Transport(String),
    #[error("chain RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("undecodable chain response: {0}")]
    Decode(String),
}

impl ChainError {
    /// Neither valid nor invalid: ask again later
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, ChainError::Timeout | ChainError::Transport(_))
    }
}

/// Check if an HTTP status code is retryable (gateway errors, rate limits, timeouts)
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 520..=524)
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `Ok(None)` when the node does not know the transaction
    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError>;
}

/// `ChainRpc` over a plain HTTP JSON-RPC endpoint
pub struct JsonRpcChain {
    client: reqwest::Client,
    url: String,
}

impl JsonRpcChain {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

fn classify_reqwest(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else if e.is_decode() {
        ChainError::Decode(e.to_string())
    } else {
        ChainError::Transport(e.to_string())
    }
}

#[async_trait]
impl ChainRpc for JsonRpcChain {
    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: "eth_getTransactionReceipt".to_string(),
            params: json!([format_tx_hash(&tx_hash)]),
            id: 1,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if is_retryable_status(status.as_u16()) {
            log::warn!("[chain] Receipt lookup got HTTP {} (retryable)", status);
            return Err(ChainError::Transport(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ChainError::Rpc {
                code: status.as_u16() as i64,
                message: format!("HTTP {}", status),
            });
        }

        let body: JsonRpcResponse = response.json().await.map_err(classify_reqwest)?;

        if let Some(error) = body.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        match body.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ChainError::Decode(e.to_string())),
        }
    }
}

/// keccak256("Transfer(address,address,uint256)")
pub fn transfer_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// Decode an ERC-20 Transfer log; anything else is `None`
pub fn decode_transfer(log: &Log) -> Option<TransferLog> {
    if log.topics.len() != 3 || log.topics[0] != transfer_topic() {
        return None;
    }
    // Non-indexed value is exactly one 32-byte word
    if log.data.len() != 32 {
        return None;
    }
    Some(TransferLog {
        token: log.address,
        from: Address::from_slice(&log.topics[1].as_bytes()[12..]),
        to: Address::from_slice(&log.topics[2].as_bytes()[12..]),
        value: U256::from_big_endian(&log.data),
    })
}

/// `0x` + 64 hex characters
pub fn parse_tx_hash(value: &str) -> Option<H256> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    if digits.len() != 64 {
        return None;
    }
    let bytes = hex::decode(digits).ok()?;
    Some(H256::from_slice(&bytes))
}

pub fn format_tx_hash(hash: &H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

/// What the chain says about a claimed payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferVerdict {
    /// Qualifying transfers sum to at least the expected amount
    Valid(Usdc),
    /// Confirmed mismatch or a definitive chain error
    Invalid(String),
    /// Timeout or transport failure; retry later
    Indeterminate(String),
}

/// Classify a claimed transfer of at least `minimum` of the configured token
/// to the configured treasury.
pub async fn verify_transfer(
    chain: &dyn ChainRpc,
    settings: &PaymentSettings,
    tx_reference: &str,
    minimum: Usdc,
) -> TransferVerdict {
    let Some(tx_hash) = parse_tx_hash(tx_reference) else {
        return TransferVerdict::Invalid(format!("malformed transaction hash '{}'", tx_reference));
    };
    let (Ok(token), Ok(treasury)) = (
        settings.token_contract.parse::<Address>(),
        settings.treasury_address.parse::<Address>(),
    ) else {
        return TransferVerdict::Indeterminate("payment settings hold an invalid address".to_string());
    };

    let receipt = match chain.transaction_receipt(tx_hash).await {
        Ok(Some(receipt)) => receipt,
        Ok(None) => return TransferVerdict::Invalid("transaction not found".to_string()),
        Err(e) if e.is_indeterminate() => return TransferVerdict::Indeterminate(e.to_string()),
        Err(e) => return TransferVerdict::Invalid(e.to_string()),
    };

    if receipt.status != Some(U64::one()) {
        return TransferVerdict::Invalid("transaction reverted".to_string());
    }

    let mut total = U256::zero();
    let mut qualifying = 0;
    for transfer in receipt.logs.iter().filter_map(decode_transfer) {
        if transfer.token == token && transfer.to == treasury {
            total = total.saturating_add(transfer.value);
            qualifying += 1;
        }
    }

    if qualifying == 0 {
        return TransferVerdict::Invalid("no qualifying transfer to the treasury".to_string());
    }
    let Some(confirmed) = Usdc::from_token_units(total) else {
        return TransferVerdict::Invalid("transferred amount out of range".to_string());
    };
    if confirmed < minimum {
        return TransferVerdict::Invalid(format!("transferred {} but {} was claimed", confirmed, minimum));
    }
    TransferVerdict::Valid(confirmed)
}

#[cfg(test)]
pub mod testing {
    //! Scripted chain double for verifier and ledger tests

    use super::*;
    use ethers::types::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct ScriptedChain {
        answers: Mutex<HashMap<H256, Result<Option<TransactionReceipt>, ChainError>>>,
        pub calls: Mutex<usize>,
    }

    impl ScriptedChain {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn answer(&self, tx_reference: &str, answer: Result<Option<TransactionReceipt>, ChainError>) {
            let hash = parse_tx_hash(tx_reference).expect("test tx hash");
            self.answers.lock().insert(hash, answer);
        }

        /// A successful receipt carrying one Transfer of `micros` to `to`
        pub fn pay(&self, tx_reference: &str, token: &str, to: &str, micros: u64) {
            let log = transfer_log(token, "0x2222222222222222222222222222222222222222", to, micros);
            self.answer(tx_reference, Ok(Some(receipt(tx_reference, 1, vec![log]))));
        }
    }

    pub fn tx_hash(n: u8) -> String {
        format!("0x{}", hex::encode([n; 32]))
    }

    pub fn transfer_log(token: &str, from: &str, to: &str, micros: u64) -> Log {
        let from: Address = from.parse().expect("from address");
        let to: Address = to.parse().expect("to address");
        let mut data = [0u8; 32];
        U256::from(micros).to_big_endian(&mut data);
        Log {
            address: token.parse().expect("token address"),
            topics: vec![transfer_topic(), H256::from(from), H256::from(to)],
            data: Bytes::from(data.to_vec()),
            ..Default::default()
        }
    }

    pub fn receipt(tx_reference: &str, status: u64, logs: Vec<Log>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: parse_tx_hash(tx_reference).expect("test tx hash"),
            status: Some(U64::from(status)),
            logs,
            ..Default::default()
        }
    }

    #[async_trait]
    impl ChainRpc for ScriptedChain {
        async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError> {
            *self.calls.lock() += 1;
            self.answers.lock().get(&tx_hash).cloned().unwrap_or(Ok(None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_parse_tx_hash() {
        assert!(parse_tx_hash(&tx_hash(7)).is_some());
        assert!(parse_tx_hash("0x1234").is_none());
        assert!(parse_tx_hash(&"z".repeat(66)).is_none());
        let hash = parse_tx_hash(&tx_hash(0xab)).unwrap();
        assert_eq!(format_tx_hash(&hash), tx_hash(0xab));
    }

    #[test]
    fn test_decode_transfer_rejects_other_events() {
        let settings = PaymentSettings::for_tests();
        let mut log = transfer_log(&settings.token_contract, &settings.treasury_address, &settings.treasury_address, 5);
        assert!(decode_transfer(&log).is_some());

        log.topics[0] = H256::zero();
        assert!(decode_transfer(&log).is_none());
    }

    #[tokio::test]
    async fn test_verify_transfer_sums_qualifying_logs() {
        let settings = PaymentSettings::for_tests();
        let chain = ScriptedChain::new();
        let tx = tx_hash(1);
        let other_token = "0x3333333333333333333333333333333333333333";
        let logs = vec![
            transfer_log(&settings.token_contract, "0x2222222222222222222222222222222222222222", &settings.treasury_address, 600_000),
            transfer_log(&settings.token_contract, "0x2222222222222222222222222222222222222222", &settings.treasury_address, 400_000),
            // Wrong token and wrong recipient do not count
            transfer_log(other_token, "0x2222222222222222222222222222222222222222", &settings.treasury_address, 9_000_000),
            transfer_log(&settings.token_contract, "0x2222222222222222222222222222222222222222", other_token, 9_000_000),
        ];
        chain.answer(&tx, Ok(Some(receipt(&tx, 1, logs))));

        let verdict = verify_transfer(&chain, &settings, &tx, Usdc::from_micros(1_000_000)).await;
        assert_eq!(verdict, TransferVerdict::Valid(Usdc::from_micros(1_000_000)));
    }

    #[tokio::test]
    async fn test_verify_transfer_failures() {
        let settings = PaymentSettings::for_tests();
        let chain = ScriptedChain::new();
        let minimum = Usdc::from_micros(1_000_000);

        // Unknown transaction
        let missing = verify_transfer(&chain, &settings, &tx_hash(2), minimum).await;
        assert!(matches!(missing, TransferVerdict::Invalid(_)));

        // Reverted
        let reverted = tx_hash(3);
        chain.answer(&reverted, Ok(Some(receipt(&reverted, 0, vec![]))));
        assert!(matches!(
            verify_transfer(&chain, &settings, &reverted, minimum).await,
            TransferVerdict::Invalid(_)
        ));

        // Timeout is neither valid nor invalid
        let slow = tx_hash(4);
        chain.answer(&slow, Err(ChainError::Timeout));
        assert!(matches!(
            verify_transfer(&chain, &settings, &slow, minimum).await,
            TransferVerdict::Indeterminate(_)
        ));

        // RPC errors are definitive
        let broken = tx_hash(5);
        chain.answer(&broken, Err(ChainError::Rpc { code: -32000, message: "bad".to_string() }));
        assert!(matches!(
            verify_transfer(&chain, &settings, &broken, minimum).await,
            TransferVerdict::Invalid(_)
        ));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }
}
