pub mod chain;
mod verifier;

pub use chain::{ChainRpc, JsonRpcChain};
pub use verifier::PaymentVerifier;
