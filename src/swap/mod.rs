pub mod claim;
pub mod controller;
pub mod detector;
pub mod dispatcher;
pub mod musig;
pub mod state;
pub mod tree;

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::{Hash as _, hash160, sha256};
use lwk_wollet::ElementsNetwork;
use lwk_wollet::elements::secp256k1_zkp::{PublicKey, SecretKey};
use lwk_wollet::elements::{AddressParams, BlockHash};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};

use crate::error::SwapError;

pub use state::SwapStatus;
pub use tree::SwapTree;

const LIQUID_GENESIS: &str = "1466275836220db2944ca059a3a10ef6fd2ea684b0688d2c379296888a206003";
const LIQUID_TESTNET_GENESIS: &str =
    "a771da8e52ee6ad581ed1e9a99825e5b3b7992225534eaa2ae23244fe26ab1c1";
const LIQUID_REGTEST_GENESIS: &str =
    "00902a6b70c2ca83b5d9c815d96a0e2f4202179316970d14ea1847dae5b1ca21";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Bitcoin,
    Liquid,
}

impl Chain {
    /// Ticker the service uses for the chain's native asset.
    pub fn symbol(self) -> &'static str {
        match self {
            Chain::Bitcoin => "BTC",
            Chain::Liquid => "L-BTC",
        }
    }

    pub fn is_confidential(self) -> bool {
        matches!(self, Chain::Liquid)
    }

    /// Tapscript leaf version the service uses for swap trees on this chain.
    pub fn leaf_version(self) -> u8 {
        match self {
            Chain::Bitcoin => 0xc0,
            Chain::Liquid => 0xc4,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Which chain we lock on and which chain we claim from. One engine serves
/// both directions; only the chain roles are swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    BitcoinToLiquid,
    LiquidToBitcoin,
}

impl Direction {
    pub fn lockup_chain(self) -> Chain {
        match self {
            Direction::BitcoinToLiquid => Chain::Bitcoin,
            Direction::LiquidToBitcoin => Chain::Liquid,
        }
    }

    pub fn claim_chain(self) -> Chain {
        match self {
            Direction::BitcoinToLiquid => Chain::Liquid,
            Direction::LiquidToBitcoin => Chain::Bitcoin,
        }
    }
}

impl FromStr for Direction {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btc-to-lbtc" | "bitcoin_to_liquid" => Ok(Direction::BitcoinToLiquid),
            "lbtc-to-btc" | "liquid_to_bitcoin" => Ok(Direction::LiquidToBitcoin),
            other => Err(SwapError::Encoding(format!("unknown direction: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    pub fn elements(self) -> ElementsNetwork {
        match self {
            Network::Mainnet => ElementsNetwork::Liquid,
            Network::Testnet => ElementsNetwork::LiquidTestnet,
            Network::Regtest => ElementsNetwork::default_regtest(),
        }
    }

    pub fn address_params(self) -> &'static AddressParams {
        self.elements().address_params()
    }

    pub fn liquid_genesis_hash(self) -> Result<BlockHash, SwapError> {
        let hex = match self {
            Network::Mainnet => LIQUID_GENESIS,
            Network::Testnet => LIQUID_TESTNET_GENESIS,
            Network::Regtest => LIQUID_REGTEST_GENESIS,
        };
        BlockHash::from_str(hex).map_err(|e| SwapError::Encoding(format!("genesis hash: {e}")))
    }
}

impl FromStr for Network {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(SwapError::Encoding(format!("unknown network: {other}"))),
        }
    }
}

/// Target fee rate in sat/vbyte. Always finite and positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct FeeRate(f64);

impl FeeRate {
    pub fn from_sat_per_vbyte(rate: f64) -> Result<Self, SwapError> {
        if rate.is_finite() && rate > 0.0 {
            Ok(Self(rate))
        } else {
            Err(SwapError::InvalidFeeRate(rate))
        }
    }

    pub fn sat_per_vbyte(self) -> f64 {
        self.0
    }

    pub fn fee_for_vsize(self, vsize: u64) -> u64 {
        (vsize as f64 * self.0).ceil() as u64
    }
}

impl TryFrom<f64> for FeeRate {
    type Error = SwapError;

    fn try_from(rate: f64) -> Result<Self, Self::Error> {
        Self::from_sat_per_vbyte(rate)
    }
}

impl From<FeeRate> for f64 {
    fn from(rate: FeeRate) -> Self {
        rate.0
    }
}

/// Swap secret. Never logged; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Preimage([u8; 32]);

impl Preimage {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn sha256(&self) -> [u8; 32] {
        sha256::Hash::hash(&self.0).to_byte_array()
    }

    /// RIPEMD160(SHA256(preimage)), the value the claim leaf commits to.
    pub fn hash160(&self) -> [u8; 20] {
        hash160::Hash::hash(&self.0).to_byte_array()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage(<redacted>)")
    }
}

/// Everything the service told us at registration, validated and decoded.
/// Immutable once built; the lifecycle status lives in the controller.
#[derive(Debug, Clone)]
pub struct SwapRecord {
    pub swap_id: String,
    pub direction: Direction,
    pub network: Network,
    pub user_address: String,
    pub lock_amount: u64,
    pub lockup_address: String,
    pub bip21: Option<String>,

    pub claim_public_key: PublicKey,
    pub claim_tree: SwapTree,
    pub claim_blinding_key: Option<SecretKey>,

    pub lockup_public_key: PublicKey,
    pub lockup_tree: SwapTree,

    pub preimage: Preimage,
    pub fee_rate: FeeRate,
    /// Quoted server lockup plus user claim miner fee. The fee the claim
    /// transaction really pays is reported on the swap outcome.
    pub miner_fees: u64,
    pub service_fee: u64,
    /// Minimum value the service must lock for us to claim.
    pub expected_claim_amount: u64,
}
