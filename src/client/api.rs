//! Chain-swap service API: wire types and the [`SwapService`] seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::swap::tree::SwapTree;
use crate::swap::{Chain, FeeRate};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSwapRequest {
    pub from: String,
    pub to: String,
    pub preimage_hash: String,
    pub claim_public_key: String,
    pub refund_public_key: String,
    pub user_lock_amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_hash: Option<String>,
}

/// One side of a chain swap as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSwapDetails {
    pub swap_tree: SwapTree,
    pub lockup_address: String,
    pub server_public_key: String,
    pub timeout_block_height: u32,
    pub amount: u64,
    /// Private blinding key of the lockup output on the confidential chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blinding_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bip21: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSwapResponse {
    pub id: String,
    pub claim_details: ChainSwapDetails,
    pub lockup_details: ChainSwapDetails,
}

/// The service's request for our partial signature on its own claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDetails {
    pub pub_nonce: String,
    pub public_key: String,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSignature {
    pub pub_nonce: String,
    pub partial_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToSign {
    pub index: u32,
    pub transaction: String,
    pub pub_nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitClaimRequest {
    pub preimage: String,
    pub signature: PartialSignature,
    pub to_sign: ToSign,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSchedule {
    /// Service fee in percent of the lock amount.
    pub percentage: f64,
    pub server_miner_fee: u64,
    pub user_claim_miner_fee: u64,
    pub user_lockup_miner_fee: u64,
}

impl FeeSchedule {
    pub fn service_fee(&self, amount: u64) -> u64 {
        (amount as f64 * self.percentage / 100.0).ceil() as u64
    }

    /// What the service should lock for a user lock of `amount`.
    pub fn server_lock_amount(&self, amount: u64) -> Result<u64, SwapError> {
        let fees = self.service_fee(amount) + self.server_miner_fee;
        amount
            .checked_sub(fees)
            .filter(|v| *v > 0)
            .ok_or(SwapError::InsufficientFunds {
                input: amount,
                fee: fees,
            })
    }
}

#[async_trait]
pub trait SwapService: Send + Sync {
    async fn create_swap(&self, request: &CreateSwapRequest)
    -> Result<CreateSwapResponse, SwapError>;

    async fn get_claim_details(&self, swap_id: &str) -> Result<ClaimDetails, SwapError>;

    async fn submit_claim(
        &self,
        swap_id: &str,
        request: &SubmitClaimRequest,
    ) -> Result<PartialSignature, SwapError>;

    /// Returns the broadcast transaction id.
    async fn broadcast(&self, chain: Chain, tx_hex: &str) -> Result<String, SwapError>;

    async fn get_fee_schedule(&self, from: Chain, to: Chain) -> Result<FeeSchedule, SwapError>;

    async fn get_network_fee_rate(&self, chain: Chain) -> Result<FeeRate, SwapError>;
}
