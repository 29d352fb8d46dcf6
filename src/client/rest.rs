use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::api::{
    ClaimDetails, CreateSwapRequest, CreateSwapResponse, FeeSchedule, PartialSignature,
    SubmitClaimRequest, SwapService,
};
use crate::error::SwapError;
use crate::swap::{Chain, FeeRate};

/// REST adapter for the v2 chain-swap API.
#[derive(Debug, Clone)]
pub struct SwapServiceClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TransactionId {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainPair {
    fees: PairFees,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairFees {
    percentage: f64,
    miner_fees: MinerFees,
}

#[derive(Debug, Deserialize)]
struct MinerFees {
    server: u64,
    user: UserMinerFees,
}

#[derive(Debug, Deserialize)]
struct UserMinerFees {
    claim: u64,
    lockup: u64,
}

impl SwapServiceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SwapError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// 2xx bodies decode into `T`; 4xx is the service refusing, 5xx is transport.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T, SwapError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| SwapError::Encoding(format!("{what}: {e}")));
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    if status.is_server_error() {
        Err(SwapError::Transport(format!("{what}: {status}: {message}")))
    } else {
        Err(SwapError::RemoteRejected(format!("{what}: {status}: {message}")))
    }
}

#[async_trait]
impl SwapService for SwapServiceClient {
    async fn create_swap(
        &self,
        request: &CreateSwapRequest,
    ) -> Result<CreateSwapResponse, SwapError> {
        let resp = self
            .http
            .post(self.url("/v2/swap/chain"))
            .json(request)
            .send()
            .await?;
        decode(resp, "create swap").await
    }

    async fn get_claim_details(&self, swap_id: &str) -> Result<ClaimDetails, SwapError> {
        let resp = self
            .http
            .get(self.url(&format!("/v2/swap/chain/{swap_id}/claim")))
            .send()
            .await?;
        decode(resp, "get claim details").await
    }

    async fn submit_claim(
        &self,
        swap_id: &str,
        request: &SubmitClaimRequest,
    ) -> Result<PartialSignature, SwapError> {
        let resp = self
            .http
            .post(self.url(&format!("/v2/swap/chain/{swap_id}/claim")))
            .json(request)
            .send()
            .await?;
        decode(resp, "submit claim").await
    }

    async fn broadcast(&self, chain: Chain, tx_hex: &str) -> Result<String, SwapError> {
        let resp = self
            .http
            .post(self.url(&format!("/v2/chain/{}/transaction", chain.symbol())))
            .json(&serde_json::json!({ "hex": tx_hex }))
            .send()
            .await?;
        let id: TransactionId = decode(resp, "broadcast").await?;
        Ok(id.id)
    }

    async fn get_fee_schedule(&self, from: Chain, to: Chain) -> Result<FeeSchedule, SwapError> {
        let resp = self.http.get(self.url("/v2/swap/chain")).send().await?;
        let pairs: HashMap<String, HashMap<String, ChainPair>> =
            decode(resp, "get chain pairs").await?;
        let pair = pairs
            .get(from.symbol())
            .and_then(|to_map| to_map.get(to.symbol()))
            .ok_or_else(|| SwapError::RemoteRejected(format!("pair {from}/{to} not offered")))?;

        Ok(FeeSchedule {
            percentage: pair.fees.percentage,
            server_miner_fee: pair.fees.miner_fees.server,
            user_claim_miner_fee: pair.fees.miner_fees.user.claim,
            user_lockup_miner_fee: pair.fees.miner_fees.user.lockup,
        })
    }

    async fn get_network_fee_rate(&self, chain: Chain) -> Result<FeeRate, SwapError> {
        let resp = self.http.get(self.url("/v2/chain/fees")).send().await?;
        let rates: HashMap<String, f64> = decode(resp, "get fee rates").await?;
        rates
            .get(chain.symbol())
            .copied()
            .ok_or_else(|| SwapError::RemoteRejected(format!("no fee rate for {chain}")))
            .and_then(FeeRate::from_sat_per_vbyte)
    }
}
