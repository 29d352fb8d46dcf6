use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::swap::claim::Confidentiality;
use crate::swap::controller::ControllerSettings;
use crate::swap::{Direction, FeeRate, Network};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub service_url: String,
    pub ws_url: String,
    pub network: Network,
    pub direction: Direction,
    pub destination: Option<String>,
    /// sat/vbyte; overrides the service's rate when set.
    pub fee_rate: Option<f64>,
    pub confidentiality: Confidentiality,
    pub claim_attempts: u32,
    pub max_detection_attempts: u32,
    pub lockup_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: "https://api.boltz.exchange".to_string(),
            ws_url: "wss://api.boltz.exchange/v2/ws".to_string(),
            network: Network::Mainnet,
            direction: Direction::BitcoinToLiquid,
            destination: None,
            fee_rate: None,
            confidentiality: Confidentiality::Mandatory,
            claim_attempts: 2,
            max_detection_attempts: 3,
            lockup_timeout_secs: 24 * 60 * 60,
            request_timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, SwapError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn fee_rate_override(&self) -> Result<Option<FeeRate>, SwapError> {
        self.fee_rate.map(FeeRate::from_sat_per_vbyte).transpose()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            confidentiality: self.confidentiality,
            claim_attempts: self.claim_attempts.max(1),
            max_detection_attempts: self.max_detection_attempts.max(1),
            lockup_timeout: Duration::from_secs(self.lockup_timeout_secs),
        }
    }
}
