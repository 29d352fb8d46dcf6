use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::swap::state::SwapUpdate;

pub const SWAP_UPDATE_CHANNEL: &str = "swap.update";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTransaction {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
}

/// One `swap.update` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEvent {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<EventTransaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SwapEvent {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            transaction: None,
            failure_reason: None,
        }
    }

    pub fn with_transaction(mut self, id: impl Into<String>, hex: Option<String>) -> Self {
        self.transaction = Some(EventTransaction { id: id.into(), hex });
        self
    }

    pub fn update(&self) -> SwapUpdate {
        SwapUpdate::parse(&self.status)
    }
}

/// Subscription side of the event stream. Notifications are delivered
/// separately through a channel so handlers never run inside the transport.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn subscribe(&self, channel: &str, swap_ids: &[String]) -> Result<(), SwapError>;

    async fn unsubscribe(&self, channel: &str, swap_ids: &[String]) -> Result<(), SwapError>;
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamRequest<'a> {
    pub op: &'a str,
    pub channel: &'a str,
    pub args: &'a [String],
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    args: Vec<serde_json::Value>,
}

/// Swap events carried by one stream frame. Acks, pongs and other channels
/// yield nothing.
pub fn parse_notification(text: &str) -> Result<Vec<SwapEvent>, SwapError> {
    let message: StreamMessage = serde_json::from_str(text)?;
    if message.event != "update" || message.channel.as_deref() != Some(SWAP_UPDATE_CHANNEL) {
        return Ok(Vec::new());
    }
    message
        .args
        .into_iter()
        .map(|arg| serde_json::from_value(arg).map_err(SwapError::from))
        .collect()
}
