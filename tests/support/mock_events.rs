use std::sync::Mutex;

use async_trait::async_trait;
use taproot_chain_swap::SwapError;
use taproot_chain_swap::client::EventStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCall {
    Subscribe(String, Vec<String>),
    Unsubscribe(String, Vec<String>),
}

/// Records subscription calls; events are fed to controllers directly.
#[derive(Debug, Default)]
pub struct MockEventStream {
    calls: Mutex<Vec<StreamCall>>,
}

impl MockEventStream {
    pub fn calls(&self) -> Vec<StreamCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub fn subscribes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StreamCall::Subscribe(..)))
            .count()
    }

    pub fn unsubscribes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StreamCall::Unsubscribe(..)))
            .count()
    }
}

#[async_trait]
impl EventStream for MockEventStream {
    async fn subscribe(&self, channel: &str, swap_ids: &[String]) -> Result<(), SwapError> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push(StreamCall::Subscribe(channel.to_string(), swap_ids.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, swap_ids: &[String]) -> Result<(), SwapError> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push(StreamCall::Unsubscribe(channel.to_string(), swap_ids.to_vec()));
        Ok(())
    }
}
