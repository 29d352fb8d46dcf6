use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::controller::{SwapController, SwapOutcome};
use crate::client::events::SwapEvent;
use crate::error::SwapError;

const ROUTE_BUFFER: usize = 32;

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<SwapEvent>>>>;

/// Fans a single event stream out to per-swap controllers keyed by swap id.
#[derive(Debug, Clone)]
pub struct SwapDispatcher {
    routes: Routes,
}

impl SwapDispatcher {
    pub fn spawn(mut source: mpsc::Receiver<SwapEvent>) -> Self {
        let routes: Routes = Arc::default();
        let task_routes = routes.clone();
        tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                let route = task_routes
                    .lock()
                    .expect("dispatcher routes poisoned")
                    .get(&event.id)
                    .cloned();
                let Some(route) = route else {
                    tracing::debug!(swap_id = %event.id, "no controller for event");
                    continue;
                };
                // A busy controller must not hold up the other swaps.
                match route.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        tracing::warn!(
                            swap_id = %event.id,
                            status = %event.status,
                            "controller backlog full, dropping event"
                        );
                    }
                    Err(TrySendError::Closed(event)) => {
                        tracing::debug!(swap_id = %event.id, "controller gone, dropping route");
                        task_routes
                            .lock()
                            .expect("dispatcher routes poisoned")
                            .remove(&event.id);
                    }
                }
            }
            tracing::debug!("event source closed");
        });
        Self { routes }
    }

    /// Starts routing events for `swap_id` to the returned receiver.
    pub fn track(&self, swap_id: &str) -> mpsc::Receiver<SwapEvent> {
        let (tx, rx) = mpsc::channel(ROUTE_BUFFER);
        self.routes
            .lock()
            .expect("dispatcher routes poisoned")
            .insert(swap_id.to_string(), tx);
        rx
    }

    /// Runs `controller` on its routed events and drops the route once the
    /// swap is over.
    pub async fn drive(&self, controller: SwapController) -> Result<SwapOutcome, SwapError> {
        let swap_id = controller.record().swap_id.clone();
        let updates = self.track(&swap_id);
        let outcome = controller.run(updates).await;
        self.untrack(&swap_id);
        outcome
    }

    pub fn untrack(&self, swap_id: &str) {
        self.routes
            .lock()
            .expect("dispatcher routes poisoned")
            .remove(swap_id);
    }

    pub fn tracked(&self) -> usize {
        self.routes.lock().expect("dispatcher routes poisoned").len()
    }
}
