//! Pure lifecycle state machine. No I/O: the controller feeds it updates and
//! performs whatever [`Action`] comes back.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Created,
    LockupPending,
    LockupConfirmed,
    ClaimPending,
    ClaimConfirmed,
    LockupFailed,
    ClaimFailed,
}

impl SwapStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapStatus::ClaimConfirmed | SwapStatus::LockupFailed | SwapStatus::ClaimFailed
        )
    }

    /// Failures before the lockup is confirmed are lockup failures, later
    /// ones are claim failures.
    fn failure(self) -> SwapStatus {
        match self {
            SwapStatus::Created | SwapStatus::LockupPending => SwapStatus::LockupFailed,
            _ => SwapStatus::ClaimFailed,
        }
    }
}

/// Status strings pushed by the service on the `swap.update` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapUpdate {
    Created,
    TransactionLockup,
    ServerMempool,
    ServerConfirmed,
    Claimed,
    LockupFailed,
    ClaimFailed,
    Expired,
    Unknown(String),
}

impl SwapUpdate {
    pub fn parse(status: &str) -> Self {
        match status {
            "swap.created" => SwapUpdate::Created,
            "transaction.lockup" => SwapUpdate::TransactionLockup,
            "transaction.server.mempool" => SwapUpdate::ServerMempool,
            "transaction.server.confirmed" => SwapUpdate::ServerConfirmed,
            "transaction.claimed" => SwapUpdate::Claimed,
            "transaction.lockupFailed" => SwapUpdate::LockupFailed,
            "transaction.claimFailed" => SwapUpdate::ClaimFailed,
            "swap.expired" => SwapUpdate::Expired,
            other => SwapUpdate::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    RecordLockup,
    /// Keep the server's lockup transaction and wait for confirmation.
    AwaitConfirmation,
    RunClaim,
    /// Terminal state reached; stop listening.
    Unsubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SwapStatus,
    pub to: SwapStatus,
    pub action: Action,
}

#[derive(Debug, Clone)]
pub struct SwapStateMachine {
    status: SwapStatus,
}

impl Default for SwapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapStateMachine {
    pub fn new() -> Self {
        Self {
            status: SwapStatus::Created,
        }
    }

    pub fn status(&self) -> SwapStatus {
        self.status
    }

    /// Applies an update. `None` means the update does not apply in the
    /// current state and was ignored.
    pub fn apply(&mut self, update: &SwapUpdate) -> Option<Transition> {
        use SwapStatus as S;

        let from = self.status;
        if from.is_terminal() {
            return None;
        }

        let (to, action) = match (from, update) {
            (S::Created, SwapUpdate::Created) => (S::LockupPending, Action::None),
            (S::LockupPending, SwapUpdate::TransactionLockup) => {
                (S::LockupConfirmed, Action::RecordLockup)
            }
            (S::LockupConfirmed | S::ClaimPending, SwapUpdate::ServerMempool) => {
                (S::ClaimPending, Action::AwaitConfirmation)
            }
            // A confirmed server lockup subsumes the mempool notification.
            (S::LockupConfirmed | S::ClaimPending, SwapUpdate::ServerConfirmed) => {
                (S::ClaimPending, Action::RunClaim)
            }
            (_, SwapUpdate::Claimed) => (S::ClaimConfirmed, Action::Unsubscribe),
            (_, SwapUpdate::LockupFailed | SwapUpdate::ClaimFailed | SwapUpdate::Expired) => {
                (from.failure(), Action::Unsubscribe)
            }
            _ => return None,
        };

        self.status = to;
        Some(Transition { from, to, action })
    }

    /// Outcome of the claim pipeline started by [`Action::RunClaim`].
    pub fn claim_succeeded(&mut self) -> Option<Transition> {
        self.settle(SwapStatus::ClaimPending, SwapStatus::ClaimConfirmed)
    }

    pub fn claim_failed(&mut self) -> Option<Transition> {
        self.settle(SwapStatus::ClaimPending, SwapStatus::ClaimFailed)
    }

    /// No lockup within the configured window.
    pub fn lockup_timed_out(&mut self) -> Option<Transition> {
        match self.status {
            SwapStatus::Created | SwapStatus::LockupPending => {
                self.settle(self.status, SwapStatus::LockupFailed)
            }
            _ => None,
        }
    }

    /// The event stream is gone for good; fail according to the phase.
    pub fn stream_lost(&mut self) -> Option<Transition> {
        if self.status.is_terminal() {
            return None;
        }
        self.settle(self.status, self.status.failure())
    }

    fn settle(&mut self, expected: SwapStatus, to: SwapStatus) -> Option<Transition> {
        if self.status != expected {
            return None;
        }
        let from = self.status;
        self.status = to;
        Some(Transition {
            from,
            to,
            action: Action::Unsubscribe,
        })
    }
}
