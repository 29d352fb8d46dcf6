//! Swap lifecycle: registration, event handling and the cooperative claim.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use lwk_wollet::elements;
use lwk_wollet::elements::secp256k1_zkp::{PublicKey, SecretKey};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::claim::{self, ClaimParams, Confidentiality, UnsignedClaim};
use super::detector::{self, LockupTransaction, SwapOutput};
use super::musig::{
    SigningSession, decode_partial_signature, decode_pub_nonce, encode_partial_signature,
    encode_pub_nonce, tweaked_output_key,
};
use super::state::{Action, SwapStateMachine, SwapStatus, Transition};
use super::{Chain, Direction, FeeRate, Network, Preimage, SwapRecord};
use crate::client::api::{
    ChainSwapDetails, CreateSwapRequest, PartialSignature, SubmitClaimRequest, SwapService,
    ToSign,
};
use crate::client::events::{EventStream, SWAP_UPDATE_CHANNEL, SwapEvent};
use crate::error::SwapError;
use crate::keys::KeyCustody;

#[derive(Debug, Clone)]
pub struct SwapRequest {
    pub direction: Direction,
    pub network: Network,
    pub amount: u64,
    pub destination: String,
    pub fee_rate: Option<FeeRate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub confidentiality: Confidentiality,
    /// Attempts per confirmed-lockup event; only transport errors are retried.
    pub claim_attempts: u32,
    pub max_detection_attempts: u32,
    pub lockup_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            confidentiality: Confidentiality::Mandatory,
            claim_attempts: 2,
            max_detection_attempts: 3,
            lockup_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOutcome {
    pub swap_id: String,
    pub status: SwapStatus,
    pub lockup_txid: Option<String>,
    pub claim_txid: Option<String>,
    /// Fee actually paid by the broadcast claim transaction.
    pub claim_fee: Option<u64>,
}

/// State carried through one claim attempt. Built fresh per attempt and
/// dropped afterwards, so its session never outlives the attempt.
#[derive(Debug)]
pub struct ClaimContext {
    pub session: SigningSession,
    pub transaction: UnsignedClaim,
    pub remote_public_key: PublicKey,
}

impl ClaimContext {
    pub fn output(&self) -> &SwapOutput {
        &self.transaction.output
    }
}

/// Creates the swap with the service and checks everything it returned
/// against our own keys and preimage before anything is funded.
pub async fn register_swap(
    service: &dyn SwapService,
    custody: &dyn KeyCustody,
    request: &SwapRequest,
) -> Result<SwapRecord, SwapError> {
    let lockup_chain = request.direction.lockup_chain();
    let claim_chain = request.direction.claim_chain();

    let fees = service.get_fee_schedule(lockup_chain, claim_chain).await?;
    let expected_claim_amount = fees.server_lock_amount(request.amount)?;
    let fee_rate = match request.fee_rate {
        Some(rate) => rate,
        None => service.get_network_fee_rate(claim_chain).await?,
    };

    let preimage = Preimage::random();
    let our_key = hex::encode(custody.public_key().serialize());
    let response = service
        .create_swap(&CreateSwapRequest {
            from: lockup_chain.symbol().to_string(),
            to: claim_chain.symbol().to_string(),
            preimage_hash: hex::encode(preimage.sha256()),
            claim_public_key: our_key.clone(),
            refund_public_key: our_key,
            user_lock_amount: request.amount,
            claim_address: Some(request.destination.clone()),
            pair_hash: None,
        })
        .await?;

    let claim = &response.claim_details;
    let lockup = &response.lockup_details;
    let record = SwapRecord {
        swap_id: response.id.clone(),
        direction: request.direction,
        network: request.network,
        user_address: request.destination.clone(),
        lock_amount: request.amount,
        lockup_address: lockup.lockup_address.clone(),
        bip21: lockup.bip21.clone(),
        claim_public_key: parse_public_key(&claim.server_public_key)?,
        claim_tree: claim.swap_tree.clone(),
        claim_blinding_key: claim
            .blinding_key
            .as_deref()
            .map(parse_secret_key)
            .transpose()?,
        lockup_public_key: parse_public_key(&lockup.server_public_key)?,
        lockup_tree: lockup.swap_tree.clone(),
        preimage,
        fee_rate,
        miner_fees: fees.server_miner_fee + fees.user_claim_miner_fee,
        service_fee: fees.service_fee(request.amount),
        expected_claim_amount,
    };

    validate_record(&record, custody, claim, lockup)?;
    tracing::info!(
        swap_id = %record.swap_id,
        lockup_address = %record.lockup_address,
        amount = record.lock_amount,
        expected_claim_amount,
        "swap registered"
    );
    Ok(record)
}

fn validate_record(
    record: &SwapRecord,
    custody: &dyn KeyCustody,
    claim: &ChainSwapDetails,
    lockup: &ChainSwapDetails,
) -> Result<(), SwapError> {
    let ours = custody.x_only_public_key();

    let claim_leaf = record.claim_tree.claim()?;
    if claim_leaf.preimage_hash160 != record.preimage.hash160() {
        return Err(SwapError::InvalidSwapTree(
            "claim leaf does not commit to our preimage".to_string(),
        ));
    }
    if claim_leaf.claim_key != ours {
        return Err(SwapError::InvalidSwapTree(
            "claim leaf does not pay our key".to_string(),
        ));
    }
    if record.lockup_tree.refund()?.refund_key != ours {
        return Err(SwapError::InvalidSwapTree(
            "lockup refund leaf does not refund to our key".to_string(),
        ));
    }

    let lockup_chain = record.direction.lockup_chain();
    let expected = tweaked_output_key(
        lockup_chain,
        &record.lockup_tree,
        record.lockup_public_key,
        custody.public_key(),
    )?;
    let program = address_program(lockup_chain, record.network, &record.lockup_address)?;
    if program != expected.serialize() {
        return Err(SwapError::InvalidSwapTree(format!(
            "lockup address {} does not match the lockup tree",
            record.lockup_address
        )));
    }

    if claim.amount < record.expected_claim_amount {
        return Err(SwapError::RemoteRejected(format!(
            "service offers {} sat, expected at least {}",
            claim.amount, record.expected_claim_amount
        )));
    }
    if lockup.amount != record.lock_amount {
        return Err(SwapError::RemoteRejected(format!(
            "service expects a lockup of {} sat, requested {}",
            lockup.amount, record.lock_amount
        )));
    }
    Ok(())
}

fn address_program(chain: Chain, network: Network, address: &str) -> Result<[u8; 32], SwapError> {
    let script = match chain {
        Chain::Bitcoin => bitcoin::Address::from_str(address)
            .map_err(|e| SwapError::InvalidAddress(format!("{address}: {e}")))?
            .require_network(network.bitcoin())
            .map_err(|e| SwapError::InvalidAddress(format!("{address}: {e}")))?
            .script_pubkey()
            .into_bytes(),
        Chain::Liquid => {
            let parsed = elements::Address::from_str(address)
                .map_err(|e| SwapError::InvalidAddress(format!("{address}: {e}")))?;
            if parsed.params != network.address_params() {
                return Err(SwapError::InvalidAddress(format!(
                    "{address} is not a {network:?} address"
                )));
            }
            parsed.script_pubkey().into_bytes()
        }
    };
    detector::p2tr_program(&script)
        .ok_or_else(|| SwapError::InvalidAddress(format!("{address} is not a taproot address")))
}

fn parse_public_key(hex_key: &str) -> Result<PublicKey, SwapError> {
    PublicKey::from_str(hex_key)
        .map_err(|e| SwapError::Encoding(format!("public key {hex_key}: {e}")))
}

fn parse_secret_key(hex_key: &str) -> Result<SecretKey, SwapError> {
    SecretKey::from_str(hex_key).map_err(|e| SwapError::Encoding(format!("blinding key: {e}")))
}

fn parse_hash(hex_hash: &str) -> Result<[u8; 32], SwapError> {
    hex::decode(hex_hash)?
        .try_into()
        .map_err(|_| SwapError::Encoding("transaction hash must be 32 bytes".to_string()))
}

/// Drives one swap from registration to a terminal status.
pub struct SwapController {
    record: SwapRecord,
    service: Arc<dyn SwapService>,
    events: Arc<dyn EventStream>,
    custody: Arc<dyn KeyCustody>,
    settings: ControllerSettings,
    machine: SwapStateMachine,
    lockup_txid: Option<String>,
    server_lockup: Option<LockupTransaction>,
    claim_txid: Option<String>,
    claim_fee: Option<u64>,
    detection_attempts: u32,
    unsubscribed: bool,
}

impl SwapController {
    pub fn new(
        record: SwapRecord,
        service: Arc<dyn SwapService>,
        events: Arc<dyn EventStream>,
        custody: Arc<dyn KeyCustody>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            record,
            service,
            events,
            custody,
            settings,
            machine: SwapStateMachine::new(),
            lockup_txid: None,
            server_lockup: None,
            claim_txid: None,
            claim_fee: None,
            detection_attempts: 0,
            unsubscribed: false,
        }
    }

    pub fn record(&self) -> &SwapRecord {
        &self.record
    }

    pub fn status(&self) -> SwapStatus {
        self.machine.status()
    }

    pub fn outcome(&self) -> SwapOutcome {
        SwapOutcome {
            swap_id: self.record.swap_id.clone(),
            status: self.machine.status(),
            lockup_txid: self.lockup_txid.clone(),
            claim_txid: self.claim_txid.clone(),
            claim_fee: self.claim_fee,
        }
    }

    /// Subscribes, then handles events until a terminal status. A lockup
    /// timeout or the end of the event channel fails the swap.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<SwapEvent>,
    ) -> Result<SwapOutcome, SwapError> {
        self.events
            .subscribe(SWAP_UPDATE_CHANNEL, &[self.record.swap_id.clone()])
            .await?;
        let lockup_deadline = Instant::now() + self.settings.lockup_timeout;

        while !self.machine.status().is_terminal() {
            let awaiting_lockup = matches!(
                self.machine.status(),
                SwapStatus::Created | SwapStatus::LockupPending
            );
            let next = if awaiting_lockup {
                tokio::time::timeout_at(lockup_deadline, updates.recv()).await
            } else {
                Ok(updates.recv().await)
            };

            match next {
                Err(_) => {
                    if let Some(transition) = self.machine.lockup_timed_out() {
                        self.log_transition(&transition, "lockup timeout");
                        self.stop().await;
                    }
                }
                Ok(None) => {
                    tracing::warn!(swap_id = %self.record.swap_id, "event channel closed");
                    if let Some(transition) = self.machine.stream_lost() {
                        self.log_transition(&transition, "event stream lost");
                    }
                    self.stop().await;
                }
                Ok(Some(event)) => self.handle_event(event).await,
            }
        }

        Ok(self.outcome())
    }

    pub async fn handle_event(&mut self, event: SwapEvent) {
        if event.id != self.record.swap_id {
            tracing::debug!(swap_id = %event.id, "ignoring event for another swap");
            return;
        }

        let Some(transition) = self.machine.apply(&event.update()) else {
            tracing::debug!(
                swap_id = %self.record.swap_id,
                event = %event.status,
                status = ?self.machine.status(),
                "ignoring event"
            );
            return;
        };
        self.log_transition(&transition, &event.status);

        match transition.action {
            Action::None => {}
            Action::RecordLockup => {
                self.lockup_txid = event.transaction.map(|tx| tx.id);
            }
            Action::AwaitConfirmation => self.remember_server_lockup(&event),
            Action::RunClaim => {
                self.remember_server_lockup(&event);
                self.claim().await;
            }
            Action::Unsubscribe => self.stop().await,
        }
    }

    fn remember_server_lockup(&mut self, event: &SwapEvent) {
        let Some(tx_hex) = event.transaction.as_ref().and_then(|tx| tx.hex.as_deref()) else {
            return;
        };
        match LockupTransaction::from_hex(self.record.direction.claim_chain(), tx_hex) {
            Ok(tx) => {
                tracing::info!(
                    swap_id = %self.record.swap_id,
                    txid = %tx.txid(),
                    "server lockup transaction seen"
                );
                self.server_lockup = Some(tx);
            }
            Err(err) => tracing::warn!(
                swap_id = %self.record.swap_id,
                error = %err,
                "undecodable server lockup transaction"
            ),
        }
    }

    async fn claim(&mut self) {
        let Some(lockup) = self.server_lockup.clone() else {
            tracing::warn!(swap_id = %self.record.swap_id, "no server lockup transaction yet");
            self.detection_missed().await;
            return;
        };

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.claim_attempt(&lockup).await {
                Err(err) if err.is_transient() && attempt < self.settings.claim_attempts => {
                    tracing::warn!(
                        swap_id = %self.record.swap_id,
                        attempt,
                        error = %err,
                        "claim attempt failed, retrying with a fresh session"
                    );
                }
                other => break other,
            }
        };

        match result {
            Ok((txid, fee)) => {
                tracing::info!(swap_id = %self.record.swap_id, claim_txid = %txid, fee, "broadcast claim tx");
                self.claim_txid = Some(txid);
                self.claim_fee = Some(fee);
                if let Some(transition) = self.machine.claim_succeeded() {
                    self.log_transition(&transition, "claim broadcast");
                    self.stop().await;
                }
            }
            Err(SwapError::OutputNotFound { key }) => {
                tracing::info!(swap_id = %self.record.swap_id, %key, "swap output not visible yet");
                self.detection_missed().await;
            }
            Err(err) => {
                tracing::error!(swap_id = %self.record.swap_id, error = %err, "claim failed");
                self.fail_claim().await;
            }
        }
    }

    async fn detection_missed(&mut self) {
        self.detection_attempts += 1;
        if self.detection_attempts >= self.settings.max_detection_attempts {
            tracing::warn!(
                swap_id = %self.record.swap_id,
                attempts = self.detection_attempts,
                "giving up on detecting the swap output"
            );
            self.fail_claim().await;
        }
    }

    async fn fail_claim(&mut self) {
        if let Some(transition) = self.machine.claim_failed() {
            self.log_transition(&transition, "claim pipeline error");
            self.stop().await;
        }
    }

    async fn claim_attempt(
        &self,
        lockup: &LockupTransaction,
    ) -> Result<(String, u64), SwapError> {
        let record = &self.record;
        let claim_chain = record.direction.claim_chain();

        let mut session =
            SigningSession::new(claim_chain, self.custody.clone(), record.claim_public_key)?;
        let tweaked_key = session.tweak(&record.claim_tree)?;
        let output =
            detector::detect(&tweaked_key, lockup).ok_or_else(|| SwapError::OutputNotFound {
                key: hex::encode(tweaked_key.serialize()),
            })?;
        tracing::debug!(swap_id = %record.swap_id, vout = output.vout, "swap output detected");

        let transaction = claim::build(&output, &self.claim_params())?;
        if transaction.input_value < record.expected_claim_amount {
            return Err(SwapError::RemoteRejected(format!(
                "server locked {} sat, expected {}",
                transaction.input_value, record.expected_claim_amount
            )));
        }
        let mut context = ClaimContext {
            session,
            transaction,
            remote_public_key: record.claim_public_key,
        };
        let sighash = context.transaction.sighash()?;

        let their_partial = self.sign_server_claim().await?;
        let response = self
            .service
            .submit_claim(
                &record.swap_id,
                &SubmitClaimRequest {
                    preimage: record.preimage.to_hex(),
                    signature: their_partial,
                    to_sign: ToSign {
                        index: 0,
                        transaction: context.transaction.to_hex(),
                        pub_nonce: encode_pub_nonce(&context.session.pub_nonce()),
                    },
                },
            )
            .await?;

        let remote = context.remote_public_key;
        context
            .session
            .aggregate_nonces(&[(remote, decode_pub_nonce(&response.pub_nonce)?)])?;
        context.session.initialize_session(sighash)?;
        context.session.sign_partial()?;
        context
            .session
            .add_partial(remote, decode_partial_signature(&response.partial_signature)?)?;
        let signature = context.session.aggregate_partials()?;
        context.transaction.finalize(&signature);

        tracing::info!(
            swap_id = %record.swap_id,
            fee = context.transaction.fee,
            value = context.transaction.claim_value,
            "claim transaction signed"
        );
        let txid = self
            .service
            .broadcast(claim_chain, &context.transaction.to_hex())
            .await?;
        Ok((txid, context.transaction.fee))
    }

    /// Our partial signature for the service's claim of our lockup.
    async fn sign_server_claim(&self) -> Result<PartialSignature, SwapError> {
        let record = &self.record;
        let details = self.service.get_claim_details(&record.swap_id).await?;
        if parse_public_key(&details.public_key)? != record.lockup_public_key {
            return Err(SwapError::RemoteRejected(
                "claim details reference an unexpected server key".to_string(),
            ));
        }

        let mut session = SigningSession::new(
            record.direction.lockup_chain(),
            self.custody.clone(),
            record.lockup_public_key,
        )?;
        session.tweak(&record.lockup_tree)?;
        session.aggregate_nonces(&[(
            record.lockup_public_key,
            decode_pub_nonce(&details.pub_nonce)?,
        )])?;
        session.initialize_session(parse_hash(&details.transaction_hash)?)?;
        let partial = session.sign_partial()?;

        Ok(PartialSignature {
            pub_nonce: encode_pub_nonce(&session.pub_nonce()),
            partial_signature: encode_partial_signature(&partial),
        })
    }

    fn claim_params(&self) -> ClaimParams {
        ClaimParams {
            destination: self.record.user_address.clone(),
            fee_rate: self.record.fee_rate,
            network: self.record.network,
            blinding_key: self.record.claim_blinding_key,
            confidentiality: self.settings.confidentiality,
        }
    }

    async fn stop(&mut self) {
        if self.unsubscribed {
            return;
        }
        self.unsubscribed = true;
        if let Err(err) = self
            .events
            .unsubscribe(SWAP_UPDATE_CHANNEL, &[self.record.swap_id.clone()])
            .await
        {
            tracing::warn!(swap_id = %self.record.swap_id, error = %err, "unsubscribe failed");
        }
    }

    fn log_transition(&self, transition: &Transition, trigger: &str) {
        tracing::info!(
            swap_id = %self.record.swap_id,
            from = ?transition.from,
            to = ?transition.to,
            %trigger,
            "swap transition"
        );
    }
}
