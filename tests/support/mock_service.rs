//! In-process swap service that plays the server's half of every MuSig
//! exchange with real signatures.

use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, ripemd160, sha256};
use lwk_wollet::elements;
use lwk_wollet::elements::secp256k1_zkp::{
    All, Keypair, Message, MusigAggNonce, MusigKeyAggCache, MusigPubNonce, MusigSecNonce,
    MusigSession, MusigSessionId, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey,
    new_musig_nonce_pair,
    schnorr,
};
use rand::RngCore as _;
use taproot_chain_swap::SwapError;
use taproot_chain_swap::client::api::{
    ChainSwapDetails, ClaimDetails, CreateSwapRequest, CreateSwapResponse, FeeSchedule,
    PartialSignature, SubmitClaimRequest, SwapService,
};
use taproot_chain_swap::swap::detector::LockupTransaction;
use taproot_chain_swap::swap::musig::{
    decode_partial_signature, decode_pub_nonce, encode_partial_signature, encode_pub_nonce,
};
use taproot_chain_swap::swap::tree::{ClaimLeaf, RefundLeaf};
use taproot_chain_swap::swap::{Chain, Direction, FeeRate, SwapTree};

use super::fixtures::{self, NETWORK};

pub const SWAP_ID: &str = "mock-swap";
pub const TIMEOUT_BLOCK_HEIGHT: u32 = 1_000;

pub fn fee_schedule() -> FeeSchedule {
    FeeSchedule {
        percentage: 0.1,
        server_miner_fee: 300,
        user_claim_miner_fee: 150,
        user_lockup_miner_fee: 200,
    }
}

/// Ways the mock misbehaves on purpose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tamper {
    #[default]
    None,
    /// Claim leaf commits to a preimage hash the client never sent.
    ForeignPreimage,
    /// Lockup address pays a key that is not derived from the lockup tree.
    ForeignLockupAddress,
    /// Partial signatures on the client's claim are garbage.
    BadPartial,
    /// Liquid lockups are blinded to a key handed out as `blindingKey`.
    Confidential,
}

struct ActiveSwap {
    user: PublicKey,
    preimage_hash: [u8; 32],
    claim_cache: MusigKeyAggCache,
    claim_key: XOnlyPublicKey,
    lockup_cache: MusigKeyAggCache,
    blinding_key: Option<SecretKey>,
    pending: Option<PendingClaim>,
}

/// Server nonce and message handed out by `get_claim_details`.
struct PendingClaim {
    pub_nonce: MusigPubNonce,
    message: [u8; 32],
}

#[derive(Default)]
struct State {
    swap: Option<ActiveSwap>,
    lockups: Vec<LockupTransaction>,
    submitted_nonces: Vec<String>,
    broadcasts: Vec<String>,
    failing_broadcasts: usize,
}

pub struct MockSwapService {
    direction: Direction,
    secp: Secp256k1<All>,
    server: Keypair,
    tamper: Tamper,
    state: Mutex<State>,
}

impl MockSwapService {
    pub fn new(direction: Direction) -> Self {
        Self::with_tamper(direction, Tamper::None)
    }

    pub fn with_tamper(direction: Direction, tamper: Tamper) -> Self {
        Self {
            direction,
            secp: Secp256k1::new(),
            server: fixtures::keypair(0x55),
            tamper,
            state: Mutex::new(State::default()),
        }
    }

    pub fn server_public_key(&self) -> PublicKey {
        self.server.public_key()
    }

    /// Server lockup on the claim chain; the swap output sits at index 1.
    pub fn lock_funds(&self, value: u64) -> String {
        let mut state = self.state.lock().expect("state mutex poisoned");
        let swap = state.swap.as_ref().expect("swap registered");
        let tx = match swap.blinding_key {
            Some(blinding_key) => fixtures::confidential_lockup_transaction(
                swap.claim_key,
                value,
                PublicKey::from_secret_key(&self.secp, &blinding_key),
            )
            .expect("blind lockup output"),
            None => fixtures::lockup_transaction(
                self.direction.claim_chain(),
                Some(swap.claim_key),
                value,
            ),
        };
        let tx_hex = fixtures::to_hex(&tx);
        state.lockups.push(tx);
        tx_hex
    }

    /// Lockup that only pays decoys.
    pub fn lock_elsewhere(&self, value: u64) -> String {
        fixtures::to_hex(&fixtures::lockup_transaction(
            self.direction.claim_chain(),
            None,
            value,
        ))
    }

    pub fn lockup_hex(&self, index: usize) -> Option<String> {
        self.state
            .lock()
            .expect("state mutex poisoned")
            .lockups
            .get(index)
            .map(fixtures::to_hex)
    }

    pub fn fail_next_broadcasts(&self, count: usize) {
        self.state.lock().expect("state mutex poisoned").failing_broadcasts = count;
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().expect("state mutex poisoned").broadcasts.clone()
    }

    pub fn submitted_nonces(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("state mutex poisoned")
            .submitted_nonces
            .clone()
    }

    fn tweaked_cache(
        &self,
        chain: Chain,
        tree: &SwapTree,
        user: PublicKey,
    ) -> Result<(MusigKeyAggCache, XOnlyPublicKey), SwapError> {
        let mut cache = MusigKeyAggCache::new(&self.secp, &[self.server.public_key(), user]);
        let tweak = tree.tap_tweak(chain, cache.agg_pk())?;
        let tweaked = cache
            .pubkey_xonly_tweak_add(&self.secp, tweak)
            .map_err(|e| SwapError::Crypto(format!("{e:?}")))?;
        Ok((cache, tweaked.x_only_public_key().0))
    }

    fn details(
        &self,
        chain: Chain,
        tree: SwapTree,
        address_key: XOnlyPublicKey,
        amount: u64,
        blinding_key: Option<SecretKey>,
    ) -> Result<ChainSwapDetails, SwapError> {
        let lockup_address = fixtures::p2tr_address(chain, address_key)
            .map_err(|e| SwapError::InvalidAddress(e.to_string()))?;
        Ok(ChainSwapDetails {
            swap_tree: tree,
            bip21: Some(format!("{}:{lockup_address}?amount={amount}", chain.symbol())),
            lockup_address,
            server_public_key: self.server.public_key().to_string(),
            timeout_block_height: TIMEOUT_BLOCK_HEIGHT,
            amount,
            blinding_key: blinding_key.map(|key| hex::encode(key.secret_bytes())),
        })
    }

    fn fresh_nonce(&self) -> Result<(MusigSecNonce, MusigPubNonce), SwapError> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        new_musig_nonce_pair(
            &self.secp,
            MusigSessionId::assume_unique_per_nonce_gen(seed),
            None,
            None,
            self.server.public_key(),
            None,
            None,
        )
        .map_err(|e| SwapError::Crypto(format!("{e:?}")))
    }

    /// Key-path sighash of input 0 of a claim spending one of our lockups.
    fn claim_sighash(&self, state: &State, tx_hex: &str) -> Result<([u8; 32], Vec<u8>), SwapError> {
        let chain = self.direction.claim_chain();
        match chain {
            Chain::Bitcoin => {
                use bitcoin::sighash::{Prevouts, SighashCache};

                let tx: bitcoin::Transaction =
                    bitcoin::consensus::encode::deserialize(&hex::decode(tx_hex)?)
                        .map_err(|e| SwapError::Encoding(e.to_string()))?;
                let input = tx.input.first().ok_or_else(|| reject("claim has no inputs"))?;
                let prevout = state
                    .lockups
                    .iter()
                    .find_map(|lockup| match lockup {
                        LockupTransaction::Bitcoin(lockup)
                            if lockup.compute_txid() == input.previous_output.txid =>
                        {
                            lockup.output.get(input.previous_output.vout as usize).cloned()
                        }
                        _ => None,
                    })
                    .ok_or_else(|| reject("claim spends an unknown output"))?;
                let witness = input.witness.iter().next().map(<[u8]>::to_vec).unwrap_or_default();
                let sighash = SighashCache::new(&tx)
                    .taproot_key_spend_signature_hash(
                        0,
                        &Prevouts::All(&[prevout]),
                        bitcoin::TapSighashType::Default,
                    )
                    .map_err(|e| SwapError::Crypto(e.to_string()))?;
                Ok((sighash.to_byte_array(), witness))
            }
            Chain::Liquid => {
                use lwk_wollet::elements::sighash::{Prevouts, SighashCache};

                let tx: elements::Transaction =
                    elements::encode::deserialize(&hex::decode(tx_hex)?)
                        .map_err(|e| SwapError::Encoding(e.to_string()))?;
                let input = tx.input.first().ok_or_else(|| reject("claim has no inputs"))?;
                let prevout = state
                    .lockups
                    .iter()
                    .find_map(|lockup| match lockup {
                        LockupTransaction::Liquid(lockup)
                            if lockup.txid() == input.previous_output.txid =>
                        {
                            lockup.output.get(input.previous_output.vout as usize).cloned()
                        }
                        _ => None,
                    })
                    .ok_or_else(|| reject("claim spends an unknown output"))?;
                let witness = input
                    .witness
                    .script_witness
                    .first()
                    .cloned()
                    .unwrap_or_default();
                let sighash = SighashCache::new(&tx)
                    .taproot_key_spend_signature_hash(
                        0,
                        &Prevouts::All(&[prevout]),
                        elements::SchnorrSighashType::Default,
                        NETWORK.liquid_genesis_hash()?,
                    )
                    .map_err(|e| SwapError::Crypto(format!("{e:?}")))?;
                Ok((sighash.to_byte_array(), witness))
            }
        }
    }
}

fn reject(msg: &str) -> SwapError {
    SwapError::RemoteRejected(msg.to_string())
}

fn parse_public_key(hex_key: &str) -> Result<PublicKey, SwapError> {
    PublicKey::from_str(hex_key).map_err(|e| SwapError::Encoding(e.to_string()))
}

#[async_trait]
impl SwapService for MockSwapService {
    async fn create_swap(&self, request: &CreateSwapRequest) -> Result<CreateSwapResponse, SwapError> {
        let lockup_chain = self.direction.lockup_chain();
        let claim_chain = self.direction.claim_chain();
        if request.from != lockup_chain.symbol() || request.to != claim_chain.symbol() {
            return Err(reject("unsupported pair"));
        }

        let user = parse_public_key(&request.claim_public_key)?;
        let preimage_hash: [u8; 32] = hex::decode(&request.preimage_hash)?
            .try_into()
            .map_err(|_| reject("preimage hash must be 32 bytes"))?;
        let committed = match self.tamper {
            Tamper::ForeignPreimage => [0xee; 32],
            _ => preimage_hash,
        };
        let hash160 = ripemd160::Hash::hash(&committed).to_byte_array();
        let server = self.server.x_only_public_key().0;
        let user_x = user.x_only_public_key().0;

        let claim_tree = SwapTree::new(
            claim_chain,
            &ClaimLeaf {
                preimage_hash160: hash160,
                claim_key: user_x,
            },
            &RefundLeaf {
                refund_key: server,
                timeout_block_height: TIMEOUT_BLOCK_HEIGHT,
            },
        );
        let lockup_tree = SwapTree::new(
            lockup_chain,
            &ClaimLeaf {
                preimage_hash160: hash160,
                claim_key: server,
            },
            &RefundLeaf {
                refund_key: user_x,
                timeout_block_height: TIMEOUT_BLOCK_HEIGHT,
            },
        );

        let (claim_cache, claim_key) = self.tweaked_cache(claim_chain, &claim_tree, user)?;
        let (lockup_cache, lockup_key) = self.tweaked_cache(lockup_chain, &lockup_tree, user)?;
        let lockup_address_key = match self.tamper {
            Tamper::ForeignLockupAddress => fixtures::x_only(0x66),
            _ => lockup_key,
        };

        let blinding_key = (self.tamper == Tamper::Confidential && claim_chain == Chain::Liquid)
            .then(|| fixtures::keypair(0x77).secret_key());

        let server_amount = fee_schedule().server_lock_amount(request.user_lock_amount)?;
        let response = CreateSwapResponse {
            id: SWAP_ID.to_string(),
            claim_details: self.details(
                claim_chain,
                claim_tree,
                claim_key,
                server_amount,
                blinding_key,
            )?,
            lockup_details: self.details(
                lockup_chain,
                lockup_tree,
                lockup_address_key,
                request.user_lock_amount,
                None,
            )?,
        };

        self.state.lock().expect("state mutex poisoned").swap = Some(ActiveSwap {
            user,
            preimage_hash,
            claim_cache,
            claim_key,
            lockup_cache,
            blinding_key,
            pending: None,
        });
        Ok(response)
    }

    async fn get_claim_details(&self, swap_id: &str) -> Result<ClaimDetails, SwapError> {
        if swap_id != SWAP_ID {
            return Err(reject("unknown swap"));
        }
        let (_, pub_nonce) = self.fresh_nonce()?;
        let mut message = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut message);

        let mut state = self.state.lock().expect("state mutex poisoned");
        let swap = state.swap.as_mut().ok_or_else(|| reject("unknown swap"))?;
        swap.pending = Some(PendingClaim { pub_nonce, message });
        Ok(ClaimDetails {
            pub_nonce: encode_pub_nonce(&pub_nonce),
            public_key: self.server.public_key().to_string(),
            transaction_hash: hex::encode(message),
        })
    }

    async fn submit_claim(
        &self,
        swap_id: &str,
        request: &SubmitClaimRequest,
    ) -> Result<PartialSignature, SwapError> {
        if swap_id != SWAP_ID {
            return Err(reject("unknown swap"));
        }
        let mut state = self.state.lock().expect("state mutex poisoned");
        let swap = state.swap.as_mut().ok_or_else(|| reject("unknown swap"))?;

        let preimage = hex::decode(&request.preimage)?;
        if sha256::Hash::hash(&preimage).to_byte_array() != swap.preimage_hash {
            return Err(reject("invalid preimage"));
        }

        let pending = swap
            .pending
            .take()
            .ok_or_else(|| reject("no claim details were requested"))?;
        let user_nonce = decode_pub_nonce(&request.signature.pub_nonce)?;
        let user_partial = decode_partial_signature(&request.signature.partial_signature)?;
        let session = MusigSession::new(
            &self.secp,
            &swap.lockup_cache,
            MusigAggNonce::new(&self.secp, &[pending.pub_nonce, user_nonce]),
            Message::from_digest(pending.message),
        );
        if !session.partial_verify(&self.secp, &swap.lockup_cache, user_partial, user_nonce, swap.user) {
            return Err(reject("invalid partial signature"));
        }

        let claim_cache = swap.claim_cache.clone();
        state.submitted_nonces.push(request.to_sign.pub_nonce.clone());
        let (sighash, _) = self.claim_sighash(&state, &request.to_sign.transaction)?;

        let (sec_nonce, pub_nonce) = self.fresh_nonce()?;
        let their_nonce = decode_pub_nonce(&request.to_sign.pub_nonce)?;
        let session = MusigSession::new(
            &self.secp,
            &claim_cache,
            MusigAggNonce::new(&self.secp, &[pub_nonce, their_nonce]),
            Message::from_digest(sighash),
        );
        let partial = session
            .partial_sign(&self.secp, sec_nonce, &self.server, &claim_cache)
            .map_err(|e| SwapError::Crypto(format!("{e:?}")))?;

        let partial_signature = match self.tamper {
            Tamper::BadPartial => hex::encode([0x01; 32]),
            _ => encode_partial_signature(&partial),
        };
        Ok(PartialSignature {
            pub_nonce: encode_pub_nonce(&pub_nonce),
            partial_signature,
        })
    }

    async fn broadcast(&self, chain: Chain, tx_hex: &str) -> Result<String, SwapError> {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if state.failing_broadcasts > 0 {
            state.failing_broadcasts -= 1;
            return Err(SwapError::Transport("connection reset by peer".to_string()));
        }
        if chain != self.direction.claim_chain() {
            return Err(reject("wrong chain"));
        }

        let claim_key = state.swap.as_ref().ok_or_else(|| reject("unknown swap"))?.claim_key;
        let (sighash, witness) = self.claim_sighash(&state, tx_hex)?;
        let signature = schnorr::Signature::from_slice(&witness)
            .map_err(|_| reject("missing key-path signature"))?;
        self.secp
            .verify_schnorr(&signature, &Message::from_digest(sighash), &claim_key)
            .map_err(|_| reject("non-mandatory-script-verify-flag (Invalid Schnorr signature)"))?;

        let txid = match LockupTransaction::from_hex(chain, tx_hex)? {
            LockupTransaction::Bitcoin(tx) => tx.compute_txid().to_string(),
            LockupTransaction::Liquid(tx) => tx.txid().to_string(),
        };
        state.broadcasts.push(tx_hex.to_string());
        Ok(txid)
    }

    async fn get_fee_schedule(&self, from: Chain, to: Chain) -> Result<FeeSchedule, SwapError> {
        if from != self.direction.lockup_chain() || to != self.direction.claim_chain() {
            return Err(reject("unsupported pair"));
        }
        Ok(fee_schedule())
    }

    async fn get_network_fee_rate(&self, _chain: Chain) -> Result<FeeRate, SwapError> {
        FeeRate::from_sat_per_vbyte(2.0)
    }
}
