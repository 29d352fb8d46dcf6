//! Two-party MuSig2 session for the cooperative key-path spend.
//!
//! Keys are always aggregated as `[remote, local]`, the order the service uses
//! when it derives the lockup address. A session signs exactly one message:
//! the secret nonce is taken out on first use and any failed step leaves the
//! session unusable.

use std::fmt;
use std::sync::Arc;

use lwk_wollet::elements::secp256k1_zkp::schnorr::Signature;
use lwk_wollet::elements::secp256k1_zkp::{
    All, Message, MusigAggNonce, MusigKeyAggCache, MusigPartialSignature, MusigPubNonce,
    MusigSecNonce, MusigSession, MusigSessionId, PublicKey, Secp256k1, XOnlyPublicKey,
    new_musig_nonce_pair,
};
use rand::RngCore as _;

use super::{Chain, SwapTree};
use crate::error::SwapError;
use crate::keys::KeyCustody;

/// Aggregate key of `[remote, local]` tweaked with `tree`. This is the key the
/// swap output pays to.
pub fn tweaked_output_key(
    chain: Chain,
    tree: &SwapTree,
    remote: PublicKey,
    local: PublicKey,
) -> Result<XOnlyPublicKey, SwapError> {
    let secp = Secp256k1::new();
    let mut cache = MusigKeyAggCache::new(&secp, &[remote, local]);
    apply_tree_tweak(&secp, &mut cache, chain, tree)
}

fn apply_tree_tweak(
    secp: &Secp256k1<All>,
    cache: &mut MusigKeyAggCache,
    chain: Chain,
    tree: &SwapTree,
) -> Result<XOnlyPublicKey, SwapError> {
    let tweak = tree.tap_tweak(chain, cache.agg_pk())?;
    let tweaked = cache
        .pubkey_xonly_tweak_add(secp, tweak)
        .map_err(|e| SwapError::Crypto(format!("tweak aggregate key: {e:?}")))?;
    Ok(tweaked.x_only_public_key().0)
}

pub fn encode_pub_nonce(nonce: &MusigPubNonce) -> String {
    hex::encode(nonce.serialize())
}

pub fn decode_pub_nonce(hex_nonce: &str) -> Result<MusigPubNonce, SwapError> {
    let bytes = hex::decode(hex_nonce)?;
    MusigPubNonce::from_slice(&bytes)
        .map_err(|e| SwapError::Encoding(format!("musig public nonce: {e:?}")))
}

pub fn encode_partial_signature(partial: &MusigPartialSignature) -> String {
    hex::encode(partial.serialize())
}

pub fn decode_partial_signature(hex_partial: &str) -> Result<MusigPartialSignature, SwapError> {
    let bytes = hex::decode(hex_partial)?;
    MusigPartialSignature::from_slice(&bytes)
        .map_err(|e| SwapError::Encoding(format!("musig partial signature: {e:?}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Created,
    Tweaked,
    NoncesAggregated,
    Initialized,
    Signed,
    Finalized,
    Failed,
}

pub struct SigningSession {
    chain: Chain,
    secp: Secp256k1<All>,
    custody: Arc<dyn KeyCustody>,
    remote_public_key: PublicKey,
    key_agg_cache: MusigKeyAggCache,
    sec_nonce: Option<MusigSecNonce>,
    pub_nonce: MusigPubNonce,
    tweaked_key: Option<XOnlyPublicKey>,
    agg_nonce: Option<MusigAggNonce>,
    remote_nonce: Option<MusigPubNonce>,
    session: Option<MusigSession>,
    message: Option<Message>,
    local_partial: Option<MusigPartialSignature>,
    remote_partial: Option<MusigPartialSignature>,
    stage: Stage,
}

impl fmt::Debug for SigningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSession")
            .field("chain", &self.chain)
            .field("remote_public_key", &self.remote_public_key)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl SigningSession {
    /// Starts a session with a fresh random nonce seed.
    pub fn new(
        chain: Chain,
        custody: Arc<dyn KeyCustody>,
        remote_public_key: PublicKey,
    ) -> Result<Self, SwapError> {
        let secp = Secp256k1::new();
        let local_public_key = custody.public_key();
        let key_agg_cache = MusigKeyAggCache::new(&secp, &[remote_public_key, local_public_key]);

        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let session_id = MusigSessionId::assume_unique_per_nonce_gen(seed);
        let (sec_nonce, pub_nonce) =
            new_musig_nonce_pair(&secp, session_id, None, None, local_public_key, None, None)
                .map_err(|e| SwapError::Crypto(format!("generate musig nonce: {e:?}")))?;

        Ok(Self {
            chain,
            secp,
            custody,
            remote_public_key,
            key_agg_cache,
            sec_nonce: Some(sec_nonce),
            pub_nonce,
            tweaked_key: None,
            agg_nonce: None,
            remote_nonce: None,
            session: None,
            message: None,
            local_partial: None,
            remote_partial: None,
            stage: Stage::Created,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn pub_nonce(&self) -> MusigPubNonce {
        self.pub_nonce
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    pub fn tweaked_key(&self) -> Option<XOnlyPublicKey> {
        self.tweaked_key
    }

    pub fn tweak(&mut self, tree: &SwapTree) -> Result<XOnlyPublicKey, SwapError> {
        self.expect_stage(&[Stage::Created], "tweak")?;
        match apply_tree_tweak(&self.secp, &mut self.key_agg_cache, self.chain, tree) {
            Ok(key) => {
                self.tweaked_key = Some(key);
                self.stage = Stage::Tweaked;
                Ok(key)
            }
            Err(err) => self.fail(err),
        }
    }

    pub fn aggregate_nonces(
        &mut self,
        remote_nonces: &[(PublicKey, MusigPubNonce)],
    ) -> Result<(), SwapError> {
        self.expect_stage(&[Stage::Tweaked], "aggregate_nonces")?;
        if self.sec_nonce.is_none() {
            return self.fail(SwapError::protocol("local nonce is missing"));
        }
        let [(party, nonce)] = remote_nonces else {
            return self.fail(SwapError::protocol(format!(
                "expected exactly one remote nonce, got {}",
                remote_nonces.len()
            )));
        };
        if *party != self.remote_public_key {
            return self.fail(SwapError::protocol(format!(
                "nonce from unexpected party {party}"
            )));
        }

        self.agg_nonce = Some(MusigAggNonce::new(&self.secp, &[*nonce, self.pub_nonce]));
        self.remote_nonce = Some(*nonce);
        self.stage = Stage::NoncesAggregated;
        Ok(())
    }

    /// Binds the session to `sighash`. Can be re-bound until either partial
    /// signature exists, never after.
    pub fn initialize_session(&mut self, sighash: [u8; 32]) -> Result<(), SwapError> {
        self.expect_stage(
            &[Stage::NoncesAggregated, Stage::Initialized],
            "initialize_session",
        )?;
        if self.remote_partial.is_some() {
            return self.fail(SwapError::protocol(
                "cannot re-bind after the remote partial signature was recorded",
            ));
        }
        let Some(agg_nonce) = self.agg_nonce else {
            return self.fail(SwapError::protocol("aggregate nonce is missing"));
        };

        let message = Message::from_digest(sighash);
        self.session = Some(MusigSession::new(
            &self.secp,
            &self.key_agg_cache,
            agg_nonce,
            message,
        ));
        self.message = Some(message);
        self.stage = Stage::Initialized;
        Ok(())
    }

    pub fn sign_partial(&mut self) -> Result<MusigPartialSignature, SwapError> {
        self.expect_stage(&[Stage::Initialized], "sign_partial")?;
        let Some(sec_nonce) = self.sec_nonce.take() else {
            return self.fail(SwapError::protocol("local nonce already consumed"));
        };
        let Some(session) = self.session.as_ref() else {
            return self.fail(SwapError::protocol("session is not initialized"));
        };

        match self
            .custody
            .musig_partial_sign(session, sec_nonce, &self.key_agg_cache)
        {
            Ok(partial) => {
                self.local_partial = Some(partial);
                self.stage = Stage::Signed;
                Ok(partial)
            }
            Err(err) => self.fail(err),
        }
    }

    /// Records and verifies the counter-party's partial signature.
    pub fn add_partial(
        &mut self,
        remote_public_key: PublicKey,
        partial: MusigPartialSignature,
    ) -> Result<(), SwapError> {
        self.expect_stage(&[Stage::Initialized, Stage::Signed], "add_partial")?;
        if remote_public_key != self.remote_public_key {
            return self.fail(SwapError::protocol(format!(
                "partial signature from unexpected party {remote_public_key}"
            )));
        }
        if self.remote_partial.is_some() {
            return self.fail(SwapError::protocol("remote partial signature already recorded"));
        }
        let (Some(session), Some(remote_nonce)) = (self.session.as_ref(), self.remote_nonce) else {
            return self.fail(SwapError::protocol("session is not initialized"));
        };

        let valid = session.partial_verify(
            &self.secp,
            &self.key_agg_cache,
            partial,
            remote_nonce,
            remote_public_key,
        );
        if !valid {
            return self.fail(SwapError::RemoteRejected(
                "remote partial signature does not verify".to_string(),
            ));
        }

        self.remote_partial = Some(partial);
        Ok(())
    }

    /// Combines both partials into the final key-path signature and checks it
    /// against the tweaked output key.
    pub fn aggregate_partials(&mut self) -> Result<Signature, SwapError> {
        self.expect_stage(&[Stage::Signed], "aggregate_partials")?;
        let (Some(session), Some(local), Some(remote), Some(message), Some(tweaked_key)) = (
            self.session.as_ref(),
            self.local_partial,
            self.remote_partial,
            self.message,
            self.tweaked_key,
        ) else {
            return self.fail(SwapError::protocol(
                "aggregate_partials requires both partial signatures",
            ));
        };

        let signature = session.partial_sig_agg(&[remote, local]);
        if let Err(e) = self.secp.verify_schnorr(&signature, &message, &tweaked_key) {
            return self.fail(SwapError::Crypto(format!(
                "aggregated signature does not verify: {e}"
            )));
        }

        self.stage = Stage::Finalized;
        Ok(signature)
    }

    fn expect_stage(&mut self, allowed: &[Stage], op: &str) -> Result<(), SwapError> {
        if allowed.contains(&self.stage) {
            return Ok(());
        }
        let err = SwapError::protocol(format!("{op} called in stage {:?}", self.stage));
        if self.stage != Stage::Finalized {
            self.stage = Stage::Failed;
        }
        Err(err)
    }

    fn fail<T>(&mut self, err: SwapError) -> Result<T, SwapError> {
        self.stage = Stage::Failed;
        self.sec_nonce = None;
        Err(err)
    }
}
