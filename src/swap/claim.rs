//! Cooperative key-path claim of a detected swap output.
//!
//! The fee depends on the transaction size and the output value depends on
//! the fee, so the builder searches for a fixed point: size a candidate with
//! a placeholder 64-byte signature, price it, rebuild, repeat.

use std::str::FromStr;

use bitcoin::hashes::Hash as _;
use lwk_wollet::elements;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor,
};
use lwk_wollet::elements::secp256k1_zkp::schnorr::Signature;
use lwk_wollet::elements::secp256k1_zkp::{Secp256k1, SecretKey};
use lwk_wollet::elements::{BlockHash, TxOutSecrets};
use serde::{Deserialize, Serialize};

use super::detector::{SwapOutput, SwapPrevout};
use super::{FeeRate, Network};
use crate::error::SwapError;

pub const MAX_FEE_ITERATIONS: usize = 8;

const PLACEHOLDER_SIGNATURE: [u8; 64] = [0u8; 64];

/// Whether an unconfidential destination may receive a Liquid claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidentiality {
    Mandatory,
    Optional,
}

#[derive(Debug, Clone)]
pub struct ClaimParams {
    pub destination: String,
    pub fee_rate: FeeRate,
    pub network: Network,
    /// Unblinds a confidential lockup output.
    pub blinding_key: Option<SecretKey>,
    pub confidentiality: Confidentiality,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimTransaction {
    Bitcoin(bitcoin::Transaction),
    Liquid(elements::Transaction),
}

/// Claim transaction with an empty input witness, ready for signing.
#[derive(Debug, Clone)]
pub struct UnsignedClaim {
    pub tx: ClaimTransaction,
    pub output: SwapOutput,
    pub input_value: u64,
    pub claim_value: u64,
    pub fee: u64,
    genesis_hash: Option<BlockHash>,
}

impl UnsignedClaim {
    /// Virtual size including the final 64-byte key-path signature.
    pub fn vsize(&self) -> u64 {
        let mut sized = self.tx.clone();
        sized.set_key_path_witness(&PLACEHOLDER_SIGNATURE);
        sized.vsize()
    }

    /// Key-path sighash (`SIGHASH_DEFAULT`) of input 0.
    pub fn sighash(&self) -> Result<[u8; 32], SwapError> {
        match (&self.tx, &self.output.prevout) {
            (ClaimTransaction::Bitcoin(tx), SwapPrevout::Bitcoin { txout, .. }) => {
                use bitcoin::sighash::{Prevouts, SighashCache};

                let prevouts = [txout];
                SighashCache::new(tx)
                    .taproot_key_spend_signature_hash(
                        0,
                        &Prevouts::All(&prevouts),
                        bitcoin::TapSighashType::Default,
                    )
                    .map(|h| h.to_byte_array())
                    .map_err(|e| SwapError::Crypto(format!("bitcoin sighash: {e}")))
            }
            (ClaimTransaction::Liquid(tx), SwapPrevout::Liquid { txout, .. }) => {
                use lwk_wollet::elements::sighash::{Prevouts, SighashCache};

                let genesis_hash = self
                    .genesis_hash
                    .ok_or_else(|| SwapError::protocol("liquid claim without genesis hash"))?;
                let prevouts = [txout];
                SighashCache::new(tx)
                    .taproot_key_spend_signature_hash(
                        0,
                        &Prevouts::All(&prevouts),
                        elements::SchnorrSighashType::Default,
                        genesis_hash,
                    )
                    .map(|h| h.to_byte_array())
                    .map_err(|e| SwapError::Crypto(format!("liquid sighash: {e:?}")))
            }
            _ => Err(SwapError::protocol("claim and prevout are on different chains")),
        }
    }

    pub fn finalize(&mut self, signature: &Signature) {
        self.tx.set_key_path_witness(&signature.serialize());
    }

    pub fn txid(&self) -> String {
        match &self.tx {
            ClaimTransaction::Bitcoin(tx) => tx.compute_txid().to_string(),
            ClaimTransaction::Liquid(tx) => tx.txid().to_string(),
        }
    }

    pub fn to_hex(&self) -> String {
        self.tx.to_hex()
    }
}

impl ClaimTransaction {
    pub fn to_hex(&self) -> String {
        match self {
            ClaimTransaction::Bitcoin(tx) => bitcoin::consensus::encode::serialize_hex(tx),
            ClaimTransaction::Liquid(tx) => hex::encode(elements::encode::serialize(tx)),
        }
    }

    fn vsize(&self) -> u64 {
        match self {
            ClaimTransaction::Bitcoin(tx) => tx.vsize() as u64,
            ClaimTransaction::Liquid(tx) => (tx.weight() as u64).div_ceil(4),
        }
    }

    fn set_key_path_witness(&mut self, signature: &[u8]) {
        match self {
            ClaimTransaction::Bitcoin(tx) => {
                tx.input[0].witness = bitcoin::Witness::from_slice(&[signature]);
            }
            ClaimTransaction::Liquid(tx) => {
                tx.input[0].witness = elements::TxInWitness {
                    amount_rangeproof: None,
                    inflation_keys_rangeproof: None,
                    script_witness: vec![signature.to_vec()],
                    pegin_witness: vec![],
                };
            }
        }
    }
}

/// Builds the claim of `output` paying `params.destination` at the target fee rate.
pub fn build(output: &SwapOutput, params: &ClaimParams) -> Result<UnsignedClaim, SwapError> {
    let mut fee = 0u64;
    for iteration in 0..MAX_FEE_ITERATIONS {
        let candidate = assemble(output, params, fee)?;
        let target = params.fee_rate.fee_for_vsize(candidate.vsize());
        tracing::debug!(iteration, fee, target, "claim fee search");
        if target <= fee && fee - target <= 1 {
            return Ok(candidate);
        }
        fee = target;
    }
    Err(SwapError::FeeNotConverged(MAX_FEE_ITERATIONS))
}

fn assemble(output: &SwapOutput, params: &ClaimParams, fee: u64) -> Result<UnsignedClaim, SwapError> {
    match &output.prevout {
        SwapPrevout::Bitcoin { outpoint, txout } => {
            assemble_bitcoin(output, params, *outpoint, txout.value.to_sat(), fee)
        }
        SwapPrevout::Liquid { outpoint, txout } => {
            assemble_liquid(output, params, *outpoint, txout, fee)
        }
    }
}

fn claim_value(input: u64, fee: u64) -> Result<u64, SwapError> {
    input
        .checked_sub(fee)
        .filter(|v| *v > 0)
        .ok_or(SwapError::InsufficientFunds { input, fee })
}

fn assemble_bitcoin(
    output: &SwapOutput,
    params: &ClaimParams,
    outpoint: bitcoin::OutPoint,
    input_value: u64,
    fee: u64,
) -> Result<UnsignedClaim, SwapError> {
    let destination = bitcoin::Address::from_str(&params.destination)
        .map_err(|e| SwapError::InvalidAddress(format!("{}: {e}", params.destination)))?
        .require_network(params.network.bitcoin())
        .map_err(|e| SwapError::InvalidAddress(format!("{}: {e}", params.destination)))?;
    let value = claim_value(input_value, fee)?;

    let tx = bitcoin::Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![bitcoin::TxIn {
            previous_output: outpoint,
            script_sig: bitcoin::ScriptBuf::new(),
            sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: bitcoin::Witness::new(),
        }],
        output: vec![bitcoin::TxOut {
            value: bitcoin::Amount::from_sat(value),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    Ok(UnsignedClaim {
        tx: ClaimTransaction::Bitcoin(tx),
        output: output.clone(),
        input_value,
        claim_value: value,
        fee,
        genesis_hash: None,
    })
}

fn assemble_liquid(
    output: &SwapOutput,
    params: &ClaimParams,
    outpoint: elements::OutPoint,
    txout: &elements::TxOut,
    fee: u64,
) -> Result<UnsignedClaim, SwapError> {
    let secp = Secp256k1::new();
    let destination = elements::Address::from_str(&params.destination)
        .map_err(|e| SwapError::InvalidAddress(format!("{}: {e}", params.destination)))?;
    if destination.params != params.network.address_params() {
        return Err(SwapError::InvalidAddress(format!(
            "{} is not a {:?} address",
            params.destination, params.network
        )));
    }

    let secrets = match (txout.value, txout.asset) {
        (Value::Explicit(value), Asset::Explicit(asset)) => TxOutSecrets::new(
            asset,
            AssetBlindingFactor::zero(),
            value,
            ValueBlindingFactor::zero(),
        ),
        _ => {
            let blinding_key = params.blinding_key.ok_or_else(|| {
                SwapError::Crypto("confidential lockup output without blinding key".to_string())
            })?;
            txout
                .unblind(&secp, blinding_key)
                .map_err(|e| SwapError::Crypto(format!("unblind lockup output: {e:?}")))?
        }
    };
    let input_is_blinded = txout.value.is_confidential();
    let value = claim_value(secrets.value, fee)?;
    let script_pubkey = destination.script_pubkey();

    let claim_out = match destination.blinding_pubkey {
        Some(blinding_pubkey) => {
            let mut rng = rand::thread_rng();
            let out_abf = AssetBlindingFactor::new(&mut rng);
            let (asset, surjection_proof) = Asset::Explicit(secrets.asset)
                .blind(&mut rng, &secp, out_abf, &[secrets])
                .map_err(|e| SwapError::Crypto(format!("blind asset: {e:?}")))?;
            let out_vbf = ValueBlindingFactor::last(
                &secp,
                value,
                out_abf,
                &[(secrets.value, secrets.asset_bf, secrets.value_bf)],
                &[(
                    fee,
                    AssetBlindingFactor::zero(),
                    ValueBlindingFactor::zero(),
                )],
            );
            let message = elements::RangeProofMessage {
                asset: secrets.asset,
                bf: out_abf,
            };
            let ephemeral_sk = SecretKey::new(&mut rng);
            let (blinded_value, nonce, rangeproof) = Value::Explicit(value)
                .blind(
                    &secp,
                    out_vbf,
                    blinding_pubkey,
                    ephemeral_sk,
                    &script_pubkey,
                    &message,
                )
                .map_err(|e| SwapError::Crypto(format!("blind value: {e:?}")))?;

            elements::TxOut {
                asset,
                value: blinded_value,
                nonce,
                script_pubkey,
                witness: elements::TxOutWitness {
                    surjection_proof: Some(Box::new(surjection_proof)),
                    rangeproof: Some(Box::new(rangeproof)),
                },
            }
        }
        None if params.confidentiality == Confidentiality::Mandatory || input_is_blinded => {
            return Err(SwapError::Confidentiality(params.destination.clone()));
        }
        None => elements::TxOut {
            asset: Asset::Explicit(secrets.asset),
            value: Value::Explicit(value),
            nonce: Nonce::Null,
            script_pubkey,
            witness: elements::TxOutWitness::default(),
        },
    };

    let tx = elements::Transaction {
        version: 2,
        lock_time: elements::LockTime::ZERO,
        input: vec![elements::TxIn {
            previous_output: outpoint,
            is_pegin: false,
            script_sig: elements::Script::new(),
            sequence: elements::Sequence::ENABLE_RBF_NO_LOCKTIME,
            asset_issuance: Default::default(),
            witness: elements::TxInWitness::default(),
        }],
        output: vec![claim_out, elements::TxOut::new_fee(fee, secrets.asset)],
    };

    Ok(UnsignedClaim {
        tx: ClaimTransaction::Liquid(tx),
        output: output.clone(),
        input_value: secrets.value,
        claim_value: value,
        fee,
        genesis_hash: Some(params.network.liquid_genesis_hash()?),
    })
}
