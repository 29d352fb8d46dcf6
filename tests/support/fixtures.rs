use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use bitcoin::key::TweakedPublicKey;
use lwk_wollet::elements;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor,
};
use lwk_wollet::elements::secp256k1_zkp::{Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use lwk_wollet::elements::{RangeProofMessage, TxOutSecrets};
use taproot_chain_swap::swap::detector::LockupTransaction;
use taproot_chain_swap::swap::{Chain, Network};

pub const NETWORK: Network = Network::Regtest;

pub fn keypair(byte: u8) -> Keypair {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).expect("valid secret key");
    Keypair::from_secret_key(&secp, &secret)
}

pub fn x_only(byte: u8) -> XOnlyPublicKey {
    keypair(byte).x_only_public_key().0
}

pub fn public_key(byte: u8) -> PublicKey {
    keypair(byte).public_key()
}

pub fn p2tr_script(key: XOnlyPublicKey) -> Vec<u8> {
    let mut script = vec![0x51, 0x20];
    script.extend_from_slice(&key.serialize());
    script
}

pub fn p2tr_address(chain: Chain, key: XOnlyPublicKey) -> Result<String> {
    Ok(match chain {
        Chain::Bitcoin => bitcoin::Address::p2tr_tweaked(
            TweakedPublicKey::dangerous_assume_tweaked(key),
            NETWORK.bitcoin(),
        )
        .to_string(),
        Chain::Liquid => elements::Address::from_script(
            &elements::Script::from(p2tr_script(key)),
            None,
            NETWORK.address_params(),
        )
        .context("liquid p2tr address")?
        .to_string(),
    })
}

/// Where the user wants the claimed coins.
pub fn destination(chain: Chain) -> Result<String> {
    p2tr_address(chain, x_only(0x0d))
}

/// Lockup transaction with two decoys around an optional swap output at
/// index 1.
pub fn lockup_transaction(chain: Chain, target: Option<XOnlyPublicKey>, value: u64) -> LockupTransaction {
    let mut scripts = vec![p2tr_script(x_only(0xd1))];
    if let Some(key) = target {
        scripts.push(p2tr_script(key));
    }
    let mut wpkh = vec![0x00, 0x14];
    wpkh.extend_from_slice(&[0xd2; 20]);
    scripts.push(wpkh);

    match chain {
        Chain::Bitcoin => LockupTransaction::Bitcoin(bitcoin::Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::new(bitcoin::Txid::all_zeros(), 7),
                ..Default::default()
            }],
            output: scripts
                .into_iter()
                .map(|script| bitcoin::TxOut {
                    value: bitcoin::Amount::from_sat(value),
                    script_pubkey: bitcoin::ScriptBuf::from_bytes(script),
                })
                .collect(),
        }),
        Chain::Liquid => {
            let policy_asset = NETWORK.elements().policy_asset();
            LockupTransaction::Liquid(elements::Transaction {
                version: 2,
                lock_time: elements::LockTime::ZERO,
                input: vec![elements::TxIn {
                    previous_output: elements::OutPoint::new(elements::Txid::all_zeros(), 7),
                    is_pegin: false,
                    script_sig: elements::Script::new(),
                    sequence: elements::Sequence::MAX,
                    asset_issuance: Default::default(),
                    witness: elements::TxInWitness::default(),
                }],
                output: scripts
                    .into_iter()
                    .map(|script| elements::TxOut {
                        asset: Asset::Explicit(policy_asset),
                        value: Value::Explicit(value),
                        nonce: Nonce::Null,
                        script_pubkey: elements::Script::from(script),
                        witness: elements::TxOutWitness::default(),
                    })
                    .collect(),
            })
        }
    }
}

/// Confidential Liquid destination; outputs to it unblind with `keypair(0x0e)`.
pub fn confidential_destination() -> String {
    elements::Address::p2tr(
        &Secp256k1::new(),
        x_only(0x0d),
        None,
        Some(public_key(0x0e)),
        NETWORK.address_params(),
    )
    .to_string()
}

/// Liquid lockup whose swap output at index 1 is blinded to `blinding_key`.
pub fn confidential_lockup_transaction(
    target: XOnlyPublicKey,
    value: u64,
    blinding_key: PublicKey,
) -> Result<LockupTransaction> {
    let LockupTransaction::Liquid(mut tx) = lockup_transaction(Chain::Liquid, Some(target), value)
    else {
        anyhow::bail!("expected a liquid lockup");
    };
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let policy_asset = NETWORK.elements().policy_asset();
    let funding = TxOutSecrets::new(
        policy_asset,
        AssetBlindingFactor::zero(),
        value,
        ValueBlindingFactor::zero(),
    );

    let abf = AssetBlindingFactor::new(&mut rng);
    let vbf = ValueBlindingFactor::new(&mut rng);
    let (asset, surjection_proof) = Asset::Explicit(policy_asset)
        .blind(&mut rng, &secp, abf, &[funding])
        .map_err(|e| anyhow::anyhow!("blind asset: {e:?}"))?;
    let script_pubkey = elements::Script::from(p2tr_script(target));
    let (blinded_value, nonce, rangeproof) = Value::Explicit(value)
        .blind(
            &secp,
            vbf,
            blinding_key,
            SecretKey::new(&mut rng),
            &script_pubkey,
            &RangeProofMessage {
                asset: policy_asset,
                bf: abf,
            },
        )
        .map_err(|e| anyhow::anyhow!("blind value: {e:?}"))?;

    tx.output[1] = elements::TxOut {
        asset,
        value: blinded_value,
        nonce,
        script_pubkey,
        witness: elements::TxOutWitness {
            surjection_proof: Some(Box::new(surjection_proof)),
            rangeproof: Some(Box::new(rangeproof)),
        },
    };
    Ok(LockupTransaction::Liquid(tx))
}

pub fn to_hex(tx: &LockupTransaction) -> String {
    match tx {
        LockupTransaction::Bitcoin(tx) => bitcoin::consensus::encode::serialize_hex(tx),
        LockupTransaction::Liquid(tx) => hex::encode(elements::encode::serialize(tx)),
    }
}
