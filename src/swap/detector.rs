use lwk_wollet::elements;
use lwk_wollet::elements::secp256k1_zkp::XOnlyPublicKey;

use super::Chain;
use crate::error::SwapError;

/// Raw lockup transaction as seen in a `transaction.server.*` event.
#[derive(Debug, Clone, PartialEq)]
pub enum LockupTransaction {
    Bitcoin(bitcoin::Transaction),
    Liquid(elements::Transaction),
}

impl LockupTransaction {
    pub fn from_hex(chain: Chain, tx_hex: &str) -> Result<Self, SwapError> {
        let bytes = hex::decode(tx_hex)?;
        match chain {
            Chain::Bitcoin => bitcoin::consensus::deserialize(&bytes)
                .map(LockupTransaction::Bitcoin)
                .map_err(|e| SwapError::Encoding(format!("bitcoin transaction: {e}"))),
            Chain::Liquid => elements::encode::deserialize(&bytes)
                .map(LockupTransaction::Liquid)
                .map_err(|e| SwapError::Encoding(format!("liquid transaction: {e}"))),
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            LockupTransaction::Bitcoin(_) => Chain::Bitcoin,
            LockupTransaction::Liquid(_) => Chain::Liquid,
        }
    }

    pub fn txid(&self) -> String {
        match self {
            LockupTransaction::Bitcoin(tx) => tx.compute_txid().to_string(),
            LockupTransaction::Liquid(tx) => tx.txid().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwapPrevout {
    Bitcoin {
        outpoint: bitcoin::OutPoint,
        txout: bitcoin::TxOut,
    },
    Liquid {
        outpoint: elements::OutPoint,
        txout: elements::TxOut,
    },
}

/// The output of a lockup transaction that pays to the swap's tweaked key.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapOutput {
    pub vout: u32,
    pub tweaked_key: XOnlyPublicKey,
    pub prevout: SwapPrevout,
}

impl SwapOutput {
    pub fn chain(&self) -> Chain {
        match self.prevout {
            SwapPrevout::Bitcoin { .. } => Chain::Bitcoin,
            SwapPrevout::Liquid { .. } => Chain::Liquid,
        }
    }

    /// Value in sat, `None` while a confidential output is still blinded.
    pub fn explicit_value(&self) -> Option<u64> {
        match &self.prevout {
            SwapPrevout::Bitcoin { txout, .. } => Some(txout.value.to_sat()),
            SwapPrevout::Liquid { txout, .. } => txout.value.explicit(),
        }
    }

    /// Asset tag on the confidential chain, when explicit.
    pub fn explicit_asset(&self) -> Option<elements::AssetId> {
        match &self.prevout {
            SwapPrevout::Bitcoin { .. } => None,
            SwapPrevout::Liquid { txout, .. } => txout.asset.explicit(),
        }
    }

    pub fn script_pubkey(&self) -> &[u8] {
        match &self.prevout {
            SwapPrevout::Bitcoin { txout, .. } => txout.script_pubkey.as_bytes(),
            SwapPrevout::Liquid { txout, .. } => txout.script_pubkey.as_bytes(),
        }
    }
}

/// Witness program of a segwit v1 (`OP_1 <32 bytes>`) script.
pub fn p2tr_program(script_pubkey: &[u8]) -> Option<[u8; 32]> {
    match script_pubkey {
        [0x51, 0x20, program @ ..] if program.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(program);
            Some(out)
        }
        _ => None,
    }
}

/// First output whose Taproot program equals `tweaked_key`, byte for byte.
/// `None` means the funds are not visible yet; the caller owns retry policy.
pub fn detect(tweaked_key: &XOnlyPublicKey, transaction: &LockupTransaction) -> Option<SwapOutput> {
    let wanted = tweaked_key.serialize();
    let matches = |script: &[u8]| p2tr_program(script).is_some_and(|p| p == wanted);

    match transaction {
        LockupTransaction::Bitcoin(tx) => {
            let txid = tx.compute_txid();
            tx.output
                .iter()
                .enumerate()
                .find(|(_, out)| matches(out.script_pubkey.as_bytes()))
                .map(|(vout, out)| SwapOutput {
                    vout: vout as u32,
                    tweaked_key: *tweaked_key,
                    prevout: SwapPrevout::Bitcoin {
                        outpoint: bitcoin::OutPoint::new(txid, vout as u32),
                        txout: out.clone(),
                    },
                })
        }
        LockupTransaction::Liquid(tx) => {
            let txid = tx.txid();
            tx.output
                .iter()
                .enumerate()
                .find(|(_, out)| matches(out.script_pubkey.as_bytes()))
                .map(|(vout, out)| SwapOutput {
                    vout: vout as u32,
                    tweaked_key: *tweaked_key,
                    prevout: SwapPrevout::Liquid {
                        outpoint: elements::OutPoint::new(txid, vout as u32),
                        txout: out.clone(),
                    },
                })
        }
    }
}
