//! Serialized swap trees as the service sends them, plus the two fixed leaf
//! shapes and the Taproot tweak they commit to.
//!
//! Both chains share the same script encoding, so leaves are parsed with one
//! instruction walker; only the Taproot hashing differs per chain.

use bitcoin::hashes::Hash as _;
use lwk_wollet::elements::opcodes;
use lwk_wollet::elements::script::{Builder, Instruction, Script};
use lwk_wollet::elements::secp256k1_zkp::{Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};

use super::Chain;
use crate::error::SwapError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeLeaf {
    pub version: u8,
    /// Hex-encoded tapscript.
    pub output: String,
}

impl TreeLeaf {
    pub fn new(version: u8, script: &[u8]) -> Self {
        Self {
            version,
            output: hex::encode(script),
        }
    }

    pub fn script_bytes(&self) -> Result<Vec<u8>, SwapError> {
        hex::decode(&self.output)
            .map_err(|e| SwapError::InvalidSwapTree(format!("decode leaf script: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapTree {
    pub claim_leaf: TreeLeaf,
    pub refund_leaf: TreeLeaf,
}

/// `OP_SIZE 32 OP_EQUALVERIFY OP_HASH160 <h160> OP_EQUALVERIFY <key> OP_CHECKSIG`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimLeaf {
    pub preimage_hash160: [u8; 20],
    pub claim_key: XOnlyPublicKey,
}

/// `<key> OP_CHECKSIGVERIFY <timeout> OP_CHECKLOCKTIMEVERIFY`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundLeaf {
    pub refund_key: XOnlyPublicKey,
    pub timeout_block_height: u32,
}

impl ClaimLeaf {
    pub fn script(&self) -> Script {
        Builder::new()
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(32)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(&self.preimage_hash160)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_slice(&self.claim_key.serialize())
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script()
    }

    pub fn parse(script: &Script) -> Result<Self, SwapError> {
        let mut iter = script.instructions_minimal();

        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_SIZE)?;
        let size = parse_script_num(next_instruction(&mut iter)?)?;
        if size != 32 {
            return Err(invalid(format!("unexpected preimage size check: {size}")));
        }
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUALVERIFY)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_HASH160)?;
        let preimage_hash160 = expect_push::<20>(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUALVERIFY)?;
        let claim_key = expect_x_only(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIG)?;
        expect_end(&mut iter)?;

        Ok(Self {
            preimage_hash160,
            claim_key,
        })
    }
}

impl RefundLeaf {
    pub fn script(&self) -> Script {
        Builder::new()
            .push_slice(&self.refund_key.serialize())
            .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
            .push_int(self.timeout_block_height as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .into_script()
    }

    pub fn parse(script: &Script) -> Result<Self, SwapError> {
        let mut iter = script.instructions_minimal();

        let refund_key = expect_x_only(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIGVERIFY)?;
        let timeout = parse_script_num(next_instruction(&mut iter)?)?;
        let timeout_block_height = u32::try_from(timeout)
            .map_err(|_| invalid(format!("timeout out of range: {timeout}")))?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CLTV)?;
        expect_end(&mut iter)?;

        Ok(Self {
            refund_key,
            timeout_block_height,
        })
    }
}

impl SwapTree {
    pub fn new(chain: Chain, claim: &ClaimLeaf, refund: &RefundLeaf) -> Self {
        Self {
            claim_leaf: TreeLeaf::new(chain.leaf_version(), claim.script().as_bytes()),
            refund_leaf: TreeLeaf::new(chain.leaf_version(), refund.script().as_bytes()),
        }
    }

    pub fn claim(&self) -> Result<ClaimLeaf, SwapError> {
        ClaimLeaf::parse(&Script::from(self.claim_leaf.script_bytes()?))
    }

    pub fn refund(&self) -> Result<RefundLeaf, SwapError> {
        RefundLeaf::parse(&Script::from(self.refund_leaf.script_bytes()?))
    }

    /// Taproot tweak of the two-leaf tree over `internal_key`, as a scalar
    /// ready for MuSig x-only tweaking.
    pub fn tap_tweak(
        &self,
        chain: Chain,
        internal_key: XOnlyPublicKey,
    ) -> Result<SecretKey, SwapError> {
        for leaf in [&self.claim_leaf, &self.refund_leaf] {
            if leaf.version != chain.leaf_version() {
                return Err(invalid(format!(
                    "leaf version {:#04x} does not match {chain} ({:#04x})",
                    leaf.version,
                    chain.leaf_version()
                )));
            }
        }

        let claim = self.claim_leaf.script_bytes()?;
        let refund = self.refund_leaf.script_bytes()?;

        let tweak = match chain {
            Chain::Bitcoin => {
                use bitcoin::ScriptBuf;
                use bitcoin::taproot::{LeafVersion, TaprootBuilder};

                let secp = Secp256k1::verification_only();
                TaprootBuilder::new()
                    .add_leaf_with_ver(1, ScriptBuf::from_bytes(claim), LeafVersion::TapScript)
                    .and_then(|b| {
                        b.add_leaf_with_ver(1, ScriptBuf::from_bytes(refund), LeafVersion::TapScript)
                    })
                    .map_err(|e| invalid(format!("build taproot tree: {e}")))?
                    .finalize(&secp, internal_key)
                    .map_err(|_| invalid("taproot tree is incomplete"))?
                    .tap_tweak()
                    .to_byte_array()
            }
            Chain::Liquid => {
                use lwk_wollet::elements::taproot::{LeafVersion, TaprootBuilder};

                let secp = Secp256k1::verification_only();
                TaprootBuilder::new()
                    .add_leaf_with_ver(1, Script::from(claim), LeafVersion::default())
                    .and_then(|b| b.add_leaf_with_ver(1, Script::from(refund), LeafVersion::default()))
                    .map_err(|e| invalid(format!("build taproot tree: {e:?}")))?
                    .finalize(&secp, internal_key)
                    .map_err(|e| invalid(format!("finalize taproot tree: {e:?}")))?
                    .tap_tweak()
                    .to_byte_array()
            }
        };

        SecretKey::from_slice(&tweak).map_err(|e| SwapError::Crypto(format!("tap tweak: {e}")))
    }
}

fn invalid(msg: impl Into<String>) -> SwapError {
    SwapError::InvalidSwapTree(msg.into())
}

fn next_instruction<'a>(
    iter: &mut impl Iterator<
        Item = Result<Instruction<'a>, lwk_wollet::elements::script::Error>,
    >,
) -> Result<Instruction<'a>, SwapError> {
    iter.next()
        .transpose()
        .map_err(|e| invalid(format!("decode leaf instruction: {e:?}")))?
        .ok_or_else(|| invalid("unexpected end of leaf script"))
}

fn expect_end<'a>(
    iter: &mut impl Iterator<
        Item = Result<Instruction<'a>, lwk_wollet::elements::script::Error>,
    >,
) -> Result<(), SwapError> {
    match iter.next() {
        None => Ok(()),
        Some(_) => Err(invalid("unexpected trailing instructions in leaf script")),
    }
}

fn expect_op(actual: Instruction<'_>, expected: opcodes::All) -> Result<(), SwapError> {
    match actual {
        Instruction::Op(op) if op == expected => Ok(()),
        other => Err(invalid(format!(
            "unexpected instruction: expected {expected:?}, got {other:?}"
        ))),
    }
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N], SwapError> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        other => Err(invalid(format!(
            "unexpected instruction: expected push {N} bytes, got {other:?}"
        ))),
    }
}

fn expect_x_only(actual: Instruction<'_>) -> Result<XOnlyPublicKey, SwapError> {
    let bytes = expect_push::<32>(actual)?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| invalid(format!("leaf key: {e}")))
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64, SwapError> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes),
        Instruction::Op(op) => {
            let code = op.into_u8();
            let one = opcodes::all::OP_PUSHNUM_1.into_u8();
            let sixteen = opcodes::all::OP_PUSHNUM_16.into_u8();
            if (one..=sixteen).contains(&code) {
                return Ok((code - one + 1) as i64);
            }
            Err(invalid(format!(
                "unexpected opcode where script number expected: {op:?}"
            )))
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64, SwapError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 5 {
        return Err(invalid(format!("script number too large: {} bytes", bytes.len())));
    }

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }

    Ok(if negative { -value } else { value })
}
