use lwk_signer::SwSigner;
use lwk_wollet::elements::bitcoin::bip32::{ChildNumber, DerivationPath};
use lwk_wollet::elements::secp256k1_zkp::schnorr::Signature;
use lwk_wollet::elements::secp256k1_zkp::{
    All, Keypair, Message, MusigKeyAggCache, MusigPartialSignature, MusigSecNonce, MusigSession,
    PublicKey, Secp256k1, SecretKey, XOnlyPublicKey,
};

use crate::error::SwapError;

/// Key custody seam. The signing engine only ever sees the public key and
/// asks for signatures; secret material stays behind this trait.
pub trait KeyCustody: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign_schnorr(&self, msg: &Message) -> Signature;

    /// Produces this key's MuSig partial signature. Consumes the secret nonce.
    fn musig_partial_sign(
        &self,
        session: &MusigSession,
        sec_nonce: MusigSecNonce,
        key_agg_cache: &MusigKeyAggCache,
    ) -> Result<MusigPartialSignature, SwapError>;

    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.public_key().x_only_public_key().0
    }
}

/// In-memory keypair. Either generated per run or derived from a mnemonic.
pub struct LocalKey {
    secp: Secp256k1<All>,
    keypair: Keypair,
}

impl LocalKey {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        Self { secp, keypair }
    }

    pub fn from_secret_key(secret_key: &SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, secret_key);
        Self { secp, keypair }
    }

    pub fn from_mnemonic(mnemonic: &str, is_mainnet: bool, index: u32) -> Result<Self, SwapError> {
        let signer = SwSigner::new(mnemonic, is_mainnet)
            .map_err(|e| SwapError::Crypto(format!("load mnemonic: {e:?}")))?;
        let secret_key = derive_secret_key(&signer, index)?;
        Ok(Self::from_secret_key(&secret_key))
    }
}

impl KeyCustody for LocalKey {
    fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn sign_schnorr(&self, msg: &Message) -> Signature {
        self.secp.sign_schnorr_no_aux_rand(msg, &self.keypair)
    }

    fn musig_partial_sign(
        &self,
        session: &MusigSession,
        sec_nonce: MusigSecNonce,
        key_agg_cache: &MusigKeyAggCache,
    ) -> Result<MusigPartialSignature, SwapError> {
        session
            .partial_sign(&self.secp, sec_nonce, &self.keypair, key_agg_cache)
            .map_err(|e| SwapError::Crypto(format!("musig partial sign: {e:?}")))
    }
}

pub fn derive_secret_key(signer: &SwSigner, index: u32) -> Result<SecretKey, SwapError> {
    let child = ChildNumber::from_normal_idx(index)
        .map_err(|e| SwapError::Crypto(format!("invalid derivation index {index}: {e}")))?;
    let path = DerivationPath::from(vec![child]);
    let xprv = signer
        .derive_xprv(&path)
        .map_err(|e| SwapError::Crypto(format!("derive xprv: {e:?}")))?;
    Ok(xprv.private_key)
}
