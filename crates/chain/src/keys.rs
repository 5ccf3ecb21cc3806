//! secp256k1 key material for the keeper account.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bech32::{ToBase32, Variant};
use bip32::{PublicKey, XPrv};
use bip39::{Language, Mnemonic};
use k256::ecdsa::signature::DigestSigner;
use k256::ecdsa::Signature;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Cosmos Hub BIP-44 coin type.
pub const COSMOS_COIN_TYPE: u32 = 118;

/// The keeper's signing key.
///
/// Signs both transactions (over the SHA-256 of the `SignDoc`) and the
/// price payloads the contract verifies on `update_prices`.
#[derive(Clone)]
pub struct SigningKey {
    inner: k256::ecdsa::SigningKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Derive from an English BIP-39 mnemonic (12 to 24 words) along
    /// `m/44'/{coin_type}'/0'/0/0`.
    pub fn from_mnemonic(phrase: &str, coin_type: u32) -> Result<Self> {
        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase.trim())
            .map_err(|e| anyhow::anyhow!("invalid mnemonic: {e}"))?;
        // Empty BIP-39 passphrase, as wallets do
        let seed = mnemonic.to_seed_normalized("");
        let path = format!("m/44'/{coin_type}'/0'/0/0");
        let xprv = XPrv::derive_from_path(&seed, &path.parse()?)?;

        Ok(Self { inner: xprv.private_key().clone() })
    }

    /// Load a raw 32-byte key given as hex (with or without `0x`).
    pub fn from_hex(key: &str) -> Result<Self> {
        let bytes = hex::decode(key.trim().trim_start_matches("0x"))
            .context("private key is not valid hex")?;
        if bytes.len() != 32 {
            bail!("private key must be 32 bytes, got {}", bytes.len());
        }
        let inner = k256::ecdsa::SigningKey::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid secp256k1 key: {e}"))?;
        Ok(Self { inner })
    }

    /// Compressed SEC1 public key.
    pub fn public_key(&self) -> [u8; 33] {
        self.inner.verifying_key().to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key())
    }

    /// Bech32 account address: `ripemd160(sha256(pubkey))` under `prefix`.
    pub fn address(&self, prefix: &str) -> Result<String> {
        let sha = Sha256::digest(self.public_key());
        let hash = Ripemd160::digest(sha);
        bech32::encode(prefix, hash.to_base32(), Variant::Bech32)
            .with_context(|| format!("invalid bech32 prefix {prefix:?}"))
    }

    /// 64-byte compact, low-S signature over `sha256(msg)`.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let signature: Signature = self.inner.sign_digest(Sha256::new_with_prefix(msg));
        let signature = signature.normalize_s().unwrap_or(signature);
        signature.to_bytes().into()
    }

    #[cfg(test)]
    pub(crate) fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        use k256::ecdsa::signature::Verifier;
        Signature::from_slice(signature)
            .map(|sig| self.inner.verifying_key().verify(msg, &sig).is_ok())
            .unwrap_or(false)
    }
}
