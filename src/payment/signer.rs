//! Payment authorization signing.
//!
//! The engine never sees a private key: signing is delegated through the
//! [`PaymentSigner`] trait. The bundled [`LocalWalletSigner`] derives a
//! stable wallet address from a hex private key and produces deterministic
//! authorization headers; swapping in a hardware or RPC-backed signer is a
//! matter of implementing the trait.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::ProxyError;

use super::challenge::PaymentChallenge;

/// Signs payment authorizations for 402 challenges.
///
/// Implementations must be deterministic given their key material and the
/// challenge nonce, so retries and coalesced requests reproduce the same
/// header.
#[async_trait]
pub trait PaymentSigner: Send + Sync {
    /// The wallet address payments are authorized from (`0x…`).
    fn address(&self) -> &str;

    /// Produce the authorization header value for one challenge.
    ///
    /// `request_digest` is the SHA-256 of the canonical request body; it
    /// binds the signature to the triggering request without the signer
    /// needing to see the body itself.
    async fn sign(
        &self,
        challenge: &PaymentChallenge,
        request_digest: &[u8],
    ) -> Result<String, ProxyError>;
}

/// A signer holding its key material in process memory.
pub struct LocalWalletSigner {
    key: Vec<u8>,
    address: String,
}

impl LocalWalletSigner {
    /// Build from a `0x`-prefixed hex private key (32 bytes).
    pub fn from_hex(key: &str) -> Result<Self, ProxyError> {
        let stripped = key
            .strip_prefix("0x")
            .ok_or_else(|| ProxyError::Config("wallet key must carry a 0x prefix".into()))?;
        if stripped.len() != 64 {
            return Err(ProxyError::Config(format!(
                "wallet key must be 32 bytes of hex, got {} chars",
                stripped.len()
            )));
        }
        let bytes = hex::decode(stripped)
            .map_err(|e| ProxyError::Config(format!("wallet key is not valid hex: {e}")))?;

        // Address derivation: last 20 bytes of the key digest, 0x-hex.
        let digest = Sha256::digest(&bytes);
        let address = format!("0x{}", hex::encode(&digest[digest.len() - 20..]));

        Ok(Self { key: bytes, address })
    }
}

impl std::fmt::Debug for LocalWalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never reach logs.
        f.debug_struct("LocalWalletSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PaymentSigner for LocalWalletSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(
        &self,
        challenge: &PaymentChallenge,
        request_digest: &[u8],
    ) -> Result<String, ProxyError> {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(challenge.nonce.as_bytes());
        hasher.update(challenge.recipient.as_bytes());
        hasher.update(challenge.chain.as_bytes());
        hasher.update(challenge.asset.as_bytes());
        hasher.update(format!("{:.12}", challenge.amount).as_bytes());
        hasher.update(challenge.valid_until.to_be_bytes());
        hasher.update(request_digest);
        let sig = hasher.finalize();

        Ok(format!(
            "x402 {}:{}:{}",
            self.address,
            challenge.nonce,
            hex::encode(sig)
        ))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str =
        "0x000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn challenge(nonce: &str) -> PaymentChallenge {
        PaymentChallenge {
            amount: 0.0042,
            asset: "USDC".into(),
            chain: "base".into(),
            recipient: "0x9f3c00000000000000000000000000000000beef".into(),
            nonce: nonce.into(),
            valid_until: 1_900_000_000,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_from_hex_requires_prefix_and_length() {
        assert!(LocalWalletSigner::from_hex(TEST_KEY).is_ok());
        assert!(LocalWalletSigner::from_hex(&TEST_KEY[2..]).is_err());
        assert!(LocalWalletSigner::from_hex("0xdeadbeef").is_err());
        assert!(LocalWalletSigner::from_hex(&format!("0x{}", "zz".repeat(32))).is_err());
    }

    #[test]
    fn test_address_is_checksummable_hex() {
        let signer = LocalWalletSigner::from_hex(TEST_KEY)
            .unwrap_or_else(|e| panic!("signer build failed: {e}"));
        let addr = signer.address();
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
        assert!(addr[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_signature_is_deterministic() {
        let signer = LocalWalletSigner::from_hex(TEST_KEY)
            .unwrap_or_else(|e| panic!("signer build failed: {e}"));
        let c = challenge("n-1");
        let a = signer.sign(&c, b"digest").await.unwrap_or_else(|e| panic!("{e}"));
        let b = signer.sign(&c, b"digest").await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_signature_varies_with_nonce() {
        let signer = LocalWalletSigner::from_hex(TEST_KEY)
            .unwrap_or_else(|e| panic!("signer build failed: {e}"));
        let a = signer
            .sign(&challenge("n-1"), b"digest")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        let b = signer
            .sign(&challenge("n-2"), b"digest")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_does_not_leak_key_material() {
        let signer = LocalWalletSigner::from_hex(TEST_KEY)
            .unwrap_or_else(|e| panic!("signer build failed: {e}"));
        let rendered = format!("{signer:?}");
        assert!(!rendered.contains("0001020304"));
        assert!(rendered.contains(signer.address()));
    }
}
