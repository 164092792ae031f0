//! Secret Store (C1) and Secure Key Handler (C2).
//!
//! Grounded on `wallet/persister.rs`'s Argon2+AES-GCM envelope and
//! `wallet/manager.rs`'s unlock/lock cache discipline, generalized from a
//! password-derived key to the process-wide master key supplied via
//! `MASTER_ENCRYPTION_KEY`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use zeroize::Zeroizing;

use crate::error::CoreError;

const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;

/// An AEAD-sealed private key as it is persisted on an `automation_wallets` row.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Validated, process-wide cache of the master encryption key.
///
/// `master_key` is called once per process to validate the configured key;
/// every subsequent access is audited with the caller's resource tag via
/// `log::info!` (never logging the key material itself). Rotation is the
/// only path that ever replaces the cached key.
pub struct SecretStore {
    master_key: Zeroizing<[u8; 32]>,
}

impl SecretStore {
    /// Validate a 64-hex-char (32 byte) master key. Fails `ConfigInvalid` on
    /// anything else — this is the one place a bad key is fatal at startup.
    pub fn validate(hex_key: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| CoreError::ConfigInvalid(format!("MASTER_ENCRYPTION_KEY: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            CoreError::ConfigInvalid("MASTER_ENCRYPTION_KEY must decode to 32 bytes".into())
        })?;
        Ok(Self {
            master_key: Zeroizing::new(key),
        })
    }

    /// Returns the cached key, auditing the access. `resource_type`/`resource_id`
    /// identify what the caller is about to decrypt (e.g. `("automation_wallet", wallet_id)`).
    pub fn master_key(&self, resource_type: &str, resource_id: &str) -> &[u8; 32] {
        log::info!("secrets_audit: access key resource={resource_type}:{resource_id}");
        &self.master_key
    }

    /// Swap the cached key for a freshly validated one. Used only by rotation;
    /// the caller is responsible for re-encrypting every wallet under the new
    /// key before (or as part of) calling this, per §9's "atomic swap with a
    /// barrier" note — in this single-process core, holding `&mut self`
    /// behind the caller's own synchronization *is* that barrier.
    pub fn replace(&mut self, new_hex_key: &str) -> Result<(), CoreError> {
        *self = Self::validate(new_hex_key)?;
        Ok(())
    }
}

/// Seal `plaintext` under `key`, producing the three-part envelope stored on
/// an `automation_wallets` row.
pub fn seal(plaintext: &[u8], key: &[u8; 32]) -> Result<Envelope, CoreError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CoreError::CryptoIntegrity(format!("bad key length: {e}")))?;
    let iv_bytes: [u8; IV_LEN] = rand::random();
    let nonce = Nonce::from_slice(&iv_bytes);
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CoreError::CryptoIntegrity(format!("seal failed: {e}")))?;
    let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);
    Ok(Envelope {
        ciphertext: sealed,
        iv: iv_bytes.to_vec(),
        auth_tag,
    })
}

/// Secure Key Handler (C2): decrypt `envelope` under `key`, hand the plaintext
/// to `f`, and guarantee the buffer is zeroed on every exit path — success,
/// `f` panicking, or `f`'s future being dropped before completion, since the
/// `Zeroizing` wrapper's `Drop` runs during unwind as well as normal return.
/// `f` receives only a borrow: it cannot smuggle the buffer out past `with_key`.
pub fn with_key<R>(
    envelope: &Envelope,
    key: &[u8; 32],
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R, CoreError> {
    let plaintext = open(envelope, key)?;
    Ok(f(&plaintext))
}

/// Async counterpart to [`with_key`] for callers whose use of the plaintext
/// (e.g. signing and submitting a transaction) is itself asynchronous. The
/// decrypted buffer is held across the `.await` and zeroed the moment `f`'s
/// future resolves, success or error — `Zeroizing`'s `Drop` runs regardless.
pub async fn with_key_async<R, Fut>(
    envelope: &Envelope,
    key: &[u8; 32],
    f: impl FnOnce(&[u8]) -> Fut,
) -> Result<R, CoreError>
where
    Fut: std::future::Future<Output = R>,
{
    let plaintext = open(envelope, key)?;
    Ok(f(&plaintext).await)
}

fn open(envelope: &Envelope, key: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, CoreError> {
    if envelope.iv.len() != IV_LEN {
        return Err(CoreError::CryptoIntegrity("malformed iv length".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CoreError::CryptoIntegrity(format!("bad key length: {e}")))?;
    let nonce = Nonce::from_slice(&envelope.iv);
    let mut combined = Vec::with_capacity(envelope.ciphertext.len() + envelope.auth_tag.len());
    combined.extend_from_slice(&envelope.ciphertext);
    combined.extend_from_slice(&envelope.auth_tag);
    let plaintext = cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|_| CoreError::CryptoIntegrity("authentication tag mismatch".into()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Outcome of re-encrypting a single wallet during `rotate`.
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub wallet_id: String,
    pub result: Result<Envelope, String>,
}

/// Re-encrypt every `(wallet_id, envelope)` pair under `new_key`. A failure on
/// one wallet (bad old ciphertext) never aborts the batch — every wallet gets
/// an attempt, and failures are collected rather than short-circuiting, per
/// §4.1's "failures in rotate never abort the batch" rule.
pub fn rotate_all<'a>(
    old: &SecretStore,
    new_key: &[u8; 32],
    wallets: impl IntoIterator<Item = (&'a str, &'a Envelope)>,
) -> Vec<RotationOutcome> {
    wallets
        .into_iter()
        .map(|(wallet_id, envelope)| {
            let outcome = open(envelope, old.master_key("automation_wallet", wallet_id))
                .map_err(|e| e.to_string())
                .and_then(|plaintext| seal(&plaintext, new_key).map_err(|e| e.to_string()));
            RotationOutcome {
                wallet_id: wallet_id.to_string(),
                result: outcome,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> [u8; 32] {
        [b; 32]
    }

    #[test]
    fn validate_rejects_wrong_length() {
        assert!(SecretStore::validate("abcd").is_err());
        assert!(SecretStore::validate(&"ab".repeat(31)).is_err());
        assert!(SecretStore::validate(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn seal_open_roundtrip() {
        let k = key(7);
        let envelope = seal(b"super secret key material", &k).unwrap();
        let result = with_key(&envelope, &k, |buf| buf.to_vec()).unwrap();
        assert_eq!(result, b"super secret key material");
    }

    #[test]
    fn open_fails_on_tampered_tag() {
        let k = key(9);
        let mut envelope = seal(b"payload", &k).unwrap();
        envelope.auth_tag[0] ^= 0xFF;
        let err = with_key(&envelope, &k, |_| ()).unwrap_err();
        assert!(matches!(err, CoreError::CryptoIntegrity(_)));
    }

    #[test]
    fn open_fails_under_wrong_key() {
        let envelope = seal(b"payload", &key(1)).unwrap();
        let err = with_key(&envelope, &key(2), |_| ()).unwrap_err();
        assert!(matches!(err, CoreError::CryptoIntegrity(_)));
    }

    #[tokio::test]
    async fn with_key_async_zeroizes_after_await() {
        let k = key(11);
        let envelope = seal(b"signing key bytes", &k).unwrap();
        let result = with_key_async(&envelope, &k, |buf| {
            let copied = buf.to_vec();
            async move {
                tokio::task::yield_now().await;
                copied
            }
        })
        .await
        .unwrap();
        assert_eq!(result, b"signing key bytes");
    }

    #[test]
    fn rotate_all_collects_per_wallet_results() {
        let store = SecretStore {
            master_key: Zeroizing::new(key(3)),
        };
        let good = seal(b"key-a", &key(3)).unwrap();
        let mut bad = seal(b"key-b", &key(3)).unwrap();
        bad.auth_tag[0] ^= 1;

        let wallets = vec![("w1", &good), ("w2", &bad)];
        let outcomes = rotate_all(&store, &key(4), wallets);

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
    }
}
