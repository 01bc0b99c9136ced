//! Cryptographic primitives for `chronovault-core`.
//!
//! Provides Argon2id passphrase-to-key derivation, HKDF-SHA256 subkey
//! separation, and XChaCha20-Poly1305 authenticated encryption. All key
//! material is cleared from memory when dropped.
//!
//! # Security model
//!
//! - The master key exists only in process memory, is never serialized, and
//!   is used solely to derive subkeys, never for encryption directly.
//! - Distinct HKDF info labels yield independent subkeys: compromise of one
//!   subkey reveals neither the others nor the master key.
//! - Every encryption uses a fresh 192-bit random nonce. Nonce uniqueness
//!   relies on CSPRNG collision probability being negligible over a store's
//!   lifetime.
//! - Any single-bit corruption of ciphertext, tag, or associated data fails
//!   decryption outright; there is no partial plaintext.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Salt length for the KDF (stored in the clear-text header).
pub const SALT_LEN: usize = 16;

/// Nonce length for XChaCha20-Poly1305 (192 bits).
pub const NONCE_LEN: usize = 24;

/// Key length for the master key and all subkeys.
pub const KEY_LEN: usize = 32;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Recommended production Argon2id parameters (64 MiB, 3 passes, 4 lanes).
const REC_MEMORY_KIB: u32 = 65536;
const REC_ITERATIONS: u32 = 3;
const REC_PARALLELISM: u32 = 4;

/// Argon2id cost parameters, persisted in the store header.
///
/// Parameters are honored exactly as stored; they are never silently
/// downgraded (or upgraded) on open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes over memory.
    pub iterations: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: REC_MEMORY_KIB,
            iterations: REC_ITERATIONS,
            parallelism: REC_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Validate parameters against hard floors, warning when below the
    /// recommended production values.
    ///
    /// Validation is separate from [`derive_master_key`] so that opening an
    /// existing store always honors its stored parameters; only store
    /// creation paths validate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Kdf`] if any parameter is below the Argon2
    /// algorithm minimums.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.parallelism < 1 {
            return Err(CryptoError::Kdf {
                reason: "parallelism must be at least 1".to_owned(),
            });
        }
        if self.iterations < 1 {
            return Err(CryptoError::Kdf {
                reason: "iterations must be at least 1".to_owned(),
            });
        }
        if self.memory_kib < 8 * self.parallelism {
            return Err(CryptoError::Kdf {
                reason: format!(
                    "memory_kib {} is below the minimum of 8 KiB per lane",
                    self.memory_kib
                ),
            });
        }

        if self.memory_kib < REC_MEMORY_KIB {
            warn!(
                memory_kib = self.memory_kib,
                recommended = REC_MEMORY_KIB,
                "argon2 memory below recommended production value"
            );
        }
        if self.iterations < REC_ITERATIONS {
            warn!(
                iterations = self.iterations,
                recommended = REC_ITERATIONS,
                "argon2 iterations below recommended production value"
            );
        }

        Ok(())
    }
}

/// A byte buffer holding secret material (passphrases, decrypted secrets).
///
/// Zeroized on drop. The inner bytes never appear in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap raw secret bytes.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Borrow the raw bytes.
    ///
    /// Use with care: the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The root secret derived from a passphrase.
///
/// Never serialized, never used for encryption directly; only fed to
/// [`derive_subkey`]. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Borrow the raw key bytes.
    #[must_use]
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit subkey derived from the master key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care — the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh random KDF salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Generate a fresh random AEAD nonce.
#[must_use]
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Derive the master key from a passphrase with Argon2id.
///
/// Deterministic for identical inputs. Deliberately slow and memory-hard,
/// blocking, and non-cancellable; callers in cooperative-scheduling
/// environments must offload this to a dedicated worker.
///
/// # Errors
///
/// Returns [`CryptoError::Kdf`] if the parameters are out of range or the
/// configured memory cannot be allocated. Parameters are never downgraded.
pub fn derive_master_key(
    passphrase: &Secret,
    salt: &[u8],
    params: &KdfParams,
) -> Result<MasterKey, CryptoError> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::Kdf {
        reason: e.to_string(),
    })?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::Kdf {
            reason: e.to_string(),
        })?;

    Ok(MasterKey(out))
}

/// Derive a purpose-bound subkey from the master key with HKDF-SHA256.
///
/// Distinct `info_label`s (`"payload"`, `"audit-log"`, `"credential"`) yield
/// independent keys.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails (only
/// possible when the requested output exceeds 255 hash lengths).
pub fn derive_subkey(
    master: &MasterKey,
    info_label: &str,
) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut derived = [0u8; KEY_LEN];
    hk.expand(info_label.as_bytes(), &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            label: info_label.to_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey(derived))
}

/// Encrypt plaintext with XChaCha20-Poly1305.
///
/// Returns `ciphertext || tag`. The caller supplies the nonce (fresh per
/// call, see [`generate_nonce`]) and stores it alongside the ciphertext.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn aead_encrypt(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption {
            reason: "aead seal failed".to_owned(),
        })
}

/// Decrypt ciphertext produced by [`aead_encrypt`].
///
/// The returned buffer is zeroized on drop, including when the caller
/// propagates an error before consuming it.
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the input cannot contain a
/// tag, and [`CryptoError::Decryption`] on any authentication failure
/// (wrong key, corrupted ciphertext or tag, or mismatched associated data).
pub fn aead_decrypt(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: TAG_LEN,
            actual: ciphertext.len(),
        });
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decryption)
}

/// Seal plaintext into a self-contained blob: `nonce || ciphertext || tag`.
///
/// Used for per-credential secrets stored inside the payload.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal_blob(
    key: &EncryptionKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = generate_nonce();
    let ciphertext = aead_encrypt(key, &nonce, aad, plaintext)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a blob produced by [`seal_blob`].
///
/// # Errors
///
/// Returns [`CryptoError::CiphertextTooShort`] if the blob cannot contain a
/// nonce and tag, and [`CryptoError::Decryption`] on authentication failure.
pub fn open_blob(
    key: &EncryptionKey,
    aad: &[u8],
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: NONCE_LEN + TAG_LEN,
            actual: blob.len(),
        });
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    aead_decrypt(key, &nonce, aad, ciphertext)
}
