//! Error types for `chronovault-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. No variant ever includes secret bytes: errors carry
//! identifiers (credential id, policy id, file path) only.
//!
//! Temporal outcomes (`Expired`, `NotYetValid`, ...) are NOT errors: they are
//! first-class [`Verdict`](crate::eval::Verdict) values returned by a
//! successful evaluation call.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Argon2id key derivation failed. This only happens on resource
    /// exhaustion or out-of-range parameters; parameters are never silently
    /// downgraded.
    #[error("key derivation failed: {reason}")]
    Kdf { reason: String },

    /// XChaCha20-Poly1305 encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// XChaCha20-Poly1305 decryption failed. Wrong key, corrupted
    /// ciphertext, tampered tag, and tampered associated data are
    /// deliberately indistinguishable.
    #[error("decryption failed: authentication error")]
    Decryption,

    /// HKDF subkey expansion failed.
    #[error("subkey derivation failed for label '{label}': {reason}")]
    KeyDerivation { label: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from policy construction and the policy text document format.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy document could not be parsed.
    #[error("policy document parse error: {reason}")]
    Parse { reason: String },

    /// The policy violates a structural invariant (empty id, inverted
    /// range, hook applied to a period kind it cannot resolve).
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// The policy could not be rendered as a text document.
    #[error("policy document serialize error: {reason}")]
    Serialize { reason: String },
}

/// Errors from audit chain verification.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The hash chain or an entry signature failed verification at the
    /// given entry index. The chain must be treated as untrusted in full.
    #[error("audit chain broken at entry {index}")]
    ChainBroken { index: usize },
}

/// Errors from the secret store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A store file already exists at the target path. `init` and
    /// `export_encrypted` never overwrite.
    #[error("store file already exists at '{path}'")]
    AlreadyInitialized { path: String },

    /// A credential or policy with this id already exists, or the target
    /// of the operation is still referenced elsewhere.
    #[error("conflict: '{id}' already exists or is still in use")]
    Conflict { id: String },

    /// No credential or policy with this id.
    #[error("not found: '{id}'")]
    NotFound { id: String },

    /// Another writer holds the store lock. Safe to retry after backoff.
    #[error("store is locked by another writer")]
    Locked,

    /// The store could not be authenticated. Wrong passphrase and on-disk
    /// tampering are deliberately indistinguishable.
    #[error("store integrity check failed: wrong passphrase or corrupted file")]
    Integrity,

    /// The on-disk format version is not supported by this build. Requires
    /// an explicit migration, never attempted automatically.
    #[error("unsupported store format version {found} (supported: {supported})")]
    VersionUnsupported { found: u32, supported: u32 },

    /// The audit chain embedded in the payload failed verification.
    #[error("audit chain verification failed at entry {index}")]
    InvalidSignature { index: usize },

    /// Underlying storage failure, surfaced verbatim.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or header serialization failed.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// A cryptographic operation failed outside the open/decrypt path.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A policy being added or updated is invalid.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
}
