//! Encrypted, atomically-updated secret store.
//!
//! The store is the single point of truth for which credentials and
//! policies exist, and for the audit chain. Every byte of the payload on
//! disk is ciphertext; the clear-text header is integrity-bound to the
//! payload as AEAD associated data.
//!
//! On-disk layout:
//!
//! ```text
//! u32 header_len (LE) || header (bincode) || nonce (24) || ciphertext||tag
//! ```
//!
//! # Persistence protocol
//!
//! Every mutating operation serializes the whole in-memory payload,
//! encrypts it with a fresh nonce, writes a temporary file in the target
//! directory, flushes it to stable storage, and atomically replaces the
//! target path. A failure anywhere before the rename leaves the previous
//! file byte-for-byte intact.
//!
//! # Concurrency
//!
//! Single-writer, whole-payload transactions. An advisory exclusive lock on
//! a sibling `<store>.lock` file is held for the duration of each mutating
//! call; a concurrent writer fails fast with [`StoreError::Locked`] instead
//! of blocking. The lock lives on a sibling file because the atomic rename
//! replaces the store file's inode on every persist.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditChain;
use crate::crypto::{
    self, EncryptionKey, KdfParams, MasterKey, NONCE_LEN, SALT_LEN, Secret, TAG_LEN,
};
use crate::error::{AuditError, CryptoError, StoreError};
use crate::eval::{EvaluationContext, PolicyEvaluation, Verdict};
use crate::policy::Policy;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// HKDF info labels for the store's subkeys.
const PAYLOAD_LABEL: &str = "payload";
const AUDIT_LABEL: &str = "audit-log";
const CREDENTIAL_LABEL: &str = "credential";

/// Kind of secret material a credential holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretType {
    Password,
    HmacKey,
    Keypair,
}

/// A stored credential. `secret_blob` is AEAD ciphertext under the
/// `"credential"` subkey with the credential id as associated data; the
/// plaintext exists only transiently during an accepted access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Unique, immutable identifier.
    pub id: String,
    pub label: String,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on every accepted use; fallback anchor for `onlyFor` hooks.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Reference to an independently addressable policy, not ownership.
    pub policy_id: Option<String>,
    pub secret_type: SecretType,
    /// `nonce || ciphertext || tag` under the credential subkey.
    pub secret_blob: Vec<u8>,
    /// Monotonic non-decreasing attempt counter.
    pub usage_counter: u32,
}

/// Request to create a credential. The plaintext secret is consumed and
/// zeroized once sealed.
#[derive(Debug)]
pub struct NewCredential {
    /// Explicit id, or `None` to generate one.
    pub id: Option<String>,
    pub label: String,
    pub tags: BTreeSet<String>,
    pub policy_id: Option<String>,
    pub secret_type: SecretType,
    pub secret: Secret,
}

/// What a rotation replaces. A closed set: there is no partial-field
/// update beyond these.
#[derive(Debug)]
pub enum Rotation {
    /// Replace the secret material.
    Secret {
        secret_type: SecretType,
        secret: Secret,
    },
    /// Attach, replace, or detach (`None`) the policy link.
    Policy { policy_id: Option<String> },
    /// Replace both at once.
    Both {
        secret_type: SecretType,
        secret: Secret,
        policy_id: Option<String>,
    },
}

/// Result of a credential access: the evaluation always, the secret only
/// on `Accept`.
#[derive(Debug)]
pub struct AccessOutcome {
    pub secret: Option<Secret>,
    pub evaluation: PolicyEvaluation,
}

/// Clear-text store header. Not secret, but integrity-bound: the exact
/// header bytes are the AEAD associated data for the payload.
///
/// Field order is part of the format: `format_version` is serialized first
/// so unsupported versions are detected before anything else is parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreHeader {
    format_version: u32,
    store_uuid: String,
    kdf_params: KdfParams,
    salt: [u8; SALT_LEN],
}

/// The decrypted payload. Exists only in memory while the store is open.
#[derive(Clone, Default, Serialize, Deserialize)]
struct StorePayload {
    credentials: BTreeMap<String, Credential>,
    policies: BTreeMap<String, Policy>,
    audit_chain: AuditChain,
}

/// An open secret store: one file, one passphrase, one payload.
///
/// Create with [`SecretStore::init`], reopen with [`SecretStore::open`].
/// There is no process-wide singleton; callers own the handle and pass it
/// through their call chain.
pub struct SecretStore {
    path: PathBuf,
    lock_path: PathBuf,
    header: StoreHeader,
    payload_key: EncryptionKey,
    audit_key: EncryptionKey,
    credential_key: EncryptionKey,
    payload: StorePayload,
}

impl SecretStore {
    /// Create a new store file.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyInitialized`] if a file exists at `path`;
    ///   never silently overwrites.
    /// - [`StoreError::Crypto`] if the KDF parameters are invalid or key
    ///   derivation fails.
    /// - [`StoreError::Locked`] / [`StoreError::Io`] on lock or write
    ///   failure.
    pub fn init(
        path: impl AsRef<Path>,
        passphrase: &Secret,
        kdf_params: KdfParams,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        kdf_params.validate().map_err(StoreError::Crypto)?;
        if path.exists() {
            return Err(StoreError::AlreadyInitialized {
                path: path.display().to_string(),
            });
        }

        let salt = crypto::generate_salt();
        let keys = StoreKeys::derive(passphrase, &salt, &kdf_params)?;
        let header = StoreHeader {
            format_version: FORMAT_VERSION,
            store_uuid: Uuid::new_v4().to_string(),
            kdf_params,
            salt,
        };

        let store = Self {
            path: path.to_path_buf(),
            lock_path: lock_path_for(path),
            header,
            payload_key: keys.payload,
            audit_key: keys.audit,
            credential_key: keys.credential,
            payload: StorePayload::default(),
        };

        let _guard = store.acquire_write_lock()?;
        store.persist()?;

        info!(
            path = %store.path.display(),
            store_uuid = %store.header.store_uuid,
            "store initialized"
        );
        Ok(store)
    }

    /// Open an existing store file.
    ///
    /// # Errors
    ///
    /// - [`StoreError::VersionUnsupported`] for an unknown format version,
    ///   detected before any key derivation or decryption is attempted.
    /// - [`StoreError::Integrity`] for a wrong passphrase or any tampering
    ///   with the file; the two are deliberately indistinguishable.
    /// - [`StoreError::InvalidSignature`] if the audit chain fails
    ///   verification anywhere; a broken chain is never silently truncated.
    pub fn open(path: impl AsRef<Path>, passphrase: &Secret) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;

        if bytes.len() < 4 {
            return Err(StoreError::Integrity);
        }
        let header_len = u32::from_le_bytes(
            bytes[0..4].try_into().map_err(|_| StoreError::Integrity)?,
        );
        let header_len = usize::try_from(header_len).map_err(|_| StoreError::Integrity)?;
        let nonce_start = 4usize
            .checked_add(header_len)
            .ok_or(StoreError::Integrity)?;
        let body_start = nonce_start
            .checked_add(NONCE_LEN)
            .ok_or(StoreError::Integrity)?;
        let min_len = body_start.checked_add(TAG_LEN).ok_or(StoreError::Integrity)?;
        if bytes.len() < min_len {
            return Err(StoreError::Integrity);
        }

        let header_bytes = &bytes[4..nonce_start];
        // The version is the header's first field; check it before parsing
        // the rest, so future header layouts still report VersionUnsupported.
        if header_bytes.len() < 4 {
            return Err(StoreError::Integrity);
        }
        let found = u32::from_le_bytes(
            header_bytes[0..4]
                .try_into()
                .map_err(|_| StoreError::Integrity)?,
        );
        if found != FORMAT_VERSION {
            return Err(StoreError::VersionUnsupported {
                found,
                supported: FORMAT_VERSION,
            });
        }
        let header: StoreHeader =
            bincode::deserialize(header_bytes).map_err(|_| StoreError::Integrity)?;

        let keys = StoreKeys::derive(passphrase, &header.salt, &header.kdf_params)?;

        let nonce: [u8; NONCE_LEN] = bytes[nonce_start..body_start]
            .try_into()
            .map_err(|_| StoreError::Integrity)?;
        let plaintext = crypto::aead_decrypt(&keys.payload, &nonce, header_bytes, &bytes[body_start..])
            .map_err(|_| StoreError::Integrity)?;
        let payload: StorePayload =
            bincode::deserialize(&plaintext).map_err(|_| StoreError::Integrity)?;

        payload
            .audit_chain
            .verify(&keys.audit)
            .map_err(|AuditError::ChainBroken { index }| StoreError::InvalidSignature { index })?;

        info!(
            path = %path.display(),
            store_uuid = %header.store_uuid,
            credentials = payload.credentials.len(),
            policies = payload.policies.len(),
            audit_entries = payload.audit_chain.len(),
            "store opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            lock_path: lock_path_for(path),
            header,
            payload_key: keys.payload,
            audit_key: keys.audit,
            credential_key: keys.credential,
            payload,
        })
    }

    /// Look up a credential and, if its policy accepts, release the secret.
    ///
    /// The evaluation result is returned in every case; the decrypted
    /// secret only on [`Verdict::Accept`]. Every attempt is appended to the
    /// audit chain and persisted atomically. The usage counter advances on
    /// acceptance, and on failure only when the policy has `max_attempts`
    /// set (the cap must count failures too).
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] for a missing credential, or a dangling
    ///   policy reference (the secret is not released in that case).
    /// - [`StoreError::Locked`] if another writer holds the store lock.
    pub fn get_credential(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessOutcome, StoreError> {
        self.access(id, now, None, true)
    }

    /// Decide whether a presented secret is currently valid, without ever
    /// releasing the stored one.
    ///
    /// The presented value is checked against the stored credential (as the
    /// evaluation's integrity step) and the policy is evaluated as in
    /// [`SecretStore::get_credential`], with identical audit and usage
    /// bookkeeping: an accepted presentation is a use.
    ///
    /// # Errors
    ///
    /// Same as [`SecretStore::get_credential`].
    pub fn verify_credential(
        &mut self,
        id: &str,
        presented: &Secret,
        now: DateTime<Utc>,
    ) -> Result<PolicyEvaluation, StoreError> {
        self.access(id, now, Some(presented), false)
            .map(|outcome| outcome.evaluation)
    }

    fn access(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
        attempted: Option<&Secret>,
        release: bool,
    ) -> Result<AccessOutcome, StoreError> {
        let _guard = self.acquire_write_lock()?;

        let cred = self
            .payload
            .credentials
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_owned() })?;

        // Commitment for the evaluation's integrity step. The plaintext is
        // dropped (zeroized) as soon as the digest is taken.
        let secret_digest: Option<[u8; 32]> = if attempted.is_some() {
            let plaintext =
                crypto::open_blob(&self.credential_key, cred.id.as_bytes(), &cred.secret_blob)?;
            Some(Sha256::digest(plaintext.as_slice()).into())
        } else {
            None
        };

        let (evaluation, counts_failures) = match &cred.policy_id {
            Some(policy_id) => {
                let policy = self.payload.policies.get(policy_id).ok_or_else(|| {
                    StoreError::NotFound {
                        id: policy_id.clone(),
                    }
                })?;
                let ctx = EvaluationContext {
                    now_utc: now,
                    created_at: Some(cred.created_at),
                    last_used_at: cred.last_used_at,
                    usage_count: cred.usage_counter,
                    attempted_value: attempted.cloned(),
                    secret_digest,
                };
                (policy.evaluate(&ctx), policy.max_attempts.is_some())
            }
            None => (
                evaluate_unattached(attempted, secret_digest.as_ref()),
                false,
            ),
        };

        let accepted = evaluation.verdict.is_accept();
        let secret = if accepted && release {
            let plaintext =
                crypto::open_blob(&self.credential_key, cred.id.as_bytes(), &cred.secret_blob)?;
            Some(Secret::new(plaintext.to_vec()))
        } else {
            None
        };

        if let Some(cred) = self.payload.credentials.get_mut(id) {
            if accepted || counts_failures {
                cred.usage_counter = cred.usage_counter.saturating_add(1);
                cred.updated_at = now;
            }
            if accepted {
                cred.last_used_at = Some(now);
            }
        }

        let reason = evaluation
            .details
            .get("reason")
            .cloned()
            .unwrap_or_else(|| evaluation.verdict.as_str().to_owned());
        self.payload
            .audit_chain
            .append(&self.audit_key, now, id, evaluation.verdict, &reason);

        self.persist()?;

        info!(
            credential = %id,
            verdict = evaluation.verdict.as_str(),
            "credential access evaluated"
        );

        Ok(AccessOutcome { secret, evaluation })
    }

    /// Add a credential, sealing its secret under the credential subkey.
    ///
    /// Returns the credential id (generated when the request carries none).
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the id already exists; the on-disk
    ///   file is left untouched.
    /// - [`StoreError::NotFound`] if the referenced policy does not exist.
    pub fn add_credential(
        &mut self,
        new: NewCredential,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let _guard = self.acquire_write_lock()?;

        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.payload.credentials.contains_key(&id) {
            return Err(StoreError::Conflict { id });
        }
        if let Some(policy_id) = &new.policy_id {
            if !self.payload.policies.contains_key(policy_id) {
                return Err(StoreError::NotFound {
                    id: policy_id.clone(),
                });
            }
        }

        let secret_blob =
            crypto::seal_blob(&self.credential_key, id.as_bytes(), new.secret.as_bytes())?;
        self.payload.credentials.insert(
            id.clone(),
            Credential {
                id: id.clone(),
                label: new.label,
                tags: new.tags,
                created_at: now,
                updated_at: now,
                last_used_at: None,
                policy_id: new.policy_id,
                secret_type: new.secret_type,
                secret_blob,
                usage_counter: 0,
            },
        );
        self.persist()?;

        info!(credential = %id, "credential added");
        Ok(id)
    }

    /// Replace a credential's secret and/or policy link.
    ///
    /// Preserves `id`, `created_at`, and `tags`; bumps `updated_at`. The
    /// superseded plaintext is zeroized once the new blob is sealed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] for a missing credential or a missing
    ///   rotation target policy.
    pub fn rotate_credential(
        &mut self,
        id: &str,
        rotation: Rotation,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = self.acquire_write_lock()?;

        if !self.payload.credentials.contains_key(id) {
            return Err(StoreError::NotFound { id: id.to_owned() });
        }

        let (new_secret, new_policy) = match rotation {
            Rotation::Secret {
                secret_type,
                secret,
            } => (Some((secret_type, secret)), None),
            Rotation::Policy { policy_id } => (None, Some(policy_id)),
            Rotation::Both {
                secret_type,
                secret,
                policy_id,
            } => (Some((secret_type, secret)), Some(policy_id)),
        };

        if let Some(Some(policy_id)) = &new_policy {
            if !self.payload.policies.contains_key(policy_id) {
                return Err(StoreError::NotFound {
                    id: policy_id.clone(),
                });
            }
        }

        let sealed = match new_secret {
            Some((secret_type, secret)) => Some((
                secret_type,
                crypto::seal_blob(&self.credential_key, id.as_bytes(), secret.as_bytes())?,
            )),
            None => None,
        };

        if let Some(cred) = self.payload.credentials.get_mut(id) {
            if let Some((secret_type, blob)) = sealed {
                cred.secret_type = secret_type;
                cred.secret_blob = blob;
            }
            if let Some(policy_id) = new_policy {
                cred.policy_id = policy_id;
            }
            cred.updated_at = now;
        }
        self.persist()?;

        info!(credential = %id, "credential rotated");
        Ok(())
    }

    /// Remove a credential. Prior audit entries referencing it are kept;
    /// the chain is never rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id does not exist.
    pub fn remove_credential(&mut self, id: &str) -> Result<(), StoreError> {
        let _guard = self.acquire_write_lock()?;

        if self.payload.credentials.remove(id).is_none() {
            return Err(StoreError::NotFound { id: id.to_owned() });
        }
        self.persist()?;

        info!(credential = %id, "credential removed");
        Ok(())
    }

    /// Borrow a credential's metadata (the secret stays sealed).
    #[must_use]
    pub fn credential(&self, id: &str) -> Option<&Credential> {
        self.payload.credentials.get(id)
    }

    /// All credentials, ordered by id.
    #[must_use]
    pub fn list_credentials(&self) -> Vec<&Credential> {
        self.payload.credentials.values().collect()
    }

    /// Add a policy.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Policy`] if the policy is structurally invalid.
    /// - [`StoreError::Conflict`] if the id already exists.
    pub fn add_policy(&mut self, policy: Policy) -> Result<(), StoreError> {
        let _guard = self.acquire_write_lock()?;

        policy.validate()?;
        if self.payload.policies.contains_key(&policy.id) {
            return Err(StoreError::Conflict {
                id: policy.id.clone(),
            });
        }

        let id = policy.id.clone();
        let hooks = policy.hooks.len();
        self.payload.policies.insert(id.clone(), policy);
        self.persist()?;

        info!(policy = %id, hooks = hooks, "policy added");
        Ok(())
    }

    /// Replace an existing policy. The id is immutable; the new version
    /// must be greater than the stored one.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no policy has this id.
    /// - [`StoreError::Policy`] if the policy is invalid or the version
    ///   does not increase.
    pub fn update_policy(&mut self, policy: Policy) -> Result<(), StoreError> {
        let _guard = self.acquire_write_lock()?;

        policy.validate()?;
        let existing = self.payload.policies.get(&policy.id).ok_or_else(|| {
            StoreError::NotFound {
                id: policy.id.clone(),
            }
        })?;
        if policy.version <= existing.version {
            return Err(crate::error::PolicyError::Invalid {
                reason: format!(
                    "version must increase on update (stored {}, got {})",
                    existing.version, policy.version
                ),
            }
            .into());
        }

        let id = policy.id.clone();
        let version = policy.version;
        self.payload.policies.insert(id.clone(), policy);
        self.persist()?;

        info!(policy = %id, version = version, "policy updated");
        Ok(())
    }

    /// Remove a policy that no credential references.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the id does not exist.
    /// - [`StoreError::Conflict`] while any credential still references it,
    ///   since credentials must never silently become unevaluable.
    pub fn remove_policy(&mut self, id: &str) -> Result<(), StoreError> {
        let _guard = self.acquire_write_lock()?;

        if !self.payload.policies.contains_key(id) {
            return Err(StoreError::NotFound { id: id.to_owned() });
        }
        if self
            .payload
            .credentials
            .values()
            .any(|c| c.policy_id.as_deref() == Some(id))
        {
            return Err(StoreError::Conflict { id: id.to_owned() });
        }

        self.payload.policies.remove(id);
        self.persist()?;

        info!(policy = %id, "policy removed");
        Ok(())
    }

    #[must_use]
    pub fn get_policy(&self, id: &str) -> Option<&Policy> {
        self.payload.policies.get(id)
    }

    /// All policies, ordered by id.
    #[must_use]
    pub fn list_policies(&self) -> Vec<&Policy> {
        self.payload.policies.values().collect()
    }

    /// The audit chain, oldest entry first.
    #[must_use]
    pub fn audit(&self) -> &AuditChain {
        &self.payload.audit_chain
    }

    /// Re-encrypt the full payload to `out_path` under an independent salt
    /// and nonce, so the export is self-contained and independently
    /// openable with `passphrase`. Audit signatures are re-issued under the
    /// export's audit subkey; the hash chain itself is untouched.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyInitialized`] if `out_path` exists.
    /// - [`StoreError::Crypto`] on key derivation or sealing failure.
    pub fn export_encrypted(
        &self,
        out_path: impl AsRef<Path>,
        passphrase: &Secret,
    ) -> Result<(), StoreError> {
        let out_path = out_path.as_ref();
        if out_path.exists() {
            return Err(StoreError::AlreadyInitialized {
                path: out_path.display().to_string(),
            });
        }

        let salt = crypto::generate_salt();
        let keys = StoreKeys::derive(passphrase, &salt, &self.header.kdf_params)?;

        let mut payload = self.payload.clone();
        for cred in payload.credentials.values_mut() {
            let plaintext =
                crypto::open_blob(&self.credential_key, cred.id.as_bytes(), &cred.secret_blob)?;
            cred.secret_blob = crypto::seal_blob(&keys.credential, cred.id.as_bytes(), &plaintext)?;
        }
        payload.audit_chain.resign(&keys.audit);

        let header = StoreHeader {
            format_version: FORMAT_VERSION,
            store_uuid: self.header.store_uuid.clone(),
            kdf_params: self.header.kdf_params.clone(),
            salt,
        };
        write_store_file(out_path, &header, &keys.payload, &payload)?;

        info!(path = %out_path.display(), "store exported");
        Ok(())
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable identifier of this store, preserved across exports.
    #[must_use]
    pub fn store_uuid(&self) -> &str {
        &self.header.store_uuid
    }

    /// The KDF parameters this store was created with.
    #[must_use]
    pub fn kdf_params(&self) -> &KdfParams {
        &self.header.kdf_params
    }

    fn persist(&self) -> Result<(), StoreError> {
        write_store_file(&self.path, &self.header, &self.payload_key, &self.payload)
    }

    fn acquire_write_lock(&self) -> Result<WriteLock, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(WriteLock { file }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(StoreError::Locked)
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("path", &self.path)
            .field("store_uuid", &self.header.store_uuid)
            .field("credentials", &self.payload.credentials.len())
            .field("policies", &self.payload.policies.len())
            .field("audit_entries", &self.payload.audit_chain.len())
            .finish_non_exhaustive()
    }
}

/// The three subkeys a store works with. The master key is dropped (and
/// zeroized) before this struct is returned.
struct StoreKeys {
    payload: EncryptionKey,
    audit: EncryptionKey,
    credential: EncryptionKey,
}

impl StoreKeys {
    fn derive(
        passphrase: &Secret,
        salt: &[u8],
        params: &KdfParams,
    ) -> Result<Self, CryptoError> {
        let master: MasterKey = crypto::derive_master_key(passphrase, salt, params)?;
        Ok(Self {
            payload: crypto::derive_subkey(&master, PAYLOAD_LABEL)?,
            audit: crypto::derive_subkey(&master, AUDIT_LABEL)?,
            credential: crypto::derive_subkey(&master, CREDENTIAL_LABEL)?,
        })
    }
}

/// Evaluation for credentials with no policy attached: accept, unless a
/// presented value fails the integrity check.
fn evaluate_unattached(
    attempted: Option<&Secret>,
    secret_digest: Option<&[u8; 32]>,
) -> PolicyEvaluation {
    use subtle::ConstantTimeEq;

    if let (Some(attempt), Some(expected)) = (attempted, secret_digest) {
        let digest: [u8; 32] = Sha256::digest(attempt.as_bytes()).into();
        if !bool::from(digest.ct_eq(expected)) {
            let mut evaluation = PolicyEvaluation::unconditional_accept();
            evaluation.verdict = Verdict::InvalidSignature;
            evaluation.details.insert(
                "reason".to_owned(),
                "presented value does not match stored credential".to_owned(),
            );
            return evaluation;
        }
    }
    PolicyEvaluation::unconditional_accept()
}

/// Serialize, encrypt, and atomically write one complete store file.
fn write_store_file(
    path: &Path,
    header: &StoreHeader,
    payload_key: &EncryptionKey,
    payload: &StorePayload,
) -> Result<(), StoreError> {
    let header_bytes = bincode::serialize(header).map_err(|e| StoreError::Serialization {
        reason: e.to_string(),
    })?;
    let header_len = u32::try_from(header_bytes.len()).map_err(|_| StoreError::Serialization {
        reason: "header too large".to_owned(),
    })?;

    let plaintext = bincode::serialize(payload).map_err(|e| StoreError::Serialization {
        reason: e.to_string(),
    })?;
    let nonce = crypto::generate_nonce();
    let ciphertext = crypto::aead_encrypt(payload_key, &nonce, &header_bytes, &plaintext)?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&header_len.to_le_bytes())?;
    tmp.write_all(&header_bytes)?;
    tmp.write_all(&nonce)?;
    tmp.write_all(&ciphertext)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;

    debug!(
        path = %path.display(),
        bytes = 4 + header_bytes.len() + NONCE_LEN + ciphertext.len(),
        "store file written"
    );
    Ok(())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// RAII guard for the advisory write lock. Dropping releases the lock.
struct WriteLock {
    file: File,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
