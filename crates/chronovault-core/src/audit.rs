//! Hash-linked, signed, append-only audit chain.
//!
//! Every credential access attempt is recorded BEFORE the store persists
//! the attempt's side effects. Entries are never edited or deleted: the
//! public surface is append, verify, and iterate only.
//!
//! Each entry's hash covers the previous entry's hash, so truncating,
//! reordering, or rewriting any entry breaks verification from that point
//! on. Entries are additionally signed with the `"audit-log"` subkey, which
//! is distinct from the payload-encryption subkey: a payload-key compromise
//! does not allow forging audit history.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::crypto::EncryptionKey;
use crate::error::AuditError;
use crate::eval::Verdict;

type HmacSha256 = Hmac<Sha256>;

/// Hash of the (nonexistent) entry before the first one.
const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// A single audit record. Secret-free by construction: it carries the
/// credential id and verdict, never the secret or the presented value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the attempt was evaluated.
    pub timestamp: DateTime<Utc>,
    /// The credential the attempt targeted.
    pub credential_id: String,
    /// Outcome of the evaluation.
    pub verdict: Verdict,
    /// Human-readable reason, taken from the evaluation diagnostics.
    pub reason: String,
    /// Hash of the previous entry ([`GENESIS_HASH`] for the first).
    pub prev_hash: [u8; 32],
    /// SHA-256 over `prev_hash` and this entry's canonical fields.
    pub entry_hash: [u8; 32],
    /// HMAC-SHA256 of `entry_hash` under the audit subkey.
    pub signature: [u8; 32],
}

impl AuditEntry {
    /// Hex form of the entry hash, for display by collaborator layers.
    #[must_use]
    pub fn entry_hash_hex(&self) -> String {
        hex::encode(self.entry_hash)
    }
}

/// The append-only chain embedded in the store payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditChain {
    entries: Vec<AuditEntry>,
}

impl AuditChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn last(&self) -> Option<&AuditEntry> {
        self.entries.last()
    }

    /// Append a new entry, linking it to the current chain head and signing
    /// it with the audit subkey.
    pub fn append(
        &mut self,
        key: &EncryptionKey,
        timestamp: DateTime<Utc>,
        credential_id: &str,
        verdict: Verdict,
        reason: &str,
    ) {
        let prev_hash = self.entries.last().map_or(GENESIS_HASH, |e| e.entry_hash);
        let entry_hash = compute_entry_hash(&prev_hash, timestamp, credential_id, verdict, reason);
        let signature = sign(key, &entry_hash);

        self.entries.push(AuditEntry {
            timestamp,
            credential_id: credential_id.to_owned(),
            verdict,
            reason: reason.to_owned(),
            prev_hash,
            entry_hash,
            signature,
        });
    }

    /// Verify the whole chain: linkage, recomputed hashes, and signatures.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ChainBroken`] at the first entry whose linkage,
    /// hash, or signature does not verify. A broken chain must be treated
    /// as untrusted in full; there is no partial acceptance.
    pub fn verify(&self, key: &EncryptionKey) -> Result<(), AuditError> {
        let mut expected_prev = GENESIS_HASH;
        for (index, entry) in self.entries.iter().enumerate() {
            let linked = entry.prev_hash.ct_eq(&expected_prev);
            let recomputed = compute_entry_hash(
                &entry.prev_hash,
                entry.timestamp,
                &entry.credential_id,
                entry.verdict,
                &entry.reason,
            );
            let hash_ok = entry.entry_hash.ct_eq(&recomputed);
            let sig_ok = sign(key, &entry.entry_hash).ct_eq(&entry.signature);

            if !bool::from(linked & hash_ok & sig_ok) {
                return Err(AuditError::ChainBroken { index });
            }
            expected_prev = entry.entry_hash;
        }
        Ok(())
    }

    /// Re-sign every entry under a different audit subkey, leaving the hash
    /// chain untouched. Used when exporting under a new passphrase.
    pub(crate) fn resign(&mut self, key: &EncryptionKey) {
        for entry in &mut self.entries {
            entry.signature = sign(key, &entry.entry_hash);
        }
    }
}

/// Canonical entry hash: SHA-256 over the previous hash followed by each
/// field length-prefixed, so field boundaries are unambiguous.
fn compute_entry_hash(
    prev_hash: &[u8; 32],
    timestamp: DateTime<Utc>,
    credential_id: &str,
    verdict: Verdict,
    reason: &str,
) -> [u8; 32] {
    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    for field in [
        ts.as_bytes(),
        credential_id.as_bytes(),
        verdict.as_str().as_bytes(),
        reason.as_bytes(),
    ] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    hasher.finalize().into()
}

fn sign(key: &EncryptionKey, entry_hash: &[u8; 32]) -> [u8; 32] {
    // HMAC-SHA256 accepts any key length per RFC 2104 — this never fails.
    #[allow(clippy::unwrap_used)]
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
    mac.update(entry_hash);
    mac.finalize().into_bytes().into()
}
