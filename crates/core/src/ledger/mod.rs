//! Hash chain over a request's history entries.
//!
//! Each entry hashes its own content together with the previous entry's hash
//! and is signed with an HMAC key held by operators, so an edited, reordered
//! or deleted entry breaks verification from that point on.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::history::{ApprovalHistory, HistoryDraft, HistoryId};
use crate::domain::request::RequestId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub request_id: RequestId,
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Clone)]
pub struct HistoryLedger {
    signing_key: Vec<u8>,
}

impl std::fmt::Debug for HistoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLedger").field("signing_key", &"[REDACTED]").finish()
    }
}

impl HistoryLedger {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self { signing_key: signing_key.as_ref().to_vec() }
    }

    /// Places `draft` after `previous` on the request's chain.
    pub fn seal(
        &self,
        draft: HistoryDraft,
        previous: Option<&ApprovalHistory>,
        timestamp: DateTime<Utc>,
    ) -> ApprovalHistory {
        let sequence = previous.map(|entry| entry.sequence).unwrap_or(0).saturating_add(1);
        let prev_hash = previous.map(|entry| entry.entry_hash.clone());

        let mut entry = ApprovalHistory {
            id: HistoryId(Uuid::new_v4().to_string()),
            request_id: draft.request_id,
            sequence,
            step_id: draft.step_id,
            action: draft.action,
            actor_id: draft.actor_id,
            timestamp,
            comments: draft.comments,
            metadata: draft.metadata,
            is_internal: draft.is_internal,
            prev_hash,
            entry_hash: String::new(),
            signature: String::new(),
        };
        entry.entry_hash = hash_entry_material(&entry);
        entry.signature = hmac_hex(&self.signing_key, entry.entry_hash.as_bytes());
        entry
    }

    pub fn verify_chain(
        &self,
        request_id: &RequestId,
        entries: &[ApprovalHistory],
    ) -> VerificationResult {
        let fail = |index: usize, latest: Option<String>, reason: String| VerificationResult {
            request_id: request_id.clone(),
            valid: false,
            verified_entries: index,
            latest_hash: latest,
            failure_reason: Some(reason),
        };

        let mut previous_hash: Option<String> = None;
        for (index, entry) in entries.iter().enumerate() {
            if &entry.request_id != request_id {
                return fail(
                    index,
                    previous_hash,
                    format!("entry {} belongs to request {}", entry.id.0, entry.request_id),
                );
            }

            let expected_sequence = u64::try_from(index).unwrap_or(u64::MAX).saturating_add(1);
            if entry.sequence != expected_sequence {
                return fail(
                    index,
                    previous_hash,
                    format!(
                        "sequence mismatch at entry {}: expected {}, found {}",
                        entry.id.0, expected_sequence, entry.sequence
                    ),
                );
            }

            if entry.prev_hash != previous_hash {
                return fail(
                    index,
                    previous_hash,
                    format!("previous hash mismatch at entry {}", entry.id.0),
                );
            }

            if hash_entry_material(entry) != entry.entry_hash {
                return fail(
                    index,
                    previous_hash,
                    format!("entry hash mismatch at entry {}", entry.id.0),
                );
            }

            if hmac_hex(&self.signing_key, entry.entry_hash.as_bytes()) != entry.signature {
                return fail(
                    index,
                    previous_hash,
                    format!("signature mismatch at entry {}", entry.id.0),
                );
            }

            previous_hash = Some(entry.entry_hash.clone());
        }

        VerificationResult {
            request_id: request_id.clone(),
            valid: true,
            verified_entries: entries.len(),
            latest_hash: previous_hash,
            failure_reason: None,
        }
    }
}

/// Canonical JSON over the hashed fields, so free text in comments or
/// metadata cannot shift field boundaries.
fn hash_entry_material(entry: &ApprovalHistory) -> String {
    let material = serde_json::json!({
        "request_id": entry.request_id.0,
        "sequence": entry.sequence,
        "step_id": entry.step_id.as_ref().map(|id| id.0.as_str()),
        "action": entry.action.as_str(),
        "actor_id": entry.actor_id,
        "timestamp": entry.timestamp.to_rfc3339(),
        "comments": entry.comments,
        "metadata": entry.metadata,
        "is_internal": entry.is_internal,
        "prev_hash": entry.prev_hash,
    });
    sha256_hex(material.to_string().as_bytes())
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return sha256_hex(payload),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::HistoryLedger;
    use crate::domain::history::{ApprovalHistory, HistoryAction, HistoryDraft};
    use crate::domain::request::RequestId;

    fn chain(ledger: &HistoryLedger, request: &str, actions: &[HistoryAction]) -> Vec<ApprovalHistory> {
        let mut entries: Vec<ApprovalHistory> = Vec::new();
        for action in actions {
            let draft = HistoryDraft::new(RequestId(request.to_string()), *action, "u-actor")
                .with_metadata("level", "1");
            let entry = ledger.seal(draft, entries.last(), Utc::now());
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn seal_links_previous_hash_and_sequence() {
        let ledger = HistoryLedger::new("secret-key");
        let entries =
            chain(&ledger, "REQ-1", &[HistoryAction::Created, HistoryAction::Submitted]);

        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[0].prev_hash, None);
        assert_eq!(entries[1].sequence, 2);
        assert_eq!(entries[1].prev_hash.as_ref(), Some(&entries[0].entry_hash));
    }

    #[test]
    fn verify_chain_succeeds_for_untampered_entries() {
        let ledger = HistoryLedger::new("secret-key");
        let entries = chain(
            &ledger,
            "REQ-2",
            &[HistoryAction::Created, HistoryAction::Submitted, HistoryAction::Approved],
        );

        let result = ledger.verify_chain(&RequestId("REQ-2".to_string()), &entries);
        assert!(result.valid);
        assert_eq!(result.verified_entries, 3);
        assert_eq!(result.latest_hash.as_ref(), Some(&entries[2].entry_hash));
    }

    #[test]
    fn verify_chain_detects_edited_content() {
        let ledger = HistoryLedger::new("secret-key");
        let mut entries =
            chain(&ledger, "REQ-3", &[HistoryAction::Created, HistoryAction::Rejected]);
        entries[1].actor_id = "u-someone-else".to_string();

        let result = ledger.verify_chain(&RequestId("REQ-3".to_string()), &entries);
        assert!(!result.valid);
        assert_eq!(result.verified_entries, 1);
        assert!(result.failure_reason.unwrap_or_default().contains("entry hash mismatch"));
    }

    #[test]
    fn verify_chain_detects_deleted_entry() {
        let ledger = HistoryLedger::new("secret-key");
        let mut entries = chain(
            &ledger,
            "REQ-4",
            &[HistoryAction::Created, HistoryAction::Submitted, HistoryAction::Cancelled],
        );
        entries.remove(1);

        let result = ledger.verify_chain(&RequestId("REQ-4".to_string()), &entries);
        assert!(!result.valid);
        assert!(result.failure_reason.unwrap_or_default().contains("sequence mismatch"));
    }

    #[test]
    fn verify_chain_rejects_foreign_signing_key() {
        let entries = chain(&HistoryLedger::new("secret-key"), "REQ-5", &[HistoryAction::Created]);

        let result =
            HistoryLedger::new("other-key").verify_chain(&RequestId("REQ-5".to_string()), &entries);
        assert!(!result.valid);
        assert!(result.failure_reason.unwrap_or_default().contains("signature mismatch"));
    }

    #[test]
    fn metadata_values_cannot_forge_extra_keys() {
        let ledger = HistoryLedger::new("secret-key");
        let request_id = RequestId("REQ-6".to_string());
        let at = Utc::now();

        let packed = HistoryDraft::new(request_id.clone(), HistoryAction::Commented, "u-actor")
            .with_metadata("a", "1;b=2");
        let split = HistoryDraft::new(request_id, HistoryAction::Commented, "u-actor")
            .with_metadata("a", "1")
            .with_metadata("b", "2");

        let packed = ledger.seal(packed, None, at);
        let split = ledger.seal(split, None, at);
        assert_ne!(packed.entry_hash, split.entry_hash);
    }

    #[test]
    fn comment_text_cannot_impersonate_other_fields() {
        let ledger = HistoryLedger::new("secret-key");
        let request_id = RequestId("REQ-7".to_string());
        let at = Utc::now();

        let plain = HistoryDraft::new(request_id.clone(), HistoryAction::Commented, "u-actor")
            .with_comments(Some("ok".to_string()))
            .with_metadata("level", "1");
        let smuggled = HistoryDraft::new(request_id, HistoryAction::Commented, "u-actor")
            .with_comments(Some("ok|level=1".to_string()));

        let plain = ledger.seal(plain, None, at);
        let smuggled = ledger.seal(smuggled, None, at);
        assert_ne!(plain.entry_hash, smuggled.entry_hash);
    }
}
