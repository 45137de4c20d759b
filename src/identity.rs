//! Component A: identity codec. Pure functions mapping (resource, scope)
//! pairs to journal partition/row keys and blob names, and an opaque
//! lease-id encoding over (rowKey, partitionKey).

use base64::{decode as b64_decode, encode as b64_encode};
use md5::{Digest, Md5};

/// Normalises a resource or scope string: trim then lower-case.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn md5_hex(s: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// `resourceUID = md5_hex(resource ‖ scope)`, both normalised first.
/// Used as the blob name and the in-process serialiser key.
pub fn resource_uid(resource: &str, scope: &str) -> String {
    md5_hex(&format!("{}{}", normalize(resource), normalize(scope)))
}

/// `partitionKey(scope) = md5_hex(scope_after_normalisation)`.
pub fn partition_key(scope: &str) -> String {
    md5_hex(&normalize(scope))
}

/// The identifier a record is addressed by within the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordId {
    pub row_key: String,
    pub partition_key: String,
}

impl RecordId {
    pub fn new(row_key: impl Into<String>, partition_key: impl Into<String>) -> Self {
        RecordId {
            row_key: row_key.into(),
            partition_key: partition_key.into(),
        }
    }

    /// `base64_utf8(rowKey ‖ "|" ‖ partitionKey)`.
    pub fn encode(&self) -> String {
        b64_encode(format!("{}|{}", self.row_key, self.partition_key))
    }

    /// Decodes a malformed base64 string, or one without exactly one
    /// `'|'`, to `None` — never panics on untrusted input.
    pub fn decode(lease_id: &str) -> Option<RecordId> {
        let bytes = b64_decode(lease_id).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        let mut parts = text.splitn(2, '|');
        let row_key = parts.next()?;
        let partition_key = parts.next()?;
        if parts.next().is_some() || text.matches('|').count() != 1 {
            return None;
        }
        if row_key.is_empty() || partition_key.is_empty() {
            return None;
        }
        Some(RecordId::new(row_key, partition_key))
    }
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(out, "{:02x}", b).unwrap();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_uid_is_case_and_whitespace_insensitive() {
        let a = resource_uid(" Tenant-1 ", "E2E");
        let b = resource_uid("tenant-1", " e2e ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn lease_id_round_trips() {
        let id = RecordId::new("abc123", "def456");
        let encoded = id.encode();
        let decoded = RecordId::decode(&encoded).expect("should decode");
        assert_eq!(decoded, id);
    }

    #[test]
    fn malformed_lease_id_decodes_to_none() {
        assert!(RecordId::decode("not valid base64!!").is_none());
        assert!(RecordId::decode(&b64_encode("no-pipe-here")).is_none());
        assert!(RecordId::decode(&b64_encode("a|b|c")).is_none());
    }
}
