//! CID-based content addressing with SHA-256 verification
//!
//! Skiff blocks are addressed by CIDv1 with a sha2-256 multihash and the
//! raw binary codec. Keys compare by their encoded bytes.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// sha2-256 multihash code
/// See: https://github.com/multiformats/multicodec/blob/master/table.csv
const SHA256_CODE: u64 = 0x12;

/// Raw binary codec for skiff blocks
const RAW_CODEC: u64 = 0x55;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// Compute the SHA-256 digest of data
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Compute the skiff CID for data (CIDv1, sha2-256, raw codec)
pub fn block_cid(data: &[u8]) -> Result<Cid, CidError> {
    let digest = sha256_digest(data);

    let mh = Multihash::wrap(SHA256_CODE, &digest)
        .map_err(|e| CidError::Multihash(format!("Failed to create multihash: {}", e)))?;

    Ok(Cid::new_v1(RAW_CODEC, mh))
}

/// Verify data against an expected CID
pub fn verify_block(data: &[u8], expected_cid: &Cid) -> Result<(), CidError> {
    let computed_cid = block_cid(data)?;

    if &computed_cid != expected_cid {
        return Err(CidError::HashMismatch {
            expected: expected_cid.to_string(),
            actual: computed_cid.to_string(),
        });
    }

    Ok(())
}

/// Parse a CID from bytes
pub fn parse_cid(bytes: &[u8]) -> Result<Cid, CidError> {
    Cid::try_from(bytes).map_err(|e| CidError::InvalidCid(e.to_string()))
}

/// Parse a CID from string
pub fn parse_cid_str(s: &str) -> Result<Cid, CidError> {
    s.parse()
        .map_err(|e| CidError::InvalidCid(format!("{}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest() {
        let data = b"hello world";
        let digest = sha256_digest(data);

        // SHA-256 produces 32-byte digests
        assert_eq!(digest.len(), 32);

        // Same data should produce same digest
        let digest2 = sha256_digest(data);
        assert_eq!(digest, digest2);

        // Different data should produce different digest
        let digest3 = sha256_digest(b"goodbye world");
        assert_ne!(digest, digest3);
    }

    #[test]
    fn test_block_cid() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        // CID should be version 1
        assert_eq!(cid.version(), cid::Version::V1);

        // Should use raw codec (0x55)
        assert_eq!(cid.codec(), 0x55);

        // Same data should produce same CID
        let cid2 = block_cid(data).unwrap();
        assert_eq!(cid, cid2);
    }

    #[test]
    fn test_verify_block() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        // Should verify successfully
        assert!(verify_block(data, &cid).is_ok());

        // Should fail with different data
        let result = verify_block(b"goodbye world", &cid);
        assert!(result.is_err());
        match result {
            Err(CidError::HashMismatch { .. }) => {}
            _ => panic!("Expected HashMismatch error"),
        }
    }

    #[test]
    fn test_parse_cid_roundtrip() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        // Convert to bytes and back
        let cid_bytes = cid.to_bytes();
        let parsed_cid = parse_cid(&cid_bytes).unwrap();

        assert_eq!(cid, parsed_cid);
    }

    #[test]
    fn test_parse_cid_str_roundtrip() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        let cid_str = cid.to_string();
        let parsed_cid = parse_cid_str(&cid_str).unwrap();

        assert_eq!(cid, parsed_cid);
    }

    #[test]
    fn test_parse_cid_rejects_garbage() {
        assert!(parse_cid(&[0xFF, 0x00, 0x01]).is_err());
        assert!(parse_cid_str("not a cid").is_err());
    }

    #[test]
    fn test_key_ordering_is_byte_order() {
        let a = block_cid(b"first").unwrap();
        let b = block_cid(b"second").unwrap();

        let by_bytes = a.to_bytes().cmp(&b.to_bytes());
        assert_ne!(by_bytes, std::cmp::Ordering::Equal);
    }
}
