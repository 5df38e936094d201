//! Content hashing: 256-bit digests (SHA-256, BLAKE3) computed by streaming
//! files through a bounded read buffer.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Digest used for content identity and copy verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// Default; matches `sha256sum` output
    #[default]
    Sha256,
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Case-insensitive. `None` for anything unsupported.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// Lowercase hex digest tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First `len` hex characters, used for hash-suffixed file names.
    pub fn short(&self, len: usize) -> &str {
        &self.hex[..len.min(self.hex.len())]
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Incremental digest over a byte stream.
pub trait ChecksumHasher: Send {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> ChecksumValue;
}

struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Checksum an in-memory buffer.
pub fn checksum_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> ChecksumValue {
    let mut hasher = create_hasher(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the checksum of a file's full content.
///
/// Reads in blocks of `chunk_size` bytes so memory use does not depend on the
/// file size. Any read failure (file removed, permissions changed, device
/// gone) is returned as `ReadError` for the caller to handle per file.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
) -> Result<ChecksumValue, EngineError> {
    let mut file = File::open(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut buffer = vec![0u8; chunk_size.max(4096)];
    let mut hasher = create_hasher(algorithm);

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Blake3.to_string(), "blake3");
    }

    #[test]
    fn test_algorithm_from_name() {
        assert_eq!(ChecksumAlgorithm::from_name("SHA256"), Some(ChecksumAlgorithm::Sha256));
        assert_eq!(ChecksumAlgorithm::from_name("blake3"), Some(ChecksumAlgorithm::Blake3));
        assert_eq!(ChecksumAlgorithm::from_name("md5"), None);
    }

    #[test]
    fn test_sha256_known_value() {
        let checksum = checksum_bytes(b"hello", ChecksumAlgorithm::Sha256);
        assert_eq!(checksum.algorithm(), ChecksumAlgorithm::Sha256);
        assert_eq!(
            checksum.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(checksum.short(12), "2cf24dba5fb0");
    }

    #[test]
    fn test_blake3_is_256_bit() {
        let checksum = checksum_bytes(b"hello", ChecksumAlgorithm::Blake3);
        assert_eq!(checksum.hex().len(), 64);
        assert_eq!(checksum, checksum_bytes(b"hello", ChecksumAlgorithm::Blake3));
    }

    #[test]
    fn test_values_key_by_algorithm_and_digest() {
        let mut seen = std::collections::HashSet::new();
        assert!(seen.insert(checksum_bytes(b"a", ChecksumAlgorithm::Sha256)));
        assert!(seen.insert(checksum_bytes(b"a", ChecksumAlgorithm::Blake3)));
        assert!(!seen.insert(checksum_bytes(b"a", ChecksumAlgorithm::Sha256)));

        // Same digest text under another algorithm is a different value.
        let sha = checksum_bytes(b"a", ChecksumAlgorithm::Sha256);
        assert!(seen.insert(ChecksumValue::new(ChecksumAlgorithm::Blake3, sha.hex().to_string())));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_file_checksum_independent_of_chunk_size() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.bin");

        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = File::create(&path).expect("Failed to create file");
        file.write_all(&content).expect("Failed to write file");
        drop(file);

        let small = compute_file_checksum(&path, ChecksumAlgorithm::Sha256, 4096)
            .expect("Failed to hash with small chunks");
        let large = compute_file_checksum(&path, ChecksumAlgorithm::Sha256, 1024 * 1024)
            .expect("Failed to hash with large chunks");

        assert_eq!(small, large);
        assert_eq!(small, checksum_bytes(&content, ChecksumAlgorithm::Sha256));
    }

    #[test]
    fn test_file_checksum_missing_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = compute_file_checksum(
            &temp_dir.path().join("missing.bin"),
            ChecksumAlgorithm::Sha256,
            4096,
        );
        assert!(matches!(result, Err(EngineError::ReadError { .. })));
    }
}
