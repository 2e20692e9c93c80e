//! SHA-256 digests of fetched files and buffers

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Files are hashed in fixed-size chunks so memory stays bounded
const CHUNK_SIZE: usize = 4096;

/// Compute the hex-encoded SHA-256 digest of a file
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex-encoded SHA-256 digest of a byte buffer
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare an expected digest against the computed one.
///
/// The comparison is an exact, case-sensitive string match: manifests publish
/// lowercase hex and anything else is treated as a mismatch.
pub fn ensure_equal(artifact: &str, expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(Error::HashMismatch {
            artifact: artifact.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_digest_bytes_known_vector() {
        assert_eq!(
            digest_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_file_matches_bytes_across_chunks() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        assert_eq!(digest_file(file.path()).unwrap(), digest_bytes(&data));
    }

    #[test]
    fn test_digest_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = digest_file(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_ensure_equal_reports_both_values() {
        assert!(ensure_equal("kernel", "abc123", "abc123").is_ok());

        match ensure_equal("kernel", "abc123", "def456") {
            Err(Error::HashMismatch { artifact, expected, actual }) => {
                assert_eq!(artifact, "kernel");
                assert_eq!(expected, "abc123");
                assert_eq!(actual, "def456");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_ensure_equal_is_case_sensitive() {
        assert!(ensure_equal("initrd", "ABC123", "abc123").is_err());
    }
}
