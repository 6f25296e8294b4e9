use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes folded into the digest per read.
pub const HASH_CHUNK_SIZE: usize = 8192;

/// Length of a hex-encoded SHA-256 digest.
pub const HEX_DIGEST_LEN: usize = 64;

/// Stream `reader` through SHA-256 in bounded chunks and return the lowercase
/// hex digest. Any read error aborts without a digest.
pub async fn hash_reader<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 of a file on disk.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    hash_reader(&mut file).await
}

/// True if `s` looks like a hex SHA-256 digest.
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == HEX_DIGEST_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[tokio::test]
    async fn test_empty_input() {
        let mut src: &[u8] = b"";
        let digest = hash_reader(&mut src).await.unwrap();
        assert_eq!(digest, EMPTY_SHA256);
        assert!(is_hex_digest(&digest));
    }

    #[tokio::test]
    async fn test_multi_chunk_matches_one_shot() {
        let data: Vec<u8> = (0..HASH_CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let mut src: &[u8] = &data;
        let streamed = hash_reader(&mut src).await.unwrap();
        let one_shot = hex::encode(Sha256::digest(&data));
        assert_eq!(streamed, one_shot);
    }

    #[tokio::test]
    async fn test_hash_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_file(&dir.path().join("nope")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_is_hex_digest() {
        assert!(is_hex_digest(EMPTY_SHA256));
        assert!(!is_hex_digest("abc123"));
        assert!(!is_hex_digest(&"g".repeat(HEX_DIGEST_LEN)));
    }
}
