//! Content fingerprints used as duplicate-detection keys.
//!
//! A fingerprint is the SHA-256 digest of the exact bytes that end up on
//! disk. Input is always consumed in bounded chunks, so memory use depends
//! on the chunk size and never on the file size.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Chunk size used when hashing readers and files (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = FingerprintHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Lowercase hex encoding, 64 characters.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// First `len` hex characters, used to disambiguate file names.
    pub fn short_hex(&self, len: usize) -> String {
        let hex = self.to_hex();
        hex[..len.min(hex.len())].to_string()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid fingerprint: {0}")]
pub struct ParseFingerprintError(String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ParseFingerprintError(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str =
                std::str::from_utf8(chunk).map_err(|e| ParseFingerprintError(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| ParseFingerprintError(e.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short_hex(16))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 hasher.
#[derive(Clone, Default)]
pub struct FingerprintHasher(Sha256);

impl FingerprintHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

/// Hash an async reader in chunks of `chunk_size` bytes.
///
/// Read errors are returned as-is; nothing is retried.
pub async fn fingerprint_reader<R>(reader: &mut R, chunk_size: usize) -> std::io::Result<Fingerprint>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = FingerprintHasher::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Blocking variant used when rebuilding the index from files on disk.
pub fn fingerprint_file_blocking(path: &Path, chunk_size: usize) -> std::io::Result<Fingerprint> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = FingerprintHasher::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    fn sample_data() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_fingerprint_is_deterministic() {
        let data = sample_data();
        let first = fingerprint_reader(&mut Cursor::new(data.clone()), DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();
        let second = fingerprint_reader(&mut Cursor::new(data), DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_fingerprint_ignores_chunk_size() {
        let data = sample_data();
        let expected = Fingerprint::of(&data);
        for chunk_size in [1, 7, 4096, DEFAULT_CHUNK_SIZE, 1 << 20] {
            let got = fingerprint_reader(&mut Cursor::new(data.clone()), chunk_size)
                .await
                .unwrap();
            assert_eq!(got, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            Fingerprint::of(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hex_parse() {
        let fp = Fingerprint::of(b"hello");
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(parsed, fp);
        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
        assert_eq!(fp.short_hex(12).len(), 12);
    }

    #[test]
    fn test_file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        let data = sample_data();
        std::fs::write(&path, &data).unwrap();

        let from_file = fingerprint_file_blocking(&path, 1000).unwrap();
        assert_eq!(from_file, Fingerprint::of(&data));
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.served {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer went away",
                )));
            }
            self.served = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let mut reader = FailingReader { served: false };
        let err = fingerprint_reader(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
