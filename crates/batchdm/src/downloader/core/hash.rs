//! Streaming hash verification
//!
//! Bytes are fed to a [`HashVerifier`] as they arrive from the network, so a
//! file is never read back or buffered whole just to check its digest. When a
//! transfer resumes, the verifier is primed from the partial file on disk first.

use base64::Engine;
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use super::error::{DownloadError, FileOperation, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Digest algorithms a task can be verified with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
    Sha512,
    #[serde(alias = "xxh64")]
    XxHash64,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::XxHash64 => "xxhash64",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "xxhash64" | "xxh64" => Ok(HashAlgorithm::XxHash64),
            other => Err(DownloadError::Configuration {
                message: format!("unknown hash algorithm '{}'", other),
                field: Some("hash_algorithm".to_string()),
                suggestion: Some("Use one of md5, sha1, sha256, sha512, xxhash64".to_string()),
            }),
        }
    }
}

enum HasherState {
    Md5(Md5Context),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    XxHash64(Xxh64),
}

/// Incremental hasher for one algorithm
pub struct HashVerifier {
    algorithm: HashAlgorithm,
    state: HasherState,
    bytes_hashed: u64,
}

impl fmt::Debug for HashVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashVerifier")
            .field("algorithm", &self.algorithm)
            .field("bytes_hashed", &self.bytes_hashed)
            .finish()
    }
}

impl HashVerifier {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5Context::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
            HashAlgorithm::XxHash64 => HasherState::XxHash64(Xxh64::new(0)),
        };
        Self {
            algorithm,
            state,
            bytes_hashed: 0,
        }
    }

    /// Build a verifier that has already consumed the first `len` bytes of `path`
    ///
    /// Used when resuming from a partial file. Fails if the file is shorter than `len`.
    pub async fn primed_from_file(algorithm: HashAlgorithm, path: &Path, len: u64) -> Result<Self> {
        let mut verifier = Self::new(algorithm);
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| DownloadError::fs(path, FileOperation::Read, e))?;
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        while verifier.bytes_hashed < len {
            let want = (len - verifier.bytes_hashed).min(READ_BUFFER_SIZE as u64) as usize;
            let read = file
                .read(&mut buffer[..want])
                .await
                .map_err(|e| DownloadError::fs(path, FileOperation::Read, e))?;
            if read == 0 {
                return Err(DownloadError::fs(
                    path,
                    FileOperation::Read,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("partial file ended at {} of {} bytes", verifier.bytes_hashed, len),
                    ),
                ));
            }
            verifier.update(&buffer[..read]);
        }

        debug!("Primed {} verifier with {} bytes from {}", algorithm, len, path.display());
        Ok(verifier)
    }

    /// Hash a whole file
    pub async fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<ComputedDigest> {
        let len = fs::metadata(path)
            .await
            .map_err(|e| DownloadError::fs(path, FileOperation::Metadata, e))?
            .len();
        Ok(Self::primed_from_file(algorithm, path, len).await?.finalize())
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(ctx) => ctx.consume(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
            HasherState::XxHash64(h) => h.update(data),
        }
        self.bytes_hashed += data.len() as u64;
    }

    pub fn finalize(self) -> ComputedDigest {
        let (hex, raw) = match self.state {
            HasherState::Md5(ctx) => {
                let digest = ctx.compute();
                (hex::encode(digest.0), digest.0.to_vec())
            }
            HasherState::Sha1(h) => {
                let digest = h.finalize();
                (hex::encode(digest), digest.to_vec())
            }
            HasherState::Sha256(h) => {
                let digest = h.finalize();
                (hex::encode(digest), digest.to_vec())
            }
            HasherState::Sha512(h) => {
                let digest = h.finalize();
                (hex::encode(digest), digest.to_vec())
            }
            HasherState::XxHash64(h) => {
                let value = h.digest();
                // base64 form uses little-endian bytes, hex form the numeric value
                (format!("{:016x}", value), value.to_le_bytes().to_vec())
            }
        };

        ComputedDigest {
            algorithm: self.algorithm,
            hex,
            raw,
        }
    }
}

/// Finalized digest of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedDigest {
    pub algorithm: HashAlgorithm,
    /// Lowercase hex
    pub hex: String,
    raw: Vec<u8>,
}

impl ComputedDigest {
    /// Standard base64 of the digest bytes
    pub fn base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.raw)
    }

    /// Compare against an expected digest given as hex (any case) or base64
    pub fn matches(&self, expected: &str) -> bool {
        let expected = expected.trim();
        expected.eq_ignore_ascii_case(&self.hex) || expected == self.base64()
    }
}

impl fmt::Display for ComputedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}
