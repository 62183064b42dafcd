//! Digest computation and verification.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::{AsyncRead, ReadBuf};

use kitops_core::error::{KitError, Result};

use super::reference::is_digest;

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Split a digest into `(algorithm, hex)`.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    if !is_digest(digest) {
        return Err(KitError::InvalidDigest(digest.to_string()));
    }
    digest
        .split_once(':')
        .ok_or_else(|| KitError::InvalidDigest(digest.to_string()))
}

/// Incremental hasher for any supported digest algorithm.
#[derive(Clone)]
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn sha256() -> Self {
        Hasher::Sha256(Sha256::new())
    }

    /// Hasher using the algorithm of `digest`.
    pub fn for_digest(digest: &str) -> Result<Self> {
        match split_digest(digest)?.0 {
            "sha256" => Ok(Hasher::Sha256(Sha256::new())),
            "sha512" => Ok(Hasher::Sha512(Sha512::new())),
            other => Err(KitError::InvalidDigest(format!(
                "unsupported digest algorithm {}",
                other
            ))),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> String {
        match self {
            Hasher::Sha256(h) => format!("sha256:{}", hex::encode(h.finalize())),
            Hasher::Sha512(h) => format!("sha512:{}", hex::encode(h.finalize())),
        }
    }
}

/// Hashes bytes as they stream past and checks them against an expected
/// digest and size.
pub struct DigestVerifier {
    expected: String,
    expected_size: u64,
    hasher: Hasher,
    bytes: u64,
}

impl DigestVerifier {
    pub fn new(expected: &str, expected_size: u64) -> Result<Self> {
        Ok(Self {
            expected: expected.to_string(),
            expected_size,
            hasher: Hasher::for_digest(expected)?,
            bytes: 0,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        self.hasher.update(data);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn verify(self) -> Result<()> {
        if self.bytes != self.expected_size {
            return Err(KitError::DigestMismatch {
                expected: format!("{} ({} bytes)", self.expected, self.expected_size),
                actual: format!("{} bytes", self.bytes),
            });
        }
        let actual = self.hasher.finalize();
        if actual != self.expected {
            return Err(KitError::DigestMismatch {
                expected: self.expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Write adapter that feeds every byte to a SHA-256 hasher on its way to
/// the inner writer.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Return the inner writer, the digest and the number of bytes written.
    pub fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Async reader that verifies digest and size when the inner reader hits EOF.
/// A mismatch surfaces as an `InvalidData` I/O error on the final read.
pub struct VerifyingReader<R> {
    inner: R,
    verifier: Option<DigestVerifier>,
}

impl<R> VerifyingReader<R> {
    pub fn new(inner: R, digest: &str, size: u64) -> Result<Self> {
        Ok(Self {
            inner,
            verifier: Some(DigestVerifier::new(digest, size)?),
        })
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let new = &buf.filled()[before..];

        if !new.is_empty() {
            if let Some(v) = this.verifier.as_mut() {
                v.update(new);
            }
        } else if buf.remaining() > 0 {
            if let Some(v) = this.verifier.take() {
                v.verify()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            }
        }
        Poll::Ready(Ok(()))
    }
}
