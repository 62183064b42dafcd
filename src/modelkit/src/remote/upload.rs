//! Blob uploads: one monolithic `PUT`, or a sequence of `PATCH` chunks
//! closed by an empty `PUT`.

use std::io;
use std::sync::OnceLock;

use bytes::Bytes;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Body, StatusCode, Url};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;

use kitops_core::error::{KitError, Result};

use super::errors::response_error;
use super::RemoteRepository;
use crate::oci::{BlobReader, Descriptor};

const OCTET_STREAM: &str = "application/octet-stream";
const READ_BUFFER_SIZE: u64 = 64 << 10;

/// How a blob is sent to a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Monolithic,
    Chunked,
}

fn google_registry_regexes() -> &'static [Regex; 2] {
    static RE: OnceLock<[Regex; 2]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r".*\.pkg\.dev$").expect("artifact registry regex is valid"),
            Regex::new(r".*\.?gcr\.io$").expect("container registry regex is valid"),
        ]
    })
}

/// Pick the upload format for a blob of `size` bytes sent to `host`.
///
/// ghcr.io rejects `PATCH` bodies over 4 MiB and Google registries do not
/// implement chunked uploads, so both always get a single `PUT`.
pub fn get_upload_format(host: &str, size: u64, chunk_size: u64) -> UploadFormat {
    if host == "ghcr.io" || google_registry_regexes().iter().any(|re| re.is_match(host)) {
        return UploadFormat::Monolithic;
    }
    if size < chunk_size {
        UploadFormat::Monolithic
    } else {
        UploadFormat::Chunked
    }
}

/// Inclusive byte ranges of each chunk.
pub fn chunk_ranges(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + chunk_size).min(size) - 1;
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Auth cache key for an upload location. Registries addressed as
/// `host:443` sometimes answer with a port-less `Location`; the explicit
/// port is kept so cached credentials still apply.
pub(crate) fn location_host(registry: &str, location: &Url) -> String {
    let host = location.host_str().unwrap_or_default();
    match location.port() {
        Some(port) => format!("{}:{}", host, port),
        None => match registry.rsplit_once(':') {
            Some((origin, "443")) if origin == host => format!("{}:443", host),
            _ => host.to_string(),
        },
    }
}

impl RemoteRepository {
    /// Upload a non-manifest blob.
    pub(super) async fn upload_blob(&self, desc: &Descriptor, content: BlobReader) -> Result<()> {
        let (location, authorization) = self.initiate_upload().await?;
        let host = location.host_str().unwrap_or_default().to_string();
        let format = get_upload_format(&host, desc.size, self.network.chunk_size);
        tracing::debug!(
            digest = %desc.digest,
            size = desc.size,
            host = %host,
            format = ?format,
            "Uploading blob"
        );
        match format {
            UploadFormat::Monolithic => {
                self.upload_monolithic(location, authorization, desc, content)
                    .await
            }
            UploadFormat::Chunked => {
                self.upload_chunked(location, authorization, desc, content)
                    .await
            }
        }
    }

    /// `POST /v2/<name>/blobs/uploads/`. Returns the upload location and
    /// the `Authorization` header to reuse for the rest of the upload.
    async fn initiate_upload(&self) -> Result<(Url, Option<String>)> {
        let url = self.url("blobs/uploads/")?;
        let authed = self
            .client
            .send(&self.registry, |c| {
                c.post(url.clone())
                    .header(CONTENT_LENGTH, 0)
                    .timeout(self.network.metadata_timeout())
            })
            .await?;
        let response = authed.response;
        if response.status() != StatusCode::ACCEPTED {
            return Err(response_error("POST", response).await);
        }
        let location = next_location(&response)?;
        let host = location_host(&self.registry, &location);
        tracing::debug!(host = %host, path = %location.path(), "Using upload location");
        let authorization = authed
            .authorization
            .or_else(|| self.client.cached(&host));
        Ok((location, authorization))
    }

    async fn upload_monolithic(
        &self,
        mut location: Url,
        authorization: Option<String>,
        desc: &Descriptor,
        content: BlobReader,
    ) -> Result<()> {
        location
            .query_pairs_mut()
            .append_pair("digest", &desc.digest);
        let mut request = self
            .client
            .http()
            .put(location)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(CONTENT_LENGTH, desc.size)
            .timeout(self.network.transfer_timeout())
            .body(Body::wrap_stream(ReaderStream::new(content)));
        if let Some(value) = &authorization {
            request = request.header(AUTHORIZATION, value);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::CREATED {
            return Err(response_error("PUT", response).await);
        }
        Ok(())
    }

    async fn upload_chunked(
        &self,
        location: Url,
        authorization: Option<String>,
        desc: &Descriptor,
        content: BlobReader,
    ) -> Result<()> {
        let ranges = chunk_ranges(desc.size, self.network.chunk_size);
        let total = ranges.len();
        let mut next = location;
        let mut reader = content;

        for (i, (start, end)) in ranges.into_iter().enumerate() {
            tracing::debug!(chunk = i + 1, total, start, end, "Uploading chunk");
            let len = end - start + 1;
            let (body, returned) = chunk_body(reader, len);
            let mut request = self
                .client
                .http()
                .patch(next.clone())
                .header("Content-Range", format!("{}-{}", start, end))
                .header(CONTENT_TYPE, OCTET_STREAM)
                .header(CONTENT_LENGTH, len)
                .timeout(self.network.transfer_timeout())
                .body(body);
            if let Some(value) = &authorization {
                request = request.header(AUTHORIZATION, value);
            }
            let response = request.send().await?;
            if response.status() != StatusCode::ACCEPTED {
                return Err(response_error("PATCH", response).await);
            }
            next = next_location(&response)?;
            check_range(&response, end)?;
            reader = returned.await.map_err(|_| {
                KitError::Other("upload stream was not fully consumed".to_string())
            })?;
        }

        next.query_pairs_mut().append_pair("digest", &desc.digest);
        let mut request = self
            .client
            .http()
            .put(next)
            .header(CONTENT_LENGTH, 0)
            .timeout(self.network.metadata_timeout());
        if let Some(value) = &authorization {
            request = request.header(AUTHORIZATION, value);
        }
        tracing::debug!(digest = %desc.digest, "Finalizing upload");
        let response = request.send().await?;
        if response.status() != StatusCode::CREATED {
            return Err(response_error("PUT", response).await);
        }
        Ok(())
    }
}

fn next_location(response: &reqwest::Response) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            KitError::Http(format!(
                "registry did not return an upload location for {}",
                response.url()
            ))
        })?;
    response
        .url()
        .join(location)
        .map_err(|e| KitError::Http(format!("invalid upload location {}: {}", location, e)))
}

/// The registry must acknowledge `0-<end>` after each chunk.
fn check_range(response: &reqwest::Response, end: u64) -> Result<()> {
    let expected = format!("0-{}", end);
    let actual = response
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let acknowledged = actual
        .trim_start_matches("bytes=")
        .split_once('-')
        .filter(|(start, _)| *start == "0")
        .and_then(|(_, e)| e.parse::<u64>().ok());
    if acknowledged != Some(end) {
        return Err(KitError::UploadRangeMismatch {
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Stream exactly `len` bytes of `reader` as a request body. The reader is
/// handed back through the receiver once the last byte has been read.
fn chunk_body(reader: BlobReader, len: u64) -> (Body, oneshot::Receiver<BlobReader>) {
    let (stream, rx) = chunk_stream(reader, len);
    (Body::wrap_stream(stream), rx)
}

fn chunk_stream(
    reader: BlobReader,
    len: u64,
) -> (
    impl futures::Stream<Item = io::Result<Bytes>> + Send + 'static,
    oneshot::Receiver<BlobReader>,
) {
    let (tx, rx) = oneshot::channel();
    let stream = futures::stream::unfold(
        (Some(reader), len, Some(tx)),
        |(reader, remaining, tx)| async move {
            let mut reader = reader?;
            if remaining == 0 {
                if let Some(tx) = tx {
                    let _ = tx.send(reader);
                }
                return None;
            }
            let mut buf = vec![0u8; remaining.min(READ_BUFFER_SIZE) as usize];
            match reader.read(&mut buf).await {
                Ok(0) => Some((
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "blob ended before its declared size",
                    )),
                    (None, 0, None),
                )),
                Ok(n) => {
                    buf.truncate(n);
                    let remaining = remaining - n as u64;
                    if remaining == 0 {
                        // The HTTP client stops polling once Content-Length
                        // bytes are written.
                        if let Some(tx) = tx {
                            let _ = tx.send(reader);
                        }
                        Some((Ok(Bytes::from(buf)), (None, 0, None)))
                    } else {
                        Some((Ok(Bytes::from(buf)), (Some(reader), remaining, tx)))
                    }
                }
                Err(e) => Some((Err(e), (None, 0, None))),
            }
        },
    );
    (stream, rx)
}
