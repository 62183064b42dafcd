//! `Target` over one repository of an OCI distribution registry.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{ACCEPT, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, Method, Response, StatusCode, Url};
use tokio_util::io::StreamReader;

use kitops_core::config::NetworkOptions;
use kitops_core::error::{KitError, Result};

use super::auth::{AuthClient, AuthProvider};
use super::errors::response_error;
use crate::oci::{
    fetch_all, is_digest, read_to_vec, sha256_digest, BlobReader, Descriptor, FetchedBlob,
    Reference, Target, MANIFEST_MEDIA_TYPE,
};

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Build the HTTP client shared by every repository of a session.
pub fn build_http_client(network: &NetworkOptions) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(network.user_agent.clone())
        .connect_timeout(network.metadata_timeout())
        .danger_accept_invalid_certs(!network.tls_verify);
    if let Some(proxy) = network.proxy.as_deref().filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| KitError::ConfigError(format!("invalid proxy {}: {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| KitError::Http(format!("failed to create HTTP client: {}", e)))
}

/// One `registry/repository` on a remote registry.
pub struct RemoteRepository {
    pub(super) client: Arc<AuthClient>,
    pub(super) registry: String,
    repository: String,
    scheme: &'static str,
    pub(super) network: NetworkOptions,
}

impl RemoteRepository {
    pub fn new(
        reference: &Reference,
        network: &NetworkOptions,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self> {
        let client = AuthClient::new(build_http_client(network)?, auth);
        Ok(Self::with_client(reference, network, Arc::new(client)))
    }

    /// Share an existing client (and its credential cache).
    pub fn with_client(
        reference: &Reference,
        network: &NetworkOptions,
        client: Arc<AuthClient>,
    ) -> Self {
        Self {
            client,
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            scheme: if network.plain_http { "http" } else { "https" },
            network: network.clone(),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// `<scheme>://<registry>/v2/<repository>/<path>`
    pub(super) fn url(&self, path: &str) -> Result<Url> {
        let raw = format!(
            "{}://{}/v2/{}/{}",
            self.scheme, self.registry, self.repository, path
        );
        Url::parse(&raw).map_err(|e| KitError::InvalidRegistry(format!("{}: {}", raw, e)))
    }

    fn object_url(&self, desc: &Descriptor) -> Result<Url> {
        if desc.is_manifest() {
            self.url(&format!("manifests/{}", desc.digest))
        } else {
            self.url(&format!("blobs/{}", desc.digest))
        }
    }

    async fn send_manifest_request(&self, method: Method, reference: &str) -> Result<Response> {
        let url = self.url(&format!("manifests/{}", reference))?;
        let authed = self
            .client
            .send(&self.registry, |c| {
                c.request(method.clone(), url.clone())
                    .header(ACCEPT, MANIFEST_MEDIA_TYPE)
                    .timeout(self.network.metadata_timeout())
            })
            .await?;
        Ok(authed.response)
    }

    async fn put_manifest(&self, reference: &str, media_type: &str, data: Vec<u8>) -> Result<()> {
        let url = self.url(&format!("manifests/{}", reference))?;
        let authed = self
            .client
            .send(&self.registry, |c| {
                c.put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(data.clone())
                    .timeout(self.network.metadata_timeout())
            })
            .await?;
        let response = authed.response;
        if !response.status().is_success() {
            return Err(response_error("PUT", response).await);
        }
        Ok(())
    }

    async fn get(&self, desc: &Descriptor, offset: u64) -> Result<Response> {
        let url = self.object_url(desc)?;
        let timeout = if desc.is_manifest() {
            self.network.metadata_timeout()
        } else {
            self.network.transfer_timeout()
        };
        let authed = self
            .client
            .send(&self.registry, |c| {
                let mut request = c
                    .get(url.clone())
                    .header(ACCEPT, MANIFEST_MEDIA_TYPE)
                    .timeout(timeout);
                if offset > 0 {
                    request = request.header(RANGE, format!("bytes={}-", offset));
                }
                request
            })
            .await?;
        let response = authed.response;
        if !response.status().is_success() {
            return Err(response_error("GET", response).await);
        }
        Ok(response)
    }
}

fn header_str<'a>(response: &'a Response, name: impl reqwest::header::AsHeaderName) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn body_reader(response: Response) -> BlobReader {
    let stream = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    Box::new(StreamReader::new(Box::pin(stream)))
}

fn media_type_of(response: &Response) -> String {
    header_str(response, CONTENT_TYPE)
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
        .filter(|ct| !ct.is_empty())
        .unwrap_or_else(|| MANIFEST_MEDIA_TYPE.to_string())
}

#[async_trait]
impl Target for RemoteRepository {
    fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        if reference.is_empty() {
            return Err(KitError::InvalidTag("missing reference".to_string()));
        }
        let response = self.send_manifest_request(Method::HEAD, reference).await?;
        if !response.status().is_success() {
            return Err(response_error("HEAD", response).await);
        }
        let media_type = media_type_of(&response);
        let digest = header_str(&response, DIGEST_HEADER).map(str::to_string);
        let size = header_str(&response, CONTENT_LENGTH).and_then(|s| s.parse::<u64>().ok());

        let desc = match (digest, size) {
            (Some(digest), Some(size)) if is_digest(&digest) => {
                Descriptor::new(media_type, digest, size)
            }
            _ => {
                // Registry did not describe the manifest; download and hash it.
                let response = self.send_manifest_request(Method::GET, reference).await?;
                if !response.status().is_success() {
                    return Err(response_error("GET", response).await);
                }
                let media_type = media_type_of(&response);
                let data = response.bytes().await?;
                Descriptor::new(media_type, sha256_digest(&data), data.len() as u64)
            }
        };
        if is_digest(reference) && desc.digest != reference {
            return Err(KitError::DigestMismatch {
                expected: reference.to_string(),
                actual: desc.digest,
            });
        }
        tracing::debug!(
            repository = %self.name(),
            reference = %reference,
            digest = %desc.digest,
            "Resolved remote manifest"
        );
        Ok(desc)
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        let url = self.object_url(desc)?;
        let authed = self
            .client
            .send(&self.registry, |c| {
                c.head(url.clone())
                    .header(ACCEPT, MANIFEST_MEDIA_TYPE)
                    .timeout(self.network.metadata_timeout())
            })
            .await?;
        match authed.response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(response_error("HEAD", authed.response).await),
        }
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader> {
        Ok(body_reader(self.get(desc, 0).await?))
    }

    /// `206 Partial Content` marks the stream resumable at `offset`; a full
    /// `200` response restarts from zero.
    async fn fetch_from(&self, desc: &Descriptor, offset: u64) -> Result<FetchedBlob> {
        let offset = if desc.is_manifest() { 0 } else { offset };
        let response = self.get(desc, offset).await?;
        let (offset, resumable) = if response.status() == StatusCode::PARTIAL_CONTENT {
            (offset, true)
        } else {
            let ranges = header_str(&response, ACCEPT_RANGES).is_some_and(|v| v.contains("bytes"));
            (0, ranges)
        };
        Ok(FetchedBlob {
            reader: body_reader(response),
            offset,
            resumable,
        })
    }

    async fn push(&self, desc: &Descriptor, content: BlobReader) -> Result<()> {
        if desc.is_manifest() {
            let data = read_to_vec(content, desc.size).await?;
            let actual = sha256_digest(&data);
            if actual != desc.digest {
                return Err(KitError::DigestMismatch {
                    expected: desc.digest.clone(),
                    actual,
                });
            }
            return self.put_manifest(&desc.digest, &desc.media_type, data).await;
        }
        self.upload_blob(desc, content).await
    }

    /// Re-PUT the manifest bytes under `reference`.
    async fn tag(&self, desc: &Descriptor, reference: &str) -> Result<()> {
        let data = fetch_all(self, desc).await?;
        self.put_manifest(reference, &desc.media_type, data).await
    }

    async fn untag(&self, _reference: &str) -> Result<()> {
        Err(KitError::Unsupported(
            "removing a tag from a remote registry".to_string(),
        ))
    }

    async fn delete(&self, desc: &Descriptor) -> Result<()> {
        let url = self.object_url(desc)?;
        let authed = self
            .client
            .send(&self.registry, |c| {
                c.delete(url.clone())
                    .timeout(self.network.metadata_timeout())
            })
            .await?;
        if !authed.response.status().is_success() {
            return Err(response_error("DELETE", authed.response).await);
        }
        Ok(())
    }
}
