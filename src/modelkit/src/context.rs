//! Explicit handles shared by every ModelKit operation.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use kitops_core::config::{KitConfig, NetworkOptions};
use kitops_core::error::{KitError, Result};
use kitops_core::progress::{Clock, NoProgress, ProgressSink, SystemClock};

use crate::cache::CacheDir;
use crate::copy::CopyOptions;
use crate::kitfile::{Kitfile, KitfileSource};
use crate::layer::LayerBuilder;
use crate::local::LocalRepository;
use crate::oci::{
    get_manifest_and_config, Descriptor, Manifest, Reference, Target, DEFAULT_REGISTRY,
};
use crate::remote::{build_http_client, AnonymousAuth, AuthClient, AuthProvider, RemoteRepository};

/// Storage location, network settings, credentials, progress reporting and
/// cancellation for one session. Cheap to share by reference.
pub struct KitContext {
    pub storage: PathBuf,
    pub cache: CacheDir,
    pub network: NetworkOptions,
    pub auth: Arc<dyn AuthProvider>,
    pub progress: Arc<dyn ProgressSink>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
    client: Mutex<Option<Arc<AuthClient>>>,
}

impl KitContext {
    pub fn new(config: &KitConfig) -> Self {
        Self {
            storage: config.storage_path(),
            cache: CacheDir::new(config.cache_path()),
            network: config.network.clone(),
            auth: Arc::new(AnonymousAuth),
            progress: Arc::new(NoProgress),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            client: Mutex::new(None),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        *self.client.get_mut() = None;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_network(mut self, network: NetworkOptions) -> Self {
        self.network = network;
        *self.client.get_mut() = None;
        self
    }

    /// Local repository for `reference`, reporting progress through this
    /// context.
    pub fn local_repository(&self, reference: &Reference) -> Result<LocalRepository> {
        Ok(LocalRepository::open(&self.storage, reference)?
            .with_progress(self.progress.clone(), self.clock.clone()))
    }

    /// Remote repository for `reference`. Every remote repository of a
    /// context shares one HTTP client and credential cache.
    pub fn remote_repository(&self, reference: &Reference) -> Result<RemoteRepository> {
        let client = {
            let mut slot = self.client.lock();
            match slot.as_ref() {
                Some(client) => client.clone(),
                None => {
                    let client = Arc::new(AuthClient::new(
                        build_http_client(&self.network)?,
                        self.auth.clone(),
                    ));
                    *slot = Some(client.clone());
                    client
                }
            }
        };
        Ok(RemoteRepository::with_client(reference, &self.network, client))
    }

    pub fn copy_options(&self) -> CopyOptions {
        CopyOptions::new(self.network.concurrency, self.cancel.clone())
    }

    pub fn layer_builder(&self) -> LayerBuilder {
        LayerBuilder::new(self.cache.clone())
            .with_progress(self.progress.clone(), self.clock.clone())
            .with_cancel(self.cancel.clone())
    }

    pub(crate) fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(KitError::Canceled);
        }
        Ok(())
    }

    /// Find where `reference` lives: local storage when it resolves there,
    /// otherwise its registry. `localhost` references are never looked up
    /// remotely.
    pub async fn find_target(&self, reference: &Reference) -> Result<(Box<dyn Target>, Descriptor)> {
        if reference.reference.is_empty() {
            return Err(KitError::InvalidTag(format!(
                "reference {} has no tag or digest",
                reference
            )));
        }
        let local = self.local_repository(reference)?;
        match local.resolve(&reference.reference).await {
            Ok(desc) => return Ok((Box::new(local), desc)),
            Err(e) if e.is_not_found() && reference.registry != DEFAULT_REGISTRY => {
                tracing::debug!(
                    reference = %reference,
                    "ModelKit not found locally, checking remote"
                );
            }
            Err(e) => return Err(e),
        }
        let remote = self.remote_repository(reference)?;
        let desc = remote.resolve(&reference.reference).await?;
        Ok((Box::new(remote), desc))
    }

    /// Manifest and Kitfile of `reference`, wherever it lives.
    pub async fn get_manifest_and_config(
        &self,
        reference: &Reference,
    ) -> Result<(Descriptor, Manifest, Kitfile)> {
        let (target, desc) = self.find_target(reference).await?;
        let (manifest, kitfile) = get_manifest_and_config(target.as_ref(), &desc).await?;
        Ok((desc, manifest, kitfile))
    }
}

#[async_trait]
impl KitfileSource for KitContext {
    async fn get_kitfile(&self, reference: &str) -> Result<Kitfile> {
        let reference = Reference::parse_single(reference)?;
        let (_, _, kitfile) = self.get_manifest_and_config(&reference).await?;
        Ok(kitfile)
    }
}
