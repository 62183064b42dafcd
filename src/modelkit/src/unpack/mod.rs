//! Extracting ModelKit layers into a directory.
//!
//! Layers pair with Kitfile sections by position: the n-th dataset layer in
//! the manifest belongs to the n-th `datasets` entry, and so on. Each layer's
//! entries are written under the parent of the section's declared path.

mod filter;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use kitops_core::config::{DEFAULT_KITFILE_NAMES, MAX_MODEL_REF_CHAIN};
use kitops_core::error::{KitError, Result};
use kitops_core::progress::ProgressTracker;

use crate::context::KitContext;
use crate::kitfile::{format_chain, verify_subpath, Kitfile};
use crate::layer::{decompress, TrackedReader};
use crate::oci::{
    get_manifest_and_config, BaseType, Compression, Descriptor, Manifest, MediaType, Reference,
    Target, VerifyingReader,
};

pub use filter::{should_unpack, Section, UnpackFilter};

/// What to do when an unpacked file already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverwritePolicy {
    #[default]
    Never,
    Force,
    /// Ask through [`UnpackOptions::confirm`]; without a callback this is
    /// `Never`.
    Prompt,
}

/// Asked once per existing path under [`OverwritePolicy::Prompt`].
pub type ConfirmOverwrite = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct UnpackOptions {
    pub reference: Reference,
    pub output_dir: PathBuf,
    pub filters: Vec<UnpackFilter>,
    pub overwrite: OverwritePolicy,
    /// Unpack the model of a referenced parent ModelKit first
    pub include_parents: bool,
    pub confirm: Option<ConfirmOverwrite>,
}

impl UnpackOptions {
    pub fn new(reference: Reference, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            reference,
            output_dir: output_dir.into(),
            filters: Vec::new(),
            overwrite: OverwritePolicy::Never,
            include_parents: false,
            confirm: None,
        }
    }

    pub fn with_filters(mut self, filters: Vec<UnpackFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_overwrite(mut self, overwrite: OverwritePolicy) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_parents(mut self, include_parents: bool) -> Self {
        self.include_parents = include_parents;
        self
    }

    pub fn with_confirm(mut self, confirm: ConfirmOverwrite) -> Self {
        self.confirm = Some(confirm);
        self
    }
}

/// Counts for a finished unpack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Manifest of the requested ModelKit
    pub digest: String,
    pub layers: usize,
    pub files: usize,
}

#[derive(Clone)]
struct Overwrite {
    policy: OverwritePolicy,
    confirm: Option<ConfirmOverwrite>,
}

impl Overwrite {
    fn allows(&self, path: &Path) -> bool {
        match self.policy {
            OverwritePolicy::Never => false,
            OverwritePolicy::Force => true,
            OverwritePolicy::Prompt => self.confirm.as_ref().is_some_and(|confirm| confirm(path)),
        }
    }

    /// Fail if `path` exists and may not be replaced by a regular file.
    fn check_file(&self, path: &Path) -> Result<()> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !self.allows(path) {
            return Err(KitError::AlreadyExists(path.display().to_string()));
        }
        if !meta.is_file() {
            return Err(KitError::AlreadyExists(format!(
                "{} (exists and is not a regular file)",
                path.display()
            )));
        }
        Ok(())
    }
}

/// One ModelKit to extract, with the filters that apply to it.
struct UnpackUnit {
    target: Box<dyn Target>,
    manifest: Manifest,
    kitfile: Kitfile,
    filters: Vec<UnpackFilter>,
}

/// Unpack `opts.reference` from local storage, or from its registry when it
/// is not stored locally.
pub async fn unpack(ctx: &KitContext, opts: &UnpackOptions) -> Result<UnpackSummary> {
    std::fs::create_dir_all(&opts.output_dir).map_err(|e| {
        KitError::Other(format!(
            "failed to create directory {}: {}",
            opts.output_dir.display(),
            e
        ))
    })?;
    let output_dir = opts.output_dir.canonicalize()?;

    let (target, desc) = ctx.find_target(&opts.reference).await?;
    let (manifest, kitfile) = get_manifest_and_config(target.as_ref(), &desc).await?;
    let parent = kitfile.parent_reference().map(str::to_string);
    let mut units = vec![UnpackUnit {
        target,
        manifest,
        kitfile,
        filters: opts.filters.clone(),
    }];

    if let Some(parent) = parent {
        if opts.include_parents {
            collect_parents(ctx, &opts.reference, &parent, &mut units).await?;
        } else {
            let child = &units[0];
            let wants_model = child
                .kitfile
                .model
                .as_ref()
                .is_some_and(|m| should_unpack(Section::Model(m), &child.filters));
            if wants_model || should_unpack(Section::Kitfile, &child.filters) {
                return Err(KitError::CannotUnpackModelKitReference(parent));
            }
        }
    }

    let overwrite = Overwrite {
        policy: opts.overwrite,
        confirm: opts.confirm.clone(),
    };
    let mut summary = UnpackSummary {
        digest: desc.digest,
        ..Default::default()
    };
    // Deepest parent first.
    for unit in units.iter().rev() {
        unpack_unit(ctx, unit, &output_dir, &overwrite, &mut summary).await?;
    }
    tracing::info!(
        reference = %opts.reference.format_for_display(),
        dir = %output_dir.display(),
        layers = summary.layers,
        files = summary.files,
        "Unpacked ModelKit"
    );
    Ok(summary)
}

/// Walk the `model.path` chain above `root`, appending each parent with a
/// model-only filter.
async fn collect_parents(
    ctx: &KitContext,
    root: &Reference,
    first_parent: &str,
    units: &mut Vec<UnpackUnit>,
) -> Result<()> {
    let mut visited = vec![root.to_string()];
    let mut next = Some(first_parent.to_string());
    while let Some(raw) = next.take() {
        let reference = Reference::parse_single(&raw)?;
        let name = reference.to_string();
        if let Some(idx) = visited.iter().position(|r| *r == name) {
            return Err(KitError::CycleInModelKitReferences {
                chain: format_chain(&visited[idx..], &name),
            });
        }
        if visited.len() > MAX_MODEL_REF_CHAIN {
            return Err(KitError::MaxRefChainExceeded {
                chain: format_chain(&visited, &name),
            });
        }
        tracing::info!(reference = %raw, "Unpacking referenced ModelKit");
        let (target, desc) = ctx.find_target(&reference).await?;
        let (manifest, kitfile) = get_manifest_and_config(target.as_ref(), &desc).await?;
        next = kitfile.parent_reference().map(str::to_string);
        visited.push(name);
        units.push(UnpackUnit {
            target,
            manifest,
            kitfile,
            filters: vec![UnpackFilter::model_only()],
        });
    }
    Ok(())
}

fn layer_mismatch(base: BaseType) -> KitError {
    KitError::Other(format!(
        "manifest has more {} layers than the Kitfile declares",
        base.user_name()
    ))
}

async fn unpack_unit(
    ctx: &KitContext,
    unit: &UnpackUnit,
    output_dir: &Path,
    overwrite: &Overwrite,
    summary: &mut UnpackSummary,
) -> Result<()> {
    let kitfile = &unit.kitfile;
    if should_unpack(Section::Kitfile, &unit.filters) {
        write_kitfile(kitfile, output_dir, overwrite).await?;
    }

    let (mut part_idx, mut code_idx, mut dataset_idx, mut docs_idx) = (0, 0, 0, 0);
    for layer in &unit.manifest.layers {
        let media_type = MediaType::parse_strict(&layer.media_type)?;
        let base = media_type.base;
        let (section, path) = match base {
            BaseType::Model => {
                let model = kitfile.model.as_ref().ok_or_else(|| layer_mismatch(base))?;
                (Section::Model(model), model.path.as_str())
            }
            BaseType::ModelPart => {
                let part = kitfile
                    .model
                    .as_ref()
                    .and_then(|m| m.parts.get(part_idx))
                    .ok_or_else(|| layer_mismatch(base))?;
                part_idx += 1;
                (Section::ModelPart(part), part.path.as_str())
            }
            BaseType::Code => {
                let code = kitfile.code.get(code_idx).ok_or_else(|| layer_mismatch(base))?;
                code_idx += 1;
                (Section::Code(code), code.path.as_str())
            }
            BaseType::Dataset => {
                let dataset = kitfile
                    .datasets
                    .get(dataset_idx)
                    .ok_or_else(|| layer_mismatch(base))?;
                dataset_idx += 1;
                (Section::Dataset(dataset), dataset.path.as_str())
            }
            BaseType::Docs => {
                let docs = kitfile.docs.get(docs_idx).ok_or_else(|| layer_mismatch(base))?;
                docs_idx += 1;
                (Section::Docs(docs), docs.path.as_str())
            }
            BaseType::Config => {
                return Err(KitError::InvalidMediaType(layer.media_type.clone()));
            }
        };
        if !should_unpack(section, &unit.filters) {
            continue;
        }
        ctx.check_canceled()?;
        tracing::info!(
            layer = base.user_name(),
            path = %path,
            "Unpacking layer"
        );
        summary.files += unpack_layer(
            ctx,
            unit.target.as_ref(),
            layer,
            media_type.compression,
            output_dir,
            path,
            overwrite,
        )
        .await?;
        summary.layers += 1;
    }
    Ok(())
}

async fn write_kitfile(kitfile: &Kitfile, output_dir: &Path, overwrite: &Overwrite) -> Result<()> {
    let path = output_dir.join(DEFAULT_KITFILE_NAMES[0]);
    overwrite.check_file(&path)?;
    tracing::info!(path = %path.display(), "Unpacking Kitfile");
    tokio::fs::write(&path, kitfile.to_yaml()?).await?;
    Ok(())
}

async fn unpack_layer(
    ctx: &KitContext,
    target: &dyn Target,
    desc: &Descriptor,
    compression: Compression,
    output_dir: &Path,
    declared_path: &str,
    overwrite: &Overwrite,
) -> Result<usize> {
    let declared = if declared_path.is_empty() { "." } else { declared_path };
    let (_, rel) = verify_subpath(output_dir, declared)?;
    let base_rel = match rel.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    };
    if base_rel != "." {
        std::fs::create_dir_all(output_dir.join(&base_rel))?;
    }

    let reader = target.fetch(desc).await?;
    let raw = SyncIoBridge::new(VerifyingReader::new(reader, &desc.digest, desc.size)?);
    let tracker = ProgressTracker::new(
        ctx.progress.clone(),
        ctx.clock.clone(),
        format!("unpack {}", desc.short_digest()),
        desc.size,
    );
    let cancel = ctx.cancel.clone();
    let output_dir = output_dir.to_path_buf();
    let overwrite = overwrite.clone();

    tokio::task::spawn_blocking(move || {
        extract_layer(raw, compression, &output_dir, &base_rel, &overwrite, tracker, &cancel)
    })
    .await
    .map_err(|e| KitError::Other(format!("unpack task failed: {}", e)))?
}

fn extract_layer<R: Read + Send>(
    mut raw: R,
    compression: Compression,
    output_dir: &Path,
    base_rel: &str,
    overwrite: &Overwrite,
    mut tracker: ProgressTracker,
    cancel: &CancellationToken,
) -> Result<usize> {
    let files = {
        let tracked = TrackedReader::new(&mut raw, &mut tracker, cancel);
        let result = decompress(tracked, compression)
            .map_err(KitError::from)
            .and_then(|decoder| extract_tar(decoder, output_dir, base_rel, overwrite, cancel));
        match result {
            Err(_) if cancel.is_cancelled() => return Err(KitError::Canceled),
            other => other?,
        }
    };
    // Read past the tar trailer so the digest is checked.
    io::copy(&mut raw, &mut io::sink())?;
    tracker.finish();
    Ok(files)
}

/// Write every entry of a tar stream under `<output_dir>/<base_rel>`.
/// Returns the number of regular files written.
fn extract_tar<R: Read>(
    reader: R,
    output_dir: &Path,
    base_rel: &str,
    overwrite: &Overwrite,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);
    let mut files = 0;
    // Applied once the stream is done so read-only directories still accept
    // their contents.
    let mut dir_modes = Vec::new();
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(KitError::Canceled);
        }
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let rel = if base_rel == "." {
            name.clone()
        } else {
            format!("{}/{}", base_rel, name)
        };
        let (path, _) = verify_subpath(output_dir, &rel)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                if path.exists() {
                    if !path.is_dir() {
                        return Err(KitError::AlreadyExists(format!(
                            "{} (exists and is not a directory)",
                            path.display()
                        )));
                    }
                } else {
                    tracing::debug!(path = %path.display(), "Creating directory");
                    std::fs::create_dir_all(&path)?;
                    dir_modes.push((path, entry.header().mode()?));
                }
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                overwrite.check_file(&path)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                tracing::debug!(path = %path.display(), "Unpacking file");
                let size = entry.header().size()?;
                let mut file = File::create(&path)?;
                let written = io::copy(&mut entry, &mut file)?;
                if written != size {
                    return Err(KitError::Other(format!(
                        "could not unpack file {}: wrote {} of {} bytes",
                        path.display(),
                        written,
                        size
                    )));
                }
                set_file_mode(&path, entry.header().mode()?)?;
                files += 1;
            }
            _ => {
                return Err(KitError::Other(format!(
                    "unrecognized type in archive: {}",
                    name
                )));
            }
        }
    }
    for (path, mode) in dir_modes.iter().rev() {
        set_file_mode(path, *mode)?;
    }
    Ok(files)
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
