//! Reproducible tar layers built from Kitfile paths.
//!
//! Every header is normalized (zero timestamps, root ownership, no user or
//! group names) so identical content always yields an identical digest.

use std::fs::{File, Metadata};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use tar::{EntryType, Header};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use kitops_core::error::{KitError, Result};
use kitops_core::progress::{Clock, NoProgress, ProgressSink, ProgressTracker, SystemClock};

use crate::cache::{CacheDir, PACK_SUBDIR};
use crate::ignore::IgnoreMatcher;
use crate::kitfile::verify_subpath;
use crate::oci::{Compression, Descriptor, HashingWriter, MediaType};

/// Counts for one built layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub files: usize,
    pub uncompressed_size: u64,
}

/// A layer written to a temporary file. Dropping it deletes the file.
pub struct BuiltLayer {
    pub temp: NamedTempFile,
    pub descriptor: Descriptor,
    pub stats: LayerStats,
}

/// One archive member, collected before writing so the total is known.
struct ArchiveEntry {
    source: PathBuf,
    name: String,
    is_dir: bool,
    size: u64,
    mode: u32,
}

/// Builds layer blobs into the `pack` cache directory.
#[derive(Clone)]
pub struct LayerBuilder {
    cache: CacheDir,
    progress: Arc<dyn ProgressSink>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl LayerBuilder {
    pub fn new(cache: CacheDir) -> Self {
        Self {
            cache,
            progress: Arc::new(NoProgress),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>, clock: Arc<dyn Clock>) -> Self {
        self.progress = progress;
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Archive `path` (relative to `context_dir`) as a layer of type
    /// `media_type`, skipping whatever `ignore` excludes.
    ///
    /// Entry names are relative to the parent of the layer root: a file
    /// layer is stored under its base name, `models/bert` as `bert/...`.
    pub fn build(
        &self,
        context_dir: &Path,
        path: &str,
        media_type: MediaType,
        ignore: &IgnoreMatcher,
    ) -> Result<BuiltLayer> {
        let (abs, rel) = verify_subpath(context_dir, path)?;
        let meta = std::fs::metadata(&abs).map_err(|e| {
            KitError::Other(format!("failed to stat layer path {}: {}", path, e))
        })?;

        let entries = if meta.is_file() {
            vec![ArchiveEntry {
                name: base_name(&rel),
                source: abs,
                is_dir: false,
                size: meta.len(),
                mode: file_mode(&meta),
            }]
        } else if meta.is_dir() {
            collect_dir_entries(&abs, &rel, ignore)?
        } else {
            return Err(KitError::Other(format!(
                "path {} is neither a file nor a directory",
                path
            )));
        };

        let stats = LayerStats {
            files: entries.iter().filter(|e| !e.is_dir).count(),
            uncompressed_size: entries.iter().map(|e| e.size).sum(),
        };
        tracing::debug!(
            path,
            media_type = %media_type,
            files = stats.files,
            bytes = stats.uncompressed_size,
            "Building layer"
        );

        let temp = self.cache.mk_cache_file(PACK_SUBDIR, "kitops_layer_")?;
        let file = temp.as_file().try_clone()?;
        let label = format!("{} {}", media_type.base.user_name(), path);
        let mut tracker = ProgressTracker::new(
            self.progress.clone(),
            self.clock.clone(),
            label,
            stats.uncompressed_size,
        );

        let hashing = HashingWriter::new(BufWriter::new(file));
        let mut archive = tar::Builder::new(CompressWriter::new(hashing, media_type.compression)?);
        for entry in &entries {
            if self.cancel.is_cancelled() {
                return Err(KitError::Canceled);
            }
            self.append_entry(&mut archive, entry, &mut tracker)?;
        }

        let compressed = archive.into_inner()?;
        let hashing = compressed.finish()?;
        let (buffered, digest, size) = hashing.finish();
        buffered
            .into_inner()
            .map_err(|e| KitError::IoError(e.into_error()))?
            .sync_all()?;
        tracker.finish();

        tracing::debug!(path, %digest, size, "Built layer");
        Ok(BuiltLayer {
            temp,
            descriptor: Descriptor::new(media_type.to_string(), digest, size),
            stats,
        })
    }

    fn append_entry<W: Write>(
        &self,
        archive: &mut tar::Builder<W>,
        entry: &ArchiveEntry,
        tracker: &mut ProgressTracker,
    ) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("")?;
        header.set_groupname("")?;
        header.set_mode(entry.mode);

        if entry.is_dir {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            archive.append_data(&mut header, &entry.name, io::empty())?;
            return Ok(());
        }

        header.set_entry_type(EntryType::Regular);
        header.set_size(entry.size);
        let file = File::open(&entry.source).map_err(|e| {
            KitError::Other(format!(
                "failed to open {} for archiving: {}",
                entry.source.display(),
                e
            ))
        })?;
        let mut reader = TrackedReader::new(file.take(entry.size), tracker, &self.cancel);
        if let Err(e) = archive.append_data(&mut header, &entry.name, &mut reader) {
            if self.cancel.is_cancelled() {
                return Err(KitError::Canceled);
            }
            return Err(e.into());
        }
        if reader.read != entry.size {
            return Err(KitError::Other(format!(
                "file {} changed while it was being archived",
                entry.source.display()
            )));
        }
        Ok(())
    }
}

/// Walk `abs_root` in name order, returning the entries to archive.
fn collect_dir_entries(
    abs_root: &Path,
    rel_root: &str,
    ignore: &IgnoreMatcher,
) -> Result<Vec<ArchiveEntry>> {
    let name_root = if rel_root == "." {
        None
    } else {
        Some(base_name(rel_root))
    };
    let mut entries = Vec::new();
    let mut walker = WalkDir::new(abs_root).sort_by_file_name().into_iter();

    while let Some(item) = walker.next() {
        let item = item.map_err(|e| {
            KitError::Other(format!("failed to walk {}: {}", abs_root.display(), e))
        })?;
        let file_type = item.file_type();
        if !file_type.is_file() && !file_type.is_dir() {
            tracing::debug!(path = %item.path().display(), "Skipping non-regular file");
            continue;
        }

        let sub = relative_slash_path(item.path(), abs_root);
        let context_rel = match (rel_root, sub.as_str()) {
            (root, "") => root.to_string(),
            (".", s) => s.to_string(),
            (root, s) => format!("{}/{}", root, s),
        };

        let ignored = if file_type.is_dir() {
            ignore.matches_dir(&context_rel, rel_root)
        } else {
            ignore.matches(&context_rel, rel_root)
        };
        if ignored {
            if file_type.is_dir() && !ignore.has_exclusions() {
                tracing::debug!(path = %context_rel, "Skipping directory: ignored");
                walker.skip_current_dir();
            } else {
                tracing::debug!(path = %context_rel, "Skipping file: ignored");
            }
            continue;
        }

        let name = match (&name_root, sub.as_str()) {
            (None, "") => continue,
            (None, s) => s.to_string(),
            (Some(root), "") => root.clone(),
            (Some(root), s) => format!("{}/{}", root, s),
        };
        let meta = item.metadata().map_err(|e| {
            KitError::Other(format!("failed to stat {}: {}", item.path().display(), e))
        })?;
        entries.push(ArchiveEntry {
            source: item.path().to_path_buf(),
            name,
            is_dir: file_type.is_dir(),
            size: if file_type.is_dir() { 0 } else { meta.len() },
            mode: file_mode(&meta),
        });
    }
    Ok(entries)
}

fn relative_slash_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

fn base_name(rel: &str) -> String {
    rel.rsplit('/').next().unwrap_or(rel).to_string()
}

#[cfg(unix)]
fn file_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Reader that reports progress and stops once `cancel` fires.
pub(crate) struct TrackedReader<'a, R> {
    inner: R,
    tracker: &'a mut ProgressTracker,
    cancel: &'a CancellationToken,
    read: u64,
}

impl<'a, R> TrackedReader<'a, R> {
    pub(crate) fn new(inner: R, tracker: &'a mut ProgressTracker, cancel: &'a CancellationToken) -> Self {
        Self {
            inner,
            tracker,
            cancel,
            read: 0,
        }
    }
}

impl<R: Read> Read for TrackedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "operation canceled"));
        }
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        self.tracker.advance(n as u64);
        Ok(n)
    }
}

/// Optional compression stage between the tar writer and the hasher.
enum CompressWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> CompressWriter<W> {
    fn new(inner: W, compression: Compression) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => Self::Plain(inner),
            Compression::Gzip => Self::Gzip(GzEncoder::new(inner, flate2::Compression::default())),
            Compression::GzipFastest => {
                Self::Gzip(GzEncoder::new(inner, flate2::Compression::fast()))
            }
            Compression::Zstd => Self::Zstd(zstd::stream::write::Encoder::new(inner, 0)?),
        })
    }

    /// Flush the compression footer and return the inner writer.
    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Gzip(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

/// Wrap a layer blob reader with the decoder for `compression`.
pub fn decompress<'a, R: Read + Send + 'a>(
    reader: R,
    compression: Compression,
) -> io::Result<Box<dyn Read + Send + 'a>> {
    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip | Compression::GzipFastest => {
            Box::new(flate2::read::GzDecoder::new(reader))
        }
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}
