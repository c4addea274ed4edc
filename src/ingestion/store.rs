//! Content-addressed asset store.
//!
//! Owns the fingerprint -> [`StoredAsset`] index and every file under the
//! storage root. Incoming bytes are staged in the scratch area and then
//! moved into place with a no-clobber rename, so a final path never shows a
//! partially written file.
//!
//! The check-then-place sequence runs under a single placement lock: for a
//! given fingerprint exactly one writer wins and every other writer observes
//! a duplicate.

use super::file_handler::ScratchArea;
use super::fingerprint::{fingerprint_file_blocking, Fingerprint, FingerprintHasher};
use super::models::{MediaKind, StoredAsset};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Hex characters of the fingerprint appended to a colliding file name.
const DISAMBIGUATION_HEX_LEN: usize = 12;

/// Upper bound on numbered name candidates before giving up.
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Errors raised by the asset store. All of them are fatal for the request.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Directory unavailable: {path}: {source}")]
    DirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("No free file name for {0}")]
    NameExhausted(String),
}

impl StorageError {
    /// Classify an IO error raised while touching `path`.
    fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            io::ErrorKind::NotFound => Self::DirectoryUnavailable {
                path: path.to_path_buf(),
                source: err,
            },
            _ => Self::Io(err),
        }
    }
}

/// Why staging an incoming body failed.
#[derive(Debug, Error)]
pub enum StageError {
    /// The body stream broke (client disconnect, malformed multipart...).
    #[error("Body read failed: {0}")]
    Read(io::Error),

    /// `size` is the byte count at the point the body was cut off.
    #[error("Upload of at least {size} bytes exceeds {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Bytes written to the scratch area, hashed while they were written.
///
/// Dropping a staged file removes it from disk.
#[derive(Debug)]
pub struct StagedFile {
    temp: TempPath,
    fingerprint: Fingerprint,
    size: u64,
}

impl StagedFile {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.temp
    }
}

/// Result of committing bytes to the store.
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    Stored(StoredAsset),
    /// The content was already present; nothing new was written.
    Duplicate(StoredAsset),
}

impl StoreOutcome {
    pub fn asset(&self) -> &StoredAsset {
        match self {
            Self::Stored(asset) | Self::Duplicate(asset) => asset,
        }
    }

    pub fn into_asset(self) -> StoredAsset {
        match self {
            Self::Stored(asset) | Self::Duplicate(asset) => asset,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

pub struct AssetStore {
    root: PathBuf,
    scratch: ScratchArea,
    chunk_size: usize,
    index: RwLock<HashMap<Fingerprint, StoredAsset>>,
    /// Serializes lookup-then-place across all writers.
    place_lock: tokio::sync::Mutex<()>,
}

impl AssetStore {
    /// Open the store: create the directories, sweep the scratch area and
    /// rebuild the index from the files already under `root`.
    pub async fn open(
        root: &Path,
        scratch: ScratchArea,
        chunk_size: usize,
    ) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| StorageError::from_io(root, e))?;
        scratch
            .init()
            .await
            .map_err(|e| StorageError::from_io(scratch.dir(), e))?;

        let swept = scratch.sweep_all().await?;
        if swept > 0 {
            info!("Removed {} leftover entries from {:?}", swept, scratch.dir());
        }

        let root_buf = root.to_path_buf();
        let scratch_dir = scratch.dir().to_path_buf();
        let index = tokio::task::spawn_blocking(move || {
            rebuild_index(&root_buf, &scratch_dir, chunk_size)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        info!("Indexed {} stored assets under {:?}", index.len(), root);

        Ok(Self {
            root: root.to_path_buf(),
            scratch,
            chunk_size,
            index: RwLock::new(index),
            place_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch(&self) -> &ScratchArea {
        &self.scratch
    }

    /// Index-only existence check.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<StoredAsset> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(fingerprint)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored asset.
    pub fn assets(&self) -> Vec<StoredAsset> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Stream `body` into a scratch temp file, hashing it on the way.
    ///
    /// `on_progress` gets the running byte count after every chunk. When
    /// `limit` is set, the upload is cut off as soon as it is exceeded.
    pub async fn stage<S, F>(
        &self,
        mut body: S,
        limit: Option<u64>,
        mut on_progress: F,
    ) -> Result<StagedFile, StageError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
        F: FnMut(u64),
    {
        let named = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".part")
            .tempfile_in(self.scratch.dir())
            .map_err(|e| StorageError::from_io(self.scratch.dir(), e))?;
        let (file, temp) = named.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut hasher = FingerprintHasher::new();
        let mut size: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(StageError::Read)?;
            size += chunk.len() as u64;
            if let Some(limit) = limit {
                if size > limit {
                    return Err(StageError::TooLarge { size, limit });
                }
            }
            // Large chunks are split so the hasher and writer see bounded slices
            for piece in chunk.chunks(self.chunk_size.max(1)) {
                hasher.update(piece);
                file.write_all(piece)
                    .await
                    .map_err(|e| StorageError::from_io(&temp, e))?;
            }
            on_progress(size);
        }

        file.flush()
            .await
            .map_err(|e| StorageError::from_io(&temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::from_io(&temp, e))?;

        Ok(StagedFile {
            temp,
            fingerprint: hasher.finalize(),
            size,
        })
    }

    /// Move a staged file into place, unless its content is already stored.
    pub async fn commit(
        &self,
        staged: StagedFile,
        filename: &str,
    ) -> Result<StoreOutcome, StorageError> {
        let _guard = self.place_lock.lock().await;

        if let Some(existing) = self.lookup(&staged.fingerprint) {
            debug!(
                "Discarding staged copy of {} (already stored at {:?})",
                staged.fingerprint.short_hex(DISAMBIGUATION_HEX_LEN),
                existing.path
            );
            return Ok(StoreOutcome::Duplicate(existing));
        }

        let StagedFile {
            temp,
            fingerprint,
            size,
        } = staged;
        let path = self.place(temp, filename, &fingerprint).await?;
        let asset = StoredAsset::new(fingerprint, path, filename, size);

        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fingerprint, asset.clone());

        info!(
            "Stored {:?} ({}, {})",
            asset.path,
            byte_unit::Byte::from_u64(size).get_appropriate_unit(byte_unit::UnitType::Binary),
            asset.media_kind.as_str()
        );
        Ok(StoreOutcome::Stored(asset))
    }

    /// Store a byte stream whose fingerprint the caller already knows.
    ///
    /// A known fingerprint drains the stream without writing anything. The
    /// bytes are re-hashed while staging and must match `fingerprint`.
    pub async fn store<S>(
        &self,
        fingerprint: Fingerprint,
        filename: &str,
        mut body: S,
    ) -> Result<StoreOutcome, StageError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        if let Some(existing) = self.lookup(&fingerprint) {
            while let Some(chunk) = body.next().await {
                chunk.map_err(StageError::Read)?;
            }
            return Ok(StoreOutcome::Duplicate(existing));
        }

        let staged = self.stage(body, None, |_| {}).await?;
        if staged.fingerprint != fingerprint {
            return Err(StorageError::DigestMismatch {
                expected: fingerprint,
                actual: staged.fingerprint,
            }
            .into());
        }
        Ok(self.commit(staged, filename).await?)
    }

    /// Place a derived file (a conversion output) next to the asset it was
    /// derived from and record it. Returns the final path.
    pub async fn place_converted(
        &self,
        fingerprint: &Fingerprint,
        temp: TempPath,
        desired_name: &str,
    ) -> Result<PathBuf, StorageError> {
        let _guard = self.place_lock.lock().await;
        let path = self.place(temp, desired_name, fingerprint).await?;

        if let Some(asset) = self
            .index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(fingerprint)
        {
            asset.converted_path = Some(path.clone());
        }
        Ok(path)
    }

    /// Rename `temp` to the first free candidate name. Caller holds the
    /// placement lock.
    async fn place(
        &self,
        temp: TempPath,
        filename: &str,
        fingerprint: &Fingerprint,
    ) -> Result<PathBuf, StorageError> {
        let mut temp = temp;
        for name in candidate_names(filename, fingerprint).take(MAX_NAME_ATTEMPTS) {
            let target = self.root.join(&name);
            let attempt_target = target.clone();
            let result =
                tokio::task::spawn_blocking(move || temp.persist_noclobber(&attempt_target))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            match result {
                Ok(()) => return Ok(target),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    temp = e.path;
                }
                Err(e) => return Err(StorageError::from_io(&self.root, e.error)),
            }
        }
        Err(StorageError::NameExhausted(filename.to_string()))
    }
}

/// Final name candidates for `filename`: the name itself, then
/// `<stem>-<hex>.<ext>`, then `<stem>-<hex>-<n>.<ext>`.
fn candidate_names(filename: &str, fingerprint: &Fingerprint) -> impl Iterator<Item = String> {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    let hex = fingerprint.short_hex(DISAMBIGUATION_HEX_LEN);
    let original = filename.to_string();

    std::iter::once(original)
        .chain(std::iter::once(format!("{}-{}{}", stem, hex, ext)))
        .chain((1..).map(move |n| format!("{}-{}-{}{}", stem, hex, n, ext)))
}

/// Hash every regular file under `root`, skipping the scratch area and
/// hidden files.
/// Position of `candidate_stem` among the names a conversion of `original`
/// would have tried, or `None` if it is not one of them.
fn conversion_rank(original: &Path, fingerprint: &Fingerprint, candidate_stem: &str) -> Option<u64> {
    let stem = original.file_stem()?.to_str()?;
    if candidate_stem == stem {
        return Some(0);
    }
    let disambiguated = format!("{}-{}", stem, fingerprint.short_hex(DISAMBIGUATION_HEX_LEN));
    let rest = candidate_stem.strip_prefix(disambiguated.as_str())?;
    if rest.is_empty() {
        return Some(1);
    }
    let n: u64 = rest.strip_prefix('-')?.parse().ok()?;
    (n >= 1).then_some(n + 1)
}

fn rebuild_index(
    root: &Path,
    scratch_dir: &Path,
    chunk_size: usize,
) -> io::Result<HashMap<Fingerprint, StoredAsset>> {
    let mut index: HashMap<Fingerprint, StoredAsset> = HashMap::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        e.path() != scratch_dir && !e.file_name().to_string_lossy().starts_with('.')
            || e.depth() == 0
    }) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry during index rebuild: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let fingerprint = match fingerprint_file_blocking(path, chunk_size) {
            Ok(fp) => fp,
            Err(e) => {
                warn!("Failed to hash {:?}: {}", path, e);
                continue;
            }
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let filename = entry.file_name().to_string_lossy().to_string();

        if let Some(existing) = index.get(&fingerprint) {
            warn!(
                "{:?} has the same content as {:?}, keeping the latter",
                path, existing.path
            );
            continue;
        }
        index.insert(
            fingerprint,
            StoredAsset::new(fingerprint, path.to_path_buf(), &filename, size),
        );
    }

    // Reattach conversion outputs sitting next to their originals. The output
    // may carry any video extension and may have been disambiguated on
    // placement, so match on the names `candidate_names` would have produced.
    let videos: Vec<(PathBuf, String)> = index
        .values()
        .filter(|a| a.media_kind == MediaKind::Video)
        .filter_map(|a| Some((a.path.clone(), a.path.file_stem()?.to_str()?.to_string())))
        .collect();
    for asset in index
        .values_mut()
        .filter(|a| a.media_kind == MediaKind::ProprietaryVideo)
    {
        let converted = videos
            .iter()
            .filter(|(path, _)| path.parent() == asset.path.parent())
            .filter_map(|(path, stem)| {
                conversion_rank(&asset.path, &asset.fingerprint, stem).map(|rank| (rank, path))
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, path)| path.clone());
        if converted.is_some() {
            asset.converted_path = converted;
        }
    }

    Ok(index)
}
