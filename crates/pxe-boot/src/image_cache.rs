//! Master image cache
//!
//! One master copy per remote image lives in the master directory, named
//! by the image id (or a SHA-256 of its URL). Nodes get hard links to the
//! master, so a master's link count tells whether any node still uses it.
//!
//! Downloads land in a private temporary directory inside the master
//! directory and are published by linking, so an interrupted download
//! never leaves a partial master behind. Fetches of the same image are
//! serialized by a per-identity lock, held both in process and as an
//! advisory file lock under `.locks/`, so engine and janitor processes
//! sharing a master directory never download or evict the same image at
//! once. Eviction skips identities whose lock is held.

use crate::artifacts::ImageReference;
use crate::error::{bounded, BootError, Result};
use crate::fsutil;
use crate::provider::ImageConverter;
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use image_service_client::{parse_image_id, DiskFormat, ImageMetadata, ImageServiceTrait};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, FileTimes, TryLockError};
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const DOWNLOAD_DIR_PREFIX: &str = ".download-";
const LOCK_DIR: &str = ".locks";
const QCOW_MAGIC: &[u8; 4] = b"QFI\xfb";

/// A master image in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub identity: String,
    pub path: PathBuf,
    pub size: u64,
    pub last_access: SystemTime,
    /// 1 means no node links to the master
    pub link_count: u64,
}

/// What a clean-up pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted: Vec<String>,
    pub reclaimed_bytes: u64,
    /// Identities skipped because a fetch held them
    pub busy: Vec<String>,
    pub remaining_bytes: u64,
    pub stale_downloads: usize,
}

/// Cache identity of an image reference
pub fn master_identity(href: &str) -> String {
    match parse_image_id(href) {
        Some(id) => id,
        None => {
            let digest = Sha256::digest(href.trim().as_bytes());
            digest.iter().map(|b| format!("{:02x}", b)).collect()
        }
    }
}

/// Size- and age-bounded cache of boot images
pub struct ImageCache {
    master_dir: Option<PathBuf>,
    max_size: u64,
    ttl: Duration,
    force_raw: bool,
    download_timeout: Duration,
    metadata_timeout: Duration,
    images: Arc<dyn ImageServiceTrait>,
    converter: Arc<dyn ImageConverter>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("master_dir", &self.master_dir)
            .field("max_size", &self.max_size)
            .field("ttl", &self.ttl)
            .field("force_raw", &self.force_raw)
            .finish_non_exhaustive()
    }
}

enum Removal {
    Removed,
    Busy,
    Referenced,
}

impl ImageCache {
    pub fn new(
        settings: &Settings,
        images: Arc<dyn ImageServiceTrait>,
        converter: Arc<dyn ImageConverter>,
    ) -> Self {
        Self {
            master_dir: settings.cache.master_path.clone(),
            max_size: settings.cache.size_bytes(),
            ttl: settings.cache.ttl(),
            force_raw: settings.cache.force_raw_images,
            download_timeout: settings.cache.download_timeout(),
            metadata_timeout: settings.image_service.timeout(),
            images,
            converter,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the size bound (bytes, 0 = unbounded) and entry TTL (0 = no expiry)
    pub fn with_limits(mut self, max_size: u64, ttl: Duration) -> Self {
        self.max_size = max_size;
        self.ttl = ttl;
        self
    }

    pub fn master_dir(&self) -> Option<&Path> {
        self.master_dir.as_deref()
    }

    fn identity_lock(&self, identity: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(identity.to_string()).or_default())
    }

    /// Makes sure the master copy of `href` is present and returns its path
    pub async fn ensure(&self, href: &str) -> Result<PathBuf> {
        let Some(master_dir) = self.master_dir.as_deref() else {
            return Err(BootError::Configuration(
                "image cache has no master directory".to_string(),
            ));
        };
        let identity = master_identity(href);
        let master = master_dir.join(&identity);
        let lock = self.identity_lock(&identity);
        let _guard = lock.lock().await;
        let _held = lock_identity_file(master_dir, &identity).await?;
        self.ensure_master(href, master_dir, &master).await?;
        Ok(master)
    }

    /// Places `href` at `dest`, as a hard link to the master when caching
    pub async fn fetch_image(&self, href: &str, dest: &Path) -> Result<()> {
        let Some(master_dir) = self.master_dir.as_deref() else {
            return self.fetch_direct(href, dest).await;
        };

        let identity = master_identity(href);
        let master = master_dir.join(&identity);
        let lock = self.identity_lock(&identity);
        let _guard = lock.lock().await;
        let _held = lock_identity_file(master_dir, &identity).await?;

        self.ensure_master(href, master_dir, &master).await?;
        if same_file(&master, dest) {
            debug!("{} already links master {}", dest.display(), identity);
            return Ok(());
        }
        fsutil::hard_link_atomic(&master, dest)?;
        debug!("Linked {} to master {}", dest.display(), identity);
        Ok(())
    }

    /// Fetches every reference; identities are fetched concurrently
    pub async fn fetch_all(&self, references: &[ImageReference]) -> Result<()> {
        futures::future::try_join_all(
            references
                .iter()
                .map(|r| self.fetch_image(&r.href, &r.path)),
        )
        .await?;
        Ok(())
    }

    async fn lookup(&self, href: &str) -> Result<ImageMetadata> {
        bounded("image metadata lookup", self.metadata_timeout, async {
            self.images.show(href).await.map_err(BootError::from)
        })
        .await
    }

    /// Caller holds both identity locks
    async fn ensure_master(&self, href: &str, master_dir: &Path, master: &Path) -> Result<()> {
        let metadata = self.lookup(href).await;

        if master.exists() {
            match &metadata {
                Ok(meta) if is_stale(master, meta) => {
                    info!("Master image {} is older than {}, fetching again", master.display(), href);
                    fs::remove_file(master).map_err(BootError::fs(master))?;
                }
                Ok(_) => {
                    touch(master);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Could not check {} for updates, using cached copy: {}", href, e);
                    touch(master);
                    return Ok(());
                }
            }
        }

        let metadata = metadata.map_err(|e| download_failed(href, e))?;
        fsutil::ensure_dir(master_dir, None)?;
        let staging = tempfile::Builder::new()
            .prefix(DOWNLOAD_DIR_PREFIX)
            .tempdir_in(master_dir)
            .map_err(BootError::fs(master_dir))?;
        let staged = staging.path().join("image");

        info!("Downloading {} into image cache", href);
        self.download_to(href, Some(&metadata), &staged).await?;
        fs::hard_link(&staged, master).map_err(BootError::fs(master))?;
        touch(master);
        Ok(())
    }

    /// Downloads without a master copy
    async fn fetch_direct(&self, href: &str, dest: &Path) -> Result<()> {
        let metadata = match self.lookup(href).await {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!("No metadata for {}: {}", href, e);
                None
            }
        };
        let parent = dest.parent().ok_or_else(|| {
            BootError::Configuration(format!("{} has no parent directory", dest.display()))
        })?;
        let tmp = tempfile::Builder::new()
            .prefix(DOWNLOAD_DIR_PREFIX)
            .tempfile_in(parent)
            .map_err(BootError::fs(parent))?
            .into_temp_path();
        self.download_to(href, metadata.as_ref(), &tmp).await?;
        tmp.persist(dest).map_err(|e| BootError::Filesystem {
            path: dest.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Downloads, checks the declared format and converts to raw when required
    async fn download_to(&self, href: &str, metadata: Option<&ImageMetadata>, dest: &Path) -> Result<()> {
        let bytes = bounded("image download", self.download_timeout, async {
            self.images
                .download(href, dest)
                .await
                .map_err(|e| download_failed(href, e))
        })
        .await
        .map_err(|e| match e {
            e @ BootError::ImageDownloadFailed { .. } => e,
            other => download_failed(href, other),
        })?;
        debug!("Downloaded {} bytes of {}", bytes, href);

        let is_qcow = has_qcow_magic(dest).map_err(BootError::fs(dest))?;
        let declared = metadata.and_then(|m| m.disk_format.as_ref());
        match declared {
            Some(DiskFormat::Raw) if is_qcow => {
                return Err(download_failed(href, "declared raw but content is qcow2"));
            }
            Some(DiskFormat::Qcow2) if !is_qcow => {
                return Err(download_failed(href, "declared qcow2 but content is not"));
            }
            _ => {}
        }

        let needs_conversion = declared.map_or(is_qcow, |f| f.needs_conversion());
        if self.force_raw && needs_conversion {
            let converted = dest.with_extension("converted");
            self.converter
                .convert_to_raw(dest, &converted)
                .await
                .map_err(|e| download_failed(href, e))?;
            fs::rename(&converted, dest).map_err(BootError::fs(dest))?;
        }
        Ok(())
    }

    /// Master entries, oldest access first
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let Some(master_dir) = self.master_dir.as_deref() else {
            return Ok(Vec::new());
        };
        let read = match fs::read_dir(master_dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BootError::fs(master_dir)(e)),
        };

        let mut entries = Vec::new();
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            entries.push(CacheEntry {
                identity: name,
                path: entry.path(),
                size: meta.len(),
                last_access: meta.accessed().or_else(|_| meta.modified()).unwrap_or(SystemTime::UNIX_EPOCH),
                link_count: meta.nlink(),
            });
        }
        entries.sort_by_key(|e| e.last_access);
        Ok(entries)
    }

    /// Evicts expired masters, then oldest masters until the cache (plus
    /// `amount` bytes of headroom) fits the size bound. Linked masters and
    /// identities with a fetch in flight are never evicted.
    pub fn clean_up(&self, amount: Option<u64>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let Some(master_dir) = self.master_dir.as_deref() else {
            return Ok(report);
        };
        let now = SystemTime::now();
        report.stale_downloads = self.sweep_stale_downloads(master_dir, now);

        let mut survivors = Vec::new();
        for entry in self.entries()? {
            let age = now.duration_since(entry.last_access).unwrap_or_default();
            let expired = !self.ttl.is_zero() && age > self.ttl;
            if expired && entry.link_count == 1 {
                match self.try_remove(master_dir, &entry) {
                    Removal::Removed => {
                        report.reclaimed_bytes += entry.size;
                        report.evicted.push(entry.identity);
                        continue;
                    }
                    Removal::Busy => report.busy.push(entry.identity.clone()),
                    Removal::Referenced => {}
                }
            }
            survivors.push(entry);
        }

        let mut total: u64 = survivors.iter().map(|e| e.size).sum();
        if self.max_size > 0 {
            let target = self.max_size.saturating_sub(amount.unwrap_or(0));
            for entry in &survivors {
                if total <= target {
                    break;
                }
                if entry.link_count != 1 || report.busy.contains(&entry.identity) {
                    continue;
                }
                match self.try_remove(master_dir, entry) {
                    Removal::Removed => {
                        total -= entry.size;
                        report.reclaimed_bytes += entry.size;
                        report.evicted.push(entry.identity.clone());
                    }
                    Removal::Busy => report.busy.push(entry.identity.clone()),
                    Removal::Referenced => {}
                }
            }
            if total > target {
                warn!(
                    "Image cache holds {} bytes after clean up, above the {} byte target; remaining masters are in use",
                    total, target
                );
            }
        }
        report.remaining_bytes = total;

        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        if !report.evicted.is_empty() {
            info!(
                "Image cache evicted {} masters, reclaiming {} bytes",
                report.evicted.len(),
                report.reclaimed_bytes
            );
        }
        Ok(report)
    }

    /// Evicts one master if unreferenced; `Ok(false)` when absent or still linked
    pub fn evict(&self, identity: &str) -> Result<bool> {
        let Some(master_dir) = self.master_dir.as_deref() else {
            return Ok(false);
        };
        let path = master_dir.join(identity);
        let Ok(meta) = fs::metadata(&path) else {
            return Ok(false);
        };
        let entry = CacheEntry {
            identity: identity.to_string(),
            path,
            size: meta.len(),
            last_access: SystemTime::now(),
            link_count: meta.nlink(),
        };
        match self.try_remove(master_dir, &entry) {
            Removal::Removed => Ok(true),
            Removal::Referenced => Ok(false),
            Removal::Busy => Err(BootError::ImageCacheEvictionConflict(identity.to_string())),
        }
    }

    fn try_remove(&self, master_dir: &Path, entry: &CacheEntry) -> Removal {
        let lock = self.identity_lock(&entry.identity);
        let Ok(_guard) = lock.try_lock() else {
            debug!("Skipping master {}: fetch in progress", entry.identity);
            return Removal::Busy;
        };
        let held = match open_lock_file(master_dir, &entry.identity) {
            Ok(file) => file,
            Err(e) => {
                warn!("Skipping master {}: {}", entry.identity, e);
                return Removal::Busy;
            }
        };
        match held.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                debug!("Skipping master {}: held by another process", entry.identity);
                return Removal::Busy;
            }
            Err(TryLockError::Error(e)) => {
                warn!("Skipping master {}: cannot lock it: {}", entry.identity, e);
                return Removal::Busy;
            }
        }
        match fs::metadata(&entry.path) {
            Ok(meta) if meta.nlink() == 1 => {}
            _ => return Removal::Referenced,
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!("Evicted master {}", entry.identity);
                Removal::Removed
            }
            Err(e) => {
                warn!("Failed to evict master {}: {}", entry.identity, e);
                Removal::Referenced
            }
        }
    }

    fn sweep_stale_downloads(&self, master_dir: &Path, now: SystemTime) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let Ok(read) = fs::read_dir(master_dir) else {
            return 0;
        };
        let mut swept = 0;
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(DOWNLOAD_DIR_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if meta.is_dir() && age > self.ttl {
                fsutil::rmtree_without_raise(&entry.path());
                swept += 1;
            }
        }
        swept
    }
}

fn lock_file_path(master_dir: &Path, identity: &str) -> PathBuf {
    master_dir.join(LOCK_DIR).join(format!("{}.lock", identity))
}

/// Opens the identity's lock file; lock files are never removed
fn open_lock_file(master_dir: &Path, identity: &str) -> Result<fs::File> {
    fsutil::ensure_dir(&master_dir.join(LOCK_DIR), None)?;
    let path = lock_file_path(master_dir, identity);
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(BootError::fs(&path))
}

/// Takes the identity's file lock, waiting off the runtime if another process holds it.
///
/// The lock is released when the returned file is dropped.
async fn lock_identity_file(master_dir: &Path, identity: &str) -> Result<fs::File> {
    let file = open_lock_file(master_dir, identity)?;
    let path = lock_file_path(master_dir, identity);
    match file.try_lock() {
        Ok(()) => return Ok(file),
        Err(TryLockError::WouldBlock) => {}
        Err(TryLockError::Error(e)) => return Err(BootError::fs(&path)(e)),
    }

    debug!("Waiting for another process to release image {}", identity);
    tokio::task::spawn_blocking(move || file.lock().map(|()| file))
        .await
        .map_err(|e| BootError::Io(std::io::Error::other(e)))?
        .map_err(BootError::fs(&path))
}

fn download_failed(href: &str, reason: impl fmt::Display) -> BootError {
    BootError::ImageDownloadFailed {
        href: href.to_string(),
        reason: reason.to_string(),
    }
}

/// Whether the image was updated after the master was written
fn is_stale(master: &Path, meta: &ImageMetadata) -> bool {
    let Some(updated_at) = meta.updated_at else {
        return false;
    };
    match fs::metadata(master).and_then(|m| m.modified()) {
        Ok(written) => updated_at > DateTime::<Utc>::from(written),
        Err(_) => true,
    }
}

/// Records an access on the master
fn touch(path: &Path) {
    let result = fs::File::open(path)
        .and_then(|f| f.set_times(FileTimes::new().set_accessed(SystemTime::now())));
    if let Err(e) = result {
        warn!("Failed to update access time of {}: {}", path.display(), e);
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

fn has_qcow_magic(path: &Path) -> std::io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == QCOW_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[path = "image_cache_test.rs"]
mod image_cache_test;
