//! Staged file lifecycle.
//!
//! The [`FileLifecycleManager`] is the only component allowed to delete files.
//! It tracks every artifact handed to a caller, reclaims them on explicit
//! release or once their TTL passes, and removes stray temp files left by
//! crashed attempts.
//!
//! # Layout of the staging directory
//!
//! ```text
//! downloads/
//! ├── temp_youtube_20250101_120000_9f3a1c2e   in-flight attempt (not tracked)
//! ├── youtube_4f1e2d3c4b5a.mp4                promoted result (tracked)
//! └── clip.f137.mp4.part                      extractor fragment (orphan)
//! ```
//!
//! Temp files are never registered. They are either promoted into a final
//! path, discarded by the orchestrator, or reclaimed by the orphan sweep once
//! older than the file TTL.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::LifecycleError;
use crate::model::RequestId;
use crate::platform::Platform;

/// Default time-to-live of a delivered file (1 hour).
pub const DEFAULT_FILE_TTL_SECS: u64 = 3600;

/// Default interval between background sweeps (30 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 1800;

/// Default staging directory, relative to the working directory.
pub const DEFAULT_STAGING_DIR: &str = "downloads";

/// Prefix of every temp file allocated for an attempt.
pub const TEMP_PREFIX: &str = "temp_";

/// Names treated as temp artifacts by the orphan sweep.
const TEMP_PATTERNS: &[&str] = &["temp_*", "*.part", "*.part-Frag*", "*.ytdl", "*.fdash-*"];

/// Configuration for the file lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub struct FileLifecycleConfig {
    /// Directory holding temp and final files (default: `downloads`).
    pub staging_dir: PathBuf,
    /// Age after which a tracked file is reclaimed (default: 1h).
    pub ttl: Duration,
    /// Interval of the background sweep (default: 30min).
    pub sweep_interval: Duration,
}

impl Default for FileLifecycleConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            ttl: Duration::from_secs(DEFAULT_FILE_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl FileLifecycleConfig {
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Handle to a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping entry for one tracked file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: FileId,
    pub original_path: PathBuf,
    /// Set once the file has been moved with [`FileLifecycleManager::rename`].
    pub renamed_path: Option<PathBuf>,
    pub created_at: SystemTime,
    pub ttl: Duration,
}

impl FileRecord {
    /// Where the file currently lives.
    pub fn current_path(&self) -> &Path {
        self.renamed_path.as_deref().unwrap_or(&self.original_path)
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now.duration_since(self.created_at)
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }
}

/// Counts of files removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tracked files past their TTL.
    pub expired: usize,
    /// Untracked temp artifacts past the TTL.
    pub orphans: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.orphans
    }
}

/// Owner of every file the engine leaves on disk.
pub struct FileLifecycleManager {
    config: FileLifecycleConfig,
    next_id: AtomicU64,
    records: Mutex<HashMap<FileId, FileRecord>>,
    temp_patterns: Vec<glob::Pattern>,
    prepared: AtomicBool,
}

impl std::fmt::Debug for FileLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLifecycleManager")
            .field("config", &self.config)
            .field("tracked", &self.records.lock().len())
            .finish_non_exhaustive()
    }
}

impl FileLifecycleManager {
    pub fn new(config: FileLifecycleConfig) -> Self {
        let temp_patterns = TEMP_PATTERNS
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        Self {
            config,
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
            temp_patterns,
            prepared: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FileLifecycleConfig {
        &self.config
    }

    pub fn staging_dir(&self) -> &Path {
        &self.config.staging_dir
    }

    /// Creates the staging directory if it does not exist.
    pub async fn prepare(&self) -> Result<(), LifecycleError> {
        tokio::fs::create_dir_all(&self.config.staging_dir)
            .await
            .map_err(|source| LifecycleError::StagingDir {
                path: self.config.staging_dir.clone(),
                source,
            })?;
        self.prepared.store(true, Ordering::Release);
        Ok(())
    }

    /// Like [`prepare`](Self::prepare), but only touches the filesystem until
    /// the first success.
    pub async fn ensure_staging_dir(&self) -> Result<(), LifecycleError> {
        if self.prepared.load(Ordering::Acquire) {
            return Ok(());
        }
        self.prepare().await
    }

    /// Returns a fresh temp path: `temp_{platform}_{timestamp}_{random}`.
    ///
    /// Nothing is created on disk.
    pub fn allocate_temp_path(&self, platform: Platform) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let nonce: u32 = rand::rng().random();
        self.config
            .staging_dir
            .join(format!("{}{}_{}_{:08x}", TEMP_PREFIX, platform, stamp, nonce))
    }

    /// Final location of a request's artifact.
    pub fn final_path_for(&self, platform: Platform, request_id: &RequestId) -> PathBuf {
        self.config
            .staging_dir
            .join(format!("{}_{}.mp4", platform, request_id.short()))
    }

    /// Starts tracking `path` with the default TTL. The file is not touched.
    pub fn register(&self, path: impl Into<PathBuf>) -> FileId {
        self.register_with_ttl(path, self.config.ttl)
    }

    /// Starts tracking `path` with a custom TTL.
    pub fn register_with_ttl(&self, path: impl Into<PathBuf>, ttl: Duration) -> FileId {
        let id = FileId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = FileRecord {
            id,
            original_path: path.into(),
            renamed_path: None,
            created_at: SystemTime::now(),
            ttl,
        };
        tracing::debug!(file_id = %id, path = %record.original_path.display(), "Registered file");
        self.records.lock().insert(id, record);
        id
    }

    pub fn get(&self, id: FileId) -> Option<FileRecord> {
        self.records.lock().get(&id).cloned()
    }

    /// Number of files currently tracked.
    pub fn tracked(&self) -> usize {
        self.records.lock().len()
    }

    fn is_tracked_path(&self, path: &Path) -> bool {
        self.records.lock().values().any(|r| {
            r.original_path == path || r.renamed_path.as_deref() == Some(path)
        })
    }

    /// Atomically moves a finished temp file to its final path and returns
    /// its size. Empty files are refused and discarded.
    pub async fn promote(&self, temp: &Path, final_path: &Path) -> Result<u64, LifecycleError> {
        let size = tokio::fs::metadata(temp)
            .await
            .map_err(|source| LifecycleError::Io {
                path: temp.to_path_buf(),
                source,
            })?
            .len();

        if size == 0 {
            self.discard(temp).await;
            return Err(LifecycleError::EmptyFile(temp.to_path_buf()));
        }

        tokio::fs::rename(temp, final_path)
            .await
            .map_err(|source| LifecycleError::Move {
                from: temp.to_path_buf(),
                to: final_path.to_path_buf(),
                source,
            })?;
        Ok(size)
    }

    /// Deletes an untracked temp or partial file. Never fails.
    ///
    /// For temp paths, sibling artifacts an extractor derived from the same
    /// name (`.part`, `.ytdl`, per-format fragments) are removed as well.
    pub async fn discard(&self, path: &Path) -> bool {
        let mut removed = remove_quietly(path).await;

        let (Some(dir), Some(stem)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
            return removed;
        };
        if !stem.starts_with(TEMP_PREFIX) {
            return removed;
        }
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return removed;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let derived = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.len() > stem.len() && n.starts_with(stem));
            if derived {
                removed |= remove_quietly(&entry.path()).await;
            }
        }
        removed
    }

    /// Moves a tracked file and records the new location.
    pub async fn rename(&self, id: FileId, new_path: impl Into<PathBuf>) -> Result<PathBuf, LifecycleError> {
        let new_path = new_path.into();
        let current = self
            .get(id)
            .map(|r| r.current_path().to_path_buf())
            .ok_or(LifecycleError::UnknownFile(id.as_u64()))?;

        tokio::fs::rename(&current, &new_path)
            .await
            .map_err(|source| LifecycleError::Move {
                from: current.clone(),
                to: new_path.clone(),
                source,
            })?;

        if let Some(record) = self.records.lock().get_mut(&id) {
            record.renamed_path = Some(new_path.clone());
        }
        Ok(new_path)
    }

    /// Stops tracking `id` and deletes its file(s).
    ///
    /// Idempotent: releasing an unknown or already released id is a no-op.
    /// Returns whether a record was released.
    pub async fn release(&self, id: FileId) -> bool {
        let record = self.records.lock().remove(&id);
        match record {
            Some(record) => {
                delete_record_files(&record).await;
                tracing::debug!(file_id = %id, "Released file");
                true
            }
            None => {
                tracing::debug!(file_id = %id, "Release of unknown or already released file");
                false
            }
        }
    }

    /// Releases every tracked file. Used on shutdown.
    pub async fn release_all(&self) -> usize {
        let records: Vec<FileRecord> = self.records.lock().drain().map(|(_, r)| r).collect();
        for record in &records {
            delete_record_files(record).await;
        }
        if !records.is_empty() {
            tracing::info!(count = records.len(), "Released all tracked files");
        }
        records.len()
    }

    /// Runs one sweep against the current wall clock.
    pub async fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(SystemTime::now()).await
    }

    /// Runs one sweep as if the current time were `now`.
    ///
    /// Deletes tracked files older than their TTL, then untracked temp
    /// artifacts in the staging directory whose modification time is older
    /// than the configured TTL.
    pub async fn sweep_expired_at(&self, now: SystemTime) -> SweepReport {
        let expired: Vec<FileRecord> = {
            let mut records = self.records.lock();
            let ids: Vec<FileId> = records
                .values()
                .filter(|r| r.is_expired_at(now))
                .map(|r| r.id)
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };

        for record in &expired {
            delete_record_files(record).await;
        }

        let orphans = match self.sweep_orphans(now).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    dir = %self.config.staging_dir.display(),
                    error = %e,
                    "Orphan sweep failed"
                );
                0
            }
        };

        let report = SweepReport {
            expired: expired.len(),
            orphans,
        };
        if report.total() > 0 {
            tracing::info!(
                expired = report.expired,
                orphans = report.orphans,
                "Swept staging directory"
            );
        }
        report
    }

    async fn sweep_orphans(&self, now: SystemTime) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.config.staging_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !self.temp_patterns.iter().any(|p| p.matches(name)) {
                continue;
            }

            let path = entry.path();
            if self.is_tracked_path(&path) {
                continue;
            }

            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age > self.config.ttl && remove_quietly(&path).await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Spawns the periodic sweep. Stops when `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                interval_secs = manager.config.sweep_interval.as_secs(),
                ttl_secs = manager.config.ttl.as_secs(),
                "File sweeper started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        tracing::debug!("File sweeper stopping");
                        break;
                    }

                    _ = ticker.tick() => {
                        manager.sweep_expired().await;
                    }
                }
            }
        })
    }
}

async fn delete_record_files(record: &FileRecord) {
    if let Some(renamed) = &record.renamed_path {
        remove_quietly(renamed).await;
    }
    remove_quietly(&record.original_path).await;
}

async fn remove_quietly(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Deleted file");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> FileLifecycleManager {
        FileLifecycleManager::new(FileLifecycleConfig::default().with_staging_dir(dir.path()))
    }

    fn write(path: &Path, bytes: &[u8]) {
        std::fs::write(path, bytes).unwrap();
    }

    fn set_age(path: &Path, age: Duration) {
        let mtime = filetime::FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_mtime(path, mtime).unwrap();
    }

    #[tokio::test]
    async fn test_ensure_staging_dir_creates_nested_dir() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("a").join("b");
        let files = FileLifecycleManager::new(FileLifecycleConfig::default().with_staging_dir(&staging));

        files.ensure_staging_dir().await.unwrap();
        assert!(staging.is_dir());
        // second call is a no-op
        files.ensure_staging_dir().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_does_not_touch_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let path = dir.path().join("a.mp4");
        write(&path, b"data");

        let id = files.register(&path);

        assert!(path.exists());
        let record = files.get(id).unwrap();
        assert_eq!(record.original_path, path);
        assert_eq!(record.ttl, Duration::from_secs(DEFAULT_FILE_TTL_SECS));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let path = dir.path().join("a.mp4");
        write(&path, b"data");
        let id = files.register(&path);

        assert!(files.release(id).await);
        assert!(!path.exists());
        assert!(!files.release(id).await);
        assert_eq!(files.tracked(), 0);
    }

    #[tokio::test]
    async fn test_release_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let id = files.register(dir.path().join("never-written.mp4"));
        assert!(files.release(id).await);
    }

    #[tokio::test]
    async fn test_concurrent_release_deletes_once() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(manager(&dir));
        let path = dir.path().join("a.mp4");
        write(&path, b"data");
        let id = files.register(&path);

        let (a, b) = tokio::join!(files.release(id), files.release(id));
        assert!(a ^ b, "exactly one release should own the deletion");
    }

    #[tokio::test]
    async fn test_sweep_respects_ttl_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let path = dir.path().join("clip.mp4");
        write(&path, b"data");
        let id = files.register(&path);
        let t0 = files.get(id).unwrap().created_at;

        let report = files.sweep_expired_at(t0 + Duration::from_secs(3000)).await;
        assert_eq!(report.expired, 0);
        assert!(path.exists());

        let report = files.sweep_expired_at(t0 + Duration::from_secs(3601)).await;
        assert_eq!(report.expired, 1);
        assert!(!path.exists());
        assert!(files.get(id).is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_old_orphans_only() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);

        let old_temp = dir.path().join("temp_generic_20240101_000000_deadbeef");
        let fresh_temp = dir.path().join("temp_generic_20990101_000000_cafebabe");
        let old_fragment = dir.path().join("clip.f137.mp4.part");
        let unrelated = dir.path().join("keep-me.mp4");
        for p in [&old_temp, &fresh_temp, &old_fragment, &unrelated] {
            write(p, b"x");
        }
        let two_hours = Duration::from_secs(7200);
        set_age(&old_temp, two_hours);
        set_age(&old_fragment, two_hours);
        set_age(&unrelated, two_hours);

        let report = files.sweep_expired().await;

        assert_eq!(report.orphans, 2);
        assert!(!old_temp.exists());
        assert!(!old_fragment.exists());
        assert!(fresh_temp.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_promote_moves_and_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let temp = files.allocate_temp_path(Platform::YouTube);
        write(&temp, &[7u8; 1234]);
        let final_path = files.final_path_for(Platform::YouTube, &RequestId::new());

        let size = files.promote(&temp, &final_path).await.unwrap();

        assert_eq!(size, 1234);
        assert!(!temp.exists());
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn test_promote_refuses_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let temp = files.allocate_temp_path(Platform::Generic);
        write(&temp, b"");

        let err = files.promote(&temp, &dir.path().join("out.mp4")).await;

        assert!(matches!(err, Err(LifecycleError::EmptyFile(_))));
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_discard_removes_derived_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let temp = files.allocate_temp_path(Platform::YouTube);
        let name = temp.file_name().unwrap().to_str().unwrap().to_string();
        write(&temp, b"partial");
        write(&dir.path().join(format!("{}.part", name)), b"x");
        write(&dir.path().join(format!("{}.f137.mp4", name)), b"x");
        let unrelated = dir.path().join("youtube_keep.mp4");
        write(&unrelated, b"keep");

        assert!(files.discard(&temp).await);

        let left: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(left.len(), 1);
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_rename_tracks_new_path_and_release_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let path = dir.path().join("a.mp4");
        write(&path, b"data");
        let id = files.register(&path);

        let renamed = files.rename(id, dir.path().join("My Video.mp4")).await.unwrap();

        assert!(!path.exists());
        assert!(renamed.exists());
        assert_eq!(files.get(id).unwrap().current_path(), renamed.as_path());

        files.release(id).await;
        assert!(!renamed.exists());
    }

    #[tokio::test]
    async fn test_rename_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let err = files.rename(FileId(99), dir.path().join("x")).await;
        assert!(matches!(err, Err(LifecycleError::UnknownFile(99))));
    }

    #[tokio::test]
    async fn test_temp_paths_are_unique_and_match_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let a = files.allocate_temp_path(Platform::Kuaishou);
        let b = files.allocate_temp_path(Platform::Kuaishou);
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("temp_kuaishou_"));
        assert!(a.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_release_all() {
        let dir = tempfile::tempdir().unwrap();
        let files = manager(&dir);
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("{}.mp4", i))).collect();
        for p in &paths {
            write(p, b"x");
            files.register(p);
        }

        assert_eq!(files.release_all().await, 3);
        assert!(paths.iter().all(|p| !p.exists()));
        assert_eq!(files.tracked(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FileLifecycleManager::new(
            FileLifecycleConfig::default()
                .with_staging_dir(dir.path())
                .with_sweep_interval(Duration::from_millis(20)),
        ));
        let path = dir.path().join("short-lived.mp4");
        write(&path, b"x");
        files.register_with_ttl(&path, Duration::ZERO);

        let cancel = CancellationToken::new();
        let handle = files.spawn_sweeper(cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!path.exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_prepare_creates_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let files = FileLifecycleManager::new(FileLifecycleConfig::default().with_staging_dir(&nested));
        files.prepare().await.unwrap();
        assert!(nested.is_dir());
    }
}
