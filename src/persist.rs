//! Crash-safe storage of configuration received from the cloud.
//!
//! A configuration file is never written in place. New content is staged in
//! `<path>.new`, the current file is moved to `<path>.old`, and the staged
//! file is renamed onto `<path>`. If that last rename fails, the backup is
//! moved back. Readers of `<path>` therefore see either the previous or the
//! new content in full.
//!
//! A [`ConfigWriter`] keeps the primary copy and a throttled "static" copy.
//! Its methods take `&mut self`, so one writer serializes its own saves.
//! Two writers must not be pointed at the same paths at the same time.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use thiserror::Error;

const STAGING_SUFFIX: &str = ".new";
const BACKUP_SUFFIX: &str = ".old";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("empty gateway configuration")]
    Empty,
    #[error("failed to save configuration into {}: {source}", .path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "failed to move configuration from {} to {}: {source}",
        .from.display(),
        .to.display()
    )]
    Publish {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
        state: SwapState,
    },
}

/// Filesystem operations used by the swap, replaceable for fault injection.
pub trait FileSystem {
    /// # Errors
    ///
    /// Returns an error if `path` cannot be read.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Creates or truncates `path` and writes `contents` durably.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// # Errors
    ///
    /// Returns an error if `from` cannot be renamed to `to`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// # Errors
    ///
    /// Returns an error if `path` does not exist or has no modification time.
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;
}

/// The local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFs;

impl FileSystem for StdFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)?;
        sync_parent(to);
        Ok(())
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(path)?.modified()
    }
}

fn sync_parent(path: &Path) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!("Failed to sync directory {}: {e}", dir.display());
    }
}

/// Outcome of restoring the backup after a failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// No backup was taken, so the target is missing.
    NoBackup,
    Restored,
    Failed,
}

/// Progress of one atomic replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    /// New content sits in the staging file. `backed_up` tells whether the
    /// previous target was moved to the backup path.
    Staged { backed_up: bool },
    Published,
    RolledBack(Rollback),
}

/// The target path of a swap and its staging and backup siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPaths {
    pub target: PathBuf,
    pub staging: PathBuf,
    pub backup: PathBuf,
}

impl SwapPaths {
    #[must_use]
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            staging: with_suffix(target, STAGING_SUFFIX),
            backup: with_suffix(target, BACKUP_SUFFIX),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Stage-then-rename replacement of a single file.
#[derive(Debug)]
pub struct AtomicSwap<'a, F: ?Sized> {
    fs: &'a F,
    paths: SwapPaths,
}

impl<'a, F: FileSystem + ?Sized> AtomicSwap<'a, F> {
    #[must_use]
    pub fn new(fs: &'a F, target: &Path) -> Self {
        Self {
            fs,
            paths: SwapPaths::new(target),
        }
    }

    #[must_use]
    pub fn paths(&self) -> &SwapPaths {
        &self.paths
    }

    /// Writes `contents` to the staging file, then moves the current target
    /// aside as a backup if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging file cannot be written. The target is
    /// untouched in that case.
    pub fn stage(&self, contents: &[u8]) -> Result<SwapState, PersistError> {
        self.fs
            .write(&self.paths.staging, contents)
            .map_err(|source| PersistError::Stage {
                path: self.paths.staging.clone(),
                source,
            })?;

        let backed_up = match self.fs.rename(&self.paths.target, &self.paths.backup) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    "No backup of {} taken: {e}",
                    self.paths.target.display()
                );
                false
            }
        };
        Ok(SwapState::Staged { backed_up })
    }

    /// Renames the staged file onto the target. On failure the backup, if
    /// any, is moved back before the error is returned.
    ///
    /// States other than [`SwapState::Staged`] are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged file cannot be moved onto the target,
    /// whether or not the rollback succeeded.
    pub fn publish(&self, state: SwapState) -> Result<SwapState, PersistError> {
        let SwapState::Staged { backed_up } = state else {
            return Ok(state);
        };

        let Err(source) = self.fs.rename(&self.paths.staging, &self.paths.target) else {
            return Ok(SwapState::Published);
        };

        let rollback = if backed_up {
            match self.fs.rename(&self.paths.backup, &self.paths.target) {
                Ok(()) => Rollback::Restored,
                Err(e) => {
                    tracing::error!(
                        "Failed to restore {} from {}: {e}",
                        self.paths.target.display(),
                        self.paths.backup.display()
                    );
                    Rollback::Failed
                }
            }
        } else {
            Rollback::NoBackup
        };

        Err(PersistError::Publish {
            from: self.paths.staging.clone(),
            to: self.paths.target.clone(),
            source,
            state: SwapState::RolledBack(rollback),
        })
    }

    /// Stages and publishes `contents`.
    ///
    /// # Errors
    ///
    /// Returns an error if staging or publishing fails.
    pub fn run(&self, contents: &[u8]) -> Result<(), PersistError> {
        let staged = self.stage(contents)?;
        self.publish(staged).map(|_| ())
    }
}

/// Result of a throttled static-copy update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticUpdate {
    /// The static copy is turned off by a non-positive interval.
    Disabled,
    /// The static copy is newer than the interval.
    Skipped,
    Written,
}

/// Persists configuration to the primary path and a throttled static path.
#[derive(Debug)]
pub struct ConfigWriter<F = StdFs> {
    fs: F,
    config_path: PathBuf,
    static_config_path: PathBuf,
    static_update_interval: Option<Duration>,
}

impl ConfigWriter<StdFs> {
    /// Creates a writer on the local filesystem. A non-positive
    /// `static_update_interval_min` disables the static copy.
    #[must_use]
    pub fn new(
        config_path: impl Into<PathBuf>,
        static_config_path: impl Into<PathBuf>,
        static_update_interval_min: i64,
    ) -> Self {
        Self::with_fs(
            StdFs,
            config_path,
            static_config_path,
            static_update_interval_min,
        )
    }
}

impl<F: FileSystem> ConfigWriter<F> {
    #[must_use]
    pub fn with_fs(
        fs: F,
        config_path: impl Into<PathBuf>,
        static_config_path: impl Into<PathBuf>,
        static_update_interval_min: i64,
    ) -> Self {
        let static_update_interval = u64::try_from(static_update_interval_min)
            .ok()
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)));
        Self {
            fs,
            config_path: config_path.into(),
            static_config_path: static_config_path.into(),
            static_update_interval,
        }
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    #[must_use]
    pub fn static_config_path(&self) -> &Path {
        &self.static_config_path
    }

    /// Replaces the primary configuration with `config`.
    ///
    /// When `read_old` is set, returns the previous content, or an empty
    /// vector if there was none or it could not be read. Otherwise returns
    /// an empty vector.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is empty, or if it could not be staged
    /// or published.
    pub fn save_config(&mut self, config: &[u8], read_old: bool) -> Result<Vec<u8>, PersistError> {
        if config.is_empty() {
            return Err(PersistError::Empty);
        }

        let old = if read_old {
            self.fs.read(&self.config_path).unwrap_or_default()
        } else {
            Vec::new()
        };

        AtomicSwap::new(&self.fs, &self.config_path).run(config)?;
        tracing::info!(
            "Successfully updated configuration in {}",
            self.config_path.display()
        );
        Ok(old)
    }

    /// Replaces the static configuration with `config` if the static file is
    /// missing or older than the update interval.
    ///
    /// # Errors
    ///
    /// Returns an error if updates are enabled and `config` is empty, or if a
    /// due update could not be staged or published.
    pub fn maybe_update_static(&mut self, config: &[u8]) -> Result<StaticUpdate, PersistError> {
        let Some(interval) = self.static_update_interval else {
            return Ok(StaticUpdate::Disabled);
        };
        if config.is_empty() {
            return Err(PersistError::Empty);
        }

        let due = match self.fs.modified(&self.static_config_path) {
            Ok(modified) => modified
                .checked_add(interval)
                .is_none_or(|expiry| expiry < SystemTime::now()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::debug!(
                    "Cannot stat {}: {e}",
                    self.static_config_path.display()
                );
                false
            }
        };
        if !due {
            return Ok(StaticUpdate::Skipped);
        }

        AtomicSwap::new(&self.fs, &self.static_config_path).run(config)?;
        tracing::info!(
            "Updated static configuration in {}",
            self.static_config_path.display()
        );
        Ok(StaticUpdate::Written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::tempdir;

    use super::*;

    /// Delegates to the local filesystem with configurable failures.
    #[derive(Default)]
    struct FaultyFs {
        fail_writes: bool,
        fail_renames_from: Option<PathBuf>,
        modified: Option<SystemTime>,
        writes: Mutex<Vec<PathBuf>>,
    }

    impl FileSystem for FaultyFs {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            StdFs.read(path)
        }

        fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            self.writes
                .lock()
                .expect("write log")
                .push(path.to_path_buf());
            StdFs.write(path, contents)
        }

        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            if self.fail_renames_from.as_deref() == Some(from) {
                return Err(io::Error::other("injected rename failure"));
            }
            StdFs.rename(from, to)
        }

        fn modified(&self, path: &Path) -> io::Result<SystemTime> {
            match self.modified {
                Some(time) => Ok(time),
                None => StdFs.modified(path),
            }
        }
    }

    #[test]
    fn save_then_read_returns_exact_bytes() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        let mut writer = ConfigWriter::new(&path, dir.path().join("static.mconfig"), 0);

        let old = writer
            .save_config(b"{\"configs_by_key\":{}}", false)
            .expect("save config");

        assert!(old.is_empty());
        assert_eq!(
            fs::read(&path).expect("read config"),
            b"{\"configs_by_key\":{}}"
        );
        assert!(!SwapPaths::new(&path).staging.exists());
    }

    #[test]
    fn second_save_returns_previous_content() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        let mut writer = ConfigWriter::new(&path, dir.path().join("static.mconfig"), 0);

        let first = writer.save_config(b"first", true).expect("first save");
        let second = writer.save_config(b"second", true).expect("second save");

        assert!(first.is_empty());
        assert_eq!(second, b"first");
        assert_eq!(fs::read(&path).expect("read config"), b"second");
        assert_eq!(
            fs::read(SwapPaths::new(&path).backup).expect("read backup"),
            b"first"
        );
    }

    #[test]
    fn empty_config_is_rejected_without_touching_disk() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        fs::write(&path, b"current").expect("seed config");
        let mut writer = ConfigWriter::with_fs(
            FaultyFs::default(),
            &path,
            dir.path().join("static.mconfig"),
            30,
        );

        assert!(matches!(
            writer.save_config(b"", true),
            Err(PersistError::Empty)
        ));
        assert!(matches!(
            writer.maybe_update_static(b""),
            Err(PersistError::Empty)
        ));
        assert!(writer.fs.writes.lock().expect("write log").is_empty());
        assert_eq!(fs::read(&path).expect("read config"), b"current");
    }

    #[test]
    fn staging_failure_leaves_primary_unchanged() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        fs::write(&path, b"current").expect("seed config");
        let faulty = FaultyFs {
            fail_writes: true,
            ..FaultyFs::default()
        };
        let mut writer = ConfigWriter::with_fs(faulty, &path, dir.path().join("static.mconfig"), 0);

        let err = writer
            .save_config(b"next", false)
            .expect_err("staging must fail");

        assert!(matches!(err, PersistError::Stage { .. }));
        assert_eq!(fs::read(&path).expect("read config"), b"current");
        assert!(!SwapPaths::new(&path).backup.exists());
    }

    #[test]
    fn staging_failure_on_real_filesystem_leaves_primary_unchanged() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        fs::write(&path, b"current").expect("seed config");
        // A directory in place of the staging file makes the write fail.
        fs::create_dir(SwapPaths::new(&path).staging).expect("block staging path");
        let mut writer = ConfigWriter::new(&path, dir.path().join("static.mconfig"), 0);

        assert!(matches!(
            writer.save_config(b"next", false),
            Err(PersistError::Stage { .. })
        ));
        assert_eq!(fs::read(&path).expect("read config"), b"current");
    }

    #[test]
    fn publish_failure_restores_previous_content() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        fs::write(&path, b"current").expect("seed config");
        let faulty = FaultyFs {
            fail_renames_from: Some(SwapPaths::new(&path).staging),
            ..FaultyFs::default()
        };
        let mut writer = ConfigWriter::with_fs(faulty, &path, dir.path().join("static.mconfig"), 0);

        let err = writer
            .save_config(b"next", false)
            .expect_err("publish must fail");

        assert!(matches!(
            err,
            PersistError::Publish {
                state: SwapState::RolledBack(Rollback::Restored),
                ..
            }
        ));
        assert_eq!(fs::read(&path).expect("read config"), b"current");
    }

    #[test]
    fn publish_failure_without_backup_leaves_target_missing() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        let faulty = FaultyFs {
            fail_renames_from: Some(SwapPaths::new(&path).staging),
            ..FaultyFs::default()
        };
        let swap = AtomicSwap::new(&faulty, &path);

        let staged = swap.stage(b"next").expect("stage");
        assert_eq!(staged, SwapState::Staged { backed_up: false });
        assert!(matches!(
            swap.publish(staged),
            Err(PersistError::Publish {
                state: SwapState::RolledBack(Rollback::NoBackup),
                ..
            })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn failed_rollback_is_reported() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("gateway.mconfig");
        fs::write(&path, b"current").expect("seed config");
        let paths = SwapPaths::new(&path);
        let faulty = FaultyFs {
            fail_renames_from: Some(paths.staging.clone()),
            ..FaultyFs::default()
        };
        let swap = AtomicSwap::new(&faulty, &path);

        let staged = swap.stage(b"next").expect("stage");
        fs::remove_file(&paths.backup).expect("remove backup");

        assert!(matches!(
            swap.publish(staged),
            Err(PersistError::Publish {
                state: SwapState::RolledBack(Rollback::Failed),
                ..
            })
        ));
    }

    #[test]
    fn publish_leaves_finished_states_alone() {
        let faulty = FaultyFs::default();
        let swap = AtomicSwap::new(&faulty, Path::new("unused.mconfig"));
        assert_eq!(
            swap.publish(SwapState::Published).expect("no-op"),
            SwapState::Published
        );
    }

    #[test]
    fn static_copy_is_throttled_by_modification_time() {
        let dir = tempdir().expect("temp dir");
        let static_path = dir.path().join("static.mconfig");
        let mut writer = ConfigWriter::new(dir.path().join("gateway.mconfig"), &static_path, 1);

        assert_eq!(
            writer.maybe_update_static(b"first").expect("first update"),
            StaticUpdate::Written
        );
        assert_eq!(
            writer.maybe_update_static(b"second").expect("second update"),
            StaticUpdate::Skipped
        );
        assert_eq!(fs::read(&static_path).expect("read static"), b"first");

        let stale = SystemTime::now() - Duration::from_secs(120);
        File::options()
            .write(true)
            .open(&static_path)
            .expect("open static")
            .set_modified(stale)
            .expect("age static file");

        assert_eq!(
            writer.maybe_update_static(b"third").expect("third update"),
            StaticUpdate::Written
        );
        assert_eq!(fs::read(&static_path).expect("read static"), b"third");
    }

    #[test]
    fn static_copy_uses_injected_modification_time() {
        let dir = tempdir().expect("temp dir");
        let static_path = dir.path().join("static.mconfig");
        fs::write(&static_path, b"old").expect("seed static");

        let fresh = FaultyFs {
            modified: Some(SystemTime::now()),
            ..FaultyFs::default()
        };
        let mut writer =
            ConfigWriter::with_fs(fresh, dir.path().join("gateway.mconfig"), &static_path, 30);
        assert_eq!(
            writer.maybe_update_static(b"new").expect("fresh update"),
            StaticUpdate::Skipped
        );

        let stale = FaultyFs {
            modified: Some(SystemTime::now() - Duration::from_secs(31 * 60)),
            ..FaultyFs::default()
        };
        let mut writer =
            ConfigWriter::with_fs(stale, dir.path().join("gateway.mconfig"), &static_path, 30);
        assert_eq!(
            writer.maybe_update_static(b"new").expect("stale update"),
            StaticUpdate::Written
        );
        assert_eq!(fs::read(&static_path).expect("read static"), b"new");
    }

    #[test]
    fn zero_interval_never_creates_static_copy() {
        let dir = tempdir().expect("temp dir");
        let static_path = dir.path().join("static.mconfig");

        for interval in [0, -5] {
            let mut writer =
                ConfigWriter::new(dir.path().join("gateway.mconfig"), &static_path, interval);
            assert_eq!(
                writer.maybe_update_static(b"config").expect("disabled update"),
                StaticUpdate::Disabled
            );
            assert_eq!(
                writer.maybe_update_static(b"").expect("disabled empty update"),
                StaticUpdate::Disabled
            );
        }
        assert!(!static_path.exists());
        assert!(!SwapPaths::new(&static_path).staging.exists());
    }

    #[test]
    fn swap_paths_append_suffixes() {
        let paths = SwapPaths::new(Path::new("/var/opt/magma/configs/gateway.mconfig"));
        assert_eq!(
            paths.staging,
            PathBuf::from("/var/opt/magma/configs/gateway.mconfig.new")
        );
        assert_eq!(
            paths.backup,
            PathBuf::from("/var/opt/magma/configs/gateway.mconfig.old")
        );
    }
}
