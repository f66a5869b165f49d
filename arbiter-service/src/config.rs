// SPDX-License-Identifier: GPL-3.0-only

//! Persisted configuration
//!
//! Three sources feed the engine: the TOML preference file and the two mount
//! maps. Each is a [`WatchedSource`] that reloads only when the file's
//! modification time moves, so the engine can cheaply refresh on every pass.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use arbiter_types::{DiskDescription, MountMapEntry};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::mount_map::{self, MapLookup, VolInfoEntry};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/disk-arbiter/arbiter.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Directory new mount points are created under
    pub mount_base: PathBuf,

    /// Seconds of idleness before the daemon exits (with `exit_on_idle`)
    pub idle_timeout_secs: u64,

    pub exit_on_idle: bool,

    /// Seconds a removed disk with outstanding work is kept around
    pub zombie_timeout_secs: u64,

    /// Busy period applied to newly discovered devices, in milliseconds
    pub settle_ms: u64,

    /// Maximum number of concurrent worker threads
    pub worker_limit: usize,

    pub auto_mount: bool,

    /// Defer automatic mounts of external media until someone is logged in
    pub defer_external: bool,

    pub trust_external: bool,

    pub trust_removable: bool,

    pub removable_read_only: bool,

    /// Device discovery rescan interval, in milliseconds
    pub poll_interval_ms: u64,

    /// fstab-style mount map
    pub fstab_path: PathBuf,

    /// `<uuid> <options>` permission map
    pub volinfo_path: PathBuf,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            mount_base: PathBuf::from("/media"),
            idle_timeout_secs: 30,
            exit_on_idle: false,
            zombie_timeout_secs: 10,
            settle_ms: 1000,
            worker_limit: 16,
            auto_mount: true,
            defer_external: false,
            trust_external: true,
            trust_removable: false,
            removable_read_only: false,
            poll_interval_ms: 2000,
            fstab_path: PathBuf::from("/etc/disk-arbiter/fstab"),
            volinfo_path: PathBuf::from("/var/lib/disk-arbiter/volinfo"),
        }
    }
}

impl Preferences {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let preferences: Preferences = toml::from_str(raw).map_err(|e| e.to_string())?;
        preferences.validate().map_err(|e| e.to_string())?;
        Ok(preferences)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.mount_base.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "mount_base must be absolute, got {}",
                self.mount_base.display()
            )));
        }
        if self.worker_limit == 0 {
            return Err(ConfigError::Invalid(
                "worker_limit must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn zombie_timeout(&self) -> Duration {
        Duration::from_secs(self.zombie_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Command line values that win over the preference file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub mount_base: Option<PathBuf>,
    pub exit_on_idle: Option<bool>,
}

impl Overrides {
    fn apply(&self, preferences: &mut Preferences) {
        if let Some(mount_base) = &self.mount_base {
            preferences.mount_base = mount_base.clone();
        }
        if let Some(exit_on_idle) = self.exit_on_idle {
            preferences.exit_on_idle = exit_on_idle;
        }
    }
}

/// A parsed file that is re-read only when its modification time changes.
///
/// A missing file reads as `T::default()`. A file that fails to parse keeps
/// the previous value until it is modified again.
pub struct WatchedSource<T> {
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
    value: T,
    parse: fn(&str) -> Result<T, String>,
}

impl<T: Default> WatchedSource<T> {
    pub fn new(path: impl Into<PathBuf>, parse: fn(&str) -> Result<T, String>) -> Self {
        Self {
            path: Some(path.into()),
            modified: None,
            value: T::default(),
            parse,
        }
    }

    /// A source with no backing file.
    pub fn fixed(value: T) -> Self {
        Self {
            path: None,
            modified: None,
            value,
            parse: |_| Ok(T::default()),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reload if the file changed. Returns whether the value was replaced.
    pub fn refresh(&mut self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };

        let modified = match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => {
                if self.modified.take().is_some() {
                    tracing::info!("{} was removed, using defaults", path.display());
                    self.value = T::default();
                    return true;
                }
                return false;
            }
        };

        if self.modified == Some(modified) {
            return false;
        }
        self.modified = Some(modified);

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                return false;
            }
        };
        match (self.parse)(&raw) {
            Ok(value) => {
                tracing::debug!("Reloaded {}", path.display());
                self.value = value;
                true
            }
            Err(reason) => {
                tracing::warn!("Ignoring invalid {}: {}", path.display(), reason);
                false
            }
        }
    }
}

/// Every persisted input the engine consults.
pub struct ConfigStore {
    preferences: WatchedSource<Preferences>,
    overrides: Overrides,
    effective: Preferences,
    fstab: WatchedSource<Vec<MountMapEntry>>,
    volinfo: WatchedSource<Vec<VolInfoEntry>>,
}

impl ConfigStore {
    /// Open the preference file at `path` and the maps it names.
    ///
    /// Unlike later reloads, an unreadable or invalid preference file is an
    /// error here so a broken install fails at startup.
    pub fn open(path: impl Into<PathBuf>, overrides: Overrides) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut initial = match fs::read_to_string(&path) {
            Ok(raw) => Preferences::parse(&raw).map_err(|reason| ConfigError::Parse {
                path: path.clone(),
                reason,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No preference file at {}, using defaults", path.display());
                Preferences::default()
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        overrides.apply(&mut initial);
        initial.validate()?;

        let mut store = Self {
            preferences: WatchedSource::new(&path, Preferences::parse),
            overrides,
            effective: initial.clone(),
            fstab: WatchedSource::new(&initial.fstab_path, |raw| {
                Ok(mount_map::parse_fstab(raw))
            }),
            volinfo: WatchedSource::new(&initial.volinfo_path, |raw| {
                Ok(mount_map::parse_volinfo(raw))
            }),
        };
        store.refresh();
        Ok(store)
    }

    /// A store with no backing files.
    pub fn fixed(
        preferences: Preferences,
        fstab: Vec<MountMapEntry>,
        volinfo: Vec<VolInfoEntry>,
    ) -> Self {
        Self {
            effective: preferences.clone(),
            preferences: WatchedSource::fixed(preferences),
            overrides: Overrides::default(),
            fstab: WatchedSource::fixed(fstab),
            volinfo: WatchedSource::fixed(volinfo),
        }
    }

    pub fn preferences(&self) -> &Preferences {
        &self.effective
    }

    /// Re-read whichever sources changed on disk.
    pub fn refresh(&mut self) -> bool {
        let mut changed = false;
        if self.preferences.refresh() {
            let mut effective = self.preferences.get().clone();
            self.overrides.apply(&mut effective);
            self.effective = effective;
            changed = true;
        }
        changed |= self.fstab.refresh();
        changed |= self.volinfo.refresh();
        changed
    }

    pub fn lookup(&self, description: &DiskDescription) -> MapLookup {
        mount_map::lookup(self.fstab.get(), self.volinfo.get(), description)
    }
}
