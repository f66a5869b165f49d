// SPDX-License-Identifier: GPL-3.0-only

//! Mount point allocation under the mount base directory

use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use arbiter_types::ArbiterError;

/// Marker left in every directory the daemon creates. Only directories that
/// carry it are removed again after unmount.
pub const SENTINEL_FILE: &str = ".autodiskmounted";

pub const DEFAULT_VOLUME_NAME: &str = "Untitled";

/// Highest numeric suffix tried before giving up.
pub const MAX_SUFFIX: u32 = 99;

/// Turn a volume name into a single path component.
pub fn sanitize_name(name: Option<&str>) -> String {
    let name = name.map(str::trim).unwrap_or_default().replace('/', ":");
    match name.as_str() {
        "" | "." | ".." => DEFAULT_VOLUME_NAME.to_string(),
        _ => name,
    }
}

/// Create a fresh mount point for `name` under `base`.
///
/// Tries `<base>/<name>`, then `<base>/<name> 1` up to `<base>/<name> 99`.
/// Directory creation is the arbiter, so concurrent callers never receive the
/// same path.
pub fn allocate(base: &Path, name: &str) -> Result<PathBuf, ArbiterError> {
    fs::create_dir_all(base)?;

    for suffix in 0..=MAX_SUFFIX {
        let candidate = if suffix == 0 {
            base.join(name)
        } else {
            base.join(format!("{name} {suffix}"))
        };

        match fs::create_dir(&candidate) {
            Ok(()) => {
                if let Err(e) = write_sentinel(&candidate) {
                    let _ = fs::remove_dir(&candidate);
                    return Err(e.into());
                }
                tracing::debug!("Allocated mount point {}", candidate.display());
                return Ok(candidate);
            }
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(ArbiterError::no_resources(format!(
        "no free mount point for \"{name}\" under {}",
        base.display()
    )))
}

fn write_sentinel(dir: &Path) -> std::io::Result<()> {
    let mut file = fs::File::create(dir.join(SENTINEL_FILE))?;
    writeln!(
        file,
        "{} {}",
        std::process::id(),
        chrono::Utc::now().to_rfc3339()
    )
}

pub fn is_daemon_owned(dir: &Path) -> bool {
    dir.join(SENTINEL_FILE).is_file()
}

/// Remove a mount point the daemon created. Anything else is left alone.
pub fn release(dir: &Path) {
    if !is_daemon_owned(dir) {
        return;
    }
    let removed = fs::remove_file(dir.join(SENTINEL_FILE)).and_then(|_| fs::remove_dir(dir));
    match removed {
        Ok(()) => tracing::debug!("Removed mount point {}", dir.display()),
        Err(e) => tracing::warn!("Failed to remove mount point {}: {}", dir.display(), e),
    }
}
