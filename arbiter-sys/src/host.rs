// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use arbiter_contracts::HostSystem;
use arbiter_types::ArbiterError;

use crate::error::SysError;
use crate::mounts::{mount_point_for, read_mountinfo};
use crate::process_finder::holders_of;

/// First uid handed to regular (non-system) accounts.
const FIRST_LOGIN_UID: u32 = 1000;

/// Host surface backed by procfs, `/run/user` and `eject(1)`.
pub struct LinuxHost {
    run_user_dir: PathBuf,
}

impl LinuxHost {
    pub fn new() -> Self {
        Self {
            run_user_dir: PathBuf::from("/run/user"),
        }
    }

    pub fn with_run_user_dir(run_user_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_user_dir: run_user_dir.into(),
        }
    }
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSystem for LinuxHost {
    fn mount_point_of(&self, device: &Path) -> Result<Option<PathBuf>, ArbiterError> {
        let entries = read_mountinfo()?;
        Ok(mount_point_for(&entries, device))
    }

    fn processes_using(&self, path: &Path) -> Vec<i32> {
        match holders_of(path) {
            Ok(holders) => holders.into_iter().map(|holder| holder.pid).collect(),
            Err(e) => {
                tracing::warn!("Process lookup under {} failed: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    fn eject(&self, device: &Path, force: bool) -> Result<(), ArbiterError> {
        let tool = which::which("eject").map_err(|_| SysError::ToolMissing("eject".into()))?;
        let mut command = Command::new(tool);
        if force {
            command.arg("--force");
        }
        let output = command.arg(device).output().map_err(SysError::from)?;
        if output.status.success() {
            tracing::info!("Ejected {}", device.display());
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("busy") {
            return Err(ArbiterError::busy(stderr));
        }
        Err(SysError::CommandFailed {
            command: format!("eject {}", device.display()),
            stderr,
        }
        .into())
    }

    fn console_user(&self) -> Option<u32> {
        // A logind runtime directory exists for every user with a live session.
        let entries = fs::read_dir(&self.run_user_dir).ok()?;
        entries
            .flatten()
            .filter_map(|entry| {
                let uid: u32 = entry.file_name().to_str()?.parse().ok()?;
                let owner = entry.metadata().ok()?.uid();
                (uid >= FIRST_LOGIN_UID && owner == uid).then_some(uid)
            })
            .min()
    }
}
