// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use arbiter_types::ArbiterError;

/// Host operations outside any filesystem plugin. Methods may block.
pub trait HostSystem: Send + Sync {
    /// Where `device` is mounted right now, according to the kernel.
    fn mount_point_of(&self, device: &Path) -> Result<Option<PathBuf>, ArbiterError>;

    /// Pids of processes holding files open under `path`.
    fn processes_using(&self, path: &Path) -> Vec<i32>;

    fn eject(&self, device: &Path, force: bool) -> Result<(), ArbiterError>;

    /// Uid of the user logged in at the console, if any.
    fn console_user(&self) -> Option<u32>;
}
