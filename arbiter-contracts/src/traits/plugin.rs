// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use arbiter_types::{ArbiterError, ProbeOutcome};

/// A filesystem-format recognizer and mounter.
///
/// Every method blocks; the engine only calls them from worker threads.
pub trait FilesystemPlugin: Send + Sync {
    /// Filesystem kind this plugin handles (e.g. "vfat").
    fn kind(&self) -> &str;

    /// Recognize the volume on `device`.
    ///
    /// `UnsupportedOperation` means "not this format"; any other error is a
    /// failure to read the device.
    fn probe(&self, device: &Path) -> Result<ProbeOutcome, ArbiterError>;

    fn repair(&self, device: &Path) -> Result<(), ArbiterError> {
        Err(ArbiterError::unsupported(format!(
            "{} cannot repair {}",
            self.kind(),
            device.display()
        )))
    }

    fn mount(
        &self,
        device: &Path,
        mount_point: &Path,
        options: &[String],
    ) -> Result<(), ArbiterError>;

    fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), ArbiterError>;

    fn rename(&self, device: &Path, mount_point: &Path, name: &str) -> Result<(), ArbiterError> {
        let _ = (mount_point, name);
        Err(ArbiterError::unsupported(format!(
            "{} cannot rename {}",
            self.kind(),
            device.display()
        )))
    }
}
