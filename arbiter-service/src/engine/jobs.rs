// SPDX-License-Identifier: GPL-3.0-only

//! Blocking work handed to the worker bridge
//!
//! Everything here runs off the loop and only sees owned snapshots of engine
//! state. Results flow back through the bridge callbacks in `stages` and
//! `request::commit`.

use std::path::PathBuf;
use std::sync::Arc;

use arbiter_contracts::{FilesystemPlugin, HostSystem};
use arbiter_types::{ArbiterError, DiskDescription, Dissenter};

use crate::policy::{MountPlan, mount_path};
use crate::probe::{ProbeReport, ProbeSequencer};

/// Result of probing plus the live mount state read alongside it.
pub(crate) struct Probed {
    pub report: ProbeReport,
    pub mount_point: Option<PathBuf>,
}

pub(crate) fn probe_volume(
    sequencer: &ProbeSequencer,
    host: &dyn HostSystem,
    description: &DiskDescription,
) -> Probed {
    let report = sequencer.probe(description);
    let mount_point = match host.mount_point_of(&description.device_path) {
        Ok(mount_point) => mount_point,
        Err(e) => {
            tracing::warn!(
                "Could not read mount state of {}: {}",
                description.device_path.display(),
                e
            );
            None
        }
    };
    Probed {
        report,
        mount_point,
    }
}

#[derive(Debug)]
pub(crate) struct Mounted {
    pub path: PathBuf,
    pub created_dir: bool,
    pub repaired: bool,
}

pub(crate) struct MountJob {
    pub plugin: Arc<dyn FilesystemPlugin>,
    pub host: Arc<dyn HostSystem>,
    pub device: PathBuf,
    pub plan: MountPlan,
    /// Run the plugin's repair first; a failed repair mounts read-only
    pub repair: bool,
}

impl MountJob {
    pub fn run(self) -> Result<Mounted, ArbiterError> {
        let mut options = self.plan.options;
        let mut repaired = false;
        if self.repair {
            match self.plugin.repair(&self.device) {
                Ok(()) => repaired = true,
                Err(e) => {
                    tracing::warn!(
                        "Repair of {} failed, mounting read-only: {}",
                        self.device.display(),
                        e
                    );
                    options.retain(|option| option != "rw" && option != "ro");
                    options.insert(0, "ro".to_string());
                }
            }
        }

        let (path, created_dir) = self.plan.target.prepare()?;
        match self.plugin.mount(&self.device, &path, &options) {
            Ok(()) => Ok(Mounted {
                path,
                created_dir,
                repaired,
            }),
            Err(err) => {
                // The kernel is the authority on whether the mount happened
                if let Ok(Some(actual)) = self.host.mount_point_of(&self.device)
                    && actual == path
                {
                    tracing::info!(
                        "{} is mounted at {} despite: {}",
                        self.device.display(),
                        path.display(),
                        err
                    );
                    return Ok(Mounted {
                        path,
                        created_dir,
                        repaired,
                    });
                }
                if created_dir {
                    mount_path::release(&path);
                }
                Err(err)
            }
        }
    }
}

pub(crate) struct UnmountJob {
    pub plugin: Arc<dyn FilesystemPlugin>,
    pub host: Arc<dyn HostSystem>,
    pub device: PathBuf,
    pub path: PathBuf,
    pub force: bool,
}

impl UnmountJob {
    pub fn run(self) -> Result<(), Dissenter> {
        if let Err(err) = self.plugin.unmount(&self.path, self.force) {
            match self.host.mount_point_of(&self.device) {
                Ok(None) => {
                    tracing::info!(
                        "{} is no longer mounted despite: {}",
                        self.device.display(),
                        err
                    );
                }
                _ => {
                    let blocker = self.host.processes_using(&self.path).first().copied();
                    return Err(Dissenter::with_process(err, blocker));
                }
            }
        }
        mount_path::release(&self.path);
        Ok(())
    }
}
