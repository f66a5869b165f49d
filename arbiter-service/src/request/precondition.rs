// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::{ArbiterError, RequestFlag, RequestKind};

use super::Request;
use crate::disk::Disk;

/// Reject requests that cannot succeed against the disk's current state.
pub fn check(request: &Request, disk: &Disk) -> Result<(), ArbiterError> {
    let description = &disk.description;
    let arguments = &request.arguments;

    match request.kind {
        RequestKind::Claim => {
            if request.caller.session.is_none() {
                return Err(ArbiterError::bad_argument(
                    "claim requires a registered session",
                ));
            }
        }
        RequestKind::Eject => {
            if !description.ejectable {
                return Err(ArbiterError::unsupported(format!(
                    "{} is not ejectable",
                    disk.id
                )));
            }
        }
        RequestKind::Mount => {
            if !description.volume_mountable {
                return Err(ArbiterError::unsupported(format!(
                    "{} has no recognized volume",
                    disk.id
                )));
            }
            let update = arguments.has(RequestFlag::Update);
            let snapshot = arguments.has(RequestFlag::Snapshot);
            if snapshot && arguments.mount_path.is_none() {
                return Err(ArbiterError::bad_argument(
                    "snapshot mounts need an explicit path",
                ));
            }
            if description.is_mounted() && !update && !snapshot {
                return Err(ArbiterError::busy(format!("{} is already mounted", disk.id)));
            }
            if update && !description.is_mounted() {
                return Err(ArbiterError::not_mounted(format!(
                    "{} is not mounted, nothing to update",
                    disk.id
                )));
            }
        }
        RequestKind::Unmount => {
            if !description.is_mounted() {
                return Err(ArbiterError::not_mounted(format!("{} is not mounted", disk.id)));
            }
        }
        RequestKind::Rename => {
            let name = arguments.name.as_deref().unwrap_or_default();
            if name.is_empty() || name.contains('/') {
                return Err(ArbiterError::bad_argument(format!(
                    "invalid volume name \"{name}\""
                )));
            }
            if !description.is_mounted() {
                return Err(ArbiterError::not_mounted(format!("{} is not mounted", disk.id)));
            }
            if !description.writable {
                return Err(ArbiterError::unsupported(format!("{} is read-only", disk.id)));
            }
        }
        RequestKind::Probe => {
            if description.is_mounted() {
                return Err(ArbiterError::busy(format!(
                    "{} is mounted and cannot be probed",
                    disk.id
                )));
            }
        }
        RequestKind::Refresh => {}
    }

    Ok(())
}
