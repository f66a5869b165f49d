// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use procfs::process::{FDTarget, Process};

use crate::error::Result;

/// A process keeping a mount point busy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub pid: i32,
    pub uid: Option<u32>,
    pub command: String,
}

/// Every process whose open files, working directory or root lie under
/// `mount_point`, lowest pid first.
///
/// Walks `/proc`, so it blocks. Processes that exit or deny access while
/// being inspected are skipped.
pub fn holders_of(mount_point: &Path) -> Result<Vec<Holder>> {
    if !mount_point.is_absolute() {
        tracing::warn!(
            "Refusing to look up holders of relative path {}",
            mount_point.display()
        );
        return Ok(Vec::new());
    }

    let processes = match procfs::process::all_processes() {
        Ok(processes) => processes,
        Err(e) => {
            tracing::warn!("Failed to enumerate processes: {}", e);
            return Ok(Vec::new());
        }
    };

    let mut holders: Vec<Holder> = processes
        .flatten()
        .filter(|process| holds(process, mount_point))
        .map(|process| Holder {
            pid: process.pid(),
            uid: process.uid().ok(),
            command: command_of(&process),
        })
        .collect();
    holders.sort_by_key(|holder| holder.pid);

    for holder in &holders {
        tracing::debug!(
            "{} (pid {}) holds {}",
            holder.command,
            holder.pid,
            mount_point.display()
        );
    }
    Ok(holders)
}

fn holds(process: &Process, mount_point: &Path) -> bool {
    if process.cwd().is_ok_and(|cwd| cwd.starts_with(mount_point)) {
        return true;
    }
    if process
        .root()
        .is_ok_and(|root| root != Path::new("/") && root.starts_with(mount_point))
    {
        return true;
    }

    let Ok(fds) = process.fd() else {
        return false;
    };
    fds.flatten().any(|fd| match &fd.target {
        FDTarget::Path(path) => path.starts_with(mount_point),
        _ => false,
    })
}

fn command_of(process: &Process) -> String {
    if let Ok(stat) = process.stat() {
        return stat.comm;
    }
    format!("pid {}", process.pid())
}
