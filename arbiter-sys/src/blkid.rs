// SPDX-License-Identifier: GPL-3.0-only

//! `blkid`-backed filesystem plugin
//!
//! One `BlkidPlugin` instance serves one filesystem kind. Probing shells out
//! to `blkid -p` and a dry run of the kind's checker, repair and relabel to
//! the kind's own tools, and mounting goes straight through `mount(2)`.
//!
//! Plugins built together with [`BlkidPlugin::family`] share the signatures
//! `blkid` reports, so trying every kind against a device reads it once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arbiter_contracts::FilesystemPlugin;
use arbiter_types::{ArbiterError, ProbeOutcome};
use nix::mount::{MntFlags, MsFlags};

use crate::error::SysError;

/// How long a device signature is reused. Shorter than the settle period
/// new devices wait out, so a swapped medium is never judged by its
/// predecessor's signature.
const SIGNATURE_TTL: Duration = Duration::from_millis(500);

type Fields = HashMap<String, String>;

struct Signature {
    read_at: Instant,
    fields: Fields,
}

#[derive(Default)]
struct SignatureCache {
    entries: Mutex<HashMap<PathBuf, Signature>>,
}

impl SignatureCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Signature>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, device: &Path) -> Option<Fields> {
        self.lock()
            .get(device)
            .filter(|signature| signature.read_at.elapsed() < SIGNATURE_TTL)
            .map(|signature| signature.fields.clone())
    }

    fn put(&self, device: &Path, fields: Fields) {
        let mut entries = self.lock();
        entries.retain(|_, signature| signature.read_at.elapsed() < SIGNATURE_TTL);
        entries.insert(
            device.to_path_buf(),
            Signature {
                read_at: Instant::now(),
                fields,
            },
        );
    }

    fn forget(&self, device: &Path) {
        self.lock().remove(device);
    }
}

pub struct BlkidPlugin {
    kind: String,
    signatures: Arc<SignatureCache>,
}

impl BlkidPlugin {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            signatures: Arc::default(),
        }
    }

    /// One plugin per kind, all reading device signatures through one cache.
    pub fn family(kinds: impl IntoIterator<Item = String>) -> Vec<Self> {
        let signatures = Arc::new(SignatureCache::default());
        kinds
            .into_iter()
            .map(|kind| Self {
                kind,
                signatures: Arc::clone(&signatures),
            })
            .collect()
    }

    /// Filesystem kinds whose userspace tools are installed.
    pub fn detect_supported(kinds: &[&str]) -> Vec<String> {
        let supported: Vec<String> = kinds
            .iter()
            .filter(|kind| which::which(format!("fsck.{kind}")).is_ok())
            .map(|kind| kind.to_string())
            .collect();
        tracing::info!("Detected filesystem support: {:?}", supported);
        supported
    }

    fn repair_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self.kind.as_str() {
            "ext2" | "ext3" | "ext4" => Some(("e2fsck", &["-p"])),
            "vfat" => Some(("fsck.vfat", &["-a"])),
            "exfat" => Some(("fsck.exfat", &["-p"])),
            "ntfs" => Some(("ntfsfix", &[])),
            "xfs" => Some(("xfs_repair", &[])),
            _ => None,
        }
    }

    /// Read-only consistency check.
    fn check_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self.kind.as_str() {
            "ext2" | "ext3" | "ext4" => Some(("e2fsck", &["-n"])),
            "vfat" => Some(("fsck.vfat", &["-n"])),
            "exfat" => Some(("fsck.exfat", &["-n"])),
            "ntfs" => Some(("ntfsfix", &["-n"])),
            "xfs" => Some(("xfs_repair", &["-n"])),
            _ => None,
        }
    }

    fn signature(&self, device: &Path) -> Result<Fields, ArbiterError> {
        if let Some(fields) = self.signatures.get(device) {
            return Ok(fields);
        }
        let fields = parse_export(&run("blkid", &["-p", "-o", "export"], device)?);
        self.signatures.put(device, fields.clone());
        Ok(fields)
    }

    /// Whether the volume on `device` can be mounted without repair. Volumes
    /// that are mounted, or have no checker installed, count as clean.
    fn is_clean(&self, device: &Path) -> bool {
        let Some((tool, args)) = self.check_command() else {
            return true;
        };
        let mounted = crate::mounts::read_mountinfo()
            .ok()
            .and_then(|entries| crate::mounts::mount_point_for(&entries, device));
        if mounted.is_some() {
            return true;
        }
        let Ok(tool_path) = which::which(tool) else {
            tracing::debug!("{} not installed, assuming {} is clean", tool, device.display());
            return true;
        };

        match Command::new(tool_path).args(args).arg(device).output() {
            Ok(output) => {
                let clean = check_passed(output.status);
                if !clean {
                    tracing::info!(
                        "{} found problems on {} (exit {:?})",
                        tool,
                        device.display(),
                        output.status.code()
                    );
                }
                clean
            }
            Err(e) => {
                tracing::warn!("Failed to run {} on {}: {}", tool, device.display(), e);
                true
            }
        }
    }

    fn label_command(&self, name: &str) -> Option<(&'static str, Vec<String>)> {
        match self.kind.as_str() {
            "ext2" | "ext3" | "ext4" => Some(("e2label", vec![name.to_string()])),
            "vfat" => Some(("fatlabel", vec![name.to_string()])),
            "exfat" => Some(("exfatlabel", vec![name.to_string()])),
            "ntfs" => Some(("ntfslabel", vec![name.to_string()])),
            _ => None,
        }
    }
}

impl FilesystemPlugin for BlkidPlugin {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn probe(&self, device: &Path) -> Result<ProbeOutcome, ArbiterError> {
        let fields = self.signature(device)?;

        let Some(found) = fields.get("TYPE") else {
            return Err(ArbiterError::unsupported(format!(
                "no filesystem signature on {}",
                device.display()
            )));
        };
        if *found != self.kind {
            return Err(ArbiterError::unsupported(format!(
                "{} holds {found}, not {}",
                device.display(),
                self.kind
            )));
        }

        Ok(ProbeOutcome {
            kind: self.kind.clone(),
            name: fields.get("LABEL").cloned(),
            uuid: fields.get("UUID").cloned(),
            clean: self.is_clean(device),
        })
    }

    fn repair(&self, device: &Path) -> Result<(), ArbiterError> {
        let Some((tool, args)) = self.repair_command() else {
            return Err(ArbiterError::unsupported(format!(
                "no repair tool for {}",
                self.kind
            )));
        };
        self.signatures.forget(device);
        run(tool, args, device)?;
        tracing::info!("Repaired {} with {}", device.display(), tool);
        Ok(())
    }

    fn mount(
        &self,
        device: &Path,
        mount_point: &Path,
        options: &[String],
    ) -> Result<(), ArbiterError> {
        self.signatures.forget(device);
        let (flags, data) = split_mount_options(options);
        let data = (!data.is_empty()).then_some(data.as_str());
        nix::mount::mount(
            Some(device),
            mount_point,
            Some(self.kind.as_str()),
            flags,
            data,
        )
        .map_err(SysError::from)?;
        tracing::info!(
            "Mounted {} at {} ({})",
            device.display(),
            mount_point.display(),
            self.kind
        );
        Ok(())
    }

    fn unmount(&self, mount_point: &Path, force: bool) -> Result<(), ArbiterError> {
        let flags = if force {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        nix::mount::umount2(mount_point, flags).map_err(SysError::from)?;
        Ok(())
    }

    fn rename(&self, device: &Path, mount_point: &Path, name: &str) -> Result<(), ArbiterError> {
        self.signatures.forget(device);
        if self.kind == "btrfs" {
            let tool = which::which("btrfs").map_err(|_| SysError::ToolMissing("btrfs".into()))?;
            let output = Command::new(tool)
                .args(["filesystem", "label"])
                .arg(mount_point)
                .arg(name)
                .output()
                .map_err(SysError::from)?;
            return check_status("btrfs filesystem label", output).map(|_| ());
        }

        let Some((tool, args)) = self.label_command(name) else {
            return Err(ArbiterError::unsupported(format!(
                "no relabel tool for {}",
                self.kind
            )));
        };
        let tool_path = which::which(tool).map_err(|_| SysError::ToolMissing(tool.into()))?;
        let output = Command::new(tool_path)
            .arg(device)
            .args(&args)
            .output()
            .map_err(SysError::from)?;
        check_status(tool, output).map(|_| ())
    }
}

fn run(tool: &str, args: &[&str], device: &Path) -> Result<String, ArbiterError> {
    let tool_path = which::which(tool).map_err(|_| SysError::ToolMissing(tool.to_string()))?;
    let output = Command::new(tool_path)
        .args(args)
        .arg(device)
        .output()
        .map_err(SysError::from)?;
    check_status(tool, output)
}

fn check_status(tool: &str, output: std::process::Output) -> Result<String, ArbiterError> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    // blkid exits 2 when it finds no signature at all
    if tool == "blkid" && output.status.code() == Some(2) {
        return Ok(String::new());
    }
    Err(SysError::CommandFailed {
        command: tool.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
    .into())
}

/// A checker killed by a signal says nothing about the volume.
fn check_passed(status: ExitStatus) -> bool {
    status.success() || status.code().is_none()
}

fn parse_export(output: &str) -> Fields {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Split option strings into `mount(2)` flags and the filesystem data string.
/// `noowners` has no Linux equivalent and is dropped.
fn split_mount_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "noowners" | "owners" | "suid" | "dev" => {}
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}
