// SPDX-License-Identifier: GPL-3.0-only

//! Block device discovery from sysfs
//!
//! `SysfsDiscovery` keeps the last scan and turns each new scan into
//! arrival/removal events for the engine.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arbiter_types::{DiskDescription, DiskId};

use crate::error::Result;

const SECTOR_SIZE: u64 = 512;
const IGNORED_PREFIXES: &[&str] = &["ram", "zram", "fd"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Arrived {
        disk: DiskId,
        description: DiskDescription,
        busy_for: Option<Duration>,
    },
    Removed {
        disk: DiskId,
    },
}

pub struct SysfsDiscovery {
    sys_root: PathBuf,
    dev_root: PathBuf,
    settle: Duration,
    known: BTreeMap<DiskId, DiskDescription>,
}

impl SysfsDiscovery {
    pub fn new(sys_root: impl Into<PathBuf>, settle: Duration) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: PathBuf::from("/dev"),
            settle,
            known: BTreeMap::new(),
        }
    }

    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    /// Rescan and report what changed since the previous call.
    ///
    /// A device whose media size or writability changed is reported as
    /// arriving again so the engine re-examines it.
    pub fn poll(&mut self) -> Result<Vec<DeviceEvent>> {
        let current = self.scan()?;
        let mut events = Vec::new();

        for disk in self.known.keys() {
            if !current.contains_key(disk) {
                events.push(DeviceEvent::Removed { disk: disk.clone() });
            }
        }

        for (disk, description) in &current {
            let changed = match self.known.get(disk) {
                Some(previous) => {
                    previous.media_size != description.media_size
                        || previous.writable != description.writable
                }
                None => true,
            };
            if changed {
                events.push(DeviceEvent::Arrived {
                    disk: disk.clone(),
                    description: description.clone(),
                    busy_for: (!self.settle.is_zero()).then_some(self.settle),
                });
            }
        }

        self.known = current;
        Ok(events)
    }

    fn scan(&self) -> Result<BTreeMap<DiskId, DiskDescription>> {
        let class_dir = self.sys_root.join("class/block");
        let mut found = BTreeMap::new();

        for entry in fs::read_dir(&class_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if IGNORED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                continue;
            }

            match self.describe(&entry.path(), &name) {
                Some(description) => {
                    found.insert(DiskId::new(name), description);
                }
                None => tracing::debug!("Skipping block device {}", name),
            }
        }

        Ok(found)
    }

    fn describe(&self, path: &Path, name: &str) -> Option<DiskDescription> {
        let sectors: u64 = read_attr(path, "size")?.parse().ok()?;
        let whole = !path.join("partition").exists();
        if name.starts_with("loop") && sectors == 0 {
            return None;
        }

        let unit = if whole {
            name.to_string()
        } else {
            parent_unit(path).unwrap_or_else(|| strip_partition_suffix(name))
        };
        let unit_path = self.sys_root.join("class/block").join(&unit);

        let removable = read_attr(&unit_path, "removable").as_deref() == Some("1");
        let read_only = read_attr(path, "ro").as_deref() == Some("1");
        let bus = detect_bus(&unit_path);
        let internal = !removable && bus.as_deref() != Some("usb");

        Some(DiskDescription {
            device_path: self.dev_root.join(name),
            unit,
            whole,
            bus: bus.clone(),
            model: read_attr(&unit_path, "device/model"),
            vendor: read_attr(&unit_path, "device/vendor"),
            content: read_uevent_value(path, "PARTNAME"),
            media_size: sectors * SECTOR_SIZE,
            writable: !read_only,
            removable,
            ejectable: removable || bus.as_deref() == Some("usb"),
            internal,
            ..Default::default()
        })
    }
}

fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(attr)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn read_uevent_value(dir: &Path, key: &str) -> Option<String> {
    let uevent = fs::read_to_string(dir.join("uevent")).ok()?;
    uevent.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_string)
    })
}

fn parent_unit(path: &Path) -> Option<String> {
    let canonical = path.canonicalize().ok()?;
    let parent = canonical.parent()?;
    if !parent.join("size").exists() {
        return None;
    }
    parent.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn strip_partition_suffix(name: &str) -> String {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    // nvme0n1p1 / mmcblk0p1 style
    if let Some(stripped) = trimmed.strip_suffix('p')
        && stripped.ends_with(|c: char| c.is_ascii_digit())
    {
        return stripped.to_string();
    }
    trimmed.to_string()
}

fn detect_bus(unit_path: &Path) -> Option<String> {
    let canonical = unit_path.canonicalize().ok()?;
    let path = canonical.to_string_lossy();
    let bus = if path.contains("/usb") {
        "usb"
    } else if path.contains("/nvme") {
        "nvme"
    } else if path.contains("/mmc") {
        "mmc"
    } else if path.contains("/ata") {
        "ata"
    } else if path.contains("/virtual/") {
        "virtual"
    } else {
        return None;
    };
    Some(bus.to_string())
}
