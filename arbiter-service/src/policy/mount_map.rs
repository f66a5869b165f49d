// SPDX-License-Identifier: GPL-3.0-only

//! Mount map tables
//!
//! Map #1 is fstab-style:
//!
//! ```text
//! # identity              path            kind   options
//! UUID=0F3E-1C8A          /media/camera   vfat   noauto,ro
//! LABEL=Backup\040Disk    none            *      nosuid
//! PROPERTY=bus:usb        none            auto   nodev
//! ```
//!
//! Map #2 holds legacy permission options keyed by volume uuid only:
//!
//! ```text
//! 0F3E1C8A-4B2D-4E6F-8A9B-1C2D3E4F5A6B nosuid,noowners
//! ```

use std::path::PathBuf;

use arbiter_sys::unescape_mount_field;
use arbiter_types::{DiskDescription, MountIdentity, MountMapEntry, MountOptionSet, normalize_uuid};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolInfoEntry {
    pub uuid: String,
    pub options: String,
}

/// Everything the maps say about one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapLookup {
    /// Map #1 options with map #2 filling undecided concerns
    pub options: MountOptionSet,
    pub mount_path: Option<PathBuf>,
    pub automatic: Option<bool>,
}

pub fn parse_fstab(raw: &str) -> Vec<MountMapEntry> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let entry = parse_fstab_line(line);
            if entry.is_none() {
                tracing::warn!("Skipping malformed mount map line: {}", line);
            }
            entry
        })
        .collect()
}

fn parse_fstab_line(line: &str) -> Option<MountMapEntry> {
    let mut fields = line.split_whitespace();
    let identity = parse_identity(&unescape_mount_field(fields.next()?))?;
    let path = unescape_mount_field(fields.next()?);
    let kind = fields.next()?;
    let raw_options = fields.next().unwrap_or("");

    let mut automatic = None;
    let options: Vec<&str> = raw_options
        .split(',')
        .filter(|token| match *token {
            "auto" => {
                automatic = Some(true);
                false
            }
            "noauto" => {
                automatic = Some(false);
                false
            }
            "defaults" | "" => false,
            _ => true,
        })
        .collect();

    Some(MountMapEntry {
        identity,
        kind: match kind {
            "auto" | "*" => None,
            other => Some(other.to_string()),
        },
        options: options.join(","),
        mount_path: (path != "none").then(|| PathBuf::from(path)),
        automatic,
    })
}

fn parse_identity(field: &str) -> Option<MountIdentity> {
    let (tag, value) = field.split_once('=')?;
    if value.is_empty() {
        return None;
    }
    match tag {
        "UUID" => Some(MountIdentity::Uuid(value.to_string())),
        "LABEL" => Some(MountIdentity::Label(value.to_string())),
        "PROPERTY" => {
            let (key, value) = value.split_once(':')?;
            Some(MountIdentity::Property {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        _ => None,
    }
}

pub fn parse_volinfo(raw: &str) -> Vec<VolInfoEntry> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (uuid, options) = line.split_once(char::is_whitespace)?;
            Some(VolInfoEntry {
                uuid: normalize_uuid(uuid),
                options: options.trim().to_string(),
            })
        })
        .collect()
}

/// Combine both maps for `description`. The first matching map #1 entry
/// wins; map #1 alone decides the automatic flag and explicit path.
pub fn lookup(
    fstab: &[MountMapEntry],
    volinfo: &[VolInfoEntry],
    description: &DiskDescription,
) -> MapLookup {
    let mut result = MapLookup::default();

    if let Some(entry) = fstab.iter().find(|entry| entry.matches(description)) {
        tracing::debug!(
            "Mount map entry {:?} matches {}",
            entry.identity,
            description.device_path.display()
        );
        result.options = MountOptionSet::parse(&entry.options);
        result.mount_path = entry.mount_path.clone();
        result.automatic = entry.automatic;
    }

    if let Some(uuid) = description.volume_uuid.as_deref() {
        let uuid = normalize_uuid(uuid);
        if let Some(entry) = volinfo.iter().find(|entry| entry.uuid == uuid) {
            result
                .options
                .merge_under(&MountOptionSet::parse(&entry.options));
        }
    }

    result
}
