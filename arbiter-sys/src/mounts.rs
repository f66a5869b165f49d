// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SysError};

/// One row of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
}

pub fn read_mountinfo() -> Result<Vec<MountEntry>> {
    let mount_info = fs::read_to_string("/proc/self/mountinfo")?;
    parse_mountinfo(&mount_info)
}

pub fn parse_mountinfo(input: &str) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let (left, right) = line
            .split_once(" - ")
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;

        let mut left_fields = left.split_whitespace();
        let mount_point = left_fields
            .nth(4)
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;
        let options = left_fields.next().unwrap_or_default();

        let mut right_fields = right.split_whitespace();
        let fs_type = right_fields
            .next()
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;
        let source = right_fields
            .next()
            .ok_or_else(|| SysError::InvalidMountInfoLine(line.to_string()))?;

        entries.push(MountEntry {
            source: PathBuf::from(unescape_mount_field(source)),
            mount_point: PathBuf::from(unescape_mount_field(mount_point)),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
        });
    }

    Ok(entries)
}

/// First mount point of `device` in `entries`. Later bind mounts are ignored.
pub fn mount_point_for(entries: &[MountEntry], device: &Path) -> Option<PathBuf> {
    let canonical = device.canonicalize().unwrap_or_else(|_| device.to_path_buf());
    entries
        .iter()
        .find(|entry| entry.source == device || entry.source == canonical)
        .map(|entry| entry.mount_point.clone())
}

pub fn unescape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1].is_ascii_digit()
            && bytes[index + 2].is_ascii_digit()
            && bytes[index + 3].is_ascii_digit()
        {
            let octal = &value[index + 1..index + 4];
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num as char);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index] as char);
        index += 1;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "36 25 8:2 / / rw,relatime - ext4 /dev/nvme0n1p2 rw\n\
        37 25 0:5 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw\n\
        91 25 8:17 / /media/My\\040Stick rw,nosuid,nodev - vfat /dev/sdb1 rw,fmask=0022\n";

    #[test]
    fn parses_sources_and_escaped_mount_points() {
        let entries = parse_mountinfo(SAMPLE).expect("parse should succeed");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].source, PathBuf::from("/dev/sdb1"));
        assert_eq!(entries[2].mount_point, PathBuf::from("/media/My Stick"));
        assert_eq!(entries[2].fs_type, "vfat");
        assert_eq!(entries[2].options, "rw,nosuid,nodev");
    }

    #[test]
    fn finds_mount_point_for_device() {
        let entries = parse_mountinfo(SAMPLE).expect("parse should succeed");
        assert_eq!(
            mount_point_for(&entries, Path::new("/dev/sdb1")),
            Some(PathBuf::from("/media/My Stick"))
        );
        assert_eq!(mount_point_for(&entries, Path::new("/dev/sdc1")), None);
    }

    #[test]
    fn rejects_truncated_line() {
        assert!(parse_mountinfo("36 25 8:2 / /\n").is_err());
    }
}
