//! Disk description model
//!
//! A typed replacement for a free-form attribute bag. Every attribute a
//! collaborator may read has a field here, and every field that can change
//! after arrival has a [`DescriptionKey`] so change notifications can say
//! exactly what moved.

use std::fmt;
use std::path::PathBuf;

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

/// Stable identity of a disk: its kernel device name (e.g. "sdb1").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskId(pub String);

impl DiskId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DiskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Keys of the attributes that may change during a disk's lifetime.
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptionKey {
    MediaSize = 1 << 0,
    Writable = 1 << 1,
    VolumeKind = 1 << 2,
    VolumeName = 1 << 3,
    VolumeUuid = 1 << 4,
    VolumePath = 1 << 5,
    VolumeMountable = 1 << 6,
}

/// Complete description of one disk or volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescription {
    // === Device ===
    /// Device node (e.g. "/dev/sdb1")
    pub device_path: PathBuf,

    /// Name of the physical unit this disk lives on (e.g. "sdb")
    pub unit: String,

    /// Whether this is the whole media rather than a partition
    pub whole: bool,

    /// Connection bus ("usb", "ata", "nvme", ...)
    pub bus: Option<String>,

    pub model: Option<String>,

    pub vendor: Option<String>,

    /// Partition content hint (partition type name or GUID)
    pub content: Option<String>,

    // === Media ===
    /// Size in bytes; zero means no media present
    pub media_size: u64,

    pub writable: bool,

    pub removable: bool,

    pub ejectable: bool,

    /// Whether the device is attached internally
    pub internal: bool,

    // === Volume ===
    /// Recognized filesystem kind (e.g. "vfat")
    pub volume_kind: Option<String>,

    pub volume_name: Option<String>,

    pub volume_uuid: Option<String>,

    /// Current mount point
    pub volume_path: Option<PathBuf>,

    pub volume_mountable: bool,
}

impl DiskDescription {
    pub fn is_mounted(&self) -> bool {
        self.volume_path.is_some()
    }

    /// Read one of the device properties that matchers may test.
    pub fn property(&self, key: &str) -> Option<String> {
        match key {
            "bus" => self.bus.clone(),
            "model" => self.model.clone(),
            "vendor" => self.vendor.clone(),
            "content" => self.content.clone(),
            "unit" => Some(self.unit.clone()),
            "whole" => Some(self.whole.to_string()),
            "writable" => Some(self.writable.to_string()),
            "removable" => Some(self.removable.to_string()),
            "ejectable" => Some(self.ejectable.to_string()),
            "internal" => Some(self.internal.to_string()),
            _ => None,
        }
    }

    /// Forget everything a probe established.
    pub fn clear_volume(&mut self) {
        self.volume_kind = None;
        self.volume_name = None;
        self.volume_uuid = None;
        self.volume_mountable = false;
    }

    /// Keys whose values differ between `self` and `other`.
    pub fn diff(&self, other: &DiskDescription) -> BitFlags<DescriptionKey> {
        let mut keys = BitFlags::empty();
        if self.media_size != other.media_size {
            keys |= DescriptionKey::MediaSize;
        }
        if self.writable != other.writable {
            keys |= DescriptionKey::Writable;
        }
        if self.volume_kind != other.volume_kind {
            keys |= DescriptionKey::VolumeKind;
        }
        if self.volume_name != other.volume_name {
            keys |= DescriptionKey::VolumeName;
        }
        if self.volume_uuid != other.volume_uuid {
            keys |= DescriptionKey::VolumeUuid;
        }
        if self.volume_path != other.volume_path {
            keys |= DescriptionKey::VolumePath;
        }
        if self.volume_mountable != other.volume_mountable {
            keys |= DescriptionKey::VolumeMountable;
        }
        keys
    }
}
