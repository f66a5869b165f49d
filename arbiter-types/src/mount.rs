//! Mount option and mount-map models

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::DiskDescription;

/// Structured mount options.
///
/// Each permission concern is tri-state: `None` means no source has decided it
/// yet, which is what lets lower-precedence sources fill gaps without
/// overriding higher ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptionSet {
    pub read_only: Option<bool>,
    pub no_suid: Option<bool>,
    pub no_owners: Option<bool>,
    pub no_dev: Option<bool>,
    /// Everything else, in first-seen order
    pub extra: Vec<String>,
}

impl MountOptionSet {
    /// Parse a comma separated option string.
    pub fn parse(options: &str) -> Self {
        let mut set = Self::default();
        for token in options.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            set.apply_token(token);
        }
        set
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for token in tokens {
            set.apply_token(token.as_ref().trim());
        }
        set
    }

    fn apply_token(&mut self, token: &str) {
        match token {
            "ro" | "rdonly" => self.read_only = Some(true),
            "rw" => self.read_only = Some(false),
            "nosuid" => self.no_suid = Some(true),
            "suid" => self.no_suid = Some(false),
            "noowners" => self.no_owners = Some(true),
            "owners" => self.no_owners = Some(false),
            "nodev" => self.no_dev = Some(true),
            "dev" => self.no_dev = Some(false),
            "" => {}
            other => {
                if !self.extra.iter().any(|t| t == other) {
                    self.extra.push(other.to_string());
                }
            }
        }
    }

    /// Fill every concern still undecided in `self` from `lower`.
    pub fn merge_under(&mut self, lower: &MountOptionSet) {
        self.read_only = self.read_only.or(lower.read_only);
        self.no_suid = self.no_suid.or(lower.no_suid);
        self.no_owners = self.no_owners.or(lower.no_owners);
        self.no_dev = self.no_dev.or(lower.no_dev);
        for token in &lower.extra {
            if !self.extra.contains(token) {
                self.extra.push(token.clone());
            }
        }
    }

    /// Render as an ordered sequence of option strings.
    pub fn to_tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        match self.read_only {
            Some(true) => tokens.push("ro".to_string()),
            Some(false) => tokens.push("rw".to_string()),
            None => {}
        }
        if self.no_suid == Some(true) {
            tokens.push("nosuid".to_string());
        }
        if self.no_dev == Some(true) {
            tokens.push("nodev".to_string());
        }
        if self.no_owners == Some(true) {
            tokens.push("noowners".to_string());
        }
        tokens.extend(self.extra.iter().cloned());
        tokens
    }
}

/// How a mount-map entry recognizes a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountIdentity {
    Uuid(String),
    Label(String),
    /// Device property predicate: `key` must equal `value`
    Property { key: String, value: String },
}

impl MountIdentity {
    pub fn matches(&self, description: &DiskDescription) -> bool {
        match self {
            Self::Uuid(uuid) => description
                .volume_uuid
                .as_deref()
                .is_some_and(|candidate| normalize_uuid(candidate) == normalize_uuid(uuid)),
            Self::Label(label) => description.volume_name.as_deref() == Some(label.as_str()),
            Self::Property { key, value } => {
                description.property(key).as_deref() == Some(value.as_str())
            }
        }
    }
}

/// Canonical form used to compare volume UUIDs from different sources.
pub fn normalize_uuid(raw: &str) -> String {
    match uuid::Uuid::parse_str(raw.trim()) {
        Ok(parsed) => parsed.hyphenated().to_string(),
        Err(_) => raw.trim().to_ascii_lowercase(),
    }
}

/// One row of a mount map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountMapEntry {
    pub identity: MountIdentity,

    /// Filesystem kind the entry is restricted to, if any
    pub kind: Option<String>,

    pub options: String,

    /// Explicit mount point
    pub mount_path: Option<PathBuf>,

    /// `Some(false)` forbids automatic mounting, `Some(true)` explicitly allows it
    pub automatic: Option<bool>,
}

impl MountMapEntry {
    pub fn matches(&self, description: &DiskDescription) -> bool {
        if let Some(kind) = &self.kind
            && description.volume_kind.as_deref() != Some(kind.as_str())
        {
            return false;
        }
        self.identity.matches(description)
    }
}

/// What a filesystem plugin learned about a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub kind: String,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub clean: bool,
}
