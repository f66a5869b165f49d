// SPDX-License-Identifier: GPL-3.0-only

use arbiter_types::{DiskDescription, DiskId, SessionId};
use enumflags2::{BitFlags, bitflags};
use tokio::time::Instant;

/// Lifecycle stages, completed in declaration order.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe = 1 << 0,
    Peek = 1 << 1,
    Mount = 1 << 2,
    Appear = 1 << 3,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Probe, Stage::Peek, Stage::Mount, Stage::Appear];
}

/// Engine-private facts about a disk that are not part of its description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskContext {
    /// Uid that mounted the volume; owns unmount and rename
    pub mount_owner: Option<u32>,
    /// The current mount point was created by the daemon
    pub owns_mount_dir: bool,
    pub peek_vetoed: bool,
    pub suppress_automount: bool,
}

#[derive(Debug, Clone)]
pub struct Disk {
    pub id: DiskId,
    pub description: DiskDescription,
    pub stages: BitFlags<Stage>,
    /// Last probe hit an I/O error; the next probe or refresh starts over
    pub require_reprobe: bool,
    /// Last probe reported the volume dirty
    pub requires_repair: bool,
    pub busy_until: Option<Instant>,
    /// Became quiet because its busy deadline ran out
    pub settled_by_timeout: bool,
    pub claim: Option<SessionId>,
    pub context: DiskContext,
    pub command_active: bool,
    /// Removed from the system but still owed a worker result
    pub zombie: bool,
    /// Worker jobs started for this disk and not yet delivered
    pub in_flight: usize,
    /// Bumped whenever the record starts over for new media or is
    /// reinserted; results of work started under an older value are dropped
    pub generation: u64,
}

impl Disk {
    pub fn new(id: DiskId, description: DiskDescription, busy_until: Option<Instant>) -> Self {
        Self {
            id,
            description,
            stages: BitFlags::empty(),
            require_reprobe: false,
            requires_repair: false,
            busy_until,
            settled_by_timeout: false,
            claim: None,
            context: DiskContext::default(),
            command_active: false,
            zombie: false,
            in_flight: 0,
            generation: 0,
        }
    }

    pub fn unit(&self) -> &str {
        &self.description.unit
    }

    pub fn is_quiesced(&self, now: Instant) -> bool {
        self.busy_until.is_none_or(|deadline| deadline <= now)
    }

    pub fn has_appeared(&self) -> bool {
        self.stages.contains(Stage::Appear)
    }

    pub fn is_settled(&self) -> bool {
        self.stages.is_all()
    }

    /// Earliest stage not yet completed.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ORDER
            .into_iter()
            .find(|stage| !self.stages.contains(*stage))
    }

    /// Start the stage machine over, forgetting everything probing learned.
    pub fn reset_stages(&mut self) {
        self.stages = BitFlags::empty();
        self.require_reprobe = false;
        self.requires_repair = false;
        self.context.peek_vetoed = false;
        self.context.suppress_automount = false;
        self.description.clear_volume();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn stages_advance_in_order() {
        let mut disk = Disk::new(DiskId::new("sdb1"), DiskDescription::default(), None);
        assert_eq!(disk.next_stage(), Some(Stage::Probe));
        disk.stages |= Stage::Probe | Stage::Peek;
        assert_eq!(disk.next_stage(), Some(Stage::Mount));
        disk.stages |= Stage::Mount | Stage::Appear;
        assert_eq!(disk.next_stage(), None);
        assert!(disk.is_settled());

        disk.description.volume_kind = Some("vfat".to_string());
        disk.require_reprobe = true;
        disk.reset_stages();
        assert!(disk.stages.is_empty());
        assert!(!disk.require_reprobe);
        assert_eq!(disk.description.volume_kind, None);
    }

    #[test]
    fn quiesced_once_deadline_passes() {
        let now = Instant::now();
        let disk = Disk::new(
            DiskId::new("sdb"),
            DiskDescription::default(),
            Some(now + Duration::from_secs(2)),
        );
        assert!(!disk.is_quiesced(now));
        assert!(disk.is_quiesced(now + Duration::from_secs(2)));
    }
}
