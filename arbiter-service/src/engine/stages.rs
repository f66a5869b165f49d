// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use arbiter_contracts::ClientSession;
use arbiter_types::{ArbiterError, DiskId, Interest, Notification, PeekVerdict};
use tokio::time::Instant;

use super::Engine;
use super::jobs::{self, MountJob, Mounted, Probed};
use crate::disk::{Disk, Stage};
use crate::event_loop::Event;
use crate::policy::{MountDecision, ResolveContext, resolve};
use crate::probe::{ProbeReport, ProbeVerdict};

impl Engine {
    /// Move `id` through as many stages as it can complete synchronously.
    pub(super) fn advance_disk(&mut self, id: &DiskId, now: Instant) {
        loop {
            let Some(disk) = self.registry.live_disk(id) else {
                return;
            };
            if self.registry.is_disk_busy(disk) {
                return;
            }
            let Some(stage) = disk.next_stage() else {
                return;
            };

            match stage {
                Stage::Probe => {
                    if disk.is_quiesced(now) {
                        self.start_probe(id);
                    }
                    return;
                }
                Stage::Peek => {
                    let peekers = self.registry.sessions.with_interest(Interest::Peek);
                    if !peekers.is_empty() {
                        self.start_peek(id, peekers);
                        return;
                    }
                    self.complete_stage(id, Stage::Peek);
                }
                Stage::Mount => {
                    if self.sibling_unprobed(disk) {
                        return;
                    }
                    if self.start_auto_mount(id) {
                        return;
                    }
                    self.complete_stage(id, Stage::Mount);
                }
                Stage::Appear => {
                    self.complete_stage(id, Stage::Appear);
                    if let Some(disk) = self.registry.live_disk(id) {
                        tracing::info!("{} appeared", id);
                        self.notify(Notification::Appeared {
                            disk: id.clone(),
                            description: disk.description.clone(),
                        });
                    }
                }
            }
        }
    }

    fn complete_stage(&mut self, id: &DiskId, stage: Stage) {
        if let Some(disk) = self.registry.live_disk_mut(id) {
            disk.stages |= stage;
        }
    }

    /// A writable disk on the same unit has not been probed yet; it may
    /// still need repair before anything on the unit is mounted.
    fn sibling_unprobed(&self, disk: &Disk) -> bool {
        self.registry.unit_disks(disk.unit()).any(|other| {
            other.id != disk.id
                && other.description.writable
                && !other.stages.contains(Stage::Probe)
        })
    }

    // === Probe ===

    fn start_probe(&mut self, id: &DiskId) {
        let Some(disk) = self.registry.live_disk_mut(id) else {
            return;
        };
        disk.command_active = true;
        let description = disk.description.clone();
        tracing::debug!("Probing {}", id);

        let sequencer = self.sequencer.clone();
        let host = Arc::clone(&self.host);
        let disk_id = id.clone();
        self.run_on_worker(
            id,
            "probe",
            move || Ok::<_, ArbiterError>(jobs::probe_volume(&sequencer, host.as_ref(), &description)),
            move |engine: &mut Engine, result| {
                if let Some(disk) = engine.registry.live_disk_mut(&disk_id) {
                    disk.command_active = false;
                    disk.stages |= Stage::Probe;
                }
                engine.apply_probe(&disk_id, probed_or_failed(result));
                engine.signal();
            },
        );
    }

    /// Record what probing learned about `id`.
    pub(crate) fn apply_probe(&mut self, id: &DiskId, probed: Probed) {
        let Some(disk) = self.registry.live_disk_mut(id) else {
            return;
        };
        let before = disk.description.clone();
        disk.context.suppress_automount = probed.report.suppress_automount;
        disk.description.volume_path = probed.mount_point;

        let mut failed = false;
        match probed.report.verdict {
            ProbeVerdict::Recognized { outcome, .. } => {
                tracing::info!(
                    "{} holds {} volume {:?}",
                    id,
                    outcome.kind,
                    outcome.name.as_deref().unwrap_or_default()
                );
                disk.description.volume_kind = Some(outcome.kind);
                disk.description.volume_name = outcome.name;
                disk.description.volume_uuid = outcome.uuid;
                disk.description.volume_mountable = true;
                disk.requires_repair = !outcome.clean;
                disk.require_reprobe = false;
            }
            ProbeVerdict::Unrecognized => {
                tracing::debug!("{} holds no recognized volume", id);
                disk.description.clear_volume();
                disk.require_reprobe = false;
            }
            ProbeVerdict::Failed(err) => {
                tracing::warn!("Probing {} failed: {}", id, err);
                disk.description.clear_volume();
                disk.require_reprobe = true;
                failed = true;
            }
        }

        let appeared = disk.has_appeared();
        let keys = before.diff(&disk.description);
        if failed || (appeared && !keys.is_empty()) {
            let description = disk.description.clone();
            self.notify(Notification::DescriptionChanged {
                disk: id.clone(),
                keys,
                description,
            });
        }
    }

    // === Peek ===

    fn start_peek(&mut self, id: &DiskId, peekers: Vec<Arc<dyn ClientSession>>) {
        let Some(disk) = self.registry.live_disk_mut(id) else {
            return;
        };
        disk.command_active = true;
        let generation = disk.generation;
        let description = disk.description.clone();
        let handle = self.handle.clone();
        let disk_id = id.clone();
        tokio::spawn(async move {
            let mut vetoed = false;
            for session in peekers {
                if session.peek(&description).await == PeekVerdict::Veto {
                    vetoed = true;
                }
            }
            handle.post(Event::PeekAnswered {
                disk: disk_id,
                generation,
                vetoed,
            });
        });
    }

    pub(super) fn peek_answered(&mut self, id: &DiskId, generation: u64, vetoed: bool) {
        let Some(disk) = self.registry.live_disk_mut(id) else {
            return;
        };
        // The disk may have started over while sessions were deciding
        if disk.generation != generation
            || !disk.command_active
            || disk.next_stage() != Some(Stage::Peek)
        {
            return;
        }
        disk.command_active = false;
        disk.stages |= Stage::Peek;
        disk.context.peek_vetoed = vetoed;
        if vetoed {
            tracing::info!("A session vetoed automatic mounting of {}", id);
        }
        self.signal();
    }

    // === Mount ===

    /// Start the automatic mount of `id`. Returns false when there is
    /// nothing to mount or policy says no.
    fn start_auto_mount(&mut self, id: &DiskId) -> bool {
        let Some(disk) = self.registry.live_disk(id) else {
            return false;
        };
        let description = &disk.description;
        if !description.volume_mountable || description.is_mounted() {
            return false;
        }

        let console_user = self.host.console_user();
        let lookup = self.config.lookup(description);
        let context = ResolveContext {
            automatic: true,
            claimed: disk.claim.is_some(),
            peek_vetoed: disk.context.peek_vetoed,
            suppress_automount: disk.context.suppress_automount,
            console_user,
            ..Default::default()
        };
        let plan = match resolve(description, &lookup, self.config.preferences(), &context) {
            MountDecision::Mount(plan) => plan,
            MountDecision::Cancel(reason) => {
                tracing::debug!("Not mounting {} automatically: {}", id, reason);
                return false;
            }
        };
        let Some(plugin) = self.plugin_for(description) else {
            tracing::warn!("No plugin can mount {} on {}", description.volume_kind.as_deref().unwrap_or("?"), id);
            return false;
        };

        let job = MountJob {
            plugin,
            host: Arc::clone(&self.host),
            device: description.device_path.clone(),
            plan,
            repair: disk.requires_repair,
        };
        if let Some(disk) = self.registry.live_disk_mut(id) {
            disk.command_active = true;
        }

        let disk_id = id.clone();
        self.run_on_worker(id, "mount", move || job.run(), move |engine: &mut Engine, result| {
            engine.auto_mount_finished(&disk_id, console_user, result);
        });
        true
    }

    fn auto_mount_finished(
        &mut self,
        id: &DiskId,
        owner: Option<u32>,
        result: Result<Mounted, ArbiterError>,
    ) {
        if let Some(disk) = self.registry.live_disk_mut(id) {
            disk.command_active = false;
            disk.stages |= Stage::Mount;
            match result {
                Ok(mounted) => {
                    tracing::info!("Mounted {} at {}", id, mounted.path.display());
                    disk.description.volume_path = Some(mounted.path);
                    disk.context.mount_owner = owner;
                    disk.context.owns_mount_dir = mounted.created_dir;
                    if mounted.repaired {
                        disk.requires_repair = false;
                    }
                }
                Err(err) => tracing::warn!("Automatic mount of {} failed: {}", id, err),
            }
        }
        self.signal();
    }
}

/// A probe that never reached the device still counts as a failed probe.
pub(crate) fn probed_or_failed(result: Result<Probed, ArbiterError>) -> Probed {
    result.unwrap_or_else(|err| Probed {
        report: ProbeReport {
            verdict: ProbeVerdict::Failed(err),
            suppress_automount: false,
        },
        mount_point: None,
    })
}
