// SPDX-License-Identifier: GPL-3.0-only

//! Per-kind commit work
//!
//! Each commit runs its blocking part on the worker bridge and terminates
//! the request from the callback, after the disk's description reflects the
//! result.

use std::path::PathBuf;
use std::sync::Arc;

use arbiter_types::{
    ArbiterError, Caller, Dissenter, DiskId, Reply, RequestArguments, RequestFlag, RequestId,
    RequestKind,
};
use enumflags2::BitFlags;

use super::RequestState;
use crate::disk::{Disk, Stage};
use crate::engine::Engine;
use crate::engine::jobs::{self, MountJob, Mounted, UnmountJob};
use crate::engine::stages::probed_or_failed;
use crate::policy::{MountDecision, MountTarget, ResolveContext, mount_path, resolve};
use crate::probe::ProbeVerdict;

/// Owned view of a request and its disk at commit time.
struct Staged {
    id: RequestId,
    kind: RequestKind,
    arguments: RequestArguments,
    caller: Caller,
    disk: Disk,
}

impl Engine {
    pub(crate) fn commit(&mut self, id: RequestId) {
        let Some(request) = self.registry.request_mut(id) else {
            return;
        };
        request.state |= RequestState::Committed;
        let Some(request) = self.registry.request(id) else {
            return;
        };
        let Some(disk) = self.registry.live_disk(&request.disk) else {
            return;
        };
        let staged = Staged {
            id,
            kind: request.kind,
            arguments: request.arguments.clone(),
            caller: request.caller.clone(),
            disk: disk.clone(),
        };
        tracing::debug!("Committing {} {} on {}", id, staged.kind, staged.disk.id);

        match staged.kind {
            RequestKind::Claim => self.commit_claim(staged),
            RequestKind::Mount => self.commit_mount(staged),
            RequestKind::Unmount => self.commit_unmount(staged),
            RequestKind::Eject => self.commit_eject(staged),
            RequestKind::Rename => self.commit_rename(staged),
            RequestKind::Probe => self.commit_probe(staged),
            RequestKind::Refresh => self.commit_refresh(staged),
        }
    }

    fn fail(&mut self, id: RequestId, err: ArbiterError) {
        self.terminate(id, Err(Dissenter::new(err)));
    }

    fn commit_claim(&mut self, staged: Staged) {
        if let Some(disk) = self.registry.live_disk_mut(&staged.disk.id) {
            disk.claim = staged.caller.session;
        }
        self.terminate(staged.id, Ok(Reply::Done));
    }

    // === Mount ===

    fn commit_mount(&mut self, staged: Staged) {
        let Staged {
            id,
            arguments,
            caller,
            disk,
            ..
        } = staged;
        let update = arguments.has(RequestFlag::Update);
        let snapshot = arguments.has(RequestFlag::Snapshot);

        let lookup = self.config.lookup(&disk.description);
        let context = ResolveContext {
            options: &arguments.options,
            mount_path: arguments.mount_path.as_deref(),
            ..Default::default()
        };
        let mut plan = match resolve(&disk.description, &lookup, self.config.preferences(), &context)
        {
            MountDecision::Mount(plan) => plan,
            MountDecision::Cancel(reason) => {
                return self.fail(id, ArbiterError::canceled(reason.to_string()));
            }
        };

        if update && let Some(current) = &disk.description.volume_path {
            plan.target = MountTarget::Explicit(current.clone());
            plan.options.push("remount".to_string());
        }
        if snapshot {
            plan.options.retain(|option| option != "rw" && option != "ro");
            plan.options.insert(0, "ro".to_string());
        }

        let Some(plugin) = self.plugin_for(&disk.description) else {
            return self.fail(id, ArbiterError::unsupported(format!("nothing can mount {}", disk.id)));
        };
        let job = MountJob {
            plugin,
            host: Arc::clone(&self.host),
            device: disk.description.device_path.clone(),
            plan,
            repair: disk.requires_repair && !update && !snapshot,
        };

        let disk_id = disk.id.clone();
        self.run_on_worker(&disk.id, "mount", move || job.run(), move |engine: &mut Engine, result| {
            engine.mount_committed(id, &disk_id, caller.uid, update || snapshot, result);
        });
    }

    /// `keep_owner` is set for remounts and snapshots, which leave the
    /// primary mount in place.
    fn mount_committed(
        &mut self,
        id: RequestId,
        disk_id: &DiskId,
        uid: u32,
        keep_owner: bool,
        result: Result<Mounted, ArbiterError>,
    ) {
        let mounted = match result {
            Ok(mounted) => mounted,
            Err(err) => return self.fail(id, err),
        };
        let snapshot = self
            .registry
            .request(id)
            .is_some_and(|request| request.arguments.has(RequestFlag::Snapshot));

        if !snapshot && let Some(disk) = self.registry.live_disk_mut(disk_id) {
            let before = disk.description.clone();
            disk.description.volume_path = Some(mounted.path.clone());
            if !keep_owner {
                disk.context.mount_owner = Some(uid);
                disk.context.owns_mount_dir = mounted.created_dir;
            }
            if mounted.repaired {
                disk.requires_repair = false;
            }
            self.notify_changes(disk_id, &before);
        }
        self.terminate(id, Ok(Reply::Mounted(mounted.path)));
    }

    // === Unmount ===

    fn commit_unmount(&mut self, staged: Staged) {
        let Staged {
            id,
            arguments,
            disk,
            ..
        } = staged;
        let Some(path) = disk.description.volume_path.clone() else {
            return self.fail(id, ArbiterError::not_mounted(format!("{} is not mounted", disk.id)));
        };
        let Some(plugin) = self.plugin_for(&disk.description) else {
            return self.fail(id, ArbiterError::unsupported(format!("nothing can unmount {}", disk.id)));
        };
        let job = UnmountJob {
            plugin,
            host: Arc::clone(&self.host),
            device: disk.description.device_path.clone(),
            path,
            force: arguments.has(RequestFlag::Force),
        };

        let disk_id = disk.id.clone();
        self.run_on_worker(&disk.id, "unmount", move || job.run(), move |engine: &mut Engine, result| {
            match result {
                Ok(()) => {
                    if let Some(disk) = engine.registry.live_disk_mut(&disk_id) {
                        let before = disk.description.clone();
                        disk.description.volume_path = None;
                        disk.context.mount_owner = None;
                        disk.context.owns_mount_dir = false;
                        engine.notify_changes(&disk_id, &before);
                    }
                    engine.terminate(id, Ok(Reply::Done));
                }
                Err(dissenter) => engine.terminate(id, Err(dissenter)),
            }
        });
    }

    // === Eject ===

    fn commit_eject(&mut self, staged: Staged) {
        let Staged {
            id,
            arguments,
            disk,
            ..
        } = staged;
        let device = disk.description.device_path.with_file_name(disk.unit());
        let force = arguments.has(RequestFlag::Force);
        let host = Arc::clone(&self.host);

        self.run_on_worker(
            &disk.id,
            "eject",
            move || host.eject(&device, force),
            move |engine: &mut Engine, result: Result<(), ArbiterError>| match result {
                Ok(()) => engine.terminate(id, Ok(Reply::Done)),
                Err(err) => engine.fail(id, err),
            },
        );
    }

    // === Rename ===

    fn commit_rename(&mut self, staged: Staged) {
        let Staged {
            id,
            arguments,
            disk,
            ..
        } = staged;
        let (Some(name), Some(mount_point)) = (arguments.name, disk.description.volume_path.clone())
        else {
            return self.fail(id, ArbiterError::bad_argument("rename needs a name and a mounted volume"));
        };
        let Some(plugin) = self.plugin_for(&disk.description) else {
            return self.fail(id, ArbiterError::unsupported(format!("nothing can rename {}", disk.id)));
        };

        let device = disk.description.device_path.clone();
        let disk_id = disk.id.clone();
        let new_name = name.clone();
        self.run_on_worker(
            &disk.id,
            "rename",
            move || plugin.rename(&device, &mount_point, &new_name),
            move |engine: &mut Engine, result: Result<(), ArbiterError>| match result {
                Ok(()) => {
                    if let Some(disk) = engine.registry.live_disk_mut(&disk_id) {
                        let before = disk.description.clone();
                        disk.description.volume_name = Some(name);
                        engine.notify_changes(&disk_id, &before);
                    }
                    engine.terminate(id, Ok(Reply::Done));
                }
                Err(err) => engine.fail(id, err),
            },
        );
    }

    // === Probe ===

    fn commit_probe(&mut self, staged: Staged) {
        let Staged { id, disk, .. } = staged;
        let sequencer = self.sequencer.clone();
        let host = Arc::clone(&self.host);
        let description = disk.description.clone();
        let disk_id = disk.id.clone();

        self.run_on_worker(
            &disk.id,
            "probe",
            move || Ok::<_, ArbiterError>(jobs::probe_volume(&sequencer, host.as_ref(), &description)),
            move |engine: &mut Engine, result| {
                let probed = probed_or_failed(result);
                let failure = match &probed.report.verdict {
                    ProbeVerdict::Failed(err) => Some(err.clone()),
                    _ => None,
                };
                let restart = engine
                    .registry
                    .live_disk(&disk_id)
                    .is_some_and(|disk| disk.require_reprobe);
                engine.apply_probe(&disk_id, probed);

                let Some(disk) = engine.registry.live_disk_mut(&disk_id) else {
                    return engine.fail(id, ArbiterError::not_found(format!("{disk_id} is gone")));
                };
                if restart && failure.is_none() {
                    // Peek, mount and appear run again for the fresh volume
                    disk.stages = BitFlags::from(Stage::Probe);
                }
                let description = disk.description.clone();
                match failure {
                    Some(err) => engine.fail(id, err),
                    None => engine.terminate(id, Ok(Reply::Probed(description))),
                }
            },
        );
    }

    // === Refresh ===

    fn commit_refresh(&mut self, staged: Staged) {
        let Staged { id, disk, .. } = staged;
        let host = Arc::clone(&self.host);
        let device = disk.description.device_path.clone();
        let previous = disk.description.volume_path.clone();
        let owned = disk.context.owns_mount_dir;
        let disk_id = disk.id.clone();

        self.run_on_worker(
            &disk.id,
            "refresh",
            move || {
                let current = host.mount_point_of(&device)?;
                if current.is_none()
                    && owned
                    && let Some(previous) = &previous
                {
                    mount_path::release(previous);
                }
                Ok::<_, ArbiterError>(current)
            },
            move |engine: &mut Engine, result: Result<Option<PathBuf>, ArbiterError>| {
                let current = match result {
                    Ok(current) => current,
                    Err(err) => return engine.fail(id, err),
                };
                if let Some(disk) = engine.registry.live_disk_mut(&disk_id) {
                    let before = disk.description.clone();
                    if current.is_none() {
                        disk.context.mount_owner = None;
                        disk.context.owns_mount_dir = false;
                    }
                    disk.description.volume_path = current;
                    if disk.require_reprobe {
                        tracing::info!("Refreshing {} after a failed probe, starting over", disk_id);
                        disk.reset_stages();
                    }
                    engine.notify_changes(&disk_id, &before);
                }
                engine.terminate(id, Ok(Reply::Done));
            },
        );
    }
}
