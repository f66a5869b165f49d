// SPDX-License-Identifier: GPL-3.0-only

//! Stage engine
//!
//! Every disk walks probe, peek, mount and appear in order. Any change of
//! state calls [`Engine::signal`], which coalesces into a single dispatch
//! pass: advance each disk as far as it can go, dispatch whatever requests
//! became eligible, then rearm timers and decide whether the engine is idle.

pub(crate) mod jobs;
pub(crate) mod stages;
mod timers;

use std::sync::Arc;
use std::time::Duration;

use arbiter_contracts::{Authorizer, FilesystemPlugin, HostSystem};
use arbiter_types::{
    ArbiterError, DiskDescription, DiskId, Dissenter, Notification, SessionId,
};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{ConfigStore, Preferences};
use crate::disk::Disk;
use crate::event_loop::{Event, Flow, LoopHandle};
use crate::probe::ProbeSequencer;
use crate::registry::{Registry, UnitState};
use crate::worker::WorkerBridge;
use timers::Timers;

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub config: ConfigStore,
    pub sequencer: ProbeSequencer,
    pub host: Arc<dyn HostSystem>,
    pub authorizer: Arc<dyn Authorizer>,
}

pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) config: ConfigStore,
    pub(crate) sequencer: ProbeSequencer,
    pub(crate) host: Arc<dyn HostSystem>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) worker: WorkerBridge<Engine>,
    pub(crate) handle: LoopHandle,
    timers: Timers,
    liveness: watch::Sender<bool>,
    dispatch_scheduled: bool,
    idle: bool,
    /// Configuration files are rechecked on the first pass after waking
    config_stale: bool,
    passes: u64,
}

impl Engine {
    pub(crate) fn new(
        parts: EngineParts,
        handle: LoopHandle,
        worker: WorkerBridge<Engine>,
        liveness: watch::Sender<bool>,
    ) -> Self {
        tracing::info!(
            "Engine starting with {} probe candidates, mounting under {}",
            parts.sequencer.len(),
            parts.config.preferences().mount_base.display()
        );
        let mut engine = Self {
            registry: Registry::default(),
            config: parts.config,
            sequencer: parts.sequencer,
            host: parts.host,
            authorizer: parts.authorizer,
            worker,
            handle,
            timers: Timers::default(),
            liveness,
            dispatch_scheduled: false,
            idle: false,
            config_stale: false,
            passes: 0,
        };
        engine.signal();
        engine
    }

    // === Inspection ===

    pub fn disk(&self, id: &DiskId) -> Option<&Disk> {
        self.registry.disk(id)
    }

    pub fn description(&self, id: &DiskId) -> Option<&DiskDescription> {
        self.registry.live_disk(id).map(|disk| &disk.description)
    }

    pub fn unit(&self, unit: &str) -> UnitState {
        self.registry.unit(unit)
    }

    pub fn disk_count(&self) -> usize {
        self.registry.disks().count()
    }

    pub fn queued_requests(&self) -> usize {
        self.registry.request_ids().len()
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Dispatch passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn preferences(&self) -> &Preferences {
        self.config.preferences()
    }

    // === Scheduling ===

    /// Note that something changed. Any number of calls before the next pass
    /// result in exactly one pass.
    pub fn signal(&mut self) {
        if self.idle {
            self.idle = false;
            self.config_stale = true;
            self.liveness.send_replace(true);
            self.timers.cancel_idle();
        }
        if !self.dispatch_scheduled {
            self.dispatch_scheduled = true;
            self.handle.post(Event::Dispatch);
        }
    }

    pub(crate) fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::DeviceArrived {
                disk,
                description,
                busy_for,
            } => self.device_arrived(disk, description, busy_for),
            Event::DeviceRemoved { disk } => self.device_removed(&disk),
            Event::BusyChanged { disk, busy_for } => self.busy_changed(&disk, busy_for),
            Event::Submit(request) => self.submit(request),
            Event::RegisterSession { id, session } => {
                self.registry.sessions.register(id, session);
                self.signal();
            }
            Event::UnregisterSession { id } => self.unregister_session(id),
            Event::Dispatch => {
                self.dispatch_scheduled = false;
                self.dispatch_pass();
            }
            Event::BusyTimer(deadline) => {
                self.timers.busy_fired(deadline);
                self.signal();
            }
            Event::IdleExpired => {
                if self.idle && self.config.preferences().exit_on_idle {
                    tracing::info!("Idle timeout reached, exiting");
                    return Flow::Exit;
                }
            }
            Event::ZombieExpired { disk } => {
                if self.registry.disk(&disk).is_some_and(|d| d.zombie) {
                    tracing::warn!("Giving up on outstanding work for removed disk {}", disk);
                    self.destroy_disk(&disk);
                    self.signal();
                }
            }
            Event::PeekAnswered {
                disk,
                generation,
                vetoed,
            } => self.peek_answered(&disk, generation, vetoed),
            Event::ApprovalResolved { request, dissenter } => {
                self.approval_resolved(request, dissenter)
            }
            Event::AuthorizationResolved { request, result } => {
                self.authorization_resolved(request, result)
            }
            Event::Shutdown => {
                tracing::info!("Shutdown requested");
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Hand finished worker results to their callbacks.
    pub(crate) fn deliver_finished(&mut self) {
        let worker = self.worker.clone();
        worker.drain(self);
    }

    fn dispatch_pass(&mut self) {
        self.passes += 1;
        if std::mem::take(&mut self.config_stale) && self.config.refresh() {
            tracing::info!("Configuration reloaded");
        }

        let now = Instant::now();
        for (unit, state) in self.registry.update_quiescence(now) {
            tracing::debug!(
                "Unit {} quiesced{}",
                unit,
                if state.quiesced_without_timeout {
                    ""
                } else {
                    " by timeout"
                }
            );
        }

        for id in self.registry.disk_ids() {
            self.advance_disk(&id, now);
        }
        self.dispatch_requests();

        let deadline = self.registry.earliest_deadline();
        self.timers.arm_busy(&self.handle, deadline);
        self.update_idle();
    }

    fn update_idle(&mut self) {
        let settled = self
            .registry
            .disks()
            .all(|disk| disk.zombie || disk.is_settled());
        let quiet = settled
            && !self.dispatch_scheduled
            && !self.registry.has_requests()
            && self.worker.pending() == 0;
        if !quiet || self.idle {
            return;
        }

        self.idle = true;
        self.liveness.send_replace(false);
        tracing::debug!("Engine idle after {} passes", self.passes);
        let preferences = self.config.preferences();
        if preferences.exit_on_idle {
            let after = preferences.idle_timeout();
            self.timers.arm_idle(&self.handle, after);
        }
    }

    // === Device events ===

    fn device_arrived(
        &mut self,
        id: DiskId,
        description: DiskDescription,
        busy_for: Option<Duration>,
    ) {
        let busy_until = busy_for.map(|after| Instant::now() + after);

        if self.registry.disk(&id).is_some_and(|disk| disk.zombie) {
            self.destroy_disk(&id);
        }

        if let Some(disk) = self.registry.disk(&id) {
            tracing::info!("Media changed on {}, starting over", id);
            let before = disk.description.clone();
            let appeared = disk.has_appeared();

            // Their worker results would describe the old media
            for request in self.registry.dispatched_for(&id) {
                self.terminate(
                    request,
                    Err(Dissenter::new(ArbiterError::canceled(format!(
                        "media in {id} changed"
                    )))),
                );
            }
            if let Some(disk) = self.registry.restart_disk(&id) {
                disk.description = description;
                disk.busy_until = busy_until;
                disk.settled_by_timeout = false;
            }
            if appeared {
                self.notify_changes(&id, &before);
            }
        } else {
            tracing::info!(
                "Disk {} arrived ({}, {} bytes)",
                id,
                description.device_path.display(),
                description.media_size
            );
            self.registry
                .insert_disk(Disk::new(id, description, busy_until));
        }
        self.signal();
    }

    fn device_removed(&mut self, id: &DiskId) {
        let Some(disk) = self.registry.live_disk(id) else {
            return;
        };
        let appeared = disk.has_appeared();
        tracing::info!("Disk {} removed", id);

        for request in self.registry.requests_for(id) {
            self.terminate(
                request,
                Err(Dissenter::new(ArbiterError::not_found(format!(
                    "{id} was removed"
                )))),
            );
        }

        let in_flight = self.registry.disk(id).map_or(0, |disk| disk.in_flight);
        if in_flight > 0 {
            if let Some(disk) = self.registry.disk_mut(id) {
                disk.zombie = true;
            }
            let after = self.config.preferences().zombie_timeout();
            self.timers.arm_zombie(&self.handle, id.clone(), after);
            tracing::debug!("{} kept as zombie for {} outstanding jobs", id, in_flight);
        } else {
            self.destroy_disk(id);
        }

        if appeared {
            self.notify(Notification::Disappeared { disk: id.clone() });
        }
        self.signal();
    }

    fn busy_changed(&mut self, id: &DiskId, busy_for: Option<Duration>) {
        if let Some(disk) = self.registry.live_disk_mut(id) {
            disk.busy_until = busy_for.map(|after| Instant::now() + after);
            self.signal();
        }
    }

    pub(crate) fn destroy_disk(&mut self, id: &DiskId) {
        self.timers.cancel_zombie(id);
        if self.registry.remove_disk(id).is_some() {
            tracing::debug!("Destroyed {}", id);
        }
    }

    fn unregister_session(&mut self, id: SessionId) {
        if !self.registry.sessions.unregister(id) {
            return;
        }
        for disk_id in self.registry.disk_ids() {
            if let Some(disk) = self.registry.disk_mut(&disk_id)
                && disk.claim == Some(id)
            {
                tracing::info!("Releasing claim of {} on {}", id, disk_id);
                disk.claim = None;
            }
        }
        self.signal();
    }

    // === Helpers ===

    pub(crate) fn notify(&self, notification: Notification) {
        self.registry.sessions.notify(&notification);
    }

    /// Tell sessions what moved on `id` since `before`.
    pub(crate) fn notify_changes(&self, id: &DiskId, before: &DiskDescription) {
        let Some(disk) = self.registry.live_disk(id) else {
            return;
        };
        let keys = before.diff(&disk.description);
        if !keys.is_empty() {
            self.notify(Notification::DescriptionChanged {
                disk: id.clone(),
                keys,
                description: disk.description.clone(),
            });
        }
    }

    pub(crate) fn plugin_for(&self, description: &DiskDescription) -> Option<Arc<dyn FilesystemPlugin>> {
        description
            .volume_kind
            .as_deref()
            .and_then(|kind| self.sequencer.plugin_for(kind))
    }

    /// Run blocking work for `disk`, keeping it alive as a zombie until the
    /// result is delivered. The callback is skipped if the disk started over
    /// or was replaced in the meantime.
    pub(crate) fn run_on_worker<T, E, W, C>(&mut self, disk: &DiskId, label: &str, work: W, callback: C)
    where
        T: Send + 'static,
        E: From<ArbiterError> + Send + 'static,
        W: FnOnce() -> Result<T, E> + Send + 'static,
        C: FnOnce(&mut Engine, Result<T, E>) + Send + 'static,
    {
        let generation = match self.registry.disk_mut(disk) {
            Some(record) => {
                record.in_flight += 1;
                Some(record.generation)
            }
            None => None,
        };
        let disk = disk.clone();
        let job = label.to_string();
        let worker = self.worker.clone();
        worker.execute(self, label, work, move |engine: &mut Engine, result| {
            if engine.job_delivered(&disk, generation) {
                callback(engine, result);
            } else {
                tracing::debug!("Dropping stale {} result for {}", job, disk);
                engine.signal();
            }
        });
    }

    /// Account for a finished job. False when its result no longer applies.
    fn job_delivered(&mut self, id: &DiskId, generation: Option<u64>) -> bool {
        let Some(disk) = self.registry.disk_mut(id) else {
            return generation.is_none();
        };
        if generation != Some(disk.generation) {
            return false;
        }
        disk.in_flight = disk.in_flight.saturating_sub(1);
        if disk.zombie && disk.in_flight == 0 {
            tracing::debug!("Last job for removed disk {} delivered", id);
            self.destroy_disk(id);
            self.signal();
        }
        true
    }
}
