// SPDX-License-Identifier: GPL-3.0-only

//! Disk registry
//!
//! Owns every disk, unit and request record plus the session list. The
//! engine is the only writer.

use std::collections::{BTreeMap, VecDeque};

use arbiter_types::{DiskId, RequestId};
use tokio::time::Instant;

use crate::disk::Disk;
use crate::request::{Request, RequestState};
use crate::session::SessionList;

/// Aggregate state of one physical unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitState {
    /// A unit-wide command (eject) is running
    pub command_active: bool,
    pub quiesced: bool,
    /// Quiesced because the transport cleared every deadline, not by timeout
    pub quiesced_without_timeout: bool,
}

#[derive(Default)]
pub struct Registry {
    disks: Vec<Disk>,
    units: BTreeMap<String, UnitState>,
    requests: VecDeque<Request>,
    pub sessions: SessionList,
    generations: u64,
}

impl Registry {
    // === Disks ===

    pub fn insert_disk(&mut self, mut disk: Disk) {
        disk.generation = self.next_generation();
        self.units.entry(disk.unit().to_string()).or_default();
        self.disks.push(disk);
    }

    /// Start `id` over for new media. Work already running for it belongs
    /// to the old generation and no longer counts against the record.
    pub fn restart_disk(&mut self, id: &DiskId) -> Option<&mut Disk> {
        let generation = self.next_generation();
        let disk = self.disk_mut(id)?;
        disk.reset_stages();
        disk.generation = generation;
        disk.command_active = false;
        disk.in_flight = 0;
        Some(disk)
    }

    fn next_generation(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }

    pub fn disk(&self, id: &DiskId) -> Option<&Disk> {
        self.disks.iter().find(|disk| &disk.id == id)
    }

    pub fn disk_mut(&mut self, id: &DiskId) -> Option<&mut Disk> {
        self.disks.iter_mut().find(|disk| &disk.id == id)
    }

    /// The disk unless it is a zombie.
    pub fn live_disk(&self, id: &DiskId) -> Option<&Disk> {
        self.disk(id).filter(|disk| !disk.zombie)
    }

    pub fn live_disk_mut(&mut self, id: &DiskId) -> Option<&mut Disk> {
        self.disk_mut(id).filter(|disk| !disk.zombie)
    }

    pub fn remove_disk(&mut self, id: &DiskId) -> Option<Disk> {
        let index = self.disks.iter().position(|disk| &disk.id == id)?;
        let disk = self.disks.remove(index);
        if !self.disks.iter().any(|other| other.unit() == disk.unit()) {
            self.units.remove(disk.unit());
        }
        Some(disk)
    }

    pub fn disks(&self) -> impl Iterator<Item = &Disk> {
        self.disks.iter()
    }

    /// Ids in arrival order.
    pub fn disk_ids(&self) -> Vec<DiskId> {
        self.disks.iter().map(|disk| disk.id.clone()).collect()
    }

    /// Live disks sharing `unit`, in arrival order.
    pub fn unit_disks<'a>(&'a self, unit: &'a str) -> impl Iterator<Item = &'a Disk> + 'a {
        self.disks
            .iter()
            .filter(move |disk| !disk.zombie && disk.unit() == unit)
    }

    // === Units ===

    pub fn unit(&self, unit: &str) -> UnitState {
        self.units.get(unit).copied().unwrap_or_default()
    }

    pub fn set_unit_command_active(&mut self, unit: &str, active: bool) {
        if let Some(state) = self.units.get_mut(unit) {
            state.command_active = active;
        }
    }

    /// Whether `disk` or its unit has a command running.
    pub fn is_disk_busy(&self, disk: &Disk) -> bool {
        disk.command_active || self.unit(disk.unit()).command_active
    }

    /// Recompute quiescence at `now`. Returns units that just became quiet.
    pub fn update_quiescence(&mut self, now: Instant) -> Vec<(String, UnitState)> {
        for disk in &mut self.disks {
            if let Some(deadline) = disk.busy_until
                && deadline <= now
            {
                disk.busy_until = None;
                disk.settled_by_timeout = true;
            }
        }

        let mut newly_quiet = Vec::new();
        for (unit, state) in &mut self.units {
            let members: Vec<&Disk> = self
                .disks
                .iter()
                .filter(|disk| !disk.zombie && disk.unit() == unit)
                .collect();
            let quiesced = members.iter().all(|disk| disk.busy_until.is_none());
            let was_quiesced = state.quiesced;

            state.quiesced = quiesced;
            state.quiesced_without_timeout =
                quiesced && !members.iter().any(|disk| disk.settled_by_timeout);
            if quiesced && !was_quiesced {
                newly_quiet.push((unit.clone(), *state));
            }
        }
        newly_quiet
    }

    /// Nearest busy deadline still in the future.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.disks.iter().filter_map(|disk| disk.busy_until).min()
    }

    // === Requests ===

    pub fn push_request(&mut self, request: Request) {
        self.requests.push_back(request);
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.iter().find(|request| request.id == id)
    }

    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.iter_mut().find(|request| request.id == id)
    }

    pub fn take_request(&mut self, id: RequestId) -> Option<Request> {
        let index = self.requests.iter().position(|request| request.id == id)?;
        self.requests.remove(index)
    }

    pub fn requests_mut(&mut self) -> impl Iterator<Item = &mut Request> {
        self.requests.iter_mut()
    }

    /// Queued request ids in submission order.
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|request| request.id).collect()
    }

    pub fn requests_for(&self, disk: &DiskId) -> Vec<RequestId> {
        self.requests
            .iter()
            .filter(|request| &request.disk == disk)
            .map(|request| request.id)
            .collect()
    }

    /// Requests on `disk` past precondition, holding it command-active.
    pub fn dispatched_for(&self, disk: &DiskId) -> Vec<RequestId> {
        self.requests
            .iter()
            .filter(|request| {
                &request.disk == disk && request.state.contains(RequestState::Dispatched)
            })
            .map(|request| request.id)
            .collect()
    }

    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }
}
