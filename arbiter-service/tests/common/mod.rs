// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arbiter_contracts::{Authorizer, ClientSession, FilesystemPlugin, HostSystem};
use arbiter_service::{
    ConfigStore, Engine, EngineParts, EventLoop, Flow, LoopHandle, Overrides, Preferences,
    ProbeCandidate, ProbeSequencer, Ticket,
};
use arbiter_types::{
    ApprovalQuery, ArbiterError, Caller, DiskDescription, DiskId, Dissenter, Interest,
    Notification, PeekVerdict, ProbeOutcome, RequestArguments, RequestKind, RequestOutcome,
};
use async_trait::async_trait;
use enumflags2::BitFlags;
use tempfile::TempDir;

// === Mount table ===

/// What the fake kernel believes is mounted, by device.
#[derive(Default)]
pub struct FakeMountTable {
    entries: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl FakeMountTable {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mount_point_of(&self, device: &Path) -> Option<PathBuf> {
        self.entries.lock().unwrap().get(device).cloned()
    }

    pub fn insert(&self, device: &Path, mount_point: &Path) {
        self.entries
            .lock()
            .unwrap()
            .insert(device.to_path_buf(), mount_point.to_path_buf());
    }

    pub fn remove_mount_point(&self, mount_point: &Path) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, mounted| mounted != mount_point);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

// === Plugin ===

#[derive(Clone)]
pub enum ProbeBehavior {
    Recognize { name: Option<String>, clean: bool },
    Unsupported,
    Fail,
}

/// Blocks probes until opened.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, wake) = &*self.state;
        *open.lock().unwrap() = true;
        wake.notify_all();
    }

    fn wait(&self) {
        let (open, wake) = &*self.state;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = wake.wait(guard).unwrap();
        }
    }
}

pub struct FakePlugin {
    kind: String,
    table: Arc<FakeMountTable>,
    behavior: Mutex<ProbeBehavior>,
    ignored: Mutex<HashSet<PathBuf>>,
    gate: Mutex<Option<Gate>>,
    fail_mount: AtomicBool,
    fail_unmount: AtomicBool,
    /// A failed unmount still drops the table entry
    unmount_fails_stale: AtomicBool,
    pub probes: AtomicUsize,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
    pub mount_options: Mutex<Vec<Vec<String>>>,
    pub renamed: Mutex<Vec<String>>,
}

impl FakePlugin {
    pub fn new(kind: &str, table: &Arc<FakeMountTable>, behavior: ProbeBehavior) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.to_string(),
            table: Arc::clone(table),
            behavior: Mutex::new(behavior),
            ignored: Mutex::new(HashSet::new()),
            gate: Mutex::new(None),
            fail_mount: AtomicBool::new(false),
            fail_unmount: AtomicBool::new(false),
            unmount_fails_stale: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            mount_options: Mutex::new(Vec::new()),
            renamed: Mutex::new(Vec::new()),
        })
    }

    pub fn recognizing(kind: &str, table: &Arc<FakeMountTable>, name: Option<&str>) -> Arc<Self> {
        Self::new(
            kind,
            table,
            ProbeBehavior::Recognize {
                name: name.map(str::to_string),
                clean: true,
            },
        )
    }

    pub fn set_behavior(&self, behavior: ProbeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Report "not my format" for `device` whatever the behavior.
    pub fn ignore(&self, device: &str) {
        self.ignored.lock().unwrap().insert(PathBuf::from(device));
    }

    pub fn gate_probes(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_mounts(&self) {
        self.fail_mount.store(true, Ordering::SeqCst);
    }

    pub fn fail_unmounts(&self, stale: bool) {
        self.fail_unmount.store(true, Ordering::SeqCst);
        self.unmount_fails_stale.store(stale, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl FilesystemPlugin for FakePlugin {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn probe(&self, device: &Path) -> Result<ProbeOutcome, ArbiterError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait();
        }
        if self.ignored.lock().unwrap().contains(device) {
            return Err(ArbiterError::unsupported("ignored"));
        }
        match self.behavior.lock().unwrap().clone() {
            ProbeBehavior::Recognize { name, clean } => Ok(ProbeOutcome {
                kind: self.kind.clone(),
                name,
                uuid: Some("1234-ABCD".to_string()),
                clean,
            }),
            ProbeBehavior::Unsupported => Err(ArbiterError::unsupported("not this format")),
            ProbeBehavior::Fail => Err(ArbiterError::from(std::io::Error::from_raw_os_error(
                libc::EIO,
            ))),
        }
    }

    fn mount(
        &self,
        device: &Path,
        mount_point: &Path,
        options: &[String],
    ) -> Result<(), ArbiterError> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        self.mount_options.lock().unwrap().push(options.to_vec());
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(ArbiterError::busy("device busy"));
        }
        self.table.insert(device, mount_point);
        Ok(())
    }

    fn unmount(&self, mount_point: &Path, _force: bool) -> Result<(), ArbiterError> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount.load(Ordering::SeqCst) {
            if self.unmount_fails_stale.load(Ordering::SeqCst) {
                self.table.remove_mount_point(mount_point);
            }
            return Err(ArbiterError::busy("target is busy"));
        }
        self.table.remove_mount_point(mount_point);
        Ok(())
    }

    fn rename(&self, _device: &Path, _mount_point: &Path, name: &str) -> Result<(), ArbiterError> {
        self.renamed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// === Host ===

pub struct FakeHost {
    table: Arc<FakeMountTable>,
    pub pids: Mutex<Vec<i32>>,
    pub console_user: Mutex<Option<u32>>,
    pub ejected: Mutex<Vec<PathBuf>>,
}

impl FakeHost {
    pub fn new(table: &Arc<FakeMountTable>) -> Arc<Self> {
        Arc::new(Self {
            table: Arc::clone(table),
            pids: Mutex::new(Vec::new()),
            console_user: Mutex::new(Some(1000)),
            ejected: Mutex::new(Vec::new()),
        })
    }
}

impl HostSystem for FakeHost {
    fn mount_point_of(&self, device: &Path) -> Result<Option<PathBuf>, ArbiterError> {
        Ok(self.table.mount_point_of(device))
    }

    fn processes_using(&self, _path: &Path) -> Vec<i32> {
        self.pids.lock().unwrap().clone()
    }

    fn eject(&self, device: &Path, _force: bool) -> Result<(), ArbiterError> {
        self.ejected.lock().unwrap().push(device.to_path_buf());
        Ok(())
    }

    fn console_user(&self) -> Option<u32> {
        *self.console_user.lock().unwrap()
    }
}

// === Sessions ===

pub struct ScriptedSession {
    interests: BitFlags<Interest>,
    peek: PeekVerdict,
    approve: Mutex<Option<Dissenter>>,
    release: Mutex<Option<Dissenter>>,
    pub asked: AtomicUsize,
    pub heard: Mutex<Vec<Notification>>,
}

impl ScriptedSession {
    pub fn new(interests: BitFlags<Interest>) -> Arc<Self> {
        Self::with_peek(interests, PeekVerdict::Proceed)
    }

    pub fn with_peek(interests: BitFlags<Interest>, peek: PeekVerdict) -> Arc<Self> {
        Arc::new(Self {
            interests,
            peek,
            approve: Mutex::new(None),
            release: Mutex::new(None),
            asked: AtomicUsize::new(0),
            heard: Mutex::new(Vec::new()),
        })
    }

    pub fn listener() -> Arc<Self> {
        Self::new(Interest::Notify.into())
    }

    pub fn dissent(&self, dissenter: Dissenter) {
        *self.approve.lock().unwrap() = Some(dissenter);
    }

    pub fn refuse_release(&self, dissenter: Dissenter) {
        *self.release.lock().unwrap() = Some(dissenter);
    }

    pub fn heard(&self) -> Vec<Notification> {
        self.heard.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientSession for ScriptedSession {
    fn interests(&self) -> BitFlags<Interest> {
        self.interests
    }

    async fn peek(&self, _description: &DiskDescription) -> PeekVerdict {
        self.peek
    }

    async fn approve(&self, _query: &ApprovalQuery) -> Option<Dissenter> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.approve.lock().unwrap().clone()
    }

    async fn release_claim(&self, _query: &ApprovalQuery) -> Option<Dissenter> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.release.lock().unwrap().clone()
    }

    fn notify(&self, notification: &Notification) {
        self.heard.lock().unwrap().push(notification.clone());
    }
}

// === Authorizers ===

pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _caller: &Caller, _action_id: &str) -> Result<(), ArbiterError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct DenyAll {
    pub asked: AtomicUsize,
}

#[async_trait]
impl Authorizer for DenyAll {
    async fn authorize(&self, caller: &Caller, action_id: &str) -> Result<(), ArbiterError> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Err(ArbiterError::not_privileged(format!(
            "uid {} may not {action_id}",
            caller.uid
        )))
    }
}

// === Harness ===

pub struct HarnessBuilder {
    table: Arc<FakeMountTable>,
    preferences: Preferences,
    candidates: Vec<ProbeCandidate>,
    authorizer: Arc<dyn Authorizer>,
    config_file: Option<PathBuf>,
}

impl HarnessBuilder {
    pub fn plugin(mut self, plugin: Arc<FakePlugin>) -> Self {
        let priority = self.candidates.len() as u32;
        self.candidates.push(ProbeCandidate::new(plugin, priority));
        self
    }

    pub fn candidate(mut self, candidate: ProbeCandidate) -> Self {
        self.candidates.push(candidate);
        self
    }

    pub fn preferences(mut self, edit: impl FnOnce(&mut Preferences)) -> Self {
        edit(&mut self.preferences);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Read preferences from `path` instead of the builder's fixed set.
    pub fn config_file(mut self, path: &Path) -> Self {
        self.config_file = Some(path.to_path_buf());
        self
    }

    pub fn build(self) -> Harness {
        let mount_base = tempfile::tempdir().unwrap();
        let mut preferences = self.preferences;
        preferences.mount_base = mount_base.path().to_path_buf();

        let config = match &self.config_file {
            Some(path) => {
                let overrides = Overrides {
                    mount_base: Some(preferences.mount_base.clone()),
                    ..Default::default()
                };
                ConfigStore::open(path, overrides).unwrap()
            }
            None => ConfigStore::fixed(preferences, Vec::new(), Vec::new()),
        };

        let host = FakeHost::new(&self.table);
        let parts = EngineParts {
            config,
            sequencer: ProbeSequencer::new(self.candidates),
            host: host.clone(),
            authorizer: self.authorizer,
        };
        let (event_loop, handle) = EventLoop::new(parts);
        Harness {
            event_loop,
            handle,
            host,
            table: self.table,
            mount_base,
        }
    }
}

pub struct Harness {
    pub event_loop: EventLoop,
    pub handle: LoopHandle,
    pub host: Arc<FakeHost>,
    pub table: Arc<FakeMountTable>,
    pub mount_base: TempDir,
}

impl Harness {
    pub fn builder(table: &Arc<FakeMountTable>) -> HarnessBuilder {
        HarnessBuilder {
            table: Arc::clone(table),
            preferences: Preferences::default(),
            candidates: Vec::new(),
            authorizer: Arc::new(AllowAll),
            config_file: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        self.event_loop.engine()
    }

    pub fn base(&self) -> &Path {
        self.mount_base.path()
    }

    pub fn arrive(&self, description: DiskDescription) -> DiskId {
        let disk = disk_id(&description);
        self.handle.device_arrived(disk.clone(), description, None);
        disk
    }

    pub fn arrive_busy(&self, description: DiskDescription, busy_for: Duration) -> DiskId {
        let disk = disk_id(&description);
        self.handle
            .device_arrived(disk.clone(), description, Some(busy_for));
        disk
    }

    pub async fn settle(&mut self) {
        assert_eq!(self.event_loop.run_until_idle().await, Flow::Continue);
    }

    /// Turn the loop until `done` holds for the engine.
    pub async fn turn_until(&mut self, done: impl Fn(&Engine) -> bool) {
        while !done(self.event_loop.engine()) {
            assert_eq!(self.event_loop.turn().await, Flow::Continue);
        }
    }

    pub fn submit(&self, kind: RequestKind, disk: &DiskId, caller: Caller) -> Ticket {
        self.submit_with(kind, disk, RequestArguments::default(), caller)
    }

    pub fn submit_with(
        &self,
        kind: RequestKind,
        disk: &DiskId,
        arguments: RequestArguments,
        caller: Caller,
    ) -> Ticket {
        self.handle.submit(kind, disk.clone(), arguments, caller)
    }

    /// Run until idle and return the ticket's outcome.
    pub async fn finish(&mut self, mut ticket: Ticket) -> RequestOutcome {
        self.settle().await;
        ticket.try_outcome().expect("outcome delivered by the time the engine idles")
    }

    pub fn description(&self, disk: &DiskId) -> DiskDescription {
        self.engine()
            .description(disk)
            .cloned()
            .expect("disk is registered")
    }
}

fn disk_id(description: &DiskDescription) -> DiskId {
    let name = description
        .device_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    DiskId::new(name)
}

/// A removable USB partition on `unit`.
pub fn usb_stick(name: &str, unit: &str) -> DiskDescription {
    DiskDescription {
        device_path: PathBuf::from(format!("/dev/{name}")),
        unit: unit.to_string(),
        whole: name == unit,
        bus: Some("usb".to_string()),
        media_size: 8 << 30,
        writable: true,
        removable: true,
        ejectable: true,
        internal: false,
        ..Default::default()
    }
}
