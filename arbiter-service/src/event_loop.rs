// SPDX-License-Identifier: GPL-3.0-only

//! Single-threaded event loop
//!
//! All engine state is mutated from one task. Device sources, clients, timers
//! and async answers reach it as [`Event`]s; worker threads reach it through
//! the wake channel of the [`WorkerBridge`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arbiter_contracts::ClientSession;
use arbiter_sys::DeviceEvent;
use arbiter_types::{
    ArbiterError, Caller, DiskDescription, DiskId, Dissenter, RequestArguments, RequestId,
    RequestKind, SessionId,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::engine::{Engine, EngineParts};
use crate::request::{Completion, Request, Ticket};
use crate::worker::WorkerBridge;

pub enum Event {
    DeviceArrived {
        disk: DiskId,
        description: DiskDescription,
        busy_for: Option<Duration>,
    },
    DeviceRemoved {
        disk: DiskId,
    },
    /// The transport moved (or cleared) a disk's busy deadline
    BusyChanged {
        disk: DiskId,
        busy_for: Option<Duration>,
    },
    Submit(Request),
    RegisterSession {
        id: SessionId,
        session: Arc<dyn ClientSession>,
    },
    UnregisterSession {
        id: SessionId,
    },
    Dispatch,
    /// The busy timer armed for this deadline fired
    BusyTimer(Instant),
    IdleExpired,
    ZombieExpired {
        disk: DiskId,
    },
    PeekAnswered {
        disk: DiskId,
        generation: u64,
        vetoed: bool,
    },
    ApprovalResolved {
        request: RequestId,
        dissenter: Option<Dissenter>,
    },
    AuthorizationResolved {
        request: RequestId,
        result: Result<(), ArbiterError>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Cloneable entry point into a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    events: mpsc::UnboundedSender<Event>,
    ids: Arc<AtomicU64>,
    liveness: watch::Receiver<bool>,
}

impl LoopHandle {
    /// Queue an event. Returns false once the loop has stopped.
    pub fn post(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    pub fn device_arrived(
        &self,
        disk: DiskId,
        description: DiskDescription,
        busy_for: Option<Duration>,
    ) {
        self.post(Event::DeviceArrived {
            disk,
            description,
            busy_for,
        });
    }

    pub fn device_removed(&self, disk: DiskId) {
        self.post(Event::DeviceRemoved { disk });
    }

    pub fn busy_changed(&self, disk: DiskId, busy_for: Option<Duration>) {
        self.post(Event::BusyChanged { disk, busy_for });
    }

    /// Forward a discovery event.
    pub fn apply(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Arrived {
                disk,
                description,
                busy_for,
            } => self.device_arrived(disk, description, busy_for),
            DeviceEvent::Removed { disk } => self.device_removed(disk),
        }
    }

    pub fn submit(
        &self,
        kind: RequestKind,
        disk: DiskId,
        arguments: RequestArguments,
        caller: Caller,
    ) -> Ticket {
        let id = self.next_request_id();
        let (completion, receiver) = Completion::channel();
        let request = Request::new(id, kind, disk, arguments, caller, completion);
        // A stopped loop drops the request, which the ticket reads as canceled
        self.post(Event::Submit(request));
        Ticket::new(id, receiver)
    }

    pub fn register_session(&self, session: Arc<dyn ClientSession>) -> SessionId {
        let id = SessionId(self.ids.fetch_add(1, Ordering::Relaxed));
        self.post(Event::RegisterSession { id, session });
        id
    }

    pub fn unregister_session(&self, id: SessionId) {
        self.post(Event::UnregisterSession { id });
    }

    pub fn shutdown(&self) {
        self.post(Event::Shutdown);
    }

    /// `true` while the engine has work outstanding.
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.clone()
    }
}

pub struct EventLoop {
    engine: Engine,
    events: mpsc::UnboundedReceiver<Event>,
    wake: mpsc::Receiver<()>,
}

impl EventLoop {
    pub fn new(parts: EngineParts) -> (Self, LoopHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (liveness_tx, liveness_rx) = watch::channel(true);

        let handle = LoopHandle {
            events: event_tx,
            ids: Arc::new(AtomicU64::new(1)),
            liveness: liveness_rx,
        };
        let worker = WorkerBridge::new(wake_tx, parts.config.preferences().worker_limit);
        let engine = Engine::new(parts, handle.clone(), worker, liveness_tx);

        (
            Self {
                engine,
                events: event_rx,
                wake: wake_rx,
            },
            handle,
        )
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Wait for and process one event or worker wake-up.
    pub async fn turn(&mut self) -> Flow {
        tokio::select! {
            biased;
            Some(()) = self.wake.recv() => {
                self.engine.deliver_finished();
                Flow::Continue
            }
            event = self.events.recv() => match event {
                Some(event) => self.engine.handle(event),
                None => Flow::Exit,
            },
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Event loop running");
        while self.turn().await == Flow::Continue {}
        tracing::info!("Event loop stopped");
    }

    /// Process events until the engine is idle with nothing queued.
    pub async fn run_until_idle(&mut self) -> Flow {
        loop {
            if self.engine.is_idle() && self.events.is_empty() && self.wake.is_empty() {
                return Flow::Continue;
            }
            if self.turn().await == Flow::Exit {
                return Flow::Exit;
            }
        }
    }
}
