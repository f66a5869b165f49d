// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::time::Duration;

use arbiter_types::DiskId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::event_loop::{Event, LoopHandle};

/// One-shot timers that post back into the loop.
#[derive(Default)]
pub(crate) struct Timers {
    busy: Option<(Instant, CancellationToken)>,
    idle: Option<CancellationToken>,
    zombies: HashMap<DiskId, CancellationToken>,
}

impl Timers {
    /// Keep a single busy timer armed at `deadline`.
    pub fn arm_busy(&mut self, handle: &LoopHandle, deadline: Option<Instant>) {
        match (deadline, &self.busy) {
            (Some(deadline), Some((armed, _))) if *armed == deadline => {}
            (Some(deadline), _) => {
                self.cancel_busy();
                let token = schedule(handle, deadline, Event::BusyTimer(deadline));
                self.busy = Some((deadline, token));
            }
            (None, _) => self.cancel_busy(),
        }
    }

    /// Forget the busy timer if it is the one that fired.
    pub fn busy_fired(&mut self, deadline: Instant) {
        if self.busy.as_ref().is_some_and(|(armed, _)| *armed == deadline) {
            self.busy = None;
        }
    }

    fn cancel_busy(&mut self) {
        if let Some((_, token)) = self.busy.take() {
            token.cancel();
        }
    }

    pub fn arm_idle(&mut self, handle: &LoopHandle, after: Duration) {
        self.cancel_idle();
        self.idle = Some(schedule(handle, Instant::now() + after, Event::IdleExpired));
    }

    pub fn cancel_idle(&mut self) {
        if let Some(token) = self.idle.take() {
            token.cancel();
        }
    }

    pub fn arm_zombie(&mut self, handle: &LoopHandle, disk: DiskId, after: Duration) {
        let event = Event::ZombieExpired { disk: disk.clone() };
        let token = schedule(handle, Instant::now() + after, event);
        if let Some(previous) = self.zombies.insert(disk, token) {
            previous.cancel();
        }
    }

    pub fn cancel_zombie(&mut self, disk: &DiskId) {
        if let Some(token) = self.zombies.remove(disk) {
            token.cancel();
        }
    }
}

fn schedule(handle: &LoopHandle, deadline: Instant, event: Event) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = handle.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                handle.post(event);
            }
        }
    });
    token
}
