// SPDX-License-Identifier: GPL-3.0-only

//! Worker thread bridge
//!
//! Blocking calls run on short-lived threads. Each finished thread marks its
//! job record and nudges the loop through a depth-1 channel; the loop then
//! drains every finished record in the order the jobs were started.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arbiter_types::ArbiterError;
use tokio::sync::mpsc;

type Delivery<Ctx> = Box<dyn FnOnce(&mut Ctx) + Send>;

struct JobRecord<Ctx> {
    id: u64,
    label: String,
    finished: Option<Delivery<Ctx>>,
}

struct JobList<Ctx> {
    next_id: u64,
    jobs: VecDeque<JobRecord<Ctx>>,
}

pub struct WorkerBridge<Ctx> {
    jobs: Arc<Mutex<JobList<Ctx>>>,
    wake: mpsc::Sender<()>,
    running: Arc<AtomicUsize>,
    limit: usize,
}

impl<Ctx> Clone for WorkerBridge<Ctx> {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            wake: self.wake.clone(),
            running: Arc::clone(&self.running),
            limit: self.limit,
        }
    }
}

impl<Ctx: 'static> WorkerBridge<Ctx> {
    /// `wake` should come from `mpsc::channel(1)`; wake-ups coalesce.
    pub fn new(wake: mpsc::Sender<()>, limit: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(JobList {
                next_id: 0,
                jobs: VecDeque::new(),
            })),
            wake,
            running: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobList<Ctx>> {
        // A panicking worker never holds the lock across user code
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs started but not yet delivered.
    pub fn pending(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Run `work` on a new thread and deliver its result to `callback` on the
    /// loop. If no thread can be started, `callback` runs before this returns.
    pub fn execute<T, E, W, C>(&self, ctx: &mut Ctx, label: &str, work: W, callback: C)
    where
        T: Send + 'static,
        E: From<ArbiterError> + Send + 'static,
        W: FnOnce() -> Result<T, E> + Send + 'static,
        C: FnOnce(&mut Ctx, Result<T, E>) + Send + 'static,
    {
        if self.running.fetch_add(1, Ordering::SeqCst) >= self.limit {
            self.running.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Worker budget of {} exhausted, failing {}", self.limit, label);
            let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
            callback(ctx, Err(E::from(ArbiterError::from(err))));
            return;
        }

        let id = {
            let mut list = self.lock();
            let id = list.next_id;
            list.next_id += 1;
            list.jobs.push_back(JobRecord {
                id,
                label: label.to_string(),
                finished: None,
            });
            id
        };

        // Shared so the callback survives a failed spawn
        let callback = Arc::new(Mutex::new(Some(callback)));
        let thread_callback = Arc::clone(&callback);
        let jobs = Arc::clone(&self.jobs);
        let wake = self.wake.clone();
        let running = Arc::clone(&self.running);
        let spawned = std::thread::Builder::new()
            .name(format!("arbiter-{label}"))
            .spawn(move || {
                let result = work();
                let callback = take(&thread_callback);
                {
                    let mut list = jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Some(callback) = callback
                        && let Some(record) = list.jobs.iter_mut().find(|record| record.id == id)
                    {
                        record.finished = Some(Box::new(move |ctx: &mut Ctx| callback(ctx, result)));
                    }
                }
                running.fetch_sub(1, Ordering::SeqCst);
                // Full means a wake-up is already queued
                let _ = wake.try_send(());
            });

        if let Err(e) = spawned {
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.lock().jobs.retain(|record| record.id != id);
            tracing::warn!("Failed to spawn worker for {}: {}", label, e);
            if let Some(callback) = take(&callback) {
                callback(ctx, Err(E::from(ArbiterError::from(e))));
            }
        }
    }

    /// Deliver every finished job, oldest first. Returns how many ran.
    pub fn drain(&self, ctx: &mut Ctx) -> usize {
        let finished: Vec<(String, Delivery<Ctx>)> = {
            let mut list = self.lock();
            let mut finished = Vec::new();
            let mut remaining = VecDeque::with_capacity(list.jobs.len());
            while let Some(mut record) = list.jobs.pop_front() {
                match record.finished.take() {
                    Some(delivery) => finished.push((record.label, delivery)),
                    None => remaining.push_back(record),
                }
            }
            list.jobs = remaining;
            finished
        };

        let count = finished.len();
        for (label, delivery) in finished {
            tracing::trace!("Delivering {} result", label);
            delivery(ctx);
        }
        count
    }
}

fn take<C>(slot: &Mutex<Option<C>>) -> Option<C> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Log {
        seen: Vec<u32>,
        errors: Vec<ArbiterError>,
    }

    #[tokio::test]
    async fn every_job_is_delivered_exactly_once() {
        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let bridge: WorkerBridge<Log> = WorkerBridge::new(wake_tx, 64);
        let mut log = Log::default();

        for n in 0..32u32 {
            bridge.execute(
                &mut log,
                "count",
                move || {
                    std::thread::sleep(Duration::from_millis(u64::from(n % 4)));
                    Ok::<_, ArbiterError>(n)
                },
                |log: &mut Log, result| log.seen.push(result.expect("job result")),
            );
        }

        while bridge.pending() > 0 {
            wake_rx.recv().await.expect("wake channel open");
            bridge.drain(&mut log);
        }

        let mut seen = log.seen.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn exhausted_budget_fails_synchronously() {
        let (wake_tx, _wake_rx) = mpsc::channel(1);
        let bridge: WorkerBridge<Log> = WorkerBridge::new(wake_tx, 0);
        let mut log = Log::default();

        bridge.execute(
            &mut log,
            "never",
            || Ok::<u32, ArbiterError>(1),
            |log: &mut Log, result| match result {
                Ok(n) => log.seen.push(n),
                Err(e) => log.errors.push(e),
            },
        );

        assert!(log.seen.is_empty());
        assert_eq!(log.errors.len(), 1);
        assert!(log.errors[0].is(arbiter_types::ErrorKind::NoResources));
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn drain_preserves_start_order() {
        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let bridge: WorkerBridge<Log> = WorkerBridge::new(wake_tx, 8);
        let mut log = Log::default();

        for n in 0..4u32 {
            bridge.execute(
                &mut log,
                "ordered",
                move || Ok::<_, ArbiterError>(n),
                |log: &mut Log, result| log.seen.push(result.expect("job result")),
            );
        }

        // Let every thread finish before draining once
        while bridge.lock().jobs.iter().any(|record| record.finished.is_none()) {
            std::thread::sleep(Duration::from_millis(1));
        }
        wake_rx.recv().await.expect("wake channel open");
        assert_eq!(bridge.drain(&mut log), 4);
        assert_eq!(log.seen, vec![0, 1, 2, 3]);
    }
}
