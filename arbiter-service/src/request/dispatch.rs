// SPDX-License-Identifier: GPL-3.0-only

//! Request queue
//!
//! Requests are dispatched in submission order once their disk has appeared
//! and is not busy. A dispatched request holds its disk (or, for eject, its
//! unit) command-active until it terminates.

use std::sync::Arc;

use arbiter_contracts::ClientSession;
use arbiter_types::{
    ApprovalQuery, ArbiterError, Dissenter, ErrorKind, Interest, Reply, RequestArguments,
    RequestFlag, RequestId, RequestKind, RequestOutcome,
};

use super::{Request, RequestState, precondition};
use crate::engine::Engine;
use crate::event_loop::Event;

impl Engine {
    pub(crate) fn submit(&mut self, mut request: Request) {
        tracing::info!(
            "Queued {} {} on {} for uid {}",
            request.id,
            request.kind,
            request.disk,
            request.caller.uid
        );

        if request.kind == RequestKind::Eject
            && let Some(target) = self.registry.live_disk(&request.disk)
        {
            // Unmount everything on the unit first, each as its own request
            let mounted: Vec<_> = self
                .registry
                .unit_disks(target.unit())
                .filter(|disk| disk.description.is_mounted())
                .map(|disk| disk.id.clone())
                .collect();
            for disk in mounted {
                let id = self.handle.next_request_id();
                let arguments = RequestArguments {
                    flags: request.arguments.flags & RequestFlag::Force,
                    ..Default::default()
                };
                tracing::debug!("{} waits on {} to unmount {}", request.id, id, disk);
                request.link.insert(id);
                self.registry.push_request(Request::internal(
                    id,
                    RequestKind::Unmount,
                    disk,
                    arguments,
                    request.caller.clone(),
                ));
            }
        }

        self.registry.push_request(request);
        self.signal();
    }

    pub(crate) fn dispatch_requests(&mut self) {
        for id in self.registry.request_ids() {
            self.dispatch_request(id);
        }
    }

    fn dispatch_request(&mut self, id: RequestId) {
        let Some(request) = self.registry.request(id) else {
            return;
        };
        if request.state.contains(RequestState::Dispatched) || !request.link.is_empty() {
            return;
        }
        if let Some(dissenter) = request.dissenter.clone() {
            self.terminate(id, Err(dissenter));
            return;
        }
        let Some(disk) = self.registry.live_disk(&request.disk) else {
            let err = ArbiterError::not_found(format!("no disk named {}", request.disk));
            self.terminate(id, Err(err.into()));
            return;
        };
        if !disk.has_appeared() {
            return;
        }

        let unit_wide = request.is_unit_wide();
        let unit = disk.unit().to_string();
        let busy = if unit_wide {
            self.registry.unit(&unit).command_active
                || self.registry.unit_disks(&unit).any(|d| d.command_active)
        } else {
            self.registry.is_disk_busy(disk)
        };
        if busy {
            return;
        }

        if let Err(err) = precondition::check(request, disk) {
            tracing::debug!("{} fails its precondition: {}", id, err);
            self.terminate(id, Err(err.into()));
            return;
        }

        let disk_id = disk.id.clone();
        if unit_wide {
            self.registry.set_unit_command_active(&unit, true);
        } else if let Some(disk) = self.registry.disk_mut(&disk_id) {
            disk.command_active = true;
        }
        if let Some(request) = self.registry.request_mut(id) {
            request.state |= RequestState::Dispatched;
        }
        self.solicit_approval(id);
    }

    // === Approval ===

    fn solicit_approval(&mut self, id: RequestId) {
        let Some(request) = self.registry.request(id) else {
            return;
        };
        let Some(disk) = self.registry.live_disk(&request.disk) else {
            return;
        };

        let claim = request.kind == RequestKind::Claim;
        let approvers: Vec<Arc<dyn ClientSession>> = if claim {
            // Only the current holder decides whether to let go
            match disk.claim {
                Some(holder) if Some(holder) != request.caller.session => {
                    self.registry.sessions.get(holder).into_iter().collect()
                }
                _ => Vec::new(),
            }
        } else if request.kind.solicits_approval() {
            self.registry.sessions.with_interest(Interest::Approve)
        } else {
            Vec::new()
        };

        if approvers.is_empty() {
            self.authorize(id);
            return;
        }

        let query = ApprovalQuery {
            kind: request.kind,
            disk: disk.id.clone(),
            description: disk.description.clone(),
            caller: request.caller.clone(),
            arguments: request.arguments.clone(),
        };
        if let Some(request) = self.registry.request_mut(id) {
            request.state |= RequestState::StagedApprove;
        }

        let handle = self.handle.clone();
        tokio::spawn(async move {
            let mut dissenter = None;
            for session in approvers {
                let answer = if claim {
                    session.release_claim(&query).await
                } else {
                    session.approve(&query).await
                };
                if answer.is_some() {
                    dissenter = answer;
                    break;
                }
            }
            handle.post(Event::ApprovalResolved {
                request: id,
                dissenter,
            });
        });
    }

    pub(crate) fn approval_resolved(&mut self, id: RequestId, dissenter: Option<Dissenter>) {
        let Some(request) = self.registry.request_mut(id) else {
            return;
        };
        request.state.remove(RequestState::StagedApprove);
        match dissenter {
            Some(dissenter) => {
                tracing::info!("{} was refused: {}", id, dissenter);
                self.terminate(id, Err(dissenter));
            }
            None => self.authorize(id),
        }
    }

    // === Authorization ===

    fn authorize(&mut self, id: RequestId) {
        let Some(request) = self.registry.request(id) else {
            return;
        };
        let Some(disk) = self.registry.live_disk(&request.disk) else {
            return;
        };
        let Some(action_id) = request.kind.action_id() else {
            self.commit(id);
            return;
        };

        let owner = match request.kind {
            RequestKind::Mount | RequestKind::Eject => self.host.console_user(),
            _ => disk.context.mount_owner,
        };
        if request.caller.is_root() || owner == Some(request.caller.uid) {
            self.commit(id);
            return;
        }

        let caller = request.caller.clone();
        if let Some(request) = self.registry.request_mut(id) {
            request.state |= RequestState::StagedAuthorize;
        }
        tracing::debug!("{} needs {} for uid {}", id, action_id, caller.uid);

        let authorizer = Arc::clone(&self.authorizer);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let result = authorizer.authorize(&caller, action_id).await;
            handle.post(Event::AuthorizationResolved {
                request: id,
                result,
            });
        });
    }

    pub(crate) fn authorization_resolved(
        &mut self,
        id: RequestId,
        result: Result<(), ArbiterError>,
    ) {
        let Some(request) = self.registry.request_mut(id) else {
            return;
        };
        request.state.remove(RequestState::StagedAuthorize);
        match result {
            Ok(()) => self.commit(id),
            Err(err) => {
                tracing::info!("{} not authorized: {}", id, err);
                self.terminate(id, Err(err.into()));
            }
        }
    }

    // === Termination ===

    /// Deliver the outcome of `id`, release what it held and pass a failure
    /// on to every request linked to it.
    pub(crate) fn terminate(&mut self, id: RequestId, outcome: RequestOutcome) {
        let Some(request) = self.registry.take_request(id) else {
            return;
        };

        // Already unmounted is as good as unmounted for an eject's helpers
        let outcome = match outcome {
            Err(dissenter)
                if request.state.contains(RequestState::Internal)
                    && request.kind == RequestKind::Unmount
                    && dissenter.kind() == ErrorKind::NotMounted =>
            {
                Ok(Reply::Done)
            }
            outcome => outcome,
        };

        if request.state.contains(RequestState::Dispatched) {
            if request.is_unit_wide() {
                let unit = self
                    .registry
                    .disk(&request.disk)
                    .map(|disk| disk.unit().to_string());
                if let Some(unit) = unit {
                    self.registry.set_unit_command_active(&unit, false);
                }
            } else if let Some(disk) = self.registry.disk_mut(&request.disk) {
                disk.command_active = false;
            }
        }

        match &outcome {
            Ok(_) => tracing::info!("{} {} on {} finished", id, request.kind, request.disk),
            Err(dissenter) => tracing::info!(
                "{} {} on {} failed: {}",
                id,
                request.kind,
                request.disk,
                dissenter
            ),
        }

        let failure = outcome.as_ref().err().cloned();
        for dependent in self.registry.requests_mut() {
            if dependent.link.remove(&id)
                && let Some(failure) = &failure
                && dependent.dissenter.is_none()
            {
                dependent.dissenter = Some(failure.clone());
            }
        }

        request.complete(outcome);
        self.signal();
    }
}
