// SPDX-License-Identifier: GPL-3.0-only

//! Client requests and their staged protocol
//!
//! Every request moves through precondition, approval, authorization and
//! commit before its single outcome is delivered. `dispatch` holds the
//! queue logic, `commit` the per-kind work.

pub mod commit;
pub mod dispatch;
pub mod precondition;

use std::collections::BTreeSet;

use arbiter_types::{
    ArbiterError, Caller, Dissenter, DiskId, RequestArguments, RequestId, RequestKind,
    RequestOutcome,
};
use enumflags2::{BitFlags, bitflags};
use tokio::sync::oneshot;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Holds its disk (or unit) command-active
    Dispatched = 1 << 0,
    /// Waiting on approval observers
    StagedApprove = 1 << 1,
    /// Waiting on the authorizer
    StagedAuthorize = 1 << 2,
    /// Running on a worker
    Committed = 1 << 3,
    /// Created by the engine, no caller waiting
    Internal = 1 << 4,
}

/// One-shot delivery of a request's outcome.
#[derive(Debug)]
pub struct Completion(Option<oneshot::Sender<RequestOutcome>>);

impl Completion {
    pub fn channel() -> (Self, oneshot::Receiver<RequestOutcome>) {
        let (sender, receiver) = oneshot::channel();
        (Self(Some(sender)), receiver)
    }

    pub fn none() -> Self {
        Self(None)
    }

    fn fire(self, outcome: RequestOutcome) {
        if let Some(sender) = self.0 {
            // The caller may have stopped waiting
            let _ = sender.send(outcome);
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub disk: DiskId,
    pub arguments: RequestArguments,
    pub caller: Caller,
    pub state: BitFlags<RequestState>,
    /// Failure inherited from a linked request
    pub dissenter: Option<Dissenter>,
    /// Requests that must terminate before this one dispatches
    pub link: BTreeSet<RequestId>,
    completion: Completion,
}

impl Request {
    pub fn new(
        id: RequestId,
        kind: RequestKind,
        disk: DiskId,
        arguments: RequestArguments,
        caller: Caller,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            kind,
            disk,
            arguments,
            caller,
            state: BitFlags::empty(),
            dissenter: None,
            link: BTreeSet::new(),
            completion,
        }
    }

    pub fn internal(
        id: RequestId,
        kind: RequestKind,
        disk: DiskId,
        arguments: RequestArguments,
        caller: Caller,
    ) -> Self {
        let mut request = Self::new(id, kind, disk, arguments, caller, Completion::none());
        request.state |= RequestState::Internal;
        request
    }

    /// Acts on every disk of the unit rather than one disk.
    pub fn is_unit_wide(&self) -> bool {
        self.kind == RequestKind::Eject
    }

    /// Deliver the outcome. Consumes the request.
    pub fn complete(self, outcome: RequestOutcome) {
        self.completion.fire(outcome);
    }
}

/// Caller side of a submitted request.
#[derive(Debug)]
pub struct Ticket {
    pub id: RequestId,
    receiver: oneshot::Receiver<RequestOutcome>,
}

impl Ticket {
    pub fn new(id: RequestId, receiver: oneshot::Receiver<RequestOutcome>) -> Self {
        Self { id, receiver }
    }

    /// Wait for the outcome. A request dropped by a shutting-down engine
    /// reads as canceled.
    pub async fn outcome(self) -> RequestOutcome {
        let id = self.id;
        self.receiver.await.unwrap_or_else(|_| {
            Err(Dissenter::new(ArbiterError::canceled(format!(
                "{id} dropped before completion"
            ))))
        })
    }

    /// The outcome if it has already been delivered.
    pub fn try_outcome(&mut self) -> Option<RequestOutcome> {
        self.receiver.try_recv().ok()
    }
}
