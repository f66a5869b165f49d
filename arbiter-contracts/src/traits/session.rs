// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use enumflags2::BitFlags;

use arbiter_types::{
    ApprovalQuery, DiskDescription, Dissenter, Interest, Notification, PeekVerdict,
};

/// A connected client.
///
/// Every callback is answered exactly once per question; the engine never
/// re-asks a session about the same stage of the same disk.
#[async_trait]
pub trait ClientSession: Send + Sync {
    fn interests(&self) -> BitFlags<Interest>;

    async fn peek(&self, _description: &DiskDescription) -> PeekVerdict {
        PeekVerdict::Proceed
    }

    async fn approve(&self, _query: &ApprovalQuery) -> Option<Dissenter> {
        None
    }

    /// Another session wants the claim this session holds.
    async fn release_claim(&self, _query: &ApprovalQuery) -> Option<Dissenter> {
        None
    }

    fn notify(&self, _notification: &Notification) {}
}
