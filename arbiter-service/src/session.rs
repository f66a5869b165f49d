// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use arbiter_contracts::ClientSession;
use arbiter_types::{Interest, Notification, SessionId};
use enumflags2::BitFlags;

struct SessionEntry {
    id: SessionId,
    interests: BitFlags<Interest>,
    session: Arc<dyn ClientSession>,
}

/// Connected sessions in registration order.
#[derive(Default)]
pub struct SessionList {
    entries: Vec<SessionEntry>,
}

impl SessionList {
    pub fn register(&mut self, id: SessionId, session: Arc<dyn ClientSession>) {
        let interests = session.interests();
        tracing::debug!("Registered {} with interests {:?}", id, interests);
        self.entries.push(SessionEntry {
            id,
            interests,
            session,
        });
    }

    pub fn unregister(&mut self, id: SessionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<dyn ClientSession>> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Sessions that asked to hear about `interest`, in registration order.
    pub fn with_interest(&self, interest: Interest) -> Vec<Arc<dyn ClientSession>> {
        self.entries
            .iter()
            .filter(|entry| entry.interests.contains(interest))
            .map(|entry| Arc::clone(&entry.session))
            .collect()
    }

    pub fn notify(&self, notification: &Notification) {
        for entry in &self.entries {
            if entry.interests.contains(Interest::Notify) {
                entry.session.notify(notification);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
