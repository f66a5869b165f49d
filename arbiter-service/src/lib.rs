// SPDX-License-Identifier: GPL-3.0-only

//! Disk Arbiter engine
//!
//! Tracks every disk from arrival to removal, decides whether and where to
//! mount it, and serializes client requests against each disk through a
//! precondition, approval, authorization and commit protocol.

pub mod auth;
pub mod config;
pub mod disk;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod policy;
pub mod probe;
pub mod registry;
pub mod request;
pub mod session;
pub mod worker;

pub use config::{ConfigStore, Overrides, Preferences};
pub use disk::{Disk, Stage};
pub use engine::{Engine, EngineParts};
pub use event_loop::{Event, EventLoop, Flow, LoopHandle};
pub use probe::{MediaMatcher, ProbeCandidate, ProbeSequencer};
pub use request::Ticket;
