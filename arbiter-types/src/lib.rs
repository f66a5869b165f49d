// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the Disk Arbiter
//!
//! These types are shared by every layer:
//!
//! - **arbiter-contracts**: collaborator traits speak in these types
//! - **arbiter-sys**: host adapters produce descriptions and map errno values
//! - **arbiter-service**: the stage engine and request dispatcher operate on them

pub mod description;
pub mod error;
pub mod mount;
pub mod request;
pub mod session;

pub use description::{DescriptionKey, DiskDescription, DiskId};
pub use error::{ArbiterError, Dissenter, ErrorKind};
pub use mount::{MountIdentity, MountMapEntry, MountOptionSet, ProbeOutcome, normalize_uuid};
pub use request::{
    Caller, Reply, RequestArguments, RequestFlag, RequestId, RequestKind, RequestOutcome,
    SessionId,
};
pub use session::{ApprovalQuery, Interest, Notification, PeekVerdict};
