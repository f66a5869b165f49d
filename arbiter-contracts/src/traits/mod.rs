// SPDX-License-Identifier: GPL-3.0-only

pub mod auth;
pub mod host;
pub mod plugin;
pub mod session;

pub use auth::Authorizer;
pub use host::HostSystem;
pub use plugin::FilesystemPlugin;
pub use session::ClientSession;
