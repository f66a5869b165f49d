// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use arbiter_contracts::Authorizer;
use arbiter_types::{ArbiterError, Caller};
use async_trait::async_trait;
use zbus::Connection;
use zbus_polkit::policykit1::{AuthorityProxy, CheckAuthorizationFlags, Subject};

use crate::error::ServiceError;

/// Asks Polkit on the system bus, allowing it to prompt the user.
pub struct PolkitAuthorizer {
    connection: Connection,
}

impl PolkitAuthorizer {
    pub async fn connect() -> Result<Self, ServiceError> {
        let connection = Connection::system().await?;
        // Fail now rather than on the first request if Polkit is absent
        AuthorityProxy::new(&connection)
            .await
            .map_err(|e| ServiceError::DBus(format!("Failed to connect to Polkit: {e}")))?;
        Ok(Self { connection })
    }

    async fn check(&self, pid: u32, action_id: &str) -> Result<bool, ServiceError> {
        let authority = AuthorityProxy::new(&self.connection)
            .await
            .map_err(|e| ServiceError::DBus(format!("Failed to connect to Polkit: {e}")))?;

        let subject = Subject::new_for_owner(pid, None, None)
            .map_err(|e| ServiceError::AuthorizationFailed(format!("Failed to create subject: {e}")))?;

        let result = authority
            .check_authorization(
                &subject,
                action_id,
                &HashMap::new(),
                CheckAuthorizationFlags::AllowUserInteraction.into(),
                "",
            )
            .await
            .map_err(|e| ServiceError::AuthorizationFailed(e.to_string()))?;

        tracing::debug!(
            "Authorization result for {}: authorized={}, challenged={}",
            action_id,
            result.is_authorized,
            result.is_challenge
        );
        Ok(result.is_authorized)
    }
}

#[async_trait]
impl Authorizer for PolkitAuthorizer {
    async fn authorize(&self, caller: &Caller, action_id: &str) -> Result<(), ArbiterError> {
        let Some(pid) = caller.pid else {
            return Err(ArbiterError::not_privileged(format!(
                "uid {} has no process to authorize for {action_id}",
                caller.uid
            )));
        };

        match self.check(pid, action_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ArbiterError::not_privileged(format!(
                "Not authorized for action: {action_id}"
            ))),
            Err(e) => {
                tracing::warn!("Authorization check for pid {} failed: {}", pid, e);
                Err(ArbiterError::not_privileged(e.to_string()))
            }
        }
    }
}

/// Grants every action to members of one group. Used when Polkit is
/// unavailable.
pub struct GroupAuthorizer {
    admin_gid: u32,
}

impl GroupAuthorizer {
    pub fn new(admin_gid: u32) -> Self {
        Self { admin_gid }
    }
}

impl Default for GroupAuthorizer {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl Authorizer for GroupAuthorizer {
    async fn authorize(&self, caller: &Caller, action_id: &str) -> Result<(), ArbiterError> {
        if caller.is_root() || caller.gid == self.admin_gid {
            Ok(())
        } else {
            Err(ArbiterError::not_privileged(format!(
                "uid {} may not perform {action_id}",
                caller.uid
            )))
        }
    }
}
