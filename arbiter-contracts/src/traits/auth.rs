// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use arbiter_types::{ArbiterError, Caller};

/// Decides whether `caller` may perform `action_id`. May prompt the user.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, caller: &Caller, action_id: &str) -> Result<(), ArbiterError>;
}
