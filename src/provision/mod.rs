//! Subscriber provisioning collaborator.

pub mod http;
pub mod memory;

pub use self::http::HttpProvisioner;
pub use self::memory::MemoryProvisioner;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::endpoint::Identity;
use crate::error::ProvisionError;

/// An identity found on the provisioning server, as seen by the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedNumber {
    #[serde(flatten)]
    pub identity: Identity,
    /// Default public identity of its private id. Deleted after its associates.
    #[serde(default)]
    pub primary: bool,
}

#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate a new identity. With `shared`, the new public identity is
    /// associated with that identity's private id.
    async fn create_identity(
        &self,
        pstn: bool,
        shared: Option<&Identity>,
    ) -> Result<Identity, ProvisionError>;

    /// Best effort: implementations log non-success answers instead of failing.
    async fn delete_identity(&self, identity: &Identity) -> Result<(), ProvisionError>;

    async fn list_identities(&self, domain: &str) -> Result<Vec<ProvisionedNumber>, ProvisionError>;

    /// Delete every identity left behind in `domain`, associated identities
    /// first. Idempotent. Returns how many were removed.
    async fn sweep_leaked(&self, domain: &str) -> Result<usize, ProvisionError> {
        let mut leaked = self.list_identities(domain).await?;
        if leaked.is_empty() {
            return Ok(0);
        }
        // Stable sort keeps server order within each group.
        leaked.sort_by_key(|n| n.primary);
        info!(%domain, count = leaked.len(), "sweeping leaked identities");
        let mut removed = 0;
        for number in &leaked {
            match self.delete_identity(&number.identity).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    uri = %number.identity.sip_uri,
                    "failed to delete leaked identity: {}", e
                ),
            }
        }
        Ok(removed)
    }
}
