use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{ProvisionedNumber, Provisioner};
use crate::endpoint::Identity;
use crate::error::ProvisionError;

/// In-process provisioner for labs without a provisioning API.
///
/// Mints sequential numbers in `domain` and keeps a journal of every create
/// and delete so callers can inspect ordering.
pub struct MemoryProvisioner {
    domain: String,
    next: AtomicU64,
    live: Mutex<Vec<ProvisionedNumber>>,
    journal: Mutex<Vec<String>>,
}

impl MemoryProvisioner {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            next: AtomicU64::new(6_505_550_000),
            live: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// `create <uri>` / `delete <uri>` entries in call order.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }

    fn note(&self, entry: String) {
        if let Ok(mut j) = self.journal.lock() {
            j.push(entry);
        }
    }
}

#[async_trait::async_trait]
impl Provisioner for MemoryProvisioner {
    async fn create_identity(
        &self,
        pstn: bool,
        shared: Option<&Identity>,
    ) -> Result<Identity, ProvisionError> {
        let number = self.next.fetch_add(1, Ordering::Relaxed);
        let username = number.to_string();
        let identity = Identity {
            sip_uri: format!("sip:{username}@{}", self.domain),
            private_id: shared
                .map(|s| s.private_id.clone())
                .unwrap_or_else(|| format!("{username}@{}", self.domain)),
            password: shared
                .map(|s| s.password.clone())
                .unwrap_or_else(|| format!("pw{number:x}")),
            username,
            pstn,
        };
        self.note(format!("create {}", identity.sip_uri));
        self.live
            .lock()
            .map_err(|_| ProvisionError::Unavailable("provisioner state poisoned".into()))?
            .push(ProvisionedNumber {
                identity: identity.clone(),
                primary: shared.is_none(),
            });
        Ok(identity)
    }

    async fn delete_identity(&self, identity: &Identity) -> Result<(), ProvisionError> {
        self.note(format!("delete {}", identity.sip_uri));
        if let Ok(mut live) = self.live.lock() {
            live.retain(|n| n.identity.sip_uri != identity.sip_uri);
        }
        Ok(())
    }

    async fn list_identities(
        &self,
        domain: &str,
    ) -> Result<Vec<ProvisionedNumber>, ProvisionError> {
        Ok(self
            .live
            .lock()
            .map_err(|_| ProvisionError::Unavailable("provisioner state poisoned".into()))?
            .iter()
            .filter(|n| n.identity.domain() == domain)
            .cloned()
            .collect())
    }
}
