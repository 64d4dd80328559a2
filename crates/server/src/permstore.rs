//! In-memory permission store.
//!
//! Secrets are opaque UUIDs minted at registration. Registering the
//! same instance again returns its existing secret; unregistering an
//! unknown instance is `NotFound`.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use edgeiam_common::{IamError, InstanceIdent, Result};

use crate::collaborators::{PermissionStore, ServicePermissions};

struct Entry {
    instance: InstanceIdent,
    permissions: ServicePermissions,
}

pub struct MemoryPermissionStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryPermissionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionStore for MemoryPermissionStore {
    fn register_instance(
        &self,
        instance: InstanceIdent,
        permissions: ServicePermissions,
    ) -> Result<String> {
        let mut entries = self.entries.lock();

        if let Some((secret, _)) =
            entries.iter().find(|(_, entry)| entry.instance == instance)
        {
            return Ok(secret.clone());
        }

        let secret = Uuid::new_v4().to_string();
        entries.insert(secret.clone(), Entry { instance, permissions });
        Ok(secret)
    }

    fn unregister_instance(&self, instance: &InstanceIdent) -> Result<()> {
        let mut entries = self.entries.lock();
        let secret = entries
            .iter()
            .find(|(_, entry)| entry.instance == *instance)
            .map(|(secret, _)| secret.clone())
            .ok_or_else(|| IamError::not_found(format!("instance {instance} is not registered")))?;

        entries.remove(&secret);
        Ok(())
    }

    fn get_permissions(
        &self,
        secret: &str,
        functional_server_id: &str,
    ) -> Result<(InstanceIdent, HashMap<String, String>)> {
        let entries = self.entries.lock();
        let entry = entries
            .get(secret)
            .ok_or_else(|| IamError::not_found("secret is not registered"))?;

        let permissions = entry
            .permissions
            .get(functional_server_id)
            .cloned()
            .ok_or_else(|| {
                IamError::not_found(format!("no permissions for server {functional_server_id}"))
            })?;

        Ok((entry.instance.clone(), permissions))
    }
}
