use super::CloudStore;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

type FolderKey = (Option<String>, String);

/// Shared across every job in a process so concurrent jobs for the same day
/// and server resolve to one folder.
#[derive(Default)]
pub struct FolderRegistry {
    slots: Mutex<HashMap<FolderKey, Arc<AsyncMutex<Option<String>>>>>,
}

impl FolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: FolderKey) -> Arc<AsyncMutex<Option<String>>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key).or_default().clone()
    }

    /// Returns the id of `name` under `parent_id`, creating it only when
    /// neither this process nor the store already has one.
    pub async fn ensure(
        &self,
        store: &dyn CloudStore,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String> {
        let slot = self.slot((parent_id.map(str::to_string), name.to_string()));
        let mut cached = slot.lock().await;
        if let Some(id) = cached.as_ref() {
            debug!("Reusing folder {} ({})", name, id);
            return Ok(id.clone());
        }

        let id = match store.find_folder(name, parent_id).await? {
            Some(id) => {
                debug!("Found existing folder {} ({})", name, id);
                id
            }
            None => match store.create_folder(name, parent_id).await {
                Ok(id) => {
                    info!("Created cloud folder {} ({})", name, id);
                    id
                }
                Err(e) => {
                    // another writer may have created it between find and create
                    warn!("Creating folder {} failed, looking it up again: {}", name, e);
                    store.find_folder(name, parent_id).await?.ok_or(e)?
                }
            },
        };

        *cached = Some(id.clone());
        Ok(id)
    }
}
