//! In-memory cloud store for tests.

use super::{CloudProvider, CloudStore, UploadRequest};
use crate::config::CloudUploadConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: String,
    pub name: String,
    pub folder_id: String,
    pub content: Vec<u8>,
    pub request: UploadRequest,
}

#[derive(Default)]
struct StoreState {
    folders: Vec<(String, String, Option<String>)>,
    objects: Vec<StoredObject>,
    next_id: u32,
    creates: u32,
    upload_attempts: u32,
    upload_failures: u32,
    lose_create_race: bool,
    unreachable: bool,
}

#[derive(Clone, Default)]
pub struct FakeCloudStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeCloudStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    fn next_id(state: &mut StoreState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }

    pub fn seed_folder(&self, name: &str, parent_id: Option<&str>) -> String {
        let mut state = self.state();
        let id = Self::next_id(&mut state, "folder");
        state
            .folders
            .push((id.clone(), name.to_string(), parent_id.map(str::to_string)));
        id
    }

    pub fn folder_id(&self, name: &str, parent_id: Option<&str>) -> Option<String> {
        self.state()
            .folders
            .iter()
            .find(|(_, n, p)| n == name && p.as_deref() == parent_id)
            .map(|(id, _, _)| id.clone())
    }

    pub fn folder_name(&self, id: &str) -> Option<String> {
        self.state()
            .folders
            .iter()
            .find(|(fid, _, _)| fid == id)
            .map(|(_, name, _)| name.clone())
    }

    /// The next create inserts the folder as if a concurrent writer won, then fails.
    pub fn lose_next_create_race(&self) {
        self.state().lose_create_race = true;
    }

    pub fn fail_next_uploads(&self, count: u32) {
        self.state().upload_failures = count;
    }

    pub fn mark_unreachable(&self) {
        self.state().unreachable = true;
    }

    pub fn create_count(&self) -> u32 {
        self.state().creates
    }

    pub fn upload_attempts(&self) -> u32 {
        self.state().upload_attempts
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.state().objects.clone()
    }

    pub fn provider(&self) -> Arc<dyn CloudProvider> {
        Arc::new(FakeCloudProvider {
            store: self.clone(),
        })
    }
}

#[async_trait]
impl CloudStore for FakeCloudStore {
    async fn find_folder(&self, name: &str, parent_id: Option<&str>) -> Result<Option<String>> {
        if self.state().unreachable {
            return Err(BackupError::cloud(Some(503), "service unavailable"));
        }
        Ok(self.folder_id(name, parent_id))
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.creates += 1;
        let id = Self::next_id(&mut state, "folder");
        state
            .folders
            .push((id.clone(), name.to_string(), parent_id.map(str::to_string)));

        if state.lose_create_race {
            state.lose_create_race = false;
            return Err(BackupError::cloud(Some(409), "folder already exists"));
        }
        Ok(id)
    }

    async fn upload_stream(
        &self,
        mut source: Box<dyn Read + Send>,
        request: &UploadRequest,
    ) -> Result<String> {
        {
            let mut state = self.state();
            state.upload_attempts += 1;
            if state.upload_failures > 0 {
                state.upload_failures -= 1;
                return Err(BackupError::cloud(Some(503), "simulated upload failure"));
            }
        }

        let mut content = Vec::new();
        source.read_to_end(&mut content)?;

        let mut state = self.state();
        let id = Self::next_id(&mut state, "object");
        state.objects.push(StoredObject {
            id: id.clone(),
            name: request.name.clone(),
            folder_id: request.folder_id.clone(),
            content,
            request: request.clone(),
        });
        Ok(id)
    }

    async fn test_connection(&self) -> Result<()> {
        if self.state().unreachable {
            return Err(BackupError::cloud(Some(503), "service unavailable"));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Fake Cloud"
    }
}

struct FakeCloudProvider {
    store: FakeCloudStore,
}

impl CloudProvider for FakeCloudProvider {
    fn store_for(&self, _cloud: &CloudUploadConfig) -> Result<Arc<dyn CloudStore>> {
        Ok(Arc::new(self.store.clone()))
    }
}
