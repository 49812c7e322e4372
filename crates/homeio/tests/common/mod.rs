#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use homeio::Engine;
use homeio::EngineConfig;
use homeio::Store;
use homeio::engine::AdapterError;
use homeio::engine::Brightness;
use homeio::engine::CommandQueueEntry;
use homeio::engine::DeviceDescriptor;
use homeio::engine::PowerState;
use homeio::engine::StateProperties;
use homeio::engine::VendorAdapter;
use tokio_util::sync::CancellationToken;

/// In-process adapter whose devices and answers are scripted by the test.
pub struct FakeAdapter {
    name: &'static str,
    poll_on_quick: bool,
    delay: Option<Duration>,
    devices: Mutex<Vec<DeviceDescriptor>>,
    states: Mutex<HashMap<String, Result<StateProperties, AdapterError>>>,
    list_error: Mutex<Option<AdapterError>>,
    cancel_on_list: Mutex<Option<CancellationToken>>,
    list_calls: AtomicUsize,
    applied: Mutex<Vec<CommandQueueEntry>>,
}

impl FakeAdapter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            poll_on_quick: true,
            delay: None,
            devices: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
            list_error: Mutex::new(None),
            cancel_on_list: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Only polled on full cycles.
    pub fn full_cycles_only(mut self) -> Self {
        self.poll_on_quick = false;
        self
    }

    /// Every call takes this long to answer.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_device(self, id: &str, model: &str, state: StateProperties) -> Self {
        self.add_device(id, model, state);
        self
    }

    pub fn add_device(&self, id: &str, model: &str, state: StateProperties) {
        self.devices.lock().unwrap().push(DeviceDescriptor {
            id: id.to_string(),
            brand: self.name.to_string(),
            model: model.to_string(),
            name: format!("{} {}", self.name, id),
            raw: serde_json::json!({"id": id}),
        });
        self.set_state(id, state);
    }

    pub fn set_state(&self, id: &str, state: StateProperties) {
        self.states.lock().unwrap().insert(id.to_string(), Ok(state));
    }

    pub fn fail_state(&self, id: &str) {
        self.states.lock().unwrap().insert(
            id.to_string(),
            Err(AdapterError::data_invalid(self.name, format!("garbled state for {}", id))),
        );
    }

    pub fn fail_listing(&self, error: AdapterError) {
        *self.list_error.lock().unwrap() = Some(error);
    }

    /// Cancel `token` as soon as the device list is requested.
    pub fn cancel_when_listed(&self, token: CancellationToken) {
        *self.cancel_on_list.lock().unwrap() = Some(token);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<CommandQueueEntry> {
        self.applied.lock().unwrap().clone()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl VendorAdapter for FakeAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn poll_on_quick(&self) -> bool {
        self.poll_on_quick
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, AdapterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_list.lock().unwrap().as_ref() {
            token.cancel();
        }
        self.pause().await;
        if let Some(e) = self.list_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn fetch_state(&self, device: &DeviceDescriptor) -> Result<StateProperties, AdapterError> {
        self.pause().await;
        self.states
            .lock()
            .unwrap()
            .get(&device.id)
            .cloned()
            .unwrap_or_else(|| Err(AdapterError::unavailable(self.name, "no such device")))
    }

    async fn apply_command(&self, entry: &CommandQueueEntry) -> Result<(), AdapterError> {
        self.applied.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

pub fn observed(power: PowerState, brightness: u8) -> StateProperties {
    StateProperties {
        power: Some(power),
        brightness: Brightness::new(brightness),
        online: Some(true),
    }
}

pub fn engine(store: Arc<dyn Store>, adapters: Vec<Arc<dyn VendorAdapter>>) -> Engine {
    engine_with(store, adapters, EngineConfig::default())
}

pub fn engine_with(
    store: Arc<dyn Store>,
    adapters: Vec<Arc<dyn VendorAdapter>>,
    config: EngineConfig,
) -> Engine {
    Engine::new(store, adapters, config)
}

pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(homeio::store::MemoryStore::new())
}

/// SQLite store in a fresh temporary directory. Keep the `TempDir` alive for the
/// duration of the test.
pub fn sqlite_store() -> (tempfile::TempDir, Arc<dyn Store>) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = homeio::store::SqliteStore::open(&dir.path().join("homeio.db")).unwrap();
    (dir, Arc::new(store))
}
