use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use crate::mux::DeviceHandle;
use crate::state::{DeviceEvent, DeviceState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    DeviceInit(String),
    DeviceUninit(String),
}

struct RegistryInner {
    devices: RwLock<HashMap<String, DeviceHandle>>,
    events: broadcast::Sender<RegistryEvent>,
}

/// Connected devices by id. Devices that disconnect are removed automatically.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}

impl DeviceRegistry {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(RegistryInner {
                devices: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Adds `handle`. Returns `false` if its id is already registered or it is
    /// already disconnected. Must be called within a Tokio runtime.
    pub fn register(&self, handle: DeviceHandle) -> bool {
        let id = handle.device_id().to_string();
        let device_events = handle.subscribe();
        if handle.is_disconnected() {
            return false;
        }
        {
            let mut devices = self.inner.devices.write();
            if devices.contains_key(&id) {
                debug!(device = %id, "device already registered");
                return false;
            }
            devices.insert(id.clone(), handle.clone());
        }
        info!(device = %id, "device registered");
        let _ = self.inner.events.send(RegistryEvent::DeviceInit(id.clone()));

        tokio::spawn(watch(Arc::downgrade(&self.inner), handle, device_events));
        true
    }

    /// Removes and disconnects the device. Returns `false` if it was not registered.
    pub fn deregister(&self, device_id: &str) -> bool {
        let removed = self.inner.devices.write().remove(device_id);
        match removed {
            Some(handle) => {
                handle.disconnect();
                self.inner.uninit(device_id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceHandle> {
        self.inner.devices.read().get(device_id).cloned()
    }

    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl RegistryInner {
    fn uninit(&self, device_id: &str) {
        info!(device = %device_id, "device deregistered");
        let _ = self
            .events
            .send(RegistryEvent::DeviceUninit(device_id.to_string()));
    }

    fn remove_if_current(&self, handle: &DeviceHandle) {
        let removed = {
            let mut devices = self.devices.write();
            match devices.get(handle.device_id()) {
                Some(current) if current.same_device(handle) => {
                    devices.remove(handle.device_id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.uninit(handle.device_id());
        }
    }
}

async fn watch(
    registry: Weak<RegistryInner>,
    handle: DeviceHandle,
    mut events: broadcast::Receiver<DeviceEvent>,
) {
    loop {
        match events.recv().await {
            Ok(DeviceEvent::Disconnected) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                if handle.state() == DeviceState::Disconnected {
                    break;
                }
            }
        }
    }
    if let Some(registry) = registry.upgrade() {
        registry.remove_if_current(&handle);
    }
}
