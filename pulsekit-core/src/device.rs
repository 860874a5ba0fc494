//! Device identity
//!
//! The current device id is shared by the request builder and the identity
//! change sequences in [`crate::sdk`]. It is persisted in the store's
//! settings table so that a restart keeps attributing data to the same device.

use crate::db::RequestStore;
use crate::error::Result;
use crate::types::{DeviceId, DeviceIdType};
use std::sync::{PoisonError, RwLock};

const DEVICE_ID_KEY: &str = "device_id";
const DEVICE_ID_TYPE_KEY: &str = "device_id_type";

/// Holder of the current device id
#[derive(Debug)]
pub struct DeviceIdentity {
    current: RwLock<DeviceId>,
}

impl DeviceIdentity {
    pub fn new(device: DeviceId) -> Self {
        Self {
            current: RwLock::new(device),
        }
    }

    /// Resolve the startup identity: stored id, then `configured`, then a
    /// generated one. The result is written back to the store.
    pub fn resolve(store: &RequestStore, configured: Option<&str>) -> Result<Self> {
        let device = match load(store)? {
            Some(stored) => stored,
            None => match configured.filter(|id| !id.trim().is_empty()) {
                Some(id) => DeviceId::developer(id),
                None => DeviceId::generate(),
            },
        };
        save(store, &device)?;
        tracing::debug!(device_id = %device.id, kind = device.kind.as_str(), "Device id resolved");
        Ok(Self::new(device))
    }

    /// The persisted id, if any, without resolving a new one
    pub fn stored(store: &RequestStore) -> Result<Option<DeviceId>> {
        load(store)
    }

    pub fn current(&self) -> DeviceId {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the id and persist it. Returns the previous identity.
    ///
    /// The in-memory swap always happens; a failed write is logged and the
    /// stored id catches up on the next successful change.
    pub fn replace(&self, store: &RequestStore, device: DeviceId) -> DeviceId {
        if let Err(e) = save(store, &device) {
            tracing::error!(error = %e, device_id = %device.id, "Failed to persist device id, keeping it in memory");
        }
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, device)
    }
}

fn load(store: &RequestStore) -> Result<Option<DeviceId>> {
    let Some(id) = store.get_setting(DEVICE_ID_KEY)? else {
        return Ok(None);
    };
    let kind = store
        .get_setting(DEVICE_ID_TYPE_KEY)?
        .and_then(|raw| raw.parse::<DeviceIdType>().ok())
        .unwrap_or(DeviceIdType::DeveloperProvided);
    Ok(Some(DeviceId { id, kind }))
}

fn save(store: &RequestStore, device: &DeviceId) -> Result<()> {
    store.set_setting(DEVICE_ID_KEY, &device.id)?;
    store.set_setting(DEVICE_ID_TYPE_KEY, device.kind.as_str())
}
