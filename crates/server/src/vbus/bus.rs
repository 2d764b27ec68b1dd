//! Virtual bus and process-wide registry
//!
//! A bus owns up to a bus-id's worth of devices under decimal device ids
//! allocated lowest-free (ids are reused after removal, as the
//! `<bus>-<dev>` USB/IP address format requires). The registry is the
//! process-wide bus map behind a reader-writer lock and doubles as the
//! lifecycle coordinator: device creation arms the pending-claim timer,
//! stream binds cancel it, and removal fans out to the USB/IP driver and
//! stream pumps through the device's removal signal.

use crate::plugin::PluginSet;
use crate::vbus::device::VirtualDevice;
use protocol::Problem;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Inclusive bus id range
pub const MIN_BUS_ID: u32 = 1;
pub const MAX_BUS_ID: u32 = 99_999;

/// Default bound of a device's feedback queue
pub const DEFAULT_FEEDBACK_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("bus id {0} is out of range [{MIN_BUS_ID}, {MAX_BUS_ID}]")]
    BusIdRange(u32),

    #[error("bus {0} already exists")]
    BusExists(u32),

    #[error("no such bus: {0}")]
    BusNotFound(u32),

    #[error("bus {0} is not empty")]
    BusNotEmpty(u32),

    #[error("all bus ids are in use")]
    BusIdsExhausted,

    #[error("no such device: {0}")]
    DeviceNotFound(String),

    #[error("unknown device kind: {0}")]
    UnknownKind(String),
}

impl RegistryError {
    /// Wire form of the error for management replies.
    pub fn to_problem(&self) -> Problem {
        match self {
            RegistryError::BusExists(_) => Problem::new(409, "already-exists", self.to_string()),
            RegistryError::BusNotEmpty(_) | RegistryError::BusIdsExhausted => {
                Problem::conflict(self.to_string())
            }
            RegistryError::BusNotFound(_) | RegistryError::DeviceNotFound(_) => {
                Problem::not_found(self.to_string())
            }
            RegistryError::BusIdRange(_) | RegistryError::UnknownKind(_) => {
                Problem::bad_request(self.to_string())
            }
        }
    }
}

/// One virtual bus
pub struct Bus {
    id: u32,
    devices: Mutex<BTreeMap<u32, Arc<VirtualDevice>>>,
    /// Set while the bus is being torn down so a racing add fails
    closed: AtomicBool,
}

impl Bus {
    fn new(id: u32) -> Self {
        Self {
            id,
            devices: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn get(&self, dev_id: u32) -> Option<Arc<VirtualDevice>> {
        self.devices.lock().unwrap().get(&dev_id).cloned()
    }

    /// Devices in device-id order
    pub fn list(&self) -> Vec<Arc<VirtualDevice>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().unwrap().is_empty()
    }

    /// Allocate the lowest free device id and insert the device built for
    /// it. Fails once the bus is closed.
    fn insert_lowest(
        &self,
        make: impl FnOnce(u32) -> Arc<VirtualDevice>,
    ) -> Result<Arc<VirtualDevice>, RegistryError> {
        let mut devices = self.devices.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::BusNotFound(self.id));
        }
        let mut dev_id = 1u32;
        while devices.contains_key(&dev_id) {
            dev_id += 1;
        }
        let device = make(dev_id);
        devices.insert(dev_id, device.clone());
        Ok(device)
    }

    fn remove(&self, dev_id: u32) -> Option<Arc<VirtualDevice>> {
        self.devices.lock().unwrap().remove(&dev_id)
    }
}

/// Process-wide registry of buses; also the lifecycle coordinator.
pub struct Registry {
    buses: RwLock<BTreeMap<u32, Arc<Bus>>>,
    plugins: PluginSet,
    claim_timeout: Duration,
    feedback_capacity: usize,
}

impl Registry {
    pub fn new(plugins: PluginSet, claim_timeout: Duration, feedback_capacity: usize) -> Self {
        Self {
            buses: RwLock::new(BTreeMap::new()),
            plugins,
            claim_timeout,
            feedback_capacity,
        }
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }

    /// Create a bus. With `requested` unset the lowest free id is picked,
    /// counting up from 1.
    pub async fn create_bus(&self, requested: Option<u32>) -> Result<u32, RegistryError> {
        let mut buses = self.buses.write().await;
        let id = match requested {
            Some(id) => {
                if !(MIN_BUS_ID..=MAX_BUS_ID).contains(&id) {
                    return Err(RegistryError::BusIdRange(id));
                }
                if buses.contains_key(&id) {
                    return Err(RegistryError::BusExists(id));
                }
                id
            }
            None => {
                let mut id = MIN_BUS_ID;
                while buses.contains_key(&id) {
                    id += 1;
                    if id > MAX_BUS_ID {
                        return Err(RegistryError::BusIdsExhausted);
                    }
                }
                id
            }
        };
        buses.insert(id, Arc::new(Bus::new(id)));
        info!(bus = id, "bus created");
        Ok(id)
    }

    /// Remove an empty bus. Fails while any device is present.
    pub async fn remove_bus(&self, id: u32) -> Result<(), RegistryError> {
        let mut buses = self.buses.write().await;
        let bus = buses.get(&id).ok_or(RegistryError::BusNotFound(id))?;
        {
            let devices = bus.devices.lock().unwrap();
            if !devices.is_empty() {
                return Err(RegistryError::BusNotEmpty(id));
            }
            bus.closed.store(true, Ordering::Release);
        }
        buses.remove(&id);
        info!(bus = id, "bus removed");
        Ok(())
    }

    pub async fn list_buses(&self) -> Vec<u32> {
        self.buses.read().await.keys().copied().collect()
    }

    pub async fn bus(&self, id: u32) -> Option<Arc<Bus>> {
        self.buses.read().await.get(&id).cloned()
    }

    /// Create a device of `kind` on a bus and arm its pending-claim timer.
    pub async fn add_device(
        &self,
        bus_id: u32,
        kind: &str,
    ) -> Result<Arc<VirtualDevice>, RegistryError> {
        let plugin = self
            .plugins
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))?;
        let bus = self
            .bus(bus_id)
            .await
            .ok_or(RegistryError::BusNotFound(bus_id))?;

        let capacity = self.feedback_capacity;
        let device = bus.insert_lowest(move |dev_id| {
            Arc::new(VirtualDevice::new(bus_id, dev_id, plugin, capacity))
        })?;
        info!(device = %device.busid(), kind, "device created, pending claim");

        // Pending-claim timer: a bind that wins the race by any margin
        // keeps the device; expiry frees the bus slot.
        let timer_bus = bus.clone();
        let timer_device = device.clone();
        let timeout = self.claim_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timer_device.mark_removed_if_unclaimed() {
                timer_bus.remove(timer_device.dev_id());
                info!(device = %timer_device.busid(), "pending-claim timer expired, device removed");
            }
        });

        Ok(device)
    }

    /// Explicit device removal: forces USB/IP detach, then closes any
    /// stream session (both via the removal signal), then frees the slot.
    pub async fn remove_device(
        &self,
        bus_id: u32,
        dev_id: u32,
    ) -> Result<Arc<VirtualDevice>, RegistryError> {
        let bus = self
            .bus(bus_id)
            .await
            .ok_or(RegistryError::BusNotFound(bus_id))?;
        let device = bus
            .remove(dev_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(format!("{bus_id}-{dev_id}")))?;
        device.mark_removed();
        info!(device = %device.busid(), "device removed");
        Ok(device)
    }

    pub async fn find_device(
        &self,
        bus_id: u32,
        dev_id: u32,
    ) -> Result<Arc<VirtualDevice>, RegistryError> {
        let bus = self
            .bus(bus_id)
            .await
            .ok_or(RegistryError::BusNotFound(bus_id))?;
        bus.get(dev_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(format!("{bus_id}-{dev_id}")))
    }

    /// Resolve a `<bus>-<dev>` wire identity.
    pub async fn lookup_busid(&self, busid: &str) -> Option<Arc<VirtualDevice>> {
        let (bus_id, dev_id) = parse_busid(busid)?;
        self.find_device(bus_id, dev_id).await.ok()
    }

    /// Every exported device, for OP_REQ_DEVLIST.
    pub async fn all_devices(&self) -> Vec<Arc<VirtualDevice>> {
        let buses = self.buses.read().await;
        let mut devices = Vec::new();
        for bus in buses.values() {
            devices.extend(bus.list());
        }
        devices
    }
}

/// Parse a `<bus>-<dev>` identity.
pub fn parse_busid(busid: &str) -> Option<(u32, u32)> {
    let (bus, dev) = busid.split_once('-')?;
    let bus: u32 = bus.parse().ok()?;
    let dev: u32 = dev.parse().ok()?;
    if bus == 0 || dev == 0 {
        return None;
    }
    Some((bus, dev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(
            PluginSet::builtin(),
            Duration::from_millis(50),
            DEFAULT_FEEDBACK_CAPACITY,
        ))
    }

    #[tokio::test]
    async fn test_create_bus_picks_lowest_free() {
        let registry = registry();
        assert_eq!(registry.create_bus(None).await.unwrap(), 1);
        assert_eq!(registry.create_bus(None).await.unwrap(), 2);
        registry.remove_bus(1).await.unwrap();
        assert_eq!(registry.create_bus(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_bus_explicit_id() {
        let registry = registry();
        assert_eq!(registry.create_bus(Some(80000)).await.unwrap(), 80000);
        assert_eq!(
            registry.create_bus(Some(80000)).await,
            Err(RegistryError::BusExists(80000))
        );
        assert_eq!(
            registry.create_bus(Some(0)).await,
            Err(RegistryError::BusIdRange(0))
        );
        assert_eq!(
            registry.create_bus(Some(100_000)).await,
            Err(RegistryError::BusIdRange(100_000))
        );
        assert_eq!(registry.create_bus(Some(MAX_BUS_ID)).await.unwrap(), MAX_BUS_ID);
    }

    #[tokio::test]
    async fn test_hundredth_bus_succeeds() {
        let registry = registry();
        for expected in 1..=99u32 {
            assert_eq!(registry.create_bus(None).await.unwrap(), expected);
        }
        assert_eq!(registry.create_bus(None).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_remove_bus_requires_empty() {
        let registry = registry();
        let bus_id = registry.create_bus(None).await.unwrap();
        let device = registry.add_device(bus_id, "mouse").await.unwrap();
        assert_eq!(
            registry.remove_bus(bus_id).await,
            Err(RegistryError::BusNotEmpty(bus_id))
        );

        registry.remove_device(bus_id, device.dev_id()).await.unwrap();
        registry.remove_bus(bus_id).await.unwrap();

        // Repeated removal of a now-gone bus yields the same error.
        assert_eq!(
            registry.remove_bus(bus_id).await,
            Err(RegistryError::BusNotFound(bus_id))
        );
        assert_eq!(
            registry.remove_bus(bus_id).await,
            Err(RegistryError::BusNotFound(bus_id))
        );
    }

    #[tokio::test]
    async fn test_device_ids_reuse_lowest() {
        let registry = registry();
        let bus_id = registry.create_bus(None).await.unwrap();

        let d1 = registry.add_device(bus_id, "keyboard").await.unwrap();
        let d2 = registry.add_device(bus_id, "mouse").await.unwrap();
        let d3 = registry.add_device(bus_id, "gamepad").await.unwrap();
        assert_eq!((d1.dev_id(), d2.dev_id(), d3.dev_id()), (1, 2, 3));
        // Keep them alive past the claim timer.
        for d in [&d1, &d2, &d3] {
            d.bind_stream(1).unwrap();
        }

        registry.remove_device(bus_id, 2).await.unwrap();
        let d4 = registry.add_device(bus_id, "mouse").await.unwrap();
        assert_eq!(d4.dev_id(), 2);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let registry = registry();
        let bus_id = registry.create_bus(None).await.unwrap();
        assert_eq!(
            registry.add_device(bus_id, "trackball").await.unwrap_err(),
            RegistryError::UnknownKind("trackball".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_claim_expiry_removes_device() {
        let registry = registry();
        let bus_id = registry.create_bus(None).await.unwrap();
        let device = registry.add_device(bus_id, "keyboard").await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(device.is_removed());
        assert!(registry.bus(bus_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_cancels_pending_claim() {
        let registry = registry();
        let bus_id = registry.create_bus(None).await.unwrap();
        let device = registry.add_device(bus_id, "keyboard").await.unwrap();

        device.bind_stream(1).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!device.is_removed());
        assert_eq!(registry.bus(bus_id).await.unwrap().list().len(), 1);

        // The claim is permanent: unbinding later re-arms nothing.
        device.unbind_stream(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!device.is_removed());
    }

    #[tokio::test]
    async fn test_lookup_busid() {
        let registry = registry();
        let bus_id = registry.create_bus(Some(80000)).await.unwrap();
        let device = registry.add_device(bus_id, "keyboard").await.unwrap();
        device.bind_stream(1).unwrap();

        let found = registry.lookup_busid("80000-1").await.unwrap();
        assert_eq!(found.busid(), device.busid());

        assert!(registry.lookup_busid("80000-2").await.is_none());
        assert!(registry.lookup_busid("80001-1").await.is_none());
        assert!(registry.lookup_busid("garbage").await.is_none());
        assert!(registry.lookup_busid("0-1").await.is_none());
    }

    #[test]
    fn test_parse_busid() {
        assert_eq!(parse_busid("80000-1"), Some((80000, 1)));
        assert_eq!(parse_busid("1-2"), Some((1, 2)));
        assert_eq!(parse_busid("1"), None);
        assert_eq!(parse_busid("a-b"), None);
        assert_eq!(parse_busid("1-0"), None);
    }

    #[test]
    fn test_error_problem_mapping() {
        assert_eq!(RegistryError::BusExists(5).to_problem().status, 409);
        assert_eq!(RegistryError::BusExists(5).to_problem().title, "already-exists");
        assert_eq!(RegistryError::BusNotEmpty(5).to_problem().status, 409);
        assert_eq!(RegistryError::BusNotFound(5).to_problem().status, 404);
        assert_eq!(RegistryError::UnknownKind("x".into()).to_problem().status, 400);
    }
}
