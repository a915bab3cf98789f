use crate::device::Device;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared set of discovered devices, unique by hardware id
///
/// Clones share the same set, so several coordinators can be handed one
/// registry explicitly.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<Mutex<Vec<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot copy of every known device
    pub fn devices(&self) -> Vec<Device> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.lock().iter().any(|device| device.id() == id)
    }

    /// Add `device` unless one with the same id is already known
    pub fn insert(&self, device: Device) -> bool {
        let mut devices = self.lock();
        if devices.iter().any(|known| known.id() == device.id()) {
            return false;
        }
        devices.push(device);
        true
    }

    /// First device whose IP address, name or room name equals `value`
    pub fn find(&self, value: &str) -> Option<Device> {
        self.lock().iter().find(|device| device.matches(value)).cloned()
    }

    /// Stop every device session and forget all devices
    pub fn clear(&self) {
        let devices = std::mem::take(&mut *self.lock());
        for device in devices {
            device.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use std::net::{IpAddr, Ipv4Addr};

    fn device(name: &str, id: &str) -> Device {
        Device::new(
            name,
            id,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            "FAN,LSERIES",
            SessionConfig::default(),
        )
    }

    #[test]
    fn test_unique_by_id() {
        let registry = DeviceRegistry::new();
        assert!(registry.insert(device("Porch", "AA")));
        assert!(!registry.insert(device("Porch again", "AA")));
        assert!(registry.insert(device("Den", "BB")));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains_id("BB"));
    }

    #[test]
    fn test_clones_share_devices() {
        let registry = DeviceRegistry::new();
        let shared = registry.clone();
        shared.insert(device("Den", "BB"));
        assert_eq!(registry.find("Den").map(|d| d.id().to_string()), Some("BB".into()));

        let snapshot = registry.devices();
        registry.clear();
        assert!(shared.is_empty());
        assert_eq!(snapshot.len(), 1);
    }
}
