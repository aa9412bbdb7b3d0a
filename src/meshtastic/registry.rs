//! Discovered radios and their freshness.

use std::time::Duration;
use tokio::time::Instant;

use super::codec::BROADCAST_NUM;
use super::transport::DeviceId;

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: String,
    /// Node number, `BROADCAST_NUM` until a handshake reports it.
    pub node_num: u32,
    pub rssi: i32,
    pub last_seen: Instant,
}

impl DiscoveredDevice {
    pub fn has_node_num(&self) -> bool {
        self.node_num != BROADCAST_NUM && self.node_num != 0
    }
}

/// Devices seen by the scanner, in first-seen order.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<DiscoveredDevice>,
    freshness: Duration,
}

impl DeviceRegistry {
    pub fn new(freshness: Duration) -> Self {
        Self {
            devices: Vec::new(),
            freshness,
        }
    }

    /// Upsert by identity. An existing entry keeps its position and node number.
    pub fn observe(&mut self, id: &DeviceId, name: &str, rssi: i32, now: Instant) {
        match self.devices.iter_mut().find(|d| &d.id == id) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.rssi = rssi;
                existing.last_seen = now;
            }
            None => self.devices.push(DiscoveredDevice {
                id: id.clone(),
                name: name.to_string(),
                node_num: BROADCAST_NUM,
                rssi,
                last_seen: now,
            }),
        }
    }

    /// Drop entries not seen within the freshness window. `keep` (the connected
    /// device) is never pruned. Returns the number removed.
    pub fn prune_stale(&mut self, now: Instant, keep: Option<&DeviceId>) -> usize {
        let before = self.devices.len();
        let freshness = self.freshness;
        self.devices.retain(|d| {
            keep == Some(&d.id) || now.saturating_duration_since(d.last_seen) <= freshness
        });
        before - self.devices.len()
    }

    /// Keep only the given device.
    pub fn retain_only(&mut self, id: &DeviceId) {
        self.devices.retain(|d| &d.id == id);
    }

    pub fn set_node_num(&mut self, id: &DeviceId, node_num: u32) {
        if let Some(d) = self.devices.iter_mut().find(|d| &d.id == id) {
            d.node_num = node_num;
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.get(id).is_some()
    }

    pub fn list_visible(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
