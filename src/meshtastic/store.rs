//! Persistence boundary.
//!
//! The host owns storage. The core pushes decoded state through [`MeshStore`]; write
//! failures are logged by the caller and never abort packet processing. [`MemoryStore`]
//! is a shared in-memory implementation for hosts without a database and for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::correlator::{PendingAdminRequest, Resolution};
use super::transport::DeviceId;
use crate::protobuf as proto;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// Application payload class of a recorded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Text,
    Position,
    Waypoint,
    NodeInfo,
    Routing,
    Admin,
    Telemetry,
    TraceRoute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub direction: Direction,
    pub kind: PacketKind,
    /// Node number of the radio the app is connected to.
    pub connected_node: u32,
    pub packet: proto::MeshPacket,
}

pub trait MeshStore: Send {
    /// The connected radio's own identity (`my_info`).
    fn upsert_node_identity(
        &mut self,
        device: &DeviceId,
        device_name: &str,
        info: &proto::MyNodeInfo,
    ) -> Result<(), StoreError>;
    fn upsert_node_info(&mut self, info: &proto::NodeInfo) -> Result<(), StoreError>;
    fn upsert_channel(&mut self, node_num: u32, channel: &proto::Channel)
        -> Result<(), StoreError>;
    fn upsert_config(&mut self, node_num: u32, config: &proto::Config) -> Result<(), StoreError>;
    fn upsert_module_config(
        &mut self,
        node_num: u32,
        config: &proto::ModuleConfig,
    ) -> Result<(), StoreError>;
    fn upsert_metadata(
        &mut self,
        node_num: u32,
        metadata: &proto::DeviceMetadata,
    ) -> Result<(), StoreError>;
    fn record_packet(&mut self, record: PacketRecord) -> Result<(), StoreError>;
    fn record_admin_request(&mut self, request: &PendingAdminRequest) -> Result<(), StoreError>;
    fn resolve_admin_request(&mut self, id: u32, resolution: Resolution)
        -> Result<(), StoreError>;
    fn delete_user(&mut self, num: u32) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryState {
    pub identities: BTreeMap<u32, (DeviceId, String, proto::MyNodeInfo)>,
    pub nodes: BTreeMap<u32, proto::NodeInfo>,
    pub channels: BTreeMap<(u32, i32), proto::Channel>,
    pub configs: Vec<(u32, proto::Config)>,
    pub module_configs: Vec<(u32, proto::ModuleConfig)>,
    pub metadata: BTreeMap<u32, proto::DeviceMetadata>,
    pub packets: Vec<PacketRecord>,
    pub admin_requests: Vec<PendingAdminRequest>,
    pub resolutions: Vec<(u32, Resolution)>,
    pub deleted_users: Vec<u32>,
    /// When set every write fails with [`StoreError::Unavailable`].
    pub fail_writes: bool,
}

/// Cloneable handle to shared in-memory state.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn snapshot(&self) -> MemoryState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut guard) = self.state.lock() {
            guard.fail_writes = fail;
        }
    }

    /// Seed a node record, e.g. a stale broadcast placeholder.
    pub fn insert_node(&self, info: proto::NodeInfo) {
        if let Ok(mut guard) = self.state.lock() {
            guard.nodes.insert(info.num, info);
        }
    }

    fn with_state<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut MemoryState),
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        if guard.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        f(&mut guard);
        Ok(())
    }
}

impl MeshStore for MemoryStore {
    fn upsert_node_identity(
        &mut self,
        device: &DeviceId,
        device_name: &str,
        info: &proto::MyNodeInfo,
    ) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.identities.insert(
                info.my_node_num,
                (device.clone(), device_name.to_string(), info.clone()),
            );
        })
    }

    fn upsert_node_info(&mut self, info: &proto::NodeInfo) -> Result<(), StoreError> {
        if info.num == 0 {
            return Err(StoreError::Rejected("node info without a node number".to_string()));
        }
        self.with_state(|s| {
            s.nodes.insert(info.num, info.clone());
        })
    }

    fn upsert_channel(
        &mut self,
        node_num: u32,
        channel: &proto::Channel,
    ) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.channels.insert((node_num, channel.index), channel.clone());
        })
    }

    fn upsert_config(&mut self, node_num: u32, config: &proto::Config) -> Result<(), StoreError> {
        self.with_state(|s| {
            let kind = super::codec::config_kind(config);
            s.configs
                .retain(|(n, c)| !(*n == node_num && super::codec::config_kind(c) == kind));
            s.configs.push((node_num, config.clone()));
        })
    }

    fn upsert_module_config(
        &mut self,
        node_num: u32,
        config: &proto::ModuleConfig,
    ) -> Result<(), StoreError> {
        self.with_state(|s| {
            let kind = super::codec::module_config_kind(config);
            s.module_configs
                .retain(|(n, c)| !(*n == node_num && super::codec::module_config_kind(c) == kind));
            s.module_configs.push((node_num, config.clone()));
        })
    }

    fn upsert_metadata(
        &mut self,
        node_num: u32,
        metadata: &proto::DeviceMetadata,
    ) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.metadata.insert(node_num, metadata.clone());
        })
    }

    fn record_packet(&mut self, record: PacketRecord) -> Result<(), StoreError> {
        self.with_state(|s| s.packets.push(record))
    }

    fn record_admin_request(&mut self, request: &PendingAdminRequest) -> Result<(), StoreError> {
        self.with_state(|s| s.admin_requests.push(request.clone()))
    }

    fn resolve_admin_request(
        &mut self,
        id: u32,
        resolution: Resolution,
    ) -> Result<(), StoreError> {
        self.with_state(|s| s.resolutions.push((id, resolution)))
    }

    fn delete_user(&mut self, num: u32) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.nodes.remove(&num);
            s.deleted_users.push(num);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let store = MemoryStore::default();
        let mut writer = store.clone();
        writer
            .upsert_channel(
                7,
                &proto::Channel {
                    index: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(store.snapshot().channels.contains_key(&(7, 0)));
    }

    #[test]
    fn config_upsert_replaces_same_kind() {
        use proto::config::{LoRaConfig, PayloadVariant, PositionConfig};
        let mut store = MemoryStore::default();
        let lora = |region| proto::Config {
            payload_variant: Some(PayloadVariant::Lora(LoRaConfig {
                region,
                ..Default::default()
            })),
        };
        let position = proto::Config {
            payload_variant: Some(PayloadVariant::Position(PositionConfig::default())),
        };
        store.upsert_config(1, &lora(1)).unwrap();
        store.upsert_config(1, &position).unwrap();
        store.upsert_config(1, &lora(3)).unwrap();
        let configs = store.snapshot().configs;
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].1, lora(3));
    }

    #[test]
    fn failing_writes() {
        let mut store = MemoryStore::default();
        store.set_fail_writes(true);
        assert!(matches!(
            store.delete_user(0xFFFF_FFFF),
            Err(StoreError::Unavailable(_))
        ));
        store.set_fail_writes(false);
        store.delete_user(0xFFFF_FFFF).unwrap();
        assert_eq!(store.snapshot().deleted_users, vec![0xFFFF_FFFF]);
    }
}
