//! Test utilities & fixtures.
//! A recording in-memory transport and helpers that walk a manager through the handshake.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use meshlink::config::ManagerSettings;
use meshlink::meshtastic::transport::{FROM_NUM_UUID, FROM_RADIO_UUID, MESH_SERVICE_UUID, TO_RADIO_UUID};
use meshlink::meshtastic::{
    Advertisement, Characteristic, ConnectionState, DeviceId, DeviceManager, FixedLocation,
    LocationFix, ManagerEvent, ManagerHandle, MemoryStore, Transport, TransportError,
    TransportEvent,
};
use meshlink::protobuf as proto;
use prost::Message;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MockState {
    pub powered_on: bool,
    pub scanning: bool,
    pub scans_started: usize,
    pub connects: Vec<DeviceId>,
    pub cancels: Vec<DeviceId>,
    pub connected: HashSet<DeviceId>,
    pub writes: Vec<(DeviceId, Characteristic, Vec<u8>)>,
    pub reads: Vec<(DeviceId, Characteristic)>,
    pub notifies: Vec<(DeviceId, Characteristic, bool)>,
    pub service_discoveries: usize,
    pub characteristic_discoveries: usize,
    pub fail_writes: bool,
}

/// Transport double. Clones share state so the test can inspect what the manager did.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                powered_on: true,
                ..Default::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_powered(&self, on: bool) {
        self.state().powered_on = on;
    }

    pub fn set_connected(&self, id: &DeviceId, connected: bool) {
        let mut state = self.state();
        if connected {
            state.connected.insert(id.clone());
        } else {
            state.connected.remove(id);
        }
    }

    /// Decoded `ToRadio` messages written so far.
    pub fn to_radio_writes(&self) -> Vec<proto::ToRadio> {
        self.state()
            .writes
            .iter()
            .filter(|(_, ch, _)| *ch == Characteristic::ToRadio)
            .map(|(_, _, bytes)| proto::ToRadio::decode(bytes.as_slice()).unwrap())
            .collect()
    }

    /// Decoded mesh packets written so far.
    pub fn sent_packets(&self) -> Vec<proto::MeshPacket> {
        self.to_radio_writes()
            .into_iter()
            .filter_map(|msg| match msg.payload_variant {
                Some(proto::to_radio::PayloadVariant::Packet(p)) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes.len()
    }
}

impl Transport for MockTransport {
    fn is_powered_on(&self) -> bool {
        self.state().powered_on
    }

    fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    fn start_scan(&mut self, _service: Uuid) {
        let mut state = self.state();
        state.scanning = true;
        state.scans_started += 1;
    }

    fn stop_scan(&mut self) {
        self.state().scanning = false;
    }

    fn connect(&mut self, id: &DeviceId) {
        self.state().connects.push(id.clone());
    }

    fn cancel_connection(&mut self, id: &DeviceId) {
        let mut state = self.state();
        state.cancels.push(id.clone());
        state.connected.remove(id);
    }

    fn is_connected(&self, id: &DeviceId) -> bool {
        self.state().connected.contains(id)
    }

    fn discover_services(&mut self, _id: &DeviceId, _services: &[Uuid]) {
        self.state().service_discoveries += 1;
    }

    fn discover_characteristics(&mut self, _id: &DeviceId, _service: Uuid) {
        self.state().characteristic_discoveries += 1;
    }

    fn write(
        &mut self,
        id: &DeviceId,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(TransportError::new(None, "write failed"));
        }
        state.writes.push((id.clone(), characteristic, data.to_vec()));
        Ok(())
    }

    fn read(&mut self, id: &DeviceId, characteristic: Characteristic) {
        self.state().reads.push((id.clone(), characteristic));
    }

    fn set_notify(&mut self, id: &DeviceId, characteristic: Characteristic, enabled: bool) {
        self.state()
            .notifies
            .push((id.clone(), characteristic, enabled));
    }
}

/// A manager wired to a mock transport and an in-memory store.
pub struct Harness {
    pub manager: DeviceManager,
    pub handle: ManagerHandle,
    pub transport: MockTransport,
    pub store: MemoryStore,
}

impl Harness {
    pub fn new(settings: ManagerSettings) -> Self {
        Self::with_location(settings, None)
    }

    pub fn with_location(settings: ManagerSettings, fix: Option<LocationFix>) -> Self {
        let transport = MockTransport::new();
        let store = MemoryStore::default();
        let (manager, handle, _sender) = DeviceManager::new(
            settings,
            Box::new(transport.clone()),
            Box::new(store.clone()),
            Box::new(FixedLocation::new(fix)),
        );
        Self {
            manager,
            handle,
            transport,
            store,
        }
    }

    /// Deliver a transport event, mirroring link state into the mock first.
    pub fn event(&mut self, event: TransportEvent) {
        match &event {
            TransportEvent::Connected(id) => self.transport.set_connected(id, true),
            TransportEvent::Disconnected { id, .. } => self.transport.set_connected(id, false),
            _ => {}
        }
        self.manager.handle_event(ManagerEvent::Transport(event));
    }

    pub fn advertise(&mut self, id: &str, name: &str) {
        self.event(TransportEvent::Discovered(Advertisement {
            id: DeviceId::from(id),
            name: name.to_string(),
            rssi: -60,
        }));
    }

    pub fn from_radio(&mut self, id: &str, msg: proto::FromRadio) {
        self.event(TransportEvent::ValueUpdated {
            id: DeviceId::from(id),
            characteristic: Characteristic::FromRadio,
            result: Ok(msg.encode_to_vec()),
        });
    }

    /// Connect to an advertised radio and run discovery. Returns the want-config nonce.
    pub fn connect_and_discover(&mut self, id: &str) -> u32 {
        let device = DeviceId::from(id);
        self.manager.connect_to(&device).unwrap();
        self.event(TransportEvent::Connected(device.clone()));
        self.event(TransportEvent::ServicesDiscovered {
            id: device.clone(),
            services: vec![MESH_SERVICE_UUID],
            error: None,
        });
        self.event(TransportEvent::CharacteristicsDiscovered {
            id: device,
            characteristics: vec![TO_RADIO_UUID, FROM_RADIO_UUID, FROM_NUM_UUID],
            error: None,
        });
        match self.manager.state() {
            ConnectionState::AwaitingHandshake { nonce } => *nonce,
            other => panic!("expected handshake, got {}", other),
        }
    }

    /// Full handshake: advertise, connect, my_info with `firmware`, config_complete.
    pub fn subscribe(&mut self, id: &str, name: &str, node_num: u32, firmware: &str) -> u32 {
        self.advertise(id, name);
        let nonce = self.connect_and_discover(id);
        self.from_radio(id, my_info(node_num, firmware));
        self.from_radio(id, config_complete(nonce));
        nonce
    }
}

pub fn settings() -> ManagerSettings {
    ManagerSettings::default()
}

pub fn from_radio(variant: proto::from_radio::PayloadVariant) -> proto::FromRadio {
    proto::FromRadio {
        id: 0,
        payload_variant: Some(variant),
    }
}

pub fn my_info(node_num: u32, firmware: &str) -> proto::FromRadio {
    from_radio(proto::from_radio::PayloadVariant::MyInfo(proto::MyNodeInfo {
        my_node_num: node_num,
        firmware_version: firmware.to_string(),
        ..Default::default()
    }))
}

pub fn config_complete(nonce: u32) -> proto::FromRadio {
    from_radio(proto::from_radio::PayloadVariant::ConfigCompleteId(nonce))
}

/// A decoded mesh packet wrapped in `FromRadio`.
pub fn packet(
    from: u32,
    to: u32,
    port: proto::PortNum,
    payload: Vec<u8>,
    request_id: u32,
) -> proto::FromRadio {
    from_radio(proto::from_radio::PayloadVariant::Packet(proto::MeshPacket {
        from,
        to,
        id: 4242,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: port as i32,
            payload: Bytes::from(payload),
            request_id,
            ..Default::default()
        })),
        ..Default::default()
    }))
}

/// The `Data` of a sent packet.
pub fn decoded(packet: &proto::MeshPacket) -> &proto::Data {
    match packet.payload_variant.as_ref() {
        Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => data,
        other => panic!("packet not decoded: {:?}", other),
    }
}
