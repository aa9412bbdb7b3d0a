//! Connection state machine and event loop.
//!
//! [`DeviceManager`] owns the transport, the store, the registry and the single active
//! session. Transport callbacks, timer ticks and host commands all arrive on one queue and
//! are handled one at a time by [`DeviceManager::handle_event`], so session state is never
//! mutated concurrently. Hosts talk to a running manager through a cloneable
//! [`ManagerHandle`]; radio adapters push [`TransportEvent`]s through a
//! [`TransportEventSender`].

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::codec::{
    self, decode_channel_url, AdminRequest, OutboundPacket, ADMIN_DELAY_SECS, BROADCAST_NUM,
};
use super::correlator::PendingAdminRequest;
use super::dispatch::{dispatch, DispatchContext};
use super::error::{MeshError, MeshResult};
use super::registry::{DeviceRegistry, DiscoveredDevice};
use super::reporter::{position_packet, waypoint_from_fix, waypoint_packet, LocationProvider};
use super::session::{ActiveSession, ConnectionState, SessionSummary};
use super::store::{Direction, MeshStore, PacketKind, PacketRecord};
use super::timer::RepeatingTimer;
use super::transport::{
    Advertisement, Characteristic, DeviceId, DisconnectCause, Transport, TransportError,
    TransportEvent, ATT_INSUFFICIENT_AUTHENTICATION, ATT_INSUFFICIENT_ENCRYPTION,
    MESH_SERVICE_UUID,
};
use crate::config::ManagerSettings;
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics;
use crate::protobuf as proto;

const REGISTRY_PRUNE_PERIOD: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<MeshResult<T>>;

/// Host requests handled on the manager's event loop.
#[derive(Debug)]
pub enum Command {
    StartScanning(Reply<()>),
    StopScanning,
    ConnectTo(DeviceId, Reply<()>),
    ConnectToPreferred(oneshot::Sender<bool>),
    Disconnect,
    SendText {
        text: String,
        to: Option<u32>,
        channel: u32,
        is_emoji: bool,
        reply_id: Option<u32>,
        reply: Reply<u32>,
    },
    SendPosition {
        dest: u32,
        want_response: bool,
        reply: Reply<u32>,
    },
    SendWaypoint {
        dest: u32,
        name: String,
        description: String,
        reply: Reply<u32>,
    },
    SendTraceRoute {
        dest: u32,
        want_response: bool,
        reply: Reply<u32>,
    },
    Admin {
        request: AdminRequest,
        to: Option<u32>,
        reply: Reply<u32>,
    },
    SaveChannelSet {
        url: String,
        reply: Reply<Vec<u32>>,
    },
    SetLocationSharing {
        enabled: bool,
        interval: Option<Duration>,
    },
    Status(oneshot::Sender<ManagerStatus>),
    Shutdown,
}

#[derive(Debug)]
pub enum ManagerEvent {
    Transport(TransportEvent),
    ConnectTimeout { generation: u64 },
    PositionTick { generation: u64 },
    PruneRegistry,
    Command(Command),
}

/// Point-in-time view of the manager for the host UI.
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    pub state: ConnectionState,
    pub scanning: bool,
    pub visible_devices: Vec<DiscoveredDevice>,
    pub session: Option<SessionSummary>,
    pub last_error: Option<String>,
    pub retry_runs: u32,
    pub firmware_incompatible: bool,
    pub preferred_device: Option<DeviceId>,
    pub preferred_node_num: u32,
    pub connected_to_preferred: bool,
    pub config_nonce: u32,
    pub last_trace_route: Option<String>,
}

/// Entry point for radio adapters.
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl TransportEventSender {
    /// Returns false once the manager has stopped.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send(ManagerEvent::Transport(event)).is_ok()
    }
}

/// Cloneable command interface to a running [`DeviceManager`].
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ManagerHandle {
    fn submit(&self, command: Command) -> MeshResult<()> {
        self.tx
            .send(ManagerEvent::Command(command))
            .map_err(|_| MeshError::ManagerStopped)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> MeshResult<T> {
        let (reply, rx) = oneshot::channel();
        self.submit(build(reply))?;
        rx.await.map_err(|_| MeshError::ManagerStopped)?
    }

    pub async fn start_scanning(&self) -> MeshResult<()> {
        self.request(Command::StartScanning).await
    }

    pub fn stop_scanning(&self) -> MeshResult<()> {
        self.submit(Command::StopScanning)
    }

    pub async fn connect_to(&self, id: DeviceId) -> MeshResult<()> {
        self.request(|reply| Command::ConnectTo(id, reply)).await
    }

    pub async fn connect_to_preferred(&self) -> MeshResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::ConnectToPreferred(reply))?;
        rx.await.map_err(|_| MeshError::ManagerStopped)
    }

    pub fn disconnect(&self) -> MeshResult<()> {
        self.submit(Command::Disconnect)
    }

    pub async fn send_text(
        &self,
        text: impl Into<String>,
        to: Option<u32>,
        channel: u32,
        is_emoji: bool,
        reply_id: Option<u32>,
    ) -> MeshResult<u32> {
        let text = text.into();
        self.request(|reply| Command::SendText {
            text,
            to,
            channel,
            is_emoji,
            reply_id,
            reply,
        })
        .await
    }

    pub async fn send_position(&self, dest: u32, want_response: bool) -> MeshResult<u32> {
        self.request(|reply| Command::SendPosition {
            dest,
            want_response,
            reply,
        })
        .await
    }

    pub async fn send_waypoint(
        &self,
        dest: u32,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> MeshResult<u32> {
        let (name, description) = (name.into(), description.into());
        self.request(|reply| Command::SendWaypoint {
            dest,
            name,
            description,
            reply,
        })
        .await
    }

    pub async fn send_trace_route(&self, dest: u32, want_response: bool) -> MeshResult<u32> {
        self.request(|reply| Command::SendTraceRoute {
            dest,
            want_response,
            reply,
        })
        .await
    }

    /// Send an admin request to `to` (the connected node when `None`).
    pub async fn send_admin(&self, request: AdminRequest, to: Option<u32>) -> MeshResult<u32> {
        self.request(|reply| Command::Admin { request, to, reply })
            .await
    }

    pub async fn request_device_metadata(&self) -> MeshResult<u32> {
        self.send_admin(AdminRequest::GetDeviceMetadata, None).await
    }

    pub async fn save_channel(&self, channel: proto::Channel) -> MeshResult<u32> {
        self.send_admin(AdminRequest::SetChannel(channel), None).await
    }

    pub async fn save_owner(&self, user: proto::User) -> MeshResult<u32> {
        self.send_admin(AdminRequest::SetOwner(user), None).await
    }

    pub async fn save_config(&self, config: proto::Config) -> MeshResult<u32> {
        self.send_admin(AdminRequest::SetConfig(config), None).await
    }

    pub async fn save_module_config(&self, config: proto::ModuleConfig) -> MeshResult<u32> {
        self.send_admin(AdminRequest::SetModuleConfig(config), None)
            .await
    }

    pub async fn save_canned_messages(&self, messages: impl Into<String>) -> MeshResult<u32> {
        self.send_admin(AdminRequest::SetCannedMessages(messages.into()), None)
            .await
    }

    pub async fn get_channel(&self, index: u32) -> MeshResult<u32> {
        self.send_admin(AdminRequest::GetChannel(index), None).await
    }

    pub async fn get_canned_messages(&self) -> MeshResult<u32> {
        self.send_admin(AdminRequest::GetCannedMessages, None).await
    }

    pub async fn reboot(&self) -> MeshResult<u32> {
        self.send_admin(
            AdminRequest::Reboot {
                seconds: ADMIN_DELAY_SECS,
            },
            None,
        )
        .await
    }

    pub async fn shutdown_radio(&self) -> MeshResult<u32> {
        self.send_admin(
            AdminRequest::Shutdown {
                seconds: ADMIN_DELAY_SECS,
            },
            None,
        )
        .await
    }

    pub async fn factory_reset(&self) -> MeshResult<u32> {
        self.send_admin(AdminRequest::FactoryReset, None).await
    }

    pub async fn nodedb_reset(&self) -> MeshResult<u32> {
        self.send_admin(AdminRequest::NodeDbReset, None).await
    }

    pub async fn save_channel_set(&self, url: impl Into<String>) -> MeshResult<Vec<u32>> {
        let url = url.into();
        self.request(|reply| Command::SaveChannelSet { url, reply })
            .await
    }

    pub fn set_location_sharing(&self, enabled: bool, interval: Option<Duration>) -> MeshResult<()> {
        self.submit(Command::SetLocationSharing { enabled, interval })
    }

    pub async fn status(&self) -> MeshResult<ManagerStatus> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Status(reply))?;
        rx.await.map_err(|_| MeshError::ManagerStopped)
    }

    /// Ask the event loop to exit.
    pub fn shutdown(&self) -> MeshResult<()> {
        self.submit(Command::Shutdown)
    }
}

pub struct DeviceManager {
    settings: ManagerSettings,
    transport: Box<dyn Transport>,
    store: Box<dyn MeshStore>,
    location: Box<dyn LocationProvider>,
    registry: DeviceRegistry,
    state: ConnectionState,
    session: Option<ActiveSession>,
    preferred_device: Option<DeviceId>,
    preferred_node_num: u32,
    /// Rejected for firmware reasons; skipped by auto-reconnect until chosen again.
    excluded_device: Option<DeviceId>,
    last_error: Option<String>,
    config_nonce: u32,
    retry_runs: u32,
    firmware_invalid: bool,
    last_trace_route: Option<String>,
    provide_location: bool,
    location_interval: Duration,
    connect_timer: RepeatingTimer,
    position_timer: RepeatingTimer,
    event_tx: mpsc::UnboundedSender<ManagerEvent>,
    event_rx: mpsc::UnboundedReceiver<ManagerEvent>,
}

impl DeviceManager {
    pub fn new(
        settings: ManagerSettings,
        transport: Box<dyn Transport>,
        store: Box<dyn MeshStore>,
        location: Box<dyn LocationProvider>,
    ) -> (Self, ManagerHandle, TransportEventSender) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = ManagerHandle {
            tx: event_tx.clone(),
        };
        let sender = TransportEventSender {
            tx: event_tx.clone(),
        };
        let manager = Self {
            registry: DeviceRegistry::new(settings.device_freshness),
            state: ConnectionState::Idle,
            session: None,
            preferred_device: settings.preferred_device_id.clone().map(DeviceId),
            preferred_node_num: settings.preferred_node_num,
            excluded_device: None,
            last_error: None,
            config_nonce: 0,
            retry_runs: 0,
            firmware_invalid: false,
            last_trace_route: None,
            provide_location: settings.provide_location,
            location_interval: settings.location_interval,
            connect_timer: RepeatingTimer::default(),
            position_timer: RepeatingTimer::default(),
            settings,
            transport,
            store,
            location,
            event_tx,
            event_rx,
        };
        (manager, handle, sender)
    }

    /// Process events until a shutdown command arrives.
    pub async fn run(mut self) -> Result<()> {
        info!("Device manager started");
        let mut prune = interval(REGISTRY_PRUNE_PERIOD);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => {
                            if !self.handle_event(event) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = prune.tick() => self.prune_registry(),
            }
        }

        self.teardown();
        info!("Device manager stopped");
        Ok(())
    }

    /// Wait for the next queued event (for hosts that drive the manager themselves).
    pub async fn next_event(&mut self) -> Option<ManagerEvent> {
        self.event_rx.recv().await
    }

    /// Handle one event. Returns false when the manager should stop.
    pub fn handle_event(&mut self, event: ManagerEvent) -> bool {
        match event {
            ManagerEvent::Transport(ev) => self.on_transport_event(ev),
            ManagerEvent::ConnectTimeout { generation } => self.on_connect_timeout(generation),
            ManagerEvent::PositionTick { generation } => self.on_position_tick(generation),
            ManagerEvent::PruneRegistry => self.prune_registry(),
            ManagerEvent::Command(Command::Shutdown) => return false,
            ManagerEvent::Command(cmd) => self.on_command(cmd),
        }
        true
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartScanning(reply) => {
                let _ = reply.send(self.start_scanning());
            }
            Command::StopScanning => self.stop_scanning(),
            Command::ConnectTo(id, reply) => {
                let _ = reply.send(self.connect_to(&id));
            }
            Command::ConnectToPreferred(reply) => {
                let _ = reply.send(self.connect_to_preferred());
            }
            Command::Disconnect => self.disconnect(),
            Command::SendText {
                text,
                to,
                channel,
                is_emoji,
                reply_id,
                reply,
            } => {
                let _ = reply.send(self.send_text(&text, to, channel, is_emoji, reply_id));
            }
            Command::SendPosition {
                dest,
                want_response,
                reply,
            } => {
                let _ = reply.send(self.send_position(dest, want_response));
            }
            Command::SendWaypoint {
                dest,
                name,
                description,
                reply,
            } => {
                let _ = reply.send(self.send_waypoint(dest, &name, &description));
            }
            Command::SendTraceRoute {
                dest,
                want_response,
                reply,
            } => {
                let _ = reply.send(self.send_trace_route(dest, want_response));
            }
            Command::Admin { request, to, reply } => {
                let _ = reply.send(self.send_admin(request, to));
            }
            Command::SaveChannelSet { url, reply } => {
                let _ = reply.send(self.save_channel_set(&url));
            }
            Command::SetLocationSharing { enabled, interval } => {
                self.set_location_sharing(enabled, interval)
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn retry_runs(&self) -> u32 {
        self.retry_runs
    }

    pub fn status(&self) -> ManagerStatus {
        let session = self.session.as_ref().map(ActiveSession::summary);
        let connected_to_preferred = matches!(
            (&self.session, &self.preferred_device),
            (Some(s), Some(p)) if &s.device == p
        );
        ManagerStatus {
            state: self.state.clone(),
            scanning: self.transport.is_scanning(),
            visible_devices: self.registry.list_visible(),
            session,
            last_error: self.last_error.clone(),
            retry_runs: self.retry_runs,
            firmware_incompatible: self.firmware_invalid,
            preferred_device: self.preferred_device.clone(),
            preferred_node_num: self.preferred_node_num,
            connected_to_preferred,
            config_nonce: self.config_nonce,
            last_trace_route: self.last_trace_route.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // Scanning and connection lifecycle
    // ---------------------------------------------------------------------

    pub fn start_scanning(&mut self) -> MeshResult<()> {
        if !self.transport.is_powered_on() {
            debug!("Scan suppressed: radio powered off");
            return Err(MeshError::TransportUnavailable);
        }
        self.transport.start_scan(MESH_SERVICE_UUID);
        if self.session.is_none() && !self.state.is_connecting() {
            self.state = ConnectionState::Scanning;
        }
        debug!("Scanning for Meshtastic radios");
        Ok(())
    }

    pub fn stop_scanning(&mut self) {
        if self.transport.is_scanning() {
            self.transport.stop_scan();
        }
        if self.state == ConnectionState::Scanning {
            self.state = ConnectionState::Idle;
        }
    }

    /// Rescan if the radio is on, otherwise fall back to idle.
    fn resume_scanning(&mut self) {
        if self.start_scanning().is_err() {
            self.state = ConnectionState::Idle;
        }
    }

    /// Start a connection attempt, replacing any existing session.
    pub fn connect_to(&mut self, id: &DeviceId) -> MeshResult<()> {
        if !self.transport.is_powered_on() {
            return Err(MeshError::TransportUnavailable);
        }
        if self.excluded_device.as_ref() == Some(id) {
            self.excluded_device = None;
        }
        if let Some(current) = self.session.as_ref().map(|s| s.device.clone()) {
            if &current == id && self.state == ConnectionState::Subscribed {
                return Ok(());
            }
            info!("Replacing connection to {} with {}", current, id);
            self.transport.cancel_connection(&current);
            self.clear_session();
        }
        if let ConnectionState::Connecting { target, .. } = &self.state {
            if target != id {
                let target = target.clone();
                self.transport.cancel_connection(&target);
            }
        }
        self.begin_connect(id.clone());
        Ok(())
    }

    fn begin_connect(&mut self, id: DeviceId) {
        if self.transport.is_scanning() {
            self.transport.stop_scan();
        }
        self.firmware_invalid = false;
        info!("Connecting to {}", id);
        metrics::inc_connect_attempts();
        self.transport.connect(&id);
        self.state = ConnectionState::Connecting {
            target: id,
            attempts: 0,
        };
        self.connect_timer.arm(
            self.settings.connect_timeout,
            self.event_tx.clone(),
            |generation| ManagerEvent::ConnectTimeout { generation },
        );
    }

    fn on_connect_timeout(&mut self, generation: u64) {
        if !self.connect_timer.is_current(generation) {
            return;
        }
        let (target, attempts) = match &self.state {
            ConnectionState::Connecting { target, attempts } => (target.clone(), attempts + 1),
            _ => {
                self.connect_timer.cancel();
                return;
            }
        };
        metrics::inc_connect_timeouts();
        let name = self.display_name(&target);
        info!(
            "Connection attempt {} of {} to {} timed out",
            attempts,
            self.settings.max_connect_attempts,
            escape_log(&name)
        );
        if attempts < self.settings.max_connect_attempts {
            self.state = ConnectionState::Connecting { target, attempts };
            return;
        }

        metrics::inc_connections_abandoned();
        self.transport.cancel_connection(&target);
        self.clear_session();
        self.last_error = Some(
            MeshError::ConnectionTimeout {
                device: name,
                attempts,
            }
            .to_string(),
        );
        self.retry_runs += 1;
        warn!(
            "Abandoned connection to {} after {} attempts (retry run {})",
            target, attempts, self.retry_runs
        );
        self.resume_scanning();
    }

    /// Host-initiated disconnect. No error is surfaced.
    pub fn disconnect(&mut self) {
        let device = match (&self.session, &self.state) {
            (Some(s), _) => s.device.clone(),
            (None, ConnectionState::Connecting { target, .. }) => target.clone(),
            _ => return,
        };
        info!("Disconnecting from {}", device);
        self.connect_timer.cancel();
        self.position_timer.cancel();
        self.state = ConnectionState::Disconnecting;
        self.transport.cancel_connection(&device);
        if !self.transport.is_connected(&device) {
            self.clear_session();
            self.state = ConnectionState::Idle;
        }
    }

    fn clear_session(&mut self) {
        self.connect_timer.cancel();
        self.position_timer.cancel();
        if let Some(session) = self.session.take() {
            if !session.pending.is_empty() {
                debug!(
                    "Dropping {} pending admin requests for {}",
                    session.pending.len(),
                    session.device
                );
            }
        }
        if !matches!(self.state, ConnectionState::Scanning) {
            self.state = ConnectionState::Idle;
        }
    }

    /// Tear down a stale link, rescan, and try the preferred radio if it is visible.
    fn recover_connection(&mut self) {
        if let Some(device) = self.session.as_ref().map(|s| s.device.clone()) {
            self.transport.cancel_connection(&device);
            self.clear_session();
        }
        if self.state.is_connecting() {
            return;
        }
        self.resume_scanning();
        if let Some(preferred) = self.preferred_device.clone() {
            if self.registry.contains(&preferred) && self.excluded_device.as_ref() != Some(&preferred)
            {
                let _ = self.connect_to(&preferred);
            }
        }
    }

    /// True when a session is subscribed or an attempt to the preferred radio started.
    pub fn connect_to_preferred(&mut self) -> bool {
        if self.state == ConnectionState::Subscribed {
            return true;
        }
        self.recover_connection();
        self.state.is_connecting()
    }

    /// Reject the current radio (missing characteristics or firmware too old).
    fn reject_device(&mut self, err: MeshError) {
        let message = match &err {
            MeshError::FirmwareTooOld { found, minimum } => format!(
                "Update your firmware: version {} is older than the minimum supported {}.",
                found, minimum
            ),
            MeshError::HandshakeRejected(detail) => {
                format!("Unsupported Firmware Version Detected: {}", detail)
            }
            other => other.to_string(),
        };
        warn!("{}", message);
        self.firmware_invalid = true;
        self.last_error = Some(message);
        if let Some(device) = self.session.as_ref().map(|s| s.device.clone()) {
            self.transport.cancel_connection(&device);
            self.excluded_device = Some(device);
        }
        self.clear_session();
        self.resume_scanning();
    }

    fn display_name(&self, id: &DeviceId) -> String {
        self.registry
            .get(id)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn prune_registry(&mut self) {
        let keep = match (&self.session, &self.state) {
            (Some(s), _) => Some(s.device.clone()),
            (None, ConnectionState::Connecting { target, .. }) => Some(target.clone()),
            _ => None,
        };
        let removed = self.registry.prune_stale(Instant::now(), keep.as_ref());
        if removed > 0 {
            debug!("Pruned {} stale devices", removed);
        }
    }

    // ---------------------------------------------------------------------
    // Transport events
    // ---------------------------------------------------------------------

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PowerStateChanged { powered_on } => self.on_power_state(powered_on),
            TransportEvent::Discovered(adv) => self.on_discovered(adv),
            TransportEvent::Connected(id) => self.on_connected(id),
            TransportEvent::ConnectFailed { id, error } => self.on_connect_failed(id, error),
            TransportEvent::Disconnected { id, error } => self.on_disconnected(id, error),
            TransportEvent::ServicesDiscovered {
                id,
                services,
                error,
            } => self.on_services(id, services, error),
            TransportEvent::CharacteristicsDiscovered {
                id,
                characteristics,
                error,
            } => self.on_characteristics(id, characteristics, error),
            TransportEvent::ValueUpdated {
                id,
                characteristic,
                result,
            } => self.on_value(id, characteristic, result),
        }
    }

    fn is_current_device(&self, id: &DeviceId) -> bool {
        self.session.as_ref().map(|s| &s.device) == Some(id)
    }

    fn on_power_state(&mut self, powered_on: bool) {
        if powered_on {
            info!("Radio powered on");
            if self.session.is_none() && !self.state.is_connecting() {
                let _ = self.start_scanning();
            }
        } else {
            info!("Radio powered off");
            self.clear_session();
            self.state = ConnectionState::Idle;
        }
    }

    fn on_discovered(&mut self, adv: Advertisement) {
        self.registry
            .observe(&adv.id, &adv.name, adv.rssi, Instant::now());

        let idle = self.session.is_none()
            && matches!(self.state, ConnectionState::Idle | ConnectionState::Scanning);
        let preferred = self.preferred_device.as_ref() == Some(&adv.id);
        let excluded = self.excluded_device.as_ref() == Some(&adv.id);
        if idle
            && preferred
            && !excluded
            && self.retry_runs < self.settings.auto_reconnect_max_runs
        {
            info!(
                "Preferred radio {} discovered, reconnecting",
                escape_log(&adv.name)
            );
            self.begin_connect(adv.id);
        }
    }

    fn on_connected(&mut self, id: DeviceId) {
        match &self.state {
            ConnectionState::Connecting { target, .. } if *target == id => {}
            _ => {
                warn!("Unexpected connect from {}; cancelling", id);
                if !self.is_current_device(&id) {
                    self.transport.cancel_connection(&id);
                }
                return;
            }
        }
        self.connect_timer.cancel();

        let name = match self.registry.get(&id) {
            Some(device) => device.name.clone(),
            None => {
                self.last_error = Some("Bluetooth connection error, please try again.".to_string());
                warn!("Connected device {} is not in the registry", id);
                self.transport.cancel_connection(&id);
                self.clear_session();
                self.resume_scanning();
                return;
            }
        };

        info!("Connected to {} ({})", escape_log(&name), id);
        if self.preferred_device.is_none() {
            self.preferred_device = Some(id.clone());
        }
        self.last_error = None;
        self.session = Some(ActiveSession::new(id.clone(), name));
        self.state = ConnectionState::DiscoveringServices;
        self.transport.discover_services(&id, &[MESH_SERVICE_UUID]);
    }

    fn on_connect_failed(&mut self, id: DeviceId, error: Option<TransportError>) {
        let attempting = matches!(&self.state, ConnectionState::Connecting { target, .. } if *target == id);
        if !attempting {
            return;
        }
        let name = self.display_name(&id);
        self.last_error = Some(match error {
            Some(e) => e.description,
            None => format!("Failed to connect to {}", name),
        });
        warn!("Connection to {} failed", escape_log(&name));
        self.clear_session();
        self.resume_scanning();
    }

    fn on_disconnected(&mut self, id: DeviceId, error: Option<TransportError>) {
        let attempting = matches!(&self.state, ConnectionState::Connecting { target, .. } if *target == id);
        if !self.is_current_device(&id) && !attempting {
            debug!("Ignoring disconnect from {}", id);
            return;
        }
        let cause = DisconnectCause::classify(error.as_ref());
        info!("Disconnected from {}: {:?}", id, cause);
        if let Some(message) = cause.guidance() {
            self.last_error = Some(message);
        }
        self.clear_session();
        if cause == DisconnectCause::UserInitiated {
            self.state = ConnectionState::Idle;
        } else {
            self.resume_scanning();
        }
    }

    fn on_services(&mut self, id: DeviceId, services: Vec<uuid::Uuid>, error: Option<TransportError>) {
        if !self.is_current_device(&id) {
            return;
        }
        if let Some(e) = error {
            warn!("Service discovery failed on {}: {}", id, e);
            self.last_error = Some(e.description);
            return;
        }
        if services.contains(&MESH_SERVICE_UUID) {
            self.transport.discover_characteristics(&id, MESH_SERVICE_UUID);
        } else {
            self.reject_device(MeshError::HandshakeRejected(
                "Meshtastic service not found".to_string(),
            ));
        }
    }

    fn on_characteristics(
        &mut self,
        id: DeviceId,
        characteristics: Vec<uuid::Uuid>,
        error: Option<TransportError>,
    ) {
        if !self.is_current_device(&id) {
            return;
        }
        if let Some(e) = error {
            warn!("Characteristic discovery failed on {}: {}", id, e);
            self.last_error = Some(e.description);
            return;
        }
        let found: Vec<Characteristic> = characteristics
            .iter()
            .filter_map(Characteristic::from_uuid)
            .collect();
        for ch in &found {
            if let Some(session) = self.session.as_mut() {
                session.mark_characteristic(*ch);
            }
            match ch {
                Characteristic::FromRadio => self.transport.read(&id, Characteristic::FromRadio),
                Characteristic::FromNum => {
                    self.transport.set_notify(&id, Characteristic::FromNum, true)
                }
                Characteristic::ToRadio => {}
            }
        }

        let missing = match &self.session {
            Some(s) => {
                let mut missing = Vec::new();
                if !s.has_to_radio {
                    missing.push("ToRadio");
                }
                if !s.has_from_radio {
                    missing.push("FromRadio");
                }
                if !s.has_from_num {
                    missing.push("FromNum");
                }
                missing
            }
            None => return,
        };
        if !missing.is_empty() {
            self.reject_device(MeshError::HandshakeRejected(format!(
                "missing {} characteristic",
                missing.join(", ")
            )));
            return;
        }
        self.send_want_config();
    }

    fn send_want_config(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        self.config_nonce = self.config_nonce.wrapping_add(1).max(1);
        let nonce = self.config_nonce;
        session.handshake_nonce = Some(nonce);
        session.config_complete = false;
        let device = session.device.clone();
        info!("Requesting config from {} (nonce {})", device, nonce);
        if let Err(e) = self.transport.write(
            &device,
            Characteristic::ToRadio,
            &codec::encode_want_config(nonce),
        ) {
            warn!("want_config write failed: {}", e);
            self.last_error = Some(e.description);
            self.transport.cancel_connection(&device);
            self.clear_session();
            self.resume_scanning();
            return;
        }
        self.transport.read(&device, Characteristic::FromRadio);
        self.state = ConnectionState::AwaitingHandshake { nonce };
    }

    fn on_value(
        &mut self,
        id: DeviceId,
        characteristic: Characteristic,
        result: Result<Vec<u8>, TransportError>,
    ) {
        if !self.is_current_device(&id) {
            return;
        }
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                if matches!(
                    e.code,
                    Some(ATT_INSUFFICIENT_AUTHENTICATION) | Some(ATT_INSUFFICIENT_ENCRYPTION)
                ) {
                    self.last_error = Some(format!(
                        "BLE {} Please try connecting again and check the PIN carefully.",
                        e.description
                    ));
                    warn!("Pairing error on {}: {}", id, e);
                    self.transport.cancel_connection(&id);
                    self.clear_session();
                    self.resume_scanning();
                } else {
                    warn!("Read of {:?} on {} failed: {}", characteristic, id, e);
                }
                return;
            }
        };

        match characteristic {
            Characteristic::FromNum => self.transport.read(&id, Characteristic::FromRadio),
            Characteristic::FromRadio => self.on_from_radio(&id, &bytes),
            Characteristic::ToRadio => {}
        }
    }

    fn on_from_radio(&mut self, id: &DeviceId, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        log::trace!("FromRadio {} bytes: {}", bytes.len(), hex_snippet(bytes, 64));
        let inbound = match codec::decode_from_radio(bytes) {
            Ok(inbound) => inbound,
            Err(e) => {
                metrics::inc_decode_failures();
                warn!(
                    "Dropping undecodable FromRadio ({} bytes, {}): {}",
                    bytes.len(),
                    hex_snippet(bytes, 16),
                    e
                );
                self.continue_drain(id);
                return;
            }
        };

        let ttl = self.settings.admin_request_ttl;
        let minimum = self.settings.minimum_firmware;
        let firmware_invalid = self.firmware_invalid;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let expired = session.pending.sweep_expired(Instant::now(), ttl);
        if !expired.is_empty() {
            metrics::add_admin_expired(expired.len() as u64);
            for request in &expired {
                debug!("Admin request {} ({}) expired", request.id, request.description);
            }
        }

        let outcome = {
            let mut ctx = DispatchContext {
                session,
                store: self.store.as_mut(),
                minimum_firmware: &minimum,
                firmware_invalid,
            };
            dispatch(&mut ctx, inbound)
        };

        if let Some(node_num) = outcome.node_num {
            self.registry.set_node_num(id, node_num);
            if self.preferred_device.as_ref() == Some(id) {
                self.preferred_node_num = node_num;
            }
        }
        for (request, resolution) in &outcome.resolved {
            debug!(
                "Admin request {} ({}) resolved: {:?}",
                request.id, request.description, resolution
            );
        }
        if outcome.trace_route.is_some() {
            self.last_trace_route = outcome.trace_route;
        }
        if let Some(err) = outcome.firmware_rejected {
            self.reject_device(err);
            return;
        }
        if outcome.fetch_canned_messages {
            if let Err(e) = self.send_admin(AdminRequest::GetCannedMessages, None) {
                warn!("Canned message request failed: {}", e);
            }
        }
        if outcome.config_complete {
            self.on_subscribed();
        }
        self.continue_drain(id);
    }

    /// Read FromRadio again; an empty value ends the drain.
    fn continue_drain(&mut self, id: &DeviceId) {
        if self.session.is_some() {
            self.transport.read(id, Characteristic::FromRadio);
        }
    }

    fn on_subscribed(&mut self) {
        let Some(device) = self.session.as_ref().map(|s| s.device.clone()) else {
            return;
        };
        metrics::inc_handshakes_completed();
        self.state = ConnectionState::Subscribed;
        self.last_error = None;
        self.retry_runs = 0;
        self.firmware_invalid = false;
        self.registry.retain_only(&device);
        info!("Subscribed to {}", device);
        if self.provide_location {
            self.arm_position_timer();
        }
    }

    // ---------------------------------------------------------------------
    // Location reporting
    // ---------------------------------------------------------------------

    fn arm_position_timer(&mut self) {
        debug!(
            "Position reports every {}s",
            self.location_interval.as_secs()
        );
        self.position_timer.arm(
            self.location_interval,
            self.event_tx.clone(),
            |generation| ManagerEvent::PositionTick { generation },
        );
    }

    pub fn set_location_sharing(&mut self, enabled: bool, interval: Option<Duration>) {
        self.provide_location = enabled;
        if let Some(interval) = interval.filter(|i| !i.is_zero()) {
            self.location_interval = interval;
        }
        if enabled && self.state == ConnectionState::Subscribed {
            self.arm_position_timer();
        } else {
            self.position_timer.cancel();
        }
    }

    fn on_position_tick(&mut self, generation: u64) {
        if !self.position_timer.is_current(generation) {
            return;
        }
        if self.state != ConnectionState::Subscribed || !self.provide_location {
            self.position_timer.cancel();
            return;
        }
        match self.send_position(BROADCAST_NUM, false) {
            Ok(id) => debug!("Sent position report {}", id),
            Err(e) => info!("Position report skipped: {}", e),
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// The session, if a link is up and ToRadio is writable.
    fn writable_session(&self) -> MeshResult<&ActiveSession> {
        match &self.session {
            Some(s)
                if self.state.has_link()
                    && s.can_write()
                    && self.transport.is_connected(&s.device) =>
            {
                Ok(s)
            }
            _ => Err(MeshError::NotConnected),
        }
    }

    fn write_packet(&mut self, device: &DeviceId, packet: OutboundPacket) -> MeshResult<u32> {
        let id = packet.id;
        let bytes = packet.encode();
        self.transport
            .write(device, Characteristic::ToRadio, &bytes)?;
        Ok(id)
    }

    fn record_outgoing(
        &mut self,
        kind: PacketKind,
        packet: OutboundPacket,
        connected_node: u32,
    ) -> MeshResult<()> {
        self.store.record_packet(PacketRecord {
            direction: Direction::Outgoing,
            kind,
            connected_node,
            packet: packet.into_mesh_packet(),
        })?;
        Ok(())
    }

    /// Send and record an application packet on the writable session.
    fn send_recorded(&mut self, kind: PacketKind, packet: OutboundPacket) -> MeshResult<u32> {
        let (device, node_num) = {
            let s = self.writable_session()?;
            (s.device.clone(), s.node_num)
        };
        let id = self.write_packet(&device, packet.clone())?;
        if let Err(e) = self.record_outgoing(kind, packet, node_num) {
            metrics::inc_persistence_failures();
            warn!("Outgoing {:?} {} sent but not recorded: {}", kind, id, e);
        }
        Ok(id)
    }

    pub fn send_text(
        &mut self,
        text: &str,
        to: Option<u32>,
        channel: u32,
        is_emoji: bool,
        reply_id: Option<u32>,
    ) -> MeshResult<u32> {
        let from = match self.writable_session() {
            Ok(s) => s.node_num,
            Err(e) => {
                info!("Text not sent: no radio connected; reconnecting");
                self.recover_connection();
                return Err(e);
            }
        };
        let packet = codec::text_packet(text, to, from, channel, is_emoji, reply_id)?;
        let id = self.send_recorded(PacketKind::Text, packet)?;
        debug!("Sent text {} ({} bytes)", id, text.len());
        Ok(id)
    }

    pub fn send_position(&mut self, dest: u32, want_response: bool) -> MeshResult<u32> {
        let (node_num, flags) = {
            let s = self.writable_session()?;
            (s.node_num, s.position_flags)
        };
        if node_num == 0 {
            return Err(MeshError::NoLocationFix);
        }
        let fix = self
            .location
            .current_fix()
            .ok_or(MeshError::NoLocationFix)?;
        self.send_recorded(
            PacketKind::Position,
            position_packet(&fix, &flags, dest, want_response),
        )
    }

    pub fn send_waypoint(&mut self, dest: u32, name: &str, description: &str) -> MeshResult<u32> {
        let node_num = self.writable_session()?.node_num;
        let fix = self
            .location
            .current_fix()
            .ok_or(MeshError::NoLocationFix)?;
        let waypoint = waypoint_from_fix(&fix, name, description);
        self.send_recorded(
            PacketKind::Waypoint,
            waypoint_packet(&waypoint, dest, node_num),
        )
    }

    pub fn send_trace_route(&mut self, dest: u32, want_response: bool) -> MeshResult<u32> {
        let node_num = self.writable_session()?.node_num;
        let id = self.send_recorded(
            PacketKind::TraceRoute,
            codec::trace_route_packet(dest, node_num, want_response),
        )?;
        info!("Sent trace route request {} to {}", id, dest);
        Ok(id)
    }

    /// Correlated admin send: rejected without writing unless a session is connected.
    pub fn send_admin(&mut self, request: AdminRequest, to: Option<u32>) -> MeshResult<u32> {
        let (device, node_num) = {
            let s = self.writable_session()?;
            (s.device.clone(), s.node_num)
        };
        let to = to.unwrap_or(node_num);
        let description = request.description();
        let read_back = matches!(request, AdminRequest::GetDeviceMetadata);
        let want_response = request.wants_response();
        let packet = codec::admin_packet(&request.into_message(), to, want_response);
        let pending = PendingAdminRequest {
            id: packet.id,
            description,
            from_node: node_num,
            to_node: to,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_admin_request(&pending) {
            metrics::inc_persistence_failures();
            warn!("Failed to persist admin request {}: {}", pending.id, e);
        }
        let id = self.write_packet(&device, packet)?;
        metrics::inc_admin_sent();
        info!("Admin request {}: {}", id, pending.description);
        if let Some(session) = self.session.as_mut() {
            session.pending.insert(pending, Instant::now());
        }
        if read_back {
            self.transport.read(&device, Characteristic::FromRadio);
        }
        Ok(id)
    }

    pub fn request_device_metadata(&mut self) -> MeshResult<u32> {
        self.send_admin(AdminRequest::GetDeviceMetadata, None)
    }

    /// Apply a shared channel URL: one `set_channel` per entry, then the LoRa config.
    pub fn save_channel_set(&mut self, url: &str) -> MeshResult<Vec<u32>> {
        self.writable_session()?;
        let set = decode_channel_url(url)?;
        let mut ids = Vec::with_capacity(set.settings.len() + 1);
        for (index, settings) in set.settings.into_iter().enumerate() {
            let role = if index == 0 {
                proto::channel::Role::Primary
            } else {
                proto::channel::Role::Secondary
            };
            let channel = proto::Channel {
                index: index as i32,
                settings: Some(settings),
                role: role as i32,
            };
            ids.push(self.send_admin(AdminRequest::SetChannel(channel), None)?);
        }
        if let Some(lora) = set.lora_config {
            let config = proto::Config {
                payload_variant: Some(proto::config::PayloadVariant::Lora(lora)),
            };
            ids.push(self.send_admin(AdminRequest::SetConfig(config), None)?);
        }
        Ok(ids)
    }

    fn teardown(&mut self) {
        if let Some(device) = self.session.as_ref().map(|s| s.device.clone()) {
            self.transport.cancel_connection(&device);
        }
        if self.transport.is_scanning() {
            self.transport.stop_scan();
        }
        self.clear_session();
        self.state = ConnectionState::Idle;
    }
}
