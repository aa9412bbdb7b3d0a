//! Inbound dispatch.
//!
//! Every decoded `FromRadio` passes through [`dispatch`] exactly once. Handshake snapshots
//! (my_info, node info, channels, configs) update the session and the store; mesh packets
//! are routed by [`PortKind`]. A failure while handling one packet is logged and counted,
//! never propagated, so the read loop keeps draining.

use log::{debug, info, warn};

use super::codec::{self, Inbound, BROADCAST_NUM};
use super::correlator::{PendingAdminRequest, Resolution};
use super::error::MeshError;
use super::flags::PositionFlags;
use super::session::ActiveSession;
use super::store::{Direction, MeshStore, PacketKind, PacketRecord, StoreError};
use super::version::{strip_build_suffix, FirmwareVersion};
use crate::logutil::{escape_log, truncate_for_log};
use crate::metrics;
use crate::protobuf as proto;
use proto::mesh_packet::PayloadVariant as PacketVariant;
use proto::PortNum;

/// Closed set of application ports the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Port 0; also the lane for handshake snapshots.
    Control,
    TextMessage,
    Position,
    NodeInfo,
    Routing,
    Admin,
    Telemetry,
    TraceRoute,
    Waypoint,
    /// A known port the core does not act on.
    Unhandled(PortNum),
    /// A value outside the port enumeration.
    Unrecognized(i32),
}

impl PortKind {
    pub fn from_raw(raw: i32) -> Self {
        match PortNum::try_from(raw) {
            Ok(PortNum::UnknownApp) => PortKind::Control,
            Ok(PortNum::TextMessageApp) => PortKind::TextMessage,
            Ok(PortNum::PositionApp) => PortKind::Position,
            Ok(PortNum::NodeinfoApp) => PortKind::NodeInfo,
            Ok(PortNum::RoutingApp) => PortKind::Routing,
            Ok(PortNum::AdminApp) => PortKind::Admin,
            Ok(PortNum::TelemetryApp) => PortKind::Telemetry,
            Ok(PortNum::TracerouteApp) => PortKind::TraceRoute,
            Ok(PortNum::WaypointApp) => PortKind::Waypoint,
            Ok(other) => PortKind::Unhandled(other),
            Err(_) => PortKind::Unrecognized(raw),
        }
    }
}

/// Inputs that do not belong to the session itself.
pub struct DispatchContext<'a> {
    pub session: &'a mut ActiveSession,
    pub store: &'a mut dyn MeshStore,
    pub minimum_firmware: &'a FirmwareVersion,
    /// Set once the firmware has been judged unsupported for this session.
    pub firmware_invalid: bool,
}

/// What the manager must act on after a dispatch.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Node number reported by `my_info`.
    pub node_num: Option<u32>,
    pub firmware_rejected: Option<MeshError>,
    /// `config_complete_id` matched the handshake nonce.
    pub config_complete: bool,
    pub fetch_canned_messages: bool,
    pub trace_route: Option<String>,
    pub resolved: Vec<(PendingAdminRequest, Resolution)>,
}

/// Human-readable route of a trace-route reply: `to --> hop --> ... --> from`.
pub fn format_trace_route(to: u32, from: u32, route: &[u32]) -> String {
    if route.is_empty() {
        return format!("Trace Route request sent to {} was received directly", from);
    }
    let mut hops = Vec::with_capacity(route.len() + 2);
    hops.push(to.to_string());
    hops.extend(route.iter().map(|n| n.to_string()));
    hops.push(from.to_string());
    format!("Trace Route request returned: {}", hops.join(" --> "))
}

fn persist(result: Result<(), StoreError>, what: &str) {
    if let Err(e) = result {
        metrics::inc_persistence_failures();
        warn!("Failed to persist {}: {}", what, e);
    }
}

pub fn dispatch(ctx: &mut DispatchContext<'_>, inbound: Inbound) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    metrics::inc_packets_dispatched();
    match inbound {
        Inbound::MyInfo(info) => handle_my_info(ctx, info, &mut outcome),
        Inbound::ConfigComplete(id) => {
            if id != 0 && ctx.session.handshake_nonce == Some(id) {
                info!("Config complete for nonce {}", id);
                ctx.session.config_complete = true;
                outcome.config_complete = true;
            } else {
                warn!(
                    "Ignoring config_complete_id {} (expected {:?})",
                    id, ctx.session.handshake_nonce
                );
            }
        }
        Inbound::Rebooted => info!("Radio {} reported a reboot", ctx.session.device),
        Inbound::Empty => {}
        Inbound::NodeInfo(_)
        | Inbound::Channel(_)
        | Inbound::Config(_)
        | Inbound::ModuleConfig(_)
        | Inbound::Metadata(_)
            if ctx.firmware_invalid =>
        {
            debug!("Skipping handshake snapshot: firmware unsupported");
        }
        Inbound::NodeInfo(node) => {
            if node.num == ctx.session.node_num {
                if let Some(user) = node.user.as_ref() {
                    ctx.session.long_name = Some(user.long_name.clone());
                    ctx.session.short_name = Some(user.short_name.clone());
                }
            }
            persist(ctx.store.upsert_node_info(&node), "node info");
        }
        Inbound::Channel(channel) => {
            debug!("Channel {} snapshot (role {})", channel.index, channel.role);
            persist(
                ctx.store.upsert_channel(ctx.session.node_num, &channel),
                "channel",
            );
        }
        Inbound::Config(config) => {
            if let Some(proto::config::PayloadVariant::Position(ref pc)) = config.payload_variant {
                ctx.session.position_flags = PositionFlags::from_bits(pc.position_flags);
            }
            debug!("{} config snapshot", codec::config_kind(&config));
            persist(
                ctx.store.upsert_config(ctx.session.node_num, &config),
                "config",
            );
        }
        Inbound::ModuleConfig(module) => {
            if let Some(proto::module_config::PayloadVariant::CannedMessage(ref cm)) =
                module.payload_variant
            {
                outcome.fetch_canned_messages = cm.enabled;
            }
            debug!("{} module config snapshot", codec::module_config_kind(&module));
            persist(
                ctx.store.upsert_module_config(ctx.session.node_num, &module),
                "module config",
            );
        }
        Inbound::Metadata(metadata) => persist(
            ctx.store.upsert_metadata(ctx.session.node_num, &metadata),
            "device metadata",
        ),
        Inbound::Packet(packet) => handle_packet(ctx, packet, &mut outcome),
    }
    outcome
}

fn handle_my_info(
    ctx: &mut DispatchContext<'_>,
    info: proto::MyNodeInfo,
    outcome: &mut DispatchOutcome,
) {
    let version = strip_build_suffix(&info.firmware_version).to_string();
    ctx.session.node_num = info.my_node_num;
    ctx.session.firmware_version = Some(version.clone());
    outcome.node_num = Some(info.my_node_num);
    info!(
        "Radio {} is node {} running firmware {}",
        ctx.session.device,
        info.my_node_num,
        escape_log(&version)
    );

    match FirmwareVersion::parse(&version) {
        Some(v) if v.is_at_least(ctx.minimum_firmware) => {}
        _ => {
            outcome.firmware_rejected = Some(MeshError::FirmwareTooOld {
                found: version.clone(),
                minimum: ctx.minimum_firmware.to_string(),
            });
            return;
        }
    }

    persist(
        ctx.store
            .upsert_node_identity(&ctx.session.device, &ctx.session.name, &info),
        "node identity",
    );
    // Older app versions stored a placeholder user for the broadcast address.
    persist(ctx.store.delete_user(BROADCAST_NUM), "broadcast user cleanup");
}

fn record(ctx: &mut DispatchContext<'_>, kind: PacketKind, packet: &proto::MeshPacket) {
    persist(
        ctx.store.record_packet(PacketRecord {
            direction: Direction::Incoming,
            kind,
            connected_node: ctx.session.node_num,
            packet: packet.clone(),
        }),
        "packet",
    );
}

fn handle_packet(
    ctx: &mut DispatchContext<'_>,
    packet: proto::MeshPacket,
    outcome: &mut DispatchOutcome,
) {
    let data = match packet.payload_variant {
        Some(PacketVariant::Decoded(ref data)) => data.clone(),
        Some(PacketVariant::Encrypted(_)) => {
            debug!(
                "Encrypted packet id={} from=0x{:08x} not decoded by radio",
                packet.id, packet.from
            );
            metrics::inc_packets_unhandled();
            return;
        }
        None => return,
    };

    match PortKind::from_raw(data.portnum) {
        PortKind::Control => debug!("Control packet id={} with no payload handler", packet.id),
        PortKind::TextMessage => {
            debug!(
                "Text from 0x{:08x}: {}",
                packet.from,
                truncate_for_log(&String::from_utf8_lossy(&data.payload), 120)
            );
            record(ctx, PacketKind::Text, &packet);
        }
        PortKind::Position => record(ctx, PacketKind::Position, &packet),
        PortKind::Waypoint => record(ctx, PacketKind::Waypoint, &packet),
        PortKind::NodeInfo | PortKind::Routing | PortKind::Telemetry if ctx.firmware_invalid => {
            debug!("Dropping packet id={}: firmware unsupported", packet.id);
        }
        PortKind::NodeInfo => record(ctx, PacketKind::NodeInfo, &packet),
        PortKind::Telemetry => record(ctx, PacketKind::Telemetry, &packet),
        PortKind::Routing => {
            handle_routing(ctx, &data, outcome);
            record(ctx, PacketKind::Routing, &packet);
        }
        PortKind::Admin => {
            handle_admin(ctx, &data, outcome);
            record(ctx, PacketKind::Admin, &packet);
        }
        PortKind::TraceRoute => {
            match codec::decode_payload::<proto::RouteDiscovery>(&data) {
                Ok(route) => {
                    let line = format_trace_route(packet.to, packet.from, &route.route);
                    info!("{}", line);
                    outcome.trace_route = Some(line);
                }
                Err(e) => {
                    metrics::inc_decode_failures();
                    warn!("Bad trace route payload in packet {}: {}", packet.id, e);
                }
            }
            record(ctx, PacketKind::TraceRoute, &packet);
        }
        PortKind::Unhandled(port) => {
            metrics::inc_packets_unhandled();
            info!("Unhandled packet on port {:?} from 0x{:08x}", port, packet.from);
        }
        PortKind::Unrecognized(raw) => {
            metrics::inc_packets_unhandled();
            info!("Unhandled packet on unknown port {} from 0x{:08x}", raw, packet.from);
        }
    }
}

fn resolve(
    ctx: &mut DispatchContext<'_>,
    id: u32,
    resolution: Resolution,
    outcome: &mut DispatchOutcome,
) {
    if id == 0 {
        return;
    }
    if let Some(request) = ctx.session.pending.resolve(id) {
        metrics::inc_admin_resolved();
        debug!("Admin request {} ({}) -> {:?}", id, request.description, resolution);
        persist(
            ctx.store.resolve_admin_request(id, resolution),
            "admin request resolution",
        );
        outcome.resolved.push((request, resolution));
    }
}

fn handle_routing(ctx: &mut DispatchContext<'_>, data: &proto::Data, outcome: &mut DispatchOutcome) {
    use proto::routing::{Error as RoutingError, Variant};
    let routing = match codec::decode_payload::<proto::Routing>(data) {
        Ok(r) => r,
        Err(e) => {
            metrics::inc_decode_failures();
            warn!("Bad routing payload: {}", e);
            return;
        }
    };
    if let Some(Variant::ErrorReason(code)) = routing.variant {
        let resolution = match RoutingError::try_from(code) {
            Ok(RoutingError::None) => Resolution::Acked,
            _ => Resolution::Failed(code),
        };
        resolve(ctx, data.request_id, resolution, outcome);
    }
}

fn handle_admin(ctx: &mut DispatchContext<'_>, data: &proto::Data, outcome: &mut DispatchOutcome) {
    use proto::admin_message::PayloadVariant as Admin;
    let admin = match codec::decode_payload::<proto::AdminMessage>(data) {
        Ok(a) => a,
        Err(e) => {
            metrics::inc_decode_failures();
            warn!("Bad admin payload: {}", e);
            return;
        }
    };
    resolve(ctx, data.request_id, Resolution::Replied, outcome);

    let node = ctx.session.node_num;
    match admin.payload_variant {
        Some(Admin::GetChannelResponse(channel)) => {
            persist(ctx.store.upsert_channel(node, &channel), "channel")
        }
        Some(Admin::GetConfigResponse(config)) => {
            persist(ctx.store.upsert_config(node, &config), "config")
        }
        Some(Admin::GetModuleConfigResponse(module)) => persist(
            ctx.store.upsert_module_config(node, &module),
            "module config",
        ),
        Some(Admin::GetDeviceMetadataResponse(metadata)) => persist(
            ctx.store.upsert_metadata(node, &metadata),
            "device metadata",
        ),
        Some(Admin::GetOwnerResponse(user)) => {
            ctx.session.long_name = Some(user.long_name);
            ctx.session.short_name = Some(user.short_name);
        }
        Some(Admin::GetCannedMessageModuleMessagesResponse(messages)) => {
            info!("Canned messages: {}", truncate_for_log(&messages, 200));
        }
        Some(other) => debug!("Admin message not acted on: {:?}", other),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::store::MemoryStore;
    use crate::meshtastic::transport::DeviceId;
    use bytes::Bytes;
    use chrono::Utc;
    use prost::Message;
    use tokio::time::Instant;

    fn session() -> ActiveSession {
        let mut s = ActiveSession::new(DeviceId::from("dev"), "Radio".into());
        s.node_num = 200;
        s
    }

    fn data_packet(port: PortNum, payload: Vec<u8>, from: u32, to: u32) -> proto::MeshPacket {
        proto::MeshPacket {
            from,
            to,
            id: 4242,
            payload_variant: Some(PacketVariant::Decoded(proto::Data {
                portnum: port as i32,
                payload: Bytes::from(payload),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    #[test]
    fn trace_route_formats() {
        assert_eq!(
            format_trace_route(100, 200, &[5, 9]),
            "Trace Route request returned: 100 --> 5 --> 9 --> 200"
        );
        assert!(format_trace_route(100, 200, &[]).contains("received directly"));
    }

    #[test]
    fn port_kinds_are_closed() {
        assert_eq!(PortKind::from_raw(1), PortKind::TextMessage);
        assert_eq!(PortKind::from_raw(70), PortKind::TraceRoute);
        assert_eq!(PortKind::from_raw(66), PortKind::Unhandled(PortNum::RangeTestApp));
        assert_eq!(PortKind::from_raw(9999), PortKind::Unrecognized(9999));
    }

    #[test]
    fn trace_route_packet_dispatch() {
        let mut session = session();
        let mut store = MemoryStore::default();
        let min = FirmwareVersion::new(1, 3, 48);
        let mut ctx = DispatchContext {
            session: &mut session,
            store: &mut store,
            minimum_firmware: &min,
            firmware_invalid: false,
        };
        let payload = proto::RouteDiscovery { route: vec![5, 9] }.encode_to_vec();
        let out = dispatch(
            &mut ctx,
            Inbound::Packet(data_packet(PortNum::TracerouteApp, payload, 200, 100)),
        );
        assert_eq!(
            out.trace_route.as_deref(),
            Some("Trace Route request returned: 100 --> 5 --> 9 --> 200")
        );
    }

    #[test]
    fn my_info_gates_firmware_and_cleans_broadcast_user() {
        let min = FirmwareVersion::new(1, 3, 48);
        for (version, rejected) in [("1.3.47.abc", true), ("1.3.48.abc", false), ("1.3.50", false)] {
            let mut session = session();
            let mut store = MemoryStore::default();
            let mut ctx = DispatchContext {
                session: &mut session,
                store: &mut store,
                minimum_firmware: &min,
                firmware_invalid: false,
            };
            let out = dispatch(
                &mut ctx,
                Inbound::MyInfo(proto::MyNodeInfo {
                    my_node_num: 0x1234,
                    firmware_version: version.to_string(),
                    ..Default::default()
                }),
            );
            assert_eq!(out.node_num, Some(0x1234));
            assert_eq!(
                matches!(out.firmware_rejected, Some(MeshError::FirmwareTooOld { .. })),
                rejected,
                "version {}",
                version
            );
            let deleted = store.snapshot().deleted_users;
            assert_eq!(deleted.is_empty(), rejected);
        }
    }

    #[test]
    fn config_complete_requires_matching_nonce() {
        let min = FirmwareVersion::new(1, 3, 48);
        let mut session = session();
        session.handshake_nonce = Some(3);
        let mut store = MemoryStore::default();
        let mut ctx = DispatchContext {
            session: &mut session,
            store: &mut store,
            minimum_firmware: &min,
            firmware_invalid: false,
        };
        assert!(!dispatch(&mut ctx, Inbound::ConfigComplete(2)).config_complete);
        assert!(!dispatch(&mut ctx, Inbound::ConfigComplete(0)).config_complete);
        assert!(dispatch(&mut ctx, Inbound::ConfigComplete(3)).config_complete);
        assert!(session.config_complete);
    }

    #[test]
    fn routing_ack_resolves_pending_admin_request() {
        let min = FirmwareVersion::new(1, 3, 48);
        let mut session = session();
        session.pending.insert(
            PendingAdminRequest {
                id: 777,
                description: "Reboot in 10s".into(),
                from_node: 0,
                to_node: 200,
                created_at: Utc::now(),
            },
            Instant::now(),
        );
        let mut store = MemoryStore::default();
        let mut ctx = DispatchContext {
            session: &mut session,
            store: &mut store,
            minimum_firmware: &min,
            firmware_invalid: false,
        };
        let routing = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(0)),
        };
        let mut pkt = data_packet(PortNum::RoutingApp, routing.encode_to_vec(), 200, 200);
        if let Some(PacketVariant::Decoded(ref mut d)) = pkt.payload_variant {
            d.request_id = 777;
        }
        let out = dispatch(&mut ctx, Inbound::Packet(pkt));
        assert_eq!(out.resolved.len(), 1);
        assert_eq!(out.resolved[0].1, Resolution::Acked);
        assert!(session.pending.is_empty());
        let snap = store.snapshot();
        assert_eq!(snap.resolutions, vec![(777, Resolution::Acked)]);
        assert_eq!(snap.packets[0].connected_node, 200);
    }

    #[test]
    fn routing_error_counts_as_resolved() {
        let min = FirmwareVersion::new(1, 3, 48);
        let mut session = session();
        session.pending.insert(
            PendingAdminRequest {
                id: 778,
                description: "Set owner".into(),
                from_node: 0,
                to_node: 200,
                created_at: Utc::now(),
            },
            Instant::now(),
        );
        let mut store = MemoryStore::default();
        let mut ctx = DispatchContext {
            session: &mut session,
            store: &mut store,
            minimum_firmware: &min,
            firmware_invalid: false,
        };
        let routing = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(
                proto::routing::Error::Timeout as i32,
            )),
        };
        let mut pkt = data_packet(PortNum::RoutingApp, routing.encode_to_vec(), 200, 200);
        if let Some(PacketVariant::Decoded(ref mut d)) = pkt.payload_variant {
            d.request_id = 778;
        }
        let before = metrics::snapshot().admin_resolved;
        let out = dispatch(&mut ctx, Inbound::Packet(pkt));
        assert!(matches!(out.resolved[0].1, Resolution::Failed(_)));
        assert!(metrics::snapshot().admin_resolved >= before + 1);
    }

    #[test]
    fn invalid_firmware_short_circuits_snapshots_and_telemetry() {
        let min = FirmwareVersion::new(1, 3, 48);
        let mut session = session();
        let mut store = MemoryStore::default();
        let mut ctx = DispatchContext {
            session: &mut session,
            store: &mut store,
            minimum_firmware: &min,
            firmware_invalid: true,
        };
        dispatch(
            &mut ctx,
            Inbound::Channel(proto::Channel {
                index: 0,
                ..Default::default()
            }),
        );
        dispatch(
            &mut ctx,
            Inbound::Packet(data_packet(PortNum::TelemetryApp, vec![], 5, 200)),
        );
        dispatch(
            &mut ctx,
            Inbound::Packet(data_packet(PortNum::TextMessageApp, b"hi".to_vec(), 5, 200)),
        );
        let snap = store.snapshot();
        assert!(snap.channels.is_empty());
        assert_eq!(snap.packets.len(), 1);
        assert_eq!(snap.packets[0].kind, PacketKind::Text);
    }

    #[test]
    fn canned_message_module_requests_fetch() {
        let min = FirmwareVersion::new(1, 3, 48);
        let mut session = session();
        let mut store = MemoryStore::default();
        let mut ctx = DispatchContext {
            session: &mut session,
            store: &mut store,
            minimum_firmware: &min,
            firmware_invalid: false,
        };
        let module = proto::ModuleConfig {
            payload_variant: Some(proto::module_config::PayloadVariant::CannedMessage(
                proto::module_config::CannedMessageConfig {
                    enabled: true,
                    ..Default::default()
                },
            )),
        };
        assert!(dispatch(&mut ctx, Inbound::ModuleConfig(module)).fetch_canned_messages);
    }

    #[test]
    fn store_failure_does_not_abort_dispatch() {
        let min = FirmwareVersion::new(1, 3, 48);
        let mut session = session();
        session.handshake_nonce = Some(1);
        let mut store = MemoryStore::default();
        store.set_fail_writes(true);
        let mut ctx = DispatchContext {
            session: &mut session,
            store: &mut store,
            minimum_firmware: &min,
            firmware_invalid: false,
        };
        dispatch(
            &mut ctx,
            Inbound::Config(proto::Config {
                payload_variant: Some(proto::config::PayloadVariant::Position(
                    proto::config::PositionConfig {
                        position_flags: 1 | 256,
                        ..Default::default()
                    },
                )),
            }),
        );
        assert!(dispatch(&mut ctx, Inbound::ConfigComplete(1)).config_complete);
        assert!(session.position_flags.altitude);
        assert!(session.position_flags.speed);
    }
}
