mod common;

use common::{decoded, from_radio, packet, settings, Harness};
use meshlink::meshtastic::codec::encode_channel_url;
use meshlink::meshtastic::{
    AdminRequest, Characteristic, Direction, LocationFix, ManagerEvent, MeshError, PacketKind,
    Resolution, BROADCAST_NUM,
};
use meshlink::protobuf::{self as proto, PortNum};
use prost::Message;

const RADIO: &str = "AA:BB:CC:DD:EE:01";
const NODE: u32 = 0x1234_5678;

fn subscribed() -> Harness {
    let mut h = Harness::new(settings());
    h.subscribe(RADIO, "Meshtastic_5678", NODE, "2.3.2");
    h
}

fn admin_of(packet: &proto::MeshPacket) -> proto::AdminMessage {
    let data = decoded(packet);
    assert_eq!(data.portnum, PortNum::AdminApp as i32);
    proto::AdminMessage::decode(data.payload.as_ref()).unwrap()
}

fn routing_ack(request_id: u32, error: i32) -> proto::FromRadio {
    let routing = proto::Routing {
        variant: Some(proto::routing::Variant::ErrorReason(error)),
    };
    packet(NODE, NODE, PortNum::RoutingApp, routing.encode_to_vec(), request_id)
}

#[tokio::test]
async fn admin_rejected_without_connection() {
    let mut h = Harness::new(settings());
    let result = h.manager.send_admin(AdminRequest::GetOwner, None);
    assert!(matches!(result, Err(MeshError::NotConnected)));
    assert_eq!(h.transport.write_count(), 0);
    assert!(h.store.snapshot().admin_requests.is_empty());
}

#[tokio::test]
async fn admin_request_is_tracked_until_acked() {
    let mut h = subscribed();
    let id = h.manager.send_admin(AdminRequest::GetChannel(1), None).unwrap();

    let sent = h.transport.sent_packets();
    let pkt = sent.last().unwrap();
    assert_eq!(pkt.id, id);
    assert_eq!(pkt.to, NODE);
    assert_eq!(pkt.from, 0);
    assert!(pkt.want_ack);
    assert_eq!(pkt.priority, proto::mesh_packet::Priority::Reliable as i32);
    assert!(decoded(pkt).want_response);
    assert_eq!(
        admin_of(pkt).payload_variant,
        Some(proto::admin_message::PayloadVariant::GetChannelRequest(1))
    );

    let stored = h.store.snapshot().admin_requests;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, id);
    assert_eq!(stored[0].to_node, NODE);
    assert_eq!(
        h.manager.status().session.unwrap().pending_admin_requests,
        1
    );

    h.from_radio(RADIO, routing_ack(id, 0));
    assert_eq!(
        h.manager.status().session.unwrap().pending_admin_requests,
        0
    );
    assert_eq!(h.store.snapshot().resolutions, vec![(id, Resolution::Acked)]);
}

#[tokio::test]
async fn routing_error_marks_request_failed() {
    let mut h = subscribed();
    let id = h
        .manager
        .send_admin(AdminRequest::FactoryReset, None)
        .unwrap();
    h.from_radio(RADIO, routing_ack(id, 3));
    assert_eq!(
        h.store.snapshot().resolutions,
        vec![(id, Resolution::Failed(3))]
    );
}

#[tokio::test]
async fn reboot_and_reset_payloads() {
    let mut h = subscribed();
    h.manager
        .send_admin(AdminRequest::Reboot { seconds: 10 }, None)
        .unwrap();
    h.manager.send_admin(AdminRequest::NodeDbReset, None).unwrap();
    let sent = h.transport.sent_packets();
    use proto::admin_message::PayloadVariant as Admin;
    assert_eq!(
        admin_of(&sent[0]).payload_variant,
        Some(Admin::RebootSeconds(10))
    );
    assert!(!decoded(&sent[0]).want_response);
    assert_eq!(admin_of(&sent[1]).payload_variant, Some(Admin::NodedbReset(1)));
}

#[tokio::test]
async fn metadata_request_reads_back() {
    let mut h = subscribed();
    let reads = h.transport.state().reads.len();
    h.manager.request_device_metadata().unwrap();
    let state = h.transport.state();
    assert_eq!(state.reads.len(), reads + 1);
    assert_eq!(state.reads.last().unwrap().1, Characteristic::FromRadio);
}

#[tokio::test]
async fn text_message_round_trip() {
    let mut h = subscribed();
    let id = h
        .manager
        .send_text("hello mesh", None, 0, false, None)
        .unwrap();

    let sent = h.transport.sent_packets();
    let pkt = sent.last().unwrap();
    assert_eq!(pkt.id, id);
    assert_eq!(pkt.to, BROADCAST_NUM);
    assert_eq!(pkt.from, NODE);
    assert!(pkt.want_ack);
    let data = decoded(pkt);
    assert_eq!(data.portnum, PortNum::TextMessageApp as i32);
    assert_eq!(data.payload.as_ref(), b"hello mesh");

    h.from_radio(
        RADIO,
        packet(0x0bad_cafe, NODE, PortNum::TextMessageApp, b"hi back".to_vec(), 0),
    );

    let packets = h.store.snapshot().packets;
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].direction, Direction::Outgoing);
    assert_eq!(packets[0].kind, PacketKind::Text);
    assert_eq!(packets[0].connected_node, NODE);
    assert_eq!(packets[1].direction, Direction::Incoming);
    assert_eq!(packets[1].packet.from, 0x0bad_cafe);
}

#[tokio::test]
async fn direct_reply_with_emoji() {
    let mut h = subscribed();
    h.manager
        .send_text("👍", Some(0x0bad_cafe), 2, true, Some(77))
        .unwrap();
    let sent = h.transport.sent_packets();
    let pkt = sent.last().unwrap();
    assert_eq!(pkt.to, 0x0bad_cafe);
    assert_eq!(pkt.channel, 2);
    let data = decoded(pkt);
    assert_eq!(data.emoji, 1);
    assert_eq!(data.reply_id, 77);
}

#[tokio::test]
async fn text_without_connection_triggers_recovery() {
    let mut h = Harness::new(settings());
    let result = h.manager.send_text("hello", None, 0, false, None);
    assert!(matches!(result, Err(MeshError::NotConnected)));
    assert_eq!(h.transport.write_count(), 0);
    assert!(h.transport.state().scanning);
}

#[tokio::test]
async fn oversized_or_empty_text_is_refused() {
    let mut h = subscribed();
    let writes = h.transport.write_count();
    assert!(matches!(
        h.manager.send_text("", None, 0, false, None),
        Err(MeshError::EmptyMessage)
    ));
    assert!(matches!(
        h.manager.send_text(&"x".repeat(300), None, 0, false, None),
        Err(MeshError::PayloadTooLarge { .. })
    ));
    assert_eq!(h.transport.write_count(), writes);
}

#[tokio::test]
async fn persistence_failure_does_not_fail_send() {
    let mut h = subscribed();
    h.store.set_fail_writes(true);
    assert!(h.manager.send_text("still sent", None, 0, false, None).is_ok());
    assert!(h.store.snapshot().packets.is_empty());
}

#[tokio::test]
async fn trace_route_reply_is_formatted() {
    let mut h = subscribed();
    let id = h.manager.send_trace_route(200, true).unwrap();
    let sent = h.transport.sent_packets();
    let pkt = sent.last().unwrap();
    assert_eq!(pkt.id, id);
    assert_eq!(decoded(pkt).portnum, PortNum::TracerouteApp as i32);

    let route = proto::RouteDiscovery { route: vec![5, 9] };
    h.from_radio(
        RADIO,
        packet(200, 100, PortNum::TracerouteApp, route.encode_to_vec(), id),
    );
    assert_eq!(
        h.manager.status().last_trace_route.as_deref(),
        Some("Trace Route request returned: 100 --> 5 --> 9 --> 200")
    );
}

#[tokio::test]
async fn channel_url_is_applied_as_admin_writes() {
    let mut h = subscribed();
    let set = proto::ChannelSet {
        settings: vec![
            proto::ChannelSettings {
                name: "LongFast".to_string(),
                ..Default::default()
            },
            proto::ChannelSettings {
                name: "Ops".to_string(),
                ..Default::default()
            },
        ],
        lora_config: Some(proto::config::LoRaConfig {
            region: 1,
            ..Default::default()
        }),
    };
    let url = format!("https://meshtastic.org/e/#{}", encode_channel_url(&set));
    let ids = h.manager.save_channel_set(&url).unwrap();
    assert_eq!(ids.len(), 3);

    use proto::admin_message::PayloadVariant as Admin;
    let sent = h.transport.sent_packets();
    let admins: Vec<_> = sent.iter().map(admin_of).collect();
    match &admins[..] {
        [first, second, lora] => {
            let (c0, c1) = match (&first.payload_variant, &second.payload_variant) {
                (Some(Admin::SetChannel(a)), Some(Admin::SetChannel(b))) => (a, b),
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(c0.index, 0);
            assert_eq!(c0.role, proto::channel::Role::Primary as i32);
            assert_eq!(c1.index, 1);
            assert_eq!(c1.role, proto::channel::Role::Secondary as i32);
            assert!(matches!(
                &lora.payload_variant,
                Some(Admin::SetConfig(proto::Config {
                    payload_variant: Some(proto::config::PayloadVariant::Lora(_))
                }))
            ));
        }
        other => panic!("expected three admin packets, got {}", other.len()),
    }
}

#[tokio::test]
async fn bad_channel_url_sends_nothing() {
    let mut h = subscribed();
    let writes = h.transport.write_count();
    assert!(matches!(
        h.manager.save_channel_set("https://meshtastic.org/e/#!!!"),
        Err(MeshError::InvalidChannelUrl(_))
    ));
    assert_eq!(h.transport.write_count(), writes);
}

#[tokio::test]
async fn canned_message_module_triggers_fetch() {
    let mut h = subscribed();
    let module = proto::ModuleConfig {
        payload_variant: Some(proto::module_config::PayloadVariant::CannedMessage(
            proto::module_config::CannedMessageConfig {
                enabled: true,
                ..Default::default()
            },
        )),
    };
    h.from_radio(
        RADIO,
        from_radio(proto::from_radio::PayloadVariant::ModuleConfig(module)),
    );
    let sent = h.transport.sent_packets();
    assert_eq!(
        admin_of(sent.last().unwrap()).payload_variant,
        Some(proto::admin_message::PayloadVariant::GetCannedMessageModuleMessagesRequest(true))
    );
}

#[tokio::test]
async fn undecodable_from_radio_is_dropped() {
    let mut h = Harness::new(settings());
    h.advertise(RADIO, "Meshtastic_5678");
    h.connect_and_discover(RADIO);
    let reads = h.transport.state().reads.len();
    h.event(meshlink::meshtastic::TransportEvent::ValueUpdated {
        id: meshlink::meshtastic::DeviceId::from(RADIO),
        characteristic: Characteristic::FromRadio,
        result: Ok(vec![0xff, 0xff, 0xff]),
    });
    assert!(h.manager.state().has_link());
    assert_eq!(h.transport.state().reads.len(), reads + 1);
}

#[tokio::test]
async fn from_radio_is_drained_until_empty() {
    let mut h = subscribed();
    let device = meshlink::meshtastic::DeviceId::from(RADIO);
    let reads = h.transport.state().reads.len();

    h.event(meshlink::meshtastic::TransportEvent::ValueUpdated {
        id: device.clone(),
        characteristic: Characteristic::FromNum,
        result: Ok(vec![1, 0, 0, 0]),
    });
    assert_eq!(h.transport.state().reads.len(), reads + 1);

    let text = b"queued".to_vec();
    h.from_radio(RADIO, packet(77, NODE, PortNum::TextMessageApp, text.clone(), 0));
    h.from_radio(RADIO, packet(78, NODE, PortNum::TextMessageApp, text, 0));
    assert_eq!(h.transport.state().reads.len(), reads + 3);
    assert!(h
        .transport
        .state()
        .reads
        .iter()
        .skip(reads)
        .all(|(_, ch)| *ch == Characteristic::FromRadio));

    h.event(meshlink::meshtastic::TransportEvent::ValueUpdated {
        id: device,
        characteristic: Characteristic::FromRadio,
        result: Ok(Vec::new()),
    });
    assert_eq!(h.transport.state().reads.len(), reads + 3);
}

#[tokio::test]
async fn position_requires_a_fix() {
    let mut h = subscribed();
    assert!(matches!(
        h.manager.send_position(BROADCAST_NUM, false),
        Err(MeshError::NoLocationFix)
    ));
}

#[tokio::test(start_paused = true)]
async fn position_reports_on_interval() {
    let mut cfg = settings();
    cfg.provide_location = true;
    let fix = LocationFix {
        altitude: Some(15),
        ..LocationFix::new(47.6062, -122.3321)
    };
    let mut h = Harness::with_location(cfg, Some(fix));
    h.subscribe(RADIO, "Meshtastic_5678", NODE, "2.3.2");
    let before = h.transport.sent_packets().len();

    let event = h.manager.next_event().await.unwrap();
    assert!(matches!(event, ManagerEvent::PositionTick { .. }));
    h.manager.handle_event(event);

    let sent = h.transport.sent_packets();
    assert_eq!(sent.len(), before + 1);
    let pkt = sent.last().unwrap();
    assert_eq!(pkt.to, BROADCAST_NUM);
    assert_eq!(pkt.from, 0);
    let position = proto::Position::decode(decoded(pkt).payload.as_ref()).unwrap();
    assert_eq!(position.latitude_i, 476062000);

    h.manager.set_location_sharing(false, None);
    assert!(h.manager.send_waypoint(BROADCAST_NUM, "Camp", "north gate").is_ok());
}
