//! Location reporting.
//!
//! The host supplies fixes through [`LocationProvider`]. The manager arms a repeating
//! timer while subscribed with location sharing enabled and, on each tick, turns the
//! current fix into a broadcast position packet. A tick without a fix is logged and
//! skipped; the next tick tries again.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prost::Message;

use super::codec::{new_packet_id, OutboundPacket};
use super::flags::PositionFlags;
use crate::config::LocationConfig;
use crate::protobuf as proto;
use proto::PortNum;

/// Ground speed below which speed and track are omitted (m/s).
pub const MIN_REPORTED_SPEED: f64 = 5.0;
/// Lifetime of a shared waypoint.
pub const WAYPOINT_LIFETIME_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    /// Meters per second.
    pub speed: Option<f64>,
    /// Degrees from true north.
    pub heading: Option<f64>,
    pub sats_in_view: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            speed: None,
            heading: None,
            sats_in_view: None,
            timestamp: Utc::now(),
        }
    }
}

pub trait LocationProvider: Send {
    fn current_fix(&mut self) -> Option<LocationFix>;
}

/// A provider returning a fixed (or no) location.
#[derive(Debug, Clone, Default)]
pub struct FixedLocation {
    fix: Option<LocationFix>,
}

impl FixedLocation {
    pub fn new(fix: Option<LocationFix>) -> Self {
        Self { fix }
    }

    /// Fixed coordinates from `[location]`; no fix unless both latitude and longitude are set.
    pub fn from_config(config: &LocationConfig) -> Self {
        let fix = match (config.fixed_latitude, config.fixed_longitude) {
            (Some(lat), Some(lon)) => Some(LocationFix {
                altitude: config.fixed_altitude,
                ..LocationFix::new(lat, lon)
            }),
            _ => None,
        };
        Self { fix }
    }

    pub fn set(&mut self, fix: Option<LocationFix>) {
        self.fix = fix;
    }
}

impl LocationProvider for FixedLocation {
    fn current_fix(&mut self) -> Option<LocationFix> {
        self.fix.clone().map(|mut f| {
            f.timestamp = Utc::now();
            f
        })
    }
}

fn degrees_to_i(deg: f64) -> i32 {
    (deg * 1e7).round() as i32
}

/// Position payload for `fix`, with optional fields selected by the radio's position flags.
pub fn position_from_fix(fix: &LocationFix, flags: &PositionFlags) -> proto::Position {
    let now = Utc::now().timestamp().max(0) as u32;
    let mut position = proto::Position {
        latitude_i: degrees_to_i(fix.latitude),
        longitude_i: degrees_to_i(fix.longitude),
        time: now,
        ..Default::default()
    };
    if flags.altitude {
        position.altitude = fix.altitude.unwrap_or_default();
    }
    if flags.timestamp {
        position.timestamp = fix.timestamp.timestamp().max(0) as u32;
    }
    if flags.sats_in_view {
        position.sats_in_view = fix.sats_in_view.unwrap_or_default();
    }
    if let Some(speed) = fix.speed.filter(|s| *s >= MIN_REPORTED_SPEED) {
        position.ground_speed = speed as u32;
        position.ground_track = fix.heading.unwrap_or_default().max(0.0) as u32;
    }
    position
}

/// Position packet to `dest`, sent from the radio itself (`from = 0`).
pub fn position_packet(
    fix: &LocationFix,
    flags: &PositionFlags,
    dest: u32,
    want_response: bool,
) -> OutboundPacket {
    let payload = position_from_fix(fix, flags).encode_to_vec();
    let mut pkt = OutboundPacket::new(PortNum::PositionApp, payload);
    pkt.to = dest;
    pkt.want_response = want_response;
    pkt
}

/// Waypoint at `fix` expiring after [`WAYPOINT_LIFETIME_DAYS`].
pub fn waypoint_from_fix(fix: &LocationFix, name: &str, description: &str) -> proto::Waypoint {
    let expire = Utc::now() + ChronoDuration::days(WAYPOINT_LIFETIME_DAYS);
    proto::Waypoint {
        id: new_packet_id(),
        latitude_i: degrees_to_i(fix.latitude),
        longitude_i: degrees_to_i(fix.longitude),
        expire: expire.timestamp().max(0) as u32,
        name: name.to_string(),
        description: description.to_string(),
        ..Default::default()
    }
}

pub fn waypoint_packet(waypoint: &proto::Waypoint, dest: u32, from: u32) -> OutboundPacket {
    let mut pkt = OutboundPacket::new(PortNum::WaypointApp, waypoint.encode_to_vec());
    pkt.to = dest;
    pkt.from = from;
    pkt.want_ack = true;
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moving_fix(speed: f64) -> LocationFix {
        LocationFix {
            altitude: Some(120),
            speed: Some(speed),
            heading: Some(271.6),
            sats_in_view: Some(9),
            ..LocationFix::new(37.3349, -122.00902)
        }
    }

    #[test]
    fn coordinates_scale_to_1e7() {
        let pos = position_from_fix(&moving_fix(0.0), &PositionFlags::default());
        assert_eq!(pos.latitude_i, 373349000);
        assert_eq!(pos.longitude_i, -1220090200);
        assert_eq!(pos.altitude, 0);
        assert_eq!(pos.sats_in_view, 0);
    }

    #[test]
    fn flags_select_optional_fields() {
        let flags = PositionFlags::from_bits(1 | 32 | 128);
        let pos = position_from_fix(&moving_fix(1.0), &flags);
        assert_eq!(pos.altitude, 120);
        assert_eq!(pos.sats_in_view, 9);
        assert!(pos.timestamp > 0);
        assert_eq!(pos.ground_speed, 0);
    }

    #[test]
    fn speed_only_when_moving() {
        let pos = position_from_fix(&moving_fix(5.5), &PositionFlags::default());
        assert_eq!(pos.ground_speed, 5);
        assert_eq!(pos.ground_track, 271);
        let pos = position_from_fix(&moving_fix(4.9), &PositionFlags::default());
        assert_eq!(pos.ground_speed, 0);
        assert_eq!(pos.ground_track, 0);
    }

    #[test]
    fn waypoint_expires_in_a_week() {
        let wp = waypoint_from_fix(&moving_fix(0.0), "Camp", "");
        let week = ChronoDuration::days(7).num_seconds();
        let delta = wp.expire as i64 - Utc::now().timestamp();
        assert!((week - 5..=week).contains(&delta));
        assert!(waypoint_packet(&wp, 0xFFFF_FFFF, 9).want_ack);
    }

    #[test]
    fn fixed_location_requires_both_coordinates() {
        let mut config = LocationConfig {
            fixed_latitude: Some(1.0),
            ..Default::default()
        };
        assert!(FixedLocation::from_config(&config).current_fix().is_none());
        config.fixed_longitude = Some(2.0);
        config.fixed_altitude = Some(30);
        let fix = FixedLocation::from_config(&config).current_fix().unwrap();
        assert_eq!(fix.altitude, Some(30));
    }
}
