//! Position-report field flags.
//!
//! The radio's position config carries a bitmask selecting which optional fields go into
//! position packets. [`PositionFlags`] names each bit; `from_bits`/`to_bits` convert to and
//! from the wire value. Unknown bits are dropped.

const ALTITUDE: u32 = 1;
const ALTITUDE_MSL: u32 = 2;
const GEOIDAL_SEPARATION: u32 = 4;
const DOP: u32 = 8;
const HVDOP: u32 = 16;
const SATS_IN_VIEW: u32 = 32;
const SEQ_NO: u32 = 64;
const TIMESTAMP: u32 = 128;
const SPEED: u32 = 256;
const HEADING: u32 = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PositionFlags {
    pub altitude: bool,
    pub altitude_msl: bool,
    pub geoidal_separation: bool,
    pub dop: bool,
    pub hvdop: bool,
    pub sats_in_view: bool,
    pub seq_no: bool,
    pub timestamp: bool,
    pub speed: bool,
    pub heading: bool,
}

impl PositionFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            altitude: bits & ALTITUDE != 0,
            altitude_msl: bits & ALTITUDE_MSL != 0,
            geoidal_separation: bits & GEOIDAL_SEPARATION != 0,
            dop: bits & DOP != 0,
            hvdop: bits & HVDOP != 0,
            sats_in_view: bits & SATS_IN_VIEW != 0,
            seq_no: bits & SEQ_NO != 0,
            timestamp: bits & TIMESTAMP != 0,
            speed: bits & SPEED != 0,
            heading: bits & HEADING != 0,
        }
    }

    pub fn to_bits(&self) -> u32 {
        [
            (self.altitude, ALTITUDE),
            (self.altitude_msl, ALTITUDE_MSL),
            (self.geoidal_separation, GEOIDAL_SEPARATION),
            (self.dop, DOP),
            (self.hvdop, HVDOP),
            (self.sats_in_view, SATS_IN_VIEW),
            (self.seq_no, SEQ_NO),
            (self.timestamp, TIMESTAMP),
            (self.speed, SPEED),
            (self.heading, HEADING),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_map_to_named_flags() {
        let flags = PositionFlags::from_bits(1 | 32 | 128 | 256);
        assert!(flags.altitude);
        assert!(flags.sats_in_view);
        assert!(flags.timestamp);
        assert!(flags.speed);
        assert!(!flags.heading);
        assert!(!flags.altitude_msl);
        assert_eq!(flags.to_bits(), 1 | 32 | 128 | 256);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        assert_eq!(PositionFlags::from_bits(0xFFFF).to_bits(), 1023);
        assert_eq!(PositionFlags::default().to_bits(), 0);
    }
}
