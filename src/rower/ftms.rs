//! Fitness Machine Service (FTMS) Rower Data decoding.
//!
//! Rower Data (0x2AD1) notifications start with two flag bytes, followed by fields whose
//! presence is decided by those flags. Fields always appear in the same order, so the
//! cursor only moves past fields that are flagged as present.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::MetricsSnapshot;

pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001826_0000_1000_8000_00805f9b34fb);
pub const ROWER_DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00002ad1_0000_1000_8000_00805f9b34fb);
pub const CONTROL_POINT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00002ad9_0000_1000_8000_00805f9b34fb);

/// Control point opcodes written after connecting, in this order.
pub const REQUEST_CONTROL: u8 = 0x00;
pub const START_OR_RESUME: u8 = 0x07;

// Primary flags (byte 0)
const AVERAGE_STROKE_RATE: u8 = 0x02;
const TOTAL_DISTANCE: u8 = 0x04;
const INSTANTANEOUS_PACE: u8 = 0x08;
const AVERAGE_PACE: u8 = 0x10;
const INSTANTANEOUS_POWER: u8 = 0x20;
const AVERAGE_POWER: u8 = 0x40;
const RESISTANCE_LEVEL: u8 = 0x80;

// Secondary flags (byte 1)
const EXPENDED_ENERGY: u8 = 0x01;
const HEART_RATE: u8 = 0x02;
const ELAPSED_TIME: u8 = 0x08;
const REMAINING_TIME: u8 = 0x10;

const PACE_NOT_AVAILABLE: u16 = 0xFFFF;

/// Concept2 wattage for a pace in seconds per 500m.
///
/// `watts = 2.80 / (seconds per meter)^3`, truncated. Non-positive paces give 0.
pub fn concept2_watts(pace_sec_per_500m: i32) -> u32 {
    if pace_sec_per_500m <= 0 {
        return 0;
    }
    let seconds_per_meter = pace_sec_per_500m as f64 / 500.0;
    (2.80 / seconds_per_meter.powi(3)) as u32
}

/// Decodes a Rower Data notification on top of the previous snapshot.
///
/// Fields absent from `frame` keep their previous values. Frames that end early
/// keep whatever was read before the end, and never panic.
pub fn decode(frame: &[u8], previous: &MetricsSnapshot) -> MetricsSnapshot {
    parse(frame, previous).0
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let slice = self.bytes.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }
    fn skip(&mut self, len: usize) -> Option<()> {
        self.take(len).map(|_| ())
    }
    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }
    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }
    fn u24_le(&mut self) -> Option<u32> {
        self.take(3).map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }
}

#[derive(Default)]
struct Fields {
    stroke_rate: Option<u32>,
    distance: Option<u32>,
    pace: Option<u32>,
    heart_rate: Option<u32>,
}

/// Reads fields in declaration order, stopping at the first one that doesn't fit.
fn read_fields(cursor: &mut Cursor, primary: u8, secondary: u8, fields: &mut Fields) -> Option<()> {
    // Stroke rate (0.5 resolution) and stroke count are always present,
    // bit 0 is "More Data" and doesn't gate them.
    let stroke_rate = cursor.u8()?;
    cursor.skip(2)?;
    fields.stroke_rate = Some(stroke_rate as u32 / 2);

    if primary & AVERAGE_STROKE_RATE != 0 {
        cursor.skip(1)?;
    }
    if primary & TOTAL_DISTANCE != 0 {
        fields.distance = Some(cursor.u24_le()?);
    }
    if primary & INSTANTANEOUS_PACE != 0 {
        let raw = cursor.u16_le()?;
        fields.pace = Some(if raw == PACE_NOT_AVAILABLE { 0 } else { raw as u32 });
    }
    if primary & AVERAGE_PACE != 0 {
        cursor.skip(2)?;
    }
    // The machine's own wattage is ignored, it's derived from pace instead
    if primary & INSTANTANEOUS_POWER != 0 {
        cursor.skip(2)?;
    }
    if primary & AVERAGE_POWER != 0 {
        cursor.skip(2)?;
    }
    if primary & RESISTANCE_LEVEL != 0 {
        cursor.skip(2)?;
    }

    // Total energy (2) + per hour (2) + per minute (1)
    if secondary & EXPENDED_ENERGY != 0 {
        cursor.skip(5)?;
    }
    if secondary & HEART_RATE != 0 {
        fields.heart_rate = Some(cursor.u8()? as u32);
    }
    if secondary & ELAPSED_TIME != 0 {
        cursor.skip(2)?;
    }
    if secondary & REMAINING_TIME != 0 {
        cursor.skip(2)?;
    }
    Some(())
}

/// Returns the new snapshot and how many bytes were consumed.
fn parse(frame: &[u8], previous: &MetricsSnapshot) -> (MetricsSnapshot, usize) {
    let &[primary, secondary, ..] = frame else {
        debug!("Rower frame too short for flags: {} byte(s)", frame.len());
        return (*previous, 0);
    };

    let mut cursor = Cursor {
        bytes: frame,
        offset: 2,
    };
    let mut fields = Fields::default();

    if read_fields(&mut cursor, primary, secondary, &mut fields).is_none() {
        warn!(
            "Rower frame ended early at offset {}: {:02X?}",
            cursor.offset, frame
        );
    }

    let mut snapshot = *previous;
    if let Some(stroke_rate) = fields.stroke_rate {
        snapshot.stroke_rate = stroke_rate;
    }
    if let Some(distance) = fields.distance {
        // A glitching frame must not wind the odometer back
        snapshot.distance_m = distance.max(previous.distance_m);
    }
    if let Some(heart_rate) = fields.heart_rate {
        snapshot.heart_rate = heart_rate;
    }
    // Power only moves with a fresh pace, so the two never disagree
    if let Some(pace) = fields.pace {
        snapshot.pace_sec_per_500m = pace;
        snapshot.power = concept2_watts(pace as i32);
    }

    (snapshot, cursor.offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn previous() -> MetricsSnapshot {
        MetricsSnapshot {
            power: 150,
            pace_sec_per_500m: 130,
            stroke_rate: 20,
            distance_m: 1200,
            heart_rate: 135,
        }
    }

    #[test]
    fn mandatory_fields_only() {
        let frame = [0x00, 0x00, 48, 0x10, 0x00];
        let (snapshot, consumed) = parse(&frame, &previous());
        assert_eq!(consumed, 5);
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                stroke_rate: 24,
                ..previous()
            }
        );
    }

    #[test]
    fn more_data_bit_does_not_gate_stroke_rate() {
        let frame = [0x01, 0x00, 50, 0x00, 0x00];
        assert_eq!(decode(&frame, &previous()).stroke_rate, 25);
    }

    #[test]
    fn full_frame() {
        // distance + pace + power + avg pace, energy + heart rate + elapsed
        let frame = [
            TOTAL_DISTANCE | INSTANTANEOUS_PACE | AVERAGE_PACE | INSTANTANEOUS_POWER,
            EXPENDED_ENERGY | HEART_RATE | ELAPSED_TIME,
            44, 0x05, 0x00, // stroke rate 22, stroke count 5
            0xD0, 0x07, 0x00, // 2000m
            0x7D, 0x00, // pace 125
            0x80, 0x00, // average pace, skipped
            0xFF, 0x00, // machine power, discarded
            1, 2, 3, 4, 5, // energy
            142, // heart rate
            0x10, 0x00, // elapsed time
        ];
        let (snapshot, consumed) = parse(&frame, &MetricsSnapshot::default());
        assert_eq!(consumed, frame.len());
        assert_eq!(snapshot.stroke_rate, 22);
        assert_eq!(snapshot.distance_m, 2000);
        assert_eq!(snapshot.pace_sec_per_500m, 125);
        assert_eq!(snapshot.power, concept2_watts(125));
        assert_eq!(snapshot.heart_rate, 142);
    }

    #[test]
    fn power_only_moves_with_pace() {
        let frame = [
            TOTAL_DISTANCE | INSTANTANEOUS_POWER,
            0x00,
            40, 0x00, 0x00,
            0x10, 0x00, 0x00,
            0x2C, 0x01, // 300W reported by the machine
        ];
        let prev = previous();
        let snapshot = decode(&frame, &prev);
        assert_eq!(snapshot.power, prev.power);
        assert_eq!(snapshot.pace_sec_per_500m, prev.pace_sec_per_500m);
    }

    #[test]
    fn pace_not_available_zeroes_power() {
        let frame = [INSTANTANEOUS_PACE, 0x00, 40, 0x00, 0x00, 0xFF, 0xFF];
        let snapshot = decode(&frame, &previous());
        assert_eq!(snapshot.pace_sec_per_500m, 0);
        assert_eq!(snapshot.power, 0);
    }

    #[test]
    fn short_frames_carry_forward() {
        let prev = previous();
        assert_eq!(decode(&[], &prev), prev);
        assert_eq!(decode(&[0x04], &prev), prev);
        // Flags only, nothing read
        assert_eq!(decode(&[0x04, 0x00], &prev), prev);
    }

    #[test]
    fn truncated_frame_keeps_fields_read_so_far() {
        // Distance flagged, but pace is cut off halfway
        let frame = [
            TOTAL_DISTANCE | INSTANTANEOUS_PACE,
            HEART_RATE,
            30, 0x00, 0x00,
            0x00, 0x08, 0x00, // 2048m
            0x7D, // half a pace
        ];
        let prev = previous();
        let (snapshot, consumed) = parse(&frame, &prev);
        assert_eq!(consumed, 8);
        assert_eq!(snapshot.stroke_rate, 15);
        assert_eq!(snapshot.distance_m, 2048);
        assert_eq!(snapshot.pace_sec_per_500m, prev.pace_sec_per_500m);
        assert_eq!(snapshot.power, prev.power);
        assert_eq!(snapshot.heart_rate, prev.heart_rate);
    }

    #[test]
    fn skipped_fields_keep_later_offsets_aligned() {
        let frame = [
            AVERAGE_STROKE_RATE | TOTAL_DISTANCE | RESISTANCE_LEVEL,
            HEART_RATE | REMAINING_TIME,
            20, 0x00, 0x00,
            99, // average stroke rate
            0x64, 0x00, 0x00, // 100m
            0x05, 0x00, // resistance
            120, // heart rate
            0x00, 0x01,
        ];
        let snapshot = decode(&frame, &MetricsSnapshot::default());
        assert_eq!(snapshot.distance_m, 100);
        assert_eq!(snapshot.heart_rate, 120);
    }

    #[test]
    fn distance_never_goes_backwards() {
        let frame = [TOTAL_DISTANCE, 0x00, 40, 0x00, 0x00, 0x05, 0x00, 0x00];
        let snapshot = decode(&frame, &previous());
        assert_eq!(snapshot.distance_m, 1200);
    }

    #[test]
    fn concept2_reference_values() {
        // 2:05/500m is the classic 179W reference pace
        assert_eq!(concept2_watts(125), 179);
        assert_eq!(concept2_watts(250), 22);
        assert_eq!(concept2_watts(0), 0);
        assert_eq!(concept2_watts(-10), 0);
    }
}
