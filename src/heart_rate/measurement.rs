use std::time::Duration;

const FORMAT_U16: u8 = 0x01;
const ENERGY_EXPENDED_PRESENT: u8 = 0x08;
const RR_INTERVALS_PRESENT: u8 = 0x10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    pub rr_intervals: Vec<Duration>,
}

/// Parses a Heart Rate Measurement (0x2A37) notification.
///
/// Returns `None` if the frame is too short to hold the heart rate value.
/// A truncated RR interval list is cut at the last complete value.
pub fn parse_hrm(data: &[u8]) -> Option<HeartRateMeasurement> {
    let (&flags, rest) = data.split_first()?;

    let (bpm, mut rest) = if flags & FORMAT_U16 != 0 {
        let (value, rest) = rest.split_first_chunk::<2>()?;
        (u16::from_le_bytes(*value), rest)
    } else {
        let (&value, rest) = rest.split_first()?;
        (value as u16, rest)
    };

    if flags & ENERGY_EXPENDED_PRESENT != 0 {
        rest = rest.get(2..).unwrap_or_default();
    }

    let rr_intervals = if flags & RR_INTERVALS_PRESENT != 0 {
        rest.chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            // 1/1024 second resolution
            .map(|raw| Duration::from_micros(raw as u64 * 1_000_000 / 1024))
            .collect()
    } else {
        Vec::new()
    };

    Some(HeartRateMeasurement { bpm, rr_intervals })
}
