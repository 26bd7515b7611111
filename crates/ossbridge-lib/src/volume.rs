//! Volume curve — maps the OSS 0–100 user scale onto device-native units.
//!
//! USB audio class devices report volume as signed 16-bit values in 1/256 dB
//! steps, with `0x8000` reserved as the mute sentinel. The curve is linear
//! across the device's reported `[min, max]` range; the endpoints come from
//! a one-time range query at startup and never change afterwards.

/// Device-native volume unit (USB audio class: s16, 1/256 dB).
pub type DeviceVolume = i16;

/// The device mute sentinel. Only percent 0 ever maps here.
pub const VOLUME_MUTE: DeviceVolume = i16::MIN;

/// Device volume range, queried once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeRange {
    pub min: DeviceVolume,
    pub max: DeviceVolume,
}

/// Map a 0–100 user volume into the device range.
///
/// Zero mutes. Any positive percent lands inside `[min, max]` — a computed
/// value below `min` is raised to `min`, never forced down to mute.
pub fn to_device(percent: u8, range: VolumeRange) -> DeviceVolume {
    if percent == 0 {
        return VOLUME_MUTE;
    }

    let min = i32::from(range.min);
    let max = i32::from(range.max);
    let p = i32::from(percent);

    let mut vol = (max * p + min * (100 - p)) / 100;
    if vol < min {
        vol = min;
    } else if vol > max {
        vol = max;
    }
    vol as DeviceVolume
}

/// Map a device volume back onto the 0–100 user scale.
///
/// A degenerate range (`min >= max`) reports 100; out-of-range inputs clamp
/// to the nearest bound.
pub fn to_percent(volume: DeviceVolume, range: VolumeRange) -> u8 {
    if range.min >= range.max {
        return 100;
    }
    if volume < range.min {
        return 0;
    }
    if volume > range.max {
        return 100;
    }

    let min = i32::from(range.min);
    let max = i32::from(range.max);
    let cur = i32::from(volume);
    ((100 * (cur - min)) / (max - min)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: VolumeRange = VolumeRange {
        min: -11520, // -45 dB
        max: 0,
    };

    #[test]
    fn zero_percent_is_mute() {
        assert_eq!(to_device(0, RANGE), VOLUME_MUTE);
    }

    #[test]
    fn full_percent_is_max() {
        assert_eq!(to_device(100, RANGE), RANGE.max);
    }

    #[test]
    fn one_percent_is_not_mute() {
        let vol = to_device(1, RANGE);
        assert_ne!(vol, VOLUME_MUTE);
        assert!(vol >= RANGE.min);
    }

    #[test]
    fn midpoint_is_linear() {
        assert_eq!(to_device(50, RANGE), -5760);
    }

    #[test]
    fn over_100_clamps_to_max() {
        // SETPLAYVOL carries a raw channel byte, so values up to 255 arrive.
        assert_eq!(to_device(255, RANGE), RANGE.max);
    }

    #[test]
    fn positive_percent_never_below_min() {
        let narrow = VolumeRange { min: -10, max: 0 };
        for p in 1..=100 {
            assert!(to_device(p, narrow) >= narrow.min, "percent {p}");
        }
    }

    #[test]
    fn roundtrip_within_one_unit() {
        for p in 1..=100u8 {
            let back = to_percent(to_device(p, RANGE), RANGE);
            let diff = (i16::from(back) - i16::from(p)).abs();
            assert!(diff <= 1, "percent {p} came back as {back}");
        }
    }

    #[test]
    fn mute_roundtrips_to_zero_exactly() {
        assert_eq!(to_percent(to_device(0, RANGE), RANGE), 0);
    }

    #[test]
    fn degenerate_range_reports_full() {
        let flat = VolumeRange { min: 0, max: 0 };
        assert_eq!(to_percent(-100, flat), 100);
        assert_eq!(to_percent(0, flat), 100);
        let inverted = VolumeRange { min: 10, max: -10 };
        assert_eq!(to_percent(0, inverted), 100);
    }

    #[test]
    fn out_of_range_clamps() {
        assert_eq!(to_percent(RANGE.min - 1, RANGE), 0);
        assert_eq!(to_percent(RANGE.max, RANGE), 100);
        assert_eq!(to_percent(100, RANGE), 100);
    }

    #[test]
    fn endpoints_map_back_exactly() {
        assert_eq!(to_percent(RANGE.min, RANGE), 0);
        assert_eq!(to_percent(RANGE.max, RANGE), 100);
    }
}
