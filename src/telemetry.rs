/*! Telemetry payload block encoders.

One report payload is the concatenation of type-tagged blocks: total
data, drive motors, vehicle position, extremums, alarms, one or more
cell-voltage blocks and a cell-temperature block. Numeric fields are
big-endian.

Every encoder follows the same sentinel pattern: a missing metric
emits the all-ones "unknown" sentinel for the field width, a value
that falls outside its documented range after physical conversion
emits the "abnormal" sentinel one below it. Per-field problems never
abort a frame.
*/
use std::collections::{BTreeMap, HashMap};

use crate::gps::GpsFix;
use crate::metrics::{MetricValue, names};

/// Total vehicle data block tag.
pub const BLOCK_TOTAL_DATA: u8 = 0x01;
/// Drive motor block tag.
pub const BLOCK_DRIVE_MOTOR: u8 = 0x02;
/// Vehicle position block tag.
pub const BLOCK_VEHICLE_POSITION: u8 = 0x05;
/// Extremum block tag.
pub const BLOCK_EXTREMUM: u8 = 0x06;
/// Alarm block tag.
pub const BLOCK_ALARM: u8 = 0x07;
/// Rechargeable-device voltage block tag.
pub const BLOCK_DEVICE_VOLTAGE: u8 = 0x08;
/// Rechargeable-device temperature block tag.
pub const BLOCK_DEVICE_TEMPERATURE: u8 = 0x09;

/// Cell voltages carried per voltage block.
pub const CELLS_PER_FRAME: u16 = 200;

const U8_UNKNOWN: u8 = 0xFF;
const U8_ABNORMAL: u8 = 0xFE;
const U16_UNKNOWN: u16 = 0xFFFF;
const U16_ABNORMAL: u16 = 0xFFFE;
const U32_UNKNOWN: u32 = 0xFFFF_FFFF;
const U32_ABNORMAL: u32 = 0xFFFF_FFFE;

/// Metric mapping a payload is built from.
pub type Metrics = HashMap<String, MetricValue>;

fn phys(m: &Metrics, name: &str) -> Option<f64> {
    m.get(name).map(MetricValue::phys)
}

fn raw(m: &Metrics, name: &str) -> Option<i64> {
    m.get(name).map(|v| v.value)
}

/// Per-index values of a list-member metric, with its scaling.
struct MemberTable<'a> {
    values: Option<&'a BTreeMap<String, i64>>,
    unit: f64,
    offset: i64,
}

impl MemberTable<'_> {
    fn raw(&self, key: &str) -> Option<i64> {
        self.values.and_then(|t| t.get(key)).copied()
    }

    fn phys(&self, key: &str) -> Option<f64> {
        self.raw(key).map(|v| v as f64 * self.unit + self.offset as f64)
    }
}

fn member<'a>(m: &'a Metrics, name: &str) -> MemberTable<'a> {
    match m.get(name) {
        Some(metric) => MemberTable {
            values: metric.list_values(),
            unit: metric.unit,
            offset: metric.offset,
        },
        None => MemberTable {
            values: None,
            unit: 1.0,
            offset: 0,
        },
    }
}

/// Index keys of a list-index metric, in sorted order.
fn index_keys<'a>(m: &'a Metrics, name: &str) -> Option<Vec<&'a str>> {
    let indices = m.get(name)?.indices()?;
    if indices.is_empty() {
        return None;
    }
    Some(indices.keys().map(String::as_str).collect())
}

/// Numeric tail of an index key: `"3"` -> 3, `"0:12"` -> 12.
fn key_index(key: &str) -> Option<u32> {
    let tail = key.rsplit(':').next().unwrap_or(key);
    tail.parse().ok()
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Scale and range-check into a u16 field.
fn scaled_u16(value: Option<f64>, scale: f64, bias: f64, min: f64, max: f64) -> u16 {
    match value {
        None => U16_UNKNOWN,
        Some(v) => {
            let v = v * scale;
            if v < min || v > max {
                U16_ABNORMAL
            } else {
                (v + bias) as u16
            }
        }
    }
}

/// Pack-voltage field transform shared by the total-data and the
/// voltage blocks.
fn total_voltage_field(m: &Metrics) -> u16 {
    scaled_u16(phys(m, names::TOTAL_VOLTAGE), 10.0, 0.0, 0.0, 10000.0)
}

/// Pack-current field transform: biased by +1000 A before scaling.
fn total_current_field(m: &Metrics, divisor: f64) -> u16 {
    match phys(m, names::TOTAL_CURRENT) {
        None => U16_UNKNOWN,
        Some(v) => {
            let v = (v + 1000.0) * 10.0 / divisor;
            if !(0.0..=20000.0).contains(&v) {
                U16_ABNORMAL
            } else {
                v as u16
            }
        }
    }
}

/// Append the total vehicle data block.
pub fn total_data(out: &mut Vec<u8>, m: &Metrics) {
    out.push(BLOCK_TOTAL_DATA);

    out.push(match raw(m, names::VEHICLE_STATE) {
        None => U8_UNKNOWN,
        Some(0) => 2,
        Some(1) => 1,
        Some(_) => 3,
    });

    out.push(match raw(m, names::BATTERY_STATE) {
        None => U8_UNKNOWN,
        Some(6) => 1,
        Some(7) => 2,
        Some(8) => 4,
        Some(0xA) => U8_ABNORMAL,
        Some(v) if (0..=5).contains(&v) => 3,
        Some(_) => U8_UNKNOWN,
    });

    out.push(match raw(m, names::RUNNING_MODE) {
        None => U8_UNKNOWN,
        Some(1) => 1,
        Some(3) => U8_ABNORMAL,
        Some(_) => U8_UNKNOWN,
    });

    push_u16(out, scaled_u16(phys(m, names::VEHICLE_SPEED), 10.0, 0.0, 0.0, 2200.0));

    let mileage = match phys(m, names::TOTAL_MILEAGE) {
        None => U32_UNKNOWN,
        Some(v) => {
            let v = v * 10.0;
            if v > 9_999_999.0 { U32_ABNORMAL } else { v as u32 }
        }
    };
    push_u32(out, mileage);

    push_u16(out, total_voltage_field(m));
    push_u16(out, total_current_field(m, 1.0));

    out.push(match phys(m, names::SOC) {
        None => U8_UNKNOWN,
        Some(v) if v > 100.0 => U8_ABNORMAL,
        Some(v) => v as u8,
    });

    out.push(match raw(m, names::DCDC_STATE) {
        None => U8_UNKNOWN,
        Some(1) => 1,
        Some(0) | Some(2) => 2,
        Some(_) => U8_ABNORMAL,
    });

    out.push(match raw(m, names::GEAR) {
        Some(0) => 0x0,
        Some(1) => 0xE,
        Some(2) => 0xD,
        Some(3) => 0xF,
        _ => 0x0,
    });

    let insulation = match phys(m, names::INSULATION) {
        None => U16_UNKNOWN,
        Some(v) => (v * 10.0) as u16,
    };
    push_u16(out, insulation);

    out.push(match phys(m, names::ACCEL_PEDAL) {
        None => U8_UNKNOWN,
        Some(v) if v > 100.0 => U8_ABNORMAL,
        Some(v) => v as u8,
    });

    out.push(match phys(m, names::BRAKE_PEDAL) {
        None => U8_UNKNOWN,
        Some(v) if v > 101.0 => U8_ABNORMAL,
        Some(v) => v as u8,
    });
}

/// Temperature field: physical range [-40, 210] biased by +40.
fn temp_u8(v: Option<f64>) -> u8 {
    match v {
        None => U8_UNKNOWN,
        Some(t) if (-40.0..=210.0).contains(&t) => (t + 40.0) as u8,
        Some(_) => U8_ABNORMAL,
    }
}

/// Append the drive motor block.
pub fn drive_motor(out: &mut Vec<u8>, m: &Metrics) {
    out.push(BLOCK_DRIVE_MOTOR);

    let Some(keys) = index_keys(m, names::DRIVE_MOTOR_INDEX) else {
        out.push(0);
        return;
    };
    out.push(keys.len().min(253) as u8);

    let state = member(m, names::DRIVE_MOTOR_STATE);
    let ctrl_temp = member(m, names::DRIVE_MOTOR_CTRL_TEMP);
    let spin_speed = member(m, names::DRIVE_MOTOR_SPIN_SPEED);
    let torque = member(m, names::DRIVE_MOTOR_TORQUE);
    let motor_temp = member(m, names::DRIVE_MOTOR_TEMP);
    let ctrl_voltage = member(m, names::DRIVE_MOTOR_CTRL_VOLTAGE);
    let ctrl_current = member(m, names::DRIVE_MOTOR_CTRL_CURRENT);

    for key in keys.into_iter().take(253) {
        out.push(key_index(key).unwrap_or(0) as u8);

        out.push(match state.raw(key) {
            None => U8_UNKNOWN,
            Some(0) => 3,
            Some(1) => 4,
            Some(3) => 1,
            Some(4) => 2,
            Some(5) => U8_ABNORMAL,
            Some(_) => U8_UNKNOWN,
        });

        out.push(temp_u8(ctrl_temp.phys(key)));

        push_u16(
            out,
            scaled_u16(spin_speed.phys(key), 1.0, 20000.0, -20000.0, 45531.0),
        );
        push_u16(
            out,
            scaled_u16(torque.phys(key), 10.0, 20000.0, -20000.0, 45531.0),
        );

        out.push(temp_u8(motor_temp.phys(key)));

        push_u16(
            out,
            scaled_u16(ctrl_voltage.phys(key), 10.0, 0.0, 0.0, 60000.0),
        );
        push_u16(
            out,
            scaled_u16(ctrl_current.phys(key), 10.0, 10000.0, -10000.0, 10000.0),
        );
    }
}

/// Append the vehicle position block.
pub fn vehicle_position(out: &mut Vec<u8>, fix: GpsFix) {
    out.push(BLOCK_VEHICLE_POSITION);
    out.push(fix.state);
    push_u32(out, fix.longitude);
    push_u32(out, fix.latitude);
}

/// 1-based hardware id field: 250 and above is abnormal.
fn id_u8(v: Option<i64>) -> u8 {
    match v {
        None => U8_UNKNOWN,
        Some(v) if v >= 250 => U8_ABNORMAL,
        Some(v) => (v + 1) as u8,
    }
}

/// Append the extremum block.
pub fn extremum(out: &mut Vec<u8>, m: &Metrics) {
    out.push(BLOCK_EXTREMUM);

    let cell_voltage = |out: &mut Vec<u8>, name: &str| {
        let field = match m.get(name) {
            None => U16_UNKNOWN,
            Some(v) if v.value > 15000 => U16_ABNORMAL,
            Some(v) => v.phys() as u16,
        };
        push_u16(out, field);
    };
    let cell_temp = |out: &mut Vec<u8>, name: &str| {
        out.push(match m.get(name) {
            None => U8_UNKNOWN,
            Some(v) if v.value > 250 => U8_ABNORMAL,
            Some(v) => (v.phys() + 40.0) as u8,
        });
    };

    out.push(id_u8(raw(m, names::MAX_VOLT_SUBSYS_ID)));
    out.push(id_u8(raw(m, names::MAX_VOLT_CELL_ID)));
    cell_voltage(out, names::MAX_CELL_VOLTAGE);
    out.push(id_u8(raw(m, names::MIN_VOLT_SUBSYS_ID)));
    out.push(id_u8(raw(m, names::MIN_VOLT_CELL_ID)));
    cell_voltage(out, names::MIN_CELL_VOLTAGE);
    out.push(id_u8(raw(m, names::MAX_TEMP_SUBSYS_ID)));
    out.push(id_u8(raw(m, names::MAX_TEMP_PROBE_ID)));
    cell_temp(out, names::MAX_TEMPERATURE);
    out.push(id_u8(raw(m, names::MIN_TEMP_SUBSYS_ID)));
    out.push(id_u8(raw(m, names::MIN_TEMP_PROBE_ID)));
    cell_temp(out, names::MIN_TEMPERATURE);
}

/// Append the alarm block.
pub fn alarm(out: &mut Vec<u8>, m: &Metrics) {
    out.push(BLOCK_ALARM);

    out.push(match raw(m, names::FAULT_LEVEL) {
        None => U8_UNKNOWN,
        Some(v) if v > 3 => U8_ABNORMAL,
        Some(v) => v as u8,
    });

    let mut flags = 0u32;
    for (bit, name) in names::ALARMS.iter().enumerate() {
        if raw(m, name).is_some_and(|v| v != 0) {
            flags |= 1 << bit;
        }
    }
    push_u32(out, flags);

    // Fault-code list counts (rechargeable, drive motor, engine,
    // other) are always empty.
    out.extend_from_slice(&[0, 0, 0, 0]);
}

/// Append one rechargeable-device voltage block covering cells
/// `start .. start + 200` of every subsystem.
///
/// Returns true when some subsystem still has cells past this frame,
/// in which case the caller loops with `start + 200`.
pub fn rechargeable_voltage(out: &mut Vec<u8>, m: &Metrics, start: u16) -> bool {
    out.push(BLOCK_DEVICE_VOLTAGE);

    let Some(keys) = index_keys(m, names::BAT_VOLT_SUBSYS_INDEX) else {
        out.push(U8_UNKNOWN);
        return false;
    };
    let subsys_count = keys.len().min(250);
    out.push(subsys_count as u8);

    let pack_voltage = total_voltage_field(m);
    let pack_current = total_current_field(m, subsys_count as f64);
    let cell_count_tab = member(m, names::BAT_CELL_COUNT);
    let base_keys: Vec<String> = m
        .get(names::CELL_VOLT_BASE_INDEX)
        .and_then(MetricValue::indices)
        .map(|t| t.keys().cloned().collect())
        .unwrap_or_default();
    let cell_tabs: Vec<MemberTable> = names::CELL_VOLTAGES
        .iter()
        .map(|n| member(m, n))
        .collect();

    let mut have_more = false;
    for key in keys.into_iter().take(250) {
        out.push(key_index(key).map(|v| v + 1).unwrap_or(0) as u8);
        push_u16(out, pack_voltage);
        push_u16(out, pack_current);

        let cell_count = cell_count_tab.raw(key).unwrap_or(0).clamp(0, u16::MAX as i64) as u16;
        push_u16(out, cell_count);

        let remaining = cell_count.saturating_sub(start);
        let frame_count = remaining.min(CELLS_PER_FRAME);
        if remaining > CELLS_PER_FRAME {
            have_more = true;
        }
        push_u16(out, if remaining > 0 { start + 1 } else { 0 });
        out.push(frame_count as u8);

        let mut values = vec![0u16; frame_count as usize];
        let prefix = format!("{key}:");
        for base_key in base_keys.iter().filter(|k| k.starts_with(&prefix)) {
            let Some(base) = key_index(base_key) else {
                continue;
            };
            for (pos, tab) in cell_tabs.iter().enumerate() {
                let Some(v) = tab.phys(base_key) else {
                    continue;
                };
                let cell = base + pos as u32;
                let (start, frame_count) = (u32::from(start), u32::from(frame_count));
                if cell >= start && cell < start + frame_count {
                    let field = if v > 60000.0 { U16_ABNORMAL } else { v as u16 };
                    values[(cell - start) as usize] = field;
                }
            }
        }
        for v in values {
            push_u16(out, v);
        }
    }
    have_more
}

/// Append the rechargeable-device temperature block.
pub fn rechargeable_temperature(out: &mut Vec<u8>, m: &Metrics) {
    out.push(BLOCK_DEVICE_TEMPERATURE);

    let Some(keys) = index_keys(m, names::BAT_TEMP_SUBSYS_INDEX) else {
        out.push(U8_UNKNOWN);
        return;
    };
    out.push(keys.len().min(250) as u8);

    let probe_count_tab = member(m, names::BAT_PROBE_COUNT);
    let base_keys: Vec<String> = m
        .get(names::PROBE_TEMP_BASE_INDEX)
        .and_then(MetricValue::indices)
        .map(|t| t.keys().cloned().collect())
        .unwrap_or_default();
    let probe_tabs: Vec<MemberTable> = names::PROBE_TEMPS
        .iter()
        .map(|n| member(m, n))
        .collect();

    for key in keys.into_iter().take(250) {
        out.push(key_index(key).map(|v| v + 1).unwrap_or(0) as u8);

        let probe_count = probe_count_tab.raw(key).unwrap_or(0).clamp(0, u16::MAX as i64) as u16;
        push_u16(out, probe_count);

        let mut values = vec![0u8; probe_count as usize];
        let prefix = format!("{key}:");
        for base_key in base_keys.iter().filter(|k| k.starts_with(&prefix)) {
            let Some(base) = key_index(base_key) else {
                continue;
            };
            for (pos, tab) in probe_tabs.iter().enumerate() {
                let Some(t) = tab.phys(base_key) else {
                    continue;
                };
                let probe = (base + pos as u32) as usize;
                if probe < values.len() {
                    values[probe] = temp_u8(Some(t));
                }
            }
        }
        out.extend_from_slice(&values);
    }
}

/// Build the full report payload body: every block in wire order, with
/// as many voltage blocks as the cell count requires.
#[must_use]
pub fn build_payload(m: &Metrics, fix: GpsFix) -> Vec<u8> {
    let mut out = Vec::new();
    total_data(&mut out, m);
    drive_motor(&mut out, m);
    vehicle_position(&mut out, fix);
    extremum(&mut out, m);
    alarm(&mut out, m);
    let mut start = 0u16;
    while rechargeable_voltage(&mut out, m, start) {
        start += CELLS_PER_FRAME;
    }
    rechargeable_temperature(&mut out, m);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSnapshot;

    fn snapshot_with(entries: &[(&str, i64, f64, i64)]) -> Metrics {
        let snap = MetricSnapshot::new();
        for (name, value, unit, offset) in entries {
            snap.update(name, *value, *unit, *offset, 1);
        }
        snap.reader().take().0
    }

    #[test]
    fn total_data_all_missing() {
        let m = Metrics::new();
        let mut out = Vec::new();
        total_data(&mut out, &m);
        assert_eq!(
            out,
            vec![
                0x01, // tag
                0xFF, 0xFF, 0xFF, // states
                0xFF, 0xFF, // speed
                0xFF, 0xFF, 0xFF, 0xFF, // mileage
                0xFF, 0xFF, // voltage
                0xFF, 0xFF, // current
                0xFF, // soc
                0xFF, // dcdc
                0x00, // gear defaults to neutral
                0xFF, 0xFF, // insulation
                0xFF, // accel
                0xFF, // brake
            ]
        );
    }

    #[test]
    fn speed_boundaries() {
        // 220.0 km/h scaled by 10 is the last valid value.
        let m = snapshot_with(&[(names::VEHICLE_SPEED, 2200, 0.1, 0)]);
        let mut out = Vec::new();
        total_data(&mut out, &m);
        assert_eq!(&out[4..6], &2200u16.to_be_bytes());

        let m = snapshot_with(&[(names::VEHICLE_SPEED, 22001, 0.01, 0)]);
        let mut out = Vec::new();
        total_data(&mut out, &m);
        assert_eq!(&out[4..6], &0xFFFEu16.to_be_bytes());
    }

    #[test]
    fn soc_boundaries() {
        let m = snapshot_with(&[(names::SOC, 100, 1.0, 0)]);
        let mut out = Vec::new();
        total_data(&mut out, &m);
        assert_eq!(out[14], 0x64);

        let m = snapshot_with(&[(names::SOC, 101, 1.0, 0)]);
        let mut out = Vec::new();
        total_data(&mut out, &m);
        assert_eq!(out[14], 0xFE);
    }

    #[test]
    fn total_current_boundaries() {
        let mut check = |value: i64, unit: f64, want: u16| {
            let m = snapshot_with(&[(names::TOTAL_CURRENT, value, unit, 0)]);
            let mut out = Vec::new();
            total_data(&mut out, &m);
            assert_eq!(&out[12..14], &want.to_be_bytes(), "current {value}x{unit}");
        };
        check(-1000, 1.0, 0x0000);
        check(1000, 1.0, 0x4E20);
        check(100_001, 0.01, 0xFFFE);
    }

    #[test]
    fn dcdc_mapping() {
        for (raw, want) in [(1i64, 1u8), (0, 2), (2, 2), (5, 0xFE)] {
            let m = snapshot_with(&[(names::DCDC_STATE, raw, 1.0, 0)]);
            let mut out = Vec::new();
            total_data(&mut out, &m);
            assert_eq!(out[15], want, "dcdc raw {raw}");
        }
    }

    #[test]
    fn drive_motor_empty_and_missing_members() {
        let m = Metrics::new();
        let mut out = Vec::new();
        drive_motor(&mut out, &m);
        assert_eq!(out, vec![0x02, 0x00]);

        // One motor with no member signals at all: every field is a
        // sentinel.
        let m = snapshot_with(&[(names::DRIVE_MOTOR_INDEX, 1, 1.0, 0)]);
        let mut out = Vec::new();
        drive_motor(&mut out, &m);
        assert_eq!(
            out,
            vec![
                0x02, 0x01, // tag, count
                0x01, // motor index
                0xFF, // state
                0xFF, // ctrl temp
                0xFF, 0xFF, // spin speed
                0xFF, 0xFF, // torque
                0xFF, // motor temp
                0xFF, 0xFF, // ctrl voltage
                0xFF, 0xFF, // ctrl current
            ]
        );
    }

    #[test]
    fn drive_motor_field_transforms() {
        let m = snapshot_with(&[
            (names::DRIVE_MOTOR_INDEX, 2, 1.0, 0),
            (names::DRIVE_MOTOR_STATE, 3, 1.0, 0),
            (names::DRIVE_MOTOR_CTRL_TEMP, 25, 1.0, 0),
            (names::DRIVE_MOTOR_SPIN_SPEED, 3000, 1.0, 0),
            (names::DRIVE_MOTOR_TORQUE, 150, 1.0, 0),
            (names::DRIVE_MOTOR_TEMP, 260, 1.0, 0),
            (names::DRIVE_MOTOR_CTRL_VOLTAGE, 3500, 0.1, 0),
            (names::DRIVE_MOTOR_CTRL_CURRENT, -200, 1.0, 0),
        ]);
        let mut out = Vec::new();
        drive_motor(&mut out, &m);
        assert_eq!(out[0..2], [0x02, 0x01]);
        assert_eq!(out[2], 2); // index
        assert_eq!(out[3], 1); // state 3 -> running
        assert_eq!(out[4], 25 + 40);
        assert_eq!(&out[5..7], &(3000u16 + 20000).to_be_bytes());
        assert_eq!(&out[7..9], &(1500u16 + 20000).to_be_bytes());
        assert_eq!(out[9], 0xFE); // 260 C out of range
        assert_eq!(&out[10..12], &3500u16.to_be_bytes());
        assert_eq!(&out[12..14], &(10000u16 - 2000).to_be_bytes());
    }

    #[test]
    fn extremum_id_bias() {
        let m = snapshot_with(&[
            (names::MAX_VOLT_SUBSYS_ID, 0, 1.0, 0),
            (names::MAX_VOLT_CELL_ID, 250, 1.0, 0),
            (names::MAX_CELL_VOLTAGE, 4150, 1.0, 0),
        ]);
        let mut out = Vec::new();
        extremum(&mut out, &m);
        assert_eq!(out[0], 0x06);
        assert_eq!(out[1], 1); // raw 0 encodes 1-based 1
        assert_eq!(out[2], 0xFE); // raw 250 is abnormal
        assert_eq!(&out[3..5], &4150u16.to_be_bytes());
        // Everything else missing.
        assert_eq!(out[5], 0xFF);
    }

    #[test]
    fn alarm_bitfield() {
        let m = snapshot_with(&[
            (names::FAULT_LEVEL, 2, 1.0, 0),
            ("AlarmTemperatureDiff", 1, 1.0, 0),
            ("AlarmBadInsulation", 1, 1.0, 0),
            ("AlarmSocLow", 0, 1.0, 0),
        ]);
        let mut out = Vec::new();
        alarm(&mut out, &m);
        assert_eq!(out[0], 0x07);
        assert_eq!(out[1], 2);
        assert_eq!(&out[2..6], &0x0000_0801u32.to_be_bytes());
        assert_eq!(&out[6..10], &[0, 0, 0, 0]);
    }

    #[test]
    fn alarm_fault_level_cap() {
        let m = snapshot_with(&[(names::FAULT_LEVEL, 4, 1.0, 0)]);
        let mut out = Vec::new();
        alarm(&mut out, &m);
        assert_eq!(out[1], 0xFE);
    }

    #[test]
    fn position_block() {
        let fix = GpsFix {
            state: 0,
            latitude: 31_230_000,
            longitude: 121_470_000,
        };
        let mut out = Vec::new();
        vehicle_position(&mut out, fix);
        assert_eq!(out[0], 0x05);
        assert_eq!(out[1], 0);
        assert_eq!(&out[2..6], &121_470_000u32.to_be_bytes());
        assert_eq!(&out[6..10], &31_230_000u32.to_be_bytes());
    }

    fn battery_snapshot(cells: u16) -> Metrics {
        let snap = MetricSnapshot::new();
        snap.update(names::BAT_VOLT_SUBSYS_INDEX, 0, 1.0, 0, 1);
        snap.update(names::BAT_CELL_COUNT, i64::from(cells), 1.0, 0, 1);
        for base in (0..cells).step_by(4) {
            snap.update(names::CELL_VOLT_BASE_INDEX, i64::from(base), 1.0, 0, 1);
            for pos in 0..4usize {
                if base + (pos as u16) < cells {
                    let cell = base + pos as u16;
                    snap.update(names::CELL_VOLTAGES[pos], 3000 + i64::from(cell), 1.0, 0, 1);
                }
            }
        }
        snap.reader().take().0
    }

    #[test]
    fn voltage_block_single_frame() {
        let m = battery_snapshot(6);
        let mut out = Vec::new();
        let more = rechargeable_voltage(&mut out, &m, 0);
        assert!(!more);
        assert_eq!(out[0], 0x08);
        assert_eq!(out[1], 1); // one subsystem
        assert_eq!(out[2], 1); // subsystem id 0 -> 1
        // Pack voltage/current missing from this snapshot.
        assert_eq!(&out[3..5], &[0xFF, 0xFF]);
        assert_eq!(&out[5..7], &[0xFF, 0xFF]);
        assert_eq!(&out[7..9], &6u16.to_be_bytes()); // cell count
        assert_eq!(&out[9..11], &1u16.to_be_bytes()); // 1-based start
        assert_eq!(out[11], 6); // cells in this frame
        let values: Vec<u16> = out[12..]
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![3000, 3001, 3002, 3003, 3004, 3005]);
    }

    #[test]
    fn voltage_block_sequences_cover_all_cells() {
        let m = battery_snapshot(430);
        let mut start = 0u16;
        let mut seen = 0u32;
        let mut frames = 0;
        loop {
            let mut out = Vec::new();
            let more = rechargeable_voltage(&mut out, &m, start);
            let frame_count = out[11];
            let start_index = u16::from_be_bytes([out[9], out[10]]);
            assert_eq!(start_index, start + 1);
            seen += u32::from(frame_count);
            frames += 1;
            if !more {
                break;
            }
            start += CELLS_PER_FRAME;
        }
        assert_eq!(frames, 3); // 200 + 200 + 30
        assert_eq!(seen, 430);
    }

    #[test]
    fn voltage_block_without_subsystems() {
        let m = Metrics::new();
        let mut out = Vec::new();
        assert!(!rechargeable_voltage(&mut out, &m, 0));
        assert_eq!(out, vec![0x08, 0xFF]);
    }

    #[test]
    fn temperature_block() {
        let snap = MetricSnapshot::new();
        snap.update(names::BAT_TEMP_SUBSYS_INDEX, 0, 1.0, 0, 1);
        snap.update(names::BAT_PROBE_COUNT, 3, 1.0, 0, 1);
        snap.update(names::PROBE_TEMP_BASE_INDEX, 0, 1.0, 0, 1);
        snap.update(names::PROBE_TEMPS[0], 20, 1.0, -40, 1);
        snap.update(names::PROBE_TEMPS[1], 65, 1.0, -40, 1);
        snap.update(names::PROBE_TEMPS[2], 300, 1.0, 0, 1);
        let m = snap.reader().take().0;
        let mut out = Vec::new();
        rechargeable_temperature(&mut out, &m);
        assert_eq!(out[0], 0x09);
        assert_eq!(out[1], 1);
        assert_eq!(out[2], 1);
        assert_eq!(&out[3..5], &3u16.to_be_bytes());
        // -20 C and 25 C biased by +40; 300 C is abnormal.
        assert_eq!(&out[5..8], &[20, 65, 0xFE]);
    }

    #[test]
    fn full_payload_block_order() {
        let m = battery_snapshot(4);
        let payload = build_payload(&m, GpsFix::default());
        let mut tags = Vec::new();
        let mut pos = 0;
        // Walk the self-describing blocks the way the server does.
        while pos < payload.len() {
            let tag = payload[pos];
            tags.push(tag);
            pos += match tag {
                BLOCK_TOTAL_DATA => 21,
                BLOCK_DRIVE_MOTOR => 2 + payload[pos + 1] as usize * 12,
                BLOCK_VEHICLE_POSITION => 10,
                BLOCK_EXTREMUM => 15,
                BLOCK_ALARM => 10,
                BLOCK_DEVICE_VOLTAGE => {
                    let mut p = pos + 2;
                    for _ in 0..payload[pos + 1] {
                        let n = payload[p + 9] as usize;
                        p += 10 + n * 2;
                    }
                    p - pos
                }
                BLOCK_DEVICE_TEMPERATURE => {
                    if payload[pos + 1] == 0xFF {
                        2
                    } else {
                        let mut p = pos + 2;
                        for _ in 0..payload[pos + 1] {
                            let n = u16::from_be_bytes([payload[p + 1], payload[p + 2]]);
                            p += 3 + n as usize;
                        }
                        p - pos
                    }
                }
                _ => panic!("unknown tag {tag:#x} at {pos}"),
            };
        }
        assert_eq!(tags, vec![0x01, 0x02, 0x05, 0x06, 0x07, 0x08, 0x09]);
        assert_eq!(pos, payload.len());
    }
}
