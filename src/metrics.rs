/*! Live vehicle-state snapshot.

Every decoded CAN signal updates one named metric. Most metrics are
plain scalars, but grouped hardware (drive motors, battery subsystems,
cells, temperature probes) is modelled with two extra shapes:

* a *list-index* metric, whose current value names the active member
  index and whose index table accumulates every index ever seen, and
* a *list-member* metric, which keeps one value per index key of its
  parent list-index metric.

The shape of a metric is fixed by its name (see [shape_of]), so the
decoder and the telemetry encoders never have to inspect name strings
at runtime to figure out how a value is stored.
 */
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::trace;

/// Well-known metric names published by the CAN decoder and consumed
/// by the login/telemetry encoders.
pub mod names {
    /// Powertrain-ready state, total-data vehicle-state field.
    pub const VEHICLE_STATE: &str = "PTReady";
    /// Battery charge/discharge state machine.
    pub const BATTERY_STATE: &str = "BatState";
    /// Powertrain running mode.
    pub const RUNNING_MODE: &str = "PTMode";
    /// Vehicle speed.
    pub const VEHICLE_SPEED: &str = "VehicleSpeed";
    /// Total mileage.
    pub const TOTAL_MILEAGE: &str = "ODO";
    /// Pack voltage.
    pub const TOTAL_VOLTAGE: &str = "actVoltage";
    /// Pack current.
    pub const TOTAL_CURRENT: &str = "actCurrent";
    /// State of charge.
    pub const SOC: &str = "actSOC";
    /// DC/DC converter operating mode.
    pub const DCDC_STATE: &str = "StOpMode";
    /// Gear selector state.
    pub const GEAR: &str = "StGear";
    /// Insulation resistance.
    pub const INSULATION: &str = "IsoResistance";
    /// Accelerator pedal position.
    pub const ACCEL_PEDAL: &str = "GasNrm";
    /// Brake pedal position.
    pub const BRAKE_PEDAL: &str = "bBrk";
    /// Vehicle fault level; 3 and above is the emergency level.
    pub const FAULT_LEVEL: &str = "VehFaultLevel";
    /// Number of battery subsystems, reported during login.
    pub const BATTERY_COUNT: &str = "BatSubsysNum";

    /// Drive motor index (list index).
    pub const DRIVE_MOTOR_INDEX: &str = "DrvMotorIdx";
    /// Drive motor state, per motor.
    pub const DRIVE_MOTOR_STATE: &str = "DrvMotorState";
    /// Drive motor controller temperature, per motor.
    pub const DRIVE_MOTOR_CTRL_TEMP: &str = "DrvMotorCtrlTemp";
    /// Drive motor spin speed, per motor.
    pub const DRIVE_MOTOR_SPIN_SPEED: &str = "DrvMotorSpinSpeed";
    /// Drive motor torque, per motor.
    pub const DRIVE_MOTOR_TORQUE: &str = "DrvMotorTorque";
    /// Drive motor temperature, per motor.
    pub const DRIVE_MOTOR_TEMP: &str = "DrvMotorTemp";
    /// Drive motor controller input voltage, per motor.
    pub const DRIVE_MOTOR_CTRL_VOLTAGE: &str = "DrvMotorCtrlVoltage";
    /// Drive motor controller DC bus current, per motor.
    pub const DRIVE_MOTOR_CTRL_CURRENT: &str = "DrvMotorCtrlCurrent";

    /// Subsystem id carrying the maximum cell voltage.
    pub const MAX_VOLT_SUBSYS_ID: &str = "MaxVoltSubsysId";
    /// Cell id carrying the maximum cell voltage.
    pub const MAX_VOLT_CELL_ID: &str = "MaxVoltCellId";
    /// Maximum cell voltage.
    pub const MAX_CELL_VOLTAGE: &str = "MaxCellVoltage";
    /// Subsystem id carrying the minimum cell voltage.
    pub const MIN_VOLT_SUBSYS_ID: &str = "MinVoltSubsysId";
    /// Cell id carrying the minimum cell voltage.
    pub const MIN_VOLT_CELL_ID: &str = "MinVoltCellId";
    /// Minimum cell voltage.
    pub const MIN_CELL_VOLTAGE: &str = "MinCellVoltage";
    /// Subsystem id carrying the maximum probe temperature.
    pub const MAX_TEMP_SUBSYS_ID: &str = "MaxTempSubsysId";
    /// Probe id carrying the maximum temperature.
    pub const MAX_TEMP_PROBE_ID: &str = "MaxTempProbeId";
    /// Maximum probe temperature.
    pub const MAX_TEMPERATURE: &str = "MaxTemperature";
    /// Subsystem id carrying the minimum probe temperature.
    pub const MIN_TEMP_SUBSYS_ID: &str = "MinTempSubsysId";
    /// Probe id carrying the minimum temperature.
    pub const MIN_TEMP_PROBE_ID: &str = "MinTempProbeId";
    /// Minimum probe temperature.
    pub const MIN_TEMPERATURE: &str = "MinTemperature";

    /// Alarm flags, in the bit order of the alarm block bitfield.
    pub const ALARMS: [&str; 19] = [
        "AlarmTemperatureDiff",
        "AlarmBatteryOverheat",
        "AlarmBatteryOvervoltage",
        "AlarmBatteryUndervoltage",
        "AlarmSocLow",
        "AlarmCellOvervoltage",
        "AlarmCellUndervoltage",
        "AlarmSocHigh",
        "AlarmSocJump",
        "AlarmBatteryMismatch",
        "AlarmCellConsistency",
        "AlarmBadInsulation",
        "AlarmDcdcOverheat",
        "AlarmEvp",
        "AlarmDcdcState",
        "AlarmCtrlOverheat",
        "AlarmEmergencyOff",
        "AlarmMotorOverheat",
        "AlarmSocOvercharge",
    ];

    /// Battery voltage-reporting subsystem index (list index).
    pub const BAT_VOLT_SUBSYS_INDEX: &str = "BatVoltSubsysIdx";
    /// Cell count per voltage subsystem.
    pub const BAT_CELL_COUNT: &str = "BatCellCount";
    /// First cell number of a cell-voltage frame (grouped list index).
    pub const CELL_VOLT_BASE_INDEX: &str = "CellVoltBaseIdx";
    /// The four cell voltages carried by one frame.
    pub const CELL_VOLTAGES: [&str; 4] =
        ["CellVoltage0", "CellVoltage1", "CellVoltage2", "CellVoltage3"];

    /// Battery temperature-reporting subsystem index (list index).
    pub const BAT_TEMP_SUBSYS_INDEX: &str = "BatTempSubsysIdx";
    /// Temperature probe count per subsystem.
    pub const BAT_PROBE_COUNT: &str = "BatProbeCount";
    /// First probe number of a probe-temperature frame (grouped list index).
    pub const PROBE_TEMP_BASE_INDEX: &str = "ProbeTempBaseIdx";
    /// The four probe temperatures carried by one frame.
    pub const PROBE_TEMPS: [&str; 4] =
        ["ProbeTemp0", "ProbeTemp1", "ProbeTemp2", "ProbeTemp3"];
}

/// Storage shape a metric name maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSpec {
    /// Single scalar value.
    Plain,
    /// Index-naming metric; `group` chains it under another list index
    /// so its keys become `"<group key>:<value>"`.
    ListIndex {
        /// Optional owning list-index metric.
        group: Option<&'static str>,
    },
    /// One value per index key of `parent`.
    ListMember {
        /// The list-index metric providing the key.
        parent: &'static str,
    },
}

/// Shape a metric name is stored with.
#[must_use]
pub fn shape_of(name: &str) -> ShapeSpec {
    use names::*;
    match name {
        DRIVE_MOTOR_INDEX | BAT_VOLT_SUBSYS_INDEX | BAT_TEMP_SUBSYS_INDEX => {
            ShapeSpec::ListIndex { group: None }
        }
        CELL_VOLT_BASE_INDEX => ShapeSpec::ListIndex {
            group: Some(BAT_VOLT_SUBSYS_INDEX),
        },
        PROBE_TEMP_BASE_INDEX => ShapeSpec::ListIndex {
            group: Some(BAT_TEMP_SUBSYS_INDEX),
        },
        DRIVE_MOTOR_STATE | DRIVE_MOTOR_CTRL_TEMP | DRIVE_MOTOR_SPIN_SPEED
        | DRIVE_MOTOR_TORQUE | DRIVE_MOTOR_TEMP | DRIVE_MOTOR_CTRL_VOLTAGE
        | DRIVE_MOTOR_CTRL_CURRENT => ShapeSpec::ListMember {
            parent: DRIVE_MOTOR_INDEX,
        },
        BAT_CELL_COUNT => ShapeSpec::ListMember {
            parent: BAT_VOLT_SUBSYS_INDEX,
        },
        BAT_PROBE_COUNT => ShapeSpec::ListMember {
            parent: BAT_TEMP_SUBSYS_INDEX,
        },
        "CellVoltage0" | "CellVoltage1" | "CellVoltage2" | "CellVoltage3" => {
            ShapeSpec::ListMember {
                parent: CELL_VOLT_BASE_INDEX,
            }
        }
        "ProbeTemp0" | "ProbeTemp1" | "ProbeTemp2" | "ProbeTemp3" => ShapeSpec::ListMember {
            parent: PROBE_TEMP_BASE_INDEX,
        },
        _ => ShapeSpec::Plain,
    }
}

/// Per-shape payload of a [MetricValue].
#[derive(Debug, Clone, PartialEq)]
pub enum MetricShape {
    /// Single scalar, nothing beyond `value`.
    Plain,
    /// Index-naming metric.
    ListIndex {
        /// Index key most recently produced by an update.
        current_key: String,
        /// Every index key ever seen, mapped to 1.
        indices: BTreeMap<String, i64>,
    },
    /// Per-index values of a list member.
    ListMember {
        /// Name of the owning list-index metric.
        parent: String,
        /// Values keyed by the parent's index keys.
        values: BTreeMap<String, i64>,
    },
}

/// Current state of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    /// Metric name.
    pub name: String,
    /// Raw (unscaled) value from the most recent update.
    pub value: i64,
    /// Physical unit multiplier.
    pub unit: f64,
    /// Physical offset bias.
    pub offset: i64,
    /// 1-based CAN interface the value came from, 0 for synthetic.
    pub source: u8,
    /// Shape-specific payload.
    pub shape: MetricShape,
}

impl MetricValue {
    /// A plain scalar metric.
    #[must_use]
    pub fn plain(name: &str, value: i64, unit: f64, offset: i64, source: u8) -> Self {
        Self {
            name: name.to_string(),
            value,
            unit,
            offset,
            source,
            shape: MetricShape::Plain,
        }
    }

    /// Physical value: `raw * unit + offset`.
    #[must_use]
    pub fn phys(&self) -> f64 {
        self.value as f64 * self.unit + self.offset as f64
    }

    /// Index table of a list-index metric.
    #[must_use]
    pub fn indices(&self) -> Option<&BTreeMap<String, i64>> {
        match &self.shape {
            MetricShape::ListIndex { indices, .. } => Some(indices),
            _ => None,
        }
    }

    /// Value table of a list-member metric.
    #[must_use]
    pub fn list_values(&self) -> Option<&BTreeMap<String, i64>> {
        match &self.shape {
            MetricShape::ListMember { values, .. } => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, MetricValue>,
    generation: u64,
}

/// Shared live snapshot of all decoded metrics.
///
/// Writers are the CAN decoder threads; readers take per-cursor deep
/// copies through [SnapshotReader]. All access goes through a single
/// mutex, an update is atomically visible to the next reader.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    inner: Arc<Mutex<Inner>>,
}

impl MetricSnapshot {
    /// New empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or mutate the metric `name` with a freshly decoded value.
    ///
    /// List-member updates whose parent has never been seen are
    /// dropped.
    pub fn update(&self, name: &str, value: i64, unit: f64, offset: i64, source: u8) {
        let mut inner = self.inner.lock().unwrap();
        match shape_of(name) {
            ShapeSpec::Plain => {
                let entry = inner
                    .values
                    .entry(name.to_string())
                    .or_insert_with(|| MetricValue::plain(name, value, unit, offset, source));
                entry.value = value;
                entry.unit = unit;
                entry.offset = offset;
                entry.source = source;
            }
            ShapeSpec::ListIndex { group } => {
                let key = match group {
                    None => value.to_string(),
                    Some(group) => {
                        let Some(group_key) = inner.values.get(group).and_then(|m| match &m.shape {
                            MetricShape::ListIndex { current_key, .. } => {
                                Some(current_key.clone())
                            }
                            _ => None,
                        }) else {
                            trace!("dropping {name} update, group {group} not seen yet");
                            return;
                        };
                        format!("{group_key}:{value}")
                    }
                };
                let entry = inner.values.entry(name.to_string()).or_insert_with(|| {
                    MetricValue {
                        name: name.to_string(),
                        value,
                        unit,
                        offset,
                        source,
                        shape: MetricShape::ListIndex {
                            current_key: String::new(),
                            indices: BTreeMap::new(),
                        },
                    }
                });
                entry.value = value;
                entry.unit = unit;
                entry.offset = offset;
                entry.source = source;
                if let MetricShape::ListIndex {
                    current_key,
                    indices,
                } = &mut entry.shape
                {
                    indices.insert(key.clone(), 1);
                    *current_key = key;
                }
            }
            ShapeSpec::ListMember { parent } => {
                let Some(parent_key) = inner.values.get(parent).and_then(|m| match &m.shape {
                    MetricShape::ListIndex { current_key, .. } => Some(current_key.clone()),
                    _ => None,
                }) else {
                    trace!("dropping {name} update, parent {parent} not seen yet");
                    return;
                };
                let entry = inner.values.entry(name.to_string()).or_insert_with(|| {
                    MetricValue {
                        name: name.to_string(),
                        value,
                        unit,
                        offset,
                        source,
                        shape: MetricShape::ListMember {
                            parent: parent.to_string(),
                            values: BTreeMap::new(),
                        },
                    }
                });
                entry.value = value;
                entry.unit = unit;
                entry.offset = offset;
                entry.source = source;
                if let MetricShape::ListMember { values, .. } = &mut entry.shape {
                    values.insert(parent_key, value);
                }
            }
        }
        inner.generation += 1;
    }

    /// A new reader cursor starting at the current generation.
    #[must_use]
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            snapshot: self.clone(),
            last_generation: 0,
        }
    }

    /// Look up a single metric by name (deep copy).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.inner.lock().unwrap().values.get(name).cloned()
    }
}

/// Read cursor over a [MetricSnapshot].
///
/// Each periodic consumer (report tick, decoded-log tick) owns one
/// cursor; `take` reports whether anything changed since that cursor
/// last looked.
#[derive(Debug)]
pub struct SnapshotReader {
    snapshot: MetricSnapshot,
    last_generation: u64,
}

impl SnapshotReader {
    /// Deep copy of the current mapping plus an updated-since-last-take
    /// flag.
    #[must_use]
    pub fn take(&mut self) -> (HashMap<String, MetricValue>, bool) {
        let inner = self.snapshot.inner.lock().unwrap();
        let updated = inner.generation != self.last_generation;
        self.last_generation = inner.generation;
        (inner.values.clone(), updated)
    }
}
