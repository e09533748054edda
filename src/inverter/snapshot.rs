use crate::prelude::*;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::Serialize;
use std::collections::BTreeMap;

/// One decoded quantity.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// Flat name -> value bag produced by one fetch, before assembly.
pub type Values = BTreeMap<&'static str, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, FromPrimitive, IntoPrimitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum OperatingMode {
    Sub = 2,
    Sbu = 3,
    PowerOn = 10,
    Standby = 11,
    Line = 12,
    Battery = 13,
    Fault = 14,
    PowerSaving = 15,
    #[num_enum(default)]
    Unknown = 99,
}

impl OperatingMode {
    /// PI-17 QMOD letter.
    pub fn from_letter(letter: char) -> Self {
        match letter.to_ascii_uppercase() {
            'P' => Self::PowerOn,
            'S' => Self::Standby,
            'L' => Self::Line,
            'B' => Self::Battery,
            'F' => Self::Fault,
            'H' => Self::PowerSaving,
            _ => Self::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sub => "SUB",
            Self::Sbu => "SBU",
            Self::PowerOn => "POWER_ON",
            Self::Standby => "STANDBY",
            Self::Line => "LINE",
            Self::Battery => "BATTERY",
            Self::Fault => "FAULT",
            Self::PowerSaving => "POWER_SAVING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// Sub-records {{{
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatteryData {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub soc: f64,
    pub temperature: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PvData {
    pub total_power: Option<f64>,
    pub charging_power: Option<f64>,
    pub charging_current: Option<f64>,
    pub temperature: Option<f64>,
    pub pv1_voltage: Option<f64>,
    pub pv1_current: Option<f64>,
    pub pv1_power: Option<f64>,
    pub pv2_voltage: Option<f64>,
    pub pv2_current: Option<f64>,
    pub pv2_power: Option<f64>,
    pub generated_today: Option<f64>,
    pub generated_total: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GridData {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    /// centi-Hz
    pub frequency: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OutputData {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub apparent_power: Option<f64>,
    pub load_percentage: Option<f64>,
    /// centi-Hz
    pub frequency: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemStatus {
    pub operating_mode: OperatingMode,
    pub mode_code: u16,
    pub inverter_time: Option<NaiveDateTime>,
    pub warnings: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RatingData {
    pub output_voltage: f64,
    pub output_frequency: f64,
    pub output_current: f64,
    pub output_apparent_power: f64,
    pub output_active_power: f64,
    pub battery_voltage: f64,
    pub battery_recharge_voltage: f64,
    pub battery_under_voltage: f64,
    pub battery_bulk_voltage: f64,
    pub battery_float_voltage: f64,
    pub battery_type: String,
    pub max_ac_charging_current: f64,
    pub max_charging_current: f64,
    pub output_source_priority: String,
    pub charger_source_priority: String,
} // }}}

/// Everything decoded in one poll cycle. Built once, never mutated.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub battery: Option<BatteryData>,
    pub pv: Option<PvData>,
    pub grid: Option<GridData>,
    pub output: Option<OutputData>,
    pub system: Option<SystemStatus>,
    pub rating: Option<RatingData>,
}

impl Snapshot {
    pub fn assemble(values: &Values) -> Self {
        let v = Fields(values);

        Self {
            taken_at: Utc::now(),
            battery: Self::battery(&v),
            pv: Self::pv(&v),
            grid: Self::grid(&v),
            output: Self::output(&v),
            system: Self::system(&v),
            rating: Self::rating(&v),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.battery.is_none()
            && self.pv.is_none()
            && self.grid.is_none()
            && self.output.is_none()
            && self.system.is_none()
            && self.rating.is_none()
    }

    fn battery(v: &Fields) -> Option<BatteryData> {
        Some(BatteryData {
            voltage: v.num("battery_voltage")?,
            current: v.num("battery_current")?,
            power: v.num("battery_power")?,
            soc: v.num("battery_soc")?,
            temperature: v.num("battery_temperature")?,
        })
    }

    fn pv(v: &Fields) -> Option<PvData> {
        if !v.any(&["pv_total_power", "pv1_voltage", "pv2_voltage"]) {
            return None;
        }

        Some(PvData {
            total_power: v.num("pv_total_power"),
            charging_power: v.num("pv_charging_power"),
            charging_current: v.num("pv_charging_current"),
            temperature: v.num("pv_temperature"),
            pv1_voltage: v.num("pv1_voltage"),
            pv1_current: v.num("pv1_current"),
            pv1_power: v.num("pv1_power"),
            pv2_voltage: v.num("pv2_voltage"),
            pv2_current: v.num("pv2_current"),
            pv2_power: v.num("pv2_power"),
            generated_today: v.num("pv_energy_today"),
            generated_total: v.num("pv_energy_total"),
        })
    }

    fn grid(v: &Fields) -> Option<GridData> {
        if !v.any(&["grid_voltage", "grid_power", "grid_frequency"]) {
            return None;
        }

        Some(GridData {
            voltage: v.num("grid_voltage"),
            current: v.num("grid_current"),
            power: v.num("grid_power"),
            frequency: v.num("grid_frequency").map(|f| f.round() as i32),
        })
    }

    fn output(v: &Fields) -> Option<OutputData> {
        if !v.any(&["output_voltage", "output_power"]) {
            return None;
        }

        let voltage = v.num("output_voltage");
        let current = v.num("output_current");
        let apparent_power = v.num("output_apparent_power").or_else(|| {
            voltage
                .zip(current)
                .map(|(volts, amps)| Utils::round(volts * amps, 3))
        });

        Some(OutputData {
            voltage,
            current,
            power: v.num("output_power"),
            apparent_power,
            load_percentage: v.num("output_load_percentage"),
            frequency: v.num("output_frequency").map(|f| f.round() as i32),
        })
    }

    fn system(v: &Fields) -> Option<SystemStatus> {
        let code = v.num("operation_mode")?;
        let code = if code.is_finite() && code >= 0.0 && code <= f64::from(u16::MAX) {
            code as u16
        } else {
            u16::from(OperatingMode::Unknown)
        };

        Some(SystemStatus {
            operating_mode: OperatingMode::from(code),
            mode_code: code,
            inverter_time: Self::inverter_time(v),
            warnings: v.list("warnings"),
        })
    }

    fn inverter_time(v: &Fields) -> Option<NaiveDateTime> {
        let mut parts = [0u32; 6];
        for (i, part) in parts.iter_mut().enumerate() {
            let raw = v.num(TIME_REGISTERS[i])?;
            if raw < 0.0 {
                return None;
            }
            *part = raw as u32;
        }
        let [year, month, day, hour, minute, second] = parts;

        let time = NaiveDate::from_ymd_opt(year as i32, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, second));
        if time.is_none() {
            debug!("ignoring invalid inverter clock {:?}", parts);
        }
        time
    }

    fn rating(v: &Fields) -> Option<RatingData> {
        Some(RatingData {
            output_voltage: v.num("rated_output_voltage")?,
            output_frequency: v.num("rated_output_frequency")?,
            output_current: v.num("rated_output_current")?,
            output_apparent_power: v.num("rated_output_apparent_power")?,
            output_active_power: v.num("rated_output_active_power")?,
            battery_voltage: v.num("rated_battery_voltage")?,
            battery_recharge_voltage: v.num("battery_recharge_voltage")?,
            battery_under_voltage: v.num("battery_under_voltage")?,
            battery_bulk_voltage: v.num("battery_bulk_voltage")?,
            battery_float_voltage: v.num("battery_float_voltage")?,
            battery_type: v.text("battery_type")?,
            max_ac_charging_current: v.num("max_ac_charging_current")?,
            max_charging_current: v.num("max_charging_current")?,
            output_source_priority: v.text("output_source_priority")?,
            charger_source_priority: v.text("charger_source_priority")?,
        })
    }
}

pub const TIME_REGISTERS: [&str; 6] = [
    "time_register_0",
    "time_register_1",
    "time_register_2",
    "time_register_3",
    "time_register_4",
    "time_register_5",
];

struct Fields<'a>(&'a Values);

impl Fields<'_> {
    fn num(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    fn text(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(Value::as_text).map(str::to_owned)
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        match self.0.get(key) {
            Some(Value::List(items)) => Some(items.clone()),
            _ => None,
        }
    }

    fn any(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.0.contains_key(*k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&'static str, f64)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (*k, Value::Number(*v)))
            .collect()
    }

    #[test]
    fn battery_needs_every_key() {
        let mut v = values(&[
            ("battery_voltage", 52.8),
            ("battery_current", -3.0),
            ("battery_power", -158.0),
            ("battery_soc", 85.0),
        ]);
        assert!(Snapshot::assemble(&v).battery.is_none());

        v.insert("battery_temperature", Value::Number(31.0));
        let battery = Snapshot::assemble(&v).battery.unwrap();
        assert_eq!(battery.voltage, 52.8);
        assert_eq!(battery.temperature, 31.0);
    }

    #[test]
    fn empty_values_assemble_nothing() {
        let snapshot = Snapshot::assemble(&Values::new());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn sub_records_are_never_zero_filled() {
        let snapshot = Snapshot::assemble(&values(&[("grid_voltage", 231.5)]));
        let grid = snapshot.grid.unwrap();
        assert_eq!(grid.voltage, Some(231.5));
        assert_eq!(grid.power, None);
        assert_eq!(grid.frequency, None);
        assert!(snapshot.pv.is_none());
        assert!(snapshot.output.is_none());
    }

    #[test]
    fn apparent_power_is_derived_when_missing() {
        let snapshot = Snapshot::assemble(&values(&[
            ("output_voltage", 230.0),
            ("output_current", 2.5),
            ("output_power", 500.0),
        ]));
        assert_eq!(snapshot.output.unwrap().apparent_power, Some(575.0));
    }

    #[test]
    fn operating_mode_and_clock() {
        let mut v = values(&[
            ("operation_mode", 3.0),
            ("time_register_0", 2024.0),
            ("time_register_1", 5.0),
            ("time_register_2", 17.0),
            ("time_register_3", 13.0),
            ("time_register_4", 45.0),
            ("time_register_5", 9.0),
        ]);
        let system = Snapshot::assemble(&v).system.unwrap();
        assert_eq!(system.operating_mode, OperatingMode::Sbu);
        assert_eq!(system.mode_code, 3);
        assert_eq!(
            system.inverter_time,
            NaiveDate::from_ymd_opt(2024, 5, 17).and_then(|d| d.and_hms_opt(13, 45, 9))
        );

        v.insert("time_register_1", Value::Number(13.0));
        v.insert("operation_mode", Value::Number(42.0));
        let system = Snapshot::assemble(&v).system.unwrap();
        assert_eq!(system.operating_mode, OperatingMode::Unknown);
        assert_eq!(system.inverter_time, None);
    }

    #[test]
    fn qmod_letters() {
        assert_eq!(OperatingMode::from_letter('B'), OperatingMode::Battery);
        assert_eq!(OperatingMode::from_letter('h'), OperatingMode::PowerSaving);
        assert_eq!(u16::from(OperatingMode::from_letter('L')), 12);
        assert_eq!(OperatingMode::from_letter('Z'), OperatingMode::Unknown);
    }

    #[test]
    fn serializes_mode_by_name() {
        let status = SystemStatus {
            operating_mode: OperatingMode::PowerOn,
            mode_code: 10,
            inverter_time: None,
            warnings: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["operating_mode"], "POWER_ON");
    }
}
