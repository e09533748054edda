//! PI-17 text commands and their positional reply parsers.

use crate::inverter::snapshot::{OperatingMode, Value, Values};
use crate::prelude::*;

const QPIGS_MIN_FIELDS: usize = 21;
const QPIRI_MIN_FIELDS: usize = 25;
const QPIGS2_MIN_FIELDS: usize = 3;
const QPIWS_MIN_BITS: usize = 32;

const WARNINGS: [(usize, &str); 16] = [
    (1, "Inverter fault"),
    (2, "Bus over-voltage"),
    (3, "Bus under-voltage"),
    (4, "Bus soft fail"),
    (5, "Line fail"),
    (6, "OPV short"),
    (7, "Inverter voltage too low"),
    (8, "Inverter voltage too high"),
    (10, "Over temperature"),
    (11, "Fan locked"),
    (12, "Battery voltage high"),
    (13, "Battery low alarm"),
    (15, "Battery under shutdown"),
    (18, "Overload"),
    (19, "EEPROM fault"),
    (22, "Power limit"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsciiCommand {
    /// General status
    Qpigs,
    /// Operating mode
    Qmod,
    /// Rating information
    Qpiri,
    /// Warning status
    Qpiws,
    /// Second PV string
    Qpigs2,
}

impl AsciiCommand {
    pub fn text(&self) -> &'static str {
        match self {
            AsciiCommand::Qpigs => "QPIGS",
            AsciiCommand::Qmod => "QMOD",
            AsciiCommand::Qpiri => "QPIRI",
            AsciiCommand::Qpiws => "QPIWS",
            AsciiCommand::Qpigs2 => "QPIGS2",
        }
    }

    pub fn parse(&self, raw: &str) -> Result<Values, Error> {
        match self {
            AsciiCommand::Qpigs => parse_qpigs(raw),
            AsciiCommand::Qmod => parse_qmod(raw),
            AsciiCommand::Qpiri => parse_qpiri(raw),
            AsciiCommand::Qpiws => parse_qpiws(raw),
            AsciiCommand::Qpigs2 => parse_qpigs2(raw),
        }
    }

    /// What this reply adds to the cycle. A reply that cannot be parsed adds
    /// nothing.
    pub fn contribution(&self, raw: Option<&str>) -> Values {
        let Some(raw) = raw else {
            warn!("{}: undecodable reply", self);
            return Values::new();
        };

        match self.parse(raw) {
            Ok(values) => values,
            Err(e) => {
                warn!("{}", e);
                Values::new()
            }
        }
    }
}

impl std::fmt::Display for AsciiCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Strip the leading `(` and any trailing control bytes.
fn clean(raw: &str) -> &str {
    raw.trim_start_matches('(')
        .trim_end_matches(|c: char| c.is_control() || c == ')')
        .trim()
}

struct Fields<'a> {
    command: &'static str,
    fields: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn split(command: &'static str, raw: &'a str, min: usize) -> Result<Self, Error> {
        let fields: Vec<&str> = clean(raw).split_whitespace().collect();
        if fields.len() < min {
            return Err(Error::field_parse(
                command,
                format!("expected {} fields, got {}", min, fields.len()),
            ));
        }
        Ok(Self { command, fields })
    }

    fn raw(&self, index: usize) -> &'a str {
        self.fields[index]
    }

    fn num(&self, index: usize) -> Result<f64, Error> {
        let field = self.fields[index];
        field.parse::<f64>().map_err(|_| {
            Error::field_parse(
                self.command,
                format!("field {} is not numeric: {:?}", index, field),
            )
        })
    }
}

fn parse_qpigs(raw: &str) -> Result<Values, Error> {
    let f = Fields::split("QPIGS", raw, QPIGS_MIN_FIELDS)?;

    let grid_voltage = f.num(0)?;
    let grid_frequency = f.num(1)?;
    let output_voltage = f.num(2)?;
    let output_frequency = f.num(3)?;
    let apparent_power = f.num(4)?;
    let active_power = f.num(5)?;
    let load = f.num(6)?;
    let bus_voltage = f.num(7)?;
    let battery_voltage = f.num(8)?;
    let charging_current = f.num(9)?;
    let soc = f.num(10)?;
    let heatsink = f.num(11)?;
    let pv1_current = f.num(12)?;
    let pv1_voltage = f.num(13)?;
    let scc_voltage = f.num(14)?;
    let discharge_current = f.num(15)?;
    let pv_charging_power = f.num(19)?;

    let battery_current = charging_current - discharge_current;

    let mut v = Values::new();
    let mut put = |k: &'static str, x: f64| {
        v.insert(k, Value::Number(x));
    };

    put("grid_voltage", grid_voltage);
    put("grid_frequency", f64::from(Utils::centi(grid_frequency)));
    // QPIGS carries no grid power reading; grid_power stays unset
    put("output_voltage", output_voltage);
    put("output_frequency", f64::from(Utils::centi(output_frequency)));
    put("output_apparent_power", apparent_power);
    put("output_power", active_power);
    put("output_load_percentage", load);
    if output_voltage > 0.0 {
        // derived, the reply has no output current field
        put("output_current", Utils::round(apparent_power / output_voltage, 3));
    }
    put("bus_voltage", bus_voltage);
    put("battery_voltage", battery_voltage);
    put("battery_charging_current", charging_current);
    put("battery_discharge_current", discharge_current);
    put("battery_current", battery_current);
    put("battery_power", Utils::round(battery_voltage * battery_current, 3));
    put("battery_soc", soc);
    put("inverter_temperature", heatsink);
    // inferred: no dedicated battery or PV sensor, the heatsink stands in
    put("battery_temperature", heatsink);
    put("pv_temperature", heatsink);
    put("pv1_current", pv1_current);
    put("pv1_voltage", pv1_voltage);
    put("pv1_power", Utils::round(pv1_voltage * pv1_current, 3));
    put("pv_charging_current", pv1_current);
    put("pv_charging_power", pv_charging_power);
    put("pv_total_power", pv_charging_power);
    put("scc_voltage", scc_voltage);

    v.insert("device_status", Value::Text(f.raw(16).to_owned()));

    Ok(v)
}

fn parse_qmod(raw: &str) -> Result<Values, Error> {
    let text = clean(raw);
    let Some(letter) = text.chars().next() else {
        return Err(Error::field_parse("QMOD", "empty reply"));
    };

    let mode = OperatingMode::from_letter(letter);
    if mode == OperatingMode::Unknown {
        debug!("QMOD: unrecognised mode {:?}", text);
    }

    let mut v = Values::new();
    v.insert("operation_mode", Value::Number(f64::from(u16::from(mode))));
    Ok(v)
}

fn lookup(table: &[(&str, &str)], key: &str) -> String {
    table
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("Unknown ({})", key))
}

fn parse_qpiri(raw: &str) -> Result<Values, Error> {
    let f = Fields::split("QPIRI", raw, QPIRI_MIN_FIELDS)?;

    let mut v = Values::new();
    for (key, index) in [
        ("rated_output_voltage", 2),
        ("rated_output_frequency", 3),
        ("rated_output_current", 4),
        ("rated_output_apparent_power", 5),
        ("rated_output_active_power", 6),
        ("rated_battery_voltage", 7),
        ("battery_recharge_voltage", 8),
        ("battery_under_voltage", 9),
        ("battery_bulk_voltage", 10),
        ("battery_float_voltage", 11),
        ("max_ac_charging_current", 13),
        ("max_charging_current", 14),
    ] {
        v.insert(key, Value::Number(f.num(index)?));
    }

    let battery_type = lookup(
        &[("0", "AGM"), ("1", "Flooded"), ("2", "User"), ("3", "Pylontech")],
        f.raw(12),
    );
    let output_priority = lookup(
        &[
            ("0", "Utility->Solar->Battery"),
            ("1", "Solar->Utility->Battery"),
            ("2", "Solar->Battery->Utility"),
        ],
        f.raw(16),
    );
    let charger_priority = lookup(
        &[
            ("1", "Solar First"),
            ("2", "Solar and Utility"),
            ("3", "Solar Only"),
        ],
        f.raw(17),
    );

    v.insert("battery_type", Value::Text(battery_type));
    v.insert("output_source_priority", Value::Text(output_priority));
    v.insert("charger_source_priority", Value::Text(charger_priority));

    Ok(v)
}

fn parse_qpigs2(raw: &str) -> Result<Values, Error> {
    let f = Fields::split("QPIGS2", raw, QPIGS2_MIN_FIELDS)?;

    let mut v = Values::new();
    v.insert("pv2_current", Value::Number(f.num(0)?));
    v.insert("pv2_voltage", Value::Number(f.num(1)?));
    v.insert("pv2_power", Value::Number(f.num(2)?));
    Ok(v)
}

fn parse_qpiws(raw: &str) -> Result<Values, Error> {
    let bits = clean(raw);
    if bits.len() < QPIWS_MIN_BITS {
        return Err(Error::field_parse(
            "QPIWS",
            format!("expected {} status bits, got {}", QPIWS_MIN_BITS, bits.len()),
        ));
    }

    let mut warnings: Vec<String> = bits
        .chars()
        .enumerate()
        .filter(|(_, bit)| *bit == '1')
        .filter_map(|(i, _)| WARNINGS.iter().find(|(n, _)| *n == i))
        .map(|(_, text)| text.to_string())
        .collect();
    if warnings.is_empty() {
        warnings.push("No warnings".to_string());
    }

    let mut v = Values::new();
    v.insert("warnings", Value::List(warnings));
    Ok(v)
}
