//! The supported inverter models and what each one is asked every cycle.

use crate::inverter::pi17::AsciiCommand;
use crate::inverter::registers::{RegisterMap, RegisterSpec};
use crate::prelude::*;

use std::str::FromStr;

/// Which wire protocol a model speaks inside the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolKind {
    Modbus,
    Ascii,
}

/// A supported model. Parsed case-insensitively from its config name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelId {
    IsolarSmgII11k,
    IsolarSmgII6k,
    VoltronicAscii,
    EasunSmw,
}

impl ModelId {
    pub const ALL: [ModelId; 4] = [
        ModelId::IsolarSmgII11k,
        ModelId::IsolarSmgII6k,
        ModelId::VoltronicAscii,
        ModelId::EasunSmw,
    ];

    /// Name used in the config file.
    pub fn name(&self) -> &'static str {
        match self {
            ModelId::IsolarSmgII11k => "ISOLAR_SMG_II_11K",
            ModelId::IsolarSmgII6k => "ISOLAR_SMG_II_6K",
            ModelId::VoltronicAscii => "VOLTRONIC_ASCII",
            ModelId::EasunSmw => "EASUN_SMW",
        }
    }

    /// Register reads or PI-17 text commands.
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            ModelId::IsolarSmgII11k | ModelId::IsolarSmgII6k => ProtocolKind::Modbus,
            ModelId::VoltronicAscii | ModelId::EasunSmw => ProtocolKind::Ascii,
        }
    }

    /// Register table; empty for text-protocol models.
    pub fn register_map(&self) -> RegisterMap {
        match self {
            ModelId::IsolarSmgII11k => isolar_smg_ii_11k(),
            ModelId::IsolarSmgII6k => isolar_smg_ii_6k(),
            ModelId::VoltronicAscii | ModelId::EasunSmw => RegisterMap::default(),
        }
    }

    /// Commands issued each cycle, in order; empty for register models.
    pub fn commands(&self) -> Vec<AsciiCommand> {
        use AsciiCommand::*;

        match self {
            ModelId::VoltronicAscii => vec![Qpigs, Qmod, Qpiws],
            ModelId::EasunSmw => vec![Qpigs, Qmod, Qpiri, Qpigs2],
            ModelId::IsolarSmgII11k | ModelId::IsolarSmgII6k => Vec::new(),
        }
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Model(s.to_owned()))
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn clock(raw: i32) -> f64 {
    f64::from(raw)
}

fn clock_registers(entries: &mut Vec<(&'static str, RegisterSpec)>) {
    for (i, name) in crate::inverter::snapshot::TIME_REGISTERS.iter().enumerate() {
        entries.push((*name, RegisterSpec::with(696 + i as u16, clock)));
    }
}

fn isolar_smg_ii_11k() -> RegisterMap {
    let mut entries = vec![
        ("operation_mode", RegisterSpec::at(201)),
        ("battery_voltage", RegisterSpec::scaled(277, 0.1)),
        ("battery_current", RegisterSpec::scaled(278, 0.1)),
        ("battery_power", RegisterSpec::at(279)),
        ("battery_soc", RegisterSpec::at(280)),
        ("battery_temperature", RegisterSpec::at(281)),
        ("pv_total_power", RegisterSpec::at(302)),
        ("pv_charging_power", RegisterSpec::at(303)),
        ("pv_charging_current", RegisterSpec::scaled(304, 0.1)),
        ("pv_temperature", RegisterSpec::at(305)),
        ("pv1_voltage", RegisterSpec::scaled(351, 0.1)),
        ("pv1_current", RegisterSpec::scaled(352, 0.1)),
        ("pv1_power", RegisterSpec::at(353)),
        ("pv2_voltage", RegisterSpec::scaled(389, 0.1)),
        ("pv2_current", RegisterSpec::scaled(390, 0.1)),
        ("pv2_power", RegisterSpec::at(391)),
        ("grid_voltage", RegisterSpec::scaled(338, 0.1)),
        ("grid_current", RegisterSpec::scaled(339, 0.1)),
        ("grid_power", RegisterSpec::at(340)),
        ("grid_frequency", RegisterSpec::at(607)),
        ("output_voltage", RegisterSpec::scaled(346, 0.1)),
        ("output_current", RegisterSpec::scaled(347, 0.1)),
        ("output_power", RegisterSpec::at(348)),
        ("output_apparent_power", RegisterSpec::at(349)),
        ("output_load_percentage", RegisterSpec::at(350)),
        ("output_frequency", RegisterSpec::at(607)),
        ("pv_energy_today", RegisterSpec::scaled(702, 0.01)),
        ("pv_energy_total", RegisterSpec::scaled(703, 0.01)),
    ];
    clock_registers(&mut entries);

    RegisterMap::new(entries)
}

fn isolar_smg_ii_6k() -> RegisterMap {
    let mut entries = vec![
        ("operation_mode", RegisterSpec::at(201)),
        ("battery_voltage", RegisterSpec::scaled(215, 0.1)),
        ("battery_current", RegisterSpec::scaled(216, 0.1)),
        ("battery_power", RegisterSpec::at(217)),
        ("battery_soc", RegisterSpec::at(229)),
        ("battery_temperature", RegisterSpec::at(226)),
        ("pv_total_power", RegisterSpec::at(223)),
        ("pv_charging_power", RegisterSpec::at(224)),
        ("pv_charging_current", RegisterSpec::scaled(234, 0.1)),
        ("pv_temperature", RegisterSpec::at(227)),
        ("pv1_voltage", RegisterSpec::scaled(219, 0.1)),
        ("pv1_current", RegisterSpec::scaled(220, 0.1)),
        ("pv1_power", RegisterSpec::at(223)),
        ("pv2_voltage", RegisterSpec::unsupported()),
        ("pv2_current", RegisterSpec::unsupported()),
        ("pv2_power", RegisterSpec::unsupported()),
        ("grid_voltage", RegisterSpec::scaled(202, 0.1)),
        ("grid_current", RegisterSpec::unsupported()),
        ("grid_power", RegisterSpec::at(204)),
        ("grid_frequency", RegisterSpec::at(203)),
        ("output_voltage", RegisterSpec::scaled(210, 0.1)),
        ("output_current", RegisterSpec::scaled(211, 0.1)),
        ("output_power", RegisterSpec::at(213)),
        ("output_apparent_power", RegisterSpec::at(214)),
        ("output_load_percentage", RegisterSpec::scaled(225, 0.01)),
        ("output_frequency", RegisterSpec::at(212)),
        ("pv_energy_today", RegisterSpec::unsupported()),
        ("pv_energy_total", RegisterSpec::unsupported()),
    ];
    clock_registers(&mut entries);

    RegisterMap::new(entries)
}
