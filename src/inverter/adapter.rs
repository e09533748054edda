use crate::inverter::frame::{self, Command, Frame, RegisterFormat, RegisterRead};
use crate::inverter::models::{ModelId, ProtocolKind};
use crate::inverter::pi17::AsciiCommand;
use crate::inverter::registers::{RegisterGroup, RegisterMap};
use crate::inverter::session::Session;
use crate::inverter::snapshot::{Value, Values};
use crate::prelude::*;

use async_trait::async_trait;
use std::sync::Arc;

/// One poll cycle's worth of wire traffic and decoding for a protocol.
#[async_trait]
pub trait ProtocolAdapter {
    async fn fetch(&self, session: &Session) -> Result<Values, Error>;
}

#[derive(Clone, Debug)]
pub enum Protocol {
    Modbus(ModbusProtocol),
    Ascii(AsciiProtocol),
}

impl Protocol {
    pub fn for_model(model: ModelId, unit_id: u8) -> Self {
        match model.protocol() {
            ProtocolKind::Modbus => {
                Protocol::Modbus(ModbusProtocol::new(model.register_map(), unit_id))
            }
            ProtocolKind::Ascii => Protocol::Ascii(AsciiProtocol::new(model.commands())),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Modbus(_) => ProtocolKind::Modbus,
            Protocol::Ascii(_) => ProtocolKind::Ascii,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for Protocol {
    async fn fetch(&self, session: &Session) -> Result<Values, Error> {
        match self {
            Protocol::Modbus(p) => p.fetch(session).await,
            Protocol::Ascii(p) => p.fetch(session).await,
        }
    }
}

// ModbusProtocol {{{
#[derive(Clone, Debug)]
pub struct ModbusProtocol {
    map: Arc<RegisterMap>,
    groups: Arc<Vec<RegisterGroup>>,
    unit_id: u8,
}

impl ModbusProtocol {
    pub fn new(map: RegisterMap, unit_id: u8) -> Self {
        let groups = map.groups();
        debug!("{} quantities in {} read groups", map.len(), groups.len());

        Self {
            map: Arc::new(map),
            groups: Arc::new(groups),
            unit_id,
        }
    }

    pub fn groups(&self) -> &[RegisterGroup] {
        &self.groups
    }

    fn commands(&self) -> Vec<Command> {
        self.groups
            .iter()
            .map(|g| Command::Read(RegisterRead::holding(self.unit_id, g.start, g.count)))
            .collect()
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusProtocol {
    async fn fetch(&self, session: &Session) -> Result<Values, Error> {
        session.ensure_connected().await?;
        let replies = session.send_bulk(&self.commands()).await?;

        let mut values = Values::new();
        let mut outcomes = Vec::with_capacity(replies.len());

        for (group, reply) in self.groups.iter().zip(replies.iter()) {
            let words = match Frame::parse(reply) {
                Ok(frame) => frame.registers(group.count, RegisterFormat::Signed),
                Err(e) => {
                    warn!("registers {}+{}: {}", group.start, group.count, e);
                    Vec::new()
                }
            };
            outcomes.push(!words.is_empty());

            if words.is_empty() {
                continue;
            }
            if words.len() < group.count as usize {
                debug!(
                    "registers {}+{}: short reply of {} words",
                    group.start,
                    group.count,
                    words.len()
                );
            }
            self.map.attribute(group, &words, &mut values);
        }

        session.record_frames(&outcomes).await;

        Ok(values)
    }
} // }}}

// AsciiProtocol {{{
#[derive(Clone, Debug)]
pub struct AsciiProtocol {
    commands: Arc<Vec<AsciiCommand>>,
}

impl AsciiProtocol {
    pub fn new(commands: Vec<AsciiCommand>) -> Self {
        Self {
            commands: Arc::new(commands),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for AsciiProtocol {
    async fn fetch(&self, session: &Session) -> Result<Values, Error> {
        let commands: Vec<Command> = self
            .commands
            .iter()
            .map(|c| Command::ascii(c.text()))
            .collect();

        session.ensure_connected().await?;
        let replies = session.send_bulk(&commands).await?;

        let mut values = Values::new();
        let mut outcomes = Vec::with_capacity(replies.len());
        let mut status_missing = false;

        for (command, reply) in self.commands.iter().zip(replies.iter()) {
            let text = frame::decode_text(reply);
            outcomes.push(text.is_some());

            let contribution = command.contribution(text.as_deref());
            if *command == AsciiCommand::Qpigs && contribution.is_empty() {
                status_missing = true;
            }
            values.extend(contribution);
        }

        session.record_frames(&outcomes).await;

        if status_missing {
            return Err(Error::field_parse("QPIGS", "status reply contributed nothing"));
        }

        // the second string is reported separately
        if let (Some(total), Some(pv2)) = (
            values.get("pv_total_power").and_then(Value::as_f64),
            values.get("pv2_power").and_then(Value::as_f64),
        ) {
            values.insert("pv_total_power", Value::Number(total + pv2));
        }

        Ok(values)
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_follows_model() {
        let p = Protocol::for_model(ModelId::IsolarSmgII11k, 1);
        assert_eq!(p.kind(), ProtocolKind::Modbus);
        if let Protocol::Modbus(m) = &p {
            assert_eq!(m.groups().len(), 7);
            let commands = m.commands();
            assert_eq!(
                commands[0],
                Command::Read(RegisterRead::holding(1, 201, 1))
            );
        }

        let p = Protocol::for_model(ModelId::VoltronicAscii, 1);
        assert_eq!(p.kind(), ProtocolKind::Ascii);
    }
}
