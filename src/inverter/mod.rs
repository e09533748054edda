pub mod adapter;    // Modbus and PI-17 fetch logic
pub mod discovery;  // UDP announcement and reverse TCP accept
pub mod frame;      // Envelope encoding, parsing and stream codec
pub mod models;     // Model catalogue
pub mod pi17;       // PI-17 text commands and reply parsers
pub mod pipeline;   // Sequential request/reply exchange
pub mod registers;  // Register tables and read grouping
pub mod session;    // Connection lifecycle
pub mod snapshot;   // Decoded values and the assembled snapshot

use crate::prelude::*;

use adapter::{Protocol, ProtocolAdapter};
use frame::{Command, RegisterFormat, RegisterRead};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub use models::ModelId;
pub use session::{Session, SessionState};
pub use snapshot::Snapshot;

const SCAN_CHUNK: u16 = 10;
const DEVICE_PROBE_REGISTER: u16 = 0x0115;
const DEVICE_PROBE_DELAY_MS: u64 = 100;
// tid stripped; a bare unit/function header and nothing else
const PROTOCOL_ERROR_TAIL: [u8; 6] = [0x00, 0x01, 0x00, 0x02, 0xff, 0x04];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisterReading {
    pub address: u16,
    pub value: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    #[serde(rename = "Valid Response")]
    ValidResponse,
    #[serde(rename = "Protocol Error")]
    ProtocolError,
    #[serde(rename = "No Response")]
    NoResponse,
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceProbe {
    pub device_id: u8,
    pub status: DeviceStatus,
}

struct Active {
    model: ModelId,
    protocol: Protocol,
}

/// Host-facing handle on one inverter.
#[derive(Clone)]
pub struct Inverter {
    config: config::Inverter,
    session: Arc<Session>,
    active: Arc<Mutex<Active>>,
}

impl Inverter {
    pub fn new(config: &config::Inverter) -> Result<Self, Error> {
        let model: ModelId = config.model().parse()?;
        let protocol = Protocol::for_model(model, config.unit_id());

        Ok(Self::with_protocol(config, model, protocol))
    }

    /// Use a hand-built protocol instead of the model's stock one.
    pub fn with_protocol(config: &config::Inverter, model: ModelId, protocol: Protocol) -> Self {
        Self {
            config: config.clone(),
            session: Arc::new(Session::new(config.clone())),
            active: Arc::new(Mutex::new(Active { model, protocol })),
        }
    }

    pub fn config(&self) -> &config::Inverter {
        &self.config
    }

    pub fn model(&self) -> ModelId {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).model
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Switch models. The register map and groups are rebuilt only when the
    /// model actually changes.
    pub fn select_model(&self, model: &str) -> Result<(), Error> {
        let model: ModelId = model.parse()?;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.model == model {
            return Ok(());
        }

        info!("switching model {} -> {}", active.model, model);
        active.protocol = Protocol::for_model(model, self.config.unit_id());
        active.model = model;

        Ok(())
    }

    /// One full poll cycle. Any failure drops the connection so the next
    /// cycle starts from a fresh handshake.
    pub async fn fetch_snapshot(&self) -> Result<Snapshot, Error> {
        let protocol = self.protocol();

        let values = match protocol.fetch(&self.session).await {
            Ok(values) => values,
            Err(e) => {
                self.session.disconnect().await;
                return Err(e);
            }
        };

        let snapshot = Snapshot::assemble(&values);
        if snapshot.is_empty() {
            self.session.disconnect().await;
            return Err(Error::NoData);
        }

        Ok(snapshot)
    }

    /// Raw signed words for `count` registers from `start`, read in chunks of
    /// ten. Chunks that come back malformed read as `None`.
    pub async fn scan_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<RegisterReading>, Error> {
        let count = u32::from(count).min(0x1_0000 - u32::from(start)) as u16;
        let unit_id = self.config.unit_id();

        let chunks: Vec<(u16, u16)> = (0..count)
            .step_by(SCAN_CHUNK as usize)
            .map(|offset| (start + offset, SCAN_CHUNK.min(count - offset)))
            .collect();
        let commands: Vec<Command> = chunks
            .iter()
            .map(|(address, n)| Command::Read(RegisterRead::holding(unit_id, *address, *n)))
            .collect();

        self.session.ensure_connected().await?;
        let replies = self.session.send_bulk(&commands).await?;

        let mut readings = Vec::with_capacity(count as usize);
        for ((address, n), reply) in chunks.iter().zip(replies.iter()) {
            let words = frame::decode_registers(reply, *n, RegisterFormat::Signed);
            for i in 0..*n {
                readings.push(RegisterReading {
                    address: address + i,
                    value: words.get(i as usize).copied(),
                });
            }
        }

        Ok(readings)
    }

    /// Probe each unit id with a single read, 100 ms apart. A probe that
    /// times out reads as `NoResponse`; other transport errors are reported
    /// as they are.
    pub async fn scan_device_ids(&self, ids: RangeInclusive<u8>) -> Vec<DeviceProbe> {
        let mut probes = Vec::new();

        for (i, device_id) in ids.enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(DEVICE_PROBE_DELAY_MS)).await;
            }

            let command = Command::Read(RegisterRead::holding(device_id, DEVICE_PROBE_REGISTER, 1));
            let status = match self.session.send_batch(&[command], 1).await {
                Ok(replies) => replies
                    .first()
                    .map(|r| Self::classify(r))
                    .unwrap_or(DeviceStatus::NoResponse),
                Err(Error::Timeout(_)) => DeviceStatus::NoResponse,
                Err(e) => DeviceStatus::Error(e.to_string()),
            };
            debug!("device {}: {:?}", device_id, status);

            probes.push(DeviceProbe { device_id, status });
        }

        probes
    }

    /// Any reply that is not the bare protocol-error envelope counts as an
    /// answer, decodable or not.
    fn classify(reply: &[u8]) -> DeviceStatus {
        if reply.is_empty() {
            DeviceStatus::NoResponse
        } else if reply.len() > 2 && reply[2..] == PROTOCOL_ERROR_TAIL {
            DeviceStatus::ProtocolError
        } else {
            DeviceStatus::ValidResponse
        }
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    fn protocol(&self) -> Protocol {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .protocol
            .clone()
    }
}
