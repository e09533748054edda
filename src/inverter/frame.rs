//! The dongle envelope.
//!
//! Every request and reply is wrapped the same way regardless of what it
//! carries:
//!
//! ```text
//!   0  2  transaction id
//!   2  2  protocol id (0x0001)
//!   4  2  length of everything that follows
//!   6  1  unit marker (0xFF)
//!   7  1  function marker (0x04)
//!   8  .. payload
//! ```
//!
//! For register reads the payload is a Modbus RTU frame; for PI-17 it is the
//! command text followed by an escaped XMODEM checksum and a CR.

use crate::crc;
use crate::prelude::*;

use bytes::{BufMut, Bytes, BytesMut};
use nom::{number::complete::be_u16, sequence::tuple, IResult};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::codec::{Decoder, Encoder};

pub const PROTOCOL_ID: u16 = 0x0001;
pub const UNIT_MARKER: u8 = 0xFF;
pub const FUNCTION_MARKER: u8 = 0x04;
pub const HEADER_LEN: usize = 6;
pub const MIN_FRAME_LEN: usize = 9;
pub const DEFAULT_UNIT_ID: u8 = 0x01;

// nothing legitimate comes close; a larger length means we lost sync
const MAX_PAYLOAD_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterRead {
    pub unit_id: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
}

impl RegisterRead {
    pub fn holding(unit_id: u8, address: u16, count: u16) -> Self {
        Self {
            unit_id,
            function: FunctionCode::ReadHoldingRegisters,
            address,
            count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Read(RegisterRead),
    Ascii(String),
}

impl Command {
    pub fn ascii(text: impl Into<String>) -> Self {
        Command::Ascii(text.into())
    }

    /// Everything after the unit/function markers.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::Read(read) => {
                let mut data = Vec::with_capacity(8);
                data.push(read.unit_id);
                data.push(read.function.into());
                data.extend_from_slice(&read.address.to_be_bytes());
                data.extend_from_slice(&read.count.to_be_bytes());
                let trailer = crc::modbus_trailer(&data);
                data.extend_from_slice(&trailer);
                data
            }
            Command::Ascii(text) => {
                let mut data = text.as_bytes().to_vec();
                let trailer = crc::xmodem_trailer(&data);
                data.extend_from_slice(&trailer);
                data.push(b'\r');
                data
            }
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Read(r) => write!(
                f,
                "read unit={} fn={:#04x} addr={} count={}",
                r.unit_id,
                u8::from(r.function),
                r.address,
                r.count
            ),
            Command::Ascii(text) => write!(f, "{}", text),
        }
    }
}

pub fn encode(transaction_id: u16, command: &Command) -> Bytes {
    let payload = command.payload();
    let length = (payload.len() + 2) as u16;

    let mut r = BytesMut::with_capacity(HEADER_LEN + length as usize);
    r.put_u16(transaction_id);
    r.put_u16(PROTOCOL_ID);
    r.put_u16(length);
    r.put_u8(UNIT_MARKER);
    r.put_u8(FUNCTION_MARKER);
    r.put_slice(&payload);

    r.freeze()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterFormat {
    Signed,
    Unsigned,
}

/// One parsed envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit: u8,
    pub function: u8,
    /// Payload after the unit/function markers.
    pub body: Bytes,
}

fn header(input: &[u8]) -> IResult<&[u8], (u16, u16, u16)> {
    tuple((be_u16, be_u16, be_u16))(input)
}

impl Frame {
    pub fn parse(input: &[u8]) -> Result<Self, Error> {
        if input.len() < MIN_FRAME_LEN {
            return Err(Error::Frame(format!(
                "frame is {} bytes, need at least {}",
                input.len(),
                MIN_FRAME_LEN
            )));
        }

        let (rest, (transaction_id, protocol_id, length)) = header(input)
            .map_err(|e| Error::Frame(format!("bad envelope header: {:?}", e)))?;

        let length = length as usize;
        if rest.len() < length {
            return Err(Error::Frame(format!(
                "declared length {} but only {} bytes follow",
                length,
                rest.len()
            )));
        }
        let payload = &rest[..length];
        if payload.len() < 3 {
            return Err(Error::Frame(format!("payload of {} bytes", payload.len())));
        }

        Ok(Self {
            transaction_id,
            protocol_id,
            unit: payload[0],
            function: payload[1],
            body: Bytes::copy_from_slice(&payload[2..]),
        })
    }

    /// Register words of a read reply: `[byte_count][words...]`. At most
    /// `count` words are returned and never more than `byte_count` covers.
    pub fn registers(&self, count: u16, format: RegisterFormat) -> Vec<i32> {
        let Some((&byte_count, data)) = self.body.split_first() else {
            return Vec::new();
        };
        let available = data.len().min(byte_count as usize);

        data[..available]
            .chunks_exact(2)
            .take(count as usize)
            .map(|w| {
                let raw = u16::from_be_bytes([w[0], w[1]]);
                match format {
                    RegisterFormat::Signed => Utils::signed(raw),
                    RegisterFormat::Unsigned => i32::from(raw),
                }
            })
            .collect()
    }

    /// Text of a PI-17 reply with the checksum and CR removed.
    pub fn text(&self) -> Option<String> {
        let len = self.body.len();
        if len < 3 {
            return None;
        }
        std::str::from_utf8(&self.body[..len - 3])
            .ok()
            .map(str::to_owned)
    }
}

/// Register words of a raw reply; empty when the frame is malformed.
pub fn decode_registers(input: &[u8], count: u16, format: RegisterFormat) -> Vec<i32> {
    match Frame::parse(input) {
        Ok(frame) => frame.registers(count, format),
        Err(e) => {
            debug!("dropping register reply {}: {}", Utils::hex(input), e);
            Vec::new()
        }
    }
}

/// Reply text; `None` when the frame is malformed.
pub fn decode_text(input: &[u8]) -> Option<String> {
    Frame::parse(input).ok().and_then(|frame| frame.text())
}

/// Cuts whole envelopes out of the TCP stream.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = Utils::u16ify(src, 4) as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(Error::Frame(format!(
                "declared length {} exceeds {}",
                length, MAX_PAYLOAD_LEN
            )));
        }

        let frame_len = HEADER_LEN + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(frame_len)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Frame(format!(
                "short read: connection closed with {} bytes of a partial envelope",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
