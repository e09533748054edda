#![allow(dead_code)]

pub use isolar_bridge::prelude::*;

use isolar_bridge::crc;
use isolar_bridge::inverter::frame::{FUNCTION_MARKER, PROTOCOL_ID, UNIT_MARKER};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

pub const QPIGS_REPLY: &str = "(232.0 50.0 230.0 49.9 0161 0119 003 460 52.80 012 085 0035 0014 103.8 52.75 00000 00110110 00 00 00856 010";

const WAIT: Duration = Duration::from_secs(3);

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Inverter config pointed at a fake on localhost with short timeouts.
pub fn test_config(model: &str, discovery_port: u16) -> config::Inverter {
    let mut c = config::Inverter::new("127.0.0.1", "127.0.0.1", model);
    c.local_port = 0;
    c.discovery_port = discovery_port;
    c.connect_timeout_secs = 1.0;
    c.command_timeout_secs = 0.3;
    c.retries = 1;
    c.retry_backoff_ms = 10;
    c.pacing_ms = 0;
    c
}

/// Same as `test_config`, but listening on a fixed port the way a deployed
/// bridge does, so the port has to be free again before each handshake.
pub fn fixed_port_config(model: &str, discovery_port: u16) -> Result<config::Inverter> {
    let mut c = test_config(model, discovery_port);
    c.local_port = free_port()?;
    Ok(c)
}

pub fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn envelope(transaction_id: u16, body: &[u8]) -> Vec<u8> {
    let mut r = transaction_id.to_be_bytes().to_vec();
    r.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    r.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
    r.extend_from_slice(&[UNIT_MARKER, FUNCTION_MARKER]);
    r.extend_from_slice(body);
    r
}

/// `[byte_count][words...][crc]`, as the dongle sends a register reply.
pub fn register_body(words: &[u16]) -> Vec<u8> {
    let mut body = vec![(words.len() * 2) as u8];
    for w in words {
        body.extend_from_slice(&w.to_be_bytes());
    }
    let trailer = crc::modbus_trailer(&body);
    body.extend_from_slice(&trailer);
    body
}

pub fn text_body(text: &str) -> Vec<u8> {
    let mut body = text.as_bytes().to_vec();
    let trailer = crc::xmodem_trailer(&body);
    body.extend_from_slice(&trailer);
    body.push(b'\r');
    body
}

pub fn parse_announcement(text: &str) -> Result<SocketAddr> {
    let addr = text
        .strip_prefix("set>server=")
        .and_then(|rest| rest.strip_suffix(';'))
        .ok_or_else(|| anyhow!("not an announcement: {:?}", text))?;
    Ok(addr.parse()?)
}

/// Plays the dongle: waits for the UDP announcement and dials back.
pub struct FakeInverter {
    udp: UdpSocket,
}

impl FakeInverter {
    pub async fn bind() -> Result<Self> {
        Ok(Self {
            udp: UdpSocket::bind("127.0.0.1:0").await?,
        })
    }

    pub fn discovery_port(&self) -> Result<u16> {
        Ok(self.udp.local_addr()?.port())
    }

    pub async fn announcement(&self) -> Result<SocketAddr> {
        let mut buf = [0u8; 128];
        let (n, _) = tokio::time::timeout(WAIT, self.udp.recv_from(&mut buf)).await??;
        parse_announcement(std::str::from_utf8(&buf[..n])?)
    }

    /// True if another announcement arrives within `wait`.
    pub async fn announced_within(&self, wait: Duration) -> bool {
        let mut buf = [0u8; 128];
        matches!(
            tokio::time::timeout(wait, self.udp.recv_from(&mut buf)).await,
            Ok(Ok(_))
        )
    }

    pub async fn dial_back(&self) -> Result<Wire> {
        let addr = self.announcement().await?;
        Ok(Wire {
            addr,
            stream: TcpStream::connect(addr).await?,
        })
    }
}

#[derive(Debug)]
pub struct Request {
    pub transaction_id: u16,
    /// Everything after the unit/function markers.
    pub payload: Vec<u8>,
}

impl Request {
    /// `(unit_id, address, count)` of a holding register read.
    pub fn register_read(&self) -> Option<(u8, u16, u16)> {
        let p = &self.payload;
        if p.len() < 6 || p[1] != 0x03 {
            return None;
        }
        Some((
            p[0],
            u16::from_be_bytes([p[2], p[3]]),
            u16::from_be_bytes([p[4], p[5]]),
        ))
    }

    pub fn ascii(&self) -> Option<String> {
        let len = self.payload.len();
        if len < 3 {
            return None;
        }
        String::from_utf8(self.payload[..len - 3].to_vec()).ok()
    }
}

/// The dongle's end of the reverse connection.
pub struct Wire {
    pub addr: SocketAddr,
    stream: TcpStream,
}

impl Wire {
    pub fn from_stream(addr: SocketAddr, stream: TcpStream) -> Self {
        Self { addr, stream }
    }

    pub async fn request(&mut self) -> Result<Request> {
        let mut header = [0u8; 6];
        tokio::time::timeout(WAIT, self.stream.read_exact(&mut header)).await??;
        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut rest = vec![0u8; len];
        self.stream.read_exact(&mut rest).await?;

        Ok(Request {
            transaction_id: u16::from_be_bytes([header[0], header[1]]),
            payload: rest.get(2..).unwrap_or_default().to_vec(),
        })
    }

    pub async fn reply(&mut self, transaction_id: u16, body: &[u8]) -> Result<()> {
        self.raw(&envelope(transaction_id, body)).await
    }

    pub async fn reply_registers(&mut self, transaction_id: u16, words: &[u16]) -> Result<()> {
        self.reply(transaction_id, &register_body(words)).await
    }

    pub async fn reply_text(&mut self, transaction_id: u16, text: &str) -> Result<()> {
        self.reply(transaction_id, &text_body(text)).await
    }

    pub async fn raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Answer every register read with `words_for(address, count)`.
    pub async fn serve_registers<F>(&mut self, requests: usize, words_for: F) -> Result<()>
    where
        F: Fn(u16, u16) -> Vec<u16>,
    {
        for _ in 0..requests {
            let req = self.request().await?;
            let (_, address, count) = req
                .register_read()
                .ok_or_else(|| anyhow!("expected a register read, got {:?}", req))?;
            self.reply_registers(req.transaction_id, &words_for(address, count))
                .await?;
        }
        Ok(())
    }

    /// True once the other end has closed the connection.
    pub async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            tokio::time::timeout(WAIT, self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}
