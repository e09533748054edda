//! The single reverse connection to an inverter and the gate that
//! serializes everything sent over it.

use crate::inverter::discovery;
use crate::inverter::frame::{Command, EnvelopeCodec};
use crate::inverter::pipeline::{self, Connection, Timing, TransactionIds};
use crate::prelude::*;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Listening,
    Connected,
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Discovering => "discovering",
            SessionState::Listening => "listening",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
        };
        write!(f, "{}", s)
    }
}

struct Live {
    conn: Connection,
    peer: SocketAddr,
    // owns the listener; taken and awaited on teardown so the port is free
    // again before the next handshake binds it
    rejector: Option<JoinHandle<()>>,
}

impl Live {
    async fn close(mut self) {
        if let Some(rejector) = self.rejector.take() {
            rejector.abort();
            let _ = rejector.await;
        }
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        if let Some(rejector) = &self.rejector {
            rejector.abort();
        }
    }
}

/// Everything only the gate holder may touch.
#[derive(Default)]
struct Link {
    live: Option<Live>,
    ids: TransactionIds,
    // set while an operation holds the gate; still set afterwards means the
    // operation was dropped midway
    in_flight: bool,
    frame_errors: u32,
}

/// The one connection to the inverter. All wire traffic, connects and
/// disconnects serialize through the gate.
pub struct Session {
    config: config::Inverter,
    state: Mutex<SessionState>,
    gate: tokio::sync::Mutex<Link>,
}

impl Session {
    pub fn new(config: config::Inverter) -> Self {
        Self {
            config,
            state: Mutex::new(SessionState::Idle),
            gate: tokio::sync::Mutex::new(Link::default()),
        }
    }

    /// Current state, without waiting for the gate.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            trace!("session {} -> {}", *current, state);
            *current = state;
        }
    }

    fn timing(&self) -> Timing {
        Timing {
            command_timeout: self.config.command_timeout(),
            pacing: self.config.pacing(),
        }
    }

    async fn acquire(&self) -> MutexGuard<'_, Link> {
        let mut link = self.gate.lock().await;
        if link.in_flight {
            warn!("previous operation was abandoned midway, forcing reconnect");
            self.teardown(&mut link).await;
        }
        link.in_flight = true;
        link
    }

    fn release(link: &mut MutexGuard<'_, Link>) {
        link.in_flight = false;
    }

    /// Run the discovery handshake unless a connection is already live.
    pub async fn ensure_connected(&self) -> Result<(), Error> {
        let mut link = self.acquire().await;
        let result = self.connect_locked(&mut link).await;
        Self::release(&mut link);
        result
    }

    pub async fn connect(&self) -> Result<(), Error> {
        self.ensure_connected().await
    }

    /// Close the connection and free the listen port. Idempotent.
    pub async fn disconnect(&self) {
        let mut link = self.gate.lock().await;
        self.teardown(&mut link).await;
        link.in_flight = false;
    }

    /// Run `commands` as one batch with the configured number of attempts.
    pub async fn send_bulk(&self, commands: &[Command]) -> Result<Vec<Bytes>, Error> {
        self.send_batch(commands, self.config.retries()).await
    }

    /// Like `send_bulk`, but with an explicit number of attempts. Every
    /// failed attempt drops the connection, waits the retry backoff and
    /// starts over with a fresh handshake. The last error is returned once
    /// attempts run out.
    pub async fn send_batch(
        &self,
        commands: &[Command],
        attempts: u32,
    ) -> Result<Vec<Bytes>, Error> {
        let mut link = self.acquire().await;
        let result = self.send_locked(&mut link, commands, attempts.max(1)).await;
        Self::release(&mut link);
        result
    }

    /// Count decoded (`true`) and malformed (`false`) frames in arrival
    /// order. Too many malformed frames in a row drop the connection.
    pub async fn record_frames(&self, outcomes: &[bool]) {
        let limit = self.config.max_frame_errors();
        let mut link = self.gate.lock().await;

        for ok in outcomes {
            if *ok {
                link.frame_errors = 0;
                continue;
            }
            link.frame_errors += 1;
            if link.frame_errors >= limit {
                warn!(
                    "{} malformed frames in a row, dropping connection",
                    link.frame_errors
                );
                self.teardown(&mut link).await;
            }
        }
    }

    async fn send_locked(
        &self,
        link: &mut Link,
        commands: &[Command],
        attempts: u32,
    ) -> Result<Vec<Bytes>, Error> {
        let timing = self.timing();
        let mut last_error = Error::NoData;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }

            let result = match self.connect_locked(link).await {
                Ok(()) => {
                    let Link { live, ids, .. } = &mut *link;
                    match live.as_mut() {
                        Some(live) => {
                            pipeline::run_batch(&mut live.conn, ids, commands, timing).await
                        }
                        None => Err(Error::Connection("not connected".to_string())),
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(replies) => return Ok(replies),
                Err(e) => {
                    warn!(
                        "batch of {} commands failed (attempt {}/{}): {}",
                        commands.len(),
                        attempt,
                        attempts,
                        e
                    );
                    if e.taints_session() {
                        self.teardown(link).await;
                    }
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn connect_locked(&self, link: &mut Link) -> Result<(), Error> {
        if link.live.is_some() {
            return Ok(());
        }

        let result = self.handshake().await;
        match result {
            Ok(live) => {
                info!("inverter connected from {}", live.peer);
                link.live = Some(live);
                link.frame_errors = 0;
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Live, Error> {
        let c = &self.config;

        self.set_state(SessionState::Discovering);
        let (listener, port) = discovery::listen(c.local_ip(), c.local_port()).await?;
        info!(
            "listening on {}:{}, asking {} to connect back",
            c.local_ip(),
            port,
            c.host()
        );
        discovery::announce(c.host(), c.discovery_port(), c.local_ip(), port).await?;

        self.set_state(SessionState::Listening);
        let (stream, peer) = discovery::accept(&listener, c.connect_timeout()).await?;
        let stream = discovery::tune(stream, c.use_tcp_nodelay())?;

        Ok(Live {
            conn: Framed::new(stream, EnvelopeCodec),
            peer,
            rejector: Some(tokio::spawn(discovery::reject_extra(listener))),
        })
    }

    async fn teardown(&self, link: &mut Link) {
        if let Some(live) = link.live.take() {
            self.set_state(SessionState::Closing);
            info!("closing connection to {}", live.peer);
            live.close().await;
        }
        link.frame_errors = 0;
        self.set_state(SessionState::Idle);
    }
}
