use crate::inverter::Snapshot;
use crate::prelude::*;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Debug)]
pub enum ChannelData {
    Snapshot(Box<Snapshot>),
    /// Too many failed cycles in a row; the last snapshot was discarded.
    Stale,
    Shutdown,
}
pub type Sender = broadcast::Sender<ChannelData>;
pub type Receiver = broadcast::Receiver<ChannelData>;

#[derive(Default, Debug)]
pub struct PollStats {
    cycles: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    consecutive_failures: u32,
    stale_notices: u64,
    failures_by_kind: HashMap<&'static str, u64>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl PollStats {
    pub fn print_summary(&self) {
        info!("Poll Statistics:");
        info!("  Cycles: {}", self.cycles);
        info!("  Successful: {}", self.successes);
        info!("  Failed: {}", self.failures);
        info!("    Update timeouts: {}", self.timeouts);
        for (kind, count) in &self.failures_by_kind {
            info!("    {}: {}", kind, count);
        }
        info!("  Stale notices: {}", self.stale_notices);
        if let Some(at) = self.last_success {
            info!("  Last success: {}", at.to_rfc3339());
        }
        if let Some(e) = &self.last_error {
            info!("  Last error: {}", e);
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn kind(e: &Error) -> &'static str {
        match e {
            Error::Connection(_) | Error::Io(_) => "connection",
            Error::Timeout(_) => "timeout",
            Error::Frame(_) => "frame",
            Error::FieldParse { .. } => "field parse",
            Error::Model(_) => "model",
            Error::NoData => "no data",
        }
    }
}

/// Polls the inverter on a fixed interval and publishes what it gets.
#[derive(Clone)]
pub struct Coordinator {
    inverter: Inverter,
    poll: config::Poll,
    sender: Sender,
    pub stats: Arc<Mutex<PollStats>>,
    last_snapshot: Arc<Mutex<Option<Snapshot>>>,
}

impl Coordinator {
    pub fn new(poll: config::Poll, inverter: Inverter) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inverter,
            poll,
            sender,
            stats: Arc::new(Mutex::new(PollStats::default())),
            last_snapshot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> Receiver {
        self.sender.subscribe()
    }

    pub fn inverter(&self) -> &Inverter {
        &self.inverter
    }

    /// Most recent good snapshot, cleared once the data is considered stale.
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn start(&self) -> Result<()> {
        let mut receiver = self.sender.subscribe();
        let mut interval = tokio::time::interval(self.poll.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "polling {} every {:?}",
            self.inverter.model(),
            self.poll.interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self.poll_once().await;
                }
                message = receiver.recv() => match message {
                    Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                },
            }
        }

        self.inverter.disconnect().await;
        info!("coordinator stopped");

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.sender.send(ChannelData::Shutdown);
    }

    /// One bounded cycle. Failures are counted and logged, never propagated
    /// into the loop.
    pub async fn poll_once(&self) -> Result<Snapshot, Error> {
        let limit = self.poll.update_timeout();

        let result = match tokio::time::timeout(limit, self.inverter.fetch_snapshot()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        };

        match &result {
            Ok(snapshot) => self.record_success(snapshot),
            Err(e) => self.record_failure(e, limit),
        }

        result
    }

    fn record_success(&self, snapshot: &Snapshot) {
        {
            let mut stats = self.stats();
            stats.cycles += 1;
            stats.successes += 1;
            stats.consecutive_failures = 0;
            stats.last_success = Some(snapshot.taken_at);
        }

        debug!("snapshot taken at {}", snapshot.taken_at);
        *self
            .last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        let _ = self
            .sender
            .send(ChannelData::Snapshot(Box::new(snapshot.clone())));
    }

    fn record_failure(&self, e: &Error, limit: Duration) {
        let consecutive = {
            let mut stats = self.stats();
            stats.cycles += 1;
            stats.failures += 1;
            stats.consecutive_failures += 1;
            *stats.failures_by_kind.entry(PollStats::kind(e)).or_insert(0) += 1;
            if matches!(e, Error::Timeout(t) if *t == limit) {
                stats.timeouts += 1;
            }
            stats.last_error = Some(e.to_string());
            stats.consecutive_failures
        };

        error!("poll cycle failed ({} in a row): {}", consecutive, e);

        if consecutive >= self.poll.max_consecutive_failures() {
            let had_data = self
                .last_snapshot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .is_some();
            if had_data {
                warn!(
                    "{} consecutive failures, discarding last snapshot",
                    consecutive
                );
                self.stats().stale_notices += 1;
                let _ = self.sender.send(ChannelData::Stale);
            }
        }
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, PollStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
